use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use serde_json::{Value, json};
use tokio::signal::unix::{SignalKind, signal};
use uuid::Uuid;

use lodge::accounts::AccountProvisioner;
use lodge::config::{self, AppConfig, AppPaths};
use lodge::control::{self, ControlServer};
use lodge::db::Database;
use lodge::identity::{IdentityMapper, IdentityRepository};
use lodge::sessions::SessionRegistry;
use lodge::supervisor::WorkerSupervisor;
use lodge_protocol::{ControlRequest, Outcome};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Resolve(cmd) => async_resolve(ctx, cmd),
        Command::Restore => async_restore(ctx),
        Command::Call(cmd) => async_call(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "lodge - per-user accounts and workers behind a privileged supervisor.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Maximum seconds to wait for a response from `lodge serve`
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor and its control socket
    Serve(ServeCommand),
    /// Map an identity to its account name
    Resolve(ResolveCommand),
    /// Check every mapped account against the OS
    Restore,
    /// Send one request to a running supervisor
    Call(CallCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Control socket path (overrides supervisor.control_socket)
    #[arg(long, value_name = "PATH")]
    control_socket: Option<PathBuf>,
    /// Do not reconcile mapped accounts at startup
    #[arg(long)]
    skip_restore: bool,
}

#[derive(Debug, Clone, Args)]
struct ResolveCommand {
    /// External identity, e.g. an email address
    identity: String,
    /// Also create the OS account and home
    #[arg(long)]
    provision: bool,
}

#[derive(Debug, Clone, Args)]
struct CallCommand {
    /// External identity the call is made for
    identity: String,
    /// Method name, e.g. `execute_command` or `worker.status`
    method: String,
    /// Params as a JSON object
    #[arg(default_value = "{}")]
    params: String,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = config::load_or_init_config(&paths, common.dry_run)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        if ctx.common.dry_run {
            info!("dry-run: would ensure directories ({})", ctx.paths);
        } else {
            ctx.paths.ensure_directories()?;
        }
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("lodge={level},sqlx=warn")));

        if self.common.json || self.config.logging.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // The lifecycle code logs through `log`.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.config.logging.level),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        // Forwarded calls may take the worker startup plus the request itself.
        self.common.timeout.map(Duration::from_secs).unwrap_or_else(|| {
            self.config.supervisor.request_timeout() + self.config.supervisor.startup_timeout()
        })
    }

    fn print(&self, value: &Value) -> Result<()> {
        let text = if self.common.json {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        println!("{text}");
        Ok(())
    }
}

/// Database, mapper and provisioner wired from configuration.
struct Stack {
    mapper: Arc<IdentityMapper>,
    provisioner: Arc<AccountProvisioner>,
}

async fn open_stack(ctx: &RuntimeContext) -> Result<Stack> {
    let accounts = ctx.config.accounts.clone();
    let db_path = ctx.paths.database_path(&ctx.config)?;
    let db = Database::new(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let provisioner = Arc::new(AccountProvisioner::new(accounts.clone()));
    let mut mapper = IdentityMapper::new(
        IdentityRepository::new(db.pool().clone()),
        accounts.prefix.clone(),
        PathBuf::from(&accounts.home_base),
    );
    if accounts.enabled {
        mapper = mapper.with_directory(provisioner.directory());
    }
    mapper.load().await.context("loading identity mappings")?;

    Ok(Stack {
        mapper: Arc::new(mapper),
        provisioner,
    })
}

async fn restore(stack: &Stack) -> Result<Value> {
    let mappings = stack.mapper.mappings().await?;
    let report = stack.provisioner.restore_accounts(&mappings).await;
    if report.is_clean() {
        info!(
            "Accounts verified: {} ok, {} recreated",
            report.verified.len(),
            report.recreated.len()
        );
    } else {
        for (account, reason) in &report.flagged {
            warn!("Account '{}' needs attention: {}", account, reason);
        }
    }
    Ok(json!({
        "verified": report.verified,
        "recreated": report.recreated,
        "flagged": report
            .flagged
            .iter()
            .map(|(account, reason)| json!({ "account": account, "reason": reason }))
            .collect::<Vec<_>>(),
    }))
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let stack = open_stack(&ctx).await?;
    stack
        .provisioner
        .check_privileges()
        .context("account provisioning is enabled but cannot run")?;

    if cmd.skip_restore {
        info!("Skipping account reconciliation");
    } else {
        restore(&stack).await?;
    }

    let socket = match cmd.control_socket {
        Some(path) => config::expand_path(path)?,
        None => ctx.paths.control_socket(&ctx.config)?,
    };

    let supervisor = WorkerSupervisor::new(
        ctx.config.supervisor.clone(),
        ctx.config.accounts.use_sudo,
        Arc::clone(&stack.mapper),
        Arc::clone(&stack.provisioner),
    );
    let server = ControlServer::new(
        socket,
        supervisor.clone(),
        SessionRegistry::new(),
        ctx.config.sessions.clone(),
    );

    let token = server.shutdown_token();
    let mut task = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let early = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        _ = sigterm.recv() => None,
        result = &mut task => Some(result),
    };

    info!("Shutdown signal received, stopping workers...");
    token.cancel();
    supervisor.shutdown_all().await;

    let result = match early {
        Some(result) => result,
        None => task.await,
    };
    result.context("control server task failed")??;
    info!("Supervisor stopped");
    Ok(())
}

#[tokio::main]
async fn async_resolve(ctx: RuntimeContext, cmd: ResolveCommand) -> Result<()> {
    let stack = open_stack(&ctx).await?;
    let mapping = stack.mapper.resolve(&cmd.identity).await?;

    let mut value = json!(mapping);
    if cmd.provision {
        let account = stack.provisioner.ensure_account(&mapping).await?;
        value["uid"] = json!(account.uid);
        value["gid"] = json!(account.gid);
        value["isolated"] = json!(account.isolated);
    }

    if ctx.common.json {
        ctx.print(&value)
    } else {
        println!("{}", mapping.account_name);
        Ok(())
    }
}

#[tokio::main]
async fn async_restore(ctx: RuntimeContext) -> Result<()> {
    let stack = open_stack(&ctx).await?;
    stack.provisioner.check_privileges()?;
    let value = restore(&stack).await?;
    ctx.print(&value)
}

#[tokio::main]
async fn async_call(ctx: RuntimeContext, cmd: CallCommand) -> Result<()> {
    let params: Value = serde_json::from_str(&cmd.params).context("params must be JSON")?;
    let socket = ctx.paths.control_socket(&ctx.config)?;
    let request = ControlRequest {
        id: Uuid::new_v4().to_string(),
        identity: cmd.identity,
        method: cmd.method,
        params,
    };

    let response = control::send(&socket, &request, ctx.request_timeout()).await?;
    match response.outcome {
        Outcome::Result(value) => ctx.print(&value),
        Outcome::Error(message) => Err(anyhow!(message)),
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                ctx.print(&serde_json::to_value(&ctx.config)?)
            } else {
                let text = toml::to_string_pretty(&ctx.config)
                    .context("serializing configuration")?;
                print!("{text}");
                Ok(())
            }
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.paths.config_file)?;
            println!("Reset {}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}
