//! Configuration loading.
//!
//! Layering, lowest to highest precedence:
//!
//! 1. Built-in defaults ([`AppConfig::default`]).
//! 2. `$XDG_CONFIG_HOME/lodge/config.toml` (written with defaults on first run).
//! 3. `LODGE__<SECTION>__<KEY>` environment variables.
//! 4. Shorthand overrides: `LODGE_IDLE_TIMEOUT_SECS`, `LODGE_LOG`, `LODGE_HOME_BASE`.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "lodge";

/// Environment variable read by workers for their log level.
pub const WORKER_LOG_ENV: &str = "LODGE_LOG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub accounts: AccountsConfig,
    pub supervisor: SupervisorConfig,
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither CLI flags nor RUST_LOG say otherwise.
    pub level: String,
    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding identity mappings. Defaults to `<data_dir>/lodge.db`.
    pub path: Option<String>,
}

/// OS account provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Create real OS accounts (requires root or passwordless sudo for the
    /// account helpers). When false every worker runs as the current user.
    pub enabled: bool,
    /// Namespace tag prepended to every derived account name.
    pub prefix: String,
    /// First UID handed out to managed accounts.
    pub uid_start: u32,
    /// Primary group shared by all managed accounts.
    pub group: String,
    /// Supplementary groups, e.g. one granting access to shared tool binaries.
    pub extra_groups: Vec<String>,
    /// Login shell for new accounts.
    pub shell: String,
    /// Parent directory of account homes.
    pub home_base: String,
    /// Run account helpers through `sudo -n` when not root.
    pub use_sudo: bool,
    /// Recreate accounts that are mapped but missing at startup. When false
    /// they are only reported.
    pub recreate_missing: bool,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: "lc_".to_string(),
            uid_start: 2000,
            group: "lodge".to_string(),
            extra_groups: Vec::new(),
            shell: "/bin/bash".to_string(),
            home_base: "/home".to_string(),
            use_sudo: true,
            recreate_missing: true,
        }
    }
}

/// Worker lifecycle knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker executable. Bare names are looked up on the supervisor's PATH.
    pub worker_binary: String,
    /// Arguments inserted before `--socket <path> --home <dir>`.
    pub worker_args: Vec<String>,
    /// Namespace directory inside each home; the socket is `<home>/.<namespace>/socket`.
    pub namespace: String,
    /// Stop a worker after this long without requests; 0 disables eviction.
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub startup_timeout_ms: u64,
    pub startup_poll_ms: u64,
    pub grace_period_secs: u64,
    /// PATH handed to workers.
    pub worker_path: String,
    /// LANG handed to workers.
    pub worker_lang: String,
    /// Log level handed to workers through `LODGE_LOG`.
    pub worker_log_level: String,
    /// Supervisor environment variables copied into the worker environment.
    /// Nothing else is inherited.
    pub env_passthrough: Vec<String>,
    /// Control socket for `lodge serve`. Defaults to `<state_dir>/control.sock`.
    pub control_socket: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_binary: "lodge-worker".to_string(),
            worker_args: Vec::new(),
            namespace: "lodge".to_string(),
            idle_timeout_secs: 30 * 60,
            request_timeout_secs: 60,
            startup_timeout_ms: 10_000,
            startup_poll_ms: 100,
            grace_period_secs: 5,
            worker_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            worker_lang: "C.UTF-8".to_string(),
            worker_log_level: "info".to_string(),
            env_passthrough: Vec::new(),
            control_socket: None,
        }
    }
}

impl SupervisorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Socket path for a worker living in `home`.
    pub fn socket_path(&self, home: &Path) -> PathBuf {
        home.join(format!(".{}", self.namespace)).join("socket")
    }
}

/// Upload/download link lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub upload_ttl_secs: u64,
    pub download_ttl_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            upload_ttl_secs: 15 * 60,
            download_ttl_secs: 5 * 60,
        }
    }
}

impl SessionsConfig {
    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn download_ttl(&self) -> Duration {
        Duration::from_secs(self.download_ttl_secs)
    }
}

/// Resolved filesystem locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(config_override: Option<PathBuf>) -> Result<Self> {
        let config_file = match config_override {
            Some(path) => expand_path(path)?,
            None => default_config_dir()?.join("config.toml"),
        };
        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
            state_dir: default_state_dir()?,
        })
    }

    pub fn database_path(&self, config: &AppConfig) -> Result<PathBuf> {
        match config.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.data_dir.join("lodge.db")),
        }
    }

    pub fn control_socket(&self, config: &AppConfig) -> Result<PathBuf> {
        match config.supervisor.control_socket {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.state_dir.join("control.sock")),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("creating data directory {}", self.data_dir.display())
        })?;
        fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("creating state directory {}", self.state_dir.display())
        })?;
        Ok(())
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

/// Load configuration, writing a default file first if none exists.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }
    load_config(&paths.config_file)
}

/// Load configuration from `path` (optional) plus the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .set_override_option(
            "supervisor.idle_timeout_secs",
            env::var("LODGE_IDLE_TIMEOUT_SECS").ok(),
        )?
        .set_override_option("supervisor.worker_log_level", env::var(WORKER_LOG_ENV).ok())?
        .set_override_option("accounts.home_base", env::var("LODGE_HOME_BASE").ok())?
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut config: AppConfig = built.try_deserialize().context("invalid configuration")?;
    config.accounts.home_base = expand_str_path(&config.accounts.home_base)?
        .display()
        .to_string();
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(!config.accounts.enabled);
        assert_eq!(config.accounts.prefix, "lc_");
        assert_eq!(config.supervisor.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.supervisor.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.supervisor.startup_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.startup_poll(), Duration::from_millis(100));
        assert_eq!(config.supervisor.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_socket_path_uses_namespace_dir() {
        let config = SupervisorConfig::default();
        assert_eq!(
            config.socket_path(Path::new("/home/lc_alice")),
            PathBuf::from("/home/lc_alice/.lodge/socket")
        );
    }

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default_config(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for lodge"));

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.accounts.group, "lodge");
        assert_eq!(loaded.sessions.download_ttl_secs, 300);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[supervisor]\nrequest_timeout_secs = 5\nnamespace = \"ws\"\n\n[accounts]\nprefix = \"ws_\"\n",
        )
        .unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.supervisor.request_timeout_secs, 5);
        assert_eq!(loaded.supervisor.namespace, "ws");
        assert_eq!(loaded.accounts.prefix, "ws_");
        assert_eq!(loaded.supervisor.grace_period_secs, 5);
    }
}
