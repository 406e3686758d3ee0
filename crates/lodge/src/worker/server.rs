//! Socket listener and method dispatch for `lodge-worker`.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use lodge_protocol::{Request, Response, encode_line, methods};

use super::command::{self, ExecuteParams};
use super::files::{self, ReadFileParams};
use super::terminal::{ReadParams, TerminalIdParams, TerminalManager, WriteParams};
use super::workspace::{CreateParams, NameParams, WorkspaceStore};
use super::{WorkerError, WorkerResult, parse_params};

/// Largest request line accepted from the supervisor.
const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;

const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub socket: PathBuf,
    pub home: PathBuf,
    /// Terminals unused for this long are killed; zero disables reaping.
    pub terminal_idle: Duration,
}

struct ServerState {
    options: WorkerOptions,
    terminals: TerminalManager,
    workspaces: WorkspaceStore,
    shutdown: CancellationToken,
}

/// The per-account request server.
#[derive(Clone)]
pub struct WorkerServer {
    state: Arc<ServerState>,
}

impl WorkerServer {
    pub fn new(options: WorkerOptions) -> Self {
        let terminals = TerminalManager::new(options.home.clone(), options.terminal_idle);
        let workspaces = WorkspaceStore::new(&options.home);
        Self {
            state: Arc::new(ServerState {
                options,
                terminals,
                workspaces,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Cancelling this token stops the accept loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until the shutdown token fires, then clean up terminals and the socket.
    pub async fn run(&self) -> Result<()> {
        let socket = &self.state.options.socket;

        if let Some(parent) = socket.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("setting permissions on {}", parent.display()))?;
        }

        // A previous worker may have died without cleaning up.
        let _ = tokio::fs::remove_file(socket).await;

        let listener = UnixListener::bind(socket)
            .with_context(|| format!("binding to {}", socket.display()))?;
        std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("setting socket permissions on {}", socket.display()))?;

        info!("Worker listening on {}", socket.display());

        let reaper = self.spawn_reaper();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = self.state.shutdown.cancelled() => {
                    info!("Shutting down worker");
                    break;
                }
            }
        }

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        self.state.terminals.kill_all().await;
        let _ = tokio::fs::remove_file(socket).await;
        info!("Worker stopped");
        Ok(())
    }

    fn spawn_reaper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let idle = self.state.options.terminal_idle;
        if idle.is_zero() {
            return None;
        }
        let interval = (idle / 2).clamp(Duration::from_secs(1), MAX_REAP_INTERVAL);
        let state = Arc::clone(&self.state);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = state.terminals.reap_idle().await;
                if reaped > 0 {
                    info!("Reaped {} idle terminal(s)", reaped);
                }
            }
        }))
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
        let mut line = String::new();

        match reader.read_line(&mut line).await {
            Ok(0) => {
                // Readiness probes connect and hang up without a request.
                debug!("Connection closed before a request");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read request: {}", e);
                return;
            }
        }

        let response = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!("Invalid request line: {}", e);
                Response::error(recover_id(&line), format!("invalid request: {e}"))
            }
        };

        match encode_line(&response) {
            Ok(text) => {
                if let Err(e) = writer.write_all(text.as_bytes()).await {
                    debug!("Failed to write response {}: {}", response.id, e);
                }
                let _ = writer.shutdown().await;
            }
            Err(e) => error!("Failed to encode response {}: {}", response.id, e),
        }
    }

    /// Run one request and wrap its outcome in an envelope.
    pub async fn dispatch(&self, request: Request) -> Response {
        debug!("Request {} {}", request.id, request.method);
        match self.invoke(&request.method, request.params).await {
            Ok(result) => Response::result(request.id, result),
            Err(e) => {
                debug!("Request {} failed: {}", request.id, e);
                Response::error(request.id, e.to_string())
            }
        }
    }

    async fn invoke(&self, method: &str, params: Value) -> WorkerResult<Value> {
        let home = &self.state.options.home;
        let terminals = &self.state.terminals;
        let workspaces = &self.state.workspaces;

        match method {
            methods::PING => Ok(json!({
                "pong": true,
                "pid": std::process::id(),
                "home": home,
            })),
            methods::EXECUTE_COMMAND => {
                let params: ExecuteParams = parse_params(params)?;
                to_value(command::execute(home, params).await?)
            }
            methods::WRITE_TERMINAL => terminals.write(parse_params::<WriteParams>(params)?).await,
            methods::READ_TERMINAL_OUTPUT => {
                terminals.read(parse_params::<ReadParams>(params)?).await
            }
            methods::LIST_TERMINALS => Ok(terminals.list().await),
            methods::KILL_TERMINAL => {
                terminals.kill(parse_params::<TerminalIdParams>(params)?).await
            }
            methods::LIST_WORKSPACES => {
                let list = workspaces.list().await?;
                Ok(json!({ "workspaces": list }))
            }
            methods::GET_WORKSPACE => {
                let params: NameParams = parse_params(params)?;
                to_value(workspaces.get(&params.name).await?)
            }
            methods::CREATE_WORKSPACE => {
                let params: CreateParams = parse_params(params)?;
                to_value(workspaces.create(params).await?)
            }
            methods::DELETE_WORKSPACE => {
                let params: NameParams = parse_params(params)?;
                workspaces.delete(&params.name).await?;
                Ok(json!({ "name": params.name, "deleted": true }))
            }
            methods::READ_FILE => {
                let params: ReadFileParams = parse_params(params)?;
                to_value(files::read_file(home, params).await?)
            }
            other => Err(WorkerError::UnknownMethod(other.to_string())),
        }
    }
}

fn to_value<T: Serialize>(value: T) -> WorkerResult<Value> {
    serde_json::to_value(value).map_err(|e| WorkerError::Command(format!("encoding result: {e}")))
}

/// Best-effort id from a line that did not decode as a request.
fn recover_id(line: &str) -> String {
    serde_json::from_str::<Value>(line.trim())
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}
