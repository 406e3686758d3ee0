//! Local control socket served by `lodge serve`.
//!
//! Each connection carries one [`ControlRequest`] line and receives one
//! [`Response`] line. Account, session and worker-lifecycle methods are
//! answered here; any other method is forwarded to the identity's worker.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use lodge_protocol::{ControlRequest, LineBuffer, Response, encode_line};

use crate::config::SessionsConfig;
use crate::sessions::{SessionError, SessionKind, SessionRegistry};
use crate::supervisor::{MAX_RESPONSE_BYTES, SupervisorError, WorkerSupervisor};
use crate::tools::ToolContext;

pub const ACCOUNT_RESOLVE: &str = "account.resolve";
pub const SESSION_OPEN_UPLOAD: &str = "session.open_upload";
pub const SESSION_OPEN_DOWNLOAD: &str = "session.open_download";
pub const SESSION_CONSUME: &str = "session.consume";
pub const SESSION_CLOSE: &str = "session.close";
pub const SESSION_LIST: &str = "session.list";
pub const WORKER_STATUS: &str = "worker.status";
pub const WORKER_STOP: &str = "worker.stop";
pub const WORKER_LIST: &str = "worker.list";

const MAX_REQUEST_BYTES: u64 = 16 * 1024 * 1024;
const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const PURGE_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Deserialize)]
struct LinkParams {
    workspace: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    all: bool,
}

/// Failures answered on the control socket.
#[derive(Debug, thiserror::Error)]
enum ControlError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid params: {0}")]
    InvalidParams(String),
}

#[derive(Clone)]
pub struct ControlServer {
    socket: PathBuf,
    supervisor: WorkerSupervisor,
    sessions: SessionRegistry,
    ttls: SessionsConfig,
    shutdown: CancellationToken,
}

impl ControlServer {
    pub fn new(
        socket: PathBuf,
        supervisor: WorkerSupervisor,
        sessions: SessionRegistry,
        ttls: SessionsConfig,
    ) -> Self {
        Self {
            socket,
            supervisor,
            sessions,
            ttls,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Accept connections until the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        if let Some(parent) = self.socket.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }
        let _ = tokio::fs::remove_file(&self.socket).await;

        let listener = UnixListener::bind(&self.socket)
            .with_context(|| format!("binding to {}", self.socket.display()))?;
        std::fs::set_permissions(&self.socket, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("setting socket permissions on {}", self.socket.display()))?;
        info!("Control socket listening on {}", self.socket.display());

        let purge = {
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    sessions.purge_finished(PURGE_AFTER);
                }
            })
        };

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
                _ = self.shutdown.cancelled() => break,
            }
        }

        purge.abort();
        let _ = tokio::fs::remove_file(&self.socket).await;
        info!("Control socket closed");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
        let mut line = String::new();

        match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read control request: {}", e);
                return;
            }
        }

        let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::error("", format!("invalid request: {e}")),
        };

        match encode_line(&response) {
            Ok(text) => {
                let _ = writer.write_all(text.as_bytes()).await;
                let _ = writer.shutdown().await;
            }
            Err(e) => error!("Failed to encode control response: {}", e),
        }
    }

    /// Answer one control request.
    pub async fn handle(&self, request: ControlRequest) -> Response {
        debug!(
            "Control request {} '{}' for '{}'",
            request.id, request.method, request.identity
        );
        let ctx = ToolContext::new(request.identity);
        match self.invoke(&ctx, &request.method, request.params).await {
            Ok(value) => Response::result(request.id, value),
            Err(e) => {
                if let ControlError::Supervisor(ref inner) = e
                    && !matches!(inner, SupervisorError::Application(_))
                {
                    warn!(
                        "'{}' for '{}' failed ({}): {}",
                        request.method,
                        ctx.external_id,
                        inner.category(),
                        inner
                    );
                }
                Response::error(request.id, e.to_string())
            }
        }
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        method: &str,
        params: Value,
    ) -> Result<Value, ControlError> {
        match method {
            ACCOUNT_RESOLVE => {
                let account = self.supervisor.ensure_user(&ctx.external_id).await?;
                Ok(json!({
                    "external_id": ctx.external_id,
                    "account_name": account.name,
                    "uid": account.uid,
                    "gid": account.gid,
                    "home": account.home,
                    "isolated": account.isolated,
                }))
            }
            SESSION_OPEN_UPLOAD => self.open_link(ctx, SessionKind::Upload, params).await,
            SESSION_OPEN_DOWNLOAD => self.open_link(ctx, SessionKind::Download, params).await,
            SESSION_CONSUME => {
                let TokenParams { token } = parse(params)?;
                self.owned_session(ctx, &token)?;
                Ok(json!(self.sessions.consume_download(&token)?))
            }
            SESSION_CLOSE => {
                let TokenParams { token } = parse(params)?;
                self.owned_session(ctx, &token)?;
                Ok(json!(self.sessions.close(&token)?))
            }
            SESSION_LIST => {
                let ListParams { all } = parse(params)?;
                let filter = (!all).then_some(ctx.external_id.as_str());
                let mut listed = json!(self.sessions.list_active(filter));
                redact_foreign_tokens(&mut listed, &ctx.external_id);
                Ok(listed)
            }
            WORKER_STATUS => Ok(json!(self.supervisor.status(&ctx.external_id))),
            WORKER_STOP => {
                let stopped = self.supervisor.stop_worker(&ctx.external_id).await;
                Ok(json!({ "stopped": stopped }))
            }
            WORKER_LIST => Ok(json!({ "workers": self.supervisor.list_workers() })),
            other => Ok(self.supervisor.call(ctx, other, params).await?),
        }
    }

    async fn open_link(
        &self,
        ctx: &ToolContext,
        kind: SessionKind,
        params: Value,
    ) -> Result<Value, ControlError> {
        let LinkParams { workspace, path } = parse(params)?;
        let account = self.supervisor.ensure_user(&ctx.external_id).await?;
        let ttl = match kind {
            SessionKind::Upload => self.ttls.upload_ttl(),
            SessionKind::Download => self.ttls.download_ttl(),
        };
        let session = self
            .sessions
            .open(kind, ctx, &account.name, &workspace, &path, ttl);
        Ok(json!(session))
    }

    /// Sessions of other identities are reported as unknown.
    fn owned_session(&self, ctx: &ToolContext, token: &str) -> Result<(), ControlError> {
        let session = self.sessions.get(token)?;
        if session.external_id != ctx.external_id {
            return Err(SessionError::NotFound.into());
        }
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ControlError> {
    serde_json::from_value(params).map_err(|e| ControlError::InvalidParams(e.to_string()))
}

/// Send one request to a running `lodge serve` and wait for its answer.
pub async fn send(socket: &Path, request: &ControlRequest, timeout: Duration) -> Result<Response> {
    tokio::time::timeout(timeout, exchange(socket, request))
        .await
        .with_context(|| format!("no response from {} within {:?}", socket.display(), timeout))?
}

async fn exchange(socket: &Path, request: &ControlRequest) -> Result<Response> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    let line = encode_line(request).context("encoding request")?;
    stream
        .write_all(line.as_bytes())
        .await
        .context("sending request")?;

    let mut buf = LineBuffer::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut chunk).await.context("reading response")?;
        if n == 0 {
            bail!("control socket closed without a response");
        }
        buf.extend(&chunk[..n]);
        if let Some(response) = buf.next_response() {
            return Ok(response);
        }
        if buf.len() > MAX_RESPONSE_BYTES {
            bail!("control response exceeds {} bytes", MAX_RESPONSE_BYTES);
        }
    }
}

/// Tokens are credentials; only their owner gets to see them.
fn redact_foreign_tokens(listed: &mut Value, external_id: &str) {
    let Some(sessions) = listed.get_mut("sessions").and_then(Value::as_array_mut) else {
        return;
    };
    for session in sessions {
        if session["external_id"] != external_id
            && let Some(fields) = session.as_object_mut()
        {
            fields.remove("token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lodge_protocol::Outcome;

    use crate::accounts::AccountProvisioner;
    use crate::config::{AccountsConfig, SupervisorConfig};
    use crate::db::Database;
    use crate::identity::{IdentityMapper, IdentityRepository};

    async fn server(home_base: &Path) -> ControlServer {
        let db = Database::in_memory().await.unwrap();
        let accounts = AccountsConfig {
            enabled: false,
            home_base: home_base.display().to_string(),
            ..AccountsConfig::default()
        };
        let mapper = Arc::new(IdentityMapper::new(
            IdentityRepository::new(db.pool().clone()),
            accounts.prefix.clone(),
            home_base.to_path_buf(),
        ));
        let provisioner = Arc::new(AccountProvisioner::new(accounts));
        let supervisor =
            WorkerSupervisor::new(SupervisorConfig::default(), false, mapper, provisioner);
        ControlServer::new(
            home_base.join("control.sock"),
            supervisor,
            SessionRegistry::new(),
            SessionsConfig::default(),
        )
    }

    fn request(identity: &str, method: &str, params: Value) -> ControlRequest {
        ControlRequest {
            id: "1".into(),
            identity: identity.into(),
            method: method.into(),
            params,
        }
    }

    fn result(response: Response) -> Value {
        match response.outcome {
            Outcome::Result(value) => value,
            Outcome::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_account_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let value = result(
            server
                .handle(request("pascal.garber@correctiv.org", ACCOUNT_RESOLVE, json!({})))
                .await,
        );
        assert_eq!(value["account_name"], json!("lc_pascal_garber"));
        assert_eq!(value["isolated"], json!(false));
        assert!(dir.path().join("lc_pascal_garber").is_dir());
    }

    #[tokio::test]
    async fn test_download_link_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let opened = result(
            server
                .handle(request(
                    "a@example.org",
                    SESSION_OPEN_DOWNLOAD,
                    json!({"workspace": "site", "path": "dist/app.tar"}),
                ))
                .await,
        );
        let token = opened["token"].as_str().unwrap().to_string();
        assert_eq!(opened["account_name"], json!("lc_a"));

        let consumed = result(
            server
                .handle(request("a@example.org", SESSION_CONSUME, json!({"token": token})))
                .await,
        );
        assert_eq!(consumed["status"], json!("consumed"));

        let again = server
            .handle(request("a@example.org", SESSION_CONSUME, json!({"token": token})))
            .await;
        assert!(again.is_error());
    }

    #[tokio::test]
    async fn test_foreign_token_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let opened = result(
            server
                .handle(request(
                    "a@example.org",
                    SESSION_OPEN_UPLOAD,
                    json!({"workspace": "w", "path": "in"}),
                ))
                .await,
        );
        let token = opened["token"].as_str().unwrap();

        let resp = server
            .handle(request("b@example.org", SESSION_CLOSE, json!({"token": token})))
            .await;
        assert_eq!(resp.into_result(), Err("unknown session token".to_string()));
    }

    #[tokio::test]
    async fn test_session_list_warns_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        for path in ["a", "b"] {
            server
                .handle(request(
                    "a@example.org",
                    SESSION_OPEN_UPLOAD,
                    json!({"workspace": "w", "path": path}),
                ))
                .await;
        }
        let listed = result(
            server
                .handle(request("a@example.org", SESSION_LIST, json!({})))
                .await,
        );
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 2);
        assert_eq!(listed["warnings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_session_list_all_hides_foreign_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        for identity in ["a@example.org", "b@example.org"] {
            server
                .handle(request(
                    identity,
                    SESSION_OPEN_UPLOAD,
                    json!({"workspace": "w", "path": "in"}),
                ))
                .await;
        }

        let listed = result(
            server
                .handle(request("a@example.org", SESSION_LIST, json!({"all": true})))
                .await,
        );
        let sessions = listed["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 2);
        for session in sessions {
            if session["external_id"] == "a@example.org" {
                assert!(session["token"].is_string());
            } else {
                assert!(session.get("token").is_none(), "{session}");
                assert_eq!(session["account_name"], json!("lc_b"));
            }
        }
    }

    #[tokio::test]
    async fn test_worker_methods_without_workers() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        assert_eq!(
            result(server.handle(request("a@example.org", WORKER_STATUS, json!({}))).await),
            Value::Null
        );
        assert_eq!(
            result(server.handle(request("a@example.org", WORKER_STOP, json!({}))).await),
            json!({"stopped": false})
        );
        assert_eq!(
            result(server.handle(request("", WORKER_LIST, json!({}))).await),
            json!({"workers": []})
        );
    }

    #[tokio::test]
    async fn test_bad_params() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let resp = server
            .handle(request("a@example.org", SESSION_OPEN_UPLOAD, json!({"path": 1})))
            .await;
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn test_send_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path()).await;
        let socket = dir.path().join("control.sock");
        let token = server.shutdown_token();
        let task = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let mut response = None;
        for _ in 0..100 {
            if let Ok(resp) = send(
                &socket,
                &request("a@example.org", WORKER_LIST, json!({})),
                Duration::from_secs(5),
            )
            .await
            {
                response = Some(resp);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(response.unwrap().id, "1");

        token.cancel();
        task.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
