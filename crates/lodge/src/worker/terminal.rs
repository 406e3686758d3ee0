//! Long-lived shells driven through pipes.
//!
//! A terminal is a `sh` process whose stdin receives `write_terminal` input
//! and whose stdout and stderr are collected into one capped buffer. Reads
//! are addressed by absolute byte offset so a caller can poll for new output.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use super::{WorkerError, WorkerResult};

/// Bytes of output retained per terminal; older bytes are dropped.
pub const DEFAULT_OUTPUT_CAP: usize = 256 * 1024;

const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    #[serde(default)]
    pub terminal_id: Option<String>,
    pub input: String,
    /// Starting directory for a new terminal, relative to the home.
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadParams {
    pub terminal_id: String,
    #[serde(default)]
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct TerminalIdParams {
    pub terminal_id: String,
}

/// Output of one terminal, trimmed from the front once over capacity.
#[derive(Debug)]
struct OutputBuffer {
    data: VecDeque<u8>,
    /// Absolute offset of `data[0]`.
    start: u64,
    cap: usize,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: VecDeque::new(),
            start: 0,
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.data.extend(chunk);
        let excess = self.data.len().saturating_sub(self.cap);
        if excess > 0 {
            self.data.drain(..excess);
            self.start += excess as u64;
        }
    }

    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Bytes from `offset` on, plus whether some of them were already dropped.
    fn read_from(&self, offset: u64) -> (Vec<u8>, bool) {
        let dropped = offset < self.start;
        let from = offset.max(self.start).min(self.end());
        let skip = (from - self.start) as usize;
        (self.data.iter().skip(skip).copied().collect(), dropped)
    }
}

#[derive(Serialize)]
struct TerminalSummary {
    terminal_id: String,
    pid: Option<u32>,
    running: bool,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    idle_secs: u64,
}

struct Terminal {
    id: String,
    pid: Option<u32>,
    created_at: DateTime<Utc>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Arc<std::sync::Mutex<OutputBuffer>>,
    last_used: std::sync::Mutex<Instant>,
    /// `Some(code)` once the shell has exited; the code itself may be unknown.
    exit: watch::Receiver<Option<Option<i32>>>,
    cancel: CancellationToken,
}

impl Terminal {
    fn touch(&self) {
        if let Ok(mut last) = self.last_used.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit.borrow()
    }

    fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }

    fn summary(&self) -> TerminalSummary {
        TerminalSummary {
            terminal_id: self.id.clone(),
            pid: self.pid,
            running: self.is_running(),
            exit_code: self.exit_code().flatten(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }

    async fn kill(&self) {
        self.cancel.cancel();
        let mut rx = self.exit.clone();
        if tokio::time::timeout(KILL_WAIT, rx.wait_for(Option::is_some))
            .await
            .is_err()
        {
            warn!("Terminal {} did not exit after kill", self.id);
        }
    }
}

/// Terminals of one worker.
pub struct TerminalManager {
    home: PathBuf,
    output_cap: usize,
    idle_timeout: Duration,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

impl TerminalManager {
    pub fn new(home: PathBuf, idle_timeout: Duration) -> Self {
        Self::with_output_cap(home, idle_timeout, DEFAULT_OUTPUT_CAP)
    }

    pub fn with_output_cap(home: PathBuf, idle_timeout: Duration, output_cap: usize) -> Self {
        Self {
            home,
            output_cap,
            idle_timeout,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    /// Send input to a terminal, starting a new one when no id is given.
    pub async fn write(&self, params: WriteParams) -> WorkerResult<Value> {
        let terminal = match params.terminal_id {
            Some(ref id) => self.get(id).await?,
            None => self.spawn(params.cwd.as_deref()).await?,
        };

        if !terminal.is_running() {
            return Err(WorkerError::Conflict(format!(
                "terminal {} has exited",
                terminal.id
            )));
        }

        let mut stdin = terminal.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(WorkerError::Conflict(format!(
                "terminal {} input is closed",
                terminal.id
            )));
        };
        pipe.write_all(params.input.as_bytes()).await?;
        pipe.flush().await?;
        terminal.touch();

        Ok(json!({
            "terminal_id": terminal.id,
            "bytes_written": params.input.len(),
        }))
    }

    /// Output from `offset` (default 0) to the current end.
    pub async fn read(&self, params: ReadParams) -> WorkerResult<Value> {
        let terminal = self.get(&params.terminal_id).await?;
        terminal.touch();

        let (bytes, dropped, end) = {
            let output = terminal
                .output
                .lock()
                .map_err(|_| WorkerError::Command("terminal output lock poisoned".into()))?;
            let (bytes, dropped) = output.read_from(params.offset.unwrap_or(0));
            (bytes, dropped, output.end())
        };

        Ok(json!({
            "terminal_id": terminal.id,
            "output": String::from_utf8_lossy(&bytes),
            "offset": end,
            "truncated": dropped,
            "running": terminal.is_running(),
            "exit_code": terminal.exit_code().flatten(),
        }))
    }

    pub async fn list(&self) -> Value {
        let terminals = self.terminals.lock().await;
        let mut summaries: Vec<TerminalSummary> =
            terminals.values().map(|terminal| terminal.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        json!({ "terminals": summaries })
    }

    pub async fn kill(&self, params: TerminalIdParams) -> WorkerResult<Value> {
        let terminal = self
            .terminals
            .lock()
            .await
            .remove(&params.terminal_id)
            .ok_or_else(|| not_found(&params.terminal_id))?;
        terminal.kill().await;
        info!("Killed terminal {}", terminal.id);
        Ok(json!({
            "terminal_id": terminal.id,
            "killed": true,
            "exit_code": terminal.exit_code().flatten(),
        }))
    }

    /// Kill terminals unused for longer than the idle timeout.
    pub async fn reap_idle(&self) -> usize {
        let stale: Vec<Arc<Terminal>> = {
            let mut terminals = self.terminals.lock().await;
            let ids: Vec<String> = terminals
                .values()
                .filter(|terminal| terminal.idle_for() >= self.idle_timeout)
                .map(|terminal| terminal.id.clone())
                .collect();
            ids.iter().filter_map(|id| terminals.remove(id)).collect()
        };

        for terminal in &stale {
            debug!("Reaping idle terminal {}", terminal.id);
            terminal.kill().await;
        }
        stale.len()
    }

    pub async fn kill_all(&self) {
        let all: Vec<Arc<Terminal>> = self.terminals.lock().await.drain().map(|(_, t)| t).collect();
        futures::future::join_all(all.iter().map(|terminal| terminal.kill())).await;
    }

    pub async fn len(&self) -> usize {
        self.terminals.lock().await.len()
    }

    async fn get(&self, id: &str) -> WorkerResult<Arc<Terminal>> {
        self.terminals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn spawn(&self, cwd: Option<&str>) -> WorkerResult<Arc<Terminal>> {
        let dir = match cwd {
            Some(dir) if !dir.is_empty() => self.home.join(dir),
            _ => self.home.clone(),
        };

        let mut child = Command::new("sh")
            .current_dir(&dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Command(format!("failed to start terminal: {e}")))?;

        let id = nanoid::nanoid!(10);
        let pid = child.id();
        let output = Arc::new(std::sync::Mutex::new(OutputBuffer::new(self.output_cap)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, Arc::clone(&output)));
        }
        let stdin = child.stdin.take();

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let wait_cancel = cancel.clone();
        let wait_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = wait_cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            debug!("Terminal {} exited ({:?})", wait_id, code);
            let _ = exit_tx.send(Some(code));
        });

        let terminal = Arc::new(Terminal {
            id: id.clone(),
            pid,
            created_at: Utc::now(),
            stdin: Mutex::new(stdin),
            output,
            last_used: std::sync::Mutex::new(Instant::now()),
            exit: exit_rx,
            cancel,
        });
        self.terminals.lock().await.insert(id.clone(), Arc::clone(&terminal));
        info!("Started terminal {} (pid {:?}) in {}", id, pid, dir.display());
        Ok(terminal)
    }
}

fn not_found(id: &str) -> WorkerError {
    WorkerError::NotFound(format!("terminal not found: {id}"))
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, output: Arc<std::sync::Mutex<OutputBuffer>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut buffer) = output.lock() {
                    buffer.push(&chunk[..n]);
                }
            }
            Err(e) => {
                debug!("Terminal pipe read failed: {}", e);
                break;
            }
        }
    }
}
