//! State of one running worker process.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rustix::process::{Pid, Signal, kill_process};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accounts::Account;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {code}"),
            (None, Some(sig)) => {
                let name = match sig {
                    9 => "SIGKILL",
                    15 => "SIGTERM",
                    11 => "SIGSEGV",
                    6 => "SIGABRT",
                    2 => "SIGINT",
                    _ => "",
                };
                if name.is_empty() {
                    write!(f, "killed by signal {sig}")
                } else {
                    write!(f, "killed by {name} (signal {sig})")
                }
            }
            (None, None) => write!(f, "exited (unknown status)"),
        }
    }
}

/// Lifecycle state reported for a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Stopping,
}

/// Snapshot of a live worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub external_id: String,
    pub account: String,
    pub pid: u32,
    pub state: WorkerState,
    pub socket_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub requests: u64,
}

/// Shared handle to a spawned worker.
///
/// The exit monitor task owns the child process; everything else observes
/// its exit through the watch channel.
pub(crate) struct WorkerHandle {
    pub external_id: String,
    pub account: Account,
    pub pid: u32,
    pub generation: u64,
    pub socket_path: PathBuf,
    pub started_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    ready: AtomicBool,
    busy: AtomicBool,
    stopping: AtomicBool,
    requests: AtomicU64,
    exit: watch::Receiver<Option<WorkerExit>>,
    idle_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(
        external_id: String,
        account: Account,
        pid: u32,
        generation: u64,
        socket_path: PathBuf,
        exit: watch::Receiver<Option<WorkerExit>>,
    ) -> Self {
        Self {
            external_id,
            account,
            pid,
            generation,
            socket_path,
            started_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            ready: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            exit,
            idle_task: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit.clone()
    }

    pub fn set_idle_task(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.idle_task.lock()
            && let Some(previous) = slot.replace(task)
        {
            previous.abort();
        }
    }

    pub fn abort_idle_task(&self) {
        if let Ok(mut slot) = self.idle_task.lock()
            && let Some(task) = slot.take()
        {
            task.abort();
        }
    }

    pub fn info(&self) -> WorkerInfo {
        let state = if self.is_stopping() {
            WorkerState::Stopping
        } else if !self.is_ready() {
            WorkerState::Starting
        } else if self.busy.load(Ordering::SeqCst) {
            WorkerState::Busy
        } else {
            WorkerState::Ready
        };
        WorkerInfo {
            external_id: self.external_id.clone(),
            account: self.account.name.clone(),
            pid: self.pid,
            state,
            socket_path: self.socket_path.clone(),
            started_at: self.started_at,
            idle_secs: self.last_activity().elapsed().as_secs(),
            requests: self.requests.load(Ordering::SeqCst),
        }
    }

    /// Wait for the exit monitor to report the process gone.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<WorkerExit> {
        let mut rx = self.exit.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            // Sender dropped: the monitor is done, the last value stands.
            Ok(Err(_)) => *self.exit.borrow(),
            Err(_) => None,
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`.
    ///
    /// Returns the exit status, or `None` if the process could not be
    /// confirmed gone even after SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> Option<WorkerExit> {
        self.stopping.store(true, Ordering::SeqCst);

        if let Some(exit) = self.exit_status() {
            return Some(exit);
        }

        debug!("Sending SIGTERM to worker {} ({})", self.pid, self.account.name);
        if let Err(e) = send_signal(self.pid, Signal::TERM) {
            debug!("SIGTERM to {} failed: {}", self.pid, e);
        }
        if let Some(exit) = self.wait_exit(grace).await {
            return Some(exit);
        }

        warn!(
            "Worker {} ({}) ignored SIGTERM for {:?}, sending SIGKILL",
            self.pid, self.account.name, grace
        );
        if let Err(e) = send_signal(self.pid, Signal::KILL) {
            debug!("SIGKILL to {} failed: {}", self.pid, e);
        }
        let exit = self.wait_exit(grace).await;
        if exit.is_none() {
            warn!(
                "Worker {} ({}) still running after SIGKILL",
                self.pid, self.account.name
            );
        }
        exit
    }
}

pub(super) fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .and_then(Pid::from_raw)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"))?;
    kill_process(pid, signal).map_err(io::Error::from)
}
