//! Worker supervisor.
//!
//! Owns one worker process per identity and is the only component that talks
//! to workers. Per identity the lifecycle is:
//!
//! ```text
//! ABSENT -> STARTING -> READY <-> BUSY
//!                         |
//!                         +-> IDLE-TERMINATING -> ABSENT
//! any state -- unexpected exit --> ABSENT
//! ```
//!
//! Requests and startup for one identity go through that identity's lane, an
//! async mutex, so the worker sees one connection at a time in issue order.
//! Different identities never share a lane.
//!
//! The worker table is only mutated when a worker is spawned (insert) and by
//! the worker's exit monitor (remove). The monitor owns the child process; it
//! cancels the idle timer, deletes the socket file and drops the table entry
//! before publishing the exit to anyone waiting on it.

mod client;
mod error;
mod spawn;
mod worker;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, info, warn};
use rustix::process::Signal;
use lodge_protocol::{Outcome, Request};
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, watch};
use uuid::Uuid;

use crate::accounts::{Account, AccountProvisioner};
use crate::config::SupervisorConfig;
use crate::identity::IdentityMapper;
use crate::tools::ToolContext;

pub use client::{MAX_RESPONSE_BYTES, WorkerClient};
pub use error::{CommunicationError, SupervisorError, SupervisorResult};
pub use spawn::{LaunchMode, worker_args, worker_env};
pub use worker::{WorkerExit, WorkerInfo, WorkerState};

use worker::WorkerHandle;

/// Spawns, talks to, and retires per-identity workers.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    use_sudo: bool,
    mapper: Arc<IdentityMapper>,
    provisioner: Arc<AccountProvisioner>,
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
    lanes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<WorkerHandle>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self, external_id: &str) -> Option<Arc<WorkerHandle>> {
        self.table().get(external_id).cloned()
    }

    fn lane(&self, external_id: &str) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(external_id.to_string()).or_default())
    }

    /// Drop lanes that no caller holds or waits on.
    ///
    /// New lane handles are only cloned out under the same lock, so a lane
    /// whose map entry is the last reference cannot be in use.
    fn prune_lanes(&self) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
    }

    /// Drop the table entry if it still belongs to `worker`.
    fn forget(&self, worker: &WorkerHandle) {
        let mut table = self.table();
        if table
            .get(&worker.external_id)
            .is_some_and(|current| current.generation == worker.generation)
        {
            table.remove(&worker.external_id);
        }
    }
}

impl WorkerSupervisor {
    /// `use_sudo` selects `sudo -n -u` for account switching when the
    /// supervisor is not root.
    pub fn new(
        config: SupervisorConfig,
        use_sudo: bool,
        mapper: Arc<IdentityMapper>,
        provisioner: Arc<AccountProvisioner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                use_sudo,
                mapper,
                provisioner,
                workers: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn mapper(&self) -> &Arc<IdentityMapper> {
        &self.inner.mapper
    }

    pub fn provisioner(&self) -> &Arc<AccountProvisioner> {
        &self.inner.provisioner
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolve the identity and make sure its OS account exists.
    pub async fn ensure_user(&self, external_id: &str) -> SupervisorResult<Account> {
        let mapping = self.inner.mapper.resolve(external_id).await?;
        let account = self.inner.provisioner.ensure_account(&mapping).await?;
        Ok(account)
    }

    /// Forward `method` to the worker of `ctx.external_id`, starting the
    /// worker if needed.
    ///
    /// Requests for one identity are delivered one at a time, in call order.
    /// A request that times out is abandoned by the supervisor but may still
    /// complete inside the worker: delivery is at least once attempted, not
    /// exactly once.
    pub async fn call(
        &self,
        ctx: &ToolContext,
        method: &str,
        params: Value,
    ) -> SupervisorResult<Value> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let external_id = ctx.external_id.as_str();
        let lane = self.inner.lane(external_id);
        let _turn = lane.lock().await;

        let worker = self.ensure_worker(external_id).await?;
        let request = Request::new(Uuid::new_v4().to_string(), method, params);
        debug!(
            "Request {} '{}' -> worker {} ({})",
            request.id, method, worker.pid, worker.account.name
        );

        worker.set_busy(true);
        let result = WorkerClient::new(&worker.socket_path)
            .request(&request, self.inner.config.request_timeout())
            .await;
        worker.set_busy(false);

        match result {
            Ok(response) => {
                worker.touch();
                match response.outcome {
                    Outcome::Result(value) => Ok(value),
                    Outcome::Error(message) => Err(SupervisorError::Application(message)),
                }
            }
            Err(source) => {
                warn!(
                    "Request '{}' to worker {} ({}) failed: {}",
                    method, worker.pid, worker.account.name, source
                );
                Err(SupervisorError::Communication {
                    account: worker.account.name.clone(),
                    source,
                })
            }
        }
    }

    /// Snapshot of the identity's worker, if one is running.
    pub fn status(&self, external_id: &str) -> Option<WorkerInfo> {
        self.inner.current(external_id).map(|worker| worker.info())
    }

    /// Number of identities with a request lane. Lanes are dropped again
    /// when a worker exits and nothing is queued for its identity.
    pub fn lane_count(&self) -> usize {
        self.inner
            .lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .inner
            .table()
            .values()
            .map(|worker| worker.info())
            .collect();
        infos.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        infos
    }

    /// Stop the identity's worker (SIGTERM, then SIGKILL after the grace
    /// period). Returns false when no worker was running.
    pub async fn stop_worker(&self, external_id: &str) -> bool {
        let Some(worker) = self.inner.current(external_id) else {
            return false;
        };
        info!("Stopping worker for '{}' (pid {})", external_id, worker.pid);
        worker.terminate(self.inner.config.grace_period()).await;
        true
    }

    /// Stop every worker concurrently and wait for all of them.
    ///
    /// No new workers are started once this has been called.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let workers: Vec<Arc<WorkerHandle>> = self.inner.table().values().cloned().collect();
        if workers.is_empty() {
            return;
        }

        info!("Stopping {} workers", workers.len());
        let grace = self.inner.config.grace_period();
        let exits = join_all(workers.iter().map(|worker| worker.terminate(grace))).await;

        let stuck = exits.iter().filter(|exit| exit.is_none()).count();
        if stuck > 0 {
            warn!("{} workers could not be confirmed stopped", stuck);
        } else {
            info!("All workers stopped");
        }
    }

    /// Return a ready worker for `external_id`. Caller holds the lane.
    async fn ensure_worker(&self, external_id: &str) -> SupervisorResult<Arc<WorkerHandle>> {
        if let Some(worker) = self.inner.current(external_id) {
            if worker.is_stopping() {
                // Stopped outside the lane (operator stop); let it finish.
                let grace = self.inner.config.grace_period();
                if worker.wait_exit(grace.saturating_mul(2)).await.is_none() {
                    return Err(SupervisorError::Spawn {
                        account: worker.account.name.clone(),
                        reason: "previous worker is still stopping".to_string(),
                    });
                }
            } else if worker.is_ready() {
                return Ok(worker);
            } else {
                // An earlier attempt timed out waiting for readiness; the
                // process was left running, so poll it again.
                self.await_ready(&worker).await?;
                worker.mark_ready();
                info!(
                    "Worker for '{}' became ready late (pid {})",
                    external_id, worker.pid
                );
                return Ok(worker);
            }
        }

        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        let account = self.ensure_user(external_id).await?;
        let worker = self.spawn_worker(external_id, account).await?;
        self.await_ready(&worker).await?;
        worker.mark_ready();
        info!(
            "Worker for '{}' ready (pid {}, account {})",
            external_id, worker.pid, worker.account.name
        );
        Ok(worker)
    }

    async fn spawn_worker(
        &self,
        external_id: &str,
        account: Account,
    ) -> SupervisorResult<Arc<WorkerHandle>> {
        let config = &self.inner.config;
        let socket = config.socket_path(&account.home);

        if socket.exists() {
            warn!("Removing stale socket {}", socket.display());
            remove_socket_file(&socket).await;
        }

        let mode = LaunchMode::select(&account, self.inner.use_sudo).map_err(|reason| {
            SupervisorError::Spawn {
                account: account.name.clone(),
                reason,
            }
        })?;

        let mut cmd = spawn::worker_command(config, &account, &socket, mode);
        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            account: account.name.clone(),
            reason: format!("{}: {}", config.worker_binary, e),
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                account: account.name.clone(),
                reason: "process exited immediately".to_string(),
            });
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = watch::channel(None);
        let worker = Arc::new(WorkerHandle::new(
            external_id.to_string(),
            account,
            pid,
            generation,
            socket,
            exit_rx,
        ));

        // shutdown_all sets the flag before it copies the table, so checking
        // under the table lock means every inserted worker gets stopped.
        let refused = {
            let mut table = self.inner.table();
            if self.is_shutting_down() {
                true
            } else {
                table.insert(external_id.to_string(), Arc::clone(&worker));
                false
            }
        };
        if refused {
            info!(
                "Shutdown began while starting worker for '{}', stopping pid {}",
                external_id, pid
            );
            discard_child(child, pid, &worker.socket_path, config.grace_period()).await;
            return Err(SupervisorError::ShuttingDown);
        }

        if !config.idle_timeout().is_zero() {
            let idle = tokio::spawn(idle_watch(Arc::clone(&self.inner), Arc::clone(&worker)));
            worker.set_idle_task(idle);
        }
        tokio::spawn(monitor_exit(
            Arc::clone(&self.inner),
            Arc::clone(&worker),
            child,
            exit_tx,
        ));

        info!(
            "Spawned worker for '{}' as '{}' (pid {}, {:?})",
            external_id, worker.account.name, pid, mode
        );
        Ok(worker)
    }

    /// Poll until the worker's socket accepts a connection.
    async fn await_ready(&self, worker: &WorkerHandle) -> SupervisorResult<()> {
        let config = &self.inner.config;
        let timeout = config.startup_timeout();
        let poll = config.startup_poll();
        let started = Instant::now();
        let client = WorkerClient::new(&worker.socket_path);
        let mut exit_rx = worker.exit_receiver();

        loop {
            let exited = *exit_rx.borrow();
            if let Some(exit) = exited {
                return Err(SupervisorError::Spawn {
                    account: worker.account.name.clone(),
                    reason: format!("worker {exit} during startup"),
                });
            }

            if client.probe().await {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    "Worker {} ({}) not accepting on {} after {:?}",
                    worker.pid,
                    worker.account.name,
                    worker.socket_path.display(),
                    timeout
                );
                return Err(SupervisorError::ReadinessTimeout {
                    account: worker.account.name.clone(),
                    timeout,
                });
            }

            let monitor_gone = tokio::select! {
                _ = tokio::time::sleep(poll.min(timeout - elapsed)) => false,
                changed = exit_rx.changed() => changed.is_err(),
            };
            if monitor_gone && exit_rx.borrow().is_none() {
                return Err(SupervisorError::Spawn {
                    account: worker.account.name.clone(),
                    reason: "worker monitor stopped".to_string(),
                });
            }
        }
    }
}

/// Waits for the child to exit and performs the only table cleanup.
async fn monitor_exit(
    inner: Arc<Inner>,
    worker: Arc<WorkerHandle>,
    mut child: Child,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let exit = match child.wait().await {
        Ok(status) => WorkerExit::from(status),
        Err(e) => {
            warn!("Error waiting for worker {}: {}", worker.pid, e);
            WorkerExit::unknown()
        }
    };

    worker.abort_idle_task();
    remove_socket_file(&worker.socket_path).await;
    inner.forget(&worker);
    inner.prune_lanes();

    if worker.is_stopping() {
        info!(
            "Worker for '{}' (pid {}) stopped: {}",
            worker.external_id, worker.pid, exit
        );
    } else {
        warn!(
            "Worker for '{}' (pid {}) {} unexpectedly",
            worker.external_id, worker.pid, exit
        );
    }

    let _ = exit_tx.send(Some(exit));
}

/// Stops the worker once it has been idle for the configured window.
async fn idle_watch(inner: Arc<Inner>, worker: Arc<WorkerHandle>) {
    let idle = inner.config.idle_timeout();

    loop {
        let Some(due) = worker.last_activity().checked_add(idle) else {
            debug!(
                "Idle timeout {:?} out of range, worker for '{}' is never evicted",
                idle, worker.external_id
            );
            return;
        };
        tokio::time::sleep_until(due.into()).await;

        if worker.has_exited() || worker.is_stopping() {
            return;
        }
        if worker.last_activity().elapsed() < idle {
            continue;
        }

        // In-flight requests hold the lane; eviction waits for them.
        let lane = inner.lane(&worker.external_id);
        let _turn = lane.lock().await;

        if worker.has_exited() {
            return;
        }
        if worker.last_activity().elapsed() < idle {
            continue;
        }

        info!(
            "Worker for '{}' (pid {}) idle for {:?}, stopping",
            worker.external_id, worker.pid, idle
        );
        worker.terminate(inner.config.grace_period()).await;
        return;
    }
}

/// Stop a child that never made it into the worker table.
async fn discard_child(mut child: Child, pid: u32, socket: &Path, grace: Duration) {
    if let Err(e) = worker::send_signal(pid, Signal::TERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Worker {} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
        if let Err(e) = child.kill().await {
            warn!("Failed to kill worker {}: {}", pid, e);
        }
    }
    remove_socket_file(socket).await;
}

async fn remove_socket_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
    }
}
