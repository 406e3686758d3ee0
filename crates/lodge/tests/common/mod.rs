//! Shared setup for supervisor integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lodge::accounts::AccountProvisioner;
use lodge::config::{AccountsConfig, SupervisorConfig};
use lodge::db::Database;
use lodge::identity::{IdentityMapper, IdentityRepository};
use lodge::supervisor::WorkerSupervisor;
use lodge::tools::ToolContext;
use tempfile::TempDir;

/// The real worker binary built alongside these tests.
pub const WORKER_BIN: &str = env!("CARGO_BIN_EXE_lodge-worker");

/// Supervisor running workers as the current user with homes in a tempdir.
pub struct Harness {
    pub supervisor: WorkerSupervisor,
    pub home_base: TempDir,
}

impl Harness {
    pub async fn new(config: SupervisorConfig) -> Self {
        let home_base = tempfile::tempdir().expect("tempdir");
        let db = Database::in_memory().await.expect("in-memory database");

        let accounts = AccountsConfig {
            enabled: false,
            home_base: home_base.path().display().to_string(),
            ..AccountsConfig::default()
        };
        let mapper = Arc::new(IdentityMapper::new(
            IdentityRepository::new(db.pool().clone()),
            accounts.prefix.clone(),
            home_base.path().to_path_buf(),
        ));
        let provisioner = Arc::new(AccountProvisioner::new(accounts));
        let supervisor = WorkerSupervisor::new(config, false, mapper, provisioner);

        Self {
            supervisor,
            home_base,
        }
    }

    /// Harness using the real `lodge-worker`.
    pub async fn with_worker(tweak: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let mut config = worker_config();
        tweak(&mut config);
        Self::new(config).await
    }

    /// Harness whose "worker" is `/bin/sh -c <script>`.
    ///
    /// The script sees `--socket <path> --home <dir>` as `$1`..`$4`.
    pub async fn with_script(script: &str, tweak: impl FnOnce(&mut SupervisorConfig)) -> Self {
        let mut config = worker_config();
        config.worker_binary = "/bin/sh".to_string();
        config.worker_args = vec![
            "-c".to_string(),
            script.to_string(),
            "lodge-stub".to_string(),
        ];
        tweak(&mut config);
        Self::new(config).await
    }

    pub fn home_of(&self, account: &str) -> PathBuf {
        self.home_base.path().join(account)
    }

    pub fn socket_of(&self, account: &str) -> PathBuf {
        self.supervisor.config().socket_path(&self.home_of(account))
    }
}

pub fn worker_config() -> SupervisorConfig {
    SupervisorConfig {
        worker_binary: WORKER_BIN.to_string(),
        idle_timeout_secs: 0,
        request_timeout_secs: 10,
        startup_timeout_ms: 5_000,
        startup_poll_ms: 50,
        grace_period_secs: 2,
        worker_log_level: "warn".to_string(),
        ..SupervisorConfig::default()
    }
}

pub fn ctx(external_id: &str) -> ToolContext {
    ToolContext::new(external_id)
}

pub fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}
