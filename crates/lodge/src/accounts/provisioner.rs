//! Ensures that every mapped identity has a usable OS account.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info, warn};
use rustix::process::{getgid, getuid};
use tokio::sync::{Mutex, OnceCell};

use super::system::{PasswdEntry, home_exists, run_privileged_command};
use super::{
    Account, AccountError, NewAccount, SystemUsers, UserDirectory, is_owned_by, is_root,
    owner_tag, validate_account_name,
};
use crate::config::AccountsConfig;
use crate::identity::IdentityMapping;

/// Outcome of reconciling stored mappings with the OS at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Accounts that were present and owned by their identity.
    pub verified: Vec<String>,
    /// Accounts that were missing and have been recreated.
    pub recreated: Vec<String>,
    /// `(account, reason)` pairs that need operator attention.
    pub flagged: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.flagged.is_empty()
    }
}

/// Creates and verifies OS accounts for identity mappings.
pub struct AccountProvisioner {
    config: AccountsConfig,
    directory: Arc<dyn UserDirectory>,
    group_ready: OnceCell<()>,
    // New uids are the highest in /etc/passwd plus one, so creations run
    // one at a time.
    provisioning: Mutex<()>,
}

impl AccountProvisioner {
    /// Provisioner backed by the host account database.
    pub fn new(config: AccountsConfig) -> Self {
        let directory = Arc::new(SystemUsers::new(config.use_sudo, config.uid_start));
        Self::with_directory(config, directory)
    }

    pub fn with_directory(config: AccountsConfig, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            config,
            directory,
            group_ready: OnceCell::new(),
            provisioning: Mutex::new(()),
        }
    }

    pub fn isolation_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn directory(&self) -> Arc<dyn UserDirectory> {
        Arc::clone(&self.directory)
    }

    /// Fail early when account helpers cannot possibly run.
    pub fn check_privileges(&self) -> Result<(), AccountError> {
        if !self.config.enabled || is_root() {
            return Ok(());
        }
        if !self.config.use_sudo {
            return Err(AccountError::Command(anyhow!(
                "account isolation requires root or accounts.use_sudo = true"
            )));
        }
        run_privileged_command(true, "/bin/true", &[]).map_err(|e| {
            AccountError::Command(e.context("passwordless sudo is not available"))
        })
    }

    /// Make sure the account for `mapping` exists and has a home directory.
    ///
    /// An existing account is only accepted when it carries the owner tag of
    /// the same identity.
    pub async fn ensure_account(&self, mapping: &IdentityMapping) -> Result<Account, AccountError> {
        validate_account_name(&mapping.account_name)?;

        if !self.config.enabled {
            return self.current_user_account(mapping).await;
        }

        self.ensure_group().await?;

        let directory = Arc::clone(&self.directory);
        let config = self.config.clone();
        let mapping = mapping.clone();
        let _provisioning = self.provisioning.lock().await;
        let (account, created) =
            tokio::task::spawn_blocking(move || provision(directory.as_ref(), &config, &mapping))
                .await
                .map_err(|e| AccountError::Command(e.into()))??;

        if created {
            info!(
                "Created account '{}' (uid {}) with home {}",
                account.name,
                account.uid,
                account.home.display()
            );
        } else {
            debug!("Account '{}' verified (uid {})", account.name, account.uid);
        }
        Ok(account)
    }

    /// Reconcile stored mappings with the OS account database.
    pub async fn restore_accounts(&self, mappings: &[IdentityMapping]) -> RestoreReport {
        let mut report = RestoreReport::default();

        for mapping in mappings {
            let name = mapping.account_name.clone();

            if !self.config.enabled {
                match self.current_user_account(mapping).await {
                    Ok(_) => report.verified.push(name),
                    Err(e) => report.flagged.push((name, e.to_string())),
                }
                continue;
            }

            let directory = Arc::clone(&self.directory);
            let lookup_name = name.clone();
            let existing = tokio::task::spawn_blocking(move || directory.lookup(&lookup_name))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);

            match existing {
                Ok(Some(entry)) if is_owned_by(&entry, &mapping.external_id) => {
                    // Verifies the home as a side effect.
                    match self.ensure_account(mapping).await {
                        Ok(_) => report.verified.push(name),
                        Err(e) => report.flagged.push((name, e.to_string())),
                    }
                }
                Ok(Some(_)) => {
                    let reason = format!("owned by another identity than '{}'", mapping.external_id);
                    warn!("Account '{}' {}", name, reason);
                    report.flagged.push((name, reason));
                }
                Ok(None) if self.config.recreate_missing => {
                    match self.ensure_account(mapping).await {
                        Ok(_) => {
                            info!("Recreated missing account '{}'", name);
                            report.recreated.push(name);
                        }
                        Err(e) => {
                            warn!("Failed to recreate account '{}': {}", name, e);
                            report.flagged.push((name, e.to_string()));
                        }
                    }
                }
                Ok(None) => {
                    warn!(
                        "Account '{}' for identity '{}' is missing",
                        name, mapping.external_id
                    );
                    report.flagged.push((name, "missing".to_string()));
                }
                Err(e) => {
                    warn!("Failed to look up account '{}': {:#}", name, e);
                    report.flagged.push((name, format!("lookup failed: {e:#}")));
                }
            }
        }

        info!(
            "Account restore: {} verified, {} recreated, {} flagged",
            report.verified.len(),
            report.recreated.len(),
            report.flagged.len()
        );
        report
    }

    async fn ensure_group(&self) -> Result<(), AccountError> {
        self.group_ready
            .get_or_try_init(|| async {
                let directory = Arc::clone(&self.directory);
                let group = self.config.group.clone();
                tokio::task::spawn_blocking(move || {
                    if directory.group_exists(&group)? {
                        return Ok(());
                    }
                    info!("Creating group '{}'", group);
                    directory.create_group(&group)
                })
                .await
                .map_err(|e| AccountError::Command(e.into()))?
                .map_err(AccountError::Command)
            })
            .await
            .map(|_| ())
    }

    /// Development mode: every identity shares the current OS user.
    async fn current_user_account(
        &self,
        mapping: &IdentityMapping,
    ) -> Result<Account, AccountError> {
        tokio::fs::create_dir_all(&mapping.home_dir)
            .await
            .map_err(|e| {
                AccountError::Command(anyhow::Error::from(e).context(format!(
                    "creating home {}",
                    mapping.home_dir.display()
                )))
            })?;

        Ok(Account {
            name: mapping.account_name.clone(),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            home: mapping.home_dir.clone(),
            shell: self.config.shell.clone(),
            isolated: false,
        })
    }
}

/// Blocking half of [`AccountProvisioner::ensure_account`].
///
/// Returns the account and whether it was created by this call.
fn provision(
    directory: &dyn UserDirectory,
    config: &AccountsConfig,
    mapping: &IdentityMapping,
) -> Result<(Account, bool), AccountError> {
    let name = &mapping.account_name;

    if let Some(entry) = directory.lookup(name).map_err(AccountError::Lookup)? {
        if !is_owned_by(&entry, &mapping.external_id) {
            return Err(AccountError::Ownership {
                account: name.clone(),
                external_id: mapping.external_id.clone(),
            });
        }
        ensure_home(directory, &entry, &config.group)?;
        return Ok((to_account(entry), false));
    }

    let spec = NewAccount {
        name: name.clone(),
        uid: None,
        group: config.group.clone(),
        extra_groups: config.extra_groups.clone(),
        shell: config.shell.clone(),
        home: mapping.home_dir.clone(),
        comment: owner_tag(&mapping.external_id),
    };
    directory
        .create_user(&spec)
        .map_err(AccountError::Command)?;

    let entry = directory
        .lookup(name)
        .map_err(AccountError::Lookup)?
        .ok_or_else(|| AccountError::Missing(name.clone()))?;
    ensure_home(directory, &entry, &config.group)?;
    Ok((to_account(entry), true))
}

fn ensure_home(
    directory: &dyn UserDirectory,
    entry: &PasswdEntry,
    group: &str,
) -> Result<(), AccountError> {
    if home_exists(&entry.home) {
        return Ok(());
    }
    warn!(
        "Home {} of account '{}' is missing, recreating",
        entry.home.display(),
        entry.name
    );
    directory
        .ensure_home(entry, group)
        .map_err(AccountError::Command)
}

fn to_account(entry: PasswdEntry) -> Account {
    Account {
        name: entry.name,
        uid: entry.uid,
        gid: entry.gid,
        home: entry.home,
        shell: entry.shell,
        isolated: true,
    }
}

/// Default home for an account under `home_base`.
pub(crate) fn home_for(home_base: &Path, account_name: &str) -> std::path::PathBuf {
    home_base.join(account_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory account database that creates homes on the real filesystem.
    #[derive(Default)]
    struct FakeDirectory {
        users: Mutex<HashMap<String, PasswdEntry>>,
        groups: Mutex<HashSet<String>>,
        create_delay_ms: AtomicU64,
        created: AtomicUsize,
        group_creations: AtomicUsize,
    }

    impl FakeDirectory {
        fn insert(&self, entry: PasswdEntry) {
            self.users.lock().unwrap().insert(entry.name.clone(), entry);
        }
    }

    impl UserDirectory for FakeDirectory {
        fn lookup(&self, name: &str) -> Result<Option<PasswdEntry>> {
            Ok(self.users.lock().unwrap().get(name).cloned())
        }

        fn group_exists(&self, group: &str) -> Result<bool> {
            Ok(self.groups.lock().unwrap().contains(group))
        }

        fn create_group(&self, group: &str) -> Result<()> {
            self.group_creations.fetch_add(1, Ordering::SeqCst);
            self.groups.lock().unwrap().insert(group.to_string());
            Ok(())
        }

        fn create_user(&self, account: &NewAccount) -> Result<()> {
            // Same allocation as useradd: highest uid plus one, then write.
            let uid = self
                .users
                .lock()
                .unwrap()
                .values()
                .map(|entry| entry.uid + 1)
                .max()
                .unwrap_or(2000)
                .max(2000);
            std::thread::sleep(Duration::from_millis(
                self.create_delay_ms.load(Ordering::SeqCst),
            ));
            if self.users.lock().unwrap().values().any(|entry| entry.uid == uid) {
                anyhow::bail!("UID {uid} is not unique");
            }
            std::fs::create_dir_all(&account.home)?;
            self.created.fetch_add(1, Ordering::SeqCst);
            self.insert(PasswdEntry {
                name: account.name.clone(),
                uid,
                gid: 2000,
                gecos: account.comment.clone(),
                home: account.home.clone(),
                shell: account.shell.clone(),
            });
            Ok(())
        }

        fn ensure_home(&self, entry: &PasswdEntry, _group: &str) -> Result<()> {
            std::fs::create_dir_all(&entry.home)?;
            Ok(())
        }
    }

    fn mapping(base: &Path, external_id: &str, account: &str) -> IdentityMapping {
        IdentityMapping {
            external_id: external_id.to_string(),
            account_name: account.to_string(),
            home_dir: home_for(base, account),
            created_at: Utc::now(),
        }
    }

    fn enabled_config(base: &Path) -> AccountsConfig {
        AccountsConfig {
            enabled: true,
            home_base: base.display().to_string(),
            ..AccountsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_account_creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake.clone());
        let m = mapping(dir.path(), "alice@example.org", "lc_alice");

        let first = provisioner.ensure_account(&m).await.unwrap();
        assert!(first.isolated);
        assert_eq!(first.home, dir.path().join("lc_alice"));
        assert!(first.home.is_dir());

        let second = provisioner.ensure_account(&m).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.created.load(Ordering::SeqCst), 1);
        assert_eq!(fake.group_creations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_creations_get_distinct_uids() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        fake.create_delay_ms.store(100, Ordering::SeqCst);
        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake.clone());
        let alice = mapping(dir.path(), "alice@example.org", "lc_alice");
        let bob = mapping(dir.path(), "bob@example.org", "lc_bob");

        let (a, b) = tokio::join!(
            provisioner.ensure_account(&alice),
            provisioner.ensure_account(&bob)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.uid, b.uid);
        assert_eq!(fake.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_foreign_account_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        fake.insert(PasswdEntry {
            name: "lc_alice".into(),
            uid: 1500,
            gid: 1500,
            gecos: "Alice Admin".into(),
            home: dir.path().join("lc_alice"),
            shell: "/bin/bash".into(),
        });
        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake.clone());

        let err = provisioner
            .ensure_account(&mapping(dir.path(), "alice@example.org", "lc_alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::Ownership { .. }));
        assert_eq!(fake.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_home_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        let home = dir.path().join("lc_bob");
        fake.insert(PasswdEntry {
            name: "lc_bob".into(),
            uid: 2001,
            gid: 2000,
            gecos: owner_tag("bob@example.org"),
            home: home.clone(),
            shell: "/bin/bash".into(),
        });
        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake);

        assert!(!home.exists());
        let account = provisioner
            .ensure_account(&mapping(dir.path(), "bob@example.org", "lc_bob"))
            .await
            .unwrap();
        assert_eq!(account.home, home);
        assert!(home.is_dir());
    }

    #[tokio::test]
    async fn test_invalid_name_never_reaches_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake.clone());

        let err = provisioner
            .ensure_account(&mapping(dir.path(), "x", "Bad Name"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::InvalidName(_)));
        assert_eq!(fake.group_creations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_isolation_uses_current_user() {
        let dir = tempfile::tempdir().unwrap();
        let config = AccountsConfig {
            enabled: false,
            home_base: dir.path().display().to_string(),
            ..AccountsConfig::default()
        };
        let fake = Arc::new(FakeDirectory::default());
        let provisioner = AccountProvisioner::with_directory(config, fake.clone());

        let account = provisioner
            .ensure_account(&mapping(dir.path(), "carol@example.org", "lc_carol"))
            .await
            .unwrap();
        assert!(!account.isolated);
        assert_eq!(account.uid, getuid().as_raw());
        assert!(account.home.is_dir());
        assert_eq!(fake.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restore_recreates_or_flags() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeDirectory::default());
        fake.insert(PasswdEntry {
            name: "lc_present".into(),
            uid: 2001,
            gid: 2000,
            gecos: owner_tag("present@example.org"),
            home: dir.path().join("lc_present"),
            shell: "/bin/bash".into(),
        });
        fake.insert(PasswdEntry {
            name: "lc_taken".into(),
            uid: 2002,
            gid: 2000,
            gecos: "someone else".into(),
            home: dir.path().join("lc_taken"),
            shell: "/bin/bash".into(),
        });
        let mappings = vec![
            mapping(dir.path(), "present@example.org", "lc_present"),
            mapping(dir.path(), "gone@example.org", "lc_gone"),
            mapping(dir.path(), "taken@example.org", "lc_taken"),
        ];

        let provisioner = AccountProvisioner::with_directory(enabled_config(dir.path()), fake.clone());
        let report = provisioner.restore_accounts(&mappings).await;
        assert_eq!(report.verified, vec!["lc_present".to_string()]);
        assert_eq!(report.recreated, vec!["lc_gone".to_string()]);
        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].0, "lc_taken");
        assert!(!report.is_clean());

        let report_only = AccountProvisioner::with_directory(
            AccountsConfig {
                recreate_missing: false,
                ..enabled_config(dir.path())
            },
            Arc::new(FakeDirectory::default()),
        );
        let report = report_only
            .restore_accounts(&[mapping(dir.path(), "gone@example.org", "lc_gone")])
            .await;
        assert_eq!(
            report.flagged,
            vec![("lc_gone".to_string(), "missing".to_string())]
        );
        assert!(report.recreated.is_empty());
    }

    #[test]
    fn test_home_for() {
        assert_eq!(
            home_for(Path::new("/home"), "lc_alice"),
            PathBuf::from("/home/lc_alice")
        );
    }
}
