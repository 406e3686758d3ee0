//! OS account provisioning for mapped identities.
//!
//! Every identity gets a real account in a shared group with a private home.
//! Ownership of an account is recorded in its GECOS comment
//! (`lodge identity <external id>`) so that a name collision at the OS level
//! is detected instead of silently reusing someone else's account.

mod provisioner;
mod system;

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

pub use provisioner::{AccountProvisioner, RestoreReport};
pub(crate) use provisioner::home_for;
pub use system::{NewAccount, PasswdEntry, SystemUsers, UserDirectory, is_root};

/// Linux username length limit.
pub const MAX_ACCOUNT_NAME_LEN: usize = 32;

const OWNER_TAG_PREFIX: &str = "lodge identity ";

static ACCOUNT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("account name pattern is valid")
});

/// A provisioned account, ready to run a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
    /// False when isolation is disabled and the account is the current user.
    pub isolated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid account name '{0}'")]
    InvalidName(String),

    #[error("account '{account}' exists but is not owned by identity '{external_id}'")]
    Ownership {
        account: String,
        external_id: String,
    },

    #[error("account '{0}' was not found after creation")]
    Missing(String),

    #[error("account lookup failed: {0:#}")]
    Lookup(#[source] anyhow::Error),

    #[error("account operation failed: {0:#}")]
    Command(#[source] anyhow::Error),
}

/// GECOS comment marking an account as belonging to `external_id`.
pub fn owner_tag(external_id: &str) -> String {
    sanitize_gecos(&format!("{OWNER_TAG_PREFIX}{external_id}"))
}

/// Whether a passwd entry carries the owner tag for `external_id`.
pub fn is_owned_by(entry: &PasswdEntry, external_id: &str) -> bool {
    entry.gecos.trim() == owner_tag(external_id)
}

pub fn validate_account_name(name: &str) -> Result<(), AccountError> {
    if ACCOUNT_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(AccountError::InvalidName(name.to_string()))
    }
}

/// useradd rejects ':' and control characters in the comment field.
fn sanitize_gecos(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if c == ':' || c.is_control() { ' ' } else { c })
        .collect();
    cleaned.trim().to_string()
}
