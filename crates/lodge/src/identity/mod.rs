//! Mapping of external identities to OS account names.
//!
//! A mapping is created once, persisted before it is handed out, and never
//! changed afterwards. Stored names are authoritative: the derivation in
//! [`naming`] is only consulted for identities seen for the first time.

mod mapper;
pub mod naming;
mod repository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use mapper::IdentityMapper;
pub use naming::{derive_account_name, with_suffix};
pub use repository::IdentityRepository;

/// Durable link between an external identity and its OS account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub external_id: String,
    pub account_name: String,
    pub home_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity must not be empty")]
    InvalidIdentity,

    #[error("no free account name for identity '{external_id}' (base '{base}', {attempts} candidates tried)")]
    Exhausted {
        external_id: String,
        base: String,
        attempts: u32,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
