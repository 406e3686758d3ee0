//! Internals of `lodge-worker`, the per-account process.
//!
//! The worker runs as its account with a private home. It serves one
//! request per connection on its Unix socket and answers with exactly one
//! envelope line. Failures of an operation are reported in the envelope's
//! `error` field as plain text.

pub mod command;
pub mod files;
pub mod server;
pub mod terminal;
pub mod workspace;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use server::{WorkerOptions, WorkerServer};

/// Errors reported back to the supervisor as application errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid name '{0}': use letters, digits, '.', '_' or '-', not starting with '.'")]
    InvalidName(String),

    #[error("path '{0}' is outside the allowed directory")]
    PathEscape(String),

    #[error("{0}")]
    Command(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Decode method params into a typed struct.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Value) -> WorkerResult<T> {
    serde_json::from_value(params).map_err(|e| WorkerError::InvalidParams(e.to_string()))
}
