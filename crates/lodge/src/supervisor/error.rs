//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

use crate::accounts::AccountError;
use crate::identity::IdentityError;

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors surfaced to callers of the supervisor.
///
/// The display string is the single message a caller sees. The variants
/// exist for logs and tests.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The identity could not be mapped to an account name.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The OS account or its home could not be created or verified.
    #[error("account error: {0}")]
    Account(#[from] AccountError),

    /// The worker process could not be started or exited during startup.
    #[error("failed to start worker for '{account}': {reason}")]
    Spawn { account: String, reason: String },

    /// The worker started but its socket never accepted a connection.
    #[error("worker for '{account}' did not become ready within {}ms", .timeout.as_millis())]
    ReadinessTimeout { account: String, timeout: Duration },

    /// The request did not complete normally at the transport level.
    #[error("worker communication error for '{account}': {source}")]
    Communication {
        account: String,
        #[source]
        source: CommunicationError,
    },

    /// Error reported by the worker itself, passed through verbatim.
    #[error("{0}")]
    Application(String),

    /// The supervisor is stopping and no longer starts workers.
    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl SupervisorError {
    /// Short label for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Identity(_) => "identity",
            Self::Account(_) => "account",
            Self::Spawn { .. } => "spawn",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::Communication { .. } => "communication",
            Self::Application(_) => "application",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the failure was caused by a timeout (startup or request).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout { .. }
                | Self::Communication {
                    source: CommunicationError::Timeout(_),
                    ..
                }
        )
    }
}

/// Transport-level failures talking to a worker.
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed before a complete response")]
    Closed,

    #[error("response exceeded {0} bytes")]
    TooLarge(usize),

    #[error("response id '{actual}' does not match request id '{expected}'")]
    IdMismatch { expected: String, actual: String },

    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),
}
