//! Upload and download link bookkeeping.
//!
//! A link session grants one identity short-lived access to a path inside
//! one of its workspaces. Sessions expire on a timer and are also rejected
//! on lookup once past their deadline. Status only moves forward:
//! `open -> consumed` (downloads) or `open -> closed`.

mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Upload,
    Download,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Consumed,
    Closed,
}

/// An issued upload or download link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSession {
    pub token: String,
    pub kind: SessionKind,
    pub external_id: String,
    pub account_name: String,
    pub workspace: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl LinkSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Open sessions plus warnings about identities holding more than one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveSessions {
    pub sessions: Vec<LinkSession>,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown session token")]
    NotFound,

    #[error("session has expired")]
    Expired,

    #[error("download link has already been used")]
    AlreadyConsumed,

    #[error("session is closed")]
    Closed,

    #[error("session is a {actual} link, expected {expected}")]
    WrongKind {
        expected: SessionKind,
        actual: SessionKind,
    },
}
