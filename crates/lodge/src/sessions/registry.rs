//! In-memory registry of link sessions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use rand::RngCore;

use super::{ActiveSessions, LinkSession, SessionError, SessionKind, SessionStatus};
use crate::tools::ToolContext;

const TOKEN_BYTES: usize = 32;

/// Link sessions keyed by token.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, LinkSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new session that expires after `ttl`.
    ///
    /// When called inside a Tokio runtime a timer closes the session at its
    /// deadline; lookups reject it past the deadline either way.
    pub fn open(
        &self,
        kind: SessionKind,
        ctx: &ToolContext,
        account_name: &str,
        workspace: &str,
        path: &str,
        ttl: Duration,
    ) -> LinkSession {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let session = loop {
            let token = generate_token();
            match self.sessions.entry(token.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let session = LinkSession {
                        token,
                        kind,
                        external_id: ctx.external_id.clone(),
                        account_name: account_name.to_string(),
                        workspace: workspace.to_string(),
                        path: path.to_string(),
                        created_at,
                        expires_at,
                        status: SessionStatus::Open,
                    };
                    slot.insert(session.clone());
                    break session;
                }
            }
        };

        info!(
            "Opened {} session for '{}' ({}/{}), expires {}",
            kind, ctx.external_id, workspace, path, expires_at
        );
        self.schedule_expiry(&session.token, ttl);
        self.warn_if_crowded(&ctx.external_id);
        session
    }

    /// Look up an open session. Expired sessions are closed and rejected.
    pub fn get(&self, token: &str) -> Result<LinkSession, SessionError> {
        let mut entry = self.sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        let session = entry.value_mut();
        check_usable(session)?;
        Ok(session.clone())
    }

    /// Mark a download link as used. Succeeds once per token.
    pub fn consume_download(&self, token: &str) -> Result<LinkSession, SessionError> {
        let mut entry = self.sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        let session = entry.value_mut();
        if session.kind != SessionKind::Download {
            return Err(SessionError::WrongKind {
                expected: SessionKind::Download,
                actual: session.kind,
            });
        }
        check_usable(session)?;
        session.status = SessionStatus::Consumed;
        debug!("Download session for '{}' consumed", session.external_id);
        Ok(session.clone())
    }

    /// Close an open session.
    pub fn close(&self, token: &str) -> Result<LinkSession, SessionError> {
        let mut entry = self.sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        let session = entry.value_mut();
        check_usable(session)?;
        session.status = SessionStatus::Closed;
        debug!("{} session for '{}' closed", session.kind, session.external_id);
        Ok(session.clone())
    }

    /// Open sessions, optionally for one identity.
    ///
    /// Leaving several links open for one identity widens the window in which
    /// a leaked link is usable, so each such identity produces a warning.
    pub fn list_active(&self, external_id: Option<&str>) -> ActiveSessions {
        self.close_expired();

        let mut sessions: Vec<LinkSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_open())
            .filter(|entry| external_id.is_none_or(|id| entry.external_id == id))
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut per_identity: BTreeMap<&str, usize> = BTreeMap::new();
        for session in &sessions {
            *per_identity.entry(session.external_id.as_str()).or_default() += 1;
        }
        let warnings: Vec<String> = per_identity
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, count)| format!("identity '{id}' has {count} open link sessions"))
            .collect();
        for warning in &warnings {
            warn!("{}", warning);
        }

        ActiveSessions { sessions, warnings }
    }

    /// Drop consumed and closed sessions created more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.is_open() || session.created_at > cutoff);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!("Purged {} finished link sessions", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn close_expired(&self) {
        let now = Utc::now();
        for mut entry in self.sessions.iter_mut() {
            if entry.is_open() && entry.is_expired_at(now) {
                entry.status = SessionStatus::Closed;
            }
        }
    }

    fn schedule_expiry(&self, token: &str, ttl: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let sessions = Arc::clone(&self.sessions);
        let token = token.to_string();
        handle.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(mut session) = sessions.get_mut(&token)
                && session.is_open()
            {
                session.status = SessionStatus::Closed;
                debug!(
                    "{} session for '{}' expired",
                    session.kind, session.external_id
                );
            }
        });
    }

    fn warn_if_crowded(&self, external_id: &str) {
        let open = self
            .sessions
            .iter()
            .filter(|entry| entry.is_open() && entry.external_id == external_id)
            .count();
        if open > 1 {
            warn!(
                "identity '{}' has {} open link sessions",
                external_id, open
            );
        }
    }
}

/// Reject sessions that are no longer open, closing expired ones.
fn check_usable(session: &mut LinkSession) -> Result<(), SessionError> {
    match session.status {
        SessionStatus::Consumed => return Err(SessionError::AlreadyConsumed),
        SessionStatus::Closed if session.is_expired_at(Utc::now()) => {
            return Err(SessionError::Expired);
        }
        SessionStatus::Closed => return Err(SessionError::Closed),
        SessionStatus::Open => {}
    }
    if session.is_expired_at(Utc::now()) {
        session.status = SessionStatus::Closed;
        return Err(SessionError::Expired);
    }
    Ok(())
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ctx(id: &str) -> ToolContext {
        ToolContext::new(id)
    }

    #[tokio::test]
    async fn test_tokens_are_unique_and_url_safe() {
        let registry = SessionRegistry::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let session = registry.open(
                SessionKind::Upload,
                &ctx("a@x"),
                "lc_a",
                "demo",
                "in.txt",
                Duration::from_secs(60),
            );
            assert_eq!(session.token.len(), 43);
            assert!(
                session
                    .token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            );
            assert!(seen.insert(session.token));
        }
    }

    #[tokio::test]
    async fn test_download_is_single_use() {
        let registry = SessionRegistry::new();
        let session = registry.open(
            SessionKind::Download,
            &ctx("a@x"),
            "lc_a",
            "demo",
            "out.zip",
            Duration::from_secs(60),
        );

        let consumed = registry.consume_download(&session.token).unwrap();
        assert_eq!(consumed.status, SessionStatus::Consumed);
        assert_eq!(
            registry.consume_download(&session.token),
            Err(SessionError::AlreadyConsumed)
        );
        assert_eq!(registry.get(&session.token), Err(SessionError::AlreadyConsumed));
        assert_eq!(registry.close(&session.token), Err(SessionError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_upload_cannot_be_consumed() {
        let registry = SessionRegistry::new();
        let session = registry.open(
            SessionKind::Upload,
            &ctx("a@x"),
            "lc_a",
            "demo",
            "in.txt",
            Duration::from_secs(60),
        );
        assert!(matches!(
            registry.consume_download(&session.token),
            Err(SessionError::WrongKind { .. })
        ));
        assert!(registry.get(&session.token).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_expiry_is_reactive() {
        let registry = SessionRegistry::new();
        let session = registry.open(
            SessionKind::Download,
            &ctx("a@x"),
            "lc_a",
            "demo",
            "f",
            Duration::ZERO,
        );
        assert_eq!(registry.get(&session.token), Err(SessionError::Expired));
        assert_eq!(
            registry.consume_download(&session.token),
            Err(SessionError::Expired)
        );
    }

    #[tokio::test]
    async fn test_expiry_is_proactive() {
        let registry = SessionRegistry::new();
        let session = registry.open(
            SessionKind::Upload,
            &ctx("a@x"),
            "lc_a",
            "demo",
            "f",
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = registry
            .sessions
            .get(&session.token)
            .map(|s| s.status)
            .unwrap();
        assert_eq!(stored, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_is_one_way() {
        let registry = SessionRegistry::new();
        let session = registry.open(
            SessionKind::Upload,
            &ctx("a@x"),
            "lc_a",
            "demo",
            "f",
            Duration::from_secs(60),
        );
        registry.close(&session.token).unwrap();
        assert_eq!(registry.close(&session.token), Err(SessionError::Closed));
        assert_eq!(registry.get("nope"), Err(SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_list_active_warns_on_multiple_open() {
        let registry = SessionRegistry::new();
        let ttl = Duration::from_secs(60);
        registry.open(SessionKind::Upload, &ctx("a@x"), "lc_a", "w", "1", ttl);
        registry.open(SessionKind::Download, &ctx("a@x"), "lc_a", "w", "2", ttl);
        let single = registry.open(SessionKind::Upload, &ctx("b@x"), "lc_b", "w", "3", ttl);

        let all = registry.list_active(None);
        assert_eq!(all.sessions.len(), 3);
        assert_eq!(all.warnings.len(), 1);
        assert!(all.warnings[0].contains("a@x"));

        let only_b = registry.list_active(Some("b@x"));
        assert_eq!(only_b.sessions, vec![single.clone()]);
        assert!(only_b.warnings.is_empty());

        registry.close(&single.token).unwrap();
        assert!(registry.list_active(Some("b@x")).sessions.is_empty());
    }

    #[tokio::test]
    async fn test_purge_finished() {
        let registry = SessionRegistry::new();
        let ttl = Duration::from_secs(60);
        let done = registry.open(SessionKind::Download, &ctx("a@x"), "lc_a", "w", "1", ttl);
        registry.open(SessionKind::Upload, &ctx("a@x"), "lc_a", "w", "2", ttl);
        registry.consume_download(&done.token).unwrap();

        assert_eq!(registry.purge_finished(Duration::ZERO), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&done.token), Err(SessionError::NotFound));
    }
}
