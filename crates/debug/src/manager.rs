//! Process-wide registry of debug sessions.
//!
//! The one deliberate singleton in the system: created on first use, torn
//! down via explicit [`SessionManager::shutdown`]. Sessions are keyed by
//! opaque UUIDs and are never deleted implicitly — a terminated session
//! stays queryable for post-mortem inspection until its owner deletes it.

use crate::session::{DebugSession, PauseSnapshot, SessionError, SessionInfo};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

static GLOBAL: Lazy<Arc<SessionManager>> = Lazy::new(|| Arc::new(SessionManager::new()));

/// Registry of all live and post-mortem sessions.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<DebugSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide manager.
    pub fn global() -> Arc<SessionManager> {
        Arc::clone(&GLOBAL)
    }

    /// Connect a new session to an inspector endpoint and return its id.
    pub async fn create(&self, ws_url: &str) -> Result<String, SessionError> {
        let id = Uuid::new_v4().to_string();
        let session = DebugSession::connect(id.clone(), ws_url).await?;
        self.sessions.lock().await.insert(id.clone(), session);
        info!(session = %id, target = ws_url, "debug session created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<DebugSession>, SessionError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    /// Terminate (if needed) and forget a session.
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        session.terminate().await;
        info!(session = %id, "debug session deleted");
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn wait_for_pause(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<PauseSnapshot, SessionError> {
        let session = self.get(id).await?;
        session.wait_for_pause(timeout).await
    }

    /// Terminate every session and clear the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<DebugSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.terminate().await;
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.get("nope").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_unknown_session_is_not_found() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.delete("nope").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_against_unreachable_target_fails() {
        let manager = SessionManager::new();
        let err = manager.create("ws://127.0.0.1:1/missing").await.unwrap_err();
        assert!(matches!(err, SessionError::Cdp(_)));
        assert!(manager.list().await.is_empty());
    }
}
