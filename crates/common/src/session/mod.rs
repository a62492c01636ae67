//! Process-lifetime session registry

use crate::errors::{AppError, Result};
use crate::models::{Session, Turn};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Sessions are created on first interaction and only ever grow
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume `id` or start a new session for `user_id`
    ///
    /// A session owned by another user is reported as not found.
    pub async fn open(&self, id: Option<Uuid>, user_id: &str) -> Result<Session> {
        if let Some(id) = id {
            let session = self.get(id).await?;
            if session.user_id != user_id {
                warn!(session_id = %id, "Session resume rejected for a different user");
                return Err(AppError::SessionNotFound { id: id.to_string() });
            }
            return Ok(session);
        }

        let session = Session::new(user_id);
        self.sessions.write().await.insert(session.id, session.clone());
        info!(session_id = %session.id, user_id = %user_id, "Session created");
        Ok(session)
    }

    pub async fn get(&self, id: Uuid) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })
    }

    pub async fn append(&self, id: Uuid, turn: Turn) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })?;
        session.append(turn);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeKind;
    use chrono::Utc;

    fn turn(query: &str) -> Turn {
        Turn {
            id: Uuid::new_v4(),
            query: query.to_string(),
            answer: "ok".to_string(),
            rounds: 1,
            groundedness: 0.9,
            precision: 0.8,
            outcome: OutcomeKind::Accepted,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_creates_then_resumes() {
        let registry = SessionRegistry::new();
        let created = registry.open(None, "ana").await.unwrap();
        assert_eq!(created.memory_handle, "ana");

        let resumed = registry.open(Some(created.id), "ana").await.unwrap();
        assert_eq!(resumed.id, created.id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_turns_append_in_order() {
        let registry = SessionRegistry::new();
        let session = registry.open(None, "ana").await.unwrap();

        tokio_test::assert_ok!(registry.append(session.id, turn("first")).await);
        tokio_test::assert_ok!(registry.append(session.id, turn("second")).await);

        let stored = registry.get(session.id).await.unwrap();
        assert_eq!(stored.turns.len(), 2);
        assert_eq!(stored.last_turn().unwrap().query, "second");
    }

    #[tokio::test]
    async fn test_other_user_cannot_resume() {
        let registry = SessionRegistry::new();
        let alice = registry.open(None, "alice").await.unwrap();

        assert!(matches!(
            registry.open(Some(alice.id), "mallory").await,
            Err(AppError::SessionNotFound { .. })
        ));

        let resumed = registry.open(Some(alice.id), "alice").await.unwrap();
        assert_eq!(resumed.memory_handle, "alice");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = SessionRegistry::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.open(Some(missing), "ana").await,
            Err(AppError::SessionNotFound { .. })
        ));
        tokio_test::assert_err!(registry.append(missing, turn("q")).await);
    }
}
