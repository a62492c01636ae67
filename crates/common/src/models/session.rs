//! Conversation sessions and their turns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the refinement loop finished for a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Both critics passed
    Accepted,
    /// Round budget ran out, best candidate released
    Exhausted,
}

/// One answered query. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub query: String,
    pub answer: String,
    pub rounds: u32,
    pub groundedness: f32,
    pub precision: f32,
    pub outcome: OutcomeKind,
    pub created_at: DateTime<Utc>,
}

/// A conversation with one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,

    /// Opaque user identifier supplied by the chat surface
    pub user_id: String,

    /// Key used with the long-term memory store
    pub memory_handle: String,

    pub turns: Vec<Turn>,

    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            id: Uuid::new_v4(),
            memory_handle: user_id.clone(),
            user_id,
            turns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}
