//! Palaver conversation data model.
//!
//! This crate defines the types every other crate speaks:
//! - `Turn`: one message in a conversation, attributed to a role
//! - `Session`: a server-side, in-memory transcript of turns
//! - `Fragment`: one incremental piece of streamed completion text

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Placeholder id for turns synthesized outside any session.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque turn identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message in a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: TurnRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub session_id: SessionId,
}

impl Turn {
    pub fn new(role: TurnRole, text: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            id: TurnId::new(),
            role,
            text: text.into(),
            created_at: Utc::now(),
            session_id,
        }
    }

    /// Create a turn with a caller-chosen id, for ids handed out before the
    /// turn's text is known (the assistant turn id is returned to the caller
    /// while the stream is still in flight).
    pub fn with_id(
        id: TurnId,
        role: TurnRole,
        text: impl Into<String>,
        session_id: SessionId,
    ) -> Self {
        Self {
            id,
            role,
            text: text.into(),
            created_at: Utc::now(),
            session_id,
        }
    }

    pub fn system(text: impl Into<String>, session_id: SessionId) -> Self {
        Self::new(TurnRole::System, text, session_id)
    }

    pub fn user(text: impl Into<String>, session_id: SessionId) -> Self {
        Self::new(TurnRole::User, text, session_id)
    }

    pub fn assistant(text: impl Into<String>, session_id: SessionId) -> Self {
        Self::new(TurnRole::Assistant, text, session_id)
    }
}

/// A server-side conversation transcript. Turns are insertion-ordered,
/// which is also chronological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            turns: Vec::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.last_activity_at = Utc::now();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity_at
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit in the lazy fragment sequence a streamed completion emits.
///
/// The final fragment carries empty text and `is_final = true`; nothing
/// may follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub is_final: bool,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn end() -> Self {
        Self {
            text: String::new(),
            is_final: true,
        }
    }
}
