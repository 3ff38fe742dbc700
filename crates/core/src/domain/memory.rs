use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Session,
    User,
    Learned,
    Summary,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::User => "user",
            Self::Learned => "learned",
            Self::Summary => "summary",
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "session" => Ok(Self::Session),
            "user" => Ok(Self::User),
            "learned" => Ok(Self::Learned),
            "summary" => Ok(Self::Summary),
            other => Err(DomainError::InvariantViolation(format!("unknown memory type `{other}`"))),
        }
    }
}

/// A single remembered item in one of the memory tiers.
///
/// The id is derived from owner and content (see [`crate::similarity::entry_id`]) so the
/// same fact stored twice for one owner collapses onto one row. `version` is assigned by the
/// store on every save; a freshly built entry carries version 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub confidence: f64,
    pub approved: bool,
    pub access_count: u32,
    pub last_accessed: Option<DateTime<Utc>>,
    pub source_ids: Vec<String>,
    pub archived: bool,
    pub version: i64,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, memory_type: MemoryType, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            memory_type,
            content: content.into(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            session_id: None,
            user_id: None,
            confidence: 1.0,
            approved: true,
            access_count: 0,
            last_accessed: None,
            source_ids: Vec::new(),
            archived: false,
            version: 0,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_source_ids(mut self, source_ids: Vec<String>) -> Self {
        self.source_ids = source_ids;
        self
    }

    pub fn with_approval(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }

    pub fn category(&self) -> Option<&str> {
        self.metadata.get("category").and_then(Value::as_str)
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = Some(at);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(DomainError::InvariantViolation(format!("unknown message role `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now(), metadata: Map::new() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A message as persisted in a session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub message: Message,
    pub summarized: bool,
}

/// An insight awaiting operator approval before it becomes learned memory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingLearning {
    pub id: String,
    pub content: String,
    pub category: String,
    pub source: String,
    pub confidence: f64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub by_type: BTreeMap<MemoryType, u64>,
    pub total_active: u64,
    pub total_archived: u64,
    pub pending_learnings: u64,
}
