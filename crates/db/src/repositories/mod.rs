use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use concierge_core::domain::memory::{
    MemoryEntry, MemoryStats, MemoryType, Message, PendingLearning, StoredMessage,
};
use concierge_core::errors::ApplicationError;

pub mod memory;
pub mod memory_entry;

pub use memory::InMemoryMemoryStore;
pub use memory_entry::SqlMemoryStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

/// Narrows which entries a search may return.
///
/// Archived entries are excluded unless `include_archived` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryFilter {
    pub memory_type: Option<MemoryType>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub approved_only: bool,
    pub include_archived: bool,
}

impl MemoryFilter {
    pub fn of_type(memory_type: MemoryType) -> Self {
        Self { memory_type: Some(memory_type), ..Self::default() }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn approved(mut self) -> Self {
        self.approved_only = true;
        self
    }

    pub fn with_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        (self.include_archived || !entry.archived)
            && (!self.approved_only || entry.approved)
            && self.memory_type.map_or(true, |memory_type| entry.memory_type == memory_type)
            && self.user_id.as_deref().map_or(true, |user| entry.user_id.as_deref() == Some(user))
            && self
                .session_id
                .as_deref()
                .map_or(true, |session| entry.session_id.as_deref() == Some(session))
    }
}

/// Persistence for the three memory tiers, the per-session message log, and pending learnings.
///
/// Every operation is self-contained; implementations must be safe to share across tasks.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Inserts or overwrites an entry and returns the version it was stored under.
    async fn save(&self, entry: MemoryEntry) -> Result<i64, RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, RepositoryError>;

    /// Most recently updated matches first. A non-empty `query` keeps only entries whose
    /// content contains it, ignoring case.
    async fn search(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, RepositoryError>;

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError>;

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError>;

    /// Archives active entries last updated before `cutoff`.
    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats, RepositoryError>;

    async fn save_message(&self, session_id: &str, message: &Message)
        -> Result<i64, RepositoryError>;

    /// The most recent `limit` messages of a session, oldest first.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        unsummarized_only: bool,
    ) -> Result<Vec<StoredMessage>, RepositoryError>;

    async fn mark_messages_summarized(
        &self,
        session_id: &str,
        up_to_id: i64,
    ) -> Result<u64, RepositoryError>;

    async fn save_pending(&self, pending: PendingLearning) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_pending(&self) -> Result<Vec<PendingLearning>, RepositoryError>;

    async fn remove_pending(&self, id: &str) -> Result<bool, RepositoryError>;
}

pub(crate) fn limit_as_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
