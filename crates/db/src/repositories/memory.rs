use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use concierge_core::domain::memory::{
    MemoryEntry, MemoryStats, Message, PendingLearning, StoredMessage,
};

use super::{MemoryFilter, MemoryStore, RepositoryError};

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    messages: Vec<StoredMessage>,
    pending: HashMap<String, PendingLearning>,
}

/// Process-local store; contents are lost on drop.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(entries: &mut [MemoryEntry]) {
    entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn save(&self, mut entry: MemoryEntry) -> Result<i64, RepositoryError> {
        let mut state = self.state.write().await;
        let version = state.entries.get(&entry.id).map(|existing| existing.version + 1).unwrap_or(1);
        entry.version = version;
        state.entries.insert(entry.id.clone(), entry);
        Ok(version)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.entries.get(id).cloned())
    }

    async fn search(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, RepositoryError> {
        let needle = query.trim().to_lowercase();
        let state = self.state.read().await;
        let mut matches: Vec<MemoryEntry> = state
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .filter(|entry| needle.is_empty() || entry.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        newest_first(&mut matches);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        Ok(state.entries.remove(id).is_some())
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError> {
        self.search("", &MemoryFilter::default().for_session(session_id), usize::MAX).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError> {
        self.search("", &MemoryFilter::default().for_user(user_id), usize::MAX).await
    }

    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let mut archived = 0;
        for entry in state.entries.values_mut() {
            if !entry.archived && entry.updated_at < cutoff {
                entry.archived = true;
                entry.version += 1;
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats, RepositoryError> {
        let state = self.state.read().await;
        let mut stats = MemoryStats::default();
        for entry in state.entries.values() {
            if user_id.map_or(false, |user| entry.user_id.as_deref() != Some(user)) {
                continue;
            }
            if entry.archived {
                stats.total_archived += 1;
                continue;
            }
            *stats.by_type.entry(entry.memory_type).or_insert(0) += 1;
            stats.total_active += 1;
        }
        stats.pending_learnings = state.pending.len() as u64;
        Ok(stats)
    }

    async fn save_message(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<i64, RepositoryError> {
        let mut state = self.state.write().await;
        let id = state.messages.last().map(|stored| stored.id + 1).unwrap_or(1);
        state.messages.push(StoredMessage {
            id,
            session_id: session_id.to_string(),
            message: message.clone(),
            summarized: false,
        });
        Ok(id)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        unsummarized_only: bool,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let state = self.state.read().await;
        let matching: Vec<&StoredMessage> = state
            .messages
            .iter()
            .filter(|stored| stored.session_id == session_id)
            .filter(|stored| !unsummarized_only || !stored.summarized)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn mark_messages_summarized(
        &self,
        session_id: &str,
        up_to_id: i64,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for stored in state.messages.iter_mut() {
            if stored.session_id == session_id && stored.id <= up_to_id && !stored.summarized {
                stored.summarized = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn save_pending(&self, pending: PendingLearning) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        state.pending.insert(pending.id.clone(), pending);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingLearning>, RepositoryError> {
        let state = self.state.read().await;
        let mut pending: Vec<PendingLearning> = state.pending.values().cloned().collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn remove_pending(&self, id: &str) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        Ok(state.pending.remove(id).is_some())
    }
}
