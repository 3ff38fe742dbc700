//! Memory policy: summarization, deduplication, relevance-ranked recall, approval-gated
//! learning, and compaction on top of a [`MemoryStore`].

pub mod dedup;
pub mod facts;
pub mod relevance;
pub mod summarizer;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::OwnedMutexGuard;

use concierge_core::config::MemoryConfig;
use concierge_core::similarity::{entry_id, text_similarity};
use concierge_core::{
    ApplicationError, DomainError, MemoryEntry, MemoryStats, MemoryType, Message, PendingLearning,
    RequestContext,
};
use concierge_db::{MemoryFilter, MemoryStore, RepositoryError};

use crate::llm::LlmClient;

use self::facts::{FactExtractor, EXTRACTED_FACT_CONFIDENCE};
use self::summarizer::MemorySummarizer;

const USER_FACT_RECALL_LIMIT: usize = 10;
const INSIGHT_RECALL_LIMIT: usize = 5;
const RECALL_OVERFETCH: usize = 3;
const CONSOLIDATION_MIN_GROUP: usize = 3;
const CONSOLIDATION_KEEP: usize = 2;
const DEFAULT_CATEGORY: &str = "general";

#[derive(Clone, Debug, PartialEq)]
pub struct MemorySettings {
    pub max_session_messages: usize,
    pub keep_recent_messages: usize,
    pub max_user_memories: usize,
    pub similarity_threshold: f64,
    pub archive_after_days: i64,
    pub history_limit: usize,
    /// Summarize sessions and consolidate user facts as thresholds are crossed.
    pub auto_compact: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_session_messages: 50,
            keep_recent_messages: 10,
            max_user_memories: 100,
            similarity_threshold: 0.75,
            archive_after_days: 30,
            history_limit: 10,
            auto_compact: true,
        }
    }
}

impl From<&MemoryConfig> for MemorySettings {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            max_session_messages: config.max_session_messages as usize,
            keep_recent_messages: config.keep_recent_messages as usize,
            max_user_memories: config.max_user_memories as usize,
            similarity_threshold: config.similarity_threshold,
            archive_after_days: i64::from(config.archive_after_days),
            history_limit: config.history_limit as usize,
            auto_compact: true,
        }
    }
}

/// Everything memory contributes to a single request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MemoryContext {
    /// Recent turns rendered as `role: content`, oldest first.
    pub conversation_history: Vec<String>,
    pub session_summary: Option<String>,
    pub user_facts: Vec<String>,
    pub insights: Vec<String>,
}

impl MemoryContext {
    pub fn into_request_context(self) -> RequestContext {
        let mut context = RequestContext::new();
        context.insert("conversation_history".to_string(), json!(self.conversation_history));
        context.insert(
            "session_summary".to_string(),
            self.session_summary.map(Value::String).unwrap_or(Value::Null),
        );
        context.insert("user_facts".to_string(), json!(self.user_facts));
        context.insert("insights".to_string(), json!(self.insights));
        context
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub archived: u64,
    pub merged: u64,
    pub failures: u64,
}

/// Per-key async mutexes; idle keys are pruned on the next acquisition.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    summarizer: MemorySummarizer,
    facts: FactExtractor,
    settings: MemorySettings,
    locks: KeyedLocks,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, settings: MemorySettings) -> Result<Self, DomainError> {
        if settings.keep_recent_messages >= settings.max_session_messages {
            return Err(DomainError::InvariantViolation(format!(
                "keep_recent_messages ({}) must be below max_session_messages ({})",
                settings.keep_recent_messages, settings.max_session_messages
            )));
        }
        if !(0.0..=1.0).contains(&settings.similarity_threshold) {
            return Err(DomainError::InvariantViolation(format!(
                "similarity_threshold must be within [0, 1], got {}",
                settings.similarity_threshold
            )));
        }

        Ok(Self {
            store,
            summarizer: MemorySummarizer::default(),
            facts: FactExtractor::new()?,
            settings,
            locks: KeyedLocks::default(),
        })
    }

    /// Summaries and fact consolidation go through `llm` instead of the heuristics.
    pub fn with_summarizer(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.summarizer = MemorySummarizer::new(Some(llm));
        self
    }

    pub fn summarizes_with_llm(&self) -> bool {
        self.summarizer.has_llm()
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub async fn add_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<i64, ApplicationError> {
        let id = self.store.save_message(session_id, &message).await?;
        if self.settings.auto_compact {
            self.maybe_summarize_session(session_id).await;
        }
        Ok(id)
    }

    /// Summarizes everything but the most recent turns once the unsummarized backlog
    /// exceeds the session limit. Failures are logged; the caller's write already succeeded.
    async fn maybe_summarize_session(&self, session_id: &str) {
        let _guard = self.locks.lock(&format!("session:{session_id}")).await;

        let pending = match self.store.get_messages(session_id, usize::MAX, true).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(
                    event_name = "agent.memory.summarize_failed",
                    session_id,
                    error = %err,
                    "could not load session backlog"
                );
                return;
            }
        };
        if pending.len() <= self.settings.max_session_messages {
            return;
        }

        let cut = pending.len() - self.settings.keep_recent_messages;
        let to_summarize = &pending[..cut];
        let Some(up_to_id) = to_summarize.last().map(|stored| stored.id) else {
            return;
        };
        let summary = self.summarizer.summarize_session(to_summarize).await;
        if summary.is_empty() {
            return;
        }

        let entry = MemoryEntry::new(
            entry_id(Some(session_id), &format!("{up_to_id}:{summary}")),
            MemoryType::Summary,
            summary,
        )
        .with_session(session_id)
        .with_metadata("session_id", json!(session_id))
        .with_metadata("message_count", json!(to_summarize.len()))
        .with_metadata("up_to_message_id", json!(up_to_id));

        let result: Result<u64, RepositoryError> = async {
            self.store.save(entry).await?;
            self.store.mark_messages_summarized(session_id, up_to_id).await
        }
        .await;
        match result {
            Ok(marked) => tracing::info!(
                event_name = "agent.memory.summarized",
                session_id,
                summarized_messages = marked,
                kept_messages = self.settings.keep_recent_messages,
                "session backlog summarized"
            ),
            Err(err) => tracing::warn!(
                event_name = "agent.memory.summarize_failed",
                session_id,
                error = %err,
                "could not persist session summary"
            ),
        }
    }

    /// Stores a fact about `user_id`, folding it into an existing near-duplicate when one exists.
    pub async fn remember_user_fact(
        &self,
        user_id: &str,
        fact: &str,
        category: &str,
        confidence: f64,
    ) -> Result<MemoryEntry, ApplicationError> {
        let fact = fact.trim();
        if let Some(updated) = self.reinforce_similar_fact(user_id, fact, confidence).await? {
            return Ok(updated);
        }

        let id = entry_id(Some(user_id), fact);
        let entry = {
            let _guard = self.locks.lock(&id).await;
            match self.store.get(&id).await? {
                Some(existing) => self.revive_fact(existing, category, confidence).await?,
                None => {
                    let mut entry = MemoryEntry::new(id, MemoryType::User, fact)
                        .with_user(user_id)
                        .with_confidence(confidence)
                        .with_metadata("category", json!(category));
                    entry.version = self.store.save(entry.clone()).await?;
                    tracing::debug!(
                        event_name = "agent.memory.fact_stored",
                        user_id,
                        entry_id = %entry.id,
                        category,
                        "user fact stored"
                    );
                    entry
                }
            }
        };

        if self.settings.auto_compact {
            self.maybe_consolidate_user(user_id).await;
        }
        Ok(entry)
    }

    /// Brings a stored entry with the same id back into use. History, provenance and the
    /// original creation time are kept. Caller holds the entry lock.
    async fn revive_fact(
        &self,
        mut existing: MemoryEntry,
        category: &str,
        confidence: f64,
    ) -> Result<MemoryEntry, ApplicationError> {
        let was_archived = existing.archived;
        existing.archived = false;
        existing.confidence = existing.confidence.max(confidence.clamp(0.0, 1.0));
        existing.updated_at = Utc::now();
        if existing.category().is_none() {
            existing.metadata.insert("category".to_string(), json!(category));
        }
        existing.version = self.store.save(existing.clone()).await?;
        tracing::debug!(
            event_name = "agent.memory.fact_revived",
            entry_id = %existing.id,
            was_archived,
            "stored fact reused instead of overwritten"
        );
        Ok(existing)
    }

    async fn reinforce_similar_fact(
        &self,
        user_id: &str,
        fact: &str,
        confidence: f64,
    ) -> Result<Option<MemoryEntry>, ApplicationError> {
        let candidates = self
            .store
            .search("", &MemoryFilter::of_type(MemoryType::User).for_user(user_id), usize::MAX)
            .await?;
        let best = candidates
            .iter()
            .map(|entry| (entry, text_similarity(&entry.content, fact)))
            .filter(|(_, similarity)| *similarity >= self.settings.similarity_threshold)
            .max_by(|left, right| left.1.total_cmp(&right.1))
            .map(|(entry, _)| entry.id.clone());
        let Some(existing_id) = best else {
            return Ok(None);
        };

        let _guard = self.locks.lock(&existing_id).await;
        let Some(mut existing) = self.store.get(&existing_id).await? else {
            return Ok(None);
        };
        if existing.archived {
            return Ok(None);
        }

        let now = Utc::now();
        existing.confidence = existing.confidence.max(confidence.clamp(0.0, 1.0));
        existing.touch(now);
        existing.updated_at = now;
        existing.version = self.store.save(existing.clone()).await?;
        tracing::debug!(
            event_name = "agent.memory.fact_reinforced",
            user_id,
            entry_id = %existing.id,
            "near-duplicate fact reinforced instead of inserted"
        );
        Ok(Some(existing))
    }

    async fn maybe_consolidate_user(&self, user_id: &str) {
        let filter = MemoryFilter::of_type(MemoryType::User).for_user(user_id);
        let active = match self.store.search("", &filter, usize::MAX).await {
            Ok(active) => active,
            Err(err) => {
                tracing::warn!(
                    event_name = "agent.memory.consolidation_failed",
                    user_id,
                    error = %err,
                    "could not load user facts"
                );
                return;
            }
        };
        if active.len() <= self.settings.max_user_memories {
            return;
        }

        let mut by_category: BTreeMap<String, Vec<MemoryEntry>> = BTreeMap::new();
        for entry in active {
            let category = entry.category().unwrap_or(DEFAULT_CATEGORY).to_string();
            by_category.entry(category).or_default().push(entry);
        }

        let mut archived = 0_u64;
        for (category, mut group) in by_category {
            if group.len() < CONSOLIDATION_MIN_GROUP {
                continue;
            }

            let dropped: Vec<MemoryEntry> = match self.summarizer.consolidate_facts(&group).await {
                Some(summary) => {
                    let mean = group.iter().map(|entry| entry.confidence).sum::<f64>() / group.len() as f64;
                    let consolidated = MemoryEntry::new(entry_id(Some(user_id), &summary), MemoryType::User, summary)
                        .with_user(user_id)
                        .with_confidence(mean)
                        .with_metadata("category", json!(category))
                        .with_metadata("consolidated_from", json!(group.len()))
                        .with_source_ids(group.iter().map(|entry| entry.id.clone()).collect());
                    let consolidated_id = consolidated.id.clone();
                    if let Err(err) = self.store.save(consolidated).await {
                        tracing::warn!(
                            event_name = "agent.memory.consolidation_failed",
                            user_id,
                            category = %category,
                            error = %err,
                            "could not store consolidated fact"
                        );
                        continue;
                    }
                    group.into_iter().filter(|entry| entry.id != consolidated_id).collect()
                }
                None => {
                    group.sort_by(|left, right| right.confidence.total_cmp(&left.confidence));
                    group.split_off(CONSOLIDATION_KEEP.min(group.len()))
                }
            };

            for entry in dropped {
                match self.archive_entry(&entry.id).await {
                    Ok(true) => archived += 1,
                    Ok(false) => {}
                    Err(err) => tracing::warn!(
                        event_name = "agent.memory.consolidation_failed",
                        user_id,
                        entry_id = %entry.id,
                        error = %err,
                        "could not archive consolidated fact"
                    ),
                }
            }
        }

        tracing::info!(
            event_name = "agent.memory.consolidated",
            user_id,
            archived,
            "user facts consolidated"
        );
    }

    async fn archive_entry(&self, id: &str) -> Result<bool, ApplicationError> {
        let _guard = self.locks.lock(id).await;
        let Some(mut entry) = self.store.get(id).await? else {
            return Ok(false);
        };
        if entry.archived {
            return Ok(false);
        }
        entry.archived = true;
        self.store.save(entry).await?;
        Ok(true)
    }

    /// Persists an insight as pending; it only becomes learned memory once approved.
    pub async fn propose_learning(
        &self,
        insight: &str,
        category: &str,
        source: &str,
        confidence: f64,
    ) -> Result<PendingLearning, ApplicationError> {
        let insight = insight.trim();
        let mut metadata = serde_json::Map::new();
        metadata.insert("category".to_string(), json!(category));
        metadata.insert("source".to_string(), json!(source));

        let pending = PendingLearning {
            id: entry_id(None, insight),
            content: insight.to_string(),
            category: category.to_string(),
            source: source.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            metadata,
            created_at: Utc::now(),
        };
        self.store.save_pending(pending.clone()).await?;
        tracing::info!(
            event_name = "agent.memory.learning_proposed",
            learning_id = %pending.id,
            category,
            source,
            "learning proposed for approval"
        );
        Ok(pending)
    }

    pub async fn approve_learning(&self, id: &str) -> Result<MemoryEntry, ApplicationError> {
        let pending = self
            .store
            .list_pending()
            .await?
            .into_iter()
            .find(|pending| pending.id == id)
            .ok_or_else(|| DomainError::UnknownPendingLearning(id.to_string()))?;

        let mut entry = MemoryEntry::new(pending.id.clone(), MemoryType::Learned, pending.content)
            .with_confidence(pending.confidence)
            .with_approval(true);
        entry.metadata = pending.metadata;
        entry.created_at = pending.created_at;

        {
            let _guard = self.locks.lock(&entry.id).await;
            entry.version = self.store.save(entry.clone()).await?;
        }
        self.store.remove_pending(id).await?;
        tracing::info!(event_name = "agent.memory.learning_approved", learning_id = id, "learning approved");
        Ok(entry)
    }

    pub async fn reject_learning(&self, id: &str) -> Result<bool, ApplicationError> {
        let removed = self.store.remove_pending(id).await?;
        if removed {
            tracing::info!(event_name = "agent.memory.learning_rejected", learning_id = id, "learning rejected");
        }
        Ok(removed)
    }

    pub async fn pending_learnings(&self) -> Result<Vec<PendingLearning>, ApplicationError> {
        Ok(self.store.list_pending().await?)
    }

    /// Relevance-ranked recall over approved, active entries. Each returned entry has its
    /// access counter bumped.
    pub async fn recall(
        &self,
        query: &str,
        user_id: Option<&str>,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, ApplicationError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut filter = MemoryFilter::default().approved();
        filter.memory_type = memory_type;
        filter.user_id = user_id.map(str::to_string);
        let mut candidates =
            self.store.search("", &filter, limit.saturating_mul(RECALL_OVERFETCH)).await?;

        let now = Utc::now();
        relevance::rank(&mut candidates, query, now);
        candidates.truncate(limit);

        let mut recalled = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let _guard = self.locks.lock(&candidate.id).await;
            let Some(mut current) = self.store.get(&candidate.id).await? else {
                continue;
            };
            current.touch(now);
            current.version = self.store.save(current.clone()).await?;
            recalled.push(current);
        }
        Ok(recalled)
    }

    pub async fn build_context(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        query: &str,
    ) -> Result<MemoryContext, ApplicationError> {
        let conversation_history = self
            .store
            .get_messages(session_id, self.settings.history_limit, false)
            .await?
            .into_iter()
            .map(|stored| format!("{}: {}", stored.message.role.as_str(), stored.message.content))
            .collect();

        let session_summary = self
            .store
            .search("", &MemoryFilter::of_type(MemoryType::Summary).for_session(session_id), 1)
            .await?
            .into_iter()
            .next()
            .map(|entry| entry.content);

        let user_facts = match user_id {
            Some(user_id) => self
                .recall(query, Some(user_id), Some(MemoryType::User), USER_FACT_RECALL_LIMIT)
                .await?
                .into_iter()
                .map(|entry| entry.content)
                .collect(),
            None => Vec::new(),
        };

        let insights = self
            .recall(query, None, Some(MemoryType::Learned), INSIGHT_RECALL_LIMIT)
            .await?
            .into_iter()
            .map(|entry| entry.content)
            .collect();

        Ok(MemoryContext { conversation_history, session_summary, user_facts, insights })
    }

    /// Appends both turns of an exchange and, when asked, mines the user turn for facts.
    pub async fn record_interaction(
        &self,
        session_id: &str,
        user_input: &str,
        response: &str,
        user_id: Option<&str>,
        extract_facts: bool,
    ) -> Result<(), ApplicationError> {
        self.add_message(session_id, Message::user(user_input)).await?;
        self.add_message(session_id, Message::assistant(response)).await?;

        if let (true, Some(user_id)) = (extract_facts, user_id) {
            self.extract_user_facts(user_input, user_id).await?;
        }
        Ok(())
    }

    pub async fn extract_user_facts(
        &self,
        text: &str,
        user_id: &str,
    ) -> Result<Vec<MemoryEntry>, ApplicationError> {
        let mut stored = Vec::new();
        for fact in self.facts.extract(text) {
            stored.push(
                self.remember_user_fact(user_id, &fact.content, &fact.category, EXTRACTED_FACT_CONFIDENCE)
                    .await?,
            );
        }
        Ok(stored)
    }

    /// Archives stale entries and, for `user_id`, merges near-duplicate facts. Nothing is
    /// deleted. Individual failures are counted and logged rather than returned.
    pub async fn compact(&self, user_id: Option<&str>) -> CompactionReport {
        let mut report = CompactionReport::default();

        let cutoff = Utc::now() - Duration::days(self.settings.archive_after_days);
        match self.store.archive_older_than(cutoff).await {
            Ok(archived) => report.archived = archived,
            Err(err) => {
                report.failures += 1;
                tracing::warn!(
                    event_name = "agent.memory.compaction_failed",
                    stage = "archive",
                    error = %err,
                    "could not archive stale entries"
                );
            }
        }

        if let Some(user_id) = user_id {
            self.merge_duplicates(user_id, &mut report).await;
        }

        tracing::info!(
            event_name = "agent.memory.compacted",
            user_id = user_id.unwrap_or_default(),
            archived = report.archived,
            merged = report.merged,
            failures = report.failures,
            "memory compaction finished"
        );
        report
    }

    async fn merge_duplicates(&self, user_id: &str, report: &mut CompactionReport) {
        let filter = MemoryFilter::of_type(MemoryType::User).for_user(user_id);
        let active = match self.store.search("", &filter, usize::MAX).await {
            Ok(active) => active,
            Err(err) => {
                report.failures += 1;
                tracing::warn!(
                    event_name = "agent.memory.compaction_failed",
                    stage = "dedup",
                    user_id,
                    error = %err,
                    "could not load user facts"
                );
                return;
            }
        };

        let mut consumed: HashSet<String> = HashSet::new();
        for pair in dedup::find_duplicates(&active, self.settings.similarity_threshold) {
            if consumed.contains(&pair.first) || consumed.contains(&pair.second) {
                continue;
            }
            match self.merge_pair(&pair.first, &pair.second).await {
                Ok(Some(subsumed_id)) => {
                    report.merged += 1;
                    consumed.insert(subsumed_id);
                }
                Ok(None) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(
                        event_name = "agent.memory.compaction_failed",
                        stage = "merge",
                        first = %pair.first,
                        second = %pair.second,
                        error = %err,
                        "could not merge duplicate facts"
                    );
                }
            }
        }
    }

    /// Returns the id of the archived entry when a merge happened.
    async fn merge_pair(&self, first: &str, second: &str) -> Result<Option<String>, ApplicationError> {
        let (low, high) = if first <= second { (first, second) } else { (second, first) };
        let _low = self.locks.lock(low).await;
        let _high = self.locks.lock(high).await;

        let (Some(left), Some(right)) = (self.store.get(first).await?, self.store.get(second).await?)
        else {
            return Ok(None);
        };
        if left.archived || right.archived {
            return Ok(None);
        }

        let (merged, subsumed) = dedup::merge_entries(left, right, Utc::now());
        let subsumed_id = subsumed.id.clone();
        self.store.save(merged).await?;
        self.store.save(subsumed).await?;
        Ok(Some(subsumed_id))
    }

    pub async fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats, ApplicationError> {
        Ok(self.store.stats(user_id).await?)
    }
}
