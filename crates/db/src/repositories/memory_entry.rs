use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::Row;

use concierge_core::domain::memory::{
    MemoryEntry, MemoryStats, MemoryType, Message, PendingLearning, Role, StoredMessage,
};

use super::{limit_as_i64, MemoryFilter, MemoryStore, RepositoryError};
use crate::DbPool;

const ENTRY_COLUMNS: &str = "id, memory_type, content, metadata_json, created_at, updated_at,
    session_id, user_id, confidence, approved, access_count, last_accessed,
    source_ids_json, archived, version";

pub struct SqlMemoryStore {
    pool: DbPool,
}

impl SqlMemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Fixed-width UTC timestamps so text comparison orders them chronologically.
fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp `{value}`: {e}")))
}

fn parse_object(value: &str) -> Result<Map<String, Value>, RepositoryError> {
    serde_json::from_str(value).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryEntry, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let memory_type: String =
        row.try_get("memory_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let session_id: Option<String> =
        row.try_get("session_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_id: Option<String> =
        row.try_get("user_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let confidence: f64 =
        row.try_get("confidence").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let approved: bool =
        row.try_get("approved").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let access_count: i64 =
        row.try_get("access_count").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let last_accessed: Option<String> =
        row.try_get("last_accessed").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source_ids_json: String =
        row.try_get("source_ids_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let archived: bool =
        row.try_get("archived").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 =
        row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(MemoryEntry {
        id,
        memory_type: memory_type
            .parse::<MemoryType>()
            .map_err(|e| RepositoryError::Decode(e.to_string()))?,
        content,
        metadata: parse_object(&metadata_json)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        session_id,
        user_id,
        confidence,
        approved,
        access_count: u32::try_from(access_count).unwrap_or(u32::MAX),
        last_accessed: last_accessed.as_deref().map(parse_timestamp).transpose()?,
        source_ids: serde_json::from_str(&source_ids_json)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?,
        archived,
        version,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let session_id: String =
        row.try_get("session_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let role: String = row.try_get("role").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let summarized: bool =
        row.try_get("summarized").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(StoredMessage {
        id,
        session_id,
        message: Message {
            role: role.parse::<Role>().map_err(|e| RepositoryError::Decode(e.to_string()))?,
            content,
            timestamp: parse_timestamp(&created_at)?,
            metadata: parse_object(&metadata_json)?,
        },
        summarized,
    })
}

fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> Result<PendingLearning, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let category: String =
        row.try_get("category").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source: String =
        row.try_get("source").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let confidence: f64 =
        row.try_get("confidence").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(PendingLearning {
        id,
        content,
        category,
        source,
        confidence,
        metadata: parse_object(&metadata_json)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait::async_trait]
impl MemoryStore for SqlMemoryStore {
    async fn save(&self, entry: MemoryEntry) -> Result<i64, RepositoryError> {
        let row = sqlx::query(
            "INSERT INTO memory_entries (id, memory_type, content, metadata_json, created_at,
                                         updated_at, session_id, user_id, confidence, approved,
                                         access_count, last_accessed, source_ids_json, archived,
                                         version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(id) DO UPDATE SET
                 memory_type = excluded.memory_type,
                 content = excluded.content,
                 metadata_json = excluded.metadata_json,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at,
                 session_id = excluded.session_id,
                 user_id = excluded.user_id,
                 confidence = excluded.confidence,
                 approved = excluded.approved,
                 access_count = excluded.access_count,
                 last_accessed = excluded.last_accessed,
                 source_ids_json = excluded.source_ids_json,
                 archived = excluded.archived,
                 version = memory_entries.version + 1
             RETURNING version",
        )
        .bind(&entry.id)
        .bind(entry.memory_type.as_str())
        .bind(&entry.content)
        .bind(encode_json(&entry.metadata)?)
        .bind(timestamp(&entry.created_at))
        .bind(timestamp(&entry.updated_at))
        .bind(&entry.session_id)
        .bind(&entry.user_id)
        .bind(entry.confidence)
        .bind(entry.approved)
        .bind(i64::from(entry.access_count))
        .bind(entry.last_accessed.as_ref().map(timestamp))
        .bind(encode_json(&entry.source_ids)?)
        .bind(entry.archived)
        .fetch_one(&self.pool)
        .await?;

        row.try_get::<i64, _>("version").map_err(|e| RepositoryError::Decode(e.to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM memory_entries WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_entry(r)?)),
            None => Ok(None),
        }
    }

    async fn search(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<MemoryEntry>, RepositoryError> {
        let needle = query.trim().to_lowercase();
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM memory_entries
             WHERE (? OR archived = 0)
               AND (? = 0 OR approved = 1)
               AND (? IS NULL OR memory_type = ?)
               AND (? IS NULL OR user_id = ?)
               AND (? IS NULL OR session_id = ?)
               AND (? = '' OR instr(lower(content), ?) > 0)
             ORDER BY updated_at DESC, id ASC
             LIMIT ?"
        ))
        .bind(filter.include_archived)
        .bind(filter.approved_only)
        .bind(filter.memory_type.map(|t| t.as_str()))
        .bind(filter.memory_type.map(|t| t.as_str()))
        .bind(&filter.user_id)
        .bind(&filter.user_id)
        .bind(&filter.session_id)
        .bind(&filter.session_id)
        .bind(&needle)
        .bind(&needle)
        .bind(limit_as_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM memory_entries WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_session(&self, session_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError> {
        self.search("", &MemoryFilter::default().for_session(session_id), usize::MAX).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<MemoryEntry>, RepositoryError> {
        self.search("", &MemoryFilter::default().for_user(user_id), usize::MAX).await
    }

    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE memory_entries
             SET archived = 1, version = version + 1
             WHERE archived = 0 AND updated_at < ?",
        )
        .bind(timestamp(&cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, user_id: Option<&str>) -> Result<MemoryStats, RepositoryError> {
        let rows = sqlx::query(
            "SELECT memory_type, COUNT(*) AS count FROM memory_entries
             WHERE archived = 0 AND (? IS NULL OR user_id = ?)
             GROUP BY memory_type",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = MemoryStats::default();
        for row in &rows {
            let memory_type: String =
                row.try_get("memory_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let count: i64 =
                row.try_get("count").map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let memory_type = memory_type
                .parse::<MemoryType>()
                .map_err(|e| RepositoryError::Decode(e.to_string()))?;
            let count = u64::try_from(count).unwrap_or(0);
            stats.by_type.insert(memory_type, count);
            stats.total_active += count;
        }

        let (archived,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM memory_entries WHERE archived = 1 AND (? IS NULL OR user_id = ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_learnings")
            .fetch_one(&self.pool)
            .await?;
        stats.total_archived = u64::try_from(archived).unwrap_or(0);
        stats.pending_learnings = u64::try_from(pending).unwrap_or(0);

        Ok(stats)
    }

    async fn save_message(
        &self,
        session_id: &str,
        message: &Message,
    ) -> Result<i64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO session_messages (session_id, role, content, created_at, metadata_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(timestamp(&message.timestamp))
        .bind(encode_json(&message.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: usize,
        unsummarized_only: bool,
    ) -> Result<Vec<StoredMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, session_id, role, content, created_at, metadata_json, summarized
             FROM (
                 SELECT * FROM session_messages
                 WHERE session_id = ? AND (? = 0 OR summarized = 0)
                 ORDER BY id DESC
                 LIMIT ?
             )
             ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(unsummarized_only)
        .bind(limit_as_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn mark_messages_summarized(
        &self,
        session_id: &str,
        up_to_id: i64,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE session_messages SET summarized = 1
             WHERE session_id = ? AND id <= ? AND summarized = 0",
        )
        .bind(session_id)
        .bind(up_to_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn save_pending(&self, pending: PendingLearning) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO pending_learnings (id, content, category, source, confidence,
                                            metadata_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 category = excluded.category,
                 source = excluded.source,
                 confidence = excluded.confidence,
                 metadata_json = excluded.metadata_json",
        )
        .bind(&pending.id)
        .bind(&pending.content)
        .bind(&pending.category)
        .bind(&pending.source)
        .bind(pending.confidence)
        .bind(encode_json(&pending.metadata)?)
        .bind(timestamp(&pending.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingLearning>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, content, category, source, confidence, metadata_json, created_at
             FROM pending_learnings
             ORDER BY created_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_pending).collect()
    }

    async fn remove_pending(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM pending_learnings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Map};

    use concierge_core::domain::memory::{MemoryEntry, MemoryType, Message, PendingLearning};

    use super::SqlMemoryStore;
    use crate::repositories::{MemoryFilter, MemoryStore};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn pending(id: &str, content: &str) -> PendingLearning {
        PendingLearning {
            id: id.to_string(),
            content: content.to_string(),
            category: "workflow".to_string(),
            source: "observation".to_string(),
            confidence: 0.8,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_bumps_version_and_preserves_fields() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        let entry = MemoryEntry::new("m-1", MemoryType::User, "prefers dark mode")
            .with_user("u-1")
            .with_confidence(0.7)
            .with_metadata("category", json!("preferences"))
            .with_source_ids(vec!["m-0".to_string()]);

        assert_eq!(store.save(entry.clone()).await.expect("insert"), 1);
        let mut updated = entry;
        updated.confidence = 0.9;
        updated.access_count = 3;
        assert_eq!(store.save(updated).await.expect("update"), 2);

        let found = store.get("m-1").await.expect("get").expect("entry exists");
        assert_eq!(found.version, 2);
        assert_eq!(found.confidence, 0.9);
        assert_eq!(found.access_count, 3);
        assert_eq!(found.category(), Some("preferences"));
        assert_eq!(found.source_ids, vec!["m-0".to_string()]);
        assert_eq!(found.user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn search_orders_newest_first_and_filters() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        let mut older = MemoryEntry::new("m-old", MemoryType::User, "likes Coffee").with_user("u-1");
        older.updated_at = Utc::now() - Duration::hours(2);
        let newer = MemoryEntry::new("m-new", MemoryType::User, "drinks coffee daily").with_user("u-1");
        let unapproved = MemoryEntry::new("l-1", MemoryType::Learned, "coffee matters")
            .with_approval(false);
        store.save(older).await.expect("save older");
        store.save(newer).await.expect("save newer");
        store.save(unapproved).await.expect("save learned");

        let users = store
            .search("COFFEE", &MemoryFilter::of_type(MemoryType::User).for_user("u-1"), 10)
            .await
            .expect("search");
        let ids: Vec<&str> = users.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["m-new", "m-old"]);

        let approved = store
            .search("", &MemoryFilter::of_type(MemoryType::Learned).approved(), 10)
            .await
            .expect("search learned");
        assert!(approved.is_empty());
    }

    #[tokio::test]
    async fn archive_hides_from_search_but_not_get() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        let mut stale = MemoryEntry::new("m-stale", MemoryType::User, "old fact").with_user("u-1");
        stale.updated_at = Utc::now() - Duration::days(40);
        store.save(stale).await.expect("save");

        let archived =
            store.archive_older_than(Utc::now() - Duration::days(30)).await.expect("archive");
        assert_eq!(archived, 1);

        assert!(store.list_by_user("u-1").await.expect("list").is_empty());
        let entry = store.get("m-stale").await.expect("get").expect("still stored");
        assert!(entry.archived);
        assert_eq!(entry.version, 2);

        let stats = store.stats(Some("u-1")).await.expect("stats");
        assert_eq!(stats.total_active, 0);
        assert_eq!(stats.total_archived, 1);
    }

    #[tokio::test]
    async fn message_log_windows_and_marks_summarized() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        let mut ids = Vec::new();
        for turn in 0..4 {
            ids.push(
                store
                    .save_message("s-1", &Message::user(format!("turn {turn}")))
                    .await
                    .expect("save message"),
            );
        }

        let window = store.get_messages("s-1", 3, false).await.expect("window");
        let contents: Vec<&str> = window.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 1", "turn 2", "turn 3"]);

        let marked = store.mark_messages_summarized("s-1", ids[1]).await.expect("mark");
        assert_eq!(marked, 2);
        let unsummarized = store.get_messages("s-1", 10, true).await.expect("unsummarized");
        assert_eq!(unsummarized.len(), 2);
        assert!(unsummarized.iter().all(|m| !m.summarized));
    }

    #[tokio::test]
    async fn pending_learnings_round_trip_and_remove() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        store.save_pending(pending("p-1", "users prefer short answers")).await.expect("save");

        let listed = store.list_pending().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].category, "workflow");

        assert!(store.remove_pending("p-1").await.expect("remove"));
        assert!(!store.remove_pending("p-1").await.expect("remove again"));
        assert_eq!(store.stats(None).await.expect("stats").pending_learnings, 0);
    }

    #[tokio::test]
    async fn pending_learnings_survive_reopen() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("memory.db").display());

        {
            let pool = connect_with_settings(&url, 1, 30).await.expect("connect");
            migrations::run_pending(&pool).await.expect("migrations");
            SqlMemoryStore::new(pool.clone())
                .save_pending(pending("p-durable", "remember to confirm deletes"))
                .await
                .expect("save pending");
            pool.close().await;
        }

        let pool = connect_with_settings(&url, 1, 30).await.expect("reconnect");
        migrations::run_pending(&pool).await.expect("migrations are idempotent");
        let listed = SqlMemoryStore::new(pool).list_pending().await.expect("list");

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p-durable");
    }

    #[tokio::test]
    async fn user_stats_count_only_that_users_archived_entries() {
        let pool = setup().await;
        let store = SqlMemoryStore::new(pool);
        let mut archived = MemoryEntry::new("m-2", MemoryType::User, "used to like tea").with_user("u-2");
        archived.archived = true;
        store
            .save(MemoryEntry::new("m-1", MemoryType::User, "likes coffee").with_user("u-1"))
            .await
            .expect("save");
        store.save(archived).await.expect("save archived");

        let first = store.stats(Some("u-1")).await.expect("stats u-1");
        assert_eq!(first.total_active, 1);
        assert_eq!(first.total_archived, 0);

        let second = store.stats(Some("u-2")).await.expect("stats u-2");
        assert_eq!(second.total_archived, 1);
        assert_eq!(store.stats(None).await.expect("stats").total_archived, 1);
    }
}
