use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinSet;

use concierge_agent::{MemoryManager, MemorySettings};
use concierge_core::{MemoryEntry, MemoryType};
use concierge_db::{
    connect_with_settings, migrations, InMemoryMemoryStore, MemoryFilter, MemoryStore,
    SqlMemoryStore,
};

fn in_memory() -> (Arc<InMemoryMemoryStore>, MemoryManager) {
    let store = Arc::new(InMemoryMemoryStore::new());
    let manager = MemoryManager::new(store.clone(), MemorySettings::default()).expect("manager");
    (store, manager)
}

#[tokio::test]
async fn near_duplicate_fact_reinforces_existing_entry() {
    let (store, manager) = in_memory();

    let first = manager.remember_user_fact("u1", "likes coffee", "preferences", 0.6).await.expect("first");
    let second =
        manager.remember_user_fact("u1", "I like coffee", "preferences", 0.9).await.expect("second");

    assert_eq!(first.id, second.id);
    let active = store
        .search("", &MemoryFilter::of_type(MemoryType::User).for_user("u1"), 10)
        .await
        .expect("active facts");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "likes coffee");
    assert_eq!(active[0].confidence, 0.9);
    assert_eq!(active[0].access_count, 1);
}

#[tokio::test]
async fn concurrent_recalls_do_not_lose_access_updates() {
    let (store, manager) = in_memory();
    let manager = Arc::new(manager);
    let fact = manager.remember_user_fact("u1", "drinks oolong tea", "preferences", 0.8).await.expect("fact");

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let manager = manager.clone();
        tasks.spawn(async move { manager.recall("tea", Some("u1"), Some(MemoryType::User), 5).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let recalled = joined.expect("task completes").expect("recall succeeds");
        assert_eq!(recalled.len(), 1);
    }

    let stored = store.get(&fact.id).await.expect("get").expect("entry exists");
    assert_eq!(stored.access_count, 20);
    assert!(stored.last_accessed.is_some());
}

#[tokio::test]
async fn compaction_archives_and_merges_without_deleting() {
    let (store, manager) = in_memory();

    let mut stale = MemoryEntry::new("stale", MemoryType::Session, "old session note").with_session("s0");
    stale.updated_at = Utc::now() - Duration::days(60);
    store.save(stale).await.expect("stale saved");

    let strong = MemoryEntry::new("strong", MemoryType::User, "prefers dark mode")
        .with_user("u1")
        .with_confidence(0.9);
    let weak = MemoryEntry::new("weak", MemoryType::User, "prefers the dark mode")
        .with_user("u1")
        .with_confidence(0.5);
    store.save(strong).await.expect("strong saved");
    store.save(weak).await.expect("weak saved");

    let report = manager.compact(Some("u1")).await;

    assert_eq!(report.archived, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(report.failures, 0);

    let stale = store.get("stale").await.expect("get").expect("stale kept");
    assert!(stale.archived);
    let weak = store.get("weak").await.expect("get").expect("weak kept");
    assert!(weak.archived);
    let strong = store.get("strong").await.expect("get").expect("strong kept");
    assert!(!strong.archived);
    assert!(strong.source_ids.contains(&"weak".to_string()));

    let stats = manager.stats(None).await.expect("stats");
    assert_eq!(stats.total_archived, 2);
    assert_eq!(stats.total_active, 1);
}

#[tokio::test]
async fn pending_learnings_survive_a_new_manager_over_sql_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("memory.db").display());

    let pending_id = {
        let pool = connect_with_settings(&url, 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let manager = MemoryManager::new(Arc::new(SqlMemoryStore::new(pool.clone())), MemorySettings::default())
            .expect("manager");
        let pending = manager
            .propose_learning("Weekly reports go out on Fridays", "workflow", "observation", 0.7)
            .await
            .expect("proposed");
        pool.close().await;
        pending.id
    };

    let pool = connect_with_settings(&url, 1, 5).await.expect("reconnect");
    migrations::run_pending(&pool).await.expect("migrate");
    let manager =
        MemoryManager::new(Arc::new(SqlMemoryStore::new(pool)), MemorySettings::default()).expect("manager");

    let pending = manager.pending_learnings().await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, pending_id);

    let learned = manager.approve_learning(&pending_id).await.expect("approved");
    assert_eq!(learned.memory_type, MemoryType::Learned);
    let insights = manager
        .build_context("s1", None, "reports")
        .await
        .expect("context")
        .insights;
    assert_eq!(insights, vec!["Weekly reports go out on Fridays".to_string()]);
}

async fn sql_store(dir: &tempfile::TempDir) -> Arc<SqlMemoryStore> {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("memory.db").display());
    let pool = connect_with_settings(&url, 4, 5).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    Arc::new(SqlMemoryStore::new(pool))
}

async fn assert_archived_fact_is_revived(store: Arc<dyn MemoryStore>) {
    let manager = MemoryManager::new(store.clone(), MemorySettings::default()).expect("manager");
    let original = manager.remember_user_fact("u1", "likes coffee", "preferences", 0.8).await.expect("stored");
    for _ in 0..3 {
        manager.recall("coffee", Some("u1"), Some(MemoryType::User), 5).await.expect("recall");
    }

    let mut aged = store.get(&original.id).await.expect("get").expect("entry exists");
    aged.updated_at = Utc::now() - Duration::days(60);
    aged.source_ids = vec!["older".to_string()];
    store.save(aged).await.expect("backdated");
    assert_eq!(manager.compact(Some("u1")).await.archived, 1);
    let archived = store.get(&original.id).await.expect("get").expect("still stored");
    assert!(archived.archived);

    let again = manager.remember_user_fact("u1", "likes coffee", "preferences", 0.6).await.expect("stored again");

    assert_eq!(again.id, original.id);
    let revived = store.get(&original.id).await.expect("get").expect("entry exists");
    assert!(!revived.archived);
    assert_eq!(revived.access_count, 3);
    assert_eq!(revived.source_ids, vec!["older".to_string()]);
    assert_eq!(revived.created_at, archived.created_at);
    assert_eq!(revived.confidence, 0.8);
    assert!(revived.version > archived.version);

    let stats = manager.stats(Some("u1")).await.expect("stats");
    assert_eq!(stats.total_active, 1);
    assert_eq!(stats.total_archived, 0);
}

#[tokio::test]
async fn restoring_an_archived_fact_revives_it_in_place() {
    assert_archived_fact_is_revived(Arc::new(InMemoryMemoryStore::new())).await;
}

#[tokio::test]
async fn restoring_an_archived_fact_revives_it_in_place_over_sql_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert_archived_fact_is_revived(sql_store(&dir).await).await;
}

#[tokio::test]
async fn user_stats_only_count_that_users_archived_memories() {
    let (store, manager) = in_memory();
    manager.remember_user_fact("u1", "likes coffee", "preferences", 0.8).await.expect("u1 fact");
    let mut other = MemoryEntry::new("u2-old", MemoryType::User, "used to live in Oslo").with_user("u2");
    other.archived = true;
    store.save(other).await.expect("u2 archived");

    let first = manager.stats(Some("u1")).await.expect("u1 stats");
    assert_eq!(first.total_active, 1);
    assert_eq!(first.total_archived, 0);

    let second = manager.stats(Some("u2")).await.expect("u2 stats");
    assert_eq!(second.total_active, 0);
    assert_eq!(second.total_archived, 1);
}

#[tokio::test]
async fn concurrent_recalls_over_sql_store_count_every_access() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = sql_store(&dir).await;
    let manager = Arc::new(MemoryManager::new(store.clone(), MemorySettings::default()).expect("manager"));
    let fact = manager.remember_user_fact("u1", "drinks oolong tea", "preferences", 0.8).await.expect("fact");

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let manager = manager.clone();
        tasks.spawn(async move { manager.recall("tea", Some("u1"), Some(MemoryType::User), 5).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let recalled = joined.expect("task completes").expect("recall succeeds");
        assert_eq!(recalled.len(), 1);
    }

    let stored = store.get(&fact.id).await.expect("get").expect("entry exists");
    assert_eq!(stored.access_count, 10);
    assert!(stored.last_accessed.is_some());
}
