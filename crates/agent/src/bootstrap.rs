use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use concierge_core::config::{AppConfig, ConfigError, LoadOptions, LogFormat, LoggingConfig};
use concierge_core::{CatalogError, DomainError, IntentCatalog};
use concierge_db::{connect_with_config, migrations, DbPool, SqlMemoryStore};

use crate::classifier::{IntentClassifier, LlmClassifier};
use crate::ensemble::{EnsembleClassifier, EnsembleSettings};
use crate::llm::{DisabledLlmClient, HttpLlmClient, LlmClient, LlmError};
use crate::memory::{MemoryManager, MemorySettings};
use crate::router::{Router, RouterSettings};
use crate::rules::RuleScorer;

/// Fully wired services. Register handlers on `router` before sharing it.
pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub catalog: Arc<IntentCatalog>,
    pub classifier: Arc<EnsembleClassifier>,
    pub memory: Arc<MemoryManager>,
    pub router: Router,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("invalid component settings: {0}")]
    Settings(#[from] DomainError),
    #[error("inference client setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the configured level.
/// Calling it again is a no-op.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    let installed = match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!(event_name = "system.logging.already_installed", "subscriber already set");
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let catalog = Arc::new(IntentCatalog::with_default_intents()?);
    if let Some(path) = &config.classifier.custom_intents_file {
        let loaded = catalog.load_file(path)?;
        info!(
            event_name = "system.bootstrap.custom_intents_loaded",
            path = %path.display(),
            loaded,
            "custom intents registered"
        );
    }

    let llm: Arc<dyn LlmClient> = if config.llm.enabled {
        Arc::new(HttpLlmClient::new(&config.llm)?)
    } else {
        Arc::new(DisabledLlmClient)
    };

    let rule: Arc<dyn IntentClassifier> = Arc::new(RuleScorer::new(catalog.clone())?);
    let llm_classifier: Arc<dyn IntentClassifier> = Arc::new(LlmClassifier::new(
        catalog.clone(),
        llm.clone(),
        Duration::from_secs(config.llm.timeout_secs.max(1)),
    ));
    let classifier = Arc::new(EnsembleClassifier::new(
        catalog.clone(),
        rule,
        llm_classifier,
        EnsembleSettings::from_config(&config.classifier),
    )?);

    let store = Arc::new(SqlMemoryStore::new(db_pool.clone()));
    let mut memory = MemoryManager::new(store, MemorySettings::from(&config.memory))?;
    if config.llm.enabled {
        memory = memory.with_summarizer(llm);
    }
    let memory = Arc::new(memory);

    let router = Router::new(catalog.clone(), classifier.clone(), RouterSettings::from(&config.router))?
        .with_memory(memory.clone());

    info!(
        event_name = "system.bootstrap.ready",
        intents = catalog.len(),
        strategy = config.classifier.strategy.as_str(),
        llm_enabled = config.llm.enabled,
        llm_summaries = memory.summarizes_with_llm(),
        "application ready"
    );

    Ok(Application { config, db_pool, catalog, classifier, memory, router })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use concierge_core::config::{ConfigOverrides, LoadOptions};
    use concierge_core::RequestContext;

    use super::{bootstrap, BootstrapError};

    fn offline(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                llm_enabled: Some(false),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn offline_bootstrap_wires_schema_and_router() {
        let app = bootstrap(offline(":memory:")).await.expect("bootstrap succeeds");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('memory_entries', 'session_messages', 'pending_learnings')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 3);

        let decision = app.router.route("hello there", &RequestContext::new(), None, None).await;
        assert_eq!(decision.classification.intent.name, "greeting");
        assert_eq!(app.router.coverage_report().covered_intents, 0);
        assert!(!app.memory.summarizes_with_llm());
    }

    #[tokio::test]
    async fn missing_custom_intents_file_is_a_catalog_error() {
        let mut options = offline(":memory:");
        options.overrides.custom_intents_file = Some(PathBuf::from("/nonexistent/intents.toml"));

        let result = bootstrap(options).await;

        assert!(matches!(result, Err(BootstrapError::Catalog(_))));
    }

    #[tokio::test]
    async fn custom_intents_are_registered_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("intents.toml");
        std::fs::write(
            &path,
            r#"
[[intents]]
name = "order_pizza"
category = "system_command"
keywords = ["pizza", "order"]
"#,
        )
        .expect("write intents");
        let mut options = offline(":memory:");
        options.overrides.custom_intents_file = Some(path);

        let app = bootstrap(options).await.expect("bootstrap succeeds");

        assert!(app.catalog.get("order_pizza").is_some());
    }
}
