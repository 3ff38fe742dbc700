use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub classifier: ClassifierConfig,
    pub router: RouterConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub enabled: bool,
    pub backend: LlmBackend,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ClassifierConfig {
    pub strategy: EnsembleStrategy,
    /// rule_first trusts the rule scorer at or above this confidence.
    pub rule_confidence_threshold: f64,
    /// llm_verify trusts the rule scorer at or above this confidence.
    pub verify_threshold: f64,
    pub rule_weight: f64,
    pub llm_weight: f64,
    /// When set, weighted_vote and consensus skip the provider at or above this rule confidence.
    pub rule_short_circuit: Option<f64>,
    pub custom_intents_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub confidence_threshold: f64,
    pub clarification_threshold: f64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub max_session_messages: u32,
    pub keep_recent_messages: u32,
    pub max_user_memories: u32,
    pub similarity_threshold: f64,
    pub archive_after_days: u32,
    pub history_limit: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmBackend {
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "llama_cpp")]
    LlamaCpp,
    #[serde(rename = "vllm")]
    Vllm,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategy {
    RuleFirst,
    WeightedVote,
    LlmVerify,
    Consensus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_enabled: Option<bool>,
    pub llm_backend: Option<LlmBackend>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub classifier_strategy: Option<EnsembleStrategy>,
    pub custom_intents_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                enabled: true,
                backend: LlmBackend::Ollama,
                base_url: "http://localhost:11434".to_string(),
                model: "llama3.2:3b".to_string(),
                api_key: None,
                timeout_secs: 10,
                temperature: 0.1,
                max_tokens: 150,
            },
            classifier: ClassifierConfig {
                strategy: EnsembleStrategy::RuleFirst,
                rule_confidence_threshold: 0.7,
                verify_threshold: 0.85,
                rule_weight: 0.4,
                llm_weight: 0.6,
                rule_short_circuit: None,
                custom_intents_file: None,
            },
            router: RouterConfig {
                confidence_threshold: 0.5,
                clarification_threshold: 0.3,
                max_retries: 2,
            },
            memory: MemoryConfig {
                max_session_messages: 50,
                keep_recent_messages: 10,
                max_user_memories: 100,
                similarity_threshold: 0.75,
                archive_after_days: 30,
                history_limit: 10,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "llama_cpp" | "llamacpp" => Ok(Self::LlamaCpp),
            "vllm" => Ok(Self::Vllm),
            "openai_compatible" | "openai" => Ok(Self::OpenAiCompatible),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm backend `{other}` (expected ollama|llama_cpp|vllm|openai_compatible)"
            ))),
        }
    }
}

impl std::str::FromStr for EnsembleStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rule_first" => Ok(Self::RuleFirst),
            "weighted_vote" => Ok(Self::WeightedVote),
            "llm_verify" => Ok(Self::LlmVerify),
            "consensus" => Ok(Self::Consensus),
            other => Err(ConfigError::Validation(format!(
                "unsupported classifier strategy `{other}` (expected rule_first|weighted_vote|llm_verify|consensus)"
            ))),
        }
    }
}

impl EnsembleStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleFirst => "rule_first",
            Self::WeightedVote => "weighted_vote",
            Self::LlmVerify => "llm_verify",
            Self::Consensus => "consensus",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(enabled) = llm.enabled {
                self.llm.enabled = enabled;
            }
            if let Some(backend) = llm.backend {
                self.llm.backend = backend;
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(api_key.into());
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(classifier) = patch.classifier {
            if let Some(strategy) = classifier.strategy {
                self.classifier.strategy = strategy;
            }
            if let Some(threshold) = classifier.rule_confidence_threshold {
                self.classifier.rule_confidence_threshold = threshold;
            }
            if let Some(threshold) = classifier.verify_threshold {
                self.classifier.verify_threshold = threshold;
            }
            if let Some(weight) = classifier.rule_weight {
                self.classifier.rule_weight = weight;
            }
            if let Some(weight) = classifier.llm_weight {
                self.classifier.llm_weight = weight;
            }
            if let Some(short_circuit) = classifier.rule_short_circuit {
                self.classifier.rule_short_circuit = Some(short_circuit);
            }
            if let Some(path) = classifier.custom_intents_file {
                self.classifier.custom_intents_file = Some(path);
            }
        }

        if let Some(router) = patch.router {
            if let Some(threshold) = router.confidence_threshold {
                self.router.confidence_threshold = threshold;
            }
            if let Some(threshold) = router.clarification_threshold {
                self.router.clarification_threshold = threshold;
            }
            if let Some(max_retries) = router.max_retries {
                self.router.max_retries = max_retries;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(value) = memory.max_session_messages {
                self.memory.max_session_messages = value;
            }
            if let Some(value) = memory.keep_recent_messages {
                self.memory.keep_recent_messages = value;
            }
            if let Some(value) = memory.max_user_memories {
                self.memory.max_user_memories = value;
            }
            if let Some(value) = memory.similarity_threshold {
                self.memory.similarity_threshold = value;
            }
            if let Some(value) = memory.archive_after_days {
                self.memory.archive_after_days = value;
            }
            if let Some(value) = memory.history_limit {
                self.memory.history_limit = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_LLM_ENABLED") {
            self.llm.enabled = parse_bool("CONCIERGE_LLM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BACKEND") {
            self.llm.backend = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(value.into());
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f64("CONCIERGE_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("CONCIERGE_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_CLASSIFIER_STRATEGY") {
            self.classifier.strategy = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_CLASSIFIER_RULE_THRESHOLD") {
            self.classifier.rule_confidence_threshold =
                parse_f64("CONCIERGE_CLASSIFIER_RULE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_CLASSIFIER_RULE_WEIGHT") {
            self.classifier.rule_weight = parse_f64("CONCIERGE_CLASSIFIER_RULE_WEIGHT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_CLASSIFIER_LLM_WEIGHT") {
            self.classifier.llm_weight = parse_f64("CONCIERGE_CLASSIFIER_LLM_WEIGHT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_CLASSIFIER_INTENTS_FILE") {
            self.classifier.custom_intents_file = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("CONCIERGE_ROUTER_CONFIDENCE_THRESHOLD") {
            self.router.confidence_threshold =
                parse_f64("CONCIERGE_ROUTER_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTER_CLARIFICATION_THRESHOLD") {
            self.router.clarification_threshold =
                parse_f64("CONCIERGE_ROUTER_CLARIFICATION_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ROUTER_MAX_RETRIES") {
            self.router.max_retries = parse_u32("CONCIERGE_ROUTER_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_MEMORY_MAX_SESSION_MESSAGES") {
            self.memory.max_session_messages =
                parse_u32("CONCIERGE_MEMORY_MAX_SESSION_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_MEMORY_MAX_USER_MEMORIES") {
            self.memory.max_user_memories =
                parse_u32("CONCIERGE_MEMORY_MAX_USER_MEMORIES", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_MEMORY_SIMILARITY_THRESHOLD") {
            self.memory.similarity_threshold =
                parse_f64("CONCIERGE_MEMORY_SIMILARITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_MEMORY_ARCHIVE_AFTER_DAYS") {
            self.memory.archive_after_days =
                parse_u32("CONCIERGE_MEMORY_ARCHIVE_AFTER_DAYS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(enabled) = overrides.llm_enabled {
            self.llm.enabled = enabled;
        }
        if let Some(backend) = overrides.llm_backend {
            self.llm.backend = backend;
        }
        if let Some(base_url) = overrides.llm_base_url {
            self.llm.base_url = base_url;
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(strategy) = overrides.classifier_strategy {
            self.classifier.strategy = strategy;
        }
        if let Some(path) = overrides.custom_intents_file {
            self.classifier.custom_intents_file = Some(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_classifier(&self.classifier)?;
        validate_router(&self.router)?;
        validate_memory(&self.memory)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Holds the active configuration; a reload swaps in a new validated value.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<Arc<AppConfig>>,
}

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self { current: RwLock::new(Arc::new(config)) }
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace(&self, config: AppConfig) -> Result<Arc<AppConfig>, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(config)
    }

    pub fn reload(&self, options: LoadOptions) -> Result<Arc<AppConfig>, ConfigError> {
        let config = AppConfig::load(options)?;
        self.replace(config)
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if llm.enabled {
        let base_url = llm.base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https:// when the llm is enabled"
                    .to_string(),
            ));
        }
        if llm.model.trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.model is required when the llm is enabled".to_string(),
            ));
        }
        if llm.backend == LlmBackend::OpenAiCompatible {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(false);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key must not be blank when provided".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_classifier(classifier: &ClassifierConfig) -> Result<(), ConfigError> {
    validate_unit("classifier.rule_confidence_threshold", classifier.rule_confidence_threshold)?;
    validate_unit("classifier.verify_threshold", classifier.verify_threshold)?;
    if let Some(short_circuit) = classifier.rule_short_circuit {
        validate_unit("classifier.rule_short_circuit", short_circuit)?;
    }

    if classifier.rule_weight < 0.0 || classifier.llm_weight < 0.0 {
        return Err(ConfigError::Validation(
            "classifier.rule_weight and classifier.llm_weight must be non-negative".to_string(),
        ));
    }
    if classifier.rule_weight + classifier.llm_weight <= 0.0 {
        return Err(ConfigError::Validation(
            "classifier weights must not both be zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_router(router: &RouterConfig) -> Result<(), ConfigError> {
    validate_unit("router.confidence_threshold", router.confidence_threshold)?;
    validate_unit("router.clarification_threshold", router.clarification_threshold)?;
    if router.clarification_threshold > router.confidence_threshold {
        return Err(ConfigError::Validation(
            "router.clarification_threshold must not exceed router.confidence_threshold"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_memory(memory: &MemoryConfig) -> Result<(), ConfigError> {
    validate_unit("memory.similarity_threshold", memory.similarity_threshold)?;

    if memory.max_session_messages == 0 || memory.max_user_memories == 0 {
        return Err(ConfigError::Validation(
            "memory.max_session_messages and memory.max_user_memories must be greater than zero"
                .to_string(),
        ));
    }
    if memory.keep_recent_messages >= memory.max_session_messages {
        return Err(ConfigError::Validation(
            "memory.keep_recent_messages must be less than memory.max_session_messages"
                .to_string(),
        ));
    }
    if memory.archive_after_days == 0 {
        return Err(ConfigError::Validation(
            "memory.archive_after_days must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_unit(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must be in range 0.0..=1.0")))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    classifier: Option<ClassifierPatch>,
    router: Option<RouterPatch>,
    memory: Option<MemoryPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    enabled: Option<bool>,
    backend: Option<LlmBackend>,
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassifierPatch {
    strategy: Option<EnsembleStrategy>,
    rule_confidence_threshold: Option<f64>,
    verify_threshold: Option<f64>,
    rule_weight: Option<f64>,
    llm_weight: Option<f64>,
    rule_short_circuit: Option<f64>,
    custom_intents_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RouterPatch {
    confidence_threshold: Option<f64>,
    clarification_threshold: Option<f64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    max_session_messages: Option<u32>,
    keep_recent_messages: Option<u32>,
    max_user_memories: Option<u32>,
    similarity_threshold: Option<f64>,
    archive_after_days: Option<u32>,
    history_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, EnsembleStrategy, LlmBackend, LoadOptions,
        LogFormat, SharedConfig,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        ensure(config.llm.timeout_secs == 10, "provider timeout should default to 10s")?;
        ensure(
            config.classifier.strategy == EnsembleStrategy::RuleFirst,
            "rule_first should be the default strategy",
        )?;
        ensure(
            config.classifier.rule_short_circuit.is_none(),
            "short-circuit should be off by default",
        )?;
        ensure(config.memory.max_session_messages == 50, "session cap should default to 50")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CONCIERGE_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[llm]
backend = "openai_compatible"
base_url = "http://localhost:8000"
api_key = "${TEST_CONCIERGE_LLM_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.backend == LlmBackend::OpenAiCompatible,
                "backend should be read from file",
            )?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )
        })();

        clear_vars(&["TEST_CONCIERGE_LLM_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CONCIERGE_CLASSIFIER_STRATEGY", "consensus");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[classifier]
strategy = "weighted_vote"
rule_weight = 0.5
llm_weight = 0.5

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.classifier.strategy == EnsembleStrategy::Consensus,
                "env strategy should win over file",
            )?;
            ensure(config.classifier.rule_weight == 0.5, "file weight should apply")
        })();

        clear_vars(&["CONCIERGE_DATABASE_URL", "CONCIERGE_CLASSIFIER_STRATEGY"]);
        result
    }

    #[test]
    fn negative_weights_fail_validation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_CLASSIFIER_RULE_WEIGHT", "-0.1");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("rule_weight")
            );
            ensure(has_message, "validation failure should mention rule_weight")
        })();

        clear_vars(&["CONCIERGE_CLASSIFIER_RULE_WEIGHT"]);
        result
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let mut config = AppConfig::default();
        config.router.confidence_threshold = 1.5;

        let error = config.validate().expect_err("threshold above 1 must be rejected");
        assert!(error.to_string().contains("router.confidence_threshold"));
    }

    #[test]
    fn malformed_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_TIMEOUT_SECS", "soon");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "CONCIERGE_LLM_TIMEOUT_SECS", "error should name the variable")
            }
            other => Err(format!("unexpected result: {other:?}")),
        };

        clear_vars(&["CONCIERGE_LLM_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )
        })();

        clear_vars(&["CONCIERGE_LLM_API_KEY"]);
        result
    }

    #[test]
    fn shared_config_swaps_only_valid_values() -> Result<(), String> {
        let shared = SharedConfig::new(AppConfig::default());

        let mut next = AppConfig::default();
        next.router.max_retries = 5;
        shared.replace(next).map_err(|err| err.to_string())?;
        ensure(shared.current().router.max_retries == 5, "valid config should be swapped in")?;

        let mut invalid = AppConfig::default();
        invalid.memory.similarity_threshold = 2.0;
        ensure(shared.replace(invalid).is_err(), "invalid config should be rejected")?;
        ensure(shared.current().router.max_retries == 5, "previous config should stay active")
    }
}
