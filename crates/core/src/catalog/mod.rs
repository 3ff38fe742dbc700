//! Append-only registry of known intents.
//!
//! Patterns are compiled once at registration time so request-time matching never fails.
//! Readers take a snapshot of the registered entries; registration never removes an intent.

mod defaults;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

use crate::domain::intent::{Intent, IntentCategory};
use crate::errors::DomainError;

pub const UNKNOWN_INTENT: &str = "unknown";
pub const AMBIGUOUS_INTENT: &str = "ambiguous";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("could not read intents file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse intents file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
}

/// A registered intent with its compiled patterns.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub intent: Arc<Intent>,
    pub patterns: Vec<Regex>,
}

#[derive(Default)]
struct CatalogState {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

pub struct IntentCatalog {
    state: RwLock<CatalogState>,
    unknown: Arc<Intent>,
    ambiguous: Arc<Intent>,
}

#[derive(Debug, Deserialize)]
struct IntentsFile {
    #[serde(default)]
    intents: Vec<Intent>,
}

impl Default for IntentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentCatalog {
    /// A catalog holding only the `unknown` and `ambiguous` sentinels.
    pub fn new() -> Self {
        let unknown = Arc::new(defaults::unknown());
        let ambiguous = Arc::new(defaults::ambiguous());
        let mut state = CatalogState::default();
        for intent in [unknown.clone(), ambiguous.clone()] {
            state.by_name.insert(intent.name.clone(), state.entries.len());
            state.entries.push(CatalogEntry { intent, patterns: Vec::new() });
        }

        Self { state: RwLock::new(state), unknown, ambiguous }
    }

    pub fn with_default_intents() -> Result<Self, DomainError> {
        let catalog = Self::new();
        for intent in defaults::built_in() {
            catalog.register(intent)?;
        }
        Ok(catalog)
    }

    /// Registers an intent, replacing any earlier intent with the same name.
    pub fn register(&self, intent: Intent) -> Result<Arc<Intent>, DomainError> {
        let patterns = compile_patterns(&intent)?;
        let intent = Arc::new(intent);
        let entry = CatalogEntry { intent: intent.clone(), patterns };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.by_name.get(&intent.name).copied() {
            Some(index) => state.entries[index] = entry,
            None => {
                let index = state.entries.len();
                state.by_name.insert(intent.name.clone(), index);
                state.entries.push(entry);
            }
        }

        Ok(intent)
    }

    /// Loads `[[intents]]` tables from a TOML file and registers each of them.
    pub fn load_file(&self, path: &Path) -> Result<usize, CatalogError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogError::ReadFile { path: path.to_path_buf(), source })?;
        let file: IntentsFile = toml::from_str(&raw)
            .map_err(|source| CatalogError::ParseFile { path: path.to_path_buf(), source })?;

        let count = file.intents.len();
        for intent in file.intents {
            self.register(intent)?;
        }
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Intent>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_name.get(name).map(|index| state.entries[*index].intent.clone())
    }

    /// Looks up `name`, falling back to the `unknown` sentinel.
    pub fn get_or_unknown(&self, name: &str) -> Arc<Intent> {
        self.get(name).unwrap_or_else(|| self.unknown())
    }

    pub fn by_category(&self, category: IntentCategory) -> Vec<Arc<Intent>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .iter()
            .filter(|entry| entry.intent.category == category)
            .map(|entry| entry.intent.clone())
            .collect()
    }

    /// Every registered intent in registration order.
    pub fn all(&self) -> Vec<Arc<Intent>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.iter().map(|entry| entry.intent.clone()).collect()
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.clone()
    }

    pub fn names(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.iter().map(|entry| entry.intent.name.clone()).collect()
    }

    pub fn unknown(&self) -> Arc<Intent> {
        self.unknown.clone()
    }

    pub fn ambiguous(&self) -> Arc<Intent> {
        self.ambiguous.clone()
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile_patterns(intent: &Intent) -> Result<Vec<Regex>, DomainError> {
    intent
        .patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|err| {
                DomainError::InvalidIntentPattern {
                    intent: intent.name.clone(),
                    pattern: pattern.clone(),
                    message: err.to_string(),
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{CatalogError, IntentCatalog, AMBIGUOUS_INTENT, UNKNOWN_INTENT};
    use crate::domain::intent::{Intent, IntentCategory};
    use crate::errors::DomainError;

    #[test]
    fn new_catalog_holds_only_sentinels() {
        let catalog = IntentCatalog::new();

        assert_eq!(catalog.names(), vec![UNKNOWN_INTENT.to_string(), AMBIGUOUS_INTENT.to_string()]);
        assert_eq!(catalog.unknown().category, IntentCategory::Unknown);
        assert_eq!(catalog.ambiguous().category, IntentCategory::Ambiguous);
    }

    #[test]
    fn default_intents_are_registered_with_handlers() {
        let catalog = IntentCatalog::with_default_intents().expect("defaults compile");

        let file_create = catalog.get("file_create").expect("file_create registered");
        assert_eq!(file_create.required_slots, vec!["path".to_string()]);
        assert_eq!(file_create.handler_name.as_deref(), Some("handle_file_create"));
        assert!(catalog.get("file_delete").expect("file_delete").requires_confirmation);
        assert_eq!(catalog.by_category(IntentCategory::HomeAutomation).len(), 2);
        assert_eq!(catalog.len(), 24);
    }

    #[test]
    fn invalid_pattern_is_rejected_at_registration() {
        let catalog = IntentCatalog::new();
        let result = catalog
            .register(Intent::new("broken", IntentCategory::Note).with_patterns(&["(unclosed"]));

        assert!(matches!(result, Err(DomainError::InvalidIntentPattern { ref intent, .. }) if intent == "broken"));
        assert!(catalog.get("broken").is_none());
    }

    #[test]
    fn re_registration_replaces_in_place() {
        let catalog = IntentCatalog::new();
        catalog
            .register(Intent::new("note", IntentCategory::Note).with_priority(1))
            .expect("register");
        catalog
            .register(Intent::new("note", IntentCategory::Note).with_priority(7))
            .expect("re-register");

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("note").expect("note").priority, 7);
    }

    #[test]
    fn unknown_names_fall_back_to_sentinel() {
        let catalog = IntentCatalog::new();

        assert_eq!(catalog.get_or_unknown("nope").name, UNKNOWN_INTENT);
    }

    #[test]
    fn custom_intents_load_from_toml() -> Result<(), String> {
        let dir = TempDir::new().map_err(|err| err.to_string())?;
        let path = dir.path().join("intents.toml");
        fs::write(
            &path,
            r#"
[[intents]]
name = "order_coffee"
category = "small_talk"
description = "Order a coffee"
keywords = ["coffee", "latte"]
patterns = ["\\border\\s+a\\s+coffee\\b"]
handler_name = "handle_coffee"
priority = 12
optional_slots = ["size"]
"#,
        )
        .map_err(|err| err.to_string())?;

        let catalog = IntentCatalog::new();
        let loaded = catalog.load_file(&path).map_err(|err| err.to_string())?;
        let intent = catalog.get("order_coffee").ok_or("intent should be registered")?;

        assert_eq!(loaded, 1);
        assert_eq!(intent.category, IntentCategory::SmallTalk);
        assert_eq!(intent.priority, 12);
        assert_eq!(intent.optional_slots, vec!["size".to_string()]);
        Ok(())
    }

    #[test]
    fn unreadable_intents_file_is_reported() {
        let catalog = IntentCatalog::new();
        let result = catalog.load_file(std::path::Path::new("/definitely/missing/intents.toml"));

        assert!(matches!(result, Err(CatalogError::ReadFile { .. })));
    }
}
