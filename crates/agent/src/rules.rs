//! Deterministic keyword and pattern scoring.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use concierge_core::domain::classification::RankedIntent;
use concierge_core::{
    ClassificationResult, ClassifierSource, DomainError, Intent, IntentCatalog, RequestContext,
};

use crate::classifier::IntentClassifier;

const KEYWORD_HIT: f64 = 10.0;
const LEADING_KEYWORD_BONUS: f64 = 5.0;
const PATTERN_HIT: f64 = 25.0;
const MAX_SCORE: f64 = 100.0;
const CLEAR_WINNER_RATIO: f64 = 2.0;
const CLEAR_WINNER_BOOST: f64 = 1.2;
const MAX_ALTERNATIVES: usize = 3;

const SLOT_PATTERNS: &[(&str, &str)] = &[
    ("path", r#"["']?([/\w.\-]+\.\w+)["']?|["']?([/\w.\-]+/)["']?"#),
    ("time", r"\b(\d{1,2}(?::\d{2})?\s*(?:am|pm)?)\b|\b(at\s+\d{1,2}(?::\d{2})?)\b"),
    ("date", r"\b(today|tomorrow|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b"),
    ("temperature", r"\b(\d{1,3})\s*(?:degrees?|°)?\b"),
    ("room", r"\b(living\s*room|bedroom|kitchen|bathroom|office|garage)\b"),
];

pub struct RuleScorer {
    catalog: Arc<IntentCatalog>,
    slot_patterns: Vec<(String, Regex)>,
}

impl RuleScorer {
    pub fn new(catalog: Arc<IntentCatalog>) -> Result<Self, DomainError> {
        let mut scorer = Self { catalog, slot_patterns: Vec::with_capacity(SLOT_PATTERNS.len()) };
        for (slot, pattern) in SLOT_PATTERNS {
            scorer.add_slot_pattern(slot, pattern)?;
        }
        Ok(scorer)
    }

    /// Adds or replaces the extractor for `slot`. The first non-empty capture group wins.
    pub fn with_slot_pattern(mut self, slot: &str, pattern: &str) -> Result<Self, DomainError> {
        self.add_slot_pattern(slot, pattern)?;
        Ok(self)
    }

    fn add_slot_pattern(&mut self, slot: &str, pattern: &str) -> Result<(), DomainError> {
        let compiled = RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|err| {
            DomainError::InvalidIntentPattern {
                intent: format!("slot:{slot}"),
                pattern: pattern.to_string(),
                message: err.to_string(),
            }
        })?;
        match self.slot_patterns.iter_mut().find(|(name, _)| name == slot) {
            Some(existing) => existing.1 = compiled,
            None => self.slot_patterns.push((slot.to_string(), compiled)),
        }
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<IntentCatalog> {
        &self.catalog
    }

    pub fn score(&self, text: &str) -> ClassificationResult {
        let normalized = text.trim().to_lowercase();
        let mut ranked: Vec<(Arc<Intent>, f64)> = self
            .catalog
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let mut score = 0.0;
                for keyword in &entry.intent.keywords {
                    let keyword = keyword.to_lowercase();
                    if keyword.is_empty() || !normalized.contains(&keyword) {
                        continue;
                    }
                    score += KEYWORD_HIT;
                    if normalized.starts_with(&keyword) {
                        score += LEADING_KEYWORD_BONUS;
                    }
                }
                if entry.patterns.iter().any(|pattern| pattern.is_match(text)) {
                    score += PATTERN_HIT;
                }
                if score > 0.0 {
                    score += f64::from(entry.intent.priority);
                    Some((entry.intent, score))
                } else {
                    None
                }
            })
            .collect();

        if ranked.is_empty() {
            return ClassificationResult::new(self.catalog.unknown(), 0.0, ClassifierSource::RuleBased);
        }

        // Stable sort keeps registration order among equal scores.
        ranked.sort_by(|left, right| right.1.total_cmp(&left.1));

        let (top_intent, top_score) = ranked[0].clone();
        let mut confidence = (top_score / MAX_SCORE).min(1.0);
        if let Some((_, runner_up)) = ranked.get(1) {
            if top_score > runner_up * CLEAR_WINNER_RATIO {
                confidence = (confidence * CLEAR_WINNER_BOOST).min(1.0);
            }
        }

        let alternatives = ranked
            .iter()
            .skip(1)
            .take(MAX_ALTERNATIVES)
            .map(|(intent, score)| RankedIntent::new(Arc::clone(intent), score / MAX_SCORE))
            .collect();
        let raw_scores: BTreeMap<String, f64> =
            ranked.iter().map(|(intent, score)| (intent.name.clone(), *score)).collect();
        let slots = self.extract_slots(text, &top_intent);

        ClassificationResult::new(top_intent, confidence, ClassifierSource::RuleBased)
            .with_raw_scores(raw_scores)
            .with_slots(slots)
            .with_alternatives(alternatives)
    }

    /// Runs the slot extractors for the slots `intent` declares.
    pub fn extract_slots(&self, text: &str, intent: &Intent) -> BTreeMap<String, Value> {
        let mut slots = BTreeMap::new();
        for slot in intent.declared_slots() {
            let Some((_, pattern)) = self.slot_patterns.iter().find(|(name, _)| name == slot) else {
                continue;
            };
            let value = pattern.captures(text).and_then(|captures| {
                captures
                    .iter()
                    .skip(1)
                    .flatten()
                    .map(|group| group.as_str().trim())
                    .find(|group| !group.is_empty())
                    .map(str::to_string)
            });
            if let Some(value) = value {
                slots.insert(slot.to_string(), Value::String(value));
            }
        }
        slots
    }
}

#[async_trait]
impl IntentClassifier for RuleScorer {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::RuleBased
    }

    async fn classify(&self, text: &str, _context: &RequestContext) -> ClassificationResult {
        self.score(text)
    }
}
