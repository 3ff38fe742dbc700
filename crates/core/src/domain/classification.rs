use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::domain::intent::{Intent, IntentCategory};

pub const CONFIDENT_THRESHOLD: f64 = 0.7;
pub const CLARIFICATION_THRESHOLD: f64 = 0.5;

/// Free-form request context shared by classifiers, middleware, and handlers.
pub type RequestContext = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierSource {
    RuleBased,
    LocalLlm,
    Ensemble,
    Middleware,
}

impl ClassifierSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::LocalLlm => "local_llm",
            Self::Ensemble => "ensemble",
            Self::Middleware => "middleware",
        }
    }
}

impl fmt::Display for ClassifierSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RankedIntent {
    pub intent: Arc<Intent>,
    pub confidence: f64,
}

impl RankedIntent {
    pub fn new(intent: Arc<Intent>, confidence: f64) -> Self {
        Self { intent, confidence: clamp_unit(confidence) }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationResult {
    pub intent: Arc<Intent>,
    pub confidence: f64,
    pub source: ClassifierSource,
    pub raw_scores: BTreeMap<String, f64>,
    pub slots: BTreeMap<String, Value>,
    pub reasoning: String,
    pub alternatives: Vec<RankedIntent>,
    pub contributing: Vec<ClassifierSource>,
    pub agreement: f64,
}

impl ClassificationResult {
    /// Confidence is clamped into `[0, 1]`; agreement starts at 1.
    pub fn new(intent: Arc<Intent>, confidence: f64, source: ClassifierSource) -> Self {
        Self {
            intent,
            confidence: clamp_unit(confidence),
            source,
            raw_scores: BTreeMap::new(),
            slots: BTreeMap::new(),
            reasoning: String::new(),
            alternatives: Vec::new(),
            contributing: Vec::new(),
            agreement: 1.0,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    pub fn with_slots(mut self, slots: BTreeMap<String, Value>) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<RankedIntent>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_raw_scores(mut self, raw_scores: BTreeMap<String, f64>) -> Self {
        self.raw_scores = raw_scores;
        self
    }

    pub fn with_contributing(mut self, contributing: Vec<ClassifierSource>) -> Self {
        self.contributing = contributing;
        self
    }

    pub fn with_agreement(mut self, agreement: f64) -> Self {
        self.agreement = clamp_unit(agreement);
        self
    }

    pub fn intent_name(&self) -> &str {
        &self.intent.name
    }

    pub fn is_confident(&self) -> bool {
        self.confidence >= CONFIDENT_THRESHOLD
    }

    pub fn needs_clarification(&self) -> bool {
        self.confidence < CLARIFICATION_THRESHOLD
            || self.intent.category == IntentCategory::Ambiguous
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots.get(slot).map(|value| !value.is_null()).unwrap_or(false)
    }

    pub fn summary(&self) -> Value {
        json!({
            "intent": self.intent.name,
            "category": self.intent.category.as_str(),
            "confidence": self.confidence,
            "classifier": self.source.as_str(),
            "slots": self.slots,
            "reasoning": self.reasoning,
            "alternatives": self
                .alternatives
                .iter()
                .map(|alt| json!({ "intent": alt.intent.name, "confidence": alt.confidence }))
                .collect::<Vec<_>>(),
            "contributing_classifiers": self
                .contributing
                .iter()
                .map(ClassifierSource::as_str)
                .collect::<Vec<_>>(),
            "agreement_score": self.agreement,
        })
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
