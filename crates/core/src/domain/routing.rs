use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::classification::ClassificationResult;
use crate::domain::intent::Intent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    Handled,
    ClarificationNeeded,
    Fallback,
    Error,
    NoHandler,
}

impl RoutingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::ClarificationNeeded => "clarification_needed",
            Self::Fallback => "fallback",
            Self::Error => "error",
            Self::NoHandler => "no_handler",
        }
    }
}

/// The result of a single routing pass.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub outcome: RoutingOutcome,
    pub classification: ClassificationResult,
    pub handler_name: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub clarification_prompt: Option<String>,
    pub suggested_intents: Vec<Arc<Intent>>,
    pub classification_ms: f64,
    pub handling_ms: f64,
}

impl RoutingDecision {
    pub fn new(outcome: RoutingOutcome, classification: ClassificationResult) -> Self {
        Self {
            outcome,
            classification,
            handler_name: None,
            result: None,
            error: None,
            clarification_prompt: None,
            suggested_intents: Vec::new(),
            classification_ms: 0.0,
            handling_ms: 0.0,
        }
    }

    pub fn is_handled(&self) -> bool {
        self.outcome == RoutingOutcome::Handled
    }

    pub fn summary(&self) -> Value {
        json!({
            "outcome": self.outcome.as_str(),
            "classification": self.classification.summary(),
            "handler_name": self.handler_name,
            "result": self.result,
            "error": self.error,
            "clarification_prompt": self.clarification_prompt,
            "suggested_intents": self
                .suggested_intents
                .iter()
                .map(|intent| intent.name.as_str())
                .collect::<Vec<_>>(),
            "classification_time_ms": self.classification_ms,
            "handling_time_ms": self.handling_ms,
        })
    }
}
