//! Classifier seam and the inference-backed classifier.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use concierge_core::{ClassificationResult, ClassifierSource, IntentCatalog, RequestContext};

use crate::llm::LlmClient;

const HISTORY_WINDOW: usize = 3;
const PROMPT_EXAMPLES: usize = 2;
const DEFAULT_CONFIDENCE: f64 = 0.5;
const FALLBACK_PARSE_CONFIDENCE: f64 = 0.4;
const RESPONSE_EXCERPT_CHARS: usize = 100;

/// Anything that can label a piece of text with an intent.
///
/// Implementations never fail: degraded conditions yield a zero-confidence `unknown`.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    fn source(&self) -> ClassifierSource;

    async fn classify(&self, text: &str, context: &RequestContext) -> ClassificationResult;
}

pub struct LlmClassifier {
    catalog: Arc<IntentCatalog>,
    client: Arc<dyn LlmClient>,
    timeout: Duration,
    available: OnceCell<bool>,
}

impl LlmClassifier {
    pub fn new(catalog: Arc<IntentCatalog>, client: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { catalog, client, timeout, available: OnceCell::new() }
    }

    /// Probes the provider on first use and remembers the answer for this instance.
    pub async fn is_available(&self) -> bool {
        *self.available.get_or_init(|| async { self.client.is_available().await }).await
    }

    pub fn build_prompt(&self, text: &str, context: &RequestContext) -> String {
        let intents = self
            .catalog
            .all()
            .into_iter()
            .filter(|intent| !intent.is_sentinel())
            .map(|intent| {
                let examples = if intent.examples.is_empty() {
                    String::new()
                } else {
                    let shown: Vec<&str> =
                        intent.examples.iter().take(PROMPT_EXAMPLES).map(String::as_str).collect();
                    format!(" Examples: {}", shown.join(", "))
                };
                format!("- {}: {}.{}", intent.name, intent.description, examples)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let history = match context.get("conversation_history").and_then(Value::as_array) {
            Some(items) if !items.is_empty() => {
                let recent = &items[items.len().saturating_sub(HISTORY_WINDOW)..];
                let lines: Vec<String> = recent.iter().map(|item| format!("- {}", render(item))).collect();
                format!("\nRecent conversation:\n{}", lines.join("\n"))
            }
            _ => String::new(),
        };

        format!(
            "You are an intent classifier. Classify the user's intent into exactly one of these categories:\n\n\
             {intents}\n\n\
             If none fit well, use \"unknown\".\n\
             If the intent is unclear and could be multiple things, use \"ambiguous\".\n\
             {history}\n\
             User input: \"{text}\"\n\n\
             Respond with ONLY a JSON object in this exact format:\n\
             {{\"intent\": \"intent_name\", \"confidence\": 0.0-1.0, \"reasoning\": \"brief explanation\", \"slots\": {{}}}}\n\n\
             JSON response:"
        )
    }

    pub fn parse_response(&self, response: &str) -> ClassificationResult {
        let body = strip_fences(response);
        match parse_payload(body) {
            Ok(payload) => {
                let intent = self.catalog.get_or_unknown(&payload.intent);
                ClassificationResult::new(intent, payload.confidence, ClassifierSource::LocalLlm)
                    .with_slots(payload.slots)
                    .with_reasoning(payload.reasoning)
            }
            Err(parse_error) => {
                let lowered = body.to_lowercase();
                if let Some(intent) = self
                    .catalog
                    .all()
                    .into_iter()
                    .find(|intent| !intent.is_sentinel() && lowered.contains(&intent.name))
                {
                    let excerpt: String = body.chars().take(RESPONSE_EXCERPT_CHARS).collect();
                    return ClassificationResult::new(
                        intent,
                        FALLBACK_PARSE_CONFIDENCE,
                        ClassifierSource::LocalLlm,
                    )
                    .with_reasoning(format!("Parsed from non-JSON response: {excerpt}"));
                }

                self.degraded(format!("Failed to parse LLM response: {parse_error}"))
            }
        }
    }

    fn degraded(&self, reasoning: impl Into<String>) -> ClassificationResult {
        ClassificationResult::new(self.catalog.unknown(), 0.0, ClassifierSource::LocalLlm)
            .with_reasoning(reasoning)
    }
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::LocalLlm
    }

    async fn classify(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        if !self.is_available().await {
            return self.degraded("Local LLM not available");
        }

        let prompt = self.build_prompt(text, context);
        match tokio::time::timeout(self.timeout, self.client.complete(&prompt)).await {
            Ok(Ok(response)) => self.parse_response(&response),
            Ok(Err(err)) => {
                tracing::warn!(
                    event_name = "agent.classifier.llm_failed",
                    error = %err,
                    "inference provider call failed; degrading to unknown"
                );
                self.degraded(format!("LLM error: {err}"))
            }
            Err(_) => {
                tracing::warn!(
                    event_name = "agent.classifier.llm_timeout",
                    timeout_ms = self.timeout.as_millis() as u64,
                    "inference provider call timed out; degrading to unknown"
                );
                self.degraded(format!("LLM error: timed out after {:?}", self.timeout))
            }
        }
    }
}

struct LlmPayload {
    intent: String,
    confidence: f64,
    reasoning: String,
    slots: BTreeMap<String, Value>,
}

fn strip_fences(response: &str) -> &str {
    let trimmed = response.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let inner = trimmed.split("```").nth(1).unwrap_or_default();
    inner.strip_prefix("json").unwrap_or(inner)
}

fn parse_payload(body: &str) -> Result<LlmPayload, String> {
    let (start, end) = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => (start, end),
        _ => return Err("no JSON object found in response".to_string()),
    };
    let data: Map<String, Value> =
        serde_json::from_str(&body[start..=end]).map_err(|err| err.to_string())?;

    let intent = data.get("intent").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let confidence = match data.get("confidence") {
        None | Some(Value::Null) => DEFAULT_CONFIDENCE,
        Some(Value::Number(number)) => number.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
        Some(Value::String(raw)) => {
            raw.trim().parse::<f64>().map_err(|err| format!("invalid confidence `{raw}`: {err}"))?
        }
        Some(other) => return Err(format!("invalid confidence `{other}`")),
    };
    let reasoning = data.get("reasoning").map(render).unwrap_or_default();
    let slots = match data.get("slots") {
        Some(Value::Object(slots)) => slots.clone().into_iter().collect(),
        _ => BTreeMap::new(),
    };

    Ok(LlmPayload { intent, confidence, reasoning, slots })
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
