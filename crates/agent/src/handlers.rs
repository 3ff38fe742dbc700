use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use concierge_core::{ClassificationResult, Intent, RequestContext};

/// Capability invoked once the router has settled on an intent.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        text: &str,
        classification: &ClassificationResult,
        context: &RequestContext,
    ) -> Result<Value>;
}

/// Owned arguments handed to closure-based handlers.
#[derive(Clone, Debug)]
pub struct HandlerRequest {
    pub text: String,
    pub classification: ClassificationResult,
    pub context: RequestContext,
}

pub struct FnHandler<F> {
    func: F,
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnHandler { func }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(
        &self,
        text: &str,
        classification: &ClassificationResult,
        context: &RequestContext,
    ) -> Result<Value> {
        (self.func)(HandlerRequest {
            text: text.to_string(),
            classification: classification.clone(),
            context: context.clone(),
        })
        .await
    }
}

/// Runs before classification (with `None`) or after it (with the current result).
///
/// Returning `Some` injects or replaces the classification. Errors are logged and ignored.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(
        &self,
        text: &str,
        classification: Option<&ClassificationResult>,
        context: &RequestContext,
    ) -> Result<Option<ClassificationResult>>;
}

/// Produces the payload returned alongside an `Error` outcome.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(
        &self,
        text: &str,
        classification: &ClassificationResult,
        error: &anyhow::Error,
        context: &RequestContext,
    ) -> Result<Value>;
}

/// Builds the question shown when the router needs clarification. `Ok(None)` keeps the default.
#[async_trait]
pub trait ClarificationPrompter: Send + Sync {
    async fn prompt(
        &self,
        text: &str,
        classification: &ClassificationResult,
        suggested: &[Arc<Intent>],
    ) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct RouteHandler {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub intents: Vec<String>,
    pub required_slots: Vec<String>,
    pub description: String,
    pub enabled: bool,
}

impl RouteHandler {
    pub fn new<H>(name: impl Into<String>, intents: &[&str], handler: H) -> Self
    where
        H: Handler + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            intents: intents.iter().map(|intent| (*intent).to_string()).collect(),
            required_slots: Vec::new(),
            description: String::new(),
            enabled: true,
        }
    }

    pub fn with_required_slots(mut self, slots: &[&str]) -> Self {
        self.required_slots = slots.iter().map(|slot| (*slot).to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn missing_slots(&self, classification: &ClassificationResult) -> Vec<String> {
        self.required_slots.iter().filter(|slot| !classification.has_slot(slot)).cloned().collect()
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            name: self.name.clone(),
            intents: self.intents.clone(),
            description: self.description.clone(),
            required_slots: self.required_slots.clone(),
            enabled: self.enabled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub name: String,
    pub intents: Vec<String>,
    pub description: String,
    pub required_slots: Vec<String>,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoverageReport {
    pub total_intents: usize,
    pub covered_intents: usize,
    pub uncovered_intents: Vec<String>,
    pub coverage_percentage: f64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use concierge_core::{ClassificationResult, ClassifierSource, IntentCatalog, RequestContext};

    use super::{handler_fn, Handler, RouteHandler};

    #[tokio::test]
    async fn closure_handler_sees_owned_request() {
        let handler = handler_fn(|request| async move {
            Ok::<_, anyhow::Error>(json!({
                "echo": request.text,
                "intent": request.classification.intent.name,
            }))
        });
        let catalog = IntentCatalog::with_default_intents().expect("defaults");
        let classification = ClassificationResult::new(
            catalog.get("greeting").expect("greeting"),
            0.9,
            ClassifierSource::RuleBased,
        );

        let value = handler
            .handle("hello", &classification, &RequestContext::new())
            .await
            .expect("handler succeeds");

        assert_eq!(value, json!({ "echo": "hello", "intent": "greeting" }));
    }

    #[test]
    fn missing_slots_ignores_null_values() {
        let catalog = Arc::new(IntentCatalog::with_default_intents().expect("defaults"));
        let noop = handler_fn(|_| async { Ok::<_, anyhow::Error>(json!(null)) });
        let route =
            RouteHandler::new("files", &["file_read"], noop).with_required_slots(&["path", "encoding"]);
        let mut classification = ClassificationResult::new(
            catalog.get("file_read").expect("file_read"),
            0.9,
            ClassifierSource::RuleBased,
        );
        classification.slots.insert("path".to_string(), json!("notes.txt"));
        classification.slots.insert("encoding".to_string(), json!(null));

        assert_eq!(route.missing_slots(&classification), vec!["encoding".to_string()]);
    }
}
