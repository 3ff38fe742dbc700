//! Turns classified requests into handler invocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use concierge_core::config::RouterConfig;
use concierge_core::{
    ClassificationResult, DomainError, Intent, IntentCatalog, IntentCategory, RequestContext,
    RoutingDecision, RoutingOutcome,
};

use crate::classifier::IntentClassifier;
use crate::handlers::{
    ClarificationPrompter, CoverageReport, ErrorHandler, Handler, HandlerInfo, Middleware,
    RouteHandler,
};
use crate::memory::MemoryManager;

pub const FALLBACK_HANDLER_NAME: &str = "fallback";
const SUGGESTION_LIMIT: usize = 3;
const DEFAULT_CLARIFICATION: &str = "Could you please clarify what you'd like me to do?";

#[derive(Clone, Debug, PartialEq)]
pub struct RouterSettings {
    /// Below this a confident handler match is not attempted.
    pub confidence_threshold: f64,
    /// Below this the router always asks for clarification.
    pub clarification_threshold: f64,
    pub max_retries: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { confidence_threshold: 0.5, clarification_threshold: 0.3, max_retries: 2 }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            clarification_threshold: config.clarification_threshold,
            max_retries: config.max_retries,
        }
    }
}

impl RouterSettings {
    pub fn validate(&self) -> Result<(), DomainError> {
        for (field, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("clarification_threshold", self.clarification_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DomainError::InvariantViolation(format!(
                    "router {field} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.clarification_threshold > self.confidence_threshold {
            return Err(DomainError::InvariantViolation(format!(
                "router clarification_threshold ({}) exceeds confidence_threshold ({})",
                self.clarification_threshold, self.confidence_threshold
            )));
        }
        Ok(())
    }
}

fn slot_prompt(slot: &str) -> String {
    match slot {
        "path" => "What file or path should I use?".to_string(),
        "time" => "What time?".to_string(),
        "date" => "What date?".to_string(),
        "command" => "What command should I run?".to_string(),
        "message" => "What message?".to_string(),
        "temperature" => "What temperature?".to_string(),
        "room" => "Which room?".to_string(),
        other => format!("Please provide: {other}"),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn response_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub struct Router {
    catalog: Arc<IntentCatalog>,
    classifier: Arc<dyn IntentClassifier>,
    settings: RouterSettings,
    memory: Option<Arc<MemoryManager>>,
    handlers: HashMap<String, RouteHandler>,
    intent_to_handler: HashMap<String, String>,
    pre_middleware: Vec<Arc<dyn Middleware>>,
    post_middleware: Vec<Arc<dyn Middleware>>,
    fallback: Option<Arc<dyn Handler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    prompter: Option<Arc<dyn ClarificationPrompter>>,
    context: RequestContext,
}

impl Router {
    pub fn new(
        catalog: Arc<IntentCatalog>,
        classifier: Arc<dyn IntentClassifier>,
        settings: RouterSettings,
    ) -> Result<Self, DomainError> {
        settings.validate()?;
        Ok(Self {
            catalog,
            classifier,
            settings,
            memory: None,
            handlers: HashMap::new(),
            intent_to_handler: HashMap::new(),
            pre_middleware: Vec::new(),
            post_middleware: Vec::new(),
            fallback: None,
            error_handler: None,
            prompter: None,
            context: RequestContext::new(),
        })
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn memory(&self) -> Option<&Arc<MemoryManager>> {
        self.memory.as_ref()
    }

    /// Registers `route` under its name. A later registration of the same name or intent wins.
    pub fn register(&mut self, route: RouteHandler) {
        if self.handlers.contains_key(&route.name) {
            tracing::warn!(
                event_name = "agent.router.handler_replaced",
                handler = %route.name,
                "handler re-registered; previous registration dropped"
            );
            self.intent_to_handler.retain(|_, handler| handler != &route.name);
        }

        for intent in &route.intents {
            if self.catalog.get(intent).is_none() {
                tracing::warn!(
                    event_name = "agent.router.unknown_intent",
                    handler = %route.name,
                    intent = %intent,
                    "handler registered for an intent missing from the catalog"
                );
            }
            if let Some(previous) = self.intent_to_handler.insert(intent.clone(), route.name.clone()) {
                if previous != route.name {
                    tracing::warn!(
                        event_name = "agent.router.intent_reassigned",
                        intent = %intent,
                        previous = %previous,
                        handler = %route.name,
                        "intent moved to a new handler"
                    );
                }
            }
        }
        self.handlers.insert(route.name.clone(), route);
    }

    pub fn register_handler<H>(
        &mut self,
        name: &str,
        intents: &[&str],
        required_slots: &[&str],
        handler: H,
    ) where
        H: Handler + 'static,
    {
        self.register(RouteHandler::new(name, intents, handler).with_required_slots(required_slots));
    }

    /// Returns false when no handler has that name.
    pub fn set_handler_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.handlers.get_mut(name) {
            Some(route) => {
                route.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_fallback_handler<H>(&mut self, handler: H)
    where
        H: Handler + 'static,
    {
        self.fallback = Some(Arc::new(handler));
    }

    pub fn set_error_handler<H>(&mut self, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
    }

    pub fn set_clarification_prompter<P>(&mut self, prompter: P)
    where
        P: ClarificationPrompter + 'static,
    {
        self.prompter = Some(Arc::new(prompter));
    }

    pub fn add_pre_middleware<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.pre_middleware.push(Arc::new(middleware));
    }

    pub fn add_post_middleware<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.post_middleware.push(Arc::new(middleware));
    }

    pub fn update_context(&mut self, updates: RequestContext) {
        self.context.extend(updates);
    }

    pub fn context(&self) -> RequestContext {
        self.context.clone()
    }

    pub async fn route(
        &self,
        text: &str,
        context: &RequestContext,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> RoutingDecision {
        let context = self.merged_context(text, context, session_id, user_id).await;

        for middleware in &self.pre_middleware {
            match middleware.process(text, None, &context).await {
                Ok(Some(injected)) => {
                    tracing::debug!(
                        event_name = "agent.router.pre_middleware_classified",
                        intent = %injected.intent.name,
                        "pre-middleware supplied the classification"
                    );
                    return self.decide(text, injected, &context, 0.0, session_id, user_id).await;
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    event_name = "agent.router.middleware_failed",
                    stage = "pre",
                    error = %err,
                    "pre-middleware failed; continuing"
                ),
            }
        }

        let started = Instant::now();
        let mut classification = self.classifier.classify(text, &context).await;
        let classification_ms = elapsed_ms(started);

        for middleware in &self.post_middleware {
            match middleware.process(text, Some(&classification), &context).await {
                Ok(Some(rewritten)) => classification = rewritten,
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    event_name = "agent.router.middleware_failed",
                    stage = "post",
                    error = %err,
                    "post-middleware failed; continuing"
                ),
            }
        }

        self.decide(text, classification, &context, classification_ms, session_id, user_id).await
    }

    /// Re-routes while the outcome is `Error`, at most `max_retries` extra times. The attempt
    /// number is passed to later attempts as `retry_attempt`.
    pub async fn route_with_retry(
        &self,
        text: &str,
        context: &RequestContext,
        session_id: Option<&str>,
        user_id: Option<&str>,
        max_retries: u32,
    ) -> RoutingDecision {
        let mut context = context.clone();
        let mut decision = self.route(text, &context, session_id, user_id).await;
        for attempt in 1..=max_retries {
            if decision.outcome != RoutingOutcome::Error {
                break;
            }
            tracing::info!(
                event_name = "agent.router.retry",
                attempt,
                max_retries,
                error = decision.error.as_deref().unwrap_or_default(),
                "retrying failed route"
            );
            context.insert("retry_attempt".to_string(), json!(attempt));
            decision = self.route(text, &context, session_id, user_id).await;
        }
        decision
    }

    pub fn registered_handlers(&self) -> Vec<HandlerInfo> {
        let mut handlers: Vec<HandlerInfo> = self.handlers.values().map(RouteHandler::info).collect();
        handlers.sort_by(|left, right| left.name.cmp(&right.name));
        handlers
    }

    pub fn coverage_report(&self) -> CoverageReport {
        let names = self.catalog.names();
        let (covered, uncovered): (Vec<String>, Vec<String>) =
            names.iter().cloned().partition(|name| self.intent_to_handler.contains_key(name));
        let coverage_percentage = if names.is_empty() {
            0.0
        } else {
            covered.len() as f64 / names.len() as f64 * 100.0
        };
        CoverageReport {
            total_intents: names.len(),
            covered_intents: covered.len(),
            uncovered_intents: uncovered,
            coverage_percentage,
        }
    }

    async fn merged_context(
        &self,
        text: &str,
        context: &RequestContext,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> RequestContext {
        let mut merged = self.context.clone();
        merged.extend(context.clone());

        if let (Some(memory), Some(session_id)) = (&self.memory, session_id) {
            match memory.build_context(session_id, user_id, text).await {
                Ok(memory_context) => merged.extend(memory_context.into_request_context()),
                Err(err) => tracing::warn!(
                    event_name = "agent.router.memory_context_failed",
                    session_id,
                    error = %err,
                    "memory context unavailable; routing without it"
                ),
            }
            merged.insert("session_id".to_string(), json!(session_id));
            merged.insert("user_id".to_string(), json!(user_id));
        }
        merged
    }

    fn resolve(&self, intent: &str) -> Option<&RouteHandler> {
        self.intent_to_handler
            .get(intent)
            .and_then(|name| self.handlers.get(name))
            .filter(|route| route.enabled)
    }

    async fn decide(
        &self,
        text: &str,
        classification: ClassificationResult,
        context: &RequestContext,
        classification_ms: f64,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> RoutingDecision {
        if classification.needs_clarification()
            || classification.confidence < self.settings.clarification_threshold
        {
            return self.clarify(text, classification, classification_ms).await;
        }

        if classification.confidence < self.settings.confidence_threshold {
            return match &self.fallback {
                Some(fallback) => {
                    self.run_fallback(fallback.as_ref(), text, classification, context, classification_ms)
                        .await
                }
                None => self.clarify(text, classification, classification_ms).await,
            };
        }

        let Some(route) = self.resolve(&classification.intent.name) else {
            if let Some(fallback) = &self.fallback {
                return self
                    .run_fallback(fallback.as_ref(), text, classification, context, classification_ms)
                    .await;
            }
            tracing::info!(
                event_name = "agent.router.no_handler",
                intent = %classification.intent.name,
                "no handler registered for intent"
            );
            let mut decision = RoutingDecision::new(RoutingOutcome::NoHandler, classification);
            decision.classification_ms = classification_ms;
            return decision;
        };

        let missing = route.missing_slots(&classification);
        if !missing.is_empty() {
            let prompt = missing.iter().map(|slot| slot_prompt(slot)).collect::<Vec<_>>().join(" ");
            tracing::debug!(
                event_name = "agent.router.missing_slots",
                handler = %route.name,
                missing = ?missing,
                "required slots missing"
            );
            let mut decision = RoutingDecision::new(RoutingOutcome::ClarificationNeeded, classification);
            decision.clarification_prompt = Some(prompt);
            decision.classification_ms = classification_ms;
            return decision;
        }

        let started = Instant::now();
        match route.handler.handle(text, &classification, context).await {
            Ok(result) => {
                let handling_ms = elapsed_ms(started);
                if let (Some(memory), Some(session_id)) = (&self.memory, session_id) {
                    if let Err(err) = memory
                        .record_interaction(session_id, text, &response_text(&result), user_id, true)
                        .await
                    {
                        tracing::warn!(
                            event_name = "agent.router.record_failed",
                            session_id,
                            error = %err,
                            "could not record interaction"
                        );
                    }
                }
                tracing::info!(
                    event_name = "agent.router.handled",
                    intent = %classification.intent.name,
                    handler = %route.name,
                    confidence = classification.confidence,
                    handling_ms,
                    "request handled"
                );
                let mut decision = RoutingDecision::new(RoutingOutcome::Handled, classification);
                decision.handler_name = Some(route.name.clone());
                decision.result = Some(result);
                decision.classification_ms = classification_ms;
                decision.handling_ms = handling_ms;
                decision
            }
            Err(err) => {
                let handling_ms = elapsed_ms(started);
                tracing::warn!(
                    event_name = "agent.router.handler_failed",
                    handler = %route.name,
                    error = %err,
                    "handler failed"
                );
                let payload = match &self.error_handler {
                    Some(error_handler) => {
                        match error_handler.on_error(text, &classification, &err, context).await {
                            Ok(payload) => Some(payload),
                            Err(handler_err) => {
                                tracing::warn!(
                                    event_name = "agent.router.error_handler_failed",
                                    error = %handler_err,
                                    "error handler failed"
                                );
                                None
                            }
                        }
                    }
                    None => None,
                };
                let mut decision = RoutingDecision::new(RoutingOutcome::Error, classification);
                decision.handler_name = Some(route.name.clone());
                decision.result = payload;
                decision.error = Some(err.to_string());
                decision.classification_ms = classification_ms;
                decision.handling_ms = handling_ms;
                decision
            }
        }
    }

    async fn run_fallback(
        &self,
        fallback: &dyn Handler,
        text: &str,
        classification: ClassificationResult,
        context: &RequestContext,
        classification_ms: f64,
    ) -> RoutingDecision {
        let started = Instant::now();
        match fallback.handle(text, &classification, context).await {
            Ok(result) => {
                let mut decision = RoutingDecision::new(RoutingOutcome::Fallback, classification);
                decision.handler_name = Some(FALLBACK_HANDLER_NAME.to_string());
                decision.result = Some(result);
                decision.classification_ms = classification_ms;
                decision.handling_ms = elapsed_ms(started);
                decision
            }
            Err(err) => {
                tracing::warn!(
                    event_name = "agent.router.fallback_failed",
                    error = %err,
                    "fallback handler failed"
                );
                let mut decision = RoutingDecision::new(RoutingOutcome::Error, classification);
                decision.error = Some(err.to_string());
                decision.classification_ms = classification_ms;
                decision
            }
        }
    }

    async fn clarify(
        &self,
        text: &str,
        classification: ClassificationResult,
        classification_ms: f64,
    ) -> RoutingDecision {
        let mut suggested: Vec<Arc<Intent>> = classification
            .alternatives
            .iter()
            .take(SUGGESTION_LIMIT)
            .map(|alternative| alternative.intent.clone())
            .collect();
        if classification.intent.category != IntentCategory::Ambiguous {
            suggested.insert(0, classification.intent.clone());
        }

        let custom = match &self.prompter {
            Some(prompter) => match prompter.prompt(text, &classification, &suggested).await {
                Ok(prompt) => prompt.filter(|prompt| !prompt.trim().is_empty()),
                Err(err) => {
                    tracing::warn!(
                        event_name = "agent.router.prompter_failed",
                        error = %err,
                        "clarification prompter failed; using default prompt"
                    );
                    None
                }
            },
            None => None,
        };
        let prompt = custom.unwrap_or_else(|| default_clarification(&suggested));

        tracing::debug!(
            event_name = "agent.router.clarification",
            intent = %classification.intent.name,
            confidence = classification.confidence,
            suggestions = suggested.len(),
            "asking for clarification"
        );
        let mut decision = RoutingDecision::new(RoutingOutcome::ClarificationNeeded, classification);
        decision.clarification_prompt = Some(prompt);
        decision.suggested_intents = suggested;
        decision.classification_ms = classification_ms;
        decision
    }
}

fn default_clarification(suggested: &[Arc<Intent>]) -> String {
    if suggested.is_empty() {
        return DEFAULT_CLARIFICATION.to_string();
    }
    let options = suggested
        .iter()
        .take(SUGGESTION_LIMIT)
        .map(|intent| format!("'{}'", intent.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("I'm not sure what you mean. Did you want to: {options}?")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use concierge_core::domain::classification::RankedIntent;
    use concierge_core::{
        ClassificationResult, ClassifierSource, IntentCatalog, RequestContext, RoutingOutcome,
    };

    use super::{Router, RouterSettings};
    use crate::classifier::IntentClassifier;
    use crate::handlers::{handler_fn, RouteHandler};

    struct Fixed {
        result: ClassificationResult,
    }

    #[async_trait]
    impl IntentClassifier for Fixed {
        fn source(&self) -> ClassifierSource {
            ClassifierSource::RuleBased
        }

        async fn classify(&self, _text: &str, _context: &RequestContext) -> ClassificationResult {
            self.result.clone()
        }
    }

    fn router(intent: &str, confidence: f64) -> (Arc<IntentCatalog>, Router) {
        let catalog = Arc::new(IntentCatalog::with_default_intents().expect("defaults"));
        let result = ClassificationResult::new(
            catalog.get_or_unknown(intent),
            confidence,
            ClassifierSource::RuleBased,
        );
        let router = Router::new(catalog.clone(), Arc::new(Fixed { result }), RouterSettings::default())
            .expect("valid settings");
        (catalog, router)
    }

    #[test]
    fn settings_reject_inverted_thresholds() {
        let settings =
            RouterSettings { confidence_threshold: 0.3, clarification_threshold: 0.5, max_retries: 0 };
        assert!(settings.validate().is_err());
    }

    #[tokio::test]
    async fn confident_match_runs_handler() {
        let (_, mut router) = router("greeting", 0.9);
        router.register_handler(
            "social",
            &["greeting", "farewell"],
            &[],
            handler_fn(|_| async { Ok::<_, anyhow::Error>(json!("hi there")) }),
        );

        let decision = router.route("hello", &RequestContext::new(), None, None).await;

        assert_eq!(decision.outcome, RoutingOutcome::Handled);
        assert_eq!(decision.handler_name.as_deref(), Some("social"));
        assert_eq!(decision.result, Some(json!("hi there")));
    }

    #[tokio::test]
    async fn low_confidence_suggests_classified_intent_first() {
        let catalog = Arc::new(IntentCatalog::with_default_intents().expect("defaults"));
        let result = ClassificationResult::new(
            catalog.get_or_unknown("file_read"),
            0.4,
            ClassifierSource::RuleBased,
        )
        .with_alternatives(vec![RankedIntent::new(catalog.get_or_unknown("web_search"), 0.2)]);
        let router = Router::new(catalog, Arc::new(Fixed { result }), RouterSettings::default())
            .expect("valid settings");

        let decision = router.route("show it", &RequestContext::new(), None, None).await;

        assert_eq!(decision.outcome, RoutingOutcome::ClarificationNeeded);
        let names: Vec<&str> =
            decision.suggested_intents.iter().map(|intent| intent.name.as_str()).collect();
        assert_eq!(names, vec!["file_read", "web_search"]);
        assert_eq!(
            decision.clarification_prompt.as_deref(),
            Some("I'm not sure what you mean. Did you want to: 'file_read', 'web_search'?")
        );
    }

    #[tokio::test]
    async fn disabled_handler_falls_back() {
        let (_, mut router) = router("greeting", 0.9);
        router.register_handler(
            "social",
            &["greeting"],
            &[],
            handler_fn(|_| async { Ok::<_, anyhow::Error>(json!("hi")) }),
        );
        router.set_fallback_handler(handler_fn(|_| async { Ok::<_, anyhow::Error>(json!("fallback")) }));
        assert!(router.set_handler_enabled("social", false));

        let decision = router.route("hello", &RequestContext::new(), None, None).await;

        assert_eq!(decision.outcome, RoutingOutcome::Fallback);
        assert_eq!(decision.handler_name.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn missing_required_slot_prompts_per_slot() {
        let (_, mut router) = router("file_read", 0.9);
        router.register(
            RouteHandler::new(
                "files",
                &["file_read"],
                handler_fn(|_| async { Ok::<_, anyhow::Error>(json!(null)) }),
            )
            .with_required_slots(&["path", "encoding"]),
        );

        let decision = router.route("read it", &RequestContext::new(), None, None).await;

        assert_eq!(decision.outcome, RoutingOutcome::ClarificationNeeded);
        assert_eq!(
            decision.clarification_prompt.as_deref(),
            Some("What file or path should I use? Please provide: encoding")
        );
    }

    #[tokio::test]
    async fn retry_threads_attempt_counter_until_success() {
        let (_, mut router) = router("greeting", 0.9);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        router.register_handler(
            "flaky",
            &["greeting"],
            &[],
            handler_fn(move |request| {
                let calls = seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match request.context.get("retry_attempt") {
                        Some(attempt) if attempt == &json!(2) => Ok(json!("recovered")),
                        _ => Err(anyhow::anyhow!("transient failure")),
                    }
                }
            }),
        );

        let decision = router.route_with_retry("hello", &RequestContext::new(), None, None, 3).await;

        assert_eq!(decision.outcome, RoutingOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn coverage_counts_mapped_intents() {
        let (catalog, mut router) = router("greeting", 0.9);
        router.register_handler(
            "social",
            &["greeting", "farewell"],
            &[],
            handler_fn(|_| async { Ok::<_, anyhow::Error>(json!(null)) }),
        );

        let report = router.coverage_report();

        assert_eq!(report.total_intents, catalog.len());
        assert_eq!(report.covered_intents, 2);
        assert!(!report.uncovered_intents.contains(&"greeting".to_string()));
        assert!(report.uncovered_intents.contains(&"unknown".to_string()));
    }
}
