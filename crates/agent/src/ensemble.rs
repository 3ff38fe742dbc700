//! Combines the rule scorer and the inference-backed classifier under a fixed strategy.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use concierge_core::config::{ClassifierConfig, EnsembleStrategy};
use concierge_core::domain::classification::RankedIntent;
use concierge_core::{
    ClassificationResult, ClassifierSource, DomainError, Intent, IntentCatalog, RequestContext,
};

use crate::classifier::IntentClassifier;

#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleSettings {
    pub strategy: EnsembleStrategy,
    pub rule_confidence_threshold: f64,
    pub verify_threshold: f64,
    pub rule_weight: f64,
    pub llm_weight: f64,
    /// Below this the provider's opinion is treated as weak under `rule_first`.
    pub llm_floor: f64,
    /// Both sources below this under `consensus` yields `ambiguous`.
    pub consensus_floor: f64,
    pub ambiguous_confidence: f64,
    pub verify_penalty: f64,
    pub consensus_penalty: f64,
    pub rule_short_circuit: Option<f64>,
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            strategy: EnsembleStrategy::RuleFirst,
            rule_confidence_threshold: 0.7,
            verify_threshold: 0.85,
            rule_weight: 0.4,
            llm_weight: 0.6,
            llm_floor: 0.3,
            consensus_floor: 0.6,
            ambiguous_confidence: 0.3,
            verify_penalty: 0.9,
            consensus_penalty: 0.8,
            rule_short_circuit: None,
        }
    }
}

impl EnsembleSettings {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            strategy: config.strategy,
            rule_confidence_threshold: config.rule_confidence_threshold,
            verify_threshold: config.verify_threshold,
            rule_weight: config.rule_weight,
            llm_weight: config.llm_weight,
            rule_short_circuit: config.rule_short_circuit,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: EnsembleStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        let unit_fields = [
            ("rule_confidence_threshold", self.rule_confidence_threshold),
            ("verify_threshold", self.verify_threshold),
            ("llm_floor", self.llm_floor),
            ("consensus_floor", self.consensus_floor),
            ("ambiguous_confidence", self.ambiguous_confidence),
            ("verify_penalty", self.verify_penalty),
            ("consensus_penalty", self.consensus_penalty),
        ];
        for (field, value) in unit_fields {
            ensure_unit(field, value)?;
        }
        if let Some(threshold) = self.rule_short_circuit {
            ensure_unit("rule_short_circuit", threshold)?;
        }

        if !(self.rule_weight >= 0.0 && self.llm_weight >= 0.0) {
            return Err(DomainError::InvalidClassifierSettings(format!(
                "weights must be non-negative (rule_weight={}, llm_weight={})",
                self.rule_weight, self.llm_weight
            )));
        }
        if self.rule_weight + self.llm_weight <= 0.0 {
            return Err(DomainError::InvalidClassifierSettings(
                "rule_weight + llm_weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn ensure_unit(field: &str, value: f64) -> Result<(), DomainError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DomainError::InvalidClassifierSettings(format!("{field} must be within [0, 1], got {value}")))
    }
}

pub struct EnsembleClassifier {
    catalog: Arc<IntentCatalog>,
    rule: Arc<dyn IntentClassifier>,
    llm: Arc<dyn IntentClassifier>,
    settings: EnsembleSettings,
}

impl EnsembleClassifier {
    pub fn new(
        catalog: Arc<IntentCatalog>,
        rule: Arc<dyn IntentClassifier>,
        llm: Arc<dyn IntentClassifier>,
        settings: EnsembleSettings,
    ) -> Result<Self, DomainError> {
        settings.validate()?;
        Ok(Self { catalog, rule, llm, settings })
    }

    pub fn settings(&self) -> &EnsembleSettings {
        &self.settings
    }

    async fn rule_first(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        let rule = self.rule.classify(text, context).await;
        if rule.confidence >= self.settings.rule_confidence_threshold {
            return rule_only(rule);
        }

        let llm = self.llm.classify(text, context).await;
        if llm.confidence <= 0.0 {
            return no_opinion(rule, llm);
        }

        let agreement = if same_intent(&rule, &llm) { 1.0 } else { 0.5 };
        if llm.confidence < self.settings.llm_floor {
            let reasoning = llm.reasoning.clone();
            let better = if rule.confidence >= llm.confidence { rule } else { llm };
            return combined(better.intent, better.confidence)
                .with_slots(better.slots)
                .with_reasoning(reasoning)
                .with_agreement(agreement);
        }

        let alternatives = if same_intent(&rule, &llm) {
            Vec::new()
        } else {
            vec![RankedIntent::new(rule.intent.clone(), rule.confidence)]
        };
        combined(llm.intent.clone(), llm.confidence)
            .with_slots(merge_slots(&rule.slots, &llm.slots))
            .with_reasoning(llm.reasoning)
            .with_agreement(agreement)
            .with_alternatives(alternatives)
    }

    async fn weighted_vote(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        let (rule, llm) = match self.run_both(text, context).await {
            Ok(pair) => pair,
            Err(short_circuited) => return short_circuited,
        };
        if llm.confidence <= 0.0 {
            return no_opinion(rule, llm);
        }

        // Insertion order breaks ties in favour of the rule vote.
        let mut votes: Vec<(Arc<Intent>, f64)> = Vec::with_capacity(2);
        add_vote(&mut votes, &rule.intent, rule.confidence * self.settings.rule_weight);
        add_vote(&mut votes, &llm.intent, llm.confidence * self.settings.llm_weight);
        votes.sort_by(|left, right| right.1.total_cmp(&left.1));

        let (winner, winning_vote) = votes[0].clone();
        let total_weight = self.settings.rule_weight + self.settings.llm_weight;
        let raw_scores: BTreeMap<String, f64> =
            votes.iter().map(|(intent, vote)| (intent.name.clone(), *vote)).collect();
        let alternatives = votes
            .iter()
            .skip(1)
            .take(2)
            .map(|(intent, vote)| RankedIntent::new(intent.clone(), *vote))
            .collect();

        combined(winner, winning_vote / total_weight)
            .with_raw_scores(raw_scores)
            .with_slots(merge_slots(&rule.slots, &llm.slots))
            .with_reasoning(llm.reasoning.clone())
            .with_agreement(if same_intent(&rule, &llm) { 1.0 } else { 0.0 })
            .with_alternatives(alternatives)
    }

    async fn llm_verify(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        let rule = self.rule.classify(text, context).await;
        if rule.confidence >= self.settings.verify_threshold {
            return rule_only(rule);
        }

        let llm = self.llm.classify(text, context).await;
        if llm.confidence <= 0.0 {
            return no_opinion(rule, llm);
        }

        if same_intent(&rule, &llm) {
            return combined(rule.intent.clone(), ((rule.confidence + llm.confidence) / 1.5).min(1.0))
                .with_slots(merge_slots(&rule.slots, &llm.slots))
                .with_reasoning(format!("Verified by LLM: {}", llm.reasoning))
                .with_agreement(1.0);
        }

        let penalty = self.settings.verify_penalty;
        if llm.confidence > rule.confidence {
            return combined(llm.intent.clone(), llm.confidence * penalty)
                .with_slots(llm.slots.clone())
                .with_reasoning(format!("LLM override: {}", llm.reasoning))
                .with_agreement(0.0)
                .with_alternatives(vec![RankedIntent::new(rule.intent.clone(), rule.confidence)]);
        }

        combined(rule.intent.clone(), rule.confidence * penalty)
            .with_slots(rule.slots.clone())
            .with_reasoning(format!("Rules preferred (LLM suggested: {})", llm.intent.name))
            .with_agreement(0.0)
            .with_alternatives(vec![RankedIntent::new(llm.intent.clone(), llm.confidence)])
    }

    async fn consensus(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        let (rule, llm) = match self.run_both(text, context).await {
            Ok(pair) => pair,
            Err(short_circuited) => return short_circuited,
        };
        if llm.confidence <= 0.0 {
            return no_opinion(rule, llm);
        }

        if same_intent(&rule, &llm) {
            return combined(rule.intent.clone(), (rule.confidence + llm.confidence) / 2.0)
                .with_slots(merge_slots(&rule.slots, &llm.slots))
                .with_reasoning(format!("Consensus: {}", llm.reasoning))
                .with_agreement(1.0);
        }

        let floor = self.settings.consensus_floor;
        if rule.confidence < floor && llm.confidence < floor {
            return combined(self.catalog.ambiguous(), self.settings.ambiguous_confidence)
                .with_reasoning(format!(
                    "No consensus: rules say {}, LLM says {}",
                    rule.intent.name, llm.intent.name
                ))
                .with_agreement(0.0)
                .with_alternatives(vec![
                    RankedIntent::new(rule.intent.clone(), rule.confidence),
                    RankedIntent::new(llm.intent.clone(), llm.confidence),
                ]);
        }

        let (confident, other) = if rule.confidence > llm.confidence { (rule, llm) } else { (llm, rule) };
        combined(confident.intent.clone(), confident.confidence * self.settings.consensus_penalty)
            .with_slots(confident.slots)
            .with_reasoning(format!("No consensus (other classifier suggested: {})", other.intent.name))
            .with_agreement(0.0)
            .with_alternatives(vec![RankedIntent::new(other.intent, other.confidence)])
    }

    /// Runs both sources concurrently unless the configured short circuit lets the rule result
    /// stand on its own, in which case that result is returned as `Err`.
    async fn run_both(
        &self,
        text: &str,
        context: &RequestContext,
    ) -> Result<(ClassificationResult, ClassificationResult), ClassificationResult> {
        if let Some(threshold) = self.settings.rule_short_circuit {
            let rule = self.rule.classify(text, context).await;
            if rule.confidence >= threshold {
                return Err(rule_only(rule));
            }
            let llm = self.llm.classify(text, context).await;
            return Ok((rule, llm));
        }

        Ok(tokio::join!(self.rule.classify(text, context), self.llm.classify(text, context)))
    }
}

#[async_trait]
impl IntentClassifier for EnsembleClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::Ensemble
    }

    async fn classify(&self, text: &str, context: &RequestContext) -> ClassificationResult {
        let result = match self.settings.strategy {
            EnsembleStrategy::RuleFirst => self.rule_first(text, context).await,
            EnsembleStrategy::WeightedVote => self.weighted_vote(text, context).await,
            EnsembleStrategy::LlmVerify => self.llm_verify(text, context).await,
            EnsembleStrategy::Consensus => self.consensus(text, context).await,
        };

        tracing::debug!(
            event_name = "agent.classifier.ensemble",
            strategy = self.settings.strategy.as_str(),
            intent = %result.intent.name,
            confidence = result.confidence,
            agreement = result.agreement,
            contributors = result.contributing.len(),
            "ensemble classification complete"
        );
        result
    }
}

fn combined(intent: Arc<Intent>, confidence: f64) -> ClassificationResult {
    ClassificationResult::new(intent, confidence, ClassifierSource::Ensemble)
        .with_contributing(vec![ClassifierSource::RuleBased, ClassifierSource::LocalLlm])
}

fn rule_only(rule: ClassificationResult) -> ClassificationResult {
    ClassificationResult::new(rule.intent, rule.confidence, ClassifierSource::Ensemble)
        .with_raw_scores(rule.raw_scores)
        .with_slots(rule.slots)
        .with_alternatives(rule.alternatives)
        .with_contributing(vec![ClassifierSource::RuleBased])
        .with_agreement(1.0)
}

/// A zero-confidence provider answer carries no opinion; the rule result stands.
fn no_opinion(rule: ClassificationResult, llm: ClassificationResult) -> ClassificationResult {
    let agreement = if same_intent(&rule, &llm) { 1.0 } else { 0.5 };
    combined(rule.intent, rule.confidence)
        .with_raw_scores(rule.raw_scores)
        .with_slots(rule.slots)
        .with_alternatives(rule.alternatives)
        .with_reasoning(llm.reasoning)
        .with_agreement(agreement)
}

fn same_intent(left: &ClassificationResult, right: &ClassificationResult) -> bool {
    left.intent.name == right.intent.name
}

/// Provider slots win key collisions.
fn merge_slots(
    rule: &BTreeMap<String, Value>,
    llm: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut merged = rule.clone();
    merged.extend(llm.iter().map(|(key, value)| (key.clone(), value.clone())));
    merged
}

fn add_vote(votes: &mut Vec<(Arc<Intent>, f64)>, intent: &Arc<Intent>, vote: f64) {
    match votes.iter_mut().find(|(existing, _)| existing.name == intent.name) {
        Some(entry) => entry.1 += vote,
        None => votes.push((intent.clone(), vote)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;

    use concierge_core::config::EnsembleStrategy;
    use concierge_core::{
        ClassificationResult, ClassifierSource, IntentCatalog, RequestContext,
    };

    use super::{EnsembleClassifier, EnsembleSettings};
    use crate::classifier::IntentClassifier;

    struct Fixed {
        catalog: Arc<IntentCatalog>,
        source: ClassifierSource,
        intent: &'static str,
        confidence: f64,
        slots: Vec<(&'static str, &'static str)>,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(
            catalog: &Arc<IntentCatalog>,
            source: ClassifierSource,
            intent: &'static str,
            confidence: f64,
        ) -> Arc<Self> {
            Self::with_slots(catalog, source, intent, confidence, Vec::new())
        }

        fn with_slots(
            catalog: &Arc<IntentCatalog>,
            source: ClassifierSource,
            intent: &'static str,
            confidence: f64,
            slots: Vec<(&'static str, &'static str)>,
        ) -> Arc<Self> {
            Arc::new(Self {
                catalog: catalog.clone(),
                source,
                intent,
                confidence,
                slots,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IntentClassifier for Fixed {
        fn source(&self) -> ClassifierSource {
            self.source
        }

        async fn classify(&self, _text: &str, _context: &RequestContext) -> ClassificationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let slots = self
                .slots
                .iter()
                .map(|(key, value)| (key.to_string(), Value::from(*value)))
                .collect();
            ClassificationResult::new(self.catalog.get_or_unknown(self.intent), self.confidence, self.source)
                .with_slots(slots)
                .with_reasoning(format!("{} thinks {}", self.source, self.intent))
        }
    }

    fn catalog() -> Arc<IntentCatalog> {
        Arc::new(IntentCatalog::with_default_intents().expect("defaults"))
    }

    fn ensemble(
        catalog: &Arc<IntentCatalog>,
        rule: Arc<Fixed>,
        llm: Arc<Fixed>,
        strategy: EnsembleStrategy,
    ) -> EnsembleClassifier {
        EnsembleClassifier::new(
            catalog.clone(),
            rule,
            llm,
            EnsembleSettings::default().with_strategy(strategy),
        )
        .expect("valid settings")
    }

    async fn run(classifier: &EnsembleClassifier) -> ClassificationResult {
        classifier.classify("some text", &RequestContext::new()).await
    }

    #[tokio::test]
    async fn rule_first_adopts_provider_and_merges_slots() {
        let catalog = catalog();
        let rule = Fixed::with_slots(
            &catalog,
            ClassifierSource::RuleBased,
            "file_read",
            0.4,
            vec![("path", "a.txt"), ("mode", "text")],
        );
        let llm = Fixed::with_slots(&catalog, ClassifierSource::LocalLlm, "file_create", 0.8, vec![("path", "b.txt")]);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::RuleFirst)).await;

        assert_eq!(result.intent_name(), "file_create");
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.agreement, 0.5);
        assert_eq!(result.slots.get("path"), Some(&Value::from("b.txt")));
        assert_eq!(result.slots.get("mode"), Some(&Value::from("text")));
        assert_eq!(result.alternatives.len(), 1);
        assert_eq!(result.alternatives[0].intent.name, "file_read");
    }

    #[tokio::test]
    async fn rule_first_keeps_rule_when_provider_is_weak() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "greeting", 0.2);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "farewell", 0.2);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::RuleFirst)).await;

        assert_eq!(result.intent_name(), "greeting");
        assert_eq!(result.confidence, 0.2);
        assert_eq!(result.contributing, vec![ClassifierSource::RuleBased, ClassifierSource::LocalLlm]);
    }

    #[tokio::test]
    async fn weighted_vote_normalises_by_total_weight() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "web_search", 0.5);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "factual_question", 0.5);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::WeightedVote)).await;

        // rule vote 0.2, provider vote 0.3
        assert_eq!(result.intent_name(), "factual_question");
        assert!((result.confidence - 0.3).abs() < 1e-9);
        assert_eq!(result.agreement, 0.0);
        assert_eq!(result.alternatives[0].intent.name, "web_search");
    }

    #[tokio::test]
    async fn weighted_vote_short_circuit_skips_provider() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "greeting", 0.95);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "farewell", 0.9);
        let settings = EnsembleSettings {
            strategy: EnsembleStrategy::WeightedVote,
            rule_short_circuit: Some(0.9),
            ..EnsembleSettings::default()
        };
        let classifier =
            EnsembleClassifier::new(catalog.clone(), rule, llm.clone(), settings).expect("valid settings");

        let result = run(&classifier).await;

        assert_eq!(result.intent_name(), "greeting");
        assert_eq!(result.contributing, vec![ClassifierSource::RuleBased]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn llm_verify_agreement_boosts_confidence() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "code_debug", 0.6);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "code_debug", 0.6);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::LlmVerify)).await;

        assert_eq!(result.intent_name(), "code_debug");
        assert!((result.confidence - 0.8).abs() < 1e-9);
        assert!(result.reasoning.starts_with("Verified by LLM"));
    }

    #[tokio::test]
    async fn llm_verify_disagreement_penalises_winner() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "code_review", 0.5);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "code_refactor", 0.8);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::LlmVerify)).await;

        assert_eq!(result.intent_name(), "code_refactor");
        assert!((result.confidence - 0.72).abs() < 1e-9);
        assert_eq!(result.agreement, 0.0);
        assert_eq!(result.alternatives.len(), 1);
        assert_eq!(result.alternatives[0].intent.name, "code_review");
    }

    #[tokio::test]
    async fn consensus_with_one_confident_source_applies_penalty() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "lights_control", 0.9);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "thermostat_control", 0.5);
        let result = run(&ensemble(&catalog, rule, llm, EnsembleStrategy::Consensus)).await;

        assert_eq!(result.intent_name(), "lights_control");
        assert!((result.confidence - 0.72).abs() < 1e-9);
        assert_eq!(result.reasoning, "No consensus (other classifier suggested: thermostat_control)");
    }

    #[tokio::test]
    async fn silent_provider_leaves_rule_result_standing() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "help_request", 0.45);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "unknown", 0.0);

        for strategy in [
            EnsembleStrategy::RuleFirst,
            EnsembleStrategy::WeightedVote,
            EnsembleStrategy::LlmVerify,
            EnsembleStrategy::Consensus,
        ] {
            let result = run(&ensemble(&catalog, rule.clone(), llm.clone(), strategy)).await;
            assert_eq!(result.intent_name(), "help_request", "strategy {strategy:?}");
            assert_eq!(result.confidence, 0.45, "strategy {strategy:?}");
            assert_eq!(
                result.contributing,
                vec![ClassifierSource::RuleBased, ClassifierSource::LocalLlm]
            );
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let catalog = catalog();
        let rule = Fixed::new(&catalog, ClassifierSource::RuleBased, "greeting", 0.9);
        let llm = Fixed::new(&catalog, ClassifierSource::LocalLlm, "greeting", 0.9);

        let negative = EnsembleSettings { rule_weight: -0.1, ..EnsembleSettings::default() };
        assert!(EnsembleClassifier::new(catalog.clone(), rule.clone(), llm.clone(), negative).is_err());

        let zero = EnsembleSettings { rule_weight: 0.0, llm_weight: 0.0, ..EnsembleSettings::default() };
        assert!(EnsembleClassifier::new(catalog.clone(), rule.clone(), llm.clone(), zero).is_err());

        let threshold = EnsembleSettings { verify_threshold: 1.5, ..EnsembleSettings::default() };
        assert!(EnsembleClassifier::new(catalog, rule, llm, threshold).is_err());
    }
}
