use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use concierge_core::{MemoryEntry, Role, StoredMessage};

use crate::llm::LlmClient;

const TOPIC_COUNT: usize = 5;
const MIN_TOPIC_LEN: usize = 3;
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "i", "you", "it", "to", "for", "of", "in", "on",
    "and", "or", "but", "with", "this", "that", "can", "do", "what", "how", "please", "help", "me",
    "my",
];

/// Condenses session transcripts and clusters of user facts.
///
/// Uses the inference provider when one is configured; transcripts fall back to a keyword
/// frequency heuristic when it is absent or fails.
#[derive(Clone, Default)]
pub struct MemorySummarizer {
    llm: Option<Arc<dyn LlmClient>>,
}

impl MemorySummarizer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn summarize_session(&self, messages: &[StoredMessage]) -> String {
        if messages.is_empty() {
            return String::new();
        }

        if let Some(llm) = &self.llm {
            let conversation = messages
                .iter()
                .map(|stored| format!("{}: {}", stored.message.role.as_str(), stored.message.content))
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "Summarize this conversation in 2-3 sentences, focusing on:\n\
                 - Key topics discussed\n\
                 - Decisions made\n\
                 - Action items or follow-ups\n\n\
                 Conversation:\n{conversation}\n\n\
                 Summary:"
            );
            match llm.complete(&prompt).await {
                Ok(summary) if !summary.trim().is_empty() => return summary.trim().to_string(),
                Ok(_) => {
                    tracing::warn!(
                        event_name = "agent.memory.summary_empty",
                        "summarizer returned an empty summary; using heuristic"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event_name = "agent.memory.summary_failed",
                        error = %err,
                        "summarizer failed; using heuristic"
                    );
                }
            }
        }

        heuristic_summary(messages)
    }

    /// Returns `None` without a provider or when the provider fails.
    pub async fn consolidate_facts(&self, facts: &[MemoryEntry]) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let listed =
            facts.iter().map(|fact| format!("- {}", fact.content)).collect::<Vec<_>>().join("\n");
        let prompt = format!(
            "Consolidate these related facts about the user into 1-2 key points:\n\n\
             {listed}\n\n\
             Consolidated facts (one per line):"
        );

        match llm.complete(&prompt).await {
            Ok(summary) if !summary.trim().is_empty() => Some(summary.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    event_name = "agent.memory.consolidation_failed",
                    error = %err,
                    facts = facts.len(),
                    "fact consolidation failed; keeping highest-confidence facts"
                );
                None
            }
        }
    }
}

/// `Discussed: <top words>. N messages exchanged.` built from user turns only.
pub fn heuristic_summary(messages: &[StoredMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let text = messages
        .iter()
        .filter(|stored| stored.message.role == Role::User)
        .map(|stored| stored.message.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let words = text.split(|c: char| !(c.is_alphanumeric() || c == '_')).filter(|word| !word.is_empty());
    for word in words {
        if stop_words.contains(word) || word.chars().count() < MIN_TOPIC_LEN {
            continue;
        }
        let count = counts.entry(word).or_insert(0);
        if *count == 0 {
            order.push(word);
        }
        *count += 1;
    }

    // Stable sort keeps first-seen order among equally frequent words.
    order.sort_by(|left, right| counts[right].cmp(&counts[left]));
    let topics: Vec<&str> = order.into_iter().take(TOPIC_COUNT).collect();

    if topics.is_empty() {
        format!("Session with {} messages.", messages.len())
    } else {
        format!("Discussed: {}. {} messages exchanged.", topics.join(", "), messages.len())
    }
}
