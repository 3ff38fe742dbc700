use regex::{Regex, RegexBuilder};

use concierge_core::DomainError;

pub const EXTRACTED_FACT_CONFIDENCE: f64 = 0.7;

const FACT_PATTERNS: &[(&str, &str)] = &[
    (r"(?:i|my)\s+(?:prefer|like|love|enjoy)\s+(.+)", "preferences"),
    (r"(?:i|my)\s+(?:hate|dislike|don't like)\s+(.+)", "dislikes"),
    (r"(?:i'm|i am)\s+(?:a|an)\s+(.+)", "identity"),
    (r"(?:i|my)\s+(?:work|job)\s+(?:is|as|at)\s+(.+)", "work"),
    (r"(?:call me|my name is)\s+(.+)", "name"),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedFact {
    pub content: String,
    pub category: String,
}

/// Pulls self-descriptions ("I prefer ...", "my name is ...") out of user text.
pub struct FactExtractor {
    patterns: Vec<(Regex, &'static str)>,
}

impl FactExtractor {
    pub fn new() -> Result<Self, DomainError> {
        let patterns = FACT_PATTERNS
            .iter()
            .map(|(pattern, category)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|regex| (regex, *category))
                    .map_err(|err| DomainError::InvalidIntentPattern {
                        intent: format!("fact:{category}"),
                        pattern: (*pattern).to_string(),
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn extract(&self, text: &str) -> Vec<ExtractedFact> {
        let mut facts = Vec::new();
        for (pattern, category) in &self.patterns {
            for captures in pattern.captures_iter(text) {
                let Some(content) = captures.get(1).map(|group| group.as_str().trim()) else {
                    continue;
                };
                if !content.is_empty() {
                    facts.push(ExtractedFact {
                        content: content.to_string(),
                        category: (*category).to_string(),
                    });
                }
            }
        }
        facts
    }
}

#[cfg(test)]
mod tests {
    use super::FactExtractor;

    #[test]
    fn extracts_each_category() {
        let extractor = FactExtractor::new().expect("patterns compile");

        let cases = [
            ("I prefer tabs over spaces", "preferences", "tabs over spaces"),
            ("honestly I hate meetings", "dislikes", "meetings"),
            ("I'm a backend developer", "identity", "backend developer"),
            ("My job is teaching", "work", "teaching"),
            ("Call me Sam", "name", "Sam"),
        ];
        for (text, category, content) in cases {
            let facts = extractor.extract(text);
            assert!(
                facts.iter().any(|fact| fact.category == category && fact.content == content),
                "expected {category} fact `{content}` from `{text}`, got {facts:?}"
            );
        }
    }

    #[test]
    fn plain_requests_yield_nothing() {
        let extractor = FactExtractor::new().expect("patterns compile");
        assert!(extractor.extract("open the report").is_empty());
    }
}
