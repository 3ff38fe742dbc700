use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    SystemCommand,
    SystemQuery,
    Search,
    Question,
    Explanation,
    CodeWrite,
    CodeDebug,
    CodeReview,
    CodeRefactor,
    Calendar,
    Reminder,
    Email,
    Note,
    Greeting,
    Farewell,
    Gratitude,
    SmallTalk,
    Cancel,
    Undo,
    Repeat,
    Help,
    Settings,
    HomeAutomation,
    Ambiguous,
    Unknown,
    MultiIntent,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemCommand => "system_command",
            Self::SystemQuery => "system_query",
            Self::Search => "search",
            Self::Question => "question",
            Self::Explanation => "explanation",
            Self::CodeWrite => "code_write",
            Self::CodeDebug => "code_debug",
            Self::CodeReview => "code_review",
            Self::CodeRefactor => "code_refactor",
            Self::Calendar => "calendar",
            Self::Reminder => "reminder",
            Self::Email => "email",
            Self::Note => "note",
            Self::Greeting => "greeting",
            Self::Farewell => "farewell",
            Self::Gratitude => "gratitude",
            Self::SmallTalk => "small_talk",
            Self::Cancel => "cancel",
            Self::Undo => "undo",
            Self::Repeat => "repeat",
            Self::Help => "help",
            Self::Settings => "settings",
            Self::HomeAutomation => "home_automation",
            Self::Ambiguous => "ambiguous",
            Self::Unknown => "unknown",
            Self::MultiIntent => "multi_intent",
        }
    }
}

/// A labeled kind of user request together with the hints used to match it.
///
/// Intents are immutable once registered in an [`crate::catalog::IntentCatalog`];
/// custom intents can be declared in TOML using the same field names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Matched case-insensitively as substrings of the input.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regular expressions, compiled case-insensitively at registration.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub negative_examples: Vec<String>,
    #[serde(default)]
    pub handler_name: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub requires_auth: bool,
    /// Added to the rule score once any keyword or pattern matched.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub required_slots: Vec<String>,
    #[serde(default)]
    pub optional_slots: Vec<String>,
}

impl Intent {
    pub fn new(name: impl Into<String>, category: IntentCategory) -> Self {
        Self {
            category,
            name: name.into(),
            description: String::new(),
            keywords: Vec::new(),
            patterns: Vec::new(),
            examples: Vec::new(),
            negative_examples: Vec::new(),
            handler_name: None,
            requires_confirmation: false,
            requires_auth: false,
            priority: 0,
            required_slots: Vec::new(),
            optional_slots: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = to_owned_list(keywords);
        self
    }

    pub fn with_patterns(mut self, patterns: &[&str]) -> Self {
        self.patterns = to_owned_list(patterns);
        self
    }

    pub fn with_examples(mut self, examples: &[&str]) -> Self {
        self.examples = to_owned_list(examples);
        self
    }

    pub fn with_negative_examples(mut self, examples: &[&str]) -> Self {
        self.negative_examples = to_owned_list(examples);
        self
    }

    pub fn with_handler(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_required_slots(mut self, slots: &[&str]) -> Self {
        self.required_slots = to_owned_list(slots);
        self
    }

    pub fn with_optional_slots(mut self, slots: &[&str]) -> Self {
        self.optional_slots = to_owned_list(slots);
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    /// Required slots first, then optional ones.
    pub fn declared_slots(&self) -> impl Iterator<Item = &str> {
        self.required_slots.iter().chain(self.optional_slots.iter()).map(String::as_str)
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.category, IntentCategory::Unknown | IntentCategory::Ambiguous)
    }
}

fn to_owned_list(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
