use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid pattern `{pattern}` on intent `{intent}`: {message}")]
    InvalidIntentPattern { intent: String, pattern: String, message: String },
    #[error("invalid classifier settings: {0}")]
    InvalidClassifierSettings(String),
    #[error("unknown pending learning `{0}`")]
    UnknownPendingLearning(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Whether the failure comes from an outside system and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Integration(_))
    }
}
