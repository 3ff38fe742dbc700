pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;
pub mod similarity;

pub use catalog::{CatalogEntry, CatalogError, IntentCatalog, AMBIGUOUS_INTENT, UNKNOWN_INTENT};
pub use domain::classification::{
    ClassificationResult, ClassifierSource, RankedIntent, RequestContext,
};
pub use domain::intent::{Intent, IntentCategory};
pub use domain::memory::{
    MemoryEntry, MemoryStats, MemoryType, Message, PendingLearning, Role, StoredMessage,
};
pub use domain::routing::{RoutingDecision, RoutingOutcome};
pub use errors::{ApplicationError, DomainError};
