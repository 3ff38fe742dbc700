//! Intent routing and tiered memory for a conversational assistant.
//!
//! A request flows through three stages:
//! 1. **Classification** (`rules`, `classifier`, `ensemble`): a deterministic keyword/pattern
//!    scorer and an optional local inference provider, combined under one of four strategies.
//! 2. **Routing** (`router`, `handlers`): a decision state machine that asks for clarification,
//!    falls back, or dispatches to a registered handler.
//! 3. **Memory** (`memory`): session history, user facts and approved learnings that feed the
//!    next request's context.
//!
//! The inference provider only ever labels text. Handlers decide what happens next.

pub mod bootstrap;
pub mod classifier;
pub mod ensemble;
pub mod handlers;
pub mod llm;
pub mod memory;
pub mod router;
pub mod rules;

pub use classifier::{IntentClassifier, LlmClassifier};
pub use ensemble::{EnsembleClassifier, EnsembleSettings};
pub use handlers::{handler_fn, Handler, HandlerRequest, RouteHandler};
pub use memory::{MemoryContext, MemoryManager, MemorySettings};
pub use router::{Router, RouterSettings};
pub use rules::RuleScorer;
