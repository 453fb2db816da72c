//! The segment runner — executes one segment's nodes and computes the
//! transition to the next.
//!
//! Node handlers plug in through a registry keyed by node type; routing
//! decisions go through the resolver's whitelist and ring policy; LLM
//! prompts are rendered from state templates, with self-heal advice
//! injected idempotently.

pub mod advice;
pub mod context;
pub mod handler;
pub mod heal;
pub mod llm;
pub mod mask;
pub mod routing;
pub mod runner;
pub mod template;

pub use context::RunContext;
pub use handler::{default_registry, HandlerRegistry, NodeHandler};
pub use heal::{ErrorCategory, ErrorClassifier};
pub use llm::{LlmClient, LlmRequest, LlmResponse, ScriptedLlmClient};
pub use routing::{RouteTarget, RoutingResolver};
pub use runner::{
    BranchSpec, SegmentFailure, SegmentOutcome, SegmentRunner, SegmentStatus, Transition,
};
