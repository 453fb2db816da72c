//! Error types for Capstan

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("routing ambiguity: node {node} has {outgoing} outgoing edges and no __next_node")]
    RoutingAmbiguity { node: String, outgoing: usize },

    #[error("invalid routing target: {0}")]
    InvalidTarget(String),

    #[error("unauthorized routing: {0}")]
    UnauthorizedRouting(String),

    #[error("state hydration failed: {0}")]
    StateHydration(String),

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("loop limit exceeded: {0}")]
    LoopLimitExceeded(String),

    #[error("recursion limit: {0}")]
    RecursionLimit(String),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("operator error: {node} - {message}")]
    Operator { node: String, message: String },

    #[error("llm error: {provider} - {message}")]
    Llm { provider: String, message: String },

    #[error("guardrail violation: {clause} - {message}")]
    Guardrail { clause: String, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn operator(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operator {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Llm {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn guardrail(clause: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Guardrail {
            clause: clause.into(),
            message: message.into(),
        }
    }

    /// Short stable code for the user-visible `error` field on an
    /// execution record. Full messages never leave the core unsanitized.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::AuthFailed { .. } => "AuthenticationError",
            Self::NotFound(_) => "NotFound",
            Self::RoutingAmbiguity { .. } => "RoutingAmbiguityError",
            Self::InvalidTarget(_) => "InvalidTargetError",
            Self::UnauthorizedRouting(_) => "UnauthorizedRoutingError",
            Self::StateHydration(_) => "StateHydrationFailed",
            Self::StorageCorruption(_) => "StorageCorruption",
            Self::LoopLimitExceeded(_) => "LoopLimitExceeded",
            Self::RecursionLimit(_) => "RecursionLimit",
            Self::ResourceExhaustion(_) => "ResourceExhaustion",
            Self::Operator { .. } => "DeterministicOperatorError",
            Self::Llm { .. } => "LlmError",
            Self::Guardrail { .. } => "GuardrailViolation",
            Self::Conflict(_) => "Conflict",
            Self::Config(_) => "ConfigError",
            Self::Storage(_) => "StorageError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Internal(_) => "InternalError",
        }
    }
}
