//! The governance ring — post-hoc validation of autonomous-agent
//! output.
//!
//! Agents commit optimistically; this ring reviews the committed output
//! against guardrails and the constitution, updates the agent's trust
//! score, and tells the driver whether to keep the commit or roll it
//! back with corrective feedback.

pub mod constitution;
pub mod guardrails;
pub mod masking;
pub mod ring;
pub mod trust;

pub use constitution::{default_constitution, get_constitution, ClauseSeverity, ConstitutionalClause};
pub use guardrails::{
    AgentActivity, GuardrailConfig, GuardrailReport, Guardrails, Violation, ViolationKind,
};
pub use masking::{MaskOutcome, PiiKind, RetroactiveMasker};
pub use ring::{AgentReview, GovernanceDecision, GovernanceRing};
pub use trust::{GovernanceMode, TrustEvent, TrustScoreManager, TrustScoreState, TrustTrend};
