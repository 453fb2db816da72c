//! The post-sync hook.
//!
//! Agents commit first; the ring reviews afterwards. The contract with
//! the driver is deliberately narrow: given the committed manifest id
//! and the agent's output, return Accept or Reject (plus the softer
//! Warn/Escalate shades). Rollback itself stays in the kernel — the
//! ring never touches storage.

use crate::constitution::{ClauseSeverity, ConstitutionalClause};
use crate::guardrails::{AgentActivity, GuardrailConfig, GuardrailReport, Guardrails};
use crate::trust::{GovernanceMode, TrustEvent, TrustScoreManager, TrustTrend};
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum GovernanceDecision {
    Accept,
    /// Log-and-continue.
    Warn { feedback: String },
    /// Needs a human; the driver surfaces it as a HITP-style pause or
    /// terminal failure depending on workflow config.
    Escalate {
        feedback: String,
        anomaly_score: f64,
    },
    /// Roll back the commit and feed the advice into the next turn.
    Reject {
        feedback: String,
        anomaly_score: f64,
    },
}

impl GovernanceDecision {
    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }
}

/// What the driver hands over after an agent segment commits.
#[derive(Clone, Debug)]
pub struct AgentReview<'a> {
    pub manifest_id: &'a str,
    pub agent_id: &'a str,
    pub output: &'a str,
    pub gas_used: f64,
    pub stated_plan_hash: Option<&'a str>,
    pub executed_plan_hash: Option<&'a str>,
}

pub struct GovernanceRing {
    guardrails: Guardrails,
    trust: Mutex<TrustScoreManager>,
}

impl GovernanceRing {
    pub fn new(config: GuardrailConfig, constitution: Vec<ConstitutionalClause>) -> Self {
        Self {
            guardrails: Guardrails::new(config, constitution),
            trust: Mutex::new(TrustScoreManager::new()),
        }
    }

    /// Review committed agent output. Updates the trust score as a side
    /// effect and returns the decision plus the full report.
    pub fn review(&self, review: &AgentReview<'_>) -> (GovernanceDecision, GuardrailReport) {
        let report = self.guardrails.check(&AgentActivity {
            output: review.output,
            gas_used: review.gas_used,
            stated_plan_hash: review.stated_plan_hash,
            executed_plan_hash: review.executed_plan_hash,
        });

        let mut trust = self.trust.lock().unwrap();
        let mode = trust.governance_mode(review.agent_id);

        let decision = decide(&report, mode);

        let event = match &decision {
            GovernanceDecision::Accept | GovernanceDecision::Warn { .. } => TrustEvent::Approved,
            GovernanceDecision::Escalate { anomaly_score, .. }
            | GovernanceDecision::Reject { anomaly_score, .. } => TrustEvent::Violated {
                anomaly_score: *anomaly_score,
            },
        };
        let new_score = trust.update_score(review.agent_id, review.manifest_id, event);

        match &decision {
            GovernanceDecision::Accept => {
                info!(agent = review.agent_id, score = format!("{new_score:.3}"), "post-pass accepted");
            }
            other => {
                warn!(
                    agent = review.agent_id,
                    score = format!("{new_score:.3}"),
                    mode = ?mode,
                    "post-pass flagged output: {other:?}"
                );
            }
        }

        (decision, report)
    }

    pub fn governance_mode(&self, agent_id: &str) -> GovernanceMode {
        self.trust.lock().unwrap().governance_mode(agent_id)
    }

    pub fn trust_score(&self, agent_id: &str) -> Option<f64> {
        self.trust.lock().unwrap().score(agent_id)
    }

    pub fn trust_trend(&self, agent_id: &str) -> TrustTrend {
        self.trust.lock().unwrap().trend(agent_id)
    }
}

/// Severity -> action, hardened one notch in STRICT mode.
fn decide(report: &GuardrailReport, mode: GovernanceMode) -> GovernanceDecision {
    let feedback = feedback_text(report);
    match report.worst_severity() {
        None => GovernanceDecision::Accept,
        Some(ClauseSeverity::Critical) => GovernanceDecision::Reject {
            feedback,
            anomaly_score: report.anomaly_score,
        },
        Some(ClauseSeverity::High) => match mode {
            GovernanceMode::Strict => GovernanceDecision::Reject {
                feedback,
                anomaly_score: report.anomaly_score,
            },
            GovernanceMode::Optimistic => GovernanceDecision::Escalate {
                feedback,
                anomaly_score: report.anomaly_score,
            },
        },
        Some(ClauseSeverity::Medium) => match mode {
            GovernanceMode::Strict => GovernanceDecision::Escalate {
                feedback,
                anomaly_score: report.anomaly_score,
            },
            GovernanceMode::Optimistic => GovernanceDecision::Warn { feedback },
        },
        Some(ClauseSeverity::Low) => GovernanceDecision::Accept,
    }
}

fn feedback_text(report: &GuardrailReport) -> String {
    let details: Vec<String> = report
        .violations
        .iter()
        .map(|v| match &v.clause_id {
            Some(clause) => format!("{clause}: {}", v.detail),
            None => v.detail.clone(),
        })
        .collect();
    format!(
        "Your previous output was flagged by governance. Address the following before retrying: {}",
        details.join("; ")
    )
}
