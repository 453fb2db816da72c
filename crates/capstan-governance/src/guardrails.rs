//! Guardrail checks over agent output.
//!
//! SLOP (suspicious large/repetitive/empty output), gas-fee budget,
//! plan drift, constitutional clauses, and the PII scan. Each violation
//! contributes to the anomaly score that feeds the trust update.

use crate::constitution::{ClauseSeverity, ConstitutionalClause};
use crate::masking::RetroactiveMasker;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    Slop,
    GasFee,
    PlanDrift,
    Constitutional,
    PiiLeak,
}

#[derive(Clone, Debug)]
pub struct Violation {
    pub kind: ViolationKind,
    pub clause_id: Option<String>,
    pub severity: ClauseSeverity,
    pub detail: String,
}

#[derive(Clone, Debug, Default)]
pub struct GuardrailReport {
    pub violations: Vec<Violation>,
    /// Clipped to [0, 1].
    pub anomaly_score: f64,
    /// Output with PII masked — what governance allows to persist.
    pub masked_output: String,
}

impl GuardrailReport {
    pub fn worst_severity(&self) -> Option<ClauseSeverity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// SLOP: output size ceiling in bytes.
    pub max_output_bytes: usize,
    /// SLOP: a single token above this frequency share flags repetition.
    pub max_repetition_ratio: f64,
    /// Gas: accumulated cost cap per execution.
    pub gas_fee_cap: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            max_repetition_ratio: 0.5,
            gas_fee_cap: 10.0,
        }
    }
}

/// Inputs the driver hands to the post-pass.
#[derive(Clone, Debug, Default)]
pub struct AgentActivity<'a> {
    pub output: &'a str,
    pub gas_used: f64,
    /// Hash the agent stated for its plan, if it published one.
    pub stated_plan_hash: Option<&'a str>,
    /// Hash recomputed from the actions actually executed.
    pub executed_plan_hash: Option<&'a str>,
}

pub struct Guardrails {
    config: GuardrailConfig,
    constitution: Vec<ConstitutionalClause>,
    compiled: HashMap<String, Vec<Regex>>,
    masker: RetroactiveMasker,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig, constitution: Vec<ConstitutionalClause>) -> Self {
        let compiled = constitution
            .iter()
            .map(|clause| {
                let regexes = clause
                    .patterns
                    .iter()
                    .filter_map(|p| Regex::new(p).ok())
                    .collect();
                (clause.clause_id.clone(), regexes)
            })
            .collect();
        Self {
            config,
            constitution,
            compiled,
            masker: RetroactiveMasker::default(),
        }
    }

    pub fn check(&self, activity: &AgentActivity<'_>) -> GuardrailReport {
        let mut violations = Vec::new();
        let mut score = 0.0f64;

        // SLOP: size
        if activity.output.len() > self.config.max_output_bytes {
            violations.push(Violation {
                kind: ViolationKind::Slop,
                clause_id: None,
                severity: ClauseSeverity::High,
                detail: format!(
                    "output size {} exceeds cap {}",
                    activity.output.len(),
                    self.config.max_output_bytes
                ),
            });
            score += 0.4;
        }

        // SLOP: repetition
        if let Some(ratio) = dominant_token_ratio(activity.output) {
            if ratio > self.config.max_repetition_ratio {
                violations.push(Violation {
                    kind: ViolationKind::Slop,
                    clause_id: None,
                    severity: ClauseSeverity::Medium,
                    detail: format!("dominant token ratio {ratio:.2} looks degenerate"),
                });
                score += 0.3;
            }
        }

        // SLOP: empty structure
        let trimmed = activity.output.trim();
        if trimmed.is_empty() || trimmed == "{}" || trimmed == "[]" {
            violations.push(Violation {
                kind: ViolationKind::Slop,
                clause_id: None,
                severity: ClauseSeverity::Medium,
                detail: "empty output structure".into(),
            });
            score += 0.3;
        }

        // Gas fee
        if activity.gas_used > self.config.gas_fee_cap {
            violations.push(Violation {
                kind: ViolationKind::GasFee,
                clause_id: None,
                severity: ClauseSeverity::Critical,
                detail: format!(
                    "accumulated cost {:.2} exceeds cap {:.2}",
                    activity.gas_used, self.config.gas_fee_cap
                ),
            });
            score += 0.6;
        }

        // Plan drift
        if let (Some(stated), Some(executed)) =
            (activity.stated_plan_hash, activity.executed_plan_hash)
        {
            if stated != executed {
                violations.push(Violation {
                    kind: ViolationKind::PlanDrift,
                    clause_id: None,
                    severity: ClauseSeverity::High,
                    detail: "executed actions diverge from the stated plan".into(),
                });
                score += 0.4;
            }
        }

        // Constitutional clauses
        for clause in &self.constitution {
            let Some(regexes) = self.compiled.get(&clause.clause_id) else {
                continue;
            };
            if regexes.iter().any(|re| re.is_match(activity.output)) {
                score += severity_weight(clause.severity);
                violations.push(Violation {
                    kind: ViolationKind::Constitutional,
                    clause_id: Some(clause.clause_id.clone()),
                    severity: clause.severity,
                    detail: clause.title.clone(),
                });
            }
        }

        // Retroactive PII scan — a hit is a clause-6 violation.
        let mask_outcome = self.masker.mask(activity.output);
        if !mask_outcome.is_clean() {
            violations.push(Violation {
                kind: ViolationKind::PiiLeak,
                clause_id: Some("article_6_pii_text_leakage".into()),
                severity: ClauseSeverity::Critical,
                detail: format!("{} PII pattern(s) found in free text", mask_outcome.found.len()),
            });
            score += 0.6;
        }

        debug!(
            violations = violations.len(),
            anomaly = format!("{:.2}", score.min(1.0)),
            "guardrail check complete"
        );

        GuardrailReport {
            violations,
            anomaly_score: score.min(1.0),
            masked_output: mask_outcome.text,
        }
    }
}

fn severity_weight(severity: ClauseSeverity) -> f64 {
    match severity {
        ClauseSeverity::Critical => 0.6,
        ClauseSeverity::High => 0.4,
        ClauseSeverity::Medium => 0.2,
        ClauseSeverity::Low => 0.05,
    }
}

/// Share of the most frequent token, for outputs long enough to judge.
fn dominant_token_ratio(text: &str) -> Option<f64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 20 {
        return None;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for token in &tokens {
        *counts.entry(token).or_default() += 1;
    }
    let max = counts.values().copied().max().unwrap_or(0);
    Some(max as f64 / tokens.len() as f64)
}
