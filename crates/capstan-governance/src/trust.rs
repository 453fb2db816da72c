//! Per-agent trust scores with EMA-accelerated recovery.
//!
//! Model: `T_new = clip01(T_old + delta_S - alpha * A)` where `A` is the
//! anomaly score of a violation and `delta_S` grows with the recent
//! success streak: `delta_S = base * (1 + beta * streak_ratio)` over the
//! last ten decisions. A fixed increment would need ~40 clean runs to
//! recover from one violation; the streak multiplier cuts that to ~14.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

pub const INITIAL_SCORE: f64 = 0.8;
pub const BASE_SUCCESS_INCREMENT: f64 = 0.01;
pub const VIOLATION_MULTIPLIER: f64 = 0.5;
pub const STRICT_MODE_THRESHOLD: f64 = 0.4;
pub const EMA_ACCELERATION: f64 = 2.0;
pub const RECENT_WINDOW: usize = 10;
const HISTORY_LIMIT: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceMode {
    Optimistic,
    Strict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustTrend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustScoreState {
    pub agent_id: String,
    pub current_score: f64,
    /// (manifest_id, score) pairs, newest last.
    pub score_history: Vec<(String, f64)>,
    pub violation_count: u32,
    pub success_count: u32,
    pub last_updated: DateTime<Utc>,
}

impl TrustScoreState {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            current_score: INITIAL_SCORE,
            score_history: Vec::new(),
            violation_count: 0,
            success_count: 0,
            last_updated: Utc::now(),
        }
    }
}

/// The decision fed back into the score.
#[derive(Clone, Debug)]
pub enum TrustEvent {
    Approved,
    /// Rejected, escalated, or rolled back — carries the anomaly score.
    Violated { anomaly_score: f64 },
}

#[derive(Default)]
pub struct TrustScoreManager {
    agents: HashMap<String, TrustScoreState>,
}

impl TrustScoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a governance decision and return the new score.
    pub fn update_score(&mut self, agent_id: &str, manifest_id: &str, event: TrustEvent) -> f64 {
        let state = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| TrustScoreState::new(agent_id));
        let old_score = state.current_score;

        let new_score = match event {
            TrustEvent::Approved => {
                let streak_ratio = streak_ratio(&state.score_history);
                let delta_s = BASE_SUCCESS_INCREMENT * (1.0 + EMA_ACCELERATION * streak_ratio);
                state.success_count += 1;
                info!(
                    agent = agent_id,
                    streak_ratio = format!("{streak_ratio:.2}"),
                    delta_s = format!("{delta_s:.4}"),
                    "trust score success"
                );
                (old_score + delta_s).min(1.0)
            }
            TrustEvent::Violated { anomaly_score } => {
                let penalty = anomaly_score.clamp(0.0, 1.0) * VIOLATION_MULTIPLIER;
                state.violation_count += 1;
                (old_score - penalty).max(0.0)
            }
        };

        state.current_score = new_score;
        state
            .score_history
            .push((manifest_id.to_string(), new_score));
        if state.score_history.len() > HISTORY_LIMIT {
            let excess = state.score_history.len() - HISTORY_LIMIT;
            state.score_history.drain(..excess);
        }
        state.last_updated = Utc::now();

        info!(
            agent = agent_id,
            old = format!("{old_score:.3}"),
            new = format!("{new_score:.3}"),
            successes = state.success_count,
            violations = state.violation_count,
            "trust score updated"
        );
        new_score
    }

    /// STRICT below the threshold, OPTIMISTIC otherwise. Unknown agents
    /// default to OPTIMISTIC.
    pub fn governance_mode(&self, agent_id: &str) -> GovernanceMode {
        let Some(state) = self.agents.get(agent_id) else {
            return GovernanceMode::Optimistic;
        };
        if state.current_score < STRICT_MODE_THRESHOLD {
            warn!(
                agent = agent_id,
                score = format!("{:.2}", state.current_score),
                "trust below threshold; forcing STRICT mode"
            );
            GovernanceMode::Strict
        } else {
            GovernanceMode::Optimistic
        }
    }

    pub fn trend(&self, agent_id: &str) -> TrustTrend {
        let Some(state) = self.agents.get(agent_id) else {
            return TrustTrend::Stable;
        };
        let history = &state.score_history;
        if history.len() < 3 {
            return TrustTrend::Stable;
        }

        let recent: Vec<f64> = history.iter().rev().take(5).map(|(_, s)| *s).collect();
        let avg_recent: f64 = recent.iter().sum::<f64>() / recent.len() as f64;

        let older: Vec<f64> = if history.len() >= 10 {
            history[history.len() - 10..history.len() - 5]
                .iter()
                .map(|(_, s)| *s)
                .collect()
        } else {
            recent.clone()
        };
        let avg_older: f64 = older.iter().sum::<f64>() / older.len() as f64;

        let diff = avg_recent - avg_older;
        if diff > 0.05 {
            TrustTrend::Improving
        } else if diff < -0.05 {
            TrustTrend::Degrading
        } else {
            TrustTrend::Stable
        }
    }

    pub fn score(&self, agent_id: &str) -> Option<f64> {
        self.agents.get(agent_id).map(|s| s.current_score)
    }

    pub fn state(&self, agent_id: &str) -> Option<&TrustScoreState> {
        self.agents.get(agent_id)
    }
}

/// Fraction of non-decreasing steps over the recent window.
fn streak_ratio(history: &[(String, f64)]) -> f64 {
    let recent: &[(String, f64)] = if history.len() >= RECENT_WINDOW {
        &history[history.len() - RECENT_WINDOW..]
    } else {
        history
    };
    if recent.len() < 2 {
        return 0.0;
    }
    let successes = recent
        .windows(2)
        .filter(|pair| pair[1].1 >= pair[0].1)
        .count();
    successes as f64 / (recent.len() - 1).max(1) as f64
}
