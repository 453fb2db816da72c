//! Error classification for self-healing.
//!
//! Two routes out of a failed node: DETERMINISTIC errors (structure,
//! schema, transient provider faults) are retried with corrective
//! advice; SEMANTIC errors (guardrails, auth, loop overruns, resource
//! exhaustion) terminate. Unknown errors default to SEMANTIC — the safe
//! path. The circuit breaker forces SEMANTIC once the healing budget is
//! spent, whatever the pattern says.

use regex::RegexSet;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Deterministic,
    Semantic,
}

pub const MAX_AUTO_HEALING_COUNT: u32 = 3;

const DETERMINISTIC_PATTERNS: &[&str] = &[
    // JSON / schema errors
    r"(?i)json.?decode",
    r"(?i)invalid json",
    r"(?i)unexpected token",
    r"(?i)expected .* at line",
    r"(?i)validation.?error",
    r"(?i)schema.*mismatch",
    r"(?i)missing.*required.*field",
    // Common runtime errors
    r"(?i)key.?error",
    r"(?i)index.*out of (range|bounds)",
    r"(?i)type.?error",
    r"(?i)attribute.?error",
    r"(?i)missing field",
    // Transient provider errors
    r"(?i)rate.?limit",
    r"\b429\b",
    r"(?i)too many requests",
    r"(?i)time.?out",
    r"(?i)connection.*reset",
    r"(?i)ETIMEDOUT",
    r"(?i)ECONNREFUSED",
    r"(?i)throttl",
    r"(?i)service.?unavailable",
    r"(?i)internal.?server.?error",
    r"(?i)model.?stream.?error",
];

const SEMANTIC_PATTERNS: &[&str] = &[
    // Security / guardrail violations
    r"(?i)security.?violation",
    r"(?i)prompt.?injection",
    r"(?i)guardrail",
    r"(?i)forbidden",
    r"(?i)access.?denied",
    r"(?i)unauthorized",
    // Loop / recursion limits
    r"(?i)loop.?limit.?exceeded",
    r"(?i)branch.?loop.?limit",
    r"(?i)recursion",
    r"(?i)infinite loop",
    r"(?i)deadlock",
    r"(?i)circular.*dependency",
    // Resource exhaustion
    r"(?i)resource.?exhaustion",
    r"(?i)out.?of.?memory",
    r"(?i)memory.?error",
    // Authentication
    r"(?i)authentication",
    r"(?i)credentials",
    r"(?i)invalid.?token",
    r"\b401\b",
    r"\b403\b",
];

fn deterministic_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(DETERMINISTIC_PATTERNS).expect("deterministic patterns"))
}

fn semantic_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(SEMANTIC_PATTERNS).expect("semantic patterns"))
}

#[derive(Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error and explain the decision.
    pub fn classify(
        &self,
        error_type: &str,
        message: &str,
        healing_count: u32,
    ) -> (ErrorCategory, String) {
        let full = format!("{error_type}: {message}");

        if healing_count >= MAX_AUTO_HEALING_COUNT {
            return (
                ErrorCategory::Semantic,
                format!(
                    "circuit breaker: {healing_count} healing attempts exceeded the limit of {MAX_AUTO_HEALING_COUNT}"
                ),
            );
        }

        // Semantic patterns win — they are the dangerous ones.
        if let Some(idx) = semantic_set().matches(&full).iter().next() {
            return (
                ErrorCategory::Semantic,
                format!("semantic pattern matched: {}", SEMANTIC_PATTERNS[idx]),
            );
        }

        if let Some(idx) = deterministic_set().matches(&full).iter().next() {
            return (
                ErrorCategory::Deterministic,
                format!("deterministic pattern matched: {}", DETERMINISTIC_PATTERNS[idx]),
            );
        }

        (
            ErrorCategory::Semantic,
            format!("unrecognized error type '{error_type}'; defaulting to manual intervention"),
        )
    }

    pub fn should_auto_heal(
        &self,
        error_type: &str,
        message: &str,
        healing_count: u32,
    ) -> (bool, String) {
        let (category, reason) = self.classify(error_type, message, healing_count);
        (category == ErrorCategory::Deterministic, reason)
    }

    /// Heuristic advice before any LLM refinement step.
    pub fn healing_advice(&self, error_type: &str, message: &str) -> Option<&'static str> {
        let full = format!("{error_type}: {message}").to_lowercase();
        if full.contains("json") || full.contains("unexpected token") {
            return Some(
                "Escape special characters in JSON strings. Check for unquoted keys, trailing commas, and unbalanced braces. Return only the JSON object, no prose.",
            );
        }
        if full.contains("missing") && full.contains("field") {
            return Some("Include every required field in the output, even when its value is empty.");
        }
        if full.contains("key") && full.contains("error") {
            return Some("Check that the key exists before accessing it; fall back to a default value.");
        }
        if full.contains("rate limit") || full.contains("429") || full.contains("throttl") {
            return Some("Apply exponential backoff and retry after a short delay.");
        }
        if full.contains("timeout") || full.contains("timed out") {
            return Some("Reduce payload size or split the request into smaller chunks.");
        }
        None
    }
}
