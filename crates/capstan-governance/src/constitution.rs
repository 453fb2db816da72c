//! Constitutional clauses — user-extensible rules checked against
//! agent output. Severity decides the action: CRITICAL rejects, HIGH
//! escalates to a human, MEDIUM warns, LOW only logs.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstitutionalClause {
    pub clause_id: String,
    pub article_number: u32,
    pub title: String,
    pub description: String,
    pub severity: ClauseSeverity,
    /// Regex patterns whose match constitutes a violation.
    pub patterns: Vec<String>,
}

impl ConstitutionalClause {
    pub fn new(
        clause_id: impl Into<String>,
        article_number: u32,
        title: impl Into<String>,
        description: impl Into<String>,
        severity: ClauseSeverity,
        patterns: Vec<&str>,
    ) -> Self {
        Self {
            clause_id: clause_id.into(),
            article_number,
            title: title.into(),
            description: description.into(),
            severity,
            patterns: patterns.into_iter().map(String::from).collect(),
        }
    }
}

/// The default constitution; user clauses are appended after it.
pub fn default_constitution() -> Vec<ConstitutionalClause> {
    vec![
        ConstitutionalClause::new(
            "article_1_professional_tone",
            1,
            "Professional business tone",
            "Output must avoid profanity and aggressive language",
            ClauseSeverity::Medium,
            vec![r"(?i)\b(stupid|idiotic|garbage|damn)\b"],
        ),
        ConstitutionalClause::new(
            "article_2_no_harmful_content",
            2,
            "No harmful content",
            "Output must not promote violence, discrimination, or illegal activity",
            ClauseSeverity::Critical,
            vec![
                r"(?i)sql\s+injection",
                r"(?i)bypass\s+(security|auth)",
                r"(?i)how\s+to\s+(attack|exploit)",
            ],
        ),
        ConstitutionalClause::new(
            "article_3_user_protection",
            3,
            "User protection",
            "Output must not solicit passwords, card numbers, or identifying information",
            ClauseSeverity::Critical,
            vec![
                r"(?i)enter\s+your\s+(password|card\s+number|ssn)",
                r"(?i)send\s+me\s+your\s+(password|credentials)",
            ],
        ),
        ConstitutionalClause::new(
            "article_4_transparency",
            4,
            "Transparency",
            "Output should not claim absolute certainty",
            ClauseSeverity::Low,
            vec![r"(?i)100%\s+(accurate|certain|guaranteed)"],
        ),
        ConstitutionalClause::new(
            "article_5_no_security_bypass",
            5,
            "Security policy compliance",
            "Output must not describe bypassing access controls or audit logs",
            ClauseSeverity::Critical,
            vec![
                r"(?i)scan(ning)?\s+.*\s+for\s+all\s+user\s+data",
                r"(?i)disabl(e|ing)\s+(audit|access\s+control)",
            ],
        ),
        ConstitutionalClause::new(
            "article_6_pii_text_leakage",
            6,
            "No PII leakage in text",
            "Free text must not carry emails, phone numbers, SSNs, or card numbers; \
             detection is done by the retroactive masking pass",
            ClauseSeverity::Critical,
            // Detection happens in the masking pass, not by pattern.
            vec![],
        ),
    ]
}

pub fn get_constitution(
    custom_clauses: Vec<ConstitutionalClause>,
) -> Vec<ConstitutionalClause> {
    let mut constitution = default_constitution();
    constitution.extend(custom_clauses);
    constitution
}
