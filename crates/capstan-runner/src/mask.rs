//! PII masking for log output.
//!
//! Applied to anything the runner logs — never to prompts or persisted
//! state. Field names matching PII patterns are masked by value shape:
//! emails keep two leading characters plus the domain, digit strings
//! keep their last four.

use capstan_core::{StateBag, Value};
use regex::Regex;
use std::sync::OnceLock;

const EXPLICIT_PII_FIELDS: &[&str] = &[
    "email",
    "password",
    "ssn",
    "social_security_number",
    "credit_card",
    "phone",
    "phone_number",
    "address",
    "date_of_birth",
    "dob",
    "driver_license",
];

fn pii_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(email|password|ssn|social.?security|credit.?card|phone|address|dob|birth.?date)")
            .expect("pii field regex")
    })
}

pub fn is_pii_field(field_name: &str) -> bool {
    let lower = field_name.to_lowercase();
    EXPLICIT_PII_FIELDS.contains(&lower.as_str()) || pii_field_re().is_match(field_name)
}

pub fn mask_pii_value(value: &Value) -> Value {
    let text = match value {
        Value::Scalar(serde_json::Value::String(s)) => s.clone(),
        Value::Scalar(other) => other.to_string(),
        _ => return Value::str("***MASKED***"),
    };

    if let Some((user, domain)) = text.split_once('@') {
        let visible = &user[..user.len().min(2)];
        let masked = format!("{visible}{}@{domain}", "*".repeat(user.len().saturating_sub(2)));
        return Value::str(masked);
    }

    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 10 && digits.len() == text.chars().filter(|c| *c != '-' && *c != ' ').count()
    {
        let tail = &digits[digits.len() - 4..];
        return Value::str(format!("{}{tail}", "*".repeat(digits.len() - 4)));
    }

    if text.len() > 3 {
        Value::str(format!("{}{}", &text[..3], "*".repeat(text.len() - 3)))
    } else {
        Value::str("***")
    }
}

/// Recursively mask PII fields in a state bag. Returns a new bag; the
/// original is untouched.
pub fn mask_pii_in_state(state: &StateBag) -> StateBag {
    state
        .iter()
        .map(|(key, value)| {
            let masked = if is_pii_field(key) {
                mask_pii_value(value)
            } else {
                match value {
                    Value::Map(inner) => Value::Map(mask_pii_in_state(inner)),
                    Value::Seq(items) => Value::Seq(
                        items
                            .iter()
                            .map(|v| match v {
                                Value::Map(inner) => Value::Map(mask_pii_in_state(inner)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                }
            };
            (key.clone(), masked)
        })
        .collect()
}

/// Log-safe rendering: masked and truncated.
pub fn sanitize_for_logging(state: &StateBag) -> String {
    const MAX_LEN: usize = 1000;
    let mut text = serde_json::to_string(&mask_pii_in_state(state)).unwrap_or_default();
    if text.len() > MAX_LEN {
        let total = text.len();
        text.truncate(MAX_LEN);
        text.push_str(&format!("... (truncated {} chars)", total - MAX_LEN));
    }
    text
}
