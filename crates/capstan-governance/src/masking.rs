//! Retroactive PII masking with URL protection.
//!
//! Post-hoc scan of free-text agent output: emails, phone numbers,
//! SSNs, card numbers, API keys, and public IPs are replaced with
//! hashed tokens so repeated values stay correlatable without leaking.
//! URLs are stashed behind alphabetic tokens first — an email-shaped
//! path segment inside a link must survive masking — and trailing
//! punctuation is kept out of the stashed URL, with balanced
//! parentheses treated as part of it.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PiiKind {
    ApiKey,
    Email,
    Phone,
    Ssn,
    Card,
    PublicIp,
}

impl PiiKind {
    fn label(self) -> &'static str {
        match self {
            Self::ApiKey => "API_KEY",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Ssn => "SSN",
            Self::Card => "CARD",
            Self::PublicIp => "IP",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct MaskOutcome {
    pub text: String,
    pub found: Vec<PiiKind>,
}

impl MaskOutcome {
    pub fn is_clean(&self) -> bool {
        self.found.is_empty()
    }
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)https?://[^\s<>]+"#).expect("url regex"))
}

fn pii_patterns() -> &'static [(PiiKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(PiiKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                PiiKind::ApiKey,
                Regex::new(r"\bsk-[a-zA-Z0-9-]{20,}\b").expect("api key"),
            ),
            (
                PiiKind::Email,
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email"),
            ),
            (
                PiiKind::Ssn,
                Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn"),
            ),
            (
                PiiKind::Card,
                Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").expect("card"),
            ),
            (
                PiiKind::Phone,
                Regex::new(r"\b\d{3}[-.\s]?\d{3,4}[-.\s]?\d{4}\b").expect("phone"),
            ),
            (
                PiiKind::PublicIp,
                Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ip"),
            ),
        ]
    })
}

const TRAILING_PUNCT: &str = ".,:;!?'\")";

pub struct RetroactiveMasker {
    strict: bool,
}

impl Default for RetroactiveMasker {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl RetroactiveMasker {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Mask PII in free text, preserving URLs.
    pub fn mask(&self, text: &str) -> MaskOutcome {
        if text.trim().is_empty() {
            return MaskOutcome {
                text: text.to_string(),
                found: Vec::new(),
            };
        }

        let mut stash: HashMap<String, String> = HashMap::new();
        let mut working = self.stash_urls(text, &mut stash);
        let mut found = Vec::new();

        for (kind, pattern) in pii_patterns() {
            if *kind == PiiKind::PublicIp {
                // Private ranges are infrastructure, not PII.
                let mut any = false;
                working = pattern
                    .replace_all(&working, |caps: &regex::Captures<'_>| {
                        let ip = &caps[0];
                        if is_private_ip(ip) {
                            ip.to_string()
                        } else {
                            any = true;
                            masked_token(*kind, ip)
                        }
                    })
                    .into_owned();
                if any {
                    found.push(*kind);
                }
                continue;
            }
            if pattern.is_match(&working) {
                found.push(*kind);
                working = pattern
                    .replace_all(&working, |caps: &regex::Captures<'_>| {
                        masked_token(*kind, &caps[0])
                    })
                    .into_owned();
            }
        }

        for (token, url) in &stash {
            working = working.replace(token, url);
        }

        MaskOutcome {
            text: working,
            found,
        }
    }

    fn stash_urls(&self, text: &str, stash: &mut HashMap<String, String>) -> String {
        url_re()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let raw = caps[0].to_string();
                let (url, trailing) = if self.strict {
                    clean_url_trailing(&raw)
                } else {
                    (raw.clone(), String::new())
                };
                let token = format!("__URL_STASH_{}__", alpha_token());
                stash.insert(token.clone(), url);
                format!("{token}{trailing}")
            })
            .into_owned()
    }
}

/// Hashed replacement token: the label plus a sha-256 prefix of the
/// original value. Identical values mask to identical tokens.
fn masked_token(kind: PiiKind, original: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("[{}:{}]", kind.label(), &digest[..8])
}

/// Alphabetic-only token body so a stashed URL cannot collide with the
/// digit-based phone/card patterns.
fn alpha_token() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex.chars()
        .map(|c| match c {
            '0'..='9' => (b'a' + (c as u8 - b'0')) as char,
            'a'..='f' => (b'k' + (c as u8 - b'a')) as char,
            other => other,
        })
        .collect()
}

/// Order-aware parenthesis balance: `)(` is unbalanced even though the
/// counts agree.
fn parens_balanced(url: &str) -> bool {
    let mut depth: i32 = 0;
    for ch in url.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Split trailing punctuation off a URL, keeping balanced-paren tails.
fn clean_url_trailing(url: &str) -> (String, String) {
    let mut url = url.to_string();
    let mut trailing: Vec<char> = Vec::new();

    while let Some(last) = url.chars().last() {
        if last == ')' && parens_balanced(&url) {
            break;
        }
        if TRAILING_PUNCT.contains(last) {
            trailing.push(last);
            url.pop();
        } else {
            break;
        }
    }
    trailing.reverse();
    (url, trailing.into_iter().collect())
}

fn is_private_ip(ip: &str) -> bool {
    let octets: Vec<u32> = ip.split('.').filter_map(|p| p.parse().ok()).collect();
    if octets.len() != 4 || octets.iter().any(|&o| o > 255) {
        return true; // malformed: leave it alone
    }
    octets[0] == 10
        || octets[0] == 127
        || (octets[0] == 192 && octets[1] == 168)
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masker() -> RetroactiveMasker {
        RetroactiveMasker::default()
    }

    #[test]
    fn email_is_masked_with_hashed_token() {
        let out = masker().mask("contact john.doe@example.com please");
        assert!(!out.text.contains("john.doe@example.com"));
        assert!(out.text.contains("[EMAIL:"));
        assert_eq!(out.found, vec![PiiKind::Email]);
    }

    #[test]
    fn identical_values_mask_identically() {
        let a = masker().mask("a@b.com");
        let b = masker().mask("a@b.com");
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn url_embedded_email_pattern_survives() {
        let text = "see https://example.com/user@path/page for details, mail a@b.com";
        let out = masker().mask(text);
        assert!(out.text.contains("https://example.com/user@path/page"));
        assert!(!out.text.contains("a@b.com"));
    }

    #[test]
    fn url_trailing_punctuation_is_not_swallowed() {
        let out = masker().mask("read https://example.com/page.");
        assert!(out.text.contains("https://example.com/page."));
        let (url, trailing) = clean_url_trailing("https://ex.com/page.");
        assert_eq!(url, "https://ex.com/page");
        assert_eq!(trailing, ".");
    }

    #[test]
    fn wiki_parens_stay_inside_the_url() {
        let (url, trailing) = clean_url_trailing("https://ex.com/wiki/A_(B)");
        assert_eq!(url, "https://ex.com/wiki/A_(B)");
        assert_eq!(trailing, "");

        let (url, trailing) = clean_url_trailing("https://ex.com/page).");
        assert_eq!(url, "https://ex.com/page");
        assert_eq!(trailing, ").");
    }

    #[test]
    fn reversed_parens_are_stripped() {
        let (url, trailing) = clean_url_trailing("https://ex.com/url)(");
        assert_eq!(url, "https://ex.com/url");
        assert_eq!(trailing, ")(");
    }

    #[test]
    fn ssn_and_card_are_masked() {
        let out = masker().mask("ssn 123-45-6789 card 4111-1111-1111-1111");
        assert!(out.text.contains("[SSN:"));
        assert!(out.text.contains("[CARD:"));
        assert!(out.found.contains(&PiiKind::Ssn));
        assert!(out.found.contains(&PiiKind::Card));
    }

    #[test]
    fn private_ips_pass_public_ips_mask() {
        let out = masker().mask("local 192.168.0.1 remote 8.8.8.8");
        assert!(out.text.contains("192.168.0.1"));
        assert!(!out.text.contains("8.8.8.8"));
        assert!(out.found.contains(&PiiKind::PublicIp));
    }

    #[test]
    fn clean_text_reports_clean() {
        let out = masker().mask("nothing sensitive here");
        assert!(out.is_clean());
        assert_eq!(out.text, "nothing sensitive here");
    }
}
