use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Statement anonymization and PII detection.
///
/// The anonymizer rewrites SQL text so no literal survives; the detectors
/// find well-known PII shapes in arbitrary attribute text and apply the
/// configured action per kind. Both run before anything downstream can read
/// the value.

lazy_static! {
    static ref EMAIL_PATTERN: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b").unwrap();
    static ref PHONE_PATTERN: Regex =
        Regex::new(r"\b(?:\+?1[-.\s]?)?\(?([0-9]{3})\)?[-.\s]?([0-9]{3})[-.\s]?([0-9]{4})\b")
            .unwrap();
    static ref SSN_PATTERN: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref CREDIT_CARD_PATTERN: Regex =
        Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").unwrap();
    static ref IPV4_PATTERN: Regex = Regex::new(
        r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b"
    )
    .unwrap();
    static ref APIKEY_PATTERN: Regex =
        Regex::new(r"\b(?i:sk|pk|api|key|tok|secret)[-_][A-Za-z0-9+/=]{16,}\b").unwrap();

    // SQL literals
    static ref STRING_LITERAL: Regex = Regex::new(r"'([^']*(?:''[^']*)*)'").unwrap();
    static ref QUOTED_IDENTIFIER: Regex = Regex::new(r#""([^"]*)""#).unwrap();
    static ref HEX_LITERAL: Regex = Regex::new(r"0x[0-9a-fA-F]+").unwrap();
    static ref NUMBER_LITERAL: Regex = Regex::new(r"\b\d+\.?\d*\b").unwrap();
}

/// Replace every literal in a statement with a typed placeholder. Emails are
/// handled before string literals so an address inside quotes does not leak
/// through the generic `'?'` rewrite unnoticed by later pattern checks.
pub fn anonymize_statement(statement: &str) -> String {
    let mut result = EMAIL_PATTERN.replace_all(statement, "?@?.?").to_string();
    result = STRING_LITERAL.replace_all(&result, "'?'").to_string();
    result = QUOTED_IDENTIFIER.replace_all(&result, "\"?\"").to_string();
    result = HEX_LITERAL.replace_all(&result, "?").to_string();
    result = NUMBER_LITERAL.replace_all(&result, "?").to_string();
    result
}

/// The recognized PII kinds. The set is fixed; configuration only picks the
/// action per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Ssn,
    CreditCardLuhn,
    PhoneUs,
    Ipv4,
    ApikeyHeuristic,
}

impl PiiKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiKind::Email => "email",
            PiiKind::Ssn => "ssn",
            PiiKind::CreditCardLuhn => "credit_card_luhn",
            PiiKind::PhoneUs => "phone_us",
            PiiKind::Ipv4 => "ipv4",
            PiiKind::ApikeyHeuristic => "apikey_heuristic",
        }
    }

    fn redaction_label(&self) -> &'static str {
        match self {
            PiiKind::Email => "[REDACTED_EMAIL]",
            PiiKind::Ssn => "[REDACTED_SSN]",
            PiiKind::CreditCardLuhn => "[REDACTED_CARD]",
            PiiKind::PhoneUs => "[REDACTED_PHONE]",
            PiiKind::Ipv4 => "[REDACTED_IP]",
            PiiKind::ApikeyHeuristic => "[REDACTED_APIKEY]",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            PiiKind::Email => &EMAIL_PATTERN,
            PiiKind::Ssn => &SSN_PATTERN,
            PiiKind::CreditCardLuhn => &CREDIT_CARD_PATTERN,
            PiiKind::PhoneUs => &PHONE_PATTERN,
            PiiKind::Ipv4 => &IPV4_PATTERN,
            PiiKind::ApikeyHeuristic => &APIKEY_PATTERN,
        }
    }
}

/// Card numbers must pass the checksum before they count as PII; random
/// sixteen-digit strings are left alone. The order avoids the phone pattern
/// nibbling at card fragments.
pub const SCAN_ORDER: [PiiKind; 6] = [
    PiiKind::CreditCardLuhn,
    PiiKind::Email,
    PiiKind::Ssn,
    PiiKind::PhoneUs,
    PiiKind::Ipv4,
    PiiKind::ApikeyHeuristic,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiAction {
    Redact,
    Hash,
    DropAttribute,
    DropRecord,
}

/// Outcome of scanning one string value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// No configured pattern matched.
    Clean,
    /// Matches were redacted or hashed in place.
    Rewritten(String),
    /// A `drop_attribute` kind matched; the attribute must be removed.
    DropAttribute(PiiKind),
    /// A `drop_record` kind matched; the whole record must be dropped.
    DropRecord(PiiKind),
}

/// Scan `text` for every kind, applying `action_for(kind)`. Hit counts per
/// kind are pushed into `hits` for the caller's counters.
pub fn scan_text<F>(text: &str, action_for: F, hits: &mut Vec<PiiKind>) -> ScanOutcome
where
    F: Fn(PiiKind) -> PiiAction,
{
    let mut current = text.to_string();
    let mut rewritten = false;

    for kind in SCAN_ORDER {
        let action = action_for(kind);
        let pattern = kind.pattern();

        if !pattern.is_match(&current) {
            continue;
        }

        match action {
            PiiAction::DropRecord => {
                if count_real_matches(kind, &current) > 0 {
                    hits.push(kind);
                    return ScanOutcome::DropRecord(kind);
                }
            }
            PiiAction::DropAttribute => {
                if count_real_matches(kind, &current) > 0 {
                    hits.push(kind);
                    return ScanOutcome::DropAttribute(kind);
                }
            }
            PiiAction::Redact | PiiAction::Hash => {
                let mut matched = false;
                let next = pattern
                    .replace_all(&current, |caps: &regex::Captures<'_>| {
                        let m = caps.get(0).unwrap().as_str();
                        if kind == PiiKind::CreditCardLuhn && !luhn_valid(m) {
                            return m.to_string();
                        }
                        matched = true;
                        match action {
                            PiiAction::Redact => kind.redaction_label().to_string(),
                            PiiAction::Hash => format!("[HASH:{}]", short_hash(m)),
                            _ => unreachable!(),
                        }
                    })
                    .to_string();
                if matched {
                    hits.push(kind);
                    rewritten = true;
                    current = next;
                }
            }
        }
    }

    if rewritten {
        ScanOutcome::Rewritten(current)
    } else {
        ScanOutcome::Clean
    }
}

fn count_real_matches(kind: PiiKind, text: &str) -> usize {
    kind.pattern()
        .find_iter(text)
        .filter(|m| kind != PiiKind::CreditCardLuhn || luhn_valid(m.as_str()))
        .count()
}

/// Luhn checksum over the digits of a candidate card number.
pub fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// First 8 bytes of SHA-256 over the digits of the match, hex-encoded.
fn short_hash(m: &str) -> String {
    let digits: String = m.chars().filter(|c| c.is_ascii_digit()).collect();
    let source = if digits.is_empty() { m } else { &digits };
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redact_all(_: PiiKind) -> PiiAction {
        PiiAction::Redact
    }

    #[test]
    fn anonymize_replaces_every_literal_kind() {
        let q = "SELECT * FROM users WHERE email = 'a@b.com' AND id = 123 AND tag = \"x\"";
        assert_eq!(
            anonymize_statement(q),
            "SELECT * FROM users WHERE email = '?' AND id = ? AND tag = \"?\""
        );
    }

    #[test]
    fn anonymize_handles_hex_and_floats() {
        let q = "UPDATE t SET a = 0xDEAD, b = 3.14";
        assert_eq!(anonymize_statement(q), "UPDATE t SET a = ?, b = ?");
    }

    #[test]
    fn anonymize_strips_bare_email() {
        let q = "COMMENT ON COLUMN t.owner IS contact alice@example.com";
        assert!(!anonymize_statement(q).contains("alice@example.com"));
    }

    #[test]
    fn luhn_accepts_valid_rejects_invalid() {
        assert!(luhn_valid("4539 1488 0343 6467"));
        assert!(luhn_valid("4111111111111111"));
        assert!(!luhn_valid("4539 1488 0343 6468"));
        assert!(!luhn_valid("1234 5678 9012 3456"));
    }

    #[test]
    fn scan_redacts_email_and_ssn_hashes_card() {
        let body = "Contact alice@example.com SSN 123-45-6789 card 4539 1488 0343 6467";
        let actions = |kind: PiiKind| match kind {
            PiiKind::CreditCardLuhn => PiiAction::Hash,
            _ => PiiAction::Redact,
        };
        let mut hits = Vec::new();
        let outcome = scan_text(body, actions, &mut hits);
        match outcome {
            ScanOutcome::Rewritten(text) => {
                assert!(text.contains("[REDACTED_EMAIL]"));
                assert!(text.contains("[REDACTED_SSN]"));
                let re = Regex::new(r"\[HASH:[0-9a-f]{16}\]").unwrap();
                assert!(re.is_match(&text), "hashed card missing in {text}");
                assert!(!text.contains("4539"));
            }
            other => panic!("expected rewrite, got {other:?}"),
        }
        assert!(hits.contains(&PiiKind::Email));
        assert!(hits.contains(&PiiKind::Ssn));
        assert!(hits.contains(&PiiKind::CreditCardLuhn));
    }

    #[test]
    fn luhn_invalid_card_is_not_hashed() {
        let body = "card 1234 5678 9012 3456 on file";
        let actions = |kind: PiiKind| match kind {
            PiiKind::CreditCardLuhn => PiiAction::Hash,
            // keep the other detectors quiet so only the card path runs
            _ => PiiAction::Redact,
        };
        let mut hits = Vec::new();
        match scan_text(body, actions, &mut hits) {
            ScanOutcome::Clean => {}
            ScanOutcome::Rewritten(text) => {
                assert!(text.contains("1234 5678 9012 3456"), "card mangled: {text}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!hits.contains(&PiiKind::CreditCardLuhn));
    }

    #[test]
    fn drop_record_wins_over_rewrites() {
        let body = "reach me at bob@corp.io";
        let actions = |kind: PiiKind| match kind {
            PiiKind::Email => PiiAction::DropRecord,
            _ => PiiAction::Redact,
        };
        let mut hits = Vec::new();
        assert_eq!(
            scan_text(body, actions, &mut hits),
            ScanOutcome::DropRecord(PiiKind::Email)
        );
    }

    #[test]
    fn apikey_heuristic_redacts_prefixed_tokens() {
        let body = "auth with sk-KhFGlcrMJcG1lcrMJcG1 ok";
        let mut hits = Vec::new();
        match scan_text(body, redact_all, &mut hits) {
            ScanOutcome::Rewritten(text) => assert!(text.contains("[REDACTED_APIKEY]")),
            other => panic!("expected rewrite, got {other:?}"),
        }
    }

    #[test]
    fn clean_text_stays_clean() {
        let body = "SELECT count(*) FROM orders WHERE region = 'emea'";
        let mut hits = Vec::new();
        assert_eq!(scan_text(body, redact_all, &mut hits), ScanOutcome::Clean);
        assert!(hits.is_empty());
    }
}
