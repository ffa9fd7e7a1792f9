//! PII detection and redaction.
//!
//! Regex-based detectors over every finalized utterance. In `redact` mode
//! the rewrite replaces each span with a `[KIND_REDACTED]` marker; in
//! `flag` mode detections are recorded but the text is untouched.
//!
//! ## Detected kinds
//! - US phone numbers
//! - Email addresses
//! - Social security numbers
//! - Credit-card-shaped digit runs (pattern only, no checksum)
//! - Street-address-shaped spans
//! - IPv4 addresses

use regex::Regex;
use std::sync::LazyLock;

/// Kind of detected PII, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiKind {
    PhoneUs,
    Email,
    Ssn,
    CreditCardLike,
    StreetAddressLike,
    Ip,
}

impl PiiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhoneUs => "PHONE_US",
            Self::Email => "EMAIL",
            Self::Ssn => "SSN",
            Self::CreditCardLike => "CREDIT_CARD_LIKE",
            Self::StreetAddressLike => "STREET_ADDRESS_LIKE",
            Self::Ip => "IP",
        }
    }

    /// Replacement marker used in rewrites.
    pub fn marker(self) -> String {
        format!("[{}_REDACTED]", self.as_str())
    }
}

struct PiiPatterns {
    phone_us: Regex,
    email: Regex,
    ssn: Regex,
    credit_card: Regex,
    street_address: Regex,
    ipv4: Regex,
}

static PII_PATTERNS: LazyLock<PiiPatterns> = LazyLock::new(|| PiiPatterns {
    phone_us: Regex::new(r"(?:\+1[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b")
        .unwrap(),
    email: Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
    ssn: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
    credit_card: Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
    street_address: Regex::new(
        r"(?i)\b\d{1,5}\s+[A-Za-z][A-Za-z']*(?:\s+[A-Za-z][A-Za-z']*)?\s+(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Way)\b",
    )
    .unwrap(),
    ipv4: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(),
});

/// One detected span.
#[derive(Debug, Clone)]
pub struct PiiMatch {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
}

/// Detect PII spans, recorded in detector order (no canonical precedence
/// between kinds matching the same span).
pub fn detect(text: &str) -> Vec<PiiMatch> {
    let mut matches = Vec::new();
    let p = &*PII_PATTERNS;

    for m in p.phone_us.find_iter(text) {
        matches.push(PiiMatch {
            kind: PiiKind::PhoneUs,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in p.email.find_iter(text) {
        matches.push(PiiMatch {
            kind: PiiKind::Email,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in p.ssn.find_iter(text) {
        if covered(&matches, m.start(), m.end()) {
            continue;
        }
        matches.push(PiiMatch {
            kind: PiiKind::Ssn,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in p.credit_card.find_iter(text) {
        if covered(&matches, m.start(), m.end()) {
            continue;
        }
        matches.push(PiiMatch {
            kind: PiiKind::CreditCardLike,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in p.street_address.find_iter(text) {
        matches.push(PiiMatch {
            kind: PiiKind::StreetAddressLike,
            start: m.start(),
            end: m.end(),
        });
    }
    for m in p.ipv4.find_iter(text) {
        if is_valid_ipv4(m.as_str()) && !covered(&matches, m.start(), m.end()) {
            matches.push(PiiMatch {
                kind: PiiKind::Ip,
                start: m.start(),
                end: m.end(),
            });
        }
    }

    matches.sort_by_key(|m| m.start);
    matches
}

fn covered(matches: &[PiiMatch], start: usize, end: usize) -> bool {
    matches.iter().any(|m| m.start <= start && m.end >= end)
}

/// Replace every detected span with its kind marker.
pub fn redact(text: &str, matches: &[PiiMatch]) -> String {
    if matches.is_empty() {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;
    for m in matches {
        if m.start < last_end {
            continue;
        }
        result.push_str(&text[last_end..m.start]);
        result.push_str(&m.kind.marker());
        last_end = m.end;
    }
    result.push_str(&text[last_end..]);
    result
}

/// Detect-and-redact in one pass.
pub fn redact_text(text: &str) -> String {
    redact(text, &detect(text))
}

fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    parts.len() == 4 && parts.iter().all(|part| part.parse::<u8>().is_ok())
}
