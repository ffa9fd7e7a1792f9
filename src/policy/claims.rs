//! Claims checking for assistant output.
//!
//! The assistant may only make claims from an approved registry; a
//! disallow pattern list catches the shapes of unapproved promises
//! (guarantees, medical claims, financial advice). User utterances are
//! never claims-checked.

use regex::Regex;
use std::sync::LazyLock;

/// Reason code attached to disallowed claims.
pub const REASON_DISALLOWED: &str = "CLAIMS_DISALLOWED";

/// Replacement inserted where a disallowed claim was removed.
const CLAIM_PLACEHOLDER: &str = "[unverified claim removed]";

static DEFAULT_DISALLOW: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bguaranteed? (?:returns?|profits?|results?|income)\b",
        r"(?i)\b100% (?:safe|effective|accurate|secure)\b",
        r"(?i)\b(?:cures?|treats?) (?:cancer|diabetes|depression|any disease)\b",
        r"(?i)\brisk[- ]free\b",
        r"(?i)\bnever (?:fails?|loses?|breaks?)\b",
        r"(?i)\bbest (?:product|service|price) (?:in the world|on the market)\b",
        r"(?i)\bFDA[- ]approved\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Registry of approved claims and disallowed claim patterns.
pub struct ClaimsRegistry {
    /// Claims the assistant is allowed to make verbatim.
    approved: Vec<String>,
    disallowed: &'static [Regex],
}

impl ClaimsRegistry {
    pub fn new(approved: Vec<String>) -> Self {
        Self {
            approved,
            disallowed: &DEFAULT_DISALLOW,
        }
    }

    pub fn is_approved(&self, claim: &str) -> bool {
        let needle = claim.trim().to_lowercase();
        self.approved.iter().any(|a| a.to_lowercase() == needle)
    }

    /// Check text against the disallow list. A hit yields a rewrite with
    /// the claim span replaced.
    pub fn check(&self, text: &str) -> Option<ClaimsHit> {
        // An exact approved claim is allowed even if a pattern would fire.
        if self.is_approved(text) {
            return None;
        }

        let mut rewrite = text.to_string();
        let mut matched = false;
        for pattern in self.disallowed {
            if pattern.is_match(&rewrite) {
                matched = true;
                rewrite = pattern.replace_all(&rewrite, CLAIM_PLACEHOLDER).into_owned();
            }
        }

        matched.then_some(ClaimsHit {
            safe_rewrite: rewrite,
        })
    }
}

impl Default for ClaimsRegistry {
    fn default() -> Self {
        Self::new(vec![
            "Shipping usually takes three to five business days.".into(),
            "You can return any item within thirty days.".into(),
        ])
    }
}

/// A disallowed-claim hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimsHit {
    pub safe_rewrite: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_text_passes() {
        let registry = ClaimsRegistry::default();
        assert!(registry.check("Our store opens at nine.").is_none());
    }

    #[test]
    fn guaranteed_returns_is_disallowed() {
        let registry = ClaimsRegistry::default();
        let hit = registry
            .check("This plan has guaranteed returns every month.")
            .unwrap();
        assert!(hit.safe_rewrite.contains(CLAIM_PLACEHOLDER));
        assert!(!hit.safe_rewrite.to_lowercase().contains("guaranteed returns"));
    }

    #[test]
    fn medical_cure_claim_is_disallowed() {
        let registry = ClaimsRegistry::default();
        assert!(registry.check("Our tea cures cancer.").is_some());
    }

    #[test]
    fn approved_claim_is_exempt() {
        let registry = ClaimsRegistry::new(vec!["This product is 100% safe.".into()]);
        assert!(registry.check("This product is 100% safe.").is_none());
        // Same pattern inside unapproved surrounding text still fires.
        assert!(registry
            .check("Trust me, this product is 100% safe and cheap.")
            .is_some());
    }

    #[test]
    fn multiple_disallowed_spans_all_replaced() {
        let registry = ClaimsRegistry::default();
        let hit = registry
            .check("It is risk-free with guaranteed profits.")
            .unwrap();
        assert_eq!(hit.safe_rewrite.matches(CLAIM_PLACEHOLDER).count(), 2);
    }
}
