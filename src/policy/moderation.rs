//! Content moderation matcher.
//!
//! An ordered category list evaluated against every finalized utterance.
//! First match wins; each category carries its own decision and severity.
//! Reason codes are `MODERATION_VIOLATION` plus `MODERATION:<CATEGORY>`.

use super::Decision;
use regex::Regex;
use std::sync::LazyLock;

/// One moderation category with its patterns and verdict.
pub struct Category {
    pub name: &'static str,
    pub decision: Decision,
    pub severity: u8,
    patterns: Vec<Regex>,
}

impl Category {
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

fn rx(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){pattern}")).unwrap()
}

/// Built-in categories in match-priority order.
static DEFAULT_CATEGORIES: LazyLock<Vec<Category>> = LazyLock::new(|| {
    vec![
        Category {
            name: "JAILBREAK",
            decision: Decision::Escalate,
            severity: 3,
            patterns: vec![
                rx(r"ignore (?:all |any )?(?:previous|prior|above) (?:instructions|rules)"),
                rx(r"pretend (?:you are|to be) (?:not |no longer )?an? (?:ai|assistant)"),
                rx(r"\bdan mode\b"),
                rx(r"disregard your (?:guidelines|instructions|training)"),
            ],
        },
        Category {
            name: "VIOLENCE_THREATS",
            decision: Decision::Refuse,
            severity: 4,
            patterns: vec![
                rx(r"\b(?:kill|hurt|attack|shoot|stab)\b.{0,24}\b(?:you|him|her|them|people)\b"),
                rx(r"i(?:'m| am) going to (?:kill|hurt|attack)"),
                rx(r"how to (?:make|build) a (?:bomb|weapon)"),
            ],
        },
        Category {
            name: "SELF_HARM",
            decision: Decision::Escalate,
            severity: 4,
            patterns: vec![
                rx(r"\b(?:kill|hurt) myself\b"),
                rx(r"\bend (?:my|it) all\b"),
                rx(r"\bsuicide\b"),
            ],
        },
        Category {
            name: "HATE_SPEECH",
            decision: Decision::Refuse,
            severity: 4,
            patterns: vec![
                rx(r"\b(?:all|every)\b.{0,32}\b(?:deserve to die|are subhuman|are vermin)\b"),
                rx(r"\bgo back to your country\b"),
            ],
        },
        Category {
            name: "ILLEGAL_ACTIVITY",
            decision: Decision::Refuse,
            severity: 3,
            patterns: vec![
                rx(r"how to (?:steal|shoplift|pick a lock|launder money)"),
                rx(r"\bbuy (?:stolen|counterfeit)\b"),
                rx(r"without (?:a|any) prescription"),
            ],
        },
        Category {
            name: "EXPLICIT_CONTENT",
            decision: Decision::Refuse,
            severity: 3,
            patterns: vec![rx(r"\bexplicit sexual\b"), rx(r"\bsexually explicit\b")],
        },
        Category {
            name: "HARASSMENT",
            decision: Decision::Refuse,
            severity: 3,
            patterns: vec![
                rx(r"\byou(?:'re| are) (?:worthless|pathetic|garbage)\b"),
                rx(r"\bnobody (?:likes|wants) you\b"),
            ],
        },
    ]
});

/// A moderation hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationHit {
    pub category: &'static str,
    pub decision: Decision,
    pub severity: u8,
}

/// Evaluate the ordered category list; first match wins.
///
/// `enabled` filters and orders the categories by name; an empty slice
/// means the built-in default ordering.
pub fn moderate(text: &str, enabled: &[String]) -> Option<ModerationHit> {
    let categories = &*DEFAULT_CATEGORIES;

    let check = |category: &Category| -> Option<ModerationHit> {
        category.matches(text).then(|| ModerationHit {
            category: category.name,
            decision: category.decision,
            severity: category.severity,
        })
    };

    if enabled.is_empty() {
        categories.iter().find_map(check)
    } else {
        enabled
            .iter()
            .filter_map(|name| categories.iter().find(|c| c.name == name.as_str()))
            .find_map(check)
    }
}
