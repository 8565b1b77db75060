//! Content moderation gate
//!
//! Everything that is broadcast passes through a [`Moderator`] first.
//! The session layer only sees the trait, so the rule set below can be
//! replaced by a smarter classifier without touching it.

use regex::Regex;
use serde::Serialize;

/// Outcome of scanning a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub flagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            flagged: false,
            reason: None,
        }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self {
            flagged: true,
            reason: Some(reason.into()),
        }
    }
}

/// Synchronous text classifier
pub trait Moderator: Send + Sync {
    fn scan(&self, text: &str) -> Verdict;
}

/// Rule-based gate: private-key-shaped tokens and forbidden terms
pub struct RuleModerator {
    private_key: Regex,
    forbidden: Vec<String>,
}

impl RuleModerator {
    pub fn new<I, S>(forbidden: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let forbidden = forbidden
            .into_iter()
            .map(|term| term.as_ref().trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect();

        Self {
            // 0x + 64 hex digits anywhere, including glued to other text
            private_key: Regex::new(r"0[xX][0-9a-fA-F]{64}")
                .expect("private key pattern is valid"),
            forbidden,
        }
    }
}

impl Moderator for RuleModerator {
    fn scan(&self, text: &str) -> Verdict {
        if text.is_empty() {
            return Verdict::clean();
        }

        if self.private_key.is_match(text) {
            return Verdict::flagged("Possible private key detected");
        }

        let lowered = text.to_lowercase();
        self.forbidden
            .iter()
            .find(|term| lowered.contains(term.as_str()))
            .map(|term| Verdict::flagged(format!("Forbidden term: {}", term)))
            .unwrap_or_else(Verdict::clean)
    }
}
