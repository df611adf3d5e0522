//! Bounce severity classification
//!
//! Severity is decided in a fixed precedence: an SMTP enhanced status code
//! found anywhere in the message wins, then hard-failure keyword
//! heuristics, then the soft default. Classification is a pure function of
//! the message text.

use listmill_common::types::BounceType;
use regex::Regex;

/// Phrases that indicate a permanent failure regardless of status codes
const HARD_PHRASES: &[&str] = &[
    "nxdomain",
    "user unknown",
    "unknown user",
    "address not found",
    "mailbox not found",
    "mailbox unavailable",
    "does not exist",
    "invalid recipient",
    "no such user",
    "unknown recipient",
    "recipient rejected",
    "address rejected",
    "undeliverable",
    "permanent failure",
    "permanent error",
    "account disabled",
    "account suspended",
];

/// A classified bounce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: BounceType,
    /// Why: `smtp_status=<code>`, `body_match=<phrase>`, or `default`
    pub reason: String,
}

/// Bounce classifier
pub struct Classifier {
    status_re: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            status_re: Regex::new(r"\b([45])\.\d{1,3}\.\d{1,3}\b").unwrap(),
        }
    }

    /// Classify a bounce message body.
    pub fn classify(&self, body: &str) -> Classification {
        // Enhanced status codes take precedence; a permanent 5.x.x wins
        // over any transient 4.x.x elsewhere in the message.
        let mut first_transient: Option<&str> = None;
        for caps in self.status_re.captures_iter(body) {
            let code = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            if code.starts_with('5') {
                return Classification {
                    kind: BounceType::Hard,
                    reason: format!("smtp_status={}", code),
                };
            }
            if first_transient.is_none() {
                first_transient = Some(code);
            }
        }
        if let Some(code) = first_transient {
            return Classification {
                kind: BounceType::Soft,
                reason: format!("smtp_status={}", code),
            };
        }

        let lower = body.to_lowercase();
        for phrase in HARD_PHRASES {
            if lower.contains(phrase) {
                return Classification {
                    kind: BounceType::Hard,
                    reason: format!("body_match={}", phrase),
                };
            }
        }

        Classification {
            kind: BounceType::Soft,
            reason: "default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_wins_over_keywords() {
        let c = Classifier::new();
        let result = c.classify("Delivery failed.\nStatus: 5.1.1\nuser unknown");
        assert_eq!(result.kind, BounceType::Hard);
        assert_eq!(result.reason, "smtp_status=5.1.1");
    }

    #[test]
    fn test_transient_status_is_soft() {
        let c = Classifier::new();
        let result = c.classify("Status: 4.2.2 mailbox full, try again later");
        assert_eq!(result.kind, BounceType::Soft);
        assert_eq!(result.reason, "smtp_status=4.2.2");
    }

    #[test]
    fn test_permanent_status_beats_earlier_transient() {
        let c = Classifier::new();
        let result = c.classify("first 4.2.2 greylisted, then 5.7.1 blocked");
        assert_eq!(result.kind, BounceType::Hard);
        assert_eq!(result.reason, "smtp_status=5.7.1");
    }

    #[test]
    fn test_keyword_fallback() {
        let c = Classifier::new();
        let result = c.classify("The mail system said: User unknown in virtual table");
        assert_eq!(result.kind, BounceType::Hard);
        assert_eq!(result.reason, "body_match=user unknown");
    }

    #[test]
    fn test_default_is_soft() {
        let c = Classifier::new();
        let result = c.classify("Greylisted, please retry shortly");
        assert_eq!(result.kind, BounceType::Soft);
        assert_eq!(result.reason, "default");
    }

    #[test]
    fn test_classification_is_stable() {
        let c = Classifier::new();
        let body = "Status: 5.1.1 surrounded by prose mentioning mailbox full";
        assert_eq!(c.classify(body), c.classify(body));
    }
}
