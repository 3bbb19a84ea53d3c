//! Decides whether a refresh failure came from upstream throttling.

use crate::identity::{IdentityError, IdentityErrorKind};

/// Failure class used to decide on backoff escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The provider is rate limiting us; back off harder.
    Throttling,
    /// Anything else; assumed transient.
    Other,
}

/// Throttling detector.
///
/// A structured [`IdentityErrorKind::RateLimited`] or HTTP 429 always counts.
/// Otherwise the message is matched, case-insensitively, against `patterns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleClassifier {
    patterns: Vec<String>,
}

impl Default for ThrottleClassifier {
    fn default() -> Self {
        Self::new(crate::config::SessionRefreshConfig::default().throttle_patterns)
    }
}

impl ThrottleClassifier {
    /// Build from message fragments.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Classify a provider error.
    #[must_use]
    pub fn classify(&self, error: &IdentityError) -> FailureClass {
        if error.kind == IdentityErrorKind::RateLimited || error.status == Some(429) {
            return FailureClass::Throttling;
        }

        let message = error.message.to_lowercase();
        if self.patterns.iter().any(|pattern| message.contains(pattern)) {
            FailureClass::Throttling
        } else {
            FailureClass::Other
        }
    }

    /// Shorthand for `classify(..) == Throttling`.
    #[must_use]
    pub fn is_throttling(&self, error: &IdentityError) -> bool {
        self.classify(error) == FailureClass::Throttling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(IdentityErrorKind::RateLimited, "whatever", None, FailureClass::Throttling)]
    #[case(IdentityErrorKind::Upstream, "boom", Some(429), FailureClass::Throttling)]
    #[case(IdentityErrorKind::Upstream, "Request Rate Limit reached", None, FailureClass::Throttling)]
    #[case(IdentityErrorKind::Network, "Too Many Requests", None, FailureClass::Throttling)]
    #[case(IdentityErrorKind::Network, "connection reset by peer", None, FailureClass::Other)]
    #[case(IdentityErrorKind::InvalidCredentials, "Invalid Refresh Token", Some(400), FailureClass::Other)]
    fn classifies_default_patterns(
        #[case] kind: IdentityErrorKind,
        #[case] message: &str,
        #[case] status: Option<u16>,
        #[case] expected: FailureClass,
    ) {
        let mut error = IdentityError::new(kind, message);
        error.status = status;
        assert_eq!(ThrottleClassifier::default().classify(&error), expected);
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let classifier = ThrottleClassifier::new(["Slow Down", "  "]);
        let slow = IdentityError::new(IdentityErrorKind::Upstream, "please slow down");
        let limit = IdentityError::new(IdentityErrorKind::Upstream, "rate limit");

        assert!(classifier.is_throttling(&slow));
        assert!(!classifier.is_throttling(&limit));
    }
}
