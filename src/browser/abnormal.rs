use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// The scraped surface has flagged the session
///
/// Workers treat this differently from any other failure: the runtime
/// self-pauses and an operator must resume explicitly.
#[derive(Debug, Error)]
#[error("abnormal traffic detected at {url}")]
pub struct AbnormalError {
    pub url: String,
}

/// Detector for navigation responses that indicate a flagged session
///
/// The rule data lives in configuration so the detection strategy can be
/// swapped without touching worker control flow.
pub trait AbnormalDetector: Send + Sync {
    fn is_abnormal(&self, url: &str) -> bool;
}

/// Detects flagged sessions by matching the post-navigation URL
///
/// The surface redirects flagged sessions to a verification page whose URL
/// carries a recognizable path segment.
pub struct UrlPatternDetector {
    /// Compiled URL patterns
    patterns: Vec<Regex>,
}

impl UrlPatternDetector {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid abnormal-URL pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Self { patterns }
    }
}

impl AbnormalDetector for UrlPatternDetector {
    fn is_abnormal(&self, url: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_configured_url_patterns() {
        let detector = UrlPatternDetector::new(&["account/unhuman".to_string()]);
        assert!(detector.is_abnormal("https://www.zhihu.com/account/unhuman?type=unhuman"));
        assert!(!detector.is_abnormal("https://www.zhihu.com/people/someone"));
    }

    #[test]
    fn invalid_patterns_are_dropped_not_fatal() {
        let detector = UrlPatternDetector::new(&["([".to_string(), "unhuman".to_string()]);
        assert!(detector.is_abnormal("https://x.test/unhuman"));
    }

    #[test]
    fn empty_rule_list_never_matches() {
        let detector = UrlPatternDetector::new(&[]);
        assert!(!detector.is_abnormal("https://www.zhihu.com/account/unhuman"));
    }
}
