//! The domain blacklist (C1): a hot-swappable set of case-insensitive regex
//! patterns checked against the request host.
//!
//! Reads never block on a writer: the compiled pattern list sits behind an
//! `ArcSwap`, so a SIGHUP-triggered reload only has to publish a new `Arc`
//! rather than take a lock every lookup has to contend on.

use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;

use crate::core::error::ProxyError;

/// A single rule: the raw pattern text as configured, plus its compiled,
/// case-insensitive form. Keeping the raw text alongside the `Regex` is what
/// lets `Control::read_blacklist()` (C7) hand the dashboard back the same
/// strings it wrote, rather than only a count.
struct Rule {
    raw: String,
    compiled: Regex,
}

/// Every pattern in this crate is compiled with this inline-flag prefix
/// (case-insensitive); stripping it back off recovers the user-facing
/// pattern text for display.
const CASE_INSENSITIVE_PREFIX: &str = "(?i)";

fn display_pattern(compiled: &Regex) -> String {
    compiled
        .as_str()
        .strip_prefix(CASE_INSENSITIVE_PREFIX)
        .unwrap_or_else(|| compiled.as_str())
        .to_string()
}

pub struct Blacklist {
    rules: ArcSwap<Vec<Rule>>,
}

impl Blacklist {
    pub fn new(patterns: Vec<Regex>) -> Self {
        let rules = patterns
            .into_iter()
            .map(|compiled| Rule {
                raw: display_pattern(&compiled),
                compiled,
            })
            .collect();
        Self {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// True if `host` matches any configured pattern. Matching is a substring
    /// search per pattern (patterns are compiled case-insensitively), not an
    /// anchored full-string match, so `ads.example.com` blocks
    /// `cdn.ads.example.com` too.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.rules.load().iter().any(|r| r.compiled.is_match(host))
    }

    /// Atomically replaces the pattern set. Existing lookups in flight keep
    /// using the snapshot they already loaded; nothing blocks.
    pub fn reload(&self, patterns: Vec<Regex>) {
        self.rules.store(Arc::new(
            patterns
                .into_iter()
                .map(|compiled| Rule {
                    raw: display_pattern(&compiled),
                    compiled,
                })
                .collect(),
        ));
    }

    /// Compiles `raw` patterns (case-insensitive) and installs them,
    /// rejecting the whole batch if any one pattern fails to compile so a
    /// typo in one rule can't silently drop the rest of the blacklist.
    pub fn reload_from_strings(&self, raw: &[String]) -> Result<(), ProxyError> {
        let rules = raw
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .map(|compiled| Rule {
                        raw: p.clone(),
                        compiled,
                    })
                    .map_err(|e| ProxyError::Blacklist(format!("bad pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.rules.store(Arc::new(rules));
        Ok(())
    }

    /// The raw pattern strings as configured, in the order they were loaded.
    /// This is what a dashboard's `read_blacklist()` call displays for editing.
    pub fn patterns(&self) -> Vec<String> {
        self.rules.load().iter().map(|r| r.raw.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> Regex {
        Regex::new(&format!("(?i){p}")).unwrap()
    }

    #[test]
    fn blocks_matching_host() {
        let bl = Blacklist::new(vec![pattern("ads\\.example\\.com")]);
        assert!(bl.is_blocked("ads.example.com"));
    }

    #[test]
    fn match_is_case_insensitive() {
        let bl = Blacklist::new(vec![pattern("ads\\.example\\.com")]);
        assert!(bl.is_blocked("ADS.EXAMPLE.COM"));
    }

    #[test]
    fn matches_as_substring_not_anchored() {
        let bl = Blacklist::new(vec![pattern("ads\\.example\\.com")]);
        assert!(bl.is_blocked("cdn.ads.example.com"));
    }

    #[test]
    fn unmatched_host_is_not_blocked() {
        let bl = Blacklist::new(vec![pattern("ads\\.example\\.com")]);
        assert!(!bl.is_blocked("trusted.example.com"));
    }

    #[test]
    fn empty_blacklist_blocks_nothing() {
        let bl = Blacklist::empty();
        assert!(!bl.is_blocked("anything.example.com"));
    }

    #[test]
    fn reload_replaces_patterns_atomically() {
        let bl = Blacklist::new(vec![pattern("old\\.example\\.com")]);
        assert!(bl.is_blocked("old.example.com"));
        bl.reload(vec![pattern("new\\.example\\.com")]);
        assert!(!bl.is_blocked("old.example.com"));
        assert!(bl.is_blocked("new.example.com"));
    }

    #[test]
    fn reload_from_strings_rejects_whole_batch_on_bad_pattern() {
        let bl = Blacklist::new(vec![pattern("old\\.example\\.com")]);
        let result = bl.reload_from_strings(&["(".to_string()]);
        assert!(result.is_err());
        // Original patterns stay in effect after a rejected reload.
        assert!(bl.is_blocked("old.example.com"));
    }

    #[test]
    fn patterns_round_trips_through_reload_from_strings() {
        let bl = Blacklist::empty();
        bl.reload_from_strings(&["ads\\.example\\.com".to_string(), "tracker".to_string()])
            .unwrap();
        assert_eq!(
            bl.patterns(),
            vec!["ads\\.example\\.com".to_string(), "tracker".to_string()]
        );
    }

    #[test]
    fn patterns_strips_case_insensitive_prefix_when_built_from_regex() {
        let bl = Blacklist::new(vec![pattern("ads\\.example\\.com")]);
        assert_eq!(bl.patterns(), vec!["ads\\.example\\.com".to_string()]);
    }
}
