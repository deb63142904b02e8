//! Adblock-Plus-style rule list compiler and matcher
//!
//! Rule documents use the gfwlist dialect: one rule per line, `!` and `[`
//! lines are comments, `@@` marks a whitelist rule, `/.../ ` is a regular
//! expression, `||` anchors a host suffix, `|` anchors a URL prefix, and a
//! bare token is a host rule when it contains no `/` and a substring rule
//! otherwise.
//!
//! Compilation builds two structures: a fast-path hash map keyed by rule
//! pattern for host rules, and the full rule vector for the slow path. The
//! fast path is consulted with the query name and its heuristic root domain;
//! a fast-path hit is authoritative (a whitelist hit inverts the verdict).
//! The slow path scans rules in input order and the first match wins.

use std::collections::HashMap;

use regex::Regex;
use tracing::warn;

/// The matching strategy a single rule compiles to
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// `||example.com` or bare `example.com`: the domain itself or any
    /// subdomain of it
    HostSuffix(String),

    /// `|prefix`: the name starts with the pattern
    UrlPrefix(String),

    /// Bare token containing `/`: the name contains the pattern
    UrlContains(String),

    /// `/regex/`: compiled expression; `None` when compilation failed, in
    /// which case the rule never matches
    Regex {
        pattern: String,
        compiled: Option<Regex>,
    },
}

/// One compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    /// `@@` rules invert: a match means "definitely not blocked"
    pub whitelist: bool,
}

impl Rule {
    /// Test the rule body against a domain (whitelist inversion is the
    /// caller's job)
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        match &self.kind {
            RuleKind::HostSuffix(pattern) => {
                domain == pattern
                    || (domain.len() > pattern.len()
                        && domain.ends_with(pattern)
                        && domain.as_bytes()[domain.len() - pattern.len() - 1] == b'.')
            }
            RuleKind::UrlPrefix(pattern) => domain.starts_with(pattern.as_str()),
            RuleKind::UrlContains(pattern) => domain.contains(pattern.as_str()),
            RuleKind::Regex { compiled, .. } => {
                compiled.as_ref().is_some_and(|re| re.is_match(domain))
            }
        }
    }
}

/// An immutable compiled rule list
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Host-rule pattern -> index into `rules`
    fast_path: HashMap<String, usize>,
    /// All rules in input order
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile a rule document
    ///
    /// Unparseable regular expressions are logged and compiled to a rule
    /// that never matches; they do not fail the whole document.
    #[must_use]
    pub fn parse(document: &str) -> Self {
        let mut set = Self::default();

        for line in document.lines() {
            let mut body = line.trim();
            if body.is_empty() || body.starts_with('!') || body.starts_with('[') {
                continue;
            }

            let whitelist = if let Some(rest) = body.strip_prefix("@@") {
                body = rest;
                true
            } else {
                false
            };

            let mut fast_key = None;
            let kind = if body.len() >= 2 && body.starts_with('/') && body.ends_with('/') {
                let pattern = &body[1..body.len() - 1];
                let compiled = match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Invalid regex rule {:?}: {}", pattern, e);
                        None
                    }
                };
                RuleKind::Regex {
                    pattern: pattern.to_string(),
                    compiled,
                }
            } else if let Some(rest) = body.strip_prefix("||") {
                fast_key = Some(rest.to_string());
                RuleKind::HostSuffix(rest.to_string())
            } else if let Some(rest) = body.strip_prefix('|') {
                RuleKind::UrlPrefix(rest.to_string())
            } else if body.contains('/') {
                RuleKind::UrlContains(body.to_string())
            } else {
                let host = body.trim_start_matches('.');
                fast_key = Some(host.to_string());
                RuleKind::HostSuffix(host.to_string())
            };

            let index = set.rules.len();
            set.rules.push(Rule { kind, whitelist });
            if let Some(key) = fast_key {
                set.fast_path.insert(key, index);
            }
        }

        set
    }

    /// Fast-path lookup: the exact name, then its heuristic root domain.
    ///
    /// Returns `Some(verdict)` when a host rule was found for either key;
    /// that verdict is authoritative and the slow path must not run.
    #[must_use]
    pub fn fast_match(&self, domain: &str) -> Option<bool> {
        if domain.is_empty() {
            return None;
        }

        let rule = self.fast_path.get(domain).or_else(|| {
            let root = root_domain(domain)?;
            if root == domain {
                None
            } else {
                self.fast_path.get(root)
            }
        })?;

        let rule = &self.rules[*rule];
        let matched = rule.matches(domain);
        Some(if rule.whitelist { !matched } else { matched })
    }

    /// Full classification: fast path, then the slow path in input order.
    #[must_use]
    pub fn is_blocked(&self, domain: &str) -> bool {
        if let Some(verdict) = self.fast_match(domain) {
            return verdict;
        }

        for rule in &self.rules {
            if rule.matches(domain) {
                return !rule.whitelist;
            }
        }
        false
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules were compiled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Heuristic root of a domain: its last two labels, extended to three when
/// the second-to-last label is short (co.uk, com.cn and friends).
fn root_domain(domain: &str) -> Option<&str> {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return Some(domain);
    }

    let take = if labels[labels.len() - 2].len() < 4 {
        3
    } else {
        2
    };
    let skip: usize = labels[..labels.len() - take]
        .iter()
        .map(|l| l.len() + 1)
        .sum();
    domain.get(skip..)
}
