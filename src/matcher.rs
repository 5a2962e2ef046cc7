//! Request matching logic.
//!
//! Decides whether a rule applies to an intercepted request.

use crate::config::{MatchType, QueryRequirement, Rule, RuleSet};
use crate::flow::FlowRequest;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Rule matcher that owns its rule set, with regex patterns compiled up front.
pub struct Matcher {
    rules: RuleSet,
    /// One entry per rule, in rule-set order
    patterns: Vec<CompiledPattern>,
}

enum CompiledPattern {
    /// Pattern is compared as a plain string
    Literal,
    Regex(Regex),
    /// Regex that failed to compile; never matches
    Invalid,
}

impl CompiledPattern {
    fn compile(rule: &Rule) -> Self {
        if rule.match_type != MatchType::Regex {
            return CompiledPattern::Literal;
        }
        match Regex::new(&rule.pattern) {
            Ok(regex) => CompiledPattern::Regex(regex),
            Err(e) => {
                warn!(pattern = %rule.pattern, error = %e, "Invalid regex, rule will never match");
                CompiledPattern::Invalid
            }
        }
    }
}

impl Matcher {
    /// Create a new matcher for a rule set.
    pub fn new(rules: RuleSet) -> Self {
        let patterns = rules.iter().map(CompiledPattern::compile).collect();
        Self { rules, patterns }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Find the first rule, in rule-set order, that applies to a request.
    pub fn find_match(&self, request: &FlowRequest) -> Option<&Rule> {
        self.rules
            .iter()
            .zip(&self.patterns)
            .find_map(|(rule, compiled)| matches_rule(rule, compiled, request).then_some(rule))
    }
}

/// Check whether a single rule applies to a request.
///
/// Regex patterns are compiled on every call; use [`Matcher`] when evaluating
/// the same rules repeatedly.
pub fn should_modify(rule: &Rule, request: &FlowRequest) -> bool {
    matches_rule(rule, &CompiledPattern::compile(rule), request)
}

fn matches_rule(rule: &Rule, compiled: &CompiledPattern, request: &FlowRequest) -> bool {
    let path = request.path.as_str();
    debug!(pattern = %rule.pattern, path = %path, match_type = %rule.match_type, "Checking rule");

    if !rule.enabled {
        debug!(pattern = %rule.pattern, "Rule disabled, skipping");
        return false;
    }

    let matched = match &rule.match_type {
        MatchType::ExactPath => path == rule.pattern,
        MatchType::PathContains => path.contains(rule.pattern.as_str()),
        MatchType::Regex => match compiled {
            CompiledPattern::Regex(regex) => regex.is_match(path),
            CompiledPattern::Literal | CompiledPattern::Invalid => false,
        },
        MatchType::QueryParam => {
            let query = request.query_params();
            debug!(query = ?query, required = ?rule.query_params, "Checking query parameters");
            query_params_satisfied(&rule.query_params, &query)
                && path.contains(rule.pattern.as_str())
        }
        MatchType::Unknown(kind) => {
            debug!(pattern = %rule.pattern, match_type = %kind, "Unknown match type");
            false
        }
    };

    debug!(pattern = %rule.pattern, matched, "Rule checked");
    matched
}

fn query_params_satisfied(
    required: &HashMap<String, QueryRequirement>,
    query: &HashMap<String, String>,
) -> bool {
    required.iter().all(|(name, requirement)| {
        let Some(actual) = query.get(name) else {
            debug!(param = %name, "Missing required query parameter");
            return false;
        };

        let satisfied = match requirement {
            QueryRequirement::Present => true,
            QueryRequirement::OneOf(allowed) => {
                allowed.iter().any(|v| v.as_str() == Some(actual.as_str()))
            }
            QueryRequirement::Equals(expected) => expected.as_str() == Some(actual.as_str()),
        };
        if !satisfied {
            debug!(param = %name, value = %actual, required = ?requirement, "Query parameter mismatch");
        }
        satisfied
    })
}

/// Parse a query string into key-value pairs.
///
/// A repeated key keeps its first value.
pub(crate) fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        };
        params.entry(key).or_insert(value);
    }

    params
}

/// Decode `%XX` escapes and `+` as space.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
