//! Rule configuration for the response modifier.
//!
//! Rules are read from a JSON (or YAML) document that maps a match pattern to a
//! rule object. Document order is evaluation order, and every rule keeps the
//! pattern it was declared under.

use crate::error::ConfigError;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Ordered, immutable set of modification rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    /// Entries that could not be read as a rule: (pattern, reason)
    rejected: Vec<(String, String)>,
}

impl RuleSet {
    /// Build a rule set from rules in evaluation order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            rejected: Vec::new(),
        }
    }

    /// Load a rule file. `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a rule file, falling back to an empty rule set.
    ///
    /// A missing file is a warning, an unreadable or malformed one an error;
    /// neither stops the caller. Validation problems are logged and the
    /// offending rules are kept.
    pub fn load_or_empty(path: &Path) -> Self {
        let rules = match Self::from_file(path) {
            Ok(rules) => rules,
            Err(ConfigError::NotFound(path)) => {
                warn!(path = %path.display(), "Rule file not found, using empty rule set");
                return Self::default();
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load rule file, using empty rule set");
                return Self::default();
            }
        };

        info!(path = %path.display(), rules = rules.len(), "Loaded modification rules");

        for problem in rules.problems() {
            warn!(error = %problem, "Rule problem");
        }
        for rule in rules.iter() {
            if rule.modify_existing && rule.response.is_some() {
                warn!(
                    pattern = %rule.pattern,
                    "Rule sets both modify_existing and response; response will be ignored"
                );
            }
            for (name, requirement) in &rule.query_params {
                if !requirement.is_textual() {
                    warn!(
                        pattern = %rule.pattern,
                        param = %name,
                        "Non-string query requirement never matches; quote the value"
                    );
                }
            }
        }

        rules
    }

    /// Fail on the first validation problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.problems().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    /// Every validation problem in the rule set, rejected entries first.
    pub fn problems(&self) -> Vec<ConfigError> {
        self.rejected
            .iter()
            .map(|(pattern, reason)| ConfigError::InvalidRule {
                pattern: pattern.clone(),
                reason: reason.clone(),
            })
            .chain(self.rules.iter().filter_map(|rule| rule.validate().err()))
            .collect()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }
}

impl<'de> Deserialize<'de> for RuleSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RuleSetVisitor;

        impl<'de> Visitor<'de> for RuleSetVisitor {
            type Value = RuleSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of match patterns to rule objects")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RuleSet, A::Error> {
                let mut rules: Vec<Rule> = Vec::with_capacity(map.size_hint().unwrap_or(0));
                let mut rejected: Vec<(String, String)> = Vec::new();

                // Entries are converted one at a time so a mistyped rule only loses itself
                while let Some((pattern, entry)) = map.next_entry::<String, Value>()? {
                    // Repeated key: last definition wins, first position kept
                    rejected.retain(|(p, _)| *p != pattern);
                    match serde_json::from_value::<Rule>(entry) {
                        Ok(mut rule) => {
                            rule.pattern = pattern;
                            match rules.iter_mut().find(|r| r.pattern == rule.pattern) {
                                Some(existing) => *existing = rule,
                                None => rules.push(rule),
                            }
                        }
                        Err(e) => {
                            rules.retain(|r| r.pattern != pattern);
                            rejected.push((pattern, e.to_string()));
                        }
                    }
                }

                Ok(RuleSet { rules, rejected })
            }
        }

        deserializer.deserialize_map(RuleSetVisitor)
    }
}

/// A single modification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Match pattern (the key the rule was declared under)
    #[serde(skip)]
    pub pattern: String,

    /// Optional free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether this rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How the pattern is compared against the request
    #[serde(default)]
    pub match_type: MatchType,

    /// Required query parameters (query_param rules only)
    #[serde(default)]
    pub query_params: HashMap<String, QueryRequirement>,

    /// Delay in seconds before the response is released
    #[serde(default)]
    pub delay: Option<f64>,

    /// Patch the upstream JSON body instead of replacing the response
    #[serde(default)]
    pub modify_existing: bool,

    /// Dotted path -> value, applied in order (modify_existing rules only)
    #[serde(default)]
    pub modifications: Map<String, Value>,

    /// Replacement response
    #[serde(default)]
    pub response: Option<ResponseReplacement>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// An enabled `path_contains` rule with no effect.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            description: None,
            enabled: true,
            match_type: MatchType::default(),
            query_params: HashMap::new(),
            delay: None,
            modify_existing: false,
            modifications: Map::new(),
            response: None,
        }
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, requirement: QueryRequirement) -> Self {
        self.query_params.insert(name.into(), requirement);
        self
    }

    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn with_modification(mut self, path: impl Into<String>, value: Value) -> Self {
        self.modify_existing = true;
        self.modifications.insert(path.into(), value);
        self
    }

    pub fn with_response(mut self, response: ResponseReplacement) -> Self {
        self.response = Some(response);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The configured delay, if it is a usable duration.
    pub fn delay_duration(&self) -> Option<Duration> {
        self.delay.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Validate the rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            pattern: self.pattern.clone(),
            reason,
        };

        if self.match_type == MatchType::Regex {
            regex::Regex::new(&self.pattern).map_err(|e| invalid(format!("invalid regex: {}", e)))?;
        }

        if let Some(secs) = self.delay {
            if !secs.is_finite() || secs < 0.0 {
                return Err(invalid(format!("invalid delay: {}", secs)));
            }
        }

        if let Some(response) = &self.response {
            if let Some(status) = response.status_code {
                if !(100..=599).contains(&status) {
                    return Err(invalid(format!("invalid status code: {}", status)));
                }
            }
        }

        Ok(())
    }
}

/// How a rule's pattern is compared against the request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchType {
    /// Path equals the pattern
    ExactPath,
    /// Path contains the pattern
    #[default]
    PathContains,
    /// Required query parameters plus path contains the pattern
    QueryParam,
    /// Pattern is a regex searched for in the path
    Regex,
    /// Anything else; never matches
    Unknown(String),
}

impl From<String> for MatchType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "exact_path" => MatchType::ExactPath,
            "path_contains" => MatchType::PathContains,
            "query_param" => MatchType::QueryParam,
            "regex" => MatchType::Regex,
            _ => MatchType::Unknown(value),
        }
    }
}

impl From<MatchType> for String {
    fn from(value: MatchType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::ExactPath => f.write_str("exact_path"),
            MatchType::PathContains => f.write_str("path_contains"),
            MatchType::QueryParam => f.write_str("query_param"),
            MatchType::Regex => f.write_str("regex"),
            MatchType::Unknown(other) => f.write_str(other),
        }
    }
}

/// Requirement on a single query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryRequirement {
    /// `null`: the parameter must be present with any value
    Present,
    /// A list: the value must be one of these
    OneOf(Vec<Value>),
    /// Any other value: the value must equal it
    Equals(Value),
}

impl QueryRequirement {
    pub fn equals(value: impl Into<Value>) -> Self {
        QueryRequirement::Equals(value.into())
    }

    /// Whether a query parameter value (always text) can satisfy this requirement.
    ///
    /// Numbers and booleans never equal a parameter's text.
    pub fn is_textual(&self) -> bool {
        match self {
            QueryRequirement::Present => true,
            QueryRequirement::OneOf(allowed) => allowed.iter().any(Value::is_string),
            QueryRequirement::Equals(expected) => expected.is_string(),
        }
    }
}

/// Synthetic response that replaces the upstream one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseReplacement {
    /// Status code to set
    #[serde(default)]
    pub status_code: Option<u16>,

    /// Body to set: objects and arrays are sent as JSON, `null` empties the
    /// body, anything else is sent as text. `None` keeps the upstream body.
    #[serde(default, deserialize_with = "present_value")]
    pub body: Option<Value>,

    /// Headers to set or overwrite
    #[serde(default)]
    pub headers: Map<String, Value>,
}

impl ResponseReplacement {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Deserialize a field that was written out, keeping an explicit `null`.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Text form of a configured scalar: strings verbatim, everything else as JSON.
pub(crate) fn value_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}
