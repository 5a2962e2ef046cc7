//! Response modifier hook.

use crate::config::{Rule, RuleSet};
use crate::error::ConfigError;
use crate::flow::Flow;
use crate::matcher::Matcher;
use crate::mutator::{apply_rule, Mutation};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Hook invoked by the host once per completed response.
///
/// Implementations mutate `flow.response` in place; the host forwards the
/// response downstream after the call returns.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    /// Hook name used in logs.
    fn name(&self) -> &str;

    /// Inspect and possibly mutate one flow. Returns what was applied, if anything.
    async fn on_response(&self, flow: &mut Flow) -> Option<Applied>;
}

/// Record of the rule applied to a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied {
    /// Pattern of the rule that fired
    pub pattern: String,
    /// Delay that was waited, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<f64>,
    /// Mutation applied to the response
    pub mutation: Mutation,
}

/// Rule-driven response modifier.
///
/// Holds an immutable rule set; at most one rule fires per flow.
pub struct ResponseModifier {
    matcher: Matcher,
    /// Total flows seen.
    flows_total: AtomicU64,
    /// Flows that matched a rule.
    flows_matched: AtomicU64,
    /// Matched flows whose mutation failed.
    mutation_failures: AtomicU64,
}

impl ResponseModifier {
    /// Create a modifier for the given rule set.
    pub fn new(rules: RuleSet) -> Self {
        info!(
            rules = rules.len(),
            enabled = rules.enabled_count(),
            "Response modifier initialized"
        );

        Self {
            matcher: Matcher::new(rules),
            flows_total: AtomicU64::new(0),
            flows_matched: AtomicU64::new(0),
            mutation_failures: AtomicU64::new(0),
        }
    }

    /// Create from a JSON rule document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(RuleSet::from_json_str(json)?))
    }

    pub fn rules(&self) -> &RuleSet {
        self.matcher.rules()
    }

    pub fn total_flows(&self) -> u64 {
        self.flows_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.flows_matched.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.mutation_failures.load(Ordering::Relaxed)
    }

    /// Wait out the rule's delay, if any. Returns the seconds waited.
    async fn apply_delay(&self, rule: &Rule, path: &str) -> Option<f64> {
        let secs = rule.delay?;
        let Some(duration) = rule.delay_duration() else {
            warn!(pattern = %rule.pattern, delay = secs, "Ignoring invalid delay");
            return None;
        };

        if !duration.is_zero() {
            debug!(pattern = %rule.pattern, delay_ms = duration.as_millis() as u64, "Applying delay");
            tokio::time::sleep(duration).await;
        }
        info!(pattern = %rule.pattern, path = %path, "Modified: delayed {}s", secs);
        Some(secs)
    }
}

#[async_trait]
impl ResponseHook for ResponseModifier {
    fn name(&self) -> &str {
        "response-modifier"
    }

    async fn on_response(&self, flow: &mut Flow) -> Option<Applied> {
        self.flows_total.fetch_add(1, Ordering::Relaxed);

        info!(
            method = %flow.request.method,
            url = %flow.request.display_url(),
            status = flow.response.status_code,
            "Response"
        );

        let Some(rule) = self.matcher.find_match(&flow.request) else {
            debug!(path = %flow.request.path, "No rule matched, passing through");
            return None;
        };
        self.flows_matched.fetch_add(1, Ordering::Relaxed);

        let delay_secs = self.apply_delay(rule, &flow.request.path).await;
        let mutation = apply_rule(rule, &mut flow.response);

        match &mutation {
            Mutation::Failed { error } => {
                self.mutation_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    pattern = %rule.pattern,
                    path = %flow.request.path,
                    error = %error,
                    "Could not modify response, left untouched"
                );
            }
            Mutation::DelayOnly => {}
            applied => {
                info!(
                    pattern = %rule.pattern,
                    path = %flow.request.path,
                    "Modified: {}",
                    applied.describe()
                );
            }
        }

        Some(Applied {
            pattern: rule.pattern.clone(),
            delay_secs,
            mutation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRequest, FlowResponse};
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};

    fn test_rules() -> &'static str {
        r#"{
            "/api/v1/config": {
                "match_type": "exact_path",
                "modify_existing": true,
                "modifications": {"features.max_uploads": 0, "features.beta": true}
            },
            "/api/v1/payments": {
                "response": {"status_code": 503, "body": {"error": "maintenance"}}
            },
            "/api/v1/": {
                "enabled": false,
                "response": {"status_code": 500}
            },
            "/slow": {
                "delay": 0.05,
                "response": {"status_code": 200, "body": "late"}
            }
        }"#
    }

    fn flow(path: &str, response: FlowResponse) -> Flow {
        Flow::new(FlowRequest::new("GET", path), response)
    }

    #[test]
    fn test_modifier_creation() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        assert_eq!(modifier.rules().len(), 4);
        assert_eq!(modifier.name(), "response-modifier");
    }

    #[tokio::test]
    async fn test_merge_existing_body() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        let mut flow = flow(
            "/api/v1/config",
            FlowResponse::new(200).with_body(r#"{"features": {"max_uploads": 10}, "version": 3}"#),
        );

        let applied = modifier.on_response(&mut flow).await.unwrap();

        assert_eq!(applied.pattern, "/api/v1/config");
        assert_eq!(applied.mutation, Mutation::Merged { fields: 2 });
        let body: Value = serde_json::from_slice(&flow.response.body).unwrap();
        assert_eq!(
            body,
            json!({"features": {"max_uploads": 0, "beta": true}, "version": 3})
        );
    }

    #[tokio::test]
    async fn test_merge_failure_is_contained() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        let original = FlowResponse::new(200).with_body("not json");
        let mut flow = flow("/api/v1/config", original.clone());

        let applied = modifier.on_response(&mut flow).await.unwrap();

        assert!(matches!(applied.mutation, Mutation::Failed { .. }));
        assert_eq!(flow.response, original);
        assert_eq!(modifier.total_failures(), 1);
    }

    #[tokio::test]
    async fn test_replace_response() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        let mut flow = flow("/api/v1/payments/42", FlowResponse::new(200).with_body("{}"));

        let applied = modifier.on_response(&mut flow).await.unwrap();

        assert_eq!(applied.mutation, Mutation::Replaced { status_code: 503 });
        assert_eq!(flow.response.status_code, 503);
        assert_eq!(flow.response.text(), r#"{"error":"maintenance"}"#);
        assert_eq!(
            flow.response.headers.get("Content-Type"),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_no_match_passes_through() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        let original = FlowResponse::new(200).with_body("hello");
        // Only the disabled "/api/v1/" rule would match
        let mut flow = flow("/api/v1/users", original.clone());

        assert!(modifier.on_response(&mut flow).await.is_none());
        assert_eq!(flow.response, original);
        assert_eq!(modifier.total_flows(), 1);
        assert_eq!(modifier.total_matched(), 0);
    }

    #[tokio::test]
    async fn test_delay_precedes_mutation() {
        let modifier = ResponseModifier::from_json(test_rules()).unwrap();
        let mut flow = flow("/slow", FlowResponse::new(200));

        let start = Instant::now();
        let applied = modifier.on_response(&mut flow).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(applied.delay_secs, Some(0.05));
        assert_eq!(flow.response.text(), "late");
    }

    #[tokio::test]
    async fn test_only_first_matching_rule_fires() {
        let modifier = ResponseModifier::from_json(
            r#"{
                "/api": {"response": {"status_code": 418}},
                "/api/users": {"response": {"status_code": 404}}
            }"#,
        )
        .unwrap();
        let mut flow = flow("/api/users", FlowResponse::new(200));

        let applied = modifier.on_response(&mut flow).await.unwrap();

        assert_eq!(applied.pattern, "/api");
        assert_eq!(flow.response.status_code, 418);
    }

    #[tokio::test]
    async fn test_empty_rule_set_is_noop() {
        let modifier = ResponseModifier::new(RuleSet::default());
        let original = FlowResponse::new(200).with_body("x");
        let mut flow = flow("/anything", original.clone());

        assert!(modifier.on_response(&mut flow).await.is_none());
        assert_eq!(flow.response, original);
    }

    #[test]
    fn test_applied_serialization() {
        let applied = Applied {
            pattern: "/x".to_string(),
            delay_secs: None,
            mutation: Mutation::Replaced { status_code: 500 },
        };
        assert_eq!(
            serde_json::to_value(&applied).unwrap(),
            json!({"pattern": "/x", "mutation": {"kind": "replaced", "status_code": 500}})
        );
    }
}
