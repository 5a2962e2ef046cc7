//! Startup banner.

use crate::config::{Rule, RuleSet};
use chrono::{DateTime, Local};
use std::fmt::Write;
use std::path::Path;

const RULE: &str = "==================================================";

/// Render the human-readable startup summary.
///
/// `listen` describes where the host should send flows (socket path or stdio).
pub fn render(rules: &RuleSet, config_path: &Path, listen: &str, started: DateTime<Local>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Response modifier started");
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "Started at:  {}", started.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Rule file:   {}", config_path.display());
    let _ = writeln!(out, "Flows on:    {}", listen);
    let _ = writeln!(out);

    let _ = writeln!(out, "Active modifications:");
    let mut active = 0;
    for rule in rules.iter().filter(|r| r.enabled) {
        active += 1;
        let _ = write!(out, "  - {} -> {}", rule.pattern, summarize(rule));
        if let Some(description) = &rule.description {
            let _ = write!(out, "  ({})", description);
        }
        let _ = writeln!(out);
    }
    if active == 0 {
        let _ = writeln!(out, "  (none)");
    }
    let disabled = rules.len() - active;
    if disabled > 0 {
        let _ = writeln!(out, "  {} disabled rule(s) not shown", disabled);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Connect the proxy host:");
    let _ = writeln!(out, "  1. Forward each completed response as one JSON flow per line");
    let _ = writeln!(out, "  2. Read the mutated flow back from the same channel");
    let _ = writeln!(out, "  3. Point the client device at the proxy as usual");
    let _ = writeln!(out);
    let _ = writeln!(out, "Monitoring traffic...");
    let _ = writeln!(out, "{}", RULE);

    out
}

/// One-line effect summary for a rule.
fn summarize(rule: &Rule) -> String {
    let effect = if rule.modify_existing {
        "modify".to_string()
    } else if let Some(response) = &rule.response {
        match response.status_code {
            Some(status) => status.to_string(),
            None => "replace".to_string(),
        }
    } else {
        "pass".to_string()
    };

    match rule.delay {
        Some(secs) => format!("{} (+{}s)", effect, secs),
        None => effect,
    }
}
