//! Error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a rule file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON rule file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },
}

/// Errors raised while applying a mutation to a response.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("could not parse JSON response: {0}")]
    InvalidJsonBody(#[from] serde_json::Error),

    #[error("JSON response is not an object (found {0})")]
    NotAnObject(&'static str),

    #[error("could not serialize body: {0}")]
    Serialize(serde_json::Error),
}

/// Errors raised on the flow exchange.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("malformed flow: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to replace {}: not a socket", .0.display())]
    NotASocket(PathBuf),
}
