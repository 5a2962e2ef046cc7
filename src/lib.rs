//! Response Modifier
//!
//! A response hook for intercepting proxies that rewrites upstream responses
//! from declarative rules. Use it to simulate errors, latency, or altered
//! payloads while testing clients.
//!
//! # Features
//!
//! - **Request Matching**: exact path, path substring, query parameters, regex
//! - **Replace Mode**: substitute status code, body and headers
//! - **Merge Mode**: patch fields of the real JSON body by dotted path
//! - **Latency Simulation**: delay a single flow without stalling others
//! - **First Match Wins**: rules are evaluated in document order
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "/api/v1/profile": {
//!     "match_type": "exact_path",
//!     "response": {"status_code": 500, "body": {"error": "internal"}}
//!   },
//!   "/api/v1/config": {
//!     "modify_existing": true,
//!     "modifications": {"features.max_uploads": 0}
//!   }
//! }
//! ```

pub mod banner;
pub mod config;
pub mod error;
pub mod flow;
pub mod matcher;
pub mod modifier;
pub mod mutator;
pub mod server;

pub use config::{MatchType, QueryRequirement, ResponseReplacement, Rule, RuleSet};
pub use error::{ConfigError, FlowError, MutationError};
pub use flow::{Flow, FlowRequest, FlowResponse, Headers};
pub use matcher::{should_modify, Matcher};
pub use modifier::{Applied, ResponseHook, ResponseModifier};
pub use mutator::{set_nested_value, Mutation};
