//! Flow types exchanged with the host proxy.
//!
//! A [`Flow`] is one intercepted request/response pair, already decoded by the
//! proxy engine. The hook only ever mutates the `response` half.

use crate::matcher::parse_query_string;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;

/// One intercepted request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Host-assigned identifier, echoed back on the flow exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The client request
    pub request: FlowRequest,

    /// The upstream response, mutated in place by the hook
    pub response: FlowResponse,
}

impl Flow {
    pub fn new(request: FlowRequest, response: FlowResponse) -> Self {
        Self {
            id: None,
            request,
            response,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Request side of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Request path as reported by the host (may carry a `?query` suffix)
    pub path: String,

    /// Full URL, used for logging
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Decoded query parameters, when the host provides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<HashMap<String, String>>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FlowRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            url: String::new(),
            query: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = Some(query);
        self
    }

    /// Query parameters of this request.
    ///
    /// Uses the host-provided mapping when present, otherwise parses whatever
    /// follows `?` in the path.
    pub fn query_params(&self) -> HashMap<String, String> {
        match &self.query {
            Some(query) => query.clone(),
            None => {
                let raw = self.path.split_once('?').map(|(_, q)| q).unwrap_or("");
                parse_query_string(raw)
            }
        }
    }

    /// URL for log lines, falling back to the path.
    pub fn display_url(&self) -> &str {
        if self.url.is_empty() {
            &self.path
        } else {
            &self.url
        }
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set `name` to `value`, replacing every existing entry of that name.
    ///
    /// The replacement keeps the position of the first existing entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(first) => {
                self.0[first] = (name.clone(), value);
                let mut idx = 0;
                self.0.retain(|(k, _)| {
                    let keep = idx <= first || !k.eq_ignore_ascii_case(&name);
                    idx += 1;
                    keep
                });
            }
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Response side of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status_code: u16,

    /// Response headers
    #[serde(default)]
    pub headers: Headers,

    /// Decoded response body
    #[serde(default, with = "wire_body")]
    pub body: Vec<u8>,
}

fn default_status() -> u16 {
    200
}

impl FlowResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Replace the body, keeping an existing `content-length` header accurate.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        if self.headers.get("content-length").is_some() {
            self.headers.set("content-length", self.body.len().to_string());
        }
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Body encoding on the flow exchange: UTF-8 text verbatim, anything else as base64.
mod wire_body {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum WireBody {
        Text { content: String },
        Base64 { content: String },
    }

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match std::str::from_utf8(body) {
            Ok(text) => WireBody::Text {
                content: text.to_string(),
            },
            Err(_) => WireBody::Base64 {
                content: base64::engine::general_purpose::STANDARD.encode(body),
            },
        };
        wire.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match WireBody::deserialize(deserializer)? {
            WireBody::Text { content } => Ok(content.into_bytes()),
            WireBody::Base64 { content } => base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| serde::de::Error::custom(format!("invalid base64 body: {}", e))),
        }
    }
}
