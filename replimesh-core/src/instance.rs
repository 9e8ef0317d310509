//! Database instance identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one independently deployed database instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Shorten a connection URL for logs. Credentials live in the URL, so only a
/// prefix is ever printed.
pub fn redact_url(url: &str) -> String {
    let prefix: String = url.chars().take(20).collect();
    if prefix.len() < url.len() {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
