//! Audit Log Entry
//!
//! One record per inbound request, serialized to canonical JSON before it is
//! hashed or written.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Headers captured when no allow-list is configured.
pub const DEFAULT_ALLOWED_HEADERS: &[&str] = &["user-agent", "referer"];

/// Request as handed over by the routing layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Case-insensitive set of header names that may be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAllowList {
    names: BTreeSet<String>,
}

impl HeaderAllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_ascii_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }

    /// Keep only allowed headers, keyed by lower-cased name.
    pub fn filter(&self, headers: &HashMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .filter(|(name, _)| self.allows(name))
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl Default for HeaderAllowList {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_HEADERS)
    }
}

/// Audit log entry
///
/// Field order is the serialization order. Headers are a `BTreeMap` so the
/// JSON key order is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn new(
        timestamp: i64,
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            timestamp,
            method,
            url,
            headers,
        }
    }

    /// Build an entry from a request, keeping only allow-listed headers
    pub fn from_request(
        descriptor: &RequestDescriptor,
        allow_list: &HeaderAllowList,
        timestamp: i64,
    ) -> Self {
        Self::new(
            timestamp,
            descriptor.method.clone(),
            descriptor.url.clone(),
            allow_list.filter(&descriptor.headers),
        )
    }

    /// Canonical single-line JSON form. This is the leaf content.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn summary(&self) -> String {
        format!("{} {} @ {}", self.method, self.url, self.timestamp)
    }
}
