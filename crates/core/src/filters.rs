//! Manifest filters and rollout selection inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Key/value constraints a server attaches to its manifests.
///
/// An update matches when every filter key it declares in its metadata
/// carries the filtered value. Keys the update does not declare pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestFilters(BTreeMap<String, Value>);

impl ManifestFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON object sent in the manifest filters response header.
    pub fn from_json(s: &str) -> crate::Result<Self> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| crate::Error::Serialization(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(crate::Error::Serialization(format!(
                "manifest filters must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(&self.0).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Check an update's metadata against these filters.
    pub fn matches(&self, metadata: &serde_json::Map<String, Value>) -> bool {
        self.0.iter().all(|(key, expected)| match metadata.get(key) {
            Some(actual) => values_match(expected, actual),
            None => true,
        })
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged(&self, other: &ManifestFilters) -> ManifestFilters {
        let mut map = self.0.clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(map)
    }
}

impl FromIterator<(String, Value)> for ManifestFilters {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Servers send header values as strings while metadata may hold numbers or bools.
fn values_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (scalar_text(expected), scalar_text(actual)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Inputs the selection policies use beyond the update rows themselves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionFilters {
    /// Static filters from configuration, overlaid with the server's latest.
    #[serde(default)]
    pub manifest_filters: ManifestFilters,
    /// Rollout percentage applied to updates that do not declare their own.
    #[serde(default)]
    pub rollout_percentage: Option<u8>,
    /// Stable per-installation salt for rollout bucketing.
    #[serde(default)]
    pub installation_id: Option<String>,
}

impl SelectionFilters {
    /// Copy with server-provided filters overlaid on the configured ones.
    pub fn with_server_filters(&self, server: &ManifestFilters) -> Self {
        Self {
            manifest_filters: self.manifest_filters.merged(server),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(p) = self.rollout_percentage
            && p > 100
        {
            return Err(format!("rollout_percentage must be 0..=100, got {p}"));
        }
        Ok(())
    }
}
