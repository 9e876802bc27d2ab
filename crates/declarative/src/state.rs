//! Recorded state from previous runs
//!
//! Maps each logical name to the physical resource that backs it, the
//! inputs it was last applied with (secrets sealed) and the outputs the
//! provider reported.

use crate::schema::ResourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const STATE_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedState {
    pub version: u32,

    /// Last time any record changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,

    /// Exports of the last successful run
    #[serde(default)]
    pub exports: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub physical_id: String,

    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,

    /// Logical names this resource depended on when last applied
    #[serde(default)]
    pub dependencies: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RecordedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_updated: None,
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
        }
    }
}

// ============================================================================
// RecordedState Implementation
// ============================================================================

impl RecordedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Insert or replace the record for `name`, keeping its creation time
    /// when the physical resource is unchanged.
    pub fn upsert(&mut self, name: &str, mut record: ResourceRecord) {
        if let Some(previous) = self.resources.get(name)
            && previous.physical_id == record.physical_id
        {
            record.created_at = previous.created_at;
        }
        self.resources.insert(name.to_string(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        self.resources.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }
}

impl ResourceRecord {
    pub fn new(
        kind: ResourceKind,
        physical_id: impl Into<String>,
        inputs: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Value>,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            kind,
            physical_id: physical_id.into(),
            inputs,
            outputs,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> ResourceRecord {
        ResourceRecord::new(
            ResourceKind::LogGroup,
            id,
            BTreeMap::from([("name".to_string(), json!("app"))]),
            BTreeMap::from([("arn".to_string(), json!(format!("arn:{id}")))]),
            vec![],
        )
    }

    #[test]
    fn test_default_state_is_empty() {
        let state = RecordedState::default();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.is_empty());
        assert!(state.last_updated.is_none());
    }

    #[test]
    fn test_upsert_keeps_created_at_for_same_resource() {
        let mut state = RecordedState::new();
        let first = record("lg-1");
        let created = first.created_at;
        state.upsert("logs", first);

        let mut updated = record("lg-1");
        updated.created_at = Utc::now() + chrono::Duration::hours(1);
        state.upsert("logs", updated);
        assert_eq!(state.get("logs").unwrap().created_at, created);

        let mut replaced = record("lg-2");
        let replaced_at = Utc::now() + chrono::Duration::hours(2);
        replaced.created_at = replaced_at;
        state.upsert("logs", replaced);
        assert_eq!(state.get("logs").unwrap().created_at, replaced_at);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let mut state = RecordedState::new();
        state.upsert("logs", record("lg-1"));
        state.exports.insert("url".into(), json!("lb.example"));
        state.touch();

        let text = serde_json::to_string_pretty(&state).unwrap();
        assert!(text.contains("\"kind\": \"log_group\""));
        let parsed: RecordedState = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_missing_optional_sections_default() {
        let parsed: RecordedState = serde_json::from_str(r#"{"version": 1}"#).unwrap();
        assert!(parsed.resources.is_empty());
        assert!(parsed.exports.is_empty());
    }
}
