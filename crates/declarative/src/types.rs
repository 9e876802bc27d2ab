//! Core types for planning and running resource graphs

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Added to the stack, not yet seen by a scheduler
    Declared,
    /// Counted into the schedule, waiting on dependencies
    Planned,
    Materializing,
    Materialized,
    Failed,
    Skipped,
}

/// What reconciliation decided for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    /// Delete then create under a new physical identity
    Replace,
    NoOp,
    Delete,
}

impl Action {
    /// Check if the action touches the provider
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::NoOp => "no-op",
            Self::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// Outcome of a dry run. Names are in declaration order, deletions in the
/// order they would run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub to_create: Vec<String>,
    pub to_update: Vec<String>,
    pub to_replace: Vec<String>,
    pub to_delete: Vec<String>,
    pub no_op: Vec<String>,
}

impl PlanSummary {
    /// Total number of resources that would change
    pub fn total_changes(&self) -> usize {
        self.to_create.len() + self.to_update.len() + self.to_replace.len() + self.to_delete.len()
    }

    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    pub fn add(&mut self, name: &str, action: Action) {
        let bucket = match action {
            Action::Create => &mut self.to_create,
            Action::Update => &mut self.to_update,
            Action::Replace => &mut self.to_replace,
            Action::Delete => &mut self.to_delete,
            Action::NoOp => &mut self.no_op,
        };
        bucket.push(name.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// A node that could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub name: String,
    /// The action being attempted, if it was decided
    pub action: Option<Action>,
    pub cause: String,
}

/// Counts of applied actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    pub fn add(&mut self, action: Action) {
        match action {
            Action::Create => self.created += 1,
            Action::Update => self.updated += 1,
            Action::Replace => self.replaced += 1,
            Action::Delete => self.deleted += 1,
            Action::NoOp => self.unchanged += 1,
        }
    }
}

/// Result of [`Engine::run`](crate::engine::Engine::run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    /// Resolved exports; empty unless the run succeeded
    pub exports: BTreeMap<String, Value>,
    pub failures: Vec<NodeFailure>,
    pub skipped: Vec<String>,
    pub summary: RunSummary,
    /// Action applied per materialized node, in completion order
    pub applied: Vec<(String, Action)>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Options for the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum number of nodes materializing at once
    pub max_in_flight: usize,
    /// Retry policy for transient provider errors
    pub retry: RetryConfig,
    /// Cancel the run after this long
    pub timeout: Option<Duration>,
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryConfig::default(),
            timeout: None,
        }
    }
}
