//! Reconciliation of one resource against recorded state
//!
//! For every node the reconciler resolves inputs, decides an [`Action`]
//! against the previous record and, when applying, performs it through the
//! provider. A record is committed before the node counts as materialized,
//! so an interrupted run can always be resumed by running again.

use crate::backend::StateWriter;
use crate::context::ProgressCallback;
use crate::error::{ErrorCategory, ProviderError, StateError};
use crate::graph::DependencyGraph;
use crate::output::OutputError;
use crate::provider::Provider;
use crate::resource::Input;
use crate::retry::{RetryConfig, with_retry};
use crate::schema::{self, Mutability, ResourceKind};
use crate::state::{RecordedState, ResourceRecord};
use crate::types::{Action, NodeFailure};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Decision
// ============================================================================

/// Decide how to converge a resource.
///
/// `inputs` must already be sealed (see [`schema::seal`]); `unknown` names
/// fields whose value will only exist after apply.
pub fn decide(
    kind: ResourceKind,
    inputs: &BTreeMap<String, Value>,
    unknown: &BTreeSet<String>,
    record: Option<&ResourceRecord>,
) -> Action {
    let Some(record) = record else {
        return Action::Create;
    };
    if record.kind != kind {
        return Action::Replace;
    }

    let mut update = false;
    for spec in kind.schema().inputs {
        let changed = unknown.contains(spec.name)
            || inputs.get(spec.name) != record.inputs.get(spec.name);
        if !changed {
            continue;
        }
        match spec.mutability {
            Mutability::ForceNew => return Action::Replace,
            Mutability::Mutable => update = true,
        }
    }

    if update { Action::Update } else { Action::NoOp }
}

/// Recorded resources that are no longer declared, dependents first.
pub fn prune_order(state: &RecordedState, declared: &BTreeSet<String>) -> Vec<String> {
    let mut graph = DependencyGraph::new();
    let stale: Vec<&String> = state
        .resources
        .keys()
        .filter(|name| !declared.contains(*name))
        .collect();
    for name in &stale {
        // Names come from map keys, so they are unique
        let _ = graph.add_node(name);
    }
    for name in &stale {
        for dependency in &state.resources[*name].dependencies {
            if graph.contains(dependency)
                && let Err(e) = graph.add_edge(dependency, name)
            {
                log::warn!("Ignoring recorded dependency of '{name}': {e}");
            }
        }
    }

    let mut order = graph.topological_names();
    order.reverse();
    order
}

// ============================================================================
// Reconciler
// ============================================================================

/// Whether decisions are carried out.
pub(crate) enum Mode {
    /// Decide only; no provider mutation, no state writes
    Preview,
    Apply(Arc<StateWriter>),
}

/// Everything a node task needs, detached from the stack.
pub(crate) struct NodeJob {
    pub name: String,
    pub kind: ResourceKind,
    pub inputs: BTreeMap<String, Input>,
    pub secret_fields: BTreeSet<String>,
    pub dependencies: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct Materialized {
    pub action: Action,
    pub physical_id: String,
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub(crate) struct NodeError {
    pub action: Option<Action>,
    pub cause: String,
    /// State could not be recorded; the run must stop
    pub fatal: bool,
}

impl NodeError {
    pub fn new(action: Option<Action>, cause: impl Into<String>) -> Self {
        Self {
            action,
            cause: cause.into(),
            fatal: false,
        }
    }

    fn provider(action: Action, err: &ProviderError) -> Self {
        Self::new(Some(action), err.to_string())
    }

    fn state(action: Action, err: &StateError) -> Self {
        Self {
            action: Some(action),
            cause: format!("state backend: {err}"),
            fatal: true,
        }
    }
}

/// Result of removing resources that are no longer declared.
#[derive(Debug, Default)]
pub(crate) struct PruneOutcome {
    pub deleted: Vec<String>,
    pub failures: Vec<NodeFailure>,
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

pub(crate) struct Reconciler {
    provider: Arc<dyn Provider>,
    baseline: Arc<RecordedState>,
    retry: RetryConfig,
    mode: Mode,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        baseline: Arc<RecordedState>,
        retry: RetryConfig,
        mode: Mode,
    ) -> Self {
        Self {
            provider,
            baseline,
            retry,
            mode,
        }
    }

    pub fn is_preview(&self) -> bool {
        matches!(self.mode, Mode::Preview)
    }

    /// Converge one node. In preview mode only the decision is made.
    pub async fn reconcile(&self, job: NodeJob) -> Result<Materialized, NodeError> {
        let (inputs, unknown) = self.resolve_inputs(&job).await?;
        let sealed = schema::seal(&inputs, &job.secret_fields);
        let record = self.baseline.get(&job.name);
        let action = decide(job.kind, &sealed, &unknown, record);

        log::debug!(
            "{} ({}): {action}, inputs {:?}",
            job.name,
            job.kind,
            schema::redact(&inputs, &job.secret_fields)
        );

        match &self.mode {
            Mode::Preview => Ok(Self::preview(action, record)),
            Mode::Apply(writer) => {
                let applied = self
                    .apply(writer, &job, action, &inputs, sealed, record)
                    .await?;
                if applied.action.is_change() {
                    log::info!("{}: {} ({})", job.name, applied.action, applied.physical_id);
                }
                Ok(applied)
            }
        }
    }

    async fn resolve_inputs(
        &self,
        job: &NodeJob,
    ) -> Result<(BTreeMap<String, Value>, BTreeSet<String>), NodeError> {
        let mut values = BTreeMap::new();
        let mut unknown = BTreeSet::new();

        for (field, input) in &job.inputs {
            match input.resolve().await {
                Ok(value) => {
                    schema::validate_value(&job.name, job.kind, field, &value)
                        .map_err(|e| NodeError::new(None, e.to_string()))?;
                    values.insert(field.clone(), value);
                }
                Err(OutputError::Unknown) if self.is_preview() => {
                    unknown.insert(field.clone());
                }
                Err(err) => {
                    return Err(NodeError::new(None, format!("input '{field}': {err}")));
                }
            }
        }
        Ok((values, unknown))
    }

    fn preview(action: Action, record: Option<&ResourceRecord>) -> Materialized {
        match (action, record) {
            (Action::NoOp | Action::Update, Some(record)) => Materialized {
                action,
                physical_id: record.physical_id.clone(),
                outputs: record.outputs.clone(),
            },
            _ => Materialized {
                action,
                physical_id: String::new(),
                outputs: BTreeMap::new(),
            },
        }
    }

    async fn apply(
        &self,
        writer: &StateWriter,
        job: &NodeJob,
        action: Action,
        inputs: &BTreeMap<String, Value>,
        sealed: BTreeMap<String, Value>,
        record: Option<&ResourceRecord>,
    ) -> Result<Materialized, NodeError> {
        match (action, record) {
            (Action::NoOp, Some(record)) => Ok(Materialized {
                action,
                physical_id: record.physical_id.clone(),
                outputs: record.outputs.clone(),
            }),
            (Action::Update, Some(record)) => {
                let provider = &self.provider;
                let (kind, id, previous) = (job.kind, record.physical_id.as_str(), &record.inputs);
                let outputs = with_retry(&self.retry, &job.name, move || {
                    provider.update(kind, id, previous, inputs)
                })
                .await
                .map_err(|e| NodeError::provider(action, &e))?;

                self.commit(writer, job, action, id, sealed, outputs.clone())
                    .await?;
                Ok(Materialized {
                    action,
                    physical_id: id.to_string(),
                    outputs,
                })
            }
            (Action::Replace, Some(record)) => {
                self.delete(&job.name, record.kind, &record.physical_id)
                    .await
                    .map_err(|e| NodeError::provider(action, &e))?;

                let name = job.name.clone();
                writer
                    .commit(move |state| {
                        state.remove(&name);
                    })
                    .await
                    .map_err(|e| NodeError::state(action, &e))?;

                self.create(writer, job, action, inputs, sealed).await
            }
            _ => self.create(writer, job, Action::Create, inputs, sealed).await,
        }
    }

    async fn create(
        &self,
        writer: &StateWriter,
        job: &NodeJob,
        action: Action,
        inputs: &BTreeMap<String, Value>,
        sealed: BTreeMap<String, Value>,
    ) -> Result<Materialized, NodeError> {
        let provider = &self.provider;
        let (kind, name) = (job.kind, job.name.as_str());
        let applied = with_retry(&self.retry, name, move || provider.create(kind, name, inputs))
            .await
            .map_err(|e| NodeError::provider(action, &e))?;

        self.commit(
            writer,
            job,
            action,
            &applied.physical_id,
            sealed,
            applied.outputs.clone(),
        )
        .await?;
        Ok(Materialized {
            action,
            physical_id: applied.physical_id,
            outputs: applied.outputs,
        })
    }

    async fn commit(
        &self,
        writer: &StateWriter,
        job: &NodeJob,
        action: Action,
        physical_id: &str,
        sealed: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Value>,
    ) -> Result<(), NodeError> {
        let record = ResourceRecord::new(
            job.kind,
            physical_id,
            sealed,
            outputs,
            job.dependencies.clone(),
        );
        let name = job.name.clone();
        writer
            .commit(move |state| state.upsert(&name, record))
            .await
            .map_err(|e| NodeError::state(action, &e))
    }

    /// Delete a physical resource; one that is already gone counts as deleted.
    async fn delete(
        &self,
        name: &str,
        kind: ResourceKind,
        physical_id: &str,
    ) -> Result<(), ProviderError> {
        let provider = &self.provider;
        match with_retry(&self.retry, name, move || provider.delete(kind, physical_id)).await {
            Err(e) if e.category == ErrorCategory::NotFound => {
                log::info!("{name}: {physical_id} was already deleted");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete every recorded resource not in `declared`, dependents first.
    ///
    /// A resource whose dependent failed to delete is kept.
    pub async fn prune(
        &self,
        declared: &BTreeSet<String>,
        cancel: &CancellationToken,
        progress: &dyn ProgressCallback,
    ) -> PruneOutcome {
        let mut outcome = PruneOutcome::default();
        let Mode::Apply(writer) = &self.mode else {
            return outcome;
        };

        let current = writer.snapshot().await;
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for name in prune_order(&current, declared) {
            let Some(record) = current.get(&name) else {
                continue;
            };

            if outcome.cancelled || cancel.is_cancelled() {
                outcome.cancelled = true;
                progress.on_resource_skipped(&name, "cancelled");
                outcome.skipped.push(name);
                continue;
            }
            if blocked.contains(&name) {
                blocked.extend(record.dependencies.iter().cloned());
                progress.on_resource_skipped(&name, "a dependent could not be deleted");
                outcome.skipped.push(name);
                continue;
            }

            progress.on_resource_start(&name, record.kind);
            if let Err(e) = self.delete(&name, record.kind, &record.physical_id).await {
                let failure = NodeError::provider(Action::Delete, &e);
                progress.on_resource_complete(&name, Some(Action::Delete), Some(&failure.cause));
                blocked.extend(record.dependencies.iter().cloned());
                outcome.failures.push(NodeFailure {
                    name,
                    action: Some(Action::Delete),
                    cause: failure.cause,
                });
                continue;
            }

            let removed = name.clone();
            if let Err(e) = writer
                .commit(move |state| {
                    state.remove(&removed);
                })
                .await
            {
                let failure = NodeError::state(Action::Delete, &e);
                progress.on_resource_complete(&name, Some(Action::Delete), Some(&failure.cause));
                outcome.failures.push(NodeFailure {
                    name,
                    action: Some(Action::Delete),
                    cause: failure.cause,
                });
                outcome.cancelled = true;
                continue;
            }

            log::info!("{name}: delete ({})", record.physical_id);
            progress.on_resource_complete(&name, Some(Action::Delete), None);
            outcome.deleted.push(name);
        }
        outcome
    }
}
