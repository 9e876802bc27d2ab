//! Scheduler - materializes the graph with bounded concurrency
//!
//! Nodes become ready once every dependency is materialized and are
//! dispatched in declaration order, at most `max_in_flight` at a time.
//! The scheduler loop is the only writer of node state: tasks report back
//! through the join set and the loop settles outputs and readiness.

use crate::context::ProgressCallback;
use crate::graph::DependencyGraph;
use crate::output::OutputError;
use crate::reconcile::{Materialized, NodeError, NodeJob, Reconciler};
use crate::resource::ResourceNode;
use crate::types::{Action, NodeFailure, NodeState};
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What happened to every node of one pass.
#[derive(Debug)]
pub(crate) struct Execution {
    pub states: Vec<NodeState>,
    pub actions: Vec<Option<Action>>,
    /// Materialized nodes in completion order
    pub applied: Vec<(String, Action)>,
    pub failures: Vec<NodeFailure>,
    pub skipped: Vec<String>,
    pub cancelled: bool,
    /// Stopped because state could not be recorded
    pub halted: bool,
}

impl Execution {
    fn new(count: usize) -> Self {
        Self {
            states: vec![NodeState::Declared; count],
            actions: vec![None; count],
            applied: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            cancelled: false,
            halted: false,
        }
    }

    /// A pass over no nodes.
    pub fn empty() -> Self {
        Self::new(0)
    }

    pub fn all_materialized(&self) -> bool {
        self.states.iter().all(|s| *s == NodeState::Materialized)
    }
}

struct Scheduler<'a> {
    nodes: &'a [ResourceNode],
    graph: &'a DependencyGraph,
    progress: &'a dyn ProgressCallback,
    preview: bool,
    waiting: Vec<usize>,
    ready: BTreeSet<usize>,
    exec: Execution,
}

impl Scheduler<'_> {
    fn job(&self, idx: usize) -> NodeJob {
        let node = &self.nodes[idx];
        NodeJob {
            name: node.name.clone(),
            kind: node.kind,
            inputs: node.inputs.clone(),
            secret_fields: node.secret_fields.clone(),
            dependencies: self.graph.dependency_names(idx),
        }
    }

    fn complete(&mut self, idx: usize, result: Result<Materialized, NodeError>) {
        match result {
            Ok(done) => self.materialized(idx, done),
            Err(err) => self.failed(idx, err),
        }
    }

    fn materialized(&mut self, idx: usize, done: Materialized) {
        let nodes = self.nodes;
        let node = &nodes[idx];
        let preview = self.preview;
        node.settle_outputs(&done.outputs, |field| {
            if preview {
                OutputError::Unknown
            } else {
                OutputError::failed(format!("provider did not report output '{field}'"))
                    .within(&node.name)
            }
        });

        self.exec.states[idx] = NodeState::Materialized;
        self.exec.actions[idx] = Some(done.action);
        self.exec.applied.push((node.name.clone(), done.action));
        self.progress
            .on_resource_complete(&node.name, Some(done.action), None);

        for &dependent in self.graph.dependents(idx) {
            self.waiting[dependent] -= 1;
            if self.waiting[dependent] == 0 && self.exec.states[dependent] == NodeState::Planned {
                self.ready.insert(dependent);
            }
        }
    }

    fn failed(&mut self, idx: usize, err: NodeError) {
        let nodes = self.nodes;
        let node = &nodes[idx];
        log::error!("{}: {}", node.name, err.cause);

        let cause = OutputError::failed(err.cause.clone()).within(&node.name);
        node.fail_outputs(&cause);
        self.exec.states[idx] = NodeState::Failed;
        self.exec.actions[idx] = err.action;
        self.progress
            .on_resource_complete(&node.name, err.action, Some(&err.cause));
        self.exec.failures.push(NodeFailure {
            name: node.name.clone(),
            action: err.action,
            cause: err.cause,
        });

        // Skip in topological order so each chain runs through the
        // dependency the failure arrived by
        let reason = format!("depends on failed resource '{}'", node.name);
        let descendants = self.graph.descendants(idx);
        let mut causes = BTreeMap::from([(idx, cause)]);
        for next in self.graph.topological_order() {
            if !descendants.contains(&next) || self.exec.states[next] != NodeState::Planned {
                continue;
            }
            let upstream = self
                .graph
                .dependencies(next)
                .iter()
                .find_map(|dep| causes.get(dep))
                .unwrap_or(&causes[&idx])
                .clone();
            let chained = self.skip(next, &reason, upstream);
            causes.insert(next, chained);
        }
    }

    /// Skip a queued node, returning the error its outputs now carry.
    fn skip(&mut self, idx: usize, reason: &str, cause: OutputError) -> OutputError {
        let nodes = self.nodes;
        let node = &nodes[idx];
        log::warn!("{}: skipped, {reason}", node.name);

        let cause = cause.within(&node.name);
        node.fail_outputs(&cause);
        self.exec.states[idx] = NodeState::Skipped;
        self.ready.remove(&idx);
        self.exec.skipped.push(node.name.clone());
        self.progress.on_resource_skipped(&node.name, reason);
        cause
    }
}

/// Materialize every node, respecting dependencies.
///
/// A failed node fails its outputs and every unmaterialized descendant is
/// skipped; nodes already materialized are left alone. Once `cancel` fires
/// no new node is dispatched, in-flight nodes finish, and everything still
/// queued is skipped.
///
/// A panicking node is reported as a failure of that node. This relies on
/// unwinding; builds with `panic = "abort"` (the release profile) terminate
/// the process instead.
pub(crate) async fn execute(
    nodes: &[ResourceNode],
    graph: &DependencyGraph,
    reconciler: &Arc<Reconciler>,
    max_in_flight: usize,
    cancel: &CancellationToken,
    progress: &dyn ProgressCallback,
) -> Execution {
    let count = nodes.len();
    let waiting: Vec<usize> = (0..count).map(|i| graph.dependencies(i).len()).collect();
    let ready = (0..count).filter(|&i| waiting[i] == 0).collect();
    let mut exec = Execution::new(count);
    exec.states.fill(NodeState::Planned);
    let mut scheduler = Scheduler {
        nodes,
        graph,
        progress,
        preview: reconciler.is_preview(),
        waiting,
        ready,
        exec,
    };

    let limit = max_in_flight.max(1);
    let mut tasks: JoinSet<(usize, Result<Materialized, NodeError>)> = JoinSet::new();
    let mut stopped = false;

    loop {
        if !stopped && cancel.is_cancelled() {
            log::warn!("Run cancelled, waiting for {} in-flight resource(s)", tasks.len());
            scheduler.exec.cancelled = true;
            stopped = true;
        }

        while !stopped && tasks.len() < limit {
            let Some(idx) = scheduler.ready.pop_first() else {
                break;
            };
            let job = scheduler.job(idx);
            log::debug!("Dispatching {} ({})", job.name, job.kind);
            scheduler.exec.states[idx] = NodeState::Materializing;
            progress.on_resource_start(&job.name, job.kind);

            let reconciler = Arc::clone(reconciler);
            tasks.spawn(async move {
                let result = AssertUnwindSafe(reconciler.reconcile(job))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(NodeError::new(None, "resource task panicked")));
                (idx, result)
            });
        }

        if tasks.is_empty() {
            break;
        }

        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok((idx, result))) => {
                    let fatal = matches!(&result, Err(e) if e.fatal);
                    scheduler.complete(idx, result);
                    if fatal && !stopped {
                        log::error!("State could not be recorded, stopping the run");
                        scheduler.exec.halted = true;
                        stopped = true;
                    }
                }
                Some(Err(e)) => log::error!("Resource task aborted: {e}"),
                None => break,
            },
            () = cancel.cancelled(), if !stopped => {}
        }
    }

    // Whatever was never dispatched is skipped so its outputs settle
    let reason = if scheduler.exec.cancelled {
        "cancelled"
    } else {
        "run stopped after a state backend failure"
    };
    let cause = OutputError::failed(reason);
    for idx in 0..count {
        match scheduler.exec.states[idx] {
            NodeState::Planned => {
                scheduler.skip(idx, reason, cause.clone());
            }
            NodeState::Materializing => scheduler.failed(idx, NodeError::new(None, "task aborted")),
            _ => {}
        }
    }

    scheduler.exec
}
