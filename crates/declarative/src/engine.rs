//! Engine - plan, run and destroy stacks
//!
//! The engine ties the pieces together: it loads recorded state, drives
//! the scheduler with a reconciler in preview or apply mode, prunes
//! resources that are no longer declared and resolves stack exports.

use crate::backend::{StateBackend, StateWriter};
use crate::context::{NoProgress, ProgressCallback};
use crate::error::EngineError;
use crate::executor::{Execution, execute};
use crate::provider::Provider;
use crate::reconcile::{Mode, PruneOutcome, Reconciler, prune_order};
use crate::schema;
use crate::stack::{Stack, StackParts};
use crate::state::RecordedState;
use crate::types::{
    Action, EngineOptions, NodeFailure, PlanSummary, RunResult, RunStatus, RunSummary,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Engine {
    provider: Arc<dyn Provider>,
    backend: Arc<dyn StateBackend>,
    options: EngineOptions,
    progress: Arc<dyn ProgressCallback>,
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            provider,
            backend,
            options: EngineOptions::default(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Report run progress to `progress`. Plans are always silent.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Where recorded state lives.
    pub fn state_location(&self) -> String {
        self.backend.location()
    }

    /// Currently recorded state.
    pub async fn state(&self) -> Result<RecordedState, EngineError> {
        Ok(self.backend.load().await?)
    }

    /// Decide what [`run`](Self::run) would do without calling the provider
    /// or writing state.
    pub async fn plan(&self, stack: Stack) -> Result<PlanSummary, EngineError> {
        let parts = stack.into_parts();
        let baseline = Arc::new(self.backend.load().await?);
        log::info!(
            "Planning stack '{}' ({} resource(s), {} recorded)",
            parts.name,
            parts.nodes.len(),
            baseline.len()
        );

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.provider),
            Arc::clone(&baseline),
            self.options.retry.clone(),
            Mode::Preview,
        ));
        let exec = execute(
            &parts.nodes,
            &parts.graph,
            &reconciler,
            self.options.max_in_flight,
            &CancellationToken::new(),
            &NoProgress,
        )
        .await;

        if !exec.failures.is_empty() {
            return Err(EngineError::Plan {
                failures: exec.failures,
            });
        }

        let mut summary = PlanSummary::default();
        for (name, action) in parts.graph.names().iter().zip(&exec.actions) {
            if let Some(action) = action {
                summary.add(name, *action);
            }
        }
        for name in prune_order(&baseline, &declared_names(&parts)) {
            summary.add(&name, Action::Delete);
        }

        log::debug!(
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            summary.to_create.len(),
            summary.to_update.len(),
            summary.to_replace.len(),
            summary.to_delete.len()
        );
        Ok(summary)
    }

    /// Converge the stack.
    ///
    /// Per-resource failures are reported in the [`RunResult`]; only state
    /// that cannot be loaded, or exports that cannot be recorded, fail the
    /// call as a whole.
    pub async fn run(
        &self,
        stack: Stack,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let parts = stack.into_parts();
        let baseline = self.backend.load().await?;
        log::info!(
            "Running stack '{}' ({} resource(s), {} recorded)",
            parts.name,
            parts.nodes.len(),
            baseline.len()
        );

        let writer = Arc::new(StateWriter::new(Arc::clone(&self.backend), baseline.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&self.provider),
            Arc::new(baseline),
            self.options.retry.clone(),
            Mode::Apply(Arc::clone(&writer)),
        ));

        let cancel = cancel.child_token();
        let timer = self.start_timer(&cancel);
        self.progress.on_run_start(parts.nodes.len());

        let exec = execute(
            &parts.nodes,
            &parts.graph,
            &reconciler,
            self.options.max_in_flight,
            &cancel,
            self.progress.as_ref(),
        )
        .await;

        let prune = if exec.all_materialized() {
            reconciler
                .prune(&declared_names(&parts), &cancel, self.progress.as_ref())
                .await
        } else {
            if !exec.failures.is_empty() {
                log::warn!("Skipping removal of undeclared resources after failures");
            }
            PruneOutcome::default()
        };

        if let Some(timer) = timer {
            timer.abort();
        }

        let mut result = assemble(exec, prune);
        if result.is_success() {
            self.publish_exports(&parts, &writer, &mut result).await?;
        }

        self.progress.on_run_complete();
        log::info!(
            "Run finished: {:?} ({} created, {} updated, {} replaced, {} deleted, {} unchanged)",
            result.status,
            result.summary.created,
            result.summary.updated,
            result.summary.replaced,
            result.summary.deleted,
            result.summary.unchanged
        );
        Ok(result)
    }

    /// What [`destroy`](Self::destroy) would delete, in order.
    pub async fn plan_destroy(&self) -> Result<PlanSummary, EngineError> {
        let state = self.backend.load().await?;
        let mut summary = PlanSummary::default();
        for name in prune_order(&state, &BTreeSet::new()) {
            summary.add(&name, Action::Delete);
        }
        Ok(summary)
    }

    /// Delete every recorded resource, dependents first.
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<RunResult, EngineError> {
        let state = self.backend.load().await?;
        log::info!("Destroying {} recorded resource(s)", state.len());

        let writer = Arc::new(StateWriter::new(Arc::clone(&self.backend), state.clone()));
        let reconciler = Reconciler::new(
            Arc::clone(&self.provider),
            Arc::new(state.clone()),
            self.options.retry.clone(),
            Mode::Apply(Arc::clone(&writer)),
        );

        let cancel = cancel.child_token();
        let timer = self.start_timer(&cancel);
        self.progress.on_run_start(state.len());
        let prune = reconciler
            .prune(&BTreeSet::new(), &cancel, self.progress.as_ref())
            .await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let mut result = assemble(Execution::empty(), prune);
        if result.is_success() && !state.exports.is_empty() {
            writer.commit(|state| state.exports.clear()).await?;
        }
        self.progress.on_run_complete();
        log::info!(
            "Destroy finished: {:?} ({} deleted)",
            result.status,
            result.summary.deleted
        );
        result.exports.clear();
        Ok(result)
    }

    fn start_timer(&self, cancel: &CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        let timeout = self.options.timeout?;
        let token = cancel.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            log::warn!("Run exceeded its timeout of {}s, cancelling", timeout.as_secs_f64());
            token.cancel();
        }))
    }

    /// Resolve exports into the result and record them.
    ///
    /// Secret exports are redacted in the result and digested in state.
    async fn publish_exports(
        &self,
        parts: &StackParts,
        writer: &StateWriter,
        result: &mut RunResult,
    ) -> Result<(), EngineError> {
        let mut recorded = BTreeMap::new();
        for (name, output) in &parts.exports {
            match output.resolve().await {
                Ok(value) => {
                    if output.is_secret() {
                        recorded.insert(name.clone(), schema::digest(&value));
                        result
                            .exports
                            .insert(name.clone(), Value::String("[secret]".to_string()));
                    } else {
                        recorded.insert(name.clone(), value.clone());
                        result.exports.insert(name.clone(), value);
                    }
                }
                Err(err) => {
                    log::error!("Export '{name}' could not be resolved: {err}");
                    result.failures.push(NodeFailure {
                        name: format!("export '{name}'"),
                        action: None,
                        cause: err.to_string(),
                    });
                }
            }
        }

        if !result.failures.is_empty() {
            result.status = RunStatus::Failed;
            result.exports.clear();
            return Ok(());
        }

        writer
            .commit(move |state| state.exports = recorded)
            .await?;
        Ok(())
    }
}

fn declared_names(parts: &StackParts) -> BTreeSet<String> {
    parts.graph.names().iter().cloned().collect()
}

fn assemble(exec: Execution, prune: PruneOutcome) -> RunResult {
    let mut summary = RunSummary::default();
    let mut applied = exec.applied;
    applied.extend(prune.deleted.iter().map(|name| (name.clone(), Action::Delete)));
    for (_, action) in &applied {
        summary.add(*action);
    }

    let mut failures = exec.failures;
    failures.extend(prune.failures);
    let mut skipped = exec.skipped;
    skipped.extend(prune.skipped);

    let status = if !failures.is_empty() {
        RunStatus::Failed
    } else if exec.cancelled || prune.cancelled || !skipped.is_empty() {
        RunStatus::Cancelled
    } else {
        RunStatus::Succeeded
    };

    RunResult {
        status,
        exports: BTreeMap::new(),
        failures,
        skipped,
        summary,
        applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::error::{DeclarationError, ProviderError};
    use crate::output::Output;
    use crate::resource::{Input, ResourceRef};
    use crate::retry::RetryConfig;
    use crate::schema::ResourceKind;
    use crate::testing::{FailingBackend, FakeProvider, Op};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        provider: Arc<FakeProvider>,
        backend: Arc<MemoryBackend>,
        engine: Engine,
    }

    fn harness(provider: FakeProvider) -> Harness {
        let provider = Arc::new(provider);
        let backend = Arc::new(MemoryBackend::new());
        let engine = Engine::new(provider.clone(), backend.clone()).with_options(EngineOptions {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(5),
            },
            ..EngineOptions::default()
        });
        Harness {
            provider,
            backend,
            engine,
        }
    }

    /// Network, security group and load balancer, exporting the LB address.
    fn web_stack(cidr: &str) -> Stack {
        let mut stack = Stack::new("web");
        let vpc = stack
            .resource("vpc", ResourceKind::Vpc, [("cidr_block", cidr)])
            .unwrap();
        let sg = stack
            .resource(
                "sg",
                ResourceKind::SecurityGroup,
                [
                    ("vpc_id", Input::from(vpc.output("id").unwrap())),
                    ("description", "web".into()),
                ],
            )
            .unwrap();
        let lb = stack
            .resource(
                "lb",
                ResourceKind::LoadBalancer,
                [
                    ("subnets", vpc.output("public_subnet_ids").unwrap()),
                    ("security_groups", sg.output("id").unwrap().map(|id| json!([id]))),
                ],
            )
            .unwrap();
        stack.export("url", lb.output("dns_name").unwrap()).unwrap();
        stack
    }

    fn log_group(stack: &mut Stack, name: &str, retention: i64) -> ResourceRef {
        stack
            .resource(
                name,
                ResourceKind::LogGroup,
                [("name", json!(name)), ("retention_in_days", json!(retention))],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_dependencies_materialize_in_order() {
        let h = harness(FakeProvider::new().with_delay(Duration::from_millis(5)));
        let result = h
            .engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(h.provider.create_order(), vec!["vpc", "sg", "lb"]);
        assert_eq!(result.exports["url"], json!("lb.elb.fake"));
        assert_eq!(result.summary.created, 3);

        let sg_inputs = h.provider.created_inputs("sg").unwrap();
        assert_eq!(sg_inputs["vpc_id"], json!("vpc#1"));
        let lb_inputs = h.provider.created_inputs("lb").unwrap();
        assert_eq!(lb_inputs["security_groups"], json!(["sg#2"]));
        assert_eq!(lb_inputs["subnets"], json!(["vpc#1-public-0", "vpc#1-public-1"]));

        let state = h.backend.snapshot();
        assert_eq!(state.len(), 3);
        assert_eq!(state.get("lb").unwrap().dependencies, vec!["vpc", "sg"]);
        assert_eq!(state.exports["url"], json!("lb.elb.fake"));
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_provider_call() {
        let h = harness(FakeProvider::new());
        let mut stack = web_stack("10.0.0.0/16");

        let err = stack.depends_on("vpc", "lb").unwrap_err();
        assert!(matches!(err, DeclarationError::CyclicDependency { .. }));
        assert_eq!(h.provider.mutating_calls(), 0);
        assert_eq!(h.backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_map_runs_once_on_success() {
        let h = harness(FakeProvider::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut stack = Stack::new("web");
        let repo = stack
            .resource("repo", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        let counted = Arc::clone(&calls);
        let tagged = repo.output("repository_url").unwrap().map(move |url| {
            counted.fetch_add(1, Ordering::SeqCst);
            json!(format!("{}:v1", url.as_str().unwrap_or_default()))
        });
        stack.export("image", tagged).unwrap();

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.exports["image"], json!("registry.fake/app:v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_map_never_runs_on_failure() {
        let h = harness(FakeProvider::new());
        h.provider
            .fail("repo", ProviderError::permanent("quota exceeded"), 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut stack = Stack::new("web");
        let repo = stack
            .resource("repo", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        let counted = Arc::clone(&calls);
        let tagged = repo.output("repository_url").unwrap().map(move |url| {
            counted.fetch_add(1, Ordering::SeqCst);
            url
        });
        stack.export("image", tagged.clone()).unwrap();

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.exports.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(tagged.try_get(), Some(Err(_))));
    }

    #[tokio::test]
    async fn test_second_identical_run_is_noop() {
        let h = harness(FakeProvider::new());
        let first = h
            .engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(first.is_success());
        let calls_after_first = h.provider.mutating_calls();

        let second = h
            .engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(second.is_success());
        assert_eq!(h.provider.mutating_calls(), calls_after_first);
        assert_eq!(second.summary.unchanged, 3);
        assert_eq!(second.summary.total_changes(), 0);
        assert!(second.applied.iter().all(|(_, a)| *a == Action::NoOp));
        assert_eq!(second.exports["url"], json!("lb.elb.fake"));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let h = harness(FakeProvider::new());
        h.provider
            .fail("vpc", ProviderError::permanent("cidr overlaps"), 1);

        let mut stack = web_stack("10.0.0.0/16");
        log_group(&mut stack, "logs", 7);
        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].name, "vpc");
        assert_eq!(result.failures[0].action, Some(Action::Create));
        assert_eq!(result.skipped, vec!["sg", "lb"]);
        assert!(h.provider.calls_for("sg").is_empty());
        assert!(h.provider.calls_for("lb").is_empty());

        // Independent resources still converge
        assert_eq!(result.applied, vec![("logs".to_string(), Action::Create)]);
        let state = h.backend.snapshot();
        assert!(state.get("logs").is_some());
        assert!(state.get("sg").is_none());
        assert!(state.exports.is_empty());
    }

    #[tokio::test]
    async fn test_resolved_input_revalidated_before_provider_call() {
        let h = harness(FakeProvider::new());
        let mut stack = Stack::new("web");
        let repo = stack
            .resource("repository", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        let image = stack
            .resource(
                "image",
                ResourceKind::Image,
                [
                    (
                        "image_name",
                        Input::from(repo.output("repository_url").unwrap().map(|_| json!(42))),
                    ),
                    ("context", "./".into()),
                ],
            )
            .unwrap();
        stack
            .resource(
                "image-logs",
                ResourceKind::LogGroup,
                [("name", image.output("image_name").unwrap())],
            )
            .unwrap();

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].name, "image");
        assert!(result.failures[0].cause.contains("image_name"));
        assert!(result.failures[0].cause.contains("expected string"));
        assert_eq!(result.skipped, vec!["image-logs"]);
        assert_eq!(
            h.provider.calls(),
            vec![(Op::Create, "repository".to_string())]
        );
        assert!(h.backend.snapshot().get("image").is_none());
    }

    #[tokio::test]
    async fn test_immutable_change_replaces() {
        let h = harness(FakeProvider::new());
        h.engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();
        let old_id = h.backend.snapshot().get("vpc").unwrap().physical_id.clone();

        let result = h
            .engine
            .run(web_stack("10.1.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.applied.contains(&("vpc".to_string(), Action::Replace)));
        let new_id = h.backend.snapshot().get("vpc").unwrap().physical_id.clone();
        assert_ne!(old_id, new_id);
        assert!(!h.provider.live_ids().contains(&old_id));
        assert_eq!(
            h.provider.calls_for("vpc"),
            vec![Op::Create, Op::Delete, Op::Create]
        );
        // The group's vpc_id cannot change in place, so it follows
        assert!(result.applied.contains(&("sg".to_string(), Action::Replace)));
    }

    #[tokio::test]
    async fn test_mutable_change_updates_in_place() {
        let h = harness(FakeProvider::new());
        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 7);
        h.engine.run(stack, &CancellationToken::new()).await.unwrap();
        let id = h.backend.snapshot().get("logs").unwrap().physical_id.clone();

        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 30);
        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.applied, vec![("logs".to_string(), Action::Update)]);
        let record = h.backend.snapshot().get("logs").cloned().unwrap();
        assert_eq!(record.physical_id, id);
        assert_eq!(record.inputs["retention_in_days"], json!(30));
    }

    #[tokio::test]
    async fn test_independent_resources_run_concurrently() {
        let h = harness(FakeProvider::new().with_delay(Duration::from_millis(30)));
        let mut stack = Stack::new("web");
        stack
            .resource("repo", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        log_group(&mut stack, "logs", 7);

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.summary.created, 2);
        assert_eq!(h.provider.max_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_plan_has_no_side_effects() {
        let h = harness(FakeProvider::new());
        let plan = h.engine.plan(web_stack("10.0.0.0/16")).await.unwrap();

        assert_eq!(plan.to_create, vec!["vpc", "sg", "lb"]);
        assert_eq!(h.provider.mutating_calls(), 0);
        assert_eq!(h.backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_against_recorded_state() {
        let h = harness(FakeProvider::new());
        let mut stack = web_stack("10.0.0.0/16");
        log_group(&mut stack, "logs", 7);
        h.engine.run(stack, &CancellationToken::new()).await.unwrap();
        let calls = h.provider.mutating_calls();
        let saves = h.backend.save_count();

        let unchanged = h.engine.plan(web_stack("10.0.0.0/16")).await.unwrap();
        assert_eq!(unchanged.no_op, vec!["vpc", "sg", "lb"]);
        assert_eq!(unchanged.to_delete, vec!["logs"]);

        let replaced = h.engine.plan(web_stack("10.1.0.0/16")).await.unwrap();
        assert_eq!(replaced.to_replace, vec!["vpc", "sg"]);
        assert_eq!(replaced.to_update, vec!["lb"]);

        assert_eq!(h.provider.mutating_calls(), calls);
        assert_eq!(h.backend.save_count(), saves);
    }

    #[tokio::test]
    async fn test_undeclared_resources_are_pruned() {
        let h = harness(FakeProvider::new());
        let mut stack = web_stack("10.0.0.0/16");
        log_group(&mut stack, "logs", 7);
        h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 7);
        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.summary.deleted, 3);
        let deleted: Vec<&str> = result
            .applied
            .iter()
            .filter(|(_, a)| *a == Action::Delete)
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(deleted, vec!["lb", "sg", "vpc"]);
        let state = h.backend.snapshot();
        assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["logs"]);
        assert!(state.exports.is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = harness(FakeProvider::new());
        h.provider
            .fail("logs", ProviderError::transient("connection reset"), 2);
        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 7);

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert_eq!(h.provider.calls_for("logs").len(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let h = harness(FakeProvider::new());
        h.provider
            .fail("logs", ProviderError::throttled("rate exceeded"), 10);
        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 7);

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(h.provider.calls_for("logs").len(), 3);
        assert!(result.failures[0].cause.contains("rate exceeded"));
    }

    #[tokio::test]
    async fn test_state_failure_stops_run() {
        let provider = Arc::new(FakeProvider::new());
        let engine = Engine::new(provider.clone(), Arc::new(FailingBackend::after(1)))
            .with_options(EngineOptions {
                max_in_flight: 1,
                retry: RetryConfig::no_retry(),
                timeout: None,
            });

        let mut stack = Stack::new("web");
        log_group(&mut stack, "a", 7);
        log_group(&mut stack, "b", 7);
        log_group(&mut stack, "c", 7);
        let result = engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.applied, vec![("a".to_string(), Action::Create)]);
        assert_eq!(result.failures[0].name, "b");
        assert!(result.failures[0].cause.contains("state backend"));
        assert_eq!(result.skipped, vec!["c"]);
        assert!(provider.calls_for("c").is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(FakeProvider::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h.engine.run(web_stack("10.0.0.0/16"), &cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.skipped, vec!["vpc", "sg", "lb"]);
        assert_eq!(h.provider.mutating_calls(), 0);
        assert!(result.exports.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_remaining() {
        let provider = FakeProvider::new().with_delay(Duration::from_millis(150));
        let mut h = harness(provider);
        h.engine.options.timeout = Some(Duration::from_millis(30));

        let result = h
            .engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.applied, vec![("vpc".to_string(), Action::Create)]);
        assert_eq!(result.skipped, vec!["sg", "lb"]);
        assert!(h.backend.snapshot().get("vpc").is_some());
    }

    #[tokio::test]
    async fn test_secret_export_redacted() {
        struct Registry;

        #[async_trait::async_trait]
        impl crate::provider::SecretSource for Registry {
            async fn fetch(&self, key: &str) -> Result<String, ProviderError> {
                Ok(format!("password-{key}"))
            }
        }

        let h = harness(FakeProvider::new());
        let mut stack = Stack::new("web");
        let repo = stack
            .resource("repo", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        let token = stack.secret(Arc::new(Registry), &repo.output("registry_id").unwrap());
        stack.export("token", token).unwrap();

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.exports["token"], json!("[secret]"));
        let recorded = h.backend.snapshot().exports["token"].clone();
        assert_eq!(recorded, schema::digest(&json!("password-123456789012")));
    }

    #[tokio::test]
    async fn test_failed_export_fails_run() {
        let h = harness(FakeProvider::new());
        let mut stack = Stack::new("web");
        let repo = stack
            .resource("repo", ResourceKind::Repository, [("name", "app")])
            .unwrap();
        let port: Output<Value> = repo
            .output("registry_id")
            .unwrap()
            .try_map(|_| Err("not a port".to_string()));
        stack.export("port", port).unwrap();

        let result = h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failures[0].name, "export 'port'");
        assert!(h.backend.snapshot().get("repo").is_some());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let h = harness(FakeProvider::new());
        h.engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        let plan = h.engine.plan_destroy().await.unwrap();
        assert_eq!(plan.to_delete, vec!["lb", "sg", "vpc"]);

        let result = h.engine.destroy(&CancellationToken::new()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.summary.deleted, 3);
        assert!(h.provider.live_ids().is_empty());
        let state = h.engine.state().await.unwrap();
        assert!(state.is_empty());
        assert!(state.exports.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_treats_missing_as_deleted() {
        let h = harness(FakeProvider::new());
        let mut stack = Stack::new("web");
        log_group(&mut stack, "logs", 7);
        h.engine.run(stack, &CancellationToken::new()).await.unwrap();

        h.provider.fail("logs", ProviderError::not_found("gone"), 1);
        let result = h.engine.destroy(&CancellationToken::new()).await.unwrap();

        assert!(result.is_success());
        assert!(h.engine.state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_keeps_dependencies_of_failed_delete() {
        let h = harness(FakeProvider::new());
        h.engine
            .run(web_stack("10.0.0.0/16"), &CancellationToken::new())
            .await
            .unwrap();

        h.provider.fail("sg", ProviderError::conflict("in use"), 1);
        let result = h.engine.destroy(&CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failures[0].name, "sg");
        assert_eq!(result.skipped, vec!["vpc"]);
        let state = h.engine.state().await.unwrap();
        assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["sg", "vpc"]);
    }
}
