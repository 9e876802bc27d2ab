//! In-memory provider and backends for engine tests

use crate::backend::StateBackend;
use crate::error::{ProviderError, StateError};
use crate::provider::{Applied, Provider};
use crate::schema::ResourceKind;
use crate::state::RecordedState;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Update,
    Delete,
}

type CreateHook = Box<dyn Fn(&str) + Send + Sync>;

/// Provider that keeps resources in a map and records every call.
///
/// Physical ids are `{name}#{n}` with a global counter, so a replacement
/// always gets a fresh id.
#[derive(Default)]
pub struct FakeProvider {
    delay: Duration,
    on_create: Option<CreateHook>,
    counter: AtomicUsize,
    live: Mutex<HashMap<String, (ResourceKind, BTreeMap<String, Value>)>>,
    calls: Mutex<Vec<(Op, String)>>,
    created: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    failures: Mutex<HashMap<String, (ProviderError, usize)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_create(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Box::new(hook));
        self
    }

    /// Fail the next `times` calls touching `name`.
    pub fn fail(&self, name: &str, error: ProviderError, times: usize) {
        self.failures.lock().insert(name.to_string(), (error, times));
    }

    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(Op, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, name: &str) -> Vec<Op> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, n)| n == name)
            .map(|(op, _)| *op)
            .collect()
    }

    /// Names in the order their first create was attempted.
    pub fn create_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (op, name) in self.calls.lock().iter() {
            if *op == Op::Create && !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Inputs of the last successful create of `name`.
    pub fn created_inputs(&self, name: &str) -> Option<BTreeMap<String, Value>> {
        self.created.lock().get(name).cloned()
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn enter(&self, op: Op, name: &str) -> Result<InFlight<'_>, ProviderError> {
        self.calls.lock().push((op, name.to_string()));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut failures = self.failures.lock();
        if let Some((error, remaining)) = failures.get_mut(name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(error.clone());
        }
        Ok(guard)
    }

    fn outputs(
        kind: ResourceKind,
        name: &str,
        id: &str,
        inputs: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let named = inputs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        kind.schema()
            .outputs
            .iter()
            .map(|field| {
                let value = match *field {
                    "id" => json!(id),
                    "arn" => json!(format!("arn:fake:{kind}:{id}")),
                    "name" => json!(named),
                    "dns_name" => json!(format!("{name}.elb.fake")),
                    "zone_id" => json!("ZFAKE"),
                    "public_subnet_ids" => json!([format!("{id}-public-0"), format!("{id}-public-1")]),
                    "private_subnet_ids" => {
                        json!([format!("{id}-private-0"), format!("{id}-private-1")])
                    }
                    "repository_url" => json!(format!("registry.fake/{named}")),
                    "registry_id" => json!("123456789012"),
                    "image_name" => inputs.get("image_name").cloned().unwrap_or(Value::Null),
                    "repo_digest" => json!(format!("sha256:{}", blake3::hash(id.as_bytes()).to_hex())),
                    "revision" => json!(1),
                    other => json!(format!("{id}/{other}")),
                };
                ((*field).to_string(), value)
            })
            .collect()
    }
}

fn logical_name(physical_id: &str) -> &str {
    physical_id.split('#').next().unwrap_or(physical_id)
}

#[async_trait]
impl Provider for FakeProvider {
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Applied, ProviderError> {
        if let Some(hook) = &self.on_create {
            hook(name);
        }
        let _guard = self.enter(Op::Create, name).await?;

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{name}#{n}");
        self.live.lock().insert(id.clone(), (kind, inputs.clone()));
        self.created.lock().insert(name.to_string(), inputs.clone());
        Ok(Applied {
            outputs: Self::outputs(kind, name, &id, inputs),
            physical_id: id,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        _previous: &BTreeMap<String, Value>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ProviderError> {
        let name = logical_name(physical_id);
        let _guard = self.enter(Op::Update, name).await?;

        let mut live = self.live.lock();
        let Some(entry) = live.get_mut(physical_id) else {
            return Err(ProviderError::not_found(physical_id));
        };
        *entry = (kind, inputs.clone());
        Ok(Self::outputs(kind, name, physical_id, inputs))
    }

    async fn delete(&self, _kind: ResourceKind, physical_id: &str) -> Result<(), ProviderError> {
        let _guard = self.enter(Op::Delete, logical_name(physical_id)).await?;
        match self.live.lock().remove(physical_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found(physical_id)),
        }
    }
}

/// Backend whose saves start failing after a number of successes.
pub struct FailingBackend {
    allowed: AtomicUsize,
}

impl FailingBackend {
    pub fn after(saves: usize) -> Self {
        Self {
            allowed: AtomicUsize::new(saves),
        }
    }
}

#[async_trait]
impl StateBackend for FailingBackend {
    async fn load(&self) -> Result<RecordedState, StateError> {
        Ok(RecordedState::new())
    }

    async fn save(&self, _state: &RecordedState) -> Result<(), StateError> {
        let left = self.allowed.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StateError::Unavailable("disk full".to_string()));
        }
        self.allowed.store(left - 1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "failing".to_string()
    }
}
