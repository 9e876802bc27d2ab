//! Local sandbox provider
//!
//! Simulates the cloud API so stacks can be previewed and applied without
//! credentials. Physical ids embed the logical name and a digest, and every
//! output is derived from the id and inputs, so the sandbox keeps no state
//! of its own between runs.

use crate::config::SandboxConfig;
use async_trait::async_trait;
use chrono::Utc;
use declarative::{Applied, Provider, ProviderError, ResourceKind, SecretSource};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const ACCOUNT_ID: &str = "000000000000";
const DEFAULT_ZONES: u64 = 2;

pub struct SandboxProvider {
    region: String,
    latency: Duration,
    fail_kinds: BTreeSet<ResourceKind>,
    created: AtomicU64,
}

impl SandboxProvider {
    pub fn new(config: &SandboxConfig, region: &str) -> Self {
        Self {
            region: region.to_string(),
            latency: Duration::from_millis(config.latency_ms),
            fail_kinds: config.fail_kinds.clone(),
            created: AtomicU64::new(0),
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn physical_id(&self, kind: ResourceKind, name: &str) -> String {
        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.created.fetch_add(1, Ordering::Relaxed);
        let hash = blake3::hash(format!("{kind}/{name}/{nonce}/{seq}").as_bytes());
        format!("{}-{name}-{}", prefix(kind), &hash.to_hex()[..12])
    }

    fn outputs(
        &self,
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
        let digest = blake3::hash(id.as_bytes()).to_hex();
        let short = &digest[..8];
        let zones = inputs
            .get("availability_zones")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_ZONES);
        let subnets = |tier: &str| -> Value {
            (0..zones)
                .map(|zone| Value::String(format!("subnet-{short}-{tier}-{zone}")))
                .collect()
        };

        kind.schema()
            .outputs
            .iter()
            .map(|field| {
                let value = match *field {
                    "id" => json!(id),
                    "arn" => json!(format!(
                        "arn:sandbox:{}:{ACCOUNT_ID}:{kind}/{id}",
                        self.region
                    )),
                    "name" => json!(named),
                    "public_subnet_ids" => subnets("public"),
                    "private_subnet_ids" => subnets("private"),
                    "dns_name" => json!(format!(
                        "{named}-{short}.{}.elb.sandbox.internal",
                        self.region
                    )),
                    "zone_id" => json!("ZSANDBOX"),
                    "repository_url" => json!(format!(
                        "{ACCOUNT_ID}.dkr.ecr.{}.sandbox.internal/{named}",
                        self.region
                    )),
                    "registry_id" => json!(ACCOUNT_ID),
                    "image_name" => inputs.get("image_name").cloned().unwrap_or(Value::Null),
                    "repo_digest" => {
                        let image = inputs
                            .get("image_name")
                            .and_then(Value::as_str)
                            .unwrap_or(name);
                        let content = serde_json::to_string(inputs).unwrap_or_default();
                        json!(format!("{image}@sha256:{}", blake3::hash(content.as_bytes()).to_hex()))
                    }
                    "revision" => json!(1),
                    other => json!(format!("{id}/{other}")),
                };
                ((*field).to_string(), value)
            })
            .collect()
    }
}

/// Short id prefix per kind, in the style of the real API.
fn prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Vpc => "vpc",
        ResourceKind::SecurityGroup => "sg",
        ResourceKind::TargetGroup => "tg",
        ResourceKind::LoadBalancer => "alb",
        ResourceKind::Listener => "lsnr",
        ResourceKind::Repository => "ecr",
        ResourceKind::Image => "img",
        ResourceKind::LogGroup => "lg",
        ResourceKind::Cluster => "ecs",
        ResourceKind::Role => "role",
        ResourceKind::RolePolicyAttachment => "rpa",
        ResourceKind::TaskDefinition => "td",
        ResourceKind::Service => "svc",
    }
}

/// Logical name embedded in a sandbox physical id.
fn logical_name(kind: ResourceKind, physical_id: &str) -> Option<&str> {
    physical_id
        .strip_prefix(prefix(kind))?
        .strip_prefix('-')?
        .rsplit_once('-')
        .map(|(name, _)| name)
}

#[async_trait]
impl Provider for SandboxProvider {
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Applied, ProviderError> {
        self.simulate_latency().await;
        if self.fail_kinds.contains(&kind) {
            return Err(ProviderError::permanent(format!(
                "sandbox is configured to reject {kind} resources"
            )));
        }

        let physical_id = self.physical_id(kind, name);
        log::debug!("sandbox: created {kind} {physical_id}");
        Ok(Applied {
            outputs: self.outputs(kind, name, &physical_id, inputs),
            physical_id,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        _previous: &BTreeMap<String, Value>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ProviderError> {
        self.simulate_latency().await;
        let name = logical_name(kind, physical_id)
            .ok_or_else(|| ProviderError::not_found(format!("no {kind} with id {physical_id}")))?;
        log::debug!("sandbox: updated {kind} {physical_id}");
        Ok(self.outputs(kind, name, physical_id, inputs))
    }

    async fn delete(&self, kind: ResourceKind, physical_id: &str) -> Result<(), ProviderError> {
        self.simulate_latency().await;
        if logical_name(kind, physical_id).is_none() {
            return Err(ProviderError::not_found(format!("no {kind} with id {physical_id}")));
        }
        log::debug!("sandbox: deleted {kind} {physical_id}");
        Ok(())
    }
}

/// Issues deterministic registry tokens.
pub struct SandboxSecrets;

#[async_trait]
impl SecretSource for SandboxSecrets {
    async fn fetch(&self, key: &str) -> Result<String, ProviderError> {
        if key.is_empty() {
            return Err(ProviderError::permanent("registry id is empty"));
        }
        let token = blake3::hash(format!("sandbox-token/{key}").as_bytes());
        Ok(token.to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SandboxProvider {
        SandboxProvider::new(&SandboxConfig::default(), "eu-west-1")
    }

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_reports_every_output() {
        let sandbox = provider();
        for kind in ResourceKind::ALL {
            let applied = sandbox.create(kind, "thing", &BTreeMap::new()).await.unwrap();
            for field in kind.schema().outputs {
                assert!(applied.outputs.contains_key(*field), "{kind} missing {field}");
            }
            assert_eq!(logical_name(kind, &applied.physical_id), Some("thing"));
        }
    }

    #[tokio::test]
    async fn test_vpc_subnets_follow_zone_count() {
        let applied = provider()
            .create(
                ResourceKind::Vpc,
                "vpc",
                &inputs(&[("availability_zones", json!(3))]),
            )
            .await
            .unwrap();
        assert_eq!(applied.outputs["public_subnet_ids"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let sandbox = provider();
        let desired = inputs(&[("name", json!("app-logs")), ("retention_in_days", json!(7))]);
        let applied = sandbox
            .create(ResourceKind::LogGroup, "log-group", &desired)
            .await
            .unwrap();

        let outputs = sandbox
            .update(ResourceKind::LogGroup, &applied.physical_id, &desired, &desired)
            .await
            .unwrap();
        assert_eq!(outputs, applied.outputs);
    }

    #[tokio::test]
    async fn test_replacement_gets_new_id() {
        let sandbox = provider();
        let first = sandbox.create(ResourceKind::Vpc, "vpc", &BTreeMap::new()).await.unwrap();
        let second = sandbox.create(ResourceKind::Vpc, "vpc", &BTreeMap::new()).await.unwrap();
        assert_ne!(first.physical_id, second.physical_id);
    }

    #[tokio::test]
    async fn test_foreign_id_not_found() {
        let err = provider()
            .delete(ResourceKind::Vpc, "sg-web-0123456789ab")
            .await
            .unwrap_err();
        assert_eq!(err.category, declarative::ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn test_fail_kinds() {
        let config = SandboxConfig {
            latency_ms: 0,
            fail_kinds: BTreeSet::from([ResourceKind::LoadBalancer]),
        };
        let sandbox = SandboxProvider::new(&config, "us-east-1");
        let err = sandbox
            .create(ResourceKind::LoadBalancer, "alb", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(sandbox.create(ResourceKind::Vpc, "vpc", &BTreeMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_secrets_are_deterministic() {
        let a = SandboxSecrets.fetch("000000000000").await.unwrap();
        let b = SandboxSecrets.fetch("000000000000").await.unwrap();
        assert_eq!(a, b);
        assert!(SandboxSecrets.fetch("").await.is_err());
    }
}
