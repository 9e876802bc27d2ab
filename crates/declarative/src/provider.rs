//! Capabilities the engine consumes: the cloud provider API and a source
//! of secret values.

use crate::error::ProviderError;
use crate::schema::ResourceKind;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// What a provider reports after creating a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub physical_id: String,
    pub outputs: BTreeMap<String, Value>,
}

/// Mutating operations against the cloud.
///
/// Implementations report failures with a category; the engine retries
/// transient and throttled errors and treats `NotFound` on delete as done.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<Applied, ProviderError>;

    /// Update in place; returns the full set of outputs afterwards.
    async fn update(
        &self,
        kind: ResourceKind,
        physical_id: &str,
        previous: &BTreeMap<String, Value>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ProviderError>;

    async fn delete(&self, kind: ResourceKind, physical_id: &str) -> Result<(), ProviderError>;
}

/// Opaque credentials such as a registry authorization token.
///
/// Values returned here are wrapped in secret outputs and never logged.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<String, ProviderError>;
}
