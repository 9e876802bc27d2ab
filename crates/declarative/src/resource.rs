//! Declared resources and their inputs
//!
//! A resource node is one unit of desired infrastructure: a logical name
//! that is stable across runs, a kind, and inputs that are either literal
//! values or outputs of other resources.

use crate::error::DeclarationError;
use crate::output::{Output, Resolver};
use crate::schema::ResourceKind;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Inputs
// ============================================================================

/// One input value of a resource.
#[derive(Clone)]
pub enum Input {
    /// Known at declaration
    Value(Value),
    /// Produced by other resources
    Output(Output<Value>),
}

impl Input {
    /// Resources this input waits on.
    pub fn deps(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Value(_) => None,
            Self::Output(output) => Some(output.deps()),
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, Self::Output(output) if output.is_secret())
    }

    /// Wait for the value.
    pub async fn resolve(&self) -> Result<Value, crate::output::OutputError> {
        match self {
            Self::Value(value) => Ok(value.clone()),
            Self::Output(output) => output.resolve().await,
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => write!(f, "{value}"),
            Self::Output(output) => fmt::Debug::fmt(output, f),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Output<Value>> for Input {
    fn from(output: Output<Value>) -> Self {
        Self::Output(output)
    }
}

impl From<&Output<Value>> for Input {
    fn from(output: &Output<Value>) -> Self {
        Self::Output(output.clone())
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Self::Value(Value::Bool(value))
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

// ============================================================================
// Resource Node
// ============================================================================

/// A declared resource as the engine sees it.
pub(crate) struct ResourceNode {
    pub name: String,
    pub kind: ResourceKind,
    pub inputs: BTreeMap<String, Input>,
    /// Schema secrets plus fields fed by secret outputs
    pub secret_fields: BTreeSet<String>,
    pub outputs: BTreeMap<&'static str, (Output<Value>, Resolver<Value>)>,
}

impl ResourceNode {
    pub fn new(name: &str, kind: ResourceKind, inputs: BTreeMap<String, Input>) -> Self {
        let schema = kind.schema();
        let secret_fields = schema
            .secret_fields()
            .map(str::to_string)
            .chain(
                inputs
                    .iter()
                    .filter(|(_, input)| input.is_secret())
                    .map(|(field, _)| field.clone()),
            )
            .collect();

        let outputs = schema
            .outputs
            .iter()
            .map(|field| (*field, Output::pending([name])))
            .collect();

        Self {
            name: name.to_string(),
            kind,
            inputs,
            secret_fields,
            outputs,
        }
    }

    /// Every resource referenced by an input.
    pub fn referenced(&self) -> BTreeSet<String> {
        self.inputs
            .values()
            .filter_map(Input::deps)
            .flatten()
            .cloned()
            .collect()
    }

    pub fn handle(&self) -> ResourceRef {
        ResourceRef {
            name: self.name.clone(),
            kind: self.kind,
            outputs: self
                .outputs
                .iter()
                .map(|(field, (output, _))| (*field, output.clone()))
                .collect(),
        }
    }

    /// Settle every output from the values a provider reported.
    ///
    /// Fields the provider did not report fail with `missing`.
    pub fn settle_outputs(
        &self,
        values: &BTreeMap<String, Value>,
        missing: impl Fn(&str) -> crate::output::OutputError,
    ) {
        for (field, (_, resolver)) in &self.outputs {
            match values.get(*field) {
                Some(value) => resolver.resolve(value.clone()),
                None => resolver.fail(missing(field)),
            };
        }
    }

    pub fn fail_outputs(&self, error: &crate::output::OutputError) {
        for (_, resolver) in self.outputs.values() {
            resolver.fail(error.clone());
        }
    }
}

// ============================================================================
// Resource Handle
// ============================================================================

/// Handle returned by [`Stack::resource`](crate::stack::Stack::resource),
/// used to wire one resource's outputs into another's inputs.
#[derive(Clone, Debug)]
pub struct ResourceRef {
    name: String,
    kind: ResourceKind,
    outputs: BTreeMap<&'static str, Output<Value>>,
}

impl ResourceRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// An output field of this resource, e.g. `"id"` or `"dns_name"`.
    pub fn output(&self, field: &str) -> Result<Output<Value>, DeclarationError> {
        self.outputs
            .get(field)
            .cloned()
            .ok_or_else(|| DeclarationError::UnknownOutput {
                resource: self.name.clone(),
                kind: self.kind.to_string(),
                field: field.to_string(),
            })
    }
}
