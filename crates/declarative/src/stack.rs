//! Stack - the declarative program and its exports
//!
//! Resources are declared on an explicit [`Stack`] builder. Each
//! declaration validates its inputs, infers edges from the outputs it
//! consumes and rejects references that dangle or would close a cycle.
//! Nothing is provisioned until the stack is handed to an
//! [`Engine`](crate::engine::Engine).

use crate::error::DeclarationError;
use crate::graph::DependencyGraph;
use crate::output::{Output, OutputError};
use crate::provider::SecretSource;
use crate::resource::{Input, ResourceNode, ResourceRef};
use crate::schema::{self, ResourceKind};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Stack {
    name: String,
    nodes: Vec<ResourceNode>,
    graph: DependencyGraph,
    exports: BTreeMap<String, Output<Value>>,
}

/// A stack taken apart for execution.
pub(crate) struct StackParts {
    pub name: String,
    pub nodes: Vec<ResourceNode>,
    pub graph: DependencyGraph,
    pub exports: BTreeMap<String, Output<Value>>,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            graph: DependencyGraph::new(),
            exports: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Declared resource names in declaration order.
    pub fn names(&self) -> &[String] {
        self.graph.names()
    }

    /// Names in the order they may be materialized.
    pub fn topological_order(&self) -> Vec<String> {
        self.graph.topological_names()
    }

    /// Direct dependencies of a declared resource.
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<String>> {
        self.graph
            .index_of(name)
            .map(|idx| self.graph.dependency_names(idx))
    }

    /// Declare a resource.
    ///
    /// On error the stack is left exactly as it was.
    pub fn resource<I, K, V>(
        &mut self,
        name: &str,
        kind: ResourceKind,
        inputs: I,
    ) -> Result<ResourceRef, DeclarationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Input>,
    {
        if name.trim().is_empty() {
            return Err(DeclarationError::InvalidInput {
                resource: name.to_string(),
                field: "name".to_string(),
                reason: "resource names must not be empty".to_string(),
            });
        }
        if self.graph.contains(name) {
            return Err(DeclarationError::DuplicateName(name.to_string()));
        }

        let inputs: BTreeMap<String, Input> = inputs
            .into_iter()
            .map(|(field, value)| (field.into(), value.into()))
            .collect();

        schema::validate_fields(name, kind, inputs.keys().map(String::as_str))?;
        for (field, input) in &inputs {
            if let Input::Value(value) = input {
                schema::validate_value(name, kind, field, value)?;
            }
        }

        let node = ResourceNode::new(name, kind, inputs);
        let referenced = node.referenced();
        if referenced.contains(name) {
            return Err(DeclarationError::CyclicDependency {
                path: vec![name.to_string(), name.to_string()],
            });
        }
        if let Some(missing) = referenced.iter().find(|dep| !self.graph.contains(dep)) {
            return Err(DeclarationError::DanglingReference {
                dependent: name.to_string(),
                missing: missing.clone(),
            });
        }

        self.graph.add_node(name)?;
        for dependency in &referenced {
            // A fresh node has no dependents, so these edges cannot close a cycle
            self.graph.add_edge(dependency, name)?;
        }

        log::debug!(
            "Declared {name} ({kind}) depending on {:?}",
            referenced.iter().collect::<Vec<_>>()
        );
        let handle = node.handle();
        self.nodes.push(node);
        Ok(handle)
    }

    /// Require `dependent` to materialize after `dependency` even though it
    /// consumes none of its outputs.
    pub fn depends_on(&mut self, dependent: &str, dependency: &str) -> Result<(), DeclarationError> {
        self.graph.add_edge(dependency, dependent)
    }

    /// Publish a value as a stack export, resolved at the end of a
    /// successful run.
    pub fn export(
        &mut self,
        name: impl Into<String>,
        value: Output<Value>,
    ) -> Result<(), DeclarationError> {
        let name = name.into();
        if self.exports.contains_key(&name) {
            return Err(DeclarationError::DuplicateExport(name));
        }
        if let Some(missing) = value.deps().iter().find(|dep| !self.graph.contains(dep)) {
            return Err(DeclarationError::DanglingReference {
                dependent: format!("export '{name}'"),
                missing: missing.clone(),
            });
        }
        self.exports.insert(name, value);
        Ok(())
    }

    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }

    /// Fetch a credential once `key` resolves. The result is a secret
    /// output carrying `key`'s dependencies.
    pub fn secret(&self, source: Arc<dyn SecretSource>, key: &Output<Value>) -> Output<Value> {
        key.then_async(move |key| async move {
            let key = match key {
                Value::String(s) => s,
                other => other.to_string(),
            };
            source
                .fetch(&key)
                .await
                .map(Value::String)
                .map_err(|e| OutputError::failed(format!("secret lookup failed: {e}")))
        })
        .into_secret()
    }

    pub(crate) fn into_parts(self) -> StackParts {
        StackParts {
            name: self.name,
            nodes: self.nodes,
            graph: self.graph,
            exports: self.exports,
        }
    }
}
