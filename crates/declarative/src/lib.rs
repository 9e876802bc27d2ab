//! # Declarative
//!
//! A framework for declaring cloud resources as a dependency graph and
//! converging them against recorded state.
//!
//! Programs declare resources on a [`Stack`]. Wiring one resource's
//! [`Output`] into another's input creates an edge, so the graph is known
//! before anything is provisioned. The [`Engine`] then previews or applies
//! the stack: independent resources materialize concurrently, each one is
//! reconciled against its record (create, update in place, replace or
//! leave alone), and records of resources that are no longer declared are
//! deleted.
//!
//! ## Core Concepts
//!
//! - **Output**: A single-assignment value produced by a resource, with
//!   `map`, `combine` and `all` for deriving new values
//! - **ResourceKind**: The schema of a resource type: its inputs, which of
//!   them force replacement, and its outputs
//! - **Reconciler**: Decides and performs one [`Action`] per resource
//! - **StateBackend**: Durable storage for [`RecordedState`]
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{DeclarationError, Engine, FileBackend, ResourceKind, Stack};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! fn build() -> Result<Stack, DeclarationError> {
//!     let mut stack = Stack::new("web");
//!     let vpc = stack.resource("vpc", ResourceKind::Vpc, [("cidr_block", "10.0.0.0/16")])?;
//!     let sg = stack.resource(
//!         "web-sg",
//!         ResourceKind::SecurityGroup,
//!         [("vpc_id", vpc.output("id")?)],
//!     )?;
//!     stack.export("sg_id", sg.output("id")?)?;
//!     Ok(stack)
//! }
//!
//! // `provider` is any `Arc<dyn Provider>`
//! let engine = Engine::new(provider, Arc::new(FileBackend::new("state.json")));
//!
//! // Plan and run each consume a stack, so declare it once for each
//! println!("{:?}", engine.plan(build()?).await?);
//! let result = engine.run(build()?, &CancellationToken::new()).await?;
//! ```
//!
//! ## Provider Traits
//!
//! The engine performs no I/O of its own beyond the state backend:
//!
//! - [`Provider`]: Creates, updates and deletes physical resources
//! - [`StateBackend`]: Loads and saves recorded state
//! - [`SecretSource`]: Fetches credentials that must never be logged
//! - [`ProgressCallback`]: Receives progress updates

pub mod backend;
pub mod context;
pub mod engine;
pub mod error;
mod executor;
pub mod graph;
pub mod output;
pub mod provider;
pub mod reconcile;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod stack;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use backend::{FileBackend, MemoryBackend, StateBackend};
pub use context::{NoProgress, ProgressCallback};
pub use engine::Engine;
pub use error::{
    DeclarationError, EngineError, ErrorCategory, ProviderError, StateError,
};
pub use graph::DependencyGraph;
pub use output::{Output, OutputError, Resolver};
pub use provider::{Applied, Provider, SecretSource};
pub use resource::{Input, ResourceRef};
pub use retry::RetryConfig;
pub use schema::{FieldType, Mutability, ResourceKind};
pub use stack::Stack;
pub use state::{RecordedState, ResourceRecord};
pub use types::{
    Action, DEFAULT_MAX_IN_FLIGHT, EngineOptions, NodeFailure, NodeState, PlanSummary,
    RunResult, RunStatus, RunSummary,
};
