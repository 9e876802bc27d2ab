//! Progress observer
//!
//! The engine reports what it is doing through this trait so it can be
//! used without depending on a specific UI.

use crate::schema::ResourceKind;
use crate::types::Action;

/// Progress callback for engine runs
///
/// Implement this trait to receive progress updates. Calls come from the
/// scheduler loop, one at a time.
pub trait ProgressCallback: Send + Sync {
    /// Called once with the number of resources about to be processed
    fn on_run_start(&self, total: usize);

    /// Called when a resource is dispatched
    fn on_resource_start(&self, name: &str, kind: ResourceKind);

    /// Called when a resource finishes, with the error if it failed
    fn on_resource_complete(&self, name: &str, action: Option<Action>, error: Option<&str>);

    /// Called when a resource will not be processed
    fn on_resource_skipped(&self, name: &str, reason: &str);

    /// Called when the run is over
    fn on_run_complete(&self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&self, _total: usize) {}
    fn on_resource_start(&self, _name: &str, _kind: ResourceKind) {}
    fn on_resource_complete(&self, _name: &str, _action: Option<Action>, _error: Option<&str>) {}
    fn on_resource_skipped(&self, _name: &str, _reason: &str) {}
    fn on_run_complete(&self) {}
}
