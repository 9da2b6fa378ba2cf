//! Pluggable stage logic.
//!
//! A [`Module`] turns a job's parameters into a deferred [`ModuleTask`]. The
//! engine runs the task on the shared worker pool; building the task must be
//! cheap and must not block.

mod registry;
mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::channel::RemoteChannel;
use crate::error::ModuleError;
use crate::parameters::{MethodResult, ParameterSet};
use crate::state_machine::State;

pub use registry::ModuleRegistry;
pub use shell::{ShellModule, render_template};

/// Name of the parameter holding the remote batch-system job id.
pub const BATCH_ID: &str = "batchID";

/// Deferred unit of work producing a [`MethodResult`] when polled on the pool.
pub type ModuleTask = BoxFuture<'static, MethodResult>;

/// Stage modules keyed by the state they run in.
pub type ModuleMap = HashMap<State, Arc<dyn Module>>;

/// A unit of work bound to one lifecycle stage.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Build the task for one invocation. Fails if the task cannot even be
    /// constructed (missing parameters, unusable channel).
    fn run(
        &self,
        job_id: Uuid,
        channel: Arc<dyn RemoteChannel>,
        parameters: ParameterSet,
    ) -> Result<ModuleTask, ModuleError>;
}

/// Succeeds immediately without outputs. Stands in for a stage the job
/// configuration leaves out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Module for PassThrough {
    fn name(&self) -> &str {
        "pass-through"
    }

    fn run(
        &self,
        _job_id: Uuid,
        _channel: Arc<dyn RemoteChannel>,
        _parameters: ParameterSet,
    ) -> Result<ModuleTask, ModuleError> {
        Ok(Box::pin(async { MethodResult::success("pass-through") }))
    }
}

/// Removes a job from the batch system. Needs [`BATCH_ID`].
pub fn dequeue_module(command: &str) -> Arc<dyn Module> {
    Arc::new(ShellModule::new("dequeue", command))
}

/// Cleans remote leftovers before a restart.
pub fn cleanup_module(command: &str) -> Arc<dyn Module> {
    Arc::new(ShellModule::new("cleanup", command))
}
