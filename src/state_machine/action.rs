use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use super::interpret::Interpreter;
use super::job::{Job, JobCore};
use super::state::{State, Trigger};
use crate::channel::RemoteChannelFactory;
use crate::error::ChannelError;
use crate::module::Module;
use crate::parameters::{MethodResult, ParameterSet};
use crate::pool::{TaskHandle, TaskOutcome};

/// Open a channel, build the module's task and run it. Every failure along
/// the way becomes a failed [`MethodResult`].
pub(crate) async fn invoke(
    module: Arc<dyn Module>,
    channels: Arc<dyn RemoteChannelFactory>,
    job_id: Uuid,
    parameters: ParameterSet,
) -> MethodResult {
    let channel = match channels.open().await {
        Ok(channel) => channel,
        Err(e) => {
            match &e {
                ChannelError::Authentication(_) => {
                    tracing::error!(job_id = %job_id, module = module.name(), "authentication failed: {e}")
                }
                _ => tracing::error!(job_id = %job_id, module = module.name(), "channel unavailable: {e}"),
            }
            return MethodResult::failure(module.name(), e.to_string());
        }
    };
    match module.run(job_id, channel, parameters) {
        Ok(task) => task.await,
        Err(e) => MethodResult::failure(module.name(), e.to_string()),
    }
}

/// Runs a module whenever its state is entered and fires the success or
/// failure trigger with the interpreted result.
///
/// Each entry gets a fresh epoch. A completion only counts if its epoch is
/// still current and the job is still in the bound state; anything else is a
/// stale result from a cancelled or superseded run and is dropped.
pub struct ModuleAction {
    state: State,
    module: Arc<dyn Module>,
    interpreter: Interpreter,
    on_success: Trigger,
    on_failure: Trigger,
    epoch: AtomicU64,
    in_flight: Mutex<Option<TaskHandle>>,
}

impl ModuleAction {
    pub fn new(
        state: State,
        module: Arc<dyn Module>,
        interpreter: Interpreter,
        on_success: Trigger,
        on_failure: Trigger,
    ) -> Self {
        Self {
            state,
            module,
            interpreter,
            on_success,
            on_failure,
            epoch: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    /// Handle of the latest run, if any.
    pub fn in_flight(&self) -> Option<TaskHandle> {
        self.in_flight.lock().clone()
    }

    /// Start a run for `job`. Called from the job's exclusive section.
    pub(crate) fn on_entry(&self, job: &Job, core: &JobCore) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let context = job.context();
        let job_id = job.id();
        let state = self.state;

        let work = invoke(
            self.module.clone(),
            context.channels.clone(),
            job_id,
            core.parameters().clone(),
        );
        let weak = job.downgrade();
        let submitted = context.pool.submit(work, move |outcome| {
            if let Some(job) = weak.upgrade() {
                job.complete(state, epoch, outcome);
            }
        });

        match submitted {
            Ok(handle) => {
                tracing::debug!(job_id = %job_id, module = self.module.name(), epoch, "module started");
                // A previous handle, if any, is left to finish on its own.
                *self.in_flight.lock() = Some(handle);
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, module = self.module.name(), "cannot schedule module: {e}");
                *self.in_flight.lock() = None;
                let weak = job.downgrade();
                let message = e.to_string();
                context.pool.defer(async move {
                    if let Some(job) = weak.upgrade() {
                        job.complete(state, epoch, TaskOutcome::Failed(message));
                    }
                });
            }
        }
    }

    /// Cancel the in-flight run. Never fires a trigger.
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.in_flight.lock().take() {
            let outcome = handle.cancel();
            tracing::debug!(
                module = self.module.name(),
                cancelled = outcome.cancelled,
                interrupted = outcome.interrupted,
                "module cancelled"
            );
        }
    }

    /// Interpret a finished run and pick the trigger to fire.
    pub(crate) fn interpret(
        &self,
        job_id: Uuid,
        core: &mut JobCore,
        events: &crate::events::EventSink,
        outcome: TaskOutcome<MethodResult>,
    ) -> Trigger {
        let ok = match outcome {
            TaskOutcome::Completed(result) => {
                (self.interpreter)(job_id, core.parameters_mut(), events, result)
            }
            TaskOutcome::Failed(message) => {
                tracing::error!(job_id = %job_id, module = self.module.name(), "module crashed: {message}");
                false
            }
        };
        if ok { self.on_success } else { self.on_failure }
    }
}

impl std::fmt::Debug for ModuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleAction")
            .field("state", &self.state)
            .field("module", &self.module.name())
            .field("on_success", &self.on_success)
            .field("on_failure", &self.on_failure)
            .finish()
    }
}
