use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::action::{ModuleAction, invoke};
use super::config::{EntryAction, Rule, StateMachineConfig};
use super::interpret::merge_outputs;
use super::state::{BatchStatus, State, Trigger};
use crate::channel::{LocalShell, RemoteChannelFactory};
use crate::error::{ConfigError, JobError, PoolError, TransitionError};
use crate::events::{EventKind, EventSink};
use crate::module::{BATCH_ID, Module, ModuleMap, PassThrough, cleanup_module, dequeue_module};
use crate::parameters::{MethodResult, ParameterSet, ParameterValue};
use crate::pool::{TaskHandle, TaskOutcome, TaskStatus, WorkerPool};

/// Shared collaborators every job needs.
#[derive(Clone)]
pub struct JobContext {
    pub pool: WorkerPool,
    pub channels: Arc<dyn RemoteChannelFactory>,
    pub events: EventSink,
    /// Removes a job from the batch system on STOP.
    pub dequeue: Arc<dyn Module>,
    /// Runs on RESTARTING before preprocessing starts again.
    pub cleanup: Arc<dyn Module>,
}

impl JobContext {
    pub fn new(pool: WorkerPool, channels: Arc<dyn RemoteChannelFactory>, events: EventSink) -> Self {
        Self {
            pool,
            channels,
            events,
            dequeue: dequeue_module("qdel {batchID}"),
            cleanup: cleanup_module("true"),
        }
    }

    /// Local shell channel, no observers.
    pub fn local(pool: WorkerPool) -> Self {
        Self::new(pool, Arc::new(LocalShell::default()), EventSink::detached())
    }

    pub fn with_dequeue(mut self, module: Arc<dyn Module>) -> Self {
        self.dequeue = module;
        self
    }

    pub fn with_cleanup(mut self, module: Arc<dyn Module>) -> Self {
        self.cleanup = module;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }
}

/// Outcome of firing a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: State, to: State },
    /// The current state ignores the trigger.
    Ignored,
}

/// One entry in a job's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: State,
    pub trigger: Option<Trigger>,
    pub at: DateTime<Utc>,
}

/// Serializable view of a job at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub state: State,
    pub submitted: bool,
    pub parameters: ParameterSet,
    pub created_at: DateTime<Utc>,
    pub history: Vec<StateChange>,
}

/// Mutable part of a job, guarded by the job's exclusive section.
#[derive(Debug)]
pub struct JobCore {
    state: State,
    parameters: ParameterSet,
    submitted: bool,
    history: Vec<StateChange>,
}

impl JobCore {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }
}

struct JobInner {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    config: StateMachineConfig,
    actions: Vec<ModuleAction>,
    context: JobContext,
    core: Mutex<JobCore>,
    dequeue: Mutex<Option<TaskHandle>>,
}

/// Non-owning handle held by in-flight tasks, so a dropped job is not kept
/// alive by its own modules.
#[derive(Clone)]
pub(crate) struct WeakJob(Weak<JobInner>);

impl WeakJob {
    pub(crate) fn upgrade(&self) -> Option<Job> {
        self.0.upgrade().map(|inner| Job { inner })
    }
}

/// A job moving through the lifecycle state machine. Cloning yields another
/// handle to the same job.
///
/// State only changes by firing triggers. Firing, and the entry actions of
/// the state it lands in, run inside one per-job exclusive section; module
/// completions arriving on worker threads take the same section before they
/// fire.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Build a job from its stage modules. Only PREPROCESSING, SUBMITTING and
    /// POSTPROCESSING may be bound; a stage left out passes straight through.
    pub fn new(
        name: impl Into<String>,
        parameters: ParameterSet,
        modules: ModuleMap,
        context: JobContext,
    ) -> Result<Self, JobError> {
        let name = name.into();
        if let Some(state) = modules.keys().find(|s| !State::STAGES.contains(*s)) {
            return Err(JobError::create(ConfigError::UnbindableState(*state).to_string()));
        }

        let config = StateMachineConfig::standard();
        config
            .validate()
            .map_err(|e| JobError::create(e.to_string()))?;

        let mut actions = Vec::with_capacity(4);
        for (stage, on_success) in [
            (State::Preprocessing, Trigger::DoSubmit),
            (State::Submitting, Trigger::DoProcessing),
            (State::Postprocessing, Trigger::DoFinish),
        ] {
            let module: Arc<dyn Module> = match modules.get(&stage) {
                Some(module) => module.clone(),
                None => {
                    tracing::debug!(job = %name, stage = %stage, "no module bound, stage passes through");
                    Arc::new(PassThrough)
                }
            };
            actions.push(ModuleAction::new(
                stage,
                module,
                merge_outputs,
                on_success,
                Trigger::DoError,
            ));
        }
        actions.push(ModuleAction::new(
            State::Restarting,
            context.cleanup.clone(),
            merge_outputs,
            Trigger::DoPreprocessing,
            Trigger::DoError,
        ));

        let created_at = Utc::now();
        let job = Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                name,
                created_at,
                config,
                actions,
                context,
                core: Mutex::new(JobCore {
                    state: State::Ready,
                    parameters,
                    submitted: false,
                    history: vec![StateChange {
                        state: State::Ready,
                        trigger: None,
                        at: created_at,
                    }],
                }),
                dequeue: Mutex::new(None),
            }),
        };
        tracing::debug!(job_id = %job.id(), name = %job.name(), "job created");
        Ok(job)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> State {
        self.inner.core.lock().state
    }

    pub fn is_submitted(&self) -> bool {
        self.inner.core.lock().submitted
    }

    pub fn is_editable(&self) -> bool {
        self.state().is_editable()
    }

    /// A copy of the parameters; changes go through [`Job::update_parameter`].
    pub fn parameters(&self) -> ParameterSet {
        self.inner.core.lock().parameters.clone()
    }

    pub fn history(&self) -> Vec<StateChange> {
        self.inner.core.lock().history.clone()
    }

    pub fn module_actions(&self) -> &[ModuleAction] {
        &self.inner.actions
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let core = self.inner.core.lock();
        JobSnapshot {
            id: self.inner.id,
            name: self.inner.name.clone(),
            state: core.state,
            submitted: core.submitted,
            parameters: core.parameters.clone(),
            created_at: self.inner.created_at,
            history: core.history.clone(),
        }
    }

    /// Handle of the latest batch dequeue started by STOP.
    pub fn dequeue_handle(&self) -> Option<TaskHandle> {
        self.inner.dequeue.lock().clone()
    }

    /// Fire `trigger` against the current state.
    pub fn fire(&self, trigger: Trigger) -> Result<Transition, TransitionError> {
        let mut core = self.inner.core.lock();
        self.fire_locked(&mut core, trigger)
    }

    /// Start the lifecycle. Valid from READY, or from RESTARTING to skip the
    /// rest of the cleanup.
    pub fn execute(&self) -> Result<(), JobError> {
        let mut core = self.inner.core.lock();
        let state = core.state;
        match state {
            State::Ready | State::Restarting => self
                .fire_locked(&mut core, Trigger::DoPreprocessing)
                .map(|_| ())
                .map_err(|e| JobError::execution(e.to_string())),
            state => Err(JobError::execution(format!(
                "job {} cannot be executed from state {state}",
                self.inner.id
            ))),
        }
    }

    /// Fire `doStop`. Returns false, without error, when the current state
    /// ignores or does not accept it.
    pub fn stop(&self) -> bool {
        let mut core = self.inner.core.lock();
        match self.inner.config.rule(core.state, Trigger::DoStop) {
            Some(Rule::Permit(_)) => self.fire_locked(&mut core, Trigger::DoStop).is_ok(),
            _ => {
                tracing::debug!(job_id = %self.inner.id, state = %core.state, "stop has no effect");
                false
            }
        }
    }

    /// Fire `doRestart` from STOP, ERROR or FINISHED; otherwise do nothing.
    pub fn restart(&self) -> bool {
        let mut core = self.inner.core.lock();
        if !core.state.can_restart() {
            tracing::debug!(job_id = %self.inner.id, state = %core.state, "restart ignored");
            return false;
        }
        self.fire_locked(&mut core, Trigger::DoRestart).is_ok()
    }

    pub fn update_parameter(
        &self,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> Result<(), JobError> {
        let mut core = self.inner.core.lock();
        if !core.state.is_editable() {
            return Err(JobError::update("Job is not editable"));
        }
        core.parameters
            .update(name, value)
            .map_err(|e| JobError::update(e.to_string()))?;
        self.inner.context.events.publish(self.inner.id, EventKind::Updated);
        Ok(())
    }

    /// Replace the whole parameter set.
    pub fn update_parameters(&self, parameters: ParameterSet) -> Result<(), JobError> {
        let mut core = self.inner.core.lock();
        if !core.state.is_editable() {
            return Err(JobError::update("Job is not editable"));
        }
        core.parameters = parameters;
        self.inner.context.events.publish(self.inner.id, EventKind::Updated);
        Ok(())
    }

    /// Feed a batch-system status report into the state machine. Consumed on
    /// the worker pool, and only while the job is submitted.
    pub fn report_batch_status(&self, status: BatchStatus) -> Result<TaskHandle, PoolError> {
        let weak = self.downgrade();
        self.inner.context.pool.submit(
            async move {
                if let Some(job) = weak.upgrade() {
                    job.consume_batch_status(status);
                }
            },
            |_| {},
        )
    }

    fn consume_batch_status(&self, status: BatchStatus) {
        let mut core = self.inner.core.lock();
        if !core.submitted {
            tracing::debug!(job_id = %self.inner.id, ?status, "not submitted, status dropped");
            return;
        }
        if let Err(e) = self.fire_locked(&mut core, status.trigger()) {
            tracing::warn!(job_id = %self.inner.id, ?status, "batch status rejected: {e}");
        }
    }

    pub(crate) fn context(&self) -> &JobContext {
        &self.inner.context
    }

    pub(crate) fn downgrade(&self) -> WeakJob {
        WeakJob(Arc::downgrade(&self.inner))
    }

    /// Completion of a module action run, on a worker thread.
    pub(crate) fn complete(&self, state: State, epoch: u64, outcome: TaskOutcome<MethodResult>) {
        let mut core = self.inner.core.lock();
        let Some(action) = self.inner.actions.iter().find(|a| a.state() == state) else {
            return;
        };
        if !action.is_current(epoch) || core.state != state {
            tracing::debug!(
                job_id = %self.inner.id,
                module = action.module_name(),
                state = %core.state,
                "stale module result dropped"
            );
            return;
        }

        let trigger = action.interpret(self.inner.id, &mut core, &self.inner.context.events, outcome);
        if let Err(e) = self.fire_locked(&mut core, trigger) {
            tracing::warn!(job_id = %self.inner.id, "{e}");
        }
    }

    fn fire_locked(&self, core: &mut JobCore, trigger: Trigger) -> Result<Transition, TransitionError> {
        let from = core.state;
        match self.inner.config.rule(from, trigger) {
            None => {
                tracing::warn!(job_id = %self.inner.id, state = %from, trigger = %trigger, "trigger rejected");
                Err(TransitionError::Invalid {
                    state: from,
                    trigger,
                })
            }
            Some(Rule::Ignore) => {
                tracing::debug!(job_id = %self.inner.id, state = %from, trigger = %trigger, "trigger ignored");
                Ok(Transition::Ignored)
            }
            Some(Rule::Permit(to)) => {
                core.state = to;
                core.history.push(StateChange {
                    state: to,
                    trigger: Some(trigger),
                    at: Utc::now(),
                });
                tracing::info!(job_id = %self.inner.id, from = %from, to = %to, trigger = %trigger, "transition");
                for action in self.inner.config.entry_actions(to) {
                    self.run_entry(core, *action);
                }
                Ok(Transition::Moved { from, to })
            }
        }
    }

    fn run_entry(&self, core: &mut JobCore, action: EntryAction) {
        match action {
            EntryAction::PublishStateChanged => {
                self.inner
                    .context
                    .events
                    .publish(self.inner.id, EventKind::StateChanged(core.state));
            }
            EntryAction::SetSubmitted(submitted) => core.submitted = submitted,
            EntryAction::RunModule(state) => {
                if let Some(action) = self.inner.actions.iter().find(|a| a.state() == state) {
                    action.on_entry(self, core);
                }
            }
            EntryAction::CancelModules => {
                for action in &self.inner.actions {
                    action.cancel();
                }
            }
            EntryAction::DequeueFromBatch => self.dequeue(core),
        }
    }

    /// Best-effort removal from the batch system; the transition does not
    /// wait for it.
    fn dequeue(&self, core: &JobCore) {
        let Some(batch_id) = core.parameters.get(BATCH_ID).cloned() else {
            tracing::debug!(job_id = %self.inner.id, "no batch id, nothing to dequeue");
            return;
        };
        let context = &self.inner.context;
        let work = invoke(
            context.dequeue.clone(),
            context.channels.clone(),
            self.inner.id,
            core.parameters.clone(),
        );
        let weak = self.downgrade();
        let handle = context
            .pool
            .submit(work, move |outcome| {
                if let Some(job) = weak.upgrade() {
                    job.dequeued(&batch_id, outcome);
                }
            })
            .unwrap_or_else(|e| {
                tracing::warn!(job_id = %self.inner.id, "cannot schedule dequeue: {e}");
                TaskHandle::resolved(TaskStatus::Failed(e.to_string()))
            });
        *self.inner.dequeue.lock() = Some(handle);
    }

    /// Only the id this dequeue was started for is cleared. A resubmission
    /// that finished in the meantime keeps its own id.
    fn dequeued(&self, batch_id: &ParameterValue, outcome: TaskOutcome<MethodResult>) {
        match outcome {
            TaskOutcome::Completed(result) if result.is_success() => {
                let mut core = self.inner.core.lock();
                if core.parameters.get(BATCH_ID) != Some(batch_id) {
                    tracing::debug!(job_id = %self.inner.id, "batch id changed since dequeue started, keeping it");
                    return;
                }
                core.parameters.remove(BATCH_ID);
                tracing::debug!(job_id = %self.inner.id, "job deleted from batch system");
                self.inner.context.events.publish(self.inner.id, EventKind::Updated);
            }
            TaskOutcome::Completed(result) => {
                tracing::warn!(job_id = %self.inner.id, "error removing job from batch system: {}", result.first_error());
            }
            TaskOutcome::Failed(message) => {
                tracing::warn!(job_id = %self.inner.id, "dequeue crashed: {message}");
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
