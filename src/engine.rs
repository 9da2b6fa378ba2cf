use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{LocalShell, RemoteChannelFactory};
use crate::config::EngineConfig;
use crate::error::{JobError, PoolError, Reason};
use crate::events::{EventKind, EventSink, JobListener, ListenerId, Listeners, run_dispatcher};
use crate::module::{Module, ModuleMap, ModuleRegistry, cleanup_module, dequeue_module};
use crate::parameters::ParameterSet;
use crate::pool::{PoolConfig, TaskHandle, WorkerPool};
use crate::state_machine::{BatchStatus, Job, JobContext, State};

type JobTable = Arc<RwLock<IndexMap<Uuid, Job>>>;

/// Result of [`Core::delete_job`].
#[derive(Debug)]
pub enum Deletion {
    /// The job is gone.
    Removed,
    /// The job was stopped and is removed once its batch dequeue resolves.
    Deferred(TaskHandle),
}

/// Owns every job, the shared worker pool, the channel factory and the
/// listener registry.
pub struct Core {
    jobs: JobTable,
    pool: WorkerPool,
    channels: Arc<dyn RemoteChannelFactory>,
    registry: ModuleRegistry,
    dequeue: Arc<dyn Module>,
    cleanup: Arc<dyn Module>,
    events: EventSink,
    listeners: Arc<Listeners>,
    dispatcher: JoinHandle<()>,
}

/// Builder for [`Core`]; anything left unset falls back to local defaults.
pub struct CoreBuilder {
    pool: PoolConfig,
    channels: Arc<dyn RemoteChannelFactory>,
    registry: ModuleRegistry,
    dequeue: Arc<dyn Module>,
    cleanup: Arc<dyn Module>,
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            channels: Arc::new(LocalShell::default()),
            registry: ModuleRegistry::new(),
            dequeue: dequeue_module("qdel {batchID}"),
            cleanup: cleanup_module("true"),
        }
    }
}

impl CoreBuilder {
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn channels(mut self, channels: Arc<dyn RemoteChannelFactory>) -> Self {
        self.channels = channels;
        self
    }

    pub fn registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dequeue(mut self, module: Arc<dyn Module>) -> Self {
        self.dequeue = module;
        self
    }

    pub fn cleanup(mut self, module: Arc<dyn Module>) -> Self {
        self.cleanup = module;
        self
    }

    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Core, PoolError> {
        let pool = WorkerPool::new(self.pool)?;
        let (events, rx) = EventSink::channel();
        let listeners = Arc::new(Listeners::new());
        let dispatcher = tokio::spawn(run_dispatcher(rx, listeners.clone()));

        tracing::info!(workers = self.pool.workers, queue = self.pool.queue_capacity, "core started");
        Ok(Core {
            jobs: Arc::new(RwLock::new(IndexMap::new())),
            pool,
            channels: self.channels,
            registry: self.registry,
            dequeue: self.dequeue,
            cleanup: self.cleanup,
            events,
            listeners,
            dispatcher,
        })
    }
}

impl Core {
    pub fn builder() -> CoreBuilder {
        CoreBuilder::default()
    }

    /// Local shell channel, shell modules and commands from `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, PoolError> {
        Self::builder()
            .pool(config.pool())
            .channels(Arc::new(LocalShell::new(config.shell.clone())))
            .registry(ModuleRegistry::from_defs(&config.modules))
            .dequeue(dequeue_module(&config.dequeue_command))
            .cleanup(cleanup_module(&config.cleanup_command))
            .build()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Collaborators for jobs built outside the core and handed to
    /// [`Core::add_job`].
    pub fn job_context(&self) -> JobContext {
        JobContext::new(self.pool.clone(), self.channels.clone(), self.events.clone())
            .with_dequeue(self.dequeue.clone())
            .with_cleanup(self.cleanup.clone())
    }

    pub fn create_job(
        &self,
        name: &str,
        parameters: ParameterSet,
        modules: ModuleMap,
    ) -> Result<Job, JobError> {
        let job = Job::new(name, parameters, modules, self.job_context())?;
        self.add_job(job.clone())?;
        Ok(job)
    }

    /// Like [`Core::create_job`], resolving `stage -> module name` bindings
    /// through the registry.
    pub fn create_job_from_bindings(
        &self,
        name: &str,
        parameters: ParameterSet,
        bindings: &BTreeMap<String, String>,
    ) -> Result<Job, JobError> {
        let modules = self
            .registry
            .resolve(bindings)
            .map_err(|e| JobError::create(e.to_string()))?;
        self.create_job(name, parameters, modules)
    }

    pub fn add_job(&self, job: Job) -> Result<(), JobError> {
        let id = job.id();
        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&id) {
                return Err(JobError::create(format!("job {id} already exists")));
            }
            jobs.insert(id, job);
        }
        tracing::info!(job_id = %id, "job added");
        self.events.publish(id, EventKind::Created);
        Ok(())
    }

    /// Remove a job. An editable job goes at once; anything else is stopped
    /// first and removed after the STOP dequeue has resolved.
    pub fn delete_job(&self, id: Uuid) -> Result<Deletion, JobError> {
        let job = self.require(Reason::Delete, id)?;

        if !job.is_editable() {
            if !job.stop() {
                return Err(JobError::delete(format!(
                    "job {id} cannot be stopped from state {}",
                    job.state()
                )));
            }
            if let Some(handle) = job.dequeue_handle().filter(|h| !h.is_finished()) {
                tracing::info!(job_id = %id, "job stopped, removal waits for dequeue");
                let waiter = handle.clone();
                let jobs = self.jobs.clone();
                let events = self.events.clone();
                self.pool.defer(async move {
                    waiter.finished().await;
                    remove(&jobs, &events, id);
                });
                return Ok(Deletion::Deferred(handle));
            }
        }

        remove(&self.jobs, &self.events, id);
        Ok(Deletion::Removed)
    }

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn stop_job(&self, id: Uuid) -> Result<bool, JobError> {
        Ok(self.require(Reason::Execution, id)?.stop())
    }

    pub fn execute_job(&self, id: Uuid) -> Result<(), JobError> {
        self.require(Reason::Execution, id)?.execute()
    }

    /// Execute every job that can start. Returns how many did.
    pub fn execute_all(&self) -> usize {
        let jobs: Vec<Job> = self.jobs.read().values().cloned().collect();
        let mut started = 0;
        for job in jobs {
            match job.execute() {
                Ok(()) => started += 1,
                Err(e) => tracing::debug!(job_id = %job.id(), "not started: {e}"),
            }
        }
        tracing::info!(started, "execute all");
        started
    }

    pub fn report_batch_status(&self, id: Uuid, status: BatchStatus) -> Result<TaskHandle, JobError> {
        self.require(Reason::Execution, id)?
            .report_batch_status(status)
            .map_err(|e| JobError::execution(e.to_string()))
    }

    pub fn count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Ids in insertion order.
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.read().keys().copied().collect()
    }

    /// Jobs currently in `state`.
    pub fn jobs_in(&self, state: State) -> Vec<Job> {
        self.jobs
            .read()
            .values()
            .filter(|job| job.state() == state)
            .cloned()
            .collect()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn JobListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Stop accepting work and release the pool. Jobs stay registered;
    /// running module tasks finish on their own.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        tracing::info!(jobs = self.count(), "core shut down");
    }

    fn require(&self, reason: Reason, id: Uuid) -> Result<Job, JobError> {
        self.get_job(id).ok_or_else(|| JobError::not_found(reason, id))
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn remove(jobs: &RwLock<IndexMap<Uuid, Job>>, events: &EventSink, id: Uuid) {
    if jobs.write().shift_remove(&id).is_some() {
        tracing::info!(job_id = %id, "job deleted");
        events.publish(id, EventKind::Deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CommandOutput, RemoteChannel};
    use crate::error::{ChannelError, ModuleError};
    use crate::module::{BATCH_ID, ModuleTask};
    use crate::parameters::MethodResult;
    use crate::pool::TaskStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Channel that records commands and succeeds without running anything.
    #[derive(Default)]
    struct RecordingChannel {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteChannel for RecordingChannel {
        async fn exec(&self, command: &str) -> Result<CommandOutput, ChannelError> {
            self.commands.lock().push(command.to_string());
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct Recording(Arc<RecordingChannel>);

    #[async_trait]
    impl RemoteChannelFactory for Recording {
        async fn open(&self) -> Result<Arc<dyn RemoteChannel>, ChannelError> {
            Ok(self.0.clone())
        }
    }

    struct Gated(Arc<Semaphore>);

    impl Module for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        fn run(
            &self,
            _job_id: Uuid,
            _channel: Arc<dyn RemoteChannel>,
            _parameters: ParameterSet,
        ) -> Result<ModuleTask, ModuleError> {
            let gate = self.0.clone();
            Ok(Box::pin(async move {
                let _ = gate.acquire().await;
                MethodResult::success("gated")
            }))
        }
    }

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        updated: AtomicUsize,
        deleted: AtomicUsize,
        states: Mutex<Vec<State>>,
    }

    impl JobListener for Counting {
        fn job_created(&self, _id: Uuid) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn job_updated(&self, _id: Uuid) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }

        fn job_deleted(&self, _id: Uuid) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_state_changed(&self, _id: Uuid, state: State) {
            self.states.lock().push(state);
        }
    }

    fn core() -> Core {
        Core::builder()
            .pool(PoolConfig {
                workers: 2,
                queue_capacity: 16,
            })
            .build()
            .unwrap()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_execute_and_finish() {
        let core = core();
        let listener = Arc::new(Counting::default());
        core.add_listener(listener.clone());

        let job = core
            .create_job("sim", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        assert_eq!(core.count(), 1);
        assert_eq!(core.job_ids(), vec![job.id()]);

        core.execute_job(job.id()).unwrap();
        wait_until(|| job.is_submitted()).await;
        core.report_batch_status(job.id(), BatchStatus::Done).unwrap();
        wait_until(|| job.state() == State::Finished).await;

        wait_until(|| listener.states.lock().last() == Some(&State::Finished)).await;
        assert_eq!(listener.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            *listener.states.lock(),
            vec![
                State::Preprocessing,
                State::Submitting,
                State::Submitted,
                State::Postprocessing,
                State::Finished
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_add_is_a_create_error() {
        let core = core();
        let job = core
            .create_job("once", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        let err = core.add_job(job).unwrap_err();
        assert_eq!(err.reason, Reason::Create);
        assert_eq!(err.reason.code(), 1000);
        assert_eq!(core.count(), 1);
    }

    #[tokio::test]
    async fn bindings_resolve_through_registry() {
        let core = Core::builder()
            .registry(ModuleRegistry::new().with("prep", Arc::new(Gated(Arc::new(Semaphore::new(0))))))
            .build()
            .unwrap();

        let ok: BTreeMap<String, String> = [("preprocessing".to_string(), "prep".to_string())].into();
        let job = core
            .create_job_from_bindings("bound", ParameterSet::new(), &ok)
            .unwrap();
        assert_eq!(job.module_actions()[0].module_name(), "gated");

        let bad: BTreeMap<String, String> = [("preprocessing".to_string(), "nope".to_string())].into();
        let err = core
            .create_job_from_bindings("unbound", ParameterSet::new(), &bad)
            .unwrap_err();
        assert_eq!(err.reason, Reason::Create);
        assert_eq!(core.count(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let core = core();
        let id = Uuid::new_v4();
        assert!(core.get_job(id).is_none());
        assert_eq!(core.delete_job(id).unwrap_err().reason, Reason::Delete);
        assert_eq!(core.execute_job(id).unwrap_err().reason, Reason::Execution);
        assert!(core.stop_job(id).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deleting_an_idle_job_is_immediate() {
        let core = core();
        let listener = Arc::new(Counting::default());
        core.add_listener(listener.clone());
        let job = core
            .create_job("idle", ParameterSet::new(), ModuleMap::new())
            .unwrap();

        assert!(matches!(core.delete_job(job.id()).unwrap(), Deletion::Removed));
        assert_eq!(core.count(), 0);
        wait_until(|| listener.deleted.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deleting_a_submitted_job_waits_for_dequeue() {
        let channel = Arc::new(RecordingChannel::default());
        let core = Core::builder()
            .channels(Arc::new(Recording(channel.clone())))
            .build()
            .unwrap();
        let job = core
            .create_job(
                "queued",
                ParameterSet::new().with(BATCH_ID, "42.pbs"),
                ModuleMap::new(),
            )
            .unwrap();
        core.execute_job(job.id()).unwrap();
        wait_until(|| job.is_submitted()).await;

        let handle = match core.delete_job(job.id()).unwrap() {
            Deletion::Deferred(handle) => handle,
            Deletion::Removed => {
                // The dequeue already resolved; nothing left to wait for.
                assert_eq!(core.count(), 0);
                return;
            }
        };
        assert_eq!(job.state(), State::Stop);
        assert_eq!(handle.finished().await, TaskStatus::Completed);
        wait_until(|| core.count() == 0).await;
        assert_eq!(*channel.commands.lock(), vec!["qdel 42.pbs".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deleting_a_running_job_without_batch_id_stops_it() {
        let core = Core::builder()
            .registry(ModuleRegistry::new().with("prep", Arc::new(Gated(Arc::new(Semaphore::new(0))))))
            .build()
            .unwrap();
        let bindings: BTreeMap<String, String> =
            [("preprocessing".to_string(), "prep".to_string())].into();
        let job = core
            .create_job_from_bindings("busy", ParameterSet::new(), &bindings)
            .unwrap();
        core.execute_job(job.id()).unwrap();

        assert!(matches!(core.delete_job(job.id()).unwrap(), Deletion::Removed));
        assert_eq!(job.state(), State::Stop);
        assert_eq!(core.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn execute_all_counts_started_jobs() {
        let core = core();
        for name in ["a", "b", "c"] {
            core.create_job(name, ParameterSet::new(), ModuleMap::new())
                .unwrap();
        }
        let errored = core
            .create_job("d", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        errored.fire(crate::state_machine::Trigger::DoError).unwrap();

        assert_eq!(core.execute_all(), 3);
        wait_until(|| core.jobs_in(State::Submitted).len() == 3).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_job_reports_effect() {
        let core = core();
        let job = core
            .create_job("idle", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        // READY ignores doStop.
        assert!(!core.stop_job(job.id()).unwrap());
        assert_eq!(job.state(), State::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listeners_can_be_removed() {
        let core = core();
        let listener = Arc::new(Counting::default());
        let id = core.add_listener(listener.clone());
        assert!(core.remove_listener(id));
        assert!(!core.remove_listener(id));

        core.create_job("quiet", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(listener.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let core = core();
        let job = core
            .create_job("late", ParameterSet::new(), ModuleMap::new())
            .unwrap();
        core.shutdown();
        assert!(core.pool().is_shut_down());
        assert!(core.report_batch_status(job.id(), BatchStatus::Done).is_err());
    }
}
