//! Shared, bounded worker pool and cancelable task handles.
//!
//! Every module invocation and every cleanup/dequeue task across all jobs runs
//! here. Admission is bounded: once `workers + queue_capacity` tasks are
//! outstanding, [`WorkerPool::submit`] fails with [`PoolError::Saturated`]
//! instead of growing the queue.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::AbortHandle;

use crate::error::PoolError;

/// Lifecycle of a submitted task. The three terminal variants are reached
/// exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Cancelled
        )
    }
}

/// What a worker hands to the completion callback.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
}

/// Result of [`TaskHandle::cancel`].
///
/// `cancelled` is true when this call moved the handle to `Cancelled`;
/// `interrupted` is true when the underlying work had not finished yet and was
/// aborted. The two are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub interrupted: bool,
}

/// Cancelable handle to a unit of work on the pool.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    status: watch::Sender<TaskStatus>,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    /// A handle that is already resolved, for work that never reached the pool.
    pub fn resolved(status: TaskStatus) -> Self {
        let (tx, _) = watch::channel(status);
        Self {
            status: tx,
            abort: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// Mark the task cancelled and abort its work if it is still running.
    pub fn cancel(&self) -> CancelOutcome {
        let cancelled = settle(&self.status, TaskStatus::Cancelled);
        let interrupted = match &self.abort {
            Some(abort) if cancelled && !abort.is_finished() => {
                abort.abort();
                true
            }
            _ => false,
        };
        CancelOutcome {
            cancelled,
            interrupted,
        }
    }

    /// Wait until the task reaches a terminal status.
    pub async fn finished(&self) -> TaskStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(TaskStatus::is_terminal).await {
            Ok(status) => status.clone(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.status(),
        }
    }
}

/// First terminal write wins; later writes are dropped.
fn settle(status: &watch::Sender<TaskStatus>, next: TaskStatus) -> bool {
    status.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = next;
            true
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Shared pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// Bounded pool built on the ambient tokio runtime. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    runtime: Handle,
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Create a pool on the current tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        Ok(Self::with_runtime(runtime, config))
    }

    pub fn with_runtime(runtime: Handle, config: PoolConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            runtime,
            workers: Arc::new(Semaphore::new(workers)),
            admission: Arc::new(Semaphore::new(workers + config.queue_capacity)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue `work` and return a handle to it. `on_done` runs on the worker
    /// after the work finishes, but only if the handle was not cancelled first.
    pub fn submit<T, F, C>(&self, work: F, on_done: C) -> Result<TaskHandle, PoolError>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        C: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let ticket = match self.admission.clone().try_acquire_owned() {
            Ok(ticket) => ticket,
            Err(tokio::sync::TryAcquireError::NoPermits) => return Err(PoolError::Saturated),
            Err(tokio::sync::TryAcquireError::Closed) => return Err(PoolError::Shutdown),
        };

        let (status, _) = watch::channel(TaskStatus::Queued);
        let worker_status = status.clone();
        let workers = self.workers.clone();

        let join = self.runtime.spawn(async move {
            let Ok(permit) = workers.acquire_owned().await else {
                settle(&worker_status, TaskStatus::Cancelled);
                return;
            };
            let started = worker_status.send_if_modified(|current| {
                if *current == TaskStatus::Queued {
                    *current = TaskStatus::Running;
                    true
                } else {
                    false
                }
            });
            if !started {
                return;
            }

            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(value) => TaskOutcome::Completed(value),
                Err(payload) => TaskOutcome::Failed(panic_message(payload)),
            };
            let terminal = match &outcome {
                TaskOutcome::Completed(_) => TaskStatus::Completed,
                TaskOutcome::Failed(msg) => TaskStatus::Failed(msg.clone()),
            };
            // Release capacity first: `on_done` may submit the next task.
            drop(permit);
            drop(ticket);
            if settle(&worker_status, terminal) {
                on_done(outcome);
            } else {
                tracing::debug!("task finished after cancellation, dropping its result");
            }
        });

        Ok(TaskHandle {
            status,
            abort: Some(join.abort_handle()),
        })
    }

    /// Run small follow-up work outside the bounded queue. Used to report
    /// failures of work that could not be admitted.
    pub fn defer<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(work);
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop admitting work. Tasks still waiting for a worker resolve as
    /// cancelled; running tasks finish normally.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("worker pool shutting down");
            self.admission.close();
            self.workers.close();
        }
    }
}
