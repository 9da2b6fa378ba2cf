//! Batch status polling.
//!
//! Every tick the poller probes each submitted job with the configured status
//! command and feeds the answer back through [`Job::report_batch_status`].
//! Without a status command there is no batch queue to ask, so submitted jobs
//! are reported done straight away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::channel::RemoteChannelFactory;
use crate::engine::Core;
use crate::module::render_template;
use crate::parameters::ParameterSet;
use crate::pool::{TaskHandle, TaskOutcome};
use crate::state_machine::{BatchStatus, Job};

/// Periodically asks the batch system about every submitted job.
pub struct StatusPoller {
    channels: Arc<dyn RemoteChannelFactory>,
    command: Option<String>,
    interval: Duration,
    probes: HashMap<Uuid, TaskHandle>,
}

impl StatusPoller {
    pub fn new(
        channels: Arc<dyn RemoteChannelFactory>,
        command: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            channels,
            command,
            interval,
            probes: HashMap::new(),
        }
    }

    /// Poll until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, core: Arc<Core>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "status poller started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once(&core);
                }
            }
        }
        tracing::debug!("status poller stopped");
    }

    /// Start a probe for every submitted job that has none running. Returns
    /// how many were started.
    pub fn poll_once(&mut self, core: &Core) -> usize {
        self.probes.retain(|_, handle| !handle.is_finished());

        let mut started = 0;
        for job in core.jobs() {
            if !job.is_submitted() || self.probes.contains_key(&job.id()) {
                continue;
            }
            let id = job.id();
            match self.probe(core, job) {
                Ok(handle) => {
                    self.probes.insert(id, handle);
                    started += 1;
                }
                Err(e) => tracing::warn!(job_id = %id, "cannot schedule status probe: {e}"),
            }
        }
        started
    }

    fn probe(&self, core: &Core, job: Job) -> Result<TaskHandle, crate::error::PoolError> {
        let work = query(
            self.channels.clone(),
            self.command.clone(),
            job.id(),
            job.parameters(),
        );
        core.pool().submit(work, move |outcome| match outcome {
            TaskOutcome::Completed(Some(status)) => {
                if let Err(e) = job.report_batch_status(status) {
                    tracing::warn!(job_id = %job.id(), "cannot report batch status: {e}");
                }
            }
            TaskOutcome::Completed(None) => {}
            TaskOutcome::Failed(message) => {
                tracing::warn!(job_id = %job.id(), "status probe crashed: {message}");
            }
        })
    }
}

/// Ask the batch system about one job. `None` when there is no usable answer.
async fn query(
    channels: Arc<dyn RemoteChannelFactory>,
    command: Option<String>,
    job_id: Uuid,
    parameters: ParameterSet,
) -> Option<BatchStatus> {
    let Some(template) = command else {
        return Some(BatchStatus::Done);
    };
    let command = match render_template(&template, job_id, &parameters) {
        Ok(command) => command,
        Err(missing) => {
            tracing::debug!(job_id = %job_id, parameter = %missing, "status command not ready");
            return None;
        }
    };

    let channel = match channels.open().await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(job_id = %job_id, "status probe: {e}");
            return None;
        }
    };
    match channel.exec(&command).await {
        Ok(output) if output.success() => {
            let status = BatchStatus::from_code(&output.stdout);
            tracing::trace!(job_id = %job_id, ?status, "batch status");
            Some(status)
        }
        Ok(output) => {
            tracing::warn!(job_id = %job_id, status = output.status, "status command failed: {}", output.stderr.trim());
            None
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, "status probe: {e}");
            None
        }
    }
}
