//! Lifecycle engine for jobs executed on a remote batch system.
//!
//! A [`Job`] moves through a fixed state machine. Entering a stage state runs
//! its [`Module`] on the shared [`WorkerPool`]; the result fires the next
//! trigger. The [`Core`] owns the jobs and fans their events out to
//! [`JobListener`]s.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod module;
pub mod parameters;
pub mod poller;
pub mod pool;
pub mod state_machine;

pub use config::{EngineConfig, JobFile, ModuleDef};
pub use engine::{Core, CoreBuilder, Deletion};
pub use error::{JobError, Reason};
pub use events::{EventKind, JobEvent, JobListener, ListenerId};
pub use module::{Module, ModuleMap, ModuleRegistry};
pub use parameters::{MethodResult, Parameter, ParameterSet, ParameterValue};
pub use poller::StatusPoller;
pub use pool::{PoolConfig, TaskHandle, TaskStatus, WorkerPool};
pub use state_machine::{BatchStatus, Job, JobContext, JobSnapshot, State, Trigger};
