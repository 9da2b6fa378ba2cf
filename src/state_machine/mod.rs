mod action;
mod config;
mod interpret;
mod job;
mod state;

pub use action::ModuleAction;
pub use config::{EntryAction, Rule, StateConfig, StateMachineConfig};
pub use interpret::{Interpreter, merge_outputs};
pub use job::{Job, JobContext, JobCore, JobSnapshot, StateChange, Transition};
pub use state::{BatchStatus, State, Trigger};
