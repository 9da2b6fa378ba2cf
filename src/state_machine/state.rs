use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle states of a job. `Ready` is the initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Ready,
    Preprocessing,
    Submitting,
    Submitted,
    Run,
    Waiting,
    Suspended,
    Transferring,
    Postprocessing,
    Stop,
    Restarting,
    Error,
    Finished,
}

impl State {
    pub const ALL: [State; 13] = [
        State::Ready,
        State::Preprocessing,
        State::Submitting,
        State::Submitted,
        State::Run,
        State::Waiting,
        State::Suspended,
        State::Transferring,
        State::Postprocessing,
        State::Stop,
        State::Restarting,
        State::Error,
        State::Finished,
    ];

    /// The three stages that run a user-supplied module on entry.
    pub const STAGES: [State; 3] = [
        State::Preprocessing,
        State::Submitting,
        State::Postprocessing,
    ];

    /// Parameters may only be changed while the job is idle.
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            State::Ready | State::Stop | State::Error | State::Finished
        )
    }

    pub fn can_restart(&self) -> bool {
        matches!(self, State::Stop | State::Error | State::Finished)
    }

    /// States in which the job is sitting in the remote batch queue.
    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            State::Submitted | State::Run | State::Waiting | State::Suspended | State::Transferring
        )
    }

    /// Resolve a stage name as written in job files (`preprocessing`, ...).
    pub fn from_stage_name(name: &str) -> Option<State> {
        match name.to_ascii_lowercase().as_str() {
            "preprocessing" => Some(State::Preprocessing),
            "submitting" => Some(State::Submitting),
            "postprocessing" => Some(State::Postprocessing),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Ready => "READY",
            State::Preprocessing => "PREPROCESSING",
            State::Submitting => "SUBMITTING",
            State::Submitted => "SUBMITTED",
            State::Run => "RUN",
            State::Waiting => "WAITING",
            State::Suspended => "SUSPENDED",
            State::Transferring => "TRANSFERRING",
            State::Postprocessing => "POSTPROCESSING",
            State::Stop => "STOP",
            State::Restarting => "RESTARTING",
            State::Error => "ERROR",
            State::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// Named events accepted by the job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    DoPreprocessing,
    DoSubmit,
    DoProcessing,
    DoFinish,
    DoStop,
    DoError,
    DoRestart,
    EvWaiting,
    EvRunning,
    EvRestarted,
    EvSuspended,
    EvTransferring,
    EvDone,
    EvUnknown,
}

impl Trigger {
    pub const ALL: [Trigger; 14] = [
        Trigger::DoPreprocessing,
        Trigger::DoSubmit,
        Trigger::DoProcessing,
        Trigger::DoFinish,
        Trigger::DoStop,
        Trigger::DoError,
        Trigger::DoRestart,
        Trigger::EvWaiting,
        Trigger::EvRunning,
        Trigger::EvRestarted,
        Trigger::EvSuspended,
        Trigger::EvTransferring,
        Trigger::EvDone,
        Trigger::EvUnknown,
    ];
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::DoPreprocessing => "doPreprocessing",
            Trigger::DoSubmit => "doSubmit",
            Trigger::DoProcessing => "doProcessing",
            Trigger::DoFinish => "doFinish",
            Trigger::DoStop => "doStop",
            Trigger::DoError => "doError",
            Trigger::DoRestart => "doRestart",
            Trigger::EvWaiting => "evWaiting",
            Trigger::EvRunning => "evRunning",
            Trigger::EvRestarted => "evRestarted",
            Trigger::EvSuspended => "evSuspended",
            Trigger::EvTransferring => "evTransferring",
            Trigger::EvDone => "evDone",
            Trigger::EvUnknown => "evUnknown",
        };
        f.write_str(name)
    }
}

/// Status of a job as reported by the remote batch system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Waiting,
    Running,
    Restarted,
    Suspended,
    Transferring,
    Done,
    Unknown,
}

impl BatchStatus {
    /// Map a PBS/Torque style single-letter job state.
    pub fn from_code(code: &str) -> BatchStatus {
        match code.trim() {
            "Q" | "H" | "W" => BatchStatus::Waiting,
            "R" => BatchStatus::Running,
            "S" | "U" => BatchStatus::Suspended,
            "T" | "E" | "M" => BatchStatus::Transferring,
            "C" | "F" => BatchStatus::Done,
            _ => BatchStatus::Unknown,
        }
    }

    pub fn trigger(&self) -> Trigger {
        match self {
            BatchStatus::Waiting => Trigger::EvWaiting,
            BatchStatus::Running => Trigger::EvRunning,
            BatchStatus::Restarted => Trigger::EvRestarted,
            BatchStatus::Suspended => Trigger::EvSuspended,
            BatchStatus::Transferring => Trigger::EvTransferring,
            BatchStatus::Done => Trigger::EvDone,
            BatchStatus::Unknown => Trigger::EvUnknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editable_states() {
        let editable: Vec<_> = State::ALL.iter().filter(|s| s.is_editable()).collect();
        assert_eq!(
            editable,
            vec![&State::Ready, &State::Stop, &State::Error, &State::Finished]
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(State::Ready.to_string(), "READY");
        assert_eq!(State::Postprocessing.to_string(), "POSTPROCESSING");
        assert_eq!(Trigger::DoPreprocessing.to_string(), "doPreprocessing");
        assert_eq!(Trigger::EvUnknown.to_string(), "evUnknown");
    }

    #[test]
    fn stage_names() {
        assert_eq!(State::from_stage_name("Submitting"), Some(State::Submitting));
        assert_eq!(State::from_stage_name("run"), None);
    }

    #[test]
    fn batch_codes() {
        assert_eq!(BatchStatus::from_code("Q"), BatchStatus::Waiting);
        assert_eq!(BatchStatus::from_code(" R\n"), BatchStatus::Running);
        assert_eq!(BatchStatus::from_code("S"), BatchStatus::Suspended);
        assert_eq!(BatchStatus::from_code("E"), BatchStatus::Transferring);
        assert_eq!(BatchStatus::from_code("C"), BatchStatus::Done);
        assert_eq!(BatchStatus::from_code("?"), BatchStatus::Unknown);
        assert_eq!(BatchStatus::Done.trigger(), Trigger::EvDone);
    }
}
