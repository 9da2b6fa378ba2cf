use std::collections::HashMap;

use super::state::{State, Trigger};
use crate::error::ConfigError;

/// Side effect run when a state is entered. Each variant does exactly one
/// thing; a state's actions run in the order they were configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// Publish `StateChanged` for the new state.
    PublishStateChanged,
    /// Set the `submitted` flag.
    SetSubmitted(bool),
    /// Start the module action bound to the given state.
    RunModule(State),
    /// Cancel the in-flight task of every module action.
    CancelModules,
    /// Ask the batch system to drop the job, without waiting for the answer.
    DequeueFromBatch,
}

/// How a state answers one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Move to the given state.
    Permit(State),
    /// Accepted without effect.
    Ignore,
}

/// Entry actions and trigger rules of a single state.
#[derive(Debug, Clone, Default)]
pub struct StateConfig {
    entry: Vec<EntryAction>,
    rules: HashMap<Trigger, Rule>,
}

impl StateConfig {
    pub fn on_entry(&mut self, action: EntryAction) -> &mut Self {
        self.entry.push(action);
        self
    }

    pub fn permit(&mut self, trigger: Trigger, target: State) -> &mut Self {
        self.rules.insert(trigger, Rule::Permit(target));
        self
    }

    pub fn ignore(&mut self, trigger: Trigger) -> &mut Self {
        self.rules.insert(trigger, Rule::Ignore);
        self
    }

    pub fn entry_actions(&self) -> &[EntryAction] {
        &self.entry
    }
}

/// Per-state entry actions and trigger rules. Built once per job, never
/// changed afterwards.
#[derive(Debug, Clone, Default)]
pub struct StateMachineConfig {
    states: HashMap<State, StateConfig>,
}

impl StateMachineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, state: State) -> &mut StateConfig {
        self.states.entry(state).or_default()
    }

    /// `None` means the trigger is not accepted in `state`.
    pub fn rule(&self, state: State, trigger: Trigger) -> Option<Rule> {
        self.states.get(&state)?.rules.get(&trigger).copied()
    }

    pub fn entry_actions(&self, state: State) -> &[EntryAction] {
        self.states
            .get(&state)
            .map(StateConfig::entry_actions)
            .unwrap_or(&[])
    }

    /// Every state is configured, publishes its change first, and every
    /// permitted target exists.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for state in State::ALL {
            let Some(config) = self.states.get(&state) else {
                return Err(ConfigError::Invalid(format!("state {state} is not configured")));
            };
            if config.entry.first() != Some(&EntryAction::PublishStateChanged) {
                return Err(ConfigError::Invalid(format!(
                    "state {state} must publish its change before other entry actions"
                )));
            }
            for rule in config.rules.values() {
                if let Rule::Permit(target) = rule
                    && !self.states.contains_key(target)
                {
                    return Err(ConfigError::Invalid(format!(
                        "state {state} permits unconfigured target {target}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// The lifecycle every job runs.
    pub fn standard() -> Self {
        use EntryAction::*;
        use Trigger::*;

        let mut config = Self::new();

        config
            .configure(State::Ready)
            .on_entry(PublishStateChanged)
            .permit(DoPreprocessing, State::Preprocessing)
            .ignore(DoStop)
            .permit(DoError, State::Error);

        config
            .configure(State::Preprocessing)
            .on_entry(PublishStateChanged)
            .on_entry(RunModule(State::Preprocessing))
            .permit(DoSubmit, State::Submitting)
            .permit(DoStop, State::Stop)
            .permit(DoError, State::Error);

        config
            .configure(State::Submitting)
            .on_entry(PublishStateChanged)
            .on_entry(RunModule(State::Submitting))
            .permit(DoProcessing, State::Submitted)
            .permit(DoStop, State::Stop)
            .permit(DoError, State::Error);

        config
            .configure(State::Submitted)
            .on_entry(PublishStateChanged)
            .on_entry(SetSubmitted(true));
        config.batch_routes(State::Submitted);

        for state in [
            State::Run,
            State::Waiting,
            State::Suspended,
            State::Transferring,
        ] {
            config.configure(state).on_entry(PublishStateChanged);
            config.batch_routes(state);
        }

        config
            .configure(State::Postprocessing)
            .on_entry(PublishStateChanged)
            .on_entry(SetSubmitted(false))
            .on_entry(RunModule(State::Postprocessing))
            .permit(DoFinish, State::Finished)
            .permit(DoStop, State::Stop)
            .permit(DoError, State::Error);

        config
            .configure(State::Stop)
            .on_entry(PublishStateChanged)
            .on_entry(CancelModules)
            .on_entry(DequeueFromBatch)
            .on_entry(SetSubmitted(false))
            .permit(DoRestart, State::Restarting)
            .permit(DoFinish, State::Finished);

        // doError keeps a failing cleanup from stranding the job here.
        config
            .configure(State::Restarting)
            .on_entry(PublishStateChanged)
            .on_entry(RunModule(State::Restarting))
            .on_entry(SetSubmitted(false))
            .permit(DoPreprocessing, State::Preprocessing)
            .ignore(DoRestart)
            .permit(DoError, State::Error);

        config
            .configure(State::Error)
            .on_entry(PublishStateChanged)
            .on_entry(SetSubmitted(false))
            .permit(DoRestart, State::Restarting);

        config
            .configure(State::Finished)
            .on_entry(PublishStateChanged)
            .on_entry(SetSubmitted(false))
            .permit(DoRestart, State::Restarting);

        config
    }

    /// Batch-status routing shared by SUBMITTED and the queue states. An event
    /// that would route to the current state is ignored, as is `evUnknown`.
    fn batch_routes(&mut self, state: State) {
        let routes = [
            (Trigger::EvWaiting, State::Waiting),
            (Trigger::EvRunning, State::Run),
            (Trigger::EvRestarted, State::Waiting),
            (Trigger::EvSuspended, State::Suspended),
            (Trigger::EvTransferring, State::Transferring),
            (Trigger::EvDone, State::Postprocessing),
        ];

        let config = self.configure(state);
        config.ignore(Trigger::EvUnknown);
        for (trigger, target) in routes {
            if target == state {
                config.ignore(trigger);
            } else {
                config.permit(trigger, target);
            }
        }
        config
            .permit(Trigger::DoStop, State::Stop)
            .permit(Trigger::DoError, State::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permits(config: &StateMachineConfig, state: State) -> Vec<(Trigger, State)> {
        Trigger::ALL
            .iter()
            .filter_map(|&t| match config.rule(state, t) {
                Some(Rule::Permit(target)) => Some((t, target)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn standard_config_is_valid() {
        StateMachineConfig::standard().validate().unwrap();
    }

    #[test]
    fn ready_row() {
        let config = StateMachineConfig::standard();
        assert_eq!(
            permits(&config, State::Ready),
            vec![
                (Trigger::DoPreprocessing, State::Preprocessing),
                (Trigger::DoError, State::Error)
            ]
        );
        assert_eq!(config.rule(State::Ready, Trigger::DoStop), Some(Rule::Ignore));
        assert_eq!(config.rule(State::Ready, Trigger::DoFinish), None);
    }

    #[test]
    fn queue_states_ignore_their_own_event() {
        let config = StateMachineConfig::standard();
        assert_eq!(config.rule(State::Run, Trigger::EvRunning), Some(Rule::Ignore));
        assert_eq!(config.rule(State::Waiting, Trigger::EvWaiting), Some(Rule::Ignore));
        assert_eq!(config.rule(State::Waiting, Trigger::EvRestarted), Some(Rule::Ignore));
        assert_eq!(
            config.rule(State::Suspended, Trigger::EvSuspended),
            Some(Rule::Ignore)
        );
        assert_eq!(
            config.rule(State::Transferring, Trigger::EvTransferring),
            Some(Rule::Ignore)
        );
        assert_eq!(
            config.rule(State::Submitted, Trigger::EvRunning),
            Some(Rule::Permit(State::Run))
        );
        for state in [State::Submitted, State::Run, State::Waiting] {
            assert_eq!(config.rule(state, Trigger::EvUnknown), Some(Rule::Ignore));
            assert_eq!(
                config.rule(state, Trigger::EvDone),
                Some(Rule::Permit(State::Postprocessing))
            );
        }
    }

    #[test]
    fn stop_does_not_accept_stop() {
        let config = StateMachineConfig::standard();
        assert_eq!(config.rule(State::Stop, Trigger::DoStop), None);
        assert_eq!(
            config.rule(State::Stop, Trigger::DoRestart),
            Some(Rule::Permit(State::Restarting))
        );
    }

    #[test]
    fn state_changed_is_published_first_everywhere() {
        let config = StateMachineConfig::standard();
        for state in State::ALL {
            assert_eq!(
                config.entry_actions(state).first(),
                Some(&EntryAction::PublishStateChanged),
                "{state}"
            );
        }
    }

    #[test]
    fn validate_rejects_missing_state() {
        let mut config = StateMachineConfig::new();
        config
            .configure(State::Ready)
            .on_entry(EntryAction::PublishStateChanged)
            .permit(Trigger::DoPreprocessing, State::Preprocessing);
        assert!(config.validate().is_err());
    }
}
