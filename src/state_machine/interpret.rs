use uuid::Uuid;

use crate::error::ParameterError;
use crate::events::{EventKind, EventSink};
use crate::parameters::{MethodResult, Parameter, ParameterSet};

/// Turns a module result into success or failure, applying side effects to the
/// job's parameters.
pub type Interpreter = fn(Uuid, &mut ParameterSet, &EventSink, MethodResult) -> bool;

/// Default interpreter: fail on non-zero exit, otherwise merge every output
/// parameter into the job (update in place, append if new) and publish one
/// `Updated` event per parameter.
pub fn merge_outputs(
    job_id: Uuid,
    parameters: &mut ParameterSet,
    events: &EventSink,
    result: MethodResult,
) -> bool {
    if !result.is_success() {
        tracing::error!(
            job_id = %job_id,
            method = %result.method,
            exit_status = result.exit_status,
            "{}",
            result.first_error()
        );
        return false;
    }

    if result.outputs.is_empty() {
        return true;
    }

    for (name, value) in result.outputs.iter() {
        match parameters.update(name, value.clone()) {
            Ok(()) => {
                tracing::info!(job_id = %job_id, method = %result.method, parameter = name, "parameter updated");
            }
            Err(ParameterError::NotFound(_)) => {
                tracing::info!(job_id = %job_id, method = %result.method, parameter = name, "new parameter");
                if let Err(e) = parameters.add(Parameter::new(name, value.clone())) {
                    tracing::warn!(job_id = %job_id, "{e}");
                }
            }
            Err(e) => tracing::warn!(job_id = %job_id, "{e}"),
        }
        events.publish(job_id, EventKind::Updated);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEvent;
    use crate::parameters::ParameterValue;

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn merges_existing_and_new_outputs() {
        let (sink, mut rx) = EventSink::channel();
        let id = Uuid::new_v4();
        let mut params = ParameterSet::new().with("workDir", "/tmp/a").with("batchID", "old");

        let result = MethodResult::success("submit")
            .with_output("batchID", "77.pbs")
            .with_output("queue", "short");
        assert!(merge_outputs(id, &mut params, &sink, result));

        assert_eq!(params.get("batchID"), Some(&ParameterValue::from("77.pbs")));
        let names: Vec<_> = params.names().collect();
        assert_eq!(names, vec!["workDir", "batchID", "queue"]);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Updated && e.job_id == id));
    }

    #[test]
    fn failure_touches_nothing() {
        let (sink, mut rx) = EventSink::channel();
        let mut params = ParameterSet::new().with("a", 1);
        let before = params.clone();

        let result = MethodResult::failure("prep", "disk full").with_output("a", 2);
        assert!(!merge_outputs(Uuid::new_v4(), &mut params, &sink, result));

        assert_eq!(params, before);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn success_without_outputs() {
        let (sink, mut rx) = EventSink::channel();
        let mut params = ParameterSet::new();
        assert!(merge_outputs(
            Uuid::new_v4(),
            &mut params,
            &sink,
            MethodResult::success("noop")
        ));
        assert!(drain(&mut rx).is_empty());
    }
}
