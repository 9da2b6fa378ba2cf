use std::sync::Arc;

use uuid::Uuid;

use super::{Module, ModuleTask};
use crate::channel::RemoteChannel;
use crate::error::ModuleError;
use crate::parameters::{MethodResult, ParameterSet};

/// Substitute `{name}` placeholders with parameter values. `{jobId}` is always
/// available. Returns the first missing name on failure.
pub fn render_template(
    template: &str,
    job_id: Uuid,
    parameters: &ParameterSet,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = &after[..close];
        if name == "jobId" {
            out.push_str(&job_id.to_string());
        } else {
            match parameters.get(name) {
                Some(value) => out.push_str(&value.to_string()),
                None => return Err(name.to_string()),
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Runs a command template through the remote channel.
///
/// Exit status and stderr become the result; with `output` set, trimmed stdout
/// of a successful run is returned as that output parameter.
#[derive(Debug, Clone)]
pub struct ShellModule {
    name: String,
    command: String,
    output: Option<String>,
}

impl ShellModule {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, parameter: impl Into<String>) -> Self {
        self.output = Some(parameter.into());
        self
    }
}

impl Module for ShellModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        &self,
        job_id: Uuid,
        channel: Arc<dyn RemoteChannel>,
        parameters: ParameterSet,
    ) -> Result<ModuleTask, ModuleError> {
        let command = render_template(&self.command, job_id, &parameters).map_err(|parameter| {
            ModuleError::MissingParameter {
                module: self.name.clone(),
                parameter,
            }
        })?;
        let method = self.name.clone();
        let output = self.output.clone();

        Ok(Box::pin(async move {
            match channel.exec(&command).await {
                Ok(out) if out.success() => {
                    let result = MethodResult::success(&method);
                    match output {
                        Some(name) => result.with_output(name, out.stdout.trim()),
                        None => result,
                    }
                }
                Ok(out) => {
                    let message = match out.stderr.trim() {
                        "" => format!("`{command}` exited with status {}", out.status),
                        stderr => stderr.to_string(),
                    };
                    MethodResult::with_status(&method, out.status, message)
                }
                Err(e) => MethodResult::failure(&method, e.to_string()),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalShell;
    use crate::parameters::ParameterValue;

    #[test]
    fn renders_placeholders() {
        let params = ParameterSet::new().with("batchID", "1234.pbs").with("nodes", 2);
        let id = Uuid::new_v4();
        let rendered = render_template("qdel {batchID} # {nodes} {jobId}", id, &params).unwrap();
        assert_eq!(rendered, format!("qdel 1234.pbs # 2 {id}"));
    }

    #[test]
    fn missing_placeholder_is_reported() {
        let err = render_template("qdel {batchID}", Uuid::new_v4(), &ParameterSet::new());
        assert_eq!(err.unwrap_err(), "batchID");
    }

    #[test]
    fn unterminated_brace_is_literal() {
        let rendered = render_template("echo {oops", Uuid::new_v4(), &ParameterSet::new());
        assert_eq!(rendered.unwrap(), "echo {oops");
    }

    #[test]
    fn missing_parameter_fails_construction() {
        let module = ShellModule::new("dequeue", "qdel {batchID}");
        let err = module
            .run(Uuid::new_v4(), Arc::new(LocalShell::default()), ParameterSet::new())
            .err()
            .unwrap();
        assert!(matches!(err, ModuleError::MissingParameter { .. }));
    }

    #[tokio::test]
    async fn captures_stdout_as_output() {
        let module = ShellModule::new("submit", "echo {job}.pbs").with_output("batchID");
        let task = module
            .run(
                Uuid::new_v4(),
                Arc::new(LocalShell::default()),
                ParameterSet::new().with("job", "42"),
            )
            .unwrap();
        let result = task.await;
        assert!(result.is_success());
        assert_eq!(
            result.outputs.get("batchID"),
            Some(&ParameterValue::from("42.pbs"))
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let module = ShellModule::new("prep", "echo broken >&2; exit 2");
        let task = module
            .run(Uuid::new_v4(), Arc::new(LocalShell::default()), ParameterSet::new())
            .unwrap();
        let result = task.await;
        assert_eq!(result.exit_status, 2);
        assert_eq!(result.first_error(), "broken");
    }
}
