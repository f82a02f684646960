//! Container backend driven through the `docker` CLI.
//!
//! Each sandbox is a long-lived container kept alive with `sleep infinity`; every invocation is
//! a `docker exec -i` of the function's entry command with the event on stdin. Memory and CPU
//! limits are set on the container, so an out-of-memory kill surfaces as exit 137 of the exec.
//! The gVisor variant is the same driver with `--runtime runsc`.

use super::{
    DriverError, ENV_FUNCTION_ID, ENV_SANDBOX_ID, ExecOutcome, SandboxDriver, SandboxHandle,
    child, interpret_output,
};
use crate::config::ContainerConfig;
use crate::types::{FunctionSpec, SandboxId};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Exit status docker itself uses when it could not run the requested command.
const DOCKER_DAEMON_EXIT: i32 = 125;
/// SIGKILL exit status, reported by the runtime when the cgroup memory limit is hit.
const OOM_KILL_EXIT: i32 = 137;

/// Messages the docker client prints when the container went away under an exec. A function can
/// print these too, so they only count once the container is confirmed not running.
const DAEMON_ERROR_MARKERS: &[&str] = &[
    "Error response from daemon",
    "No such container",
    "is not running",
    "Cannot connect to the Docker daemon",
];

/// How a [`ContainerDriver`] talks to its container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub binary: String,
    /// OCI runtime passed as `--runtime`; `None` keeps the daemon default.
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub allow_freeze: bool,
}

impl ContainerSettings {
    pub fn docker(config: &ContainerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            runtime: None,
            network: config.network.clone(),
            allow_freeze: config.allow_freeze,
        }
    }

    pub fn gvisor(config: &ContainerConfig) -> Self {
        Self {
            runtime: Some(config.gvisor_runtime.clone()),
            ..Self::docker(config)
        }
    }
}

pub struct ContainerDriver {
    settings: ContainerSettings,
    max_output_bytes: usize,
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn container_name(spec: &FunctionSpec, id: &SandboxId) -> String {
    let function: String = spec
        .id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("fnexec-{function}-{id}")
}

fn run_args(settings: &ContainerSettings, spec: &FunctionSpec, name: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        format!("fnexec.function={}", spec.id),
        "--memory".to_string(),
        format!("{}m", spec.limits.memory_mb),
        "--memory-swap".to_string(),
        format!("{}m", spec.limits.memory_mb),
        "--cpu-shares".to_string(),
        spec.limits.cpu_shares.to_string(),
    ];
    if let Some(runtime) = &settings.runtime {
        args.push("--runtime".to_string());
        args.push(runtime.clone());
    }
    if let Some(network) = &settings.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.extend([
        "--entrypoint".to_string(),
        "sleep".to_string(),
        spec.artifact.image.clone(),
        "infinity".to_string(),
    ]);
    args
}

fn exec_args(handle: &SandboxHandle, spec: &FunctionSpec) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-i".to_string(),
        "--env".to_string(),
        format!("{ENV_FUNCTION_ID}={}", spec.id),
        "--env".to_string(),
        format!("{ENV_SANDBOX_ID}={}", handle.id()),
        handle.backend_ref().to_string(),
    ];
    args.extend(spec.artifact.command.iter().cloned());
    args
}

fn mentions_daemon_error(output: &child::ChildOutput) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    DAEMON_ERROR_MARKERS.iter().any(|m| stderr.contains(m))
}

impl ContainerDriver {
    pub fn new(settings: ContainerSettings, max_output_bytes: usize) -> Self {
        Self {
            settings,
            max_output_bytes,
        }
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.settings.binary);
        command.kill_on_drop(true);
        command
    }

    /// Run a short management command (`rm`, `pause`, ...) and return its stdout.
    async fn manage(&self, args: &[&str]) -> Result<String, DriverError> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DriverError::Provision(format!("failed to run '{}': {e}", self.settings.binary))
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(DriverError::Crashed(format!(
                "'{} {}' failed: {}",
                self.settings.binary,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn classify_exec(&self, output: &child::ChildOutput, spec: &FunctionSpec) -> Result<ExecOutcome, DriverError> {
        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(DOCKER_DAEMON_EXIT) => Err(DriverError::Crashed(format!(
                "container runtime failed: {}",
                stderr.trim()
            ))),
            Some(OOM_KILL_EXIT) => Ok(ExecOutcome::UserFault {
                message: format!(
                    "killed: out of memory (limit {} MiB)",
                    spec.limits.memory_mb
                ),
                exit_code: Some(OOM_KILL_EXIT),
                signal: Some(9),
            }),
            _ => Ok(interpret_output(output, self.max_output_bytes)),
        }
    }

    async fn is_running(&self, handle: &SandboxHandle) -> bool {
        match self
            .manage(&["inspect", "-f", "{{.State.Running}}", handle.backend_ref()])
            .await
        {
            Ok(state) => state == "true",
            Err(e) => {
                debug!("inspect of {} failed: {}", handle.backend_ref(), e);
                false
            }
        }
    }
}

/// A failed exec whose client reported a daemon error is a crash only if the container is gone.
fn lost_container(
    outcome: ExecOutcome,
    output: &child::ChildOutput,
    container_running: bool,
) -> Result<ExecOutcome, DriverError> {
    if !container_running {
        return Err(DriverError::Crashed(format!(
            "container is no longer running: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(outcome)
}

#[async_trait]
impl SandboxDriver for ContainerDriver {
    fn name(&self) -> &'static str {
        if self.settings.runtime.is_some() {
            "gvisor"
        } else {
            "docker"
        }
    }

    #[instrument(level = "debug", skip_all, fields(function = %spec.id))]
    async fn create(&self, spec: &FunctionSpec) -> Result<SandboxHandle, DriverError> {
        let id = SandboxId::next();
        let name = container_name(spec, &id);
        let args = run_args(&self.settings, spec, &name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let container_id = self.manage(&arg_refs).await.map_err(|e| match e {
            DriverError::Crashed(msg) => DriverError::Provision(msg),
            other => other,
        })?;
        debug!("started container {} ({})", name, container_id);
        Ok(SandboxHandle::new(id, spec.id.clone(), name))
    }

    #[instrument(level = "debug", skip_all, fields(sandbox = %handle.id()))]
    async fn exec(
        &self,
        handle: &SandboxHandle,
        spec: &FunctionSpec,
        input: &Value,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, DriverError> {
        let mut command = self.command();
        command.args(exec_args(handle, spec));
        let input = serde_json::to_vec(input).map_err(std::io::Error::from)?;

        // Cancelling kills the `docker exec` client; the caller destroys the container, which
        // takes the function process with it.
        let output = child::run_with_input(command, input, self.max_output_bytes, &cancel).await?;
        let outcome = self.classify_exec(&output, spec)?;
        if matches!(outcome, ExecOutcome::UserFault { .. }) && mentions_daemon_error(&output) {
            let running = self.is_running(handle).await;
            return lost_container(outcome, &output, running);
        }
        Ok(outcome)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        match self.manage(&["rm", "-f", handle.backend_ref()]).await {
            Ok(_) => Ok(()),
            Err(DriverError::Crashed(msg)) if msg.contains("No such container") => Ok(()),
            Err(e) => {
                warn!("failed to remove container {}: {}", handle.backend_ref(), e);
                Err(e)
            }
        }
    }

    fn supports_freeze(&self) -> bool {
        self.settings.allow_freeze
    }

    async fn freeze(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        if !self.settings.allow_freeze {
            return Err(DriverError::Unsupported("freeze"));
        }
        self.manage(&["pause", handle.backend_ref()]).await.map(|_| ())
    }

    async fn resume(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        if !self.settings.allow_freeze {
            return Err(DriverError::Unsupported("resume"));
        }
        self.manage(&["unpause", handle.backend_ref()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtifactRef;

    fn spec() -> FunctionSpec {
        FunctionSpec::new(
            "hello/world",
            ArtifactRef::new(
                "my-python-base",
                vec!["python".into(), "function.py".into()],
            ),
        )
        .with_env("GREETING", "hi")
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let id = SandboxId::next();
        let name = container_name(&spec(), &id);
        assert_eq!(name, format!("fnexec-hello_world-{id}"));
    }

    #[test]
    fn test_run_args_carry_limits_and_env() {
        let settings = ContainerSettings::docker(&ContainerConfig::default());
        let args = run_args(&settings, &spec(), "ctr");

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--memory") + 1], "128m");
        assert_eq!(args[pos("--cpu-shares") + 1], "1024");
        assert_eq!(args[pos("--env") + 1], "GREETING=hi");
        assert_eq!(args[pos("--network") + 1], "none");
        assert!(!args.contains(&"--runtime".to_string()));
        assert_eq!(&args[args.len() - 2..], ["my-python-base", "infinity"]);
    }

    #[test]
    fn test_gvisor_sets_runtime() {
        let settings = ContainerSettings::gvisor(&ContainerConfig::default());
        let args = run_args(&settings, &spec(), "ctr");
        let pos = args.iter().position(|a| a == "--runtime").unwrap();
        assert_eq!(args[pos + 1], "runsc");
        assert_eq!(ContainerDriver::new(settings, 1024).name(), "gvisor");
    }

    #[test]
    fn test_exec_args_append_entry_command() {
        let handle = SandboxHandle::new(SandboxId::next(), "hello/world".into(), "ctr-1");
        let args = exec_args(&handle, &spec());
        assert_eq!(&args[..2], ["exec", "-i"]);
        assert!(args.contains(&format!("{ENV_SANDBOX_ID}={}", handle.id())));
        assert_eq!(&args[args.len() - 3..], ["ctr-1", "python", "function.py"]);
    }

    #[cfg(unix)]
    mod exit_classification {
        use super::*;
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        fn output(code: i32, stderr: &str) -> child::ChildOutput {
            child::ChildOutput {
                status: ExitStatus::from_raw(code << 8),
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
                stdout_truncated: false,
            }
        }

        fn driver() -> ContainerDriver {
            ContainerDriver::new(ContainerSettings::docker(&ContainerConfig::default()), 1024)
        }

        #[test]
        fn test_oom_is_user_fault() {
            let out = driver().classify_exec(&output(137, ""), &spec()).unwrap();
            assert_eq!(
                out,
                ExecOutcome::UserFault {
                    message: "killed: out of memory (limit 128 MiB)".into(),
                    exit_code: Some(137),
                    signal: Some(9),
                }
            );
        }

        #[test]
        fn test_runtime_exit_is_crash() {
            assert!(matches!(
                driver().classify_exec(&output(125, "docker: bad flag"), &spec()),
                Err(DriverError::Crashed(_))
            ));
        }

        #[test]
        fn test_daemon_message_from_function_stays_user_fault() {
            let out = output(1, "RuntimeError: upstream service is not running");
            assert!(mentions_daemon_error(&out));

            let classified = driver().classify_exec(&out, &spec()).unwrap();
            let kept = lost_container(classified, &out, true).unwrap();
            assert_eq!(
                kept,
                ExecOutcome::UserFault {
                    message: "RuntimeError: upstream service is not running".into(),
                    exit_code: Some(1),
                    signal: None,
                }
            );
        }

        #[test]
        fn test_daemon_message_with_container_gone_is_crash() {
            let out = output(1, "Error response from daemon: No such container: ctr-1");
            let classified = driver().classify_exec(&out, &spec()).unwrap();
            assert!(matches!(
                lost_container(classified, &out, false),
                Err(DriverError::Crashed(_))
            ));
        }

        #[test]
        fn test_function_exit_is_user_fault() {
            let out = driver()
                .classify_exec(&output(1, "ValueError: nope"), &spec())
                .unwrap();
            assert!(matches!(
                out,
                ExecOutcome::UserFault {
                    exit_code: Some(1),
                    ..
                }
            ));
        }
    }
}
