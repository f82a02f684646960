//! Process backend: one scratch directory per sandbox, one child process per invocation.
//!
//! The artifact `image` names a directory holding the function's code. Each sandbox gets a
//! private scratch directory that becomes the working directory, `HOME` and `TMPDIR` of every
//! exec, so state written by one invocation is visible to the next one on the same sandbox and
//! to nothing else. The environment is cleared except for `PATH`, the function's `env` and the
//! `FNEXEC_*` variables. Processes an exec forks are killed with it when it ends, so destroying
//! a sandbox only has its scratch directory left to remove.

use super::{
    DriverError, ENV_FUNCTION_ID, ENV_SANDBOX_ID, ExecOutcome, SandboxDriver, SandboxHandle,
    child, interpret_output,
};
use crate::config::DriverConfig;
use crate::types::{FunctionSpec, SandboxId};
use async_trait::async_trait;
use fnexec_common::StateMachine;
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Directory holding the function's code, exposed to every exec.
pub const ENV_ARTIFACT_DIR: &str = "FNEXEC_ARTIFACT_DIR";

pub struct ProcessDriver {
    config: DriverConfig,
    scratch: StateMachine<HashMap<SandboxId, TempDir>>,
}

impl ProcessDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            scratch: StateMachine::default(),
        }
    }

    fn scratch_dir(&self, id: &SandboxId) -> Option<PathBuf> {
        self.scratch
            .read(|dirs| dirs.get(id).map(|dir| dir.path().to_path_buf()))
    }

    fn build_command(
        &self,
        handle: &SandboxHandle,
        spec: &FunctionSpec,
        artifact_dir: &Path,
        scratch: &Path,
    ) -> Result<Command, DriverError> {
        let (program, args) = spec
            .artifact
            .command
            .split_first()
            .ok_or_else(|| DriverError::Provision(format!("function '{}' has no command", spec.id)))?;

        let program_path = Path::new(program);
        let program = if program_path.is_relative() && program.contains('/') {
            artifact_dir.join(program_path)
        } else {
            program_path.to_path_buf()
        };

        let mut command = Command::new(program);
        command.args(args).current_dir(scratch).env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
            .envs(&spec.env)
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env(ENV_ARTIFACT_DIR, artifact_dir)
            .env(ENV_FUNCTION_ID, spec.id.as_str())
            .env(ENV_SANDBOX_ID, handle.id().as_str());
        Ok(command)
    }
}

#[async_trait]
impl SandboxDriver for ProcessDriver {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(level = "debug", skip_all, fields(function = %spec.id))]
    async fn create(&self, spec: &FunctionSpec) -> Result<SandboxHandle, DriverError> {
        let artifact_dir = Path::new(&spec.artifact.image);
        let metadata = tokio::fs::metadata(artifact_dir).await.map_err(|e| {
            DriverError::Provision(format!(
                "artifact directory '{}' is not accessible: {e}",
                artifact_dir.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(DriverError::Provision(format!(
                "artifact '{}' is not a directory",
                artifact_dir.display()
            )));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("fnexec-");
        let dir = match &self.config.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| DriverError::Provision(format!("failed to create scratch directory: {e}")))?;

        let id = SandboxId::next();
        let handle = SandboxHandle::new(id.clone(), spec.id.clone(), dir.path().display().to_string());
        debug!("created scratch sandbox {} at {}", id, handle.backend_ref());
        self.scratch.transition(|dirs| {
            dirs.insert(id, dir);
        });
        Ok(handle)
    }

    #[instrument(level = "debug", skip_all, fields(sandbox = %handle.id()))]
    async fn exec(
        &self,
        handle: &SandboxHandle,
        spec: &FunctionSpec,
        input: &Value,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, DriverError> {
        let scratch = self
            .scratch_dir(handle.id())
            .ok_or_else(|| DriverError::Gone(handle.id().clone()))?;
        let artifact_dir = std::path::absolute(&spec.artifact.image)?;
        let command = self.build_command(handle, spec, &artifact_dir, &scratch)?;
        let input = serde_json::to_vec(input).map_err(std::io::Error::from)?;

        match child::run_with_input(command, input, self.config.max_output_bytes, &cancel).await {
            Ok(output) => Ok(interpret_output(&output, self.config.max_output_bytes)),
            // The artifact's own entry point is missing; the sandbox itself is fine.
            Err(DriverError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ExecOutcome::UserFault {
                    message: format!(
                        "entry point '{}' not found",
                        spec.artifact.command.first().map(String::as_str).unwrap_or("")
                    ),
                    exit_code: Some(127),
                    signal: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), DriverError> {
        let removed = self.scratch.transition(|dirs| dirs.remove(handle.id()));
        if let Some(dir) = removed {
            debug!("removing scratch sandbox {}", handle.id());
            let path = dir.path().to_path_buf();
            tokio::task::spawn_blocking(move || dir.close())
                .await
                .map_err(|e| DriverError::Crashed(format!("scratch cleanup task failed: {e}")))?
                .map_err(|e| {
                    DriverError::Io(std::io::Error::new(
                        e.kind(),
                        format!("failed to remove {}: {e}", path.display()),
                    ))
                })?;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::ArtifactRef;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn driver(root: &TempDir) -> ProcessDriver {
        ProcessDriver::new(DriverConfig {
            scratch_root: Some(root.path().to_path_buf()),
            ..DriverConfig::default()
        })
    }

    fn sh_spec(artifact: &TempDir, script: &str) -> FunctionSpec {
        FunctionSpec::new(
            "sh-fn",
            ArtifactRef::new(
                artifact.path().display().to_string(),
                vec!["sh".into(), "-c".into(), script.into()],
            ),
        )
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(&artifact, "cat");

        let handle = driver.create(&spec).await.unwrap();
        let out = driver
            .exec(&handle, &spec, &json!({"n": 3}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, ExecOutcome::Success(json!({"n": 3})));
        driver.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_environment_is_cleared_and_tagged() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(
            &artifact,
            r#"printf '{"fn":"%s","sbx":"%s","greeting":"%s","user":"%s"}' "$FNEXEC_FUNCTION_ID" "$FNEXEC_SANDBOX_ID" "$GREETING" "$USER""#,
        )
        .with_env("GREETING", "hi");

        let handle = driver.create(&spec).await.unwrap();
        let out = driver
            .exec(&handle, &spec, &Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            out,
            ExecOutcome::Success(json!({
                "fn": "sh-fn",
                "sbx": handle.id().as_str(),
                "greeting": "hi",
                "user": "",
            }))
        );
    }

    #[tokio::test]
    async fn test_scratch_persists_between_execs_on_same_sandbox() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(
            &artifact,
            "n=$(cat count 2>/dev/null || echo 0); n=$((n+1)); echo $n > count; echo $n",
        );

        let first = driver.create(&spec).await.unwrap();
        let second = driver.create(&spec).await.unwrap();
        for expected in [1, 2] {
            let out = driver
                .exec(&first, &spec, &Value::Null, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(out, ExecOutcome::Success(json!(expected)));
        }
        let out = driver
            .exec(&second, &spec, &Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, ExecOutcome::Success(json!(1)));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_user_fault() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(&artifact, "echo 'boom' >&2; exit 1");

        let handle = driver.create(&spec).await.unwrap();
        let out = driver
            .exec(&handle, &spec, &Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            out,
            ExecOutcome::UserFault {
                message: "boom".into(),
                exit_code: Some(1),
                signal: None,
            }
        );
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_user_fault() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = FunctionSpec::new(
            "missing",
            ArtifactRef::new(
                artifact.path().display().to_string(),
                vec!["./no-such-entry".into()],
            ),
        );

        let handle = driver.create(&spec).await.unwrap();
        let out = driver
            .exec(&handle, &spec, &Value::Null, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            out,
            ExecOutcome::UserFault {
                exit_code: Some(127),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_exec() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(&artifact, "sleep 30");
        let handle = driver.create(&spec).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = driver.exec(&handle, &spec, &Value::Null, cancel).await;
        assert!(matches!(result, Err(DriverError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_artifact_dir_is_provision_error() {
        let root = TempDir::new().unwrap();
        let driver = driver(&root);
        let spec = FunctionSpec::new(
            "ghost",
            ArtifactRef::new("/definitely/not/a/dir", vec!["cat".into()]),
        );
        assert!(matches!(
            driver.create(&spec).await,
            Err(DriverError::Provision(_))
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_removes_scratch() {
        let (root, artifact) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let driver = driver(&root);
        let spec = sh_spec(&artifact, "cat");
        let handle = driver.create(&spec).await.unwrap();
        let scratch = PathBuf::from(handle.backend_ref());
        assert!(scratch.exists());

        driver.destroy(&handle).await.unwrap();
        driver.destroy(&handle).await.unwrap();
        assert!(!scratch.exists());

        let result = driver
            .exec(&handle, &spec, &Value::Null, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(DriverError::Gone(_))));
    }
}
