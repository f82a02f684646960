//! Running one entry-point process with piped I/O, capped capture and cancellation.
//!
//! Every exec runs as the leader of its own process group. Whatever the entry point forks
//! belongs to that group and is killed with it: on cancellation, as soon as the entry point
//! exits, and when the exec future is dropped.

use super::DriverError;
use std::process::{ExitStatus, Stdio};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

/// The process group of one running exec. Dropping it kills every remaining member.
struct ProcessGroup {
    #[cfg(unix)]
    leader: Option<nix::unistd::Pid>,
}

impl ProcessGroup {
    #[cfg_attr(not(unix), allow(unused_variables))]
    fn of(child: &Child) -> Self {
        Self {
            #[cfg(unix)]
            leader: child
                .id()
                .map(|pid| nix::unistd::Pid::from_raw(pid as i32)),
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(leader) = self.leader.take() {
            use nix::{
                errno::Errno,
                sys::signal::{Signal, killpg},
            };
            match killpg(leader, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!("failed to kill process group {}: {}", leader, e),
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug)]
pub(crate) struct ChildOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
}

/// Read a stream to EOF, keeping at most `limit` bytes. The rest is drained so the child
/// never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((kept, truncated))
}

/// Spawn `command`, feed it `input` on stdin and wait for it to exit.
///
/// If `cancel` fires first the whole process group is killed and the child reaped before
/// `DriverError::Cancelled` is returned. Once the entry point exits, processes it left behind
/// are killed so they cannot hold its output pipes open.
pub(crate) async fn run_with_input(
    mut command: Command,
    input: Vec<u8>,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> Result<ChildOutput, DriverError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let mut group = ProcessGroup::of(&child);

    let mut stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Failed to get stdin")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Failed to get stdout")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Failed to get stderr")
    })?;

    let writer = tokio::spawn(async move {
        // The function may exit without reading its input; a broken pipe is not an error.
        if let Err(e) = stdin.write_all(&input).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            tracing::debug!("failed to write function input: {}", e);
        }
        let _ = stdin.shutdown().await;
    });
    let stdout_reader = tokio::spawn(read_capped(stdout, max_output_bytes));
    let stderr_reader = tokio::spawn(read_capped(stderr, max_output_bytes));
    let io_tasks = [
        writer.abort_handle(),
        stdout_reader.abort_handle(),
        stderr_reader.abort_handle(),
    ];

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            tracing::debug!("cancellation requested, killing process group of pid {:?}", child.id());
            group.kill();
            io_tasks.iter().for_each(|task| task.abort());
            child.kill().await?;
            return Err(DriverError::Cancelled);
        }
    };
    group.kill();

    // A descendant that left the group can still hold a pipe open.
    let drain = async {
        let _ = writer.await;
        let stdout = stdout_reader
            .await
            .map_err(|e| DriverError::Crashed(format!("stdout reader failed: {e}")))??;
        let stderr = stderr_reader
            .await
            .map_err(|e| DriverError::Crashed(format!("stderr reader failed: {e}")))??;
        Ok::<_, DriverError>((stdout, stderr))
    };
    let ((stdout, stdout_truncated), (stderr, _)) = tokio::select! {
        drained = drain => drained?,
        _ = cancel.cancelled() => {
            tracing::debug!("cancellation requested while draining output");
            io_tasks.iter().for_each(|task| task.abort());
            return Err(DriverError::Cancelled);
        }
    };

    Ok(ChildOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_echoes_stdin() {
        let out = run_with_input(
            sh("cat"),
            b"{\"n\":1}".to_vec(),
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"{\"n\":1}");
        assert!(!out.stdout_truncated);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let out = run_with_input(
            sh("head -c 5000 /dev/zero"),
            Vec::new(),
            100,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 100);
        assert!(out.stdout_truncated);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = run_with_input(sh("sleep 30"), Vec::new(), 1024, &cancel).await;
        assert!(matches!(result, Err(DriverError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_output_open() {
        let started = Instant::now();
        let out = run_with_input(
            sh(r#"sleep 30 & echo '{"ok":1}'"#),
            Vec::new(),
            1024,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"{\"ok\":1}\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Zombies still waiting to be reaped count as gone.
    #[cfg(target_os = "linux")]
    async fn exited_within(pid: i32, limit: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < limit {
            let running = std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| {
                    stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next())
                        != Some("Z")
                })
                .unwrap_or(false);
            if !running {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn background_sleeper(pid_file: &std::path::Path) -> Command {
        sh(&format!(
            "sleep 37 & echo $! > '{}'; wait",
            pid_file.display()
        ))
    }

    #[cfg(target_os = "linux")]
    fn read_pid(pid_file: &std::path::Path) -> i32 {
        std::fs::read_to_string(pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_descendants() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let result = run_with_input(background_sleeper(&pid_file), Vec::new(), 1024, &cancel).await;
        assert!(matches!(result, Err(DriverError::Cancelled)));
        assert!(exited_within(read_pid(&pid_file), Duration::from_secs(2)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_exec_kills_descendants() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("sleeper.pid");
        let cancel = CancellationToken::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            run_with_input(background_sleeper(&pid_file), Vec::new(), 1024, &cancel),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(exited_within(read_pid(&pid_file), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let result = run_with_input(
            Command::new("/definitely/not/here"),
            Vec::new(),
            1024,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(DriverError::Io(_))));
    }
}
