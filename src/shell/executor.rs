//! Shell command execution with registry-backed lifecycle control.
//!
//! Commands run through `bash -c`, so this layer trusts its callers: it
//! is the execution surface behind an authorization boundary, not a
//! general-purpose safe API for untrusted command strings.
//!
//! `execute` blocks its caller until the child exits or the deadline
//! elapses. The handle is registered before the wait begins, so `status`,
//! `send_input`, and `kill` on the same id work while the command is
//! still running.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::{ProcessHandle, ProcessRegistry};
use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// Result of one execution, completed or failed.
///
/// Spawn failures and timeouts land here as structured fields rather than
/// faults, so batch callers can render an error row without exception
/// handling.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub process_id: String,
    pub output: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Clone)]
pub struct ShellExecutor {
    registry: ProcessRegistry,
    shell: String,
    default_timeout: Duration,
    kill_grace: Duration,
    max_output_bytes: usize,
}

enum ExitKind {
    /// Child exited on its own.
    Natural(i32),
    /// Child was terminated after a kill request.
    Killed(i32),
    /// Child hit the execution deadline and was killed.
    DeadlineElapsed,
    /// Waiting on the child failed.
    WaitFailed(String),
}

impl ShellExecutor {
    pub fn new(config: &SandboxConfig, registry: ProcessRegistry) -> Self {
        Self {
            registry,
            shell: config.shell.clone(),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Spawn `command` through the shell and wait for it to finish.
    ///
    /// The returned outcome carries captured stdout as `output`; `error`
    /// holds captured stderr, or the timeout/kill/spawn message when one
    /// of those paths fired.
    pub async fn execute(&self, command: &str, timeout_secs: Option<u64>) -> ExecOutcome {
        let process_id = Uuid::new_v4().to_string();
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(id = %process_id, %command, timeout_secs = timeout.as_secs(), "spawning command");

        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(id = %process_id, error = %e, "failed to spawn command");
                return ExecOutcome {
                    process_id,
                    output: String::new(),
                    exit_code: -1,
                    error: Some(format!("failed to spawn command: {e}")),
                };
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let handle = ProcessHandle::new(process_id.clone(), pid, stdin, self.max_output_bytes);
        self.registry.insert(Arc::clone(&handle));

        let stdout_task = spawn_capture(stdout, Arc::clone(&handle), OutputStream::Stdout);
        let stderr_task = spawn_capture(stderr, Arc::clone(&handle), OutputStream::Stderr);

        let exit = self.supervise(&mut child, &handle, timeout).await;

        // Close our side of stdin so later input attempts fail cleanly
        // instead of writing into a dead pipe.
        handle.stdin.lock().await.take();

        // Let the capture tasks drain the pipes to EOF before reading the
        // buffers.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let (exit_code, error) = match exit {
            ExitKind::Natural(code) => (code, None),
            ExitKind::Killed(code) => (code, Some("process terminated by kill request".to_string())),
            ExitKind::DeadlineElapsed => (
                -1,
                Some(
                    SandboxError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                    .to_string(),
                ),
            ),
            ExitKind::WaitFailed(reason) => (-1, Some(reason)),
        };

        handle.set_exit(exit_code);
        debug!(id = %process_id, exit_code, "command finished");

        let (output, stderr_text) = {
            let captured = handle.output.lock().expect("output buffer lock poisoned");
            (
                captured.stdout.to_display_string(),
                captured.stderr.to_display_string(),
            )
        };

        // Stderr only fills the error slot when nothing more urgent
        // (timeout, kill, wait failure) claimed it.
        let error = error.or_else(|| {
            if stderr_text.is_empty() {
                None
            } else {
                Some(stderr_text)
            }
        });

        ExecOutcome {
            process_id,
            output,
            exit_code,
            error,
        }
    }

    /// Wait for natural exit, a kill request, or the deadline, whichever
    /// comes first.
    async fn supervise(
        &self,
        child: &mut Child,
        handle: &ProcessHandle,
        timeout: Duration,
    ) -> ExitKind {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitKind::Natural(status.code().unwrap_or(-1)),
                Err(e) => ExitKind::WaitFailed(format!("wait on child failed: {e}")),
            },
            _ = handle.kill_requested() => {
                debug!(id = %handle.id, "kill requested, terminating child");
                ExitKind::Killed(self.terminate(child, handle.pid).await)
            }
            _ = &mut deadline => {
                warn!(id = %handle.id, timeout_secs = timeout.as_secs(), "deadline elapsed, killing child");
                let _ = child.start_kill();
                reap(child).await;
                ExitKind::DeadlineElapsed
            }
        }
    }

    /// Graceful termination: SIGTERM, a bounded grace period, then
    /// SIGKILL.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> i32 {
        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(Ok(status)) => return status.code().unwrap_or(-1),
                Ok(Err(_)) => return -1,
                Err(_) => {
                    debug!(pid, "child ignored SIGTERM, escalating to SIGKILL");
                }
            }
        }

        let _ = child.start_kill();
        reap(child).await
    }

    /// Report the current lifecycle state of a tracked process.
    pub fn status(&self, id: &str) -> StatusReport {
        match self.registry.get(id) {
            None => StatusReport {
                status: ProcessStatus::NotFound,
                exit_code: None,
            },
            Some(handle) => match handle.exit_code() {
                None => StatusReport {
                    status: ProcessStatus::Running,
                    exit_code: None,
                },
                Some(code) => StatusReport {
                    status: ProcessStatus::Completed,
                    exit_code: Some(code),
                },
            },
        }
    }

    /// Write `data` plus a newline to the process's stdin and flush.
    pub async fn send_input(&self, id: &str, data: &str) -> Result<(), SandboxError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| SandboxError::ProcessNotFound { id: id.to_string() })?;

        let mut stdin = handle.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| SandboxError::ProcessNotAcceptingInput { id: id.to_string() })?;

        let line = format!("{data}\n");
        match write_line(pipe, &line).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // The child went away under us. Drop the pipe so the next
                // caller gets the typed rejection without a write attempt.
                stdin.take();
                Err(SandboxError::ProcessNotAcceptingInput { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Terminate a tracked process, wait until it has actually exited,
    /// then drop it from the registry.
    ///
    /// Of two concurrent kills on the same id, exactly one wins the
    /// registry removal; the other observes `ProcessNotFound`. If the
    /// exit cannot be confirmed within the bound, the handle stays
    /// registered and the failure is reported for retry.
    pub async fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| SandboxError::ProcessNotFound { id: id.to_string() })?;

        handle.request_kill();

        let bound = self.kill_grace + Duration::from_secs(5);
        match tokio::time::timeout(bound, handle.wait_exit()).await {
            Ok(_) => {
                if self.registry.remove(id).is_some() {
                    debug!(id, "process killed and removed from registry");
                    Ok(())
                } else {
                    Err(SandboxError::ProcessNotFound { id: id.to_string() })
                }
            }
            Err(_) => Err(SandboxError::TerminationFailure {
                id: id.to_string(),
                reason: format!("process still running after {}s", bound.as_secs()),
            }),
        }
    }
}

enum OutputStream {
    Stdout,
    Stderr,
}

/// Drain one child pipe into the handle's capped buffer.
fn spawn_capture<R>(
    reader: Option<R>,
    handle: Arc<ProcessHandle>,
    stream: OutputStream,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut captured = handle.output.lock().expect("output buffer lock poisoned");
                    match stream {
                        OutputStream::Stdout => captured.stdout.extend(&chunk[..n]),
                        OutputStream::Stderr => captured.stderr.extend(&chunk[..n]),
                    }
                }
            }
        }
    })
}

async fn write_line(pipe: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await
}

/// Wait for an already-signaled child, mapping failures to -1.
async fn reap(child: &mut Child) -> i32 {
    match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ShellExecutor {
        ShellExecutor::new(&SandboxConfig::default(), ProcessRegistry::new())
    }

    fn executor_with(config: SandboxConfig) -> ShellExecutor {
        ShellExecutor::new(&config, ProcessRegistry::new())
    }

    /// Poll the registry until the spawned process shows up.
    async fn wait_for_id(executor: &ShellExecutor) -> String {
        for _ in 0..200 {
            if let Some(id) = executor.registry().ids().pop() {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process never appeared in the registry");
    }

    #[tokio::test]
    async fn echo_completes_with_captured_output() {
        let executor = executor();
        let outcome = executor.execute("echo hi", None).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "hi\n");
        assert!(outcome.error.is_none());

        let report = executor.status(&outcome.process_id);
        assert_eq!(report.status, ProcessStatus::Completed);
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn stderr_is_reported_in_the_error_slot() {
        let executor = executor();
        let outcome = executor.execute("echo oops >&2; exit 3", None).await;

        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.output, "");
        assert_eq!(outcome.error.as_deref(), Some("oops\n"));
    }

    #[tokio::test]
    async fn status_of_unknown_id_is_not_found() {
        let executor = executor();
        let report = executor.status("no-such-id");
        assert_eq!(report.status, ProcessStatus::NotFound);
        assert!(report.exit_code.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_structured_result() {
        let config = SandboxConfig {
            shell: "/nonexistent/shell".to_string(),
            ..SandboxConfig::default()
        };
        let executor = executor_with(config);
        let outcome = executor.execute("echo hi", None).await;

        assert_eq!(outcome.exit_code, -1);
        assert_eq!(outcome.output, "");
        assert!(outcome.error.unwrap().contains("failed to spawn"));
        // The id was never live, so it is not registered.
        assert!(executor.registry().is_empty());
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let executor = executor();
        let start = std::time::Instant::now();
        let outcome = executor.execute("sleep 30", Some(1)).await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.error.unwrap().contains("timed out after 1s"));

        // The handle is retained: the timed-out command stays queryable.
        let report = executor.status(&outcome.process_id);
        assert_eq!(report.status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn output_is_capped_with_truncation_marker() {
        let config = SandboxConfig {
            max_output_bytes: 64,
            ..SandboxConfig::default()
        };
        let executor = executor_with(config);
        let outcome = executor
            .execute("for i in $(seq 1 100); do echo chatty-line-$i; done", None)
            .await;

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("[output truncated"));
    }

    #[tokio::test]
    async fn input_reaches_a_running_process() {
        let executor = executor();
        let background = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute("head -n 1", None).await })
        };

        let id = wait_for_id(&executor).await;
        assert_eq!(executor.status(&id).status, ProcessStatus::Running);

        executor.send_input(&id, "hello").await.unwrap();

        let outcome = background.await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "hello\n");
    }

    #[tokio::test]
    async fn input_after_natural_exit_is_rejected() {
        let executor = executor();
        let outcome = executor.execute("true", None).await;

        let err = executor
            .send_input(&outcome.process_id, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ProcessNotAcceptingInput { .. }));
    }

    #[tokio::test]
    async fn input_to_unknown_process_is_rejected() {
        let executor = executor();
        let err = executor.send_input("ghost", "data").await.unwrap_err();
        assert!(matches!(err, SandboxError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn kill_removes_a_running_process() {
        let executor = executor();
        let background = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute("sleep 30", None).await })
        };

        let id = wait_for_id(&executor).await;
        assert_eq!(executor.status(&id).status, ProcessStatus::Running);

        executor.kill(&id).await.unwrap();

        // The registry no longer resolves the id.
        assert_eq!(executor.status(&id).status, ProcessStatus::NotFound);

        let outcome = background.await.unwrap();
        assert!(outcome.error.unwrap().contains("terminated by kill"));
    }

    #[tokio::test]
    async fn kill_unknown_id_is_rejected() {
        let executor = executor();
        let err = executor.kill("never-issued").await.unwrap_err();
        assert!(matches!(err, SandboxError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_kills_resolve_to_one_winner() {
        let executor = executor();
        let background = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute("sleep 30", None).await })
        };

        let id = wait_for_id(&executor).await;
        let (first, second) = tokio::join!(executor.kill(&id), executor.kill(&id));

        let outcomes = [first, second];
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        let misses = outcomes
            .iter()
            .filter(|r| matches!(r, Err(SandboxError::ProcessNotFound { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(misses, 1);

        let _ = background.await;
    }
}
