//! Subprocess execution supervisor for the sandbox service.
//!
//! Runs a snippet of Python code in a fresh interpreter process, enforces a
//! wall-clock budget, and normalizes whatever happened (clean exit, non-zero
//! exit, signal death, forced kill, failed launch) into a single flat
//! [`ExecutionOutcome`]. The supervisor is total: it never returns an error
//! to its caller, and it never leaves a child process behind.

use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interpreter binary resolved from PATH at spawn time.
const INTERPRETER: &str = "python3";

/// Wall-clock budget applied to every execution by the HTTP layer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalized result of one execution attempt.
///
/// Serialized verbatim as the `/execute` response body. `timed_out == true`
/// always implies `exit_code == -1`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    /// Everything the child wrote to stdout up to termination.
    pub stdout: String,
    /// Everything the child wrote to stderr. On timeout a marker line is
    /// appended after any real captured error text.
    pub stderr: String,
    /// The child's real exit status, or -1 when no numeric status exists
    /// (killed on timeout, died by signal, or never launched).
    pub exit_code: i32,
    /// True iff the supervisor killed the child because the deadline elapsed.
    pub timed_out: bool,
}

#[derive(Debug, Error)]
enum SuperviseError {
    #[error("Failed to launch interpreter '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("Failed to supervise interpreter: {source}")]
    Wait { source: std::io::Error },
}

/// How the child process ended. Exactly one variant explains any outcome;
/// the flat wire shape is produced in one place by [`finalize`].
enum ProcessEnd {
    Completed(std::process::ExitStatus),
    Killed,
    LaunchFailed(SuperviseError),
}

/// Execute `code` in a fresh interpreter process with a wall-clock budget.
///
/// The code travels as a single argv element (`python3 -c <code>`) with no
/// shell in between, so arbitrary multi-line and quoted text passes through
/// unmodified. Stdin is closed; the child can never block waiting for input.
///
/// Exactly one child process is created per call and it is always reaped
/// before this function returns, including on the timeout path.
pub async fn execute(code: &str, timeout: Duration) -> ExecutionOutcome {
    execute_with_program(INTERPRETER, code, timeout).await
}

async fn execute_with_program(program: &str, code: &str, timeout: Duration) -> ExecutionOutcome {
    let spawned = Command::new(program)
        .arg("-c")
        .arg(code)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            let error = SuperviseError::Launch {
                program: program.to_string(),
                source,
            };
            warn!("{}", error);
            return finalize(
                ProcessEnd::LaunchFailed(error),
                String::new(),
                String::new(),
                timeout,
            );
        }
    };

    // Drain both pipes on dedicated tasks so the child can never deadlock
    // against a full pipe buffer while we wait on it.
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let end = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Child exited with status {:?}", status.code());
            ProcessEnd::Completed(status)
        }
        Ok(Err(source)) => {
            // wait() failing after a successful spawn is an OS-level fault.
            // Kill the child so nothing is left running, then report.
            if let Err(err) = child.kill().await {
                warn!("Failed to kill unsupervisable child: {}", err);
            }
            ProcessEnd::LaunchFailed(SuperviseError::Wait { source })
        }
        Err(_) => {
            // kill() delivers SIGKILL and then waits, so the child is fully
            // reaped before the drain below. No zombie survives this path.
            warn!("Execution exceeded {:?} budget, killing child", timeout);
            if let Err(err) = child.kill().await {
                warn!("Failed to kill timed-out child: {}", err);
            }
            ProcessEnd::Killed
        }
    };

    // The child is gone on every path above, so the readers see EOF and
    // return everything that was buffered, including output flushed during
    // a kill.
    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;

    finalize(end, stdout, stderr, timeout)
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(err) = pipe.read_to_end(&mut buf).await {
                warn!("Failed to drain child pipe: {}", err);
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

async fn drain(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Collapse the internal process-end variant plus captured streams into the
/// flat wire shape.
fn finalize(
    end: ProcessEnd,
    stdout: String,
    mut stderr: String,
    timeout: Duration,
) -> ExecutionOutcome {
    match end {
        ProcessEnd::Completed(status) => ExecutionOutcome {
            stdout,
            stderr,
            // Signal death yields no numeric status; normalize to -1 so the
            // field is always present.
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        },
        ProcessEnd::Killed => {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Execution timed out after {}s",
                timeout.as_secs()
            ));
            ExecutionOutcome {
                stdout,
                stderr,
                exit_code: -1,
                timed_out: true,
            }
        }
        ProcessEnd::LaunchFailed(error) => ExecutionOutcome {
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: -1,
            timed_out: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn hello_world_captures_stdout() {
        let outcome = execute("print(\"hi\")", DEFAULT_TIMEOUT).await;
        assert_eq!(outcome.stdout, "hi\n");
        assert_eq!(outcome.stderr, "");
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn unhandled_exception_reports_traceback() {
        let outcome = execute("raise ValueError(\"boom\")", DEFAULT_TIMEOUT).await;
        assert_ne!(outcome.exit_code, 0);
        assert!(outcome.stderr.contains("Traceback"));
        assert!(outcome.stderr.contains("boom"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn stderr_and_exit_code_are_preserved() {
        let code = "import sys\nsys.stderr.write(\"warning text\")\nsys.exit(7)";
        let outcome = execute(code, DEFAULT_TIMEOUT).await;
        assert_eq!(outcome.exit_code, 7);
        assert!(outcome.stderr.contains("warning text"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn infinite_loop_is_killed_at_deadline() {
        let code = "print(\"before\", flush=True)\nwhile True:\n    pass";
        let started = Instant::now();
        let outcome = execute(code, Duration::from_secs(1)).await;

        // Returns within the budget plus supervisory overhead, not 30s later.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        // Partial output written before the kill is preserved.
        assert_eq!(outcome.stdout, "before\n");
        assert!(outcome.stderr.contains("Execution timed out after 1s"));
    }

    #[tokio::test]
    async fn timeout_marker_does_not_replace_real_stderr() {
        let code = "import sys\nsys.stderr.write(\"early warning\\n\")\nsys.stderr.flush()\nwhile True:\n    pass";
        let outcome = execute(code, Duration::from_secs(1)).await;
        assert!(outcome.timed_out);
        assert!(outcome.stderr.contains("early warning"));
        assert!(outcome.stderr.contains("Execution timed out after 1s"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timed_out_child_is_fully_reaped() {
        let code = "import os\nprint(os.getpid(), flush=True)\nwhile True:\n    pass";
        let outcome = execute(code, Duration::from_secs(1)).await;
        assert!(outcome.timed_out);

        let pid: i32 = outcome.stdout.trim().parse().expect("child printed its pid");
        // kill() waits on the child before returning, so by now the pid is
        // reaped: its procfs entry is gone, or at minimum not a zombie.
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            assert!(!stat.contains(") Z "), "child left as zombie: {}", stat);
        }
    }

    #[tokio::test]
    async fn launch_failure_is_reported_in_outcome() {
        let outcome =
            execute_with_program("no-such-interpreter-binary", "print(1)", DEFAULT_TIMEOUT).await;
        assert_eq!(outcome.stdout, "");
        assert!(outcome.stderr.contains("Failed to launch interpreter"));
        assert_eq!(outcome.exit_code, -1);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn quotes_and_newlines_pass_through_unmodified() {
        let code = "text = 'a \"b\" c'\nprint(text)";
        let outcome = execute(code, DEFAULT_TIMEOUT).await;
        assert_eq!(outcome.stdout, "a \"b\" c\n");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn executions_share_no_state() {
        let first = execute("x = 1\nprint(x)", DEFAULT_TIMEOUT).await;
        assert_eq!(first.exit_code, 0);

        let second = execute("print(x)", DEFAULT_TIMEOUT).await;
        assert_ne!(second.exit_code, 0);
        assert!(second.stderr.contains("NameError"));
    }
}
