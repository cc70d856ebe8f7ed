/// External process execution
///
/// Used by the `shell.run` step function and the `command` filter. Spawns the
/// program with an explicit working directory, captures output, and polls for
/// timeout and cancellation so neither a hung converter nor a cancelled batch
/// can block forever.
use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::error::PrecisError;
use crate::logging::{operations, services};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of running an external program
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub duration: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Fail with the program's stderr unless it exited successfully
    pub fn ensure_success(self, program: &str) -> Result<Self> {
        if !self.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                program,
                self.status,
                String::from_utf8_lossy(&self.stderr).trim()
            );
        }
        Ok(self)
    }
}

/// Run `program` with `args` in `cwd`
pub fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
) -> Result<CommandOutput> {
    // Resolve from PATH, falling back to the name as given
    let program_path = which::which(program).unwrap_or_else(|e| {
        debug!("Could not find '{}' in PATH: {}. Trying as-is.", program, e);
        PathBuf::from(program)
    });

    debug!(
        service = services::PROCESS,
        operation = operations::SPAWN,
        program = %program_path.display(),
        args = ?args,
        cwd = %cwd.display(),
        "spawning process"
    );

    let mut command = Command::new(&program_path);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so a kill also reaches whatever the program spawned
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let start = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    // Drain pipes on their own threads so a chatty child never blocks on a full pipe
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, start, timeout, cancel, program);

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    let status = status?;

    Ok(CommandOutput {
        status,
        duration: start.elapsed(),
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait(
    child: &mut Child,
    start: Instant,
    timeout: Option<Duration>,
    cancel: &CancelFlag,
    program: &str,
) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for child process")? {
            return Ok(status);
        }

        if cancel.is_cancelled() {
            warn!("Killing {} after cancellation", program);
            kill(child);
            return Err(PrecisError::Cancelled.into());
        }

        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                kill(child);
                anyhow::bail!("{} timed out after {}s", program, timeout.as_secs());
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // Grandchildren would otherwise keep the output pipes open
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
    // Reap zombie
    let _ = child.wait();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_captures_stdout_in_cwd() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "here").unwrap();

        let output = run_command(
            "sh",
            &["-c".to_string(), "cat marker.txt".to_string()],
            temp.path(),
            None,
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "here");
    }

    #[test]
    fn test_timeout_kills_process() {
        let temp = TempDir::new().unwrap();
        let result = run_command(
            "sh",
            &["-c".to_string(), "sleep 10".to_string()],
            temp.path(),
            Some(Duration::from_millis(200)),
            &CancelFlag::new(),
        );

        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[test]
    fn test_timeout_kills_grandchildren() {
        let temp = TempDir::new().unwrap();
        let start = Instant::now();
        let result = run_command(
            "sh",
            &["-c".to_string(), "sleep 4; true".to_string()],
            temp.path(),
            Some(Duration::from_millis(300)),
            &CancelFlag::new(),
        );

        assert!(result.unwrap_err().to_string().contains("timed out"));
        // The shell's sleep must die with it instead of holding stdout open
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_cancel_kills_process() {
        let temp = TempDir::new().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = run_command(
            "sh",
            &["-c".to_string(), "sleep 10".to_string()],
            temp.path(),
            None,
            &cancel,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PrecisError>(),
            Some(PrecisError::Cancelled)
        ));
    }

    #[test]
    fn test_ensure_success_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let output = run_command(
            "sh",
            &["-c".to_string(), "echo broken >&2; exit 3".to_string()],
            temp.path(),
            None,
            &CancelFlag::new(),
        )
        .unwrap();

        let err = output.ensure_success("sh").unwrap_err().to_string();
        assert!(err.contains("broken"));
    }
}
