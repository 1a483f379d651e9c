//! Spawning and supervising the `claude` process
//!
//! Each invocation runs in its own process group inside an empty scratch
//! directory. The process group is killed if the event stream is dropped
//! before the process exits (timeout, cancellation, caller gone).

use super::args::{build_args, Invocation, ToolPolicy};
use super::protocol::{parse_events, ProtocolError, StreamEvent};
use super::{EventStream, Invoker};
use futures::stream::{self, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Cap on retained stderr, used only for error messages
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// Invoker backed by the real CLI
pub struct ClaudeInvoker {
    binary: PathBuf,
    scratch_dir: PathBuf,
    policy: ToolPolicy,
}

impl ClaudeInvoker {
    pub fn new(binary: PathBuf, scratch_dir: PathBuf, policy: ToolPolicy) -> Self {
        Self {
            binary,
            scratch_dir,
            policy,
        }
    }

    fn command(&self, invocation: &Invocation) -> io::Result<Command> {
        // Recreate if something removed it since startup
        std::fs::create_dir_all(&self.scratch_dir)?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(build_args(invocation, &self.policy))
            .current_dir(&self.scratch_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so the whole tree can be killed at once
        #[cfg(unix)]
        cmd.process_group(0);

        Ok(cmd)
    }
}

impl Invoker for ClaudeInvoker {
    fn start(&self, invocation: &Invocation) -> io::Result<EventStream> {
        let mut child = self.command(invocation)?.spawn()?;
        let pid = child.id();
        let guard = ProcessGroupGuard::new(pid);

        tracing::debug!(
            pid,
            model = %invocation.model,
            resume = invocation.resume.is_some(),
            "Spawned claude"
        );

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(io::Error::other("child process pipes were not captured"));
        };

        let prompt = invocation.prompt.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::warn!(pid, error = %e, "Failed to write prompt to claude stdin");
            }
            // Dropping stdin closes the pipe and signals end of prompt
        });

        let stderr_task = tokio::spawn(collect_stderr(stderr, pid));
        let exit = stream::once(wait_for_exit(child, stderr_task, guard));

        Ok(parse_events(BufReader::new(stdout)).chain(exit).boxed())
    }
}

/// Wait for the process after stdout closes and report how it exited
async fn wait_for_exit(
    mut child: Child,
    stderr_task: JoinHandle<String>,
    mut guard: ProcessGroupGuard,
) -> Result<StreamEvent, ProtocolError> {
    let status = child.wait().await?;
    // Helpers the tool left behind in its group go with it
    kill_process_group(guard.pid);
    guard.disarm();
    let stderr = stderr_task.await.unwrap_or_default();
    tracing::debug!(pid = guard.pid, code = ?status.code(), "claude exited");
    Ok(StreamEvent::Exited {
        code: status.code(),
        stderr,
    })
}

async fn collect_stderr(stderr: ChildStderr, pid: Option<u32>) -> String {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut collected = String::new();
    let mut truncated = false;

    // Keep draining to EOF so the child never sees a closed pipe
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "Stopped reading claude stderr");
                break;
            }
        }
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!(pid, "claude stderr: {}", line);
        if collected.len() + line.len() + 1 > MAX_STDERR_BYTES {
            truncated = true;
            continue;
        }
        collected.push_str(line);
        collected.push('\n');
    }

    if truncated {
        collected.push_str("[stderr truncated]");
    }
    collected.trim_end().to_string()
}

/// Kills the child's process group when dropped, unless disarmed after a
/// normal exit.
struct ProcessGroupGuard {
    pid: Option<u32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            kill_process_group(self.pid);
        }
    }
}

/// Kill a process group immediately with SIGKILL.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    tracing::debug!(pgid = raw, "Sending SIGKILL to process group");
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {
    // kill_on_drop covers the direct child on other platforms
}

/// Create the scratch working directory and make sure it holds nothing the
/// tool could pick up as context.
pub fn prepare_scratch_dir(path: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    if std::fs::read_dir(path)?.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("scratch directory {} is not empty", path.display()),
        ));
    }
    path.canonicalize()
}
