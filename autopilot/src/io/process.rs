//! Child-process helpers: bounded command runner plus process-group signalling.
//!
//! Git and validation commands go through [`run_command_with_timeout`]; tool
//! invocations go through the supervisor. Both spawn children in their own
//! process group so a stop reaches grandchildren (`bash -lc` pipelines) too.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated_bytes: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, with 124 standing in for a timeout and -1 for a signal.
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return 124;
        }
        self.status.code().unwrap_or(-1)
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if self.truncated_bytes > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated_bytes));
        }
        text
    }
}

/// Spawn the child as leader of a new process group.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Ask the child's process group to exit (SIGTERM on unix).
pub fn request_stop(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Ok(pid) = i32::try_from(child.id()) else {
            return;
        };
        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, err = %err, "SIGTERM to process group failed");
        }
    }
    #[cfg(not(unix))]
    force_kill(child);
}

/// Kill the child's process group and the child itself.
pub fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id())
            && let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            debug!(pid, err = %err, "SIGKILL to process group failed");
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill child failed");
    }
}

/// Stop gracefully, wait up to `grace`, then kill. Returns the exit status if reaped.
pub fn terminate_with_grace(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    request_stop(child);
    match child.wait_timeout(grace) {
        Ok(Some(status)) => return Some(status),
        Ok(None) => warn!(grace_secs = grace.as_secs(), "child ignored stop request, killing"),
        Err(err) => warn!(err = %err, "wait after stop request failed"),
    }
    force_kill(child);
    child.wait().ok()
}

/// How long readers get to finish once the process group has been killed.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Run `cmd` to completion or until `timeout`, capturing both streams.
///
/// Readers drain stdout and stderr on their own threads before any stdin is
/// written, so a chatty child can never block on a full pipe. At most
/// `output_limit_bytes` per stream are kept; the rest is counted and dropped.
/// The deadline covers the whole process group: a leader that times out, or
/// background children still holding the pipes at the deadline, get the group
/// killed.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "spawn failed");
        anyhow!(err).context(format!("spawn {:?}", cmd.get_program()))
    })?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(child.stdout.take(), Stream::Stdout, output_limit_bytes, tx.clone())?;
    spawn_reader(child.stderr.take(), Stream::Stderr, output_limit_bytes, tx)?;
    match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            thread::spawn(move || {
                if let Err(err) = pipe.write_all(&input) {
                    debug!(err = %err, "child closed stdin early");
                }
            });
        }
        (Some(_), None) => return Err(anyhow!("stdin pipe missing")),
        _ => {}
    }

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command exceeded its timeout, killing process group");
            force_kill(&mut child);
            (child.wait().context("reap killed command")?, true)
        }
    };

    let mut captured = Captured::default();
    let mut pending = 2;
    let mut group_killed = timed_out;
    while pending > 0 {
        let wait = if group_killed {
            READER_GRACE
        } else {
            deadline.saturating_duration_since(Instant::now())
        };
        match rx.recv_timeout(wait) {
            Ok((stream, result)) => {
                captured.store(stream, result.with_context(|| format!("read {}", stream.name()))?);
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) if !group_killed => {
                warn!("background processes held output open past the deadline, killing process group");
                force_kill(&mut child);
                group_killed = true;
            }
            Err(_) => {
                warn!(pending, "output readers did not finish, keeping what was captured");
                break;
            }
        }
    }
    let truncated_bytes = captured.stdout.1 + captured.stderr.1;
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "command output exceeded the capture limit");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout: captured.stdout.0,
        stderr: captured.stderr.0,
        truncated_bytes,
        timed_out,
    })
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Bytes kept and bytes dropped, per stream.
#[derive(Default)]
struct Captured {
    stdout: (Vec<u8>, usize),
    stderr: (Vec<u8>, usize),
}

impl Captured {
    fn store(&mut self, stream: Stream, bytes: (Vec<u8>, usize)) {
        match stream {
            Stream::Stdout => self.stdout = bytes,
            Stream::Stderr => self.stderr = bytes,
        }
    }
}

type ReaderResult = (Stream, std::io::Result<(Vec<u8>, usize)>);

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    stream: Stream,
    limit: usize,
    tx: Sender<ReaderResult>,
) -> Result<()> {
    let pipe = pipe.ok_or_else(|| anyhow!("{} pipe missing", stream.name()))?;
    thread::spawn(move || {
        // The receiver is gone only if the runner already gave up on this stream.
        let _ = tx.send((stream, drain_bounded(pipe, limit)));
    });
    Ok(())
}

/// Read `pipe` to EOF keeping the first `limit` bytes; returns (kept, dropped).
fn drain_bounded<R: Read>(mut pipe: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf)?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&buf[..room]);
        dropped += n - room;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_command_with_timeout(sh("echo out; echo err >&2; exit 3"), None, Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.exit_code(), 3);
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[test]
    fn stdin_is_forwarded() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert!(out.success());
        assert_eq!(out.combined(), "hello");
    }

    #[test]
    fn timeout_kills_process_group() {
        let started = std::time::Instant::now();
        let out = run_command_with_timeout(sh("sleep 30 & sleep 30"), None, Duration::from_millis(300), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), 124);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_child_cannot_outlive_the_deadline() {
        let started = std::time::Instant::now();
        let out = run_command_with_timeout(sh("sleep 30 & echo started"), None, Duration::from_secs(1), 1024)
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!out.timed_out);
        assert_eq!(out.exit_code(), 0);
        assert_eq!(out.combined(), "started\n");
    }

    #[test]
    fn output_is_bounded() {
        let out = run_command_with_timeout(sh("printf '%0100d' 0"), None, Duration::from_secs(10), 10)
            .expect("run");
        assert_eq!(out.stdout.len(), 10);
        assert_eq!(out.truncated_bytes, 90);
    }
}
