//! Process supervisor for external tool invocations.
//!
//! One child process at a time. Two reader threads push `(Instant, line)`
//! events onto a channel; the supervising loop drains it at a fixed poll
//! cadence, feeds [`OutputMonitor`] and acts on the returned actions (reply on
//! stdin, send the probe, terminate). Every failure mode, spawn failure
//! included, comes back as an [`ExecutionOutcome`].

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{ChildStdin, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::monitor::{LineAction, MonitorSettings, OutputMonitor, TickAction};
use crate::core::types::{ExecutionOutcome, TerminationReason, TimeoutPolicy};
use crate::io::config::AutopilotConfig;
use crate::io::process::{isolate_process_group, terminate_with_grace};
use crate::io::tools::CommandSpec;

/// Runs tool invocations. The round orchestrator only talks to this trait so
/// tests can script tool behaviour without spawning real agents.
pub trait ToolRunner {
    /// Run a batch invocation under `policy`.
    fn run(&self, tool: &str, spec: &CommandSpec, policy: TimeoutPolicy) -> ExecutionOutcome;

    /// Run an interactive session attached to the operator's terminal.
    fn run_interactive(&self, tool: &str, spec: &CommandSpec) -> ExecutionOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub monitor: MonitorSettings,
    pub auto_confirm_reply: String,
    pub probe_message: String,
    pub poll_interval: Duration,
    pub termination_grace: Duration,
    pub tail_lines: usize,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &AutopilotConfig) -> Self {
        Self {
            monitor: cfg.monitor_settings(),
            auto_confirm_reply: cfg.supervisor.auto_confirm_reply.clone(),
            probe_message: cfg.supervisor.probe_message.clone(),
            poll_interval: Duration::from_millis(cfg.timeouts.poll_interval_ms.max(10)),
            termination_grace: Duration::from_secs(cfg.timeouts.termination_grace_secs),
            tail_lines: cfg.supervisor.output_tail_lines.max(1),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings::default(),
            auto_confirm_reply: "yes".to_string(),
            probe_message: "Report your current progress in one line.".to_string(),
            poll_interval: Duration::from_secs(1),
            termination_grace: Duration::from_secs(8),
            tail_lines: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
}

enum StreamEvent {
    Line(Instant, String),
    Closed,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self { settings }
    }

    #[instrument(skip_all, fields(tool, program = %spec.program))]
    fn supervise(&self, tool: &str, spec: &CommandSpec, policy: TimeoutPolicy) -> ExecutionOutcome {
        let started = Instant::now();
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(err = %err, "failed to spawn tool");
                return ExecutionOutcome::spawn_failed(tool, format!("{}: {err}", spec.program));
            }
        };
        info!(pid = child.id(), command = %spec, "tool started");

        let mut stdin = child.stdin.take();
        if let Some(payload) = &spec.stdin_payload {
            send_input(&mut stdin, payload);
            if !spec.keep_stdin_open {
                stdin = None;
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut open_streams = 0usize;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone());
            open_streams += 1;
        }
        drop(tx);

        let mut monitor = OutputMonitor::new(policy, self.settings.monitor.clone(), started);
        let mut tail: VecDeque<String> = VecDeque::new();
        let mut halt: Option<TerminationReason> = None;
        let mut exit_status: Option<ExitStatus> = None;

        'supervise: loop {
            let first = rx.recv_timeout(self.settings.poll_interval);
            let mut events = Vec::new();
            match first {
                Ok(event) => events.push(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    open_streams = 0;
                    thread::sleep(self.settings.poll_interval);
                }
            }
            events.extend(rx.try_iter());

            for event in events {
                match event {
                    StreamEvent::Closed => open_streams = open_streams.saturating_sub(1),
                    StreamEvent::Line(at, line) => {
                        debug!(target: "autopilot::tool_output", tool, "{line}");
                        let action = monitor.observe_line(at, &line);
                        push_tail(&mut tail, line, self.settings.tail_lines);
                        match action {
                            LineAction::Continue => {}
                            LineAction::AutoConfirm => {
                                debug!("auto-confirming prompt");
                                send_input(&mut stdin, &self.settings.auto_confirm_reply);
                            }
                            LineAction::Halt(reason) => {
                                halt = Some(reason);
                                break 'supervise;
                            }
                        }
                    }
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    halt = self.drain_after_exit(&rx, open_streams, &mut tail, &mut monitor);
                    break;
                }
                Ok(None) => {}
                Err(err) => warn!(err = %err, "try_wait failed"),
            }

            match monitor.tick(Instant::now()) {
                TickAction::Continue => {}
                TickAction::SendProbe => {
                    info!("sending progress probe");
                    send_input(&mut stdin, &self.settings.probe_message);
                }
                TickAction::Halt(reason) => {
                    halt = Some(reason);
                    break;
                }
            }
        }

        drop(stdin);
        let terminated = halt.is_some();
        let reason = match halt {
            Some(reason) => {
                warn!(reason = %reason, "terminating tool");
                exit_status =
                    terminate_with_grace(&mut child, self.settings.termination_grace).or(exit_status);
                reason
            }
            None => TerminationReason::Completed,
        };
        if exit_status.is_none() && !terminated {
            exit_status = child.wait().ok();
        }

        let exit_code = exit_status.and_then(|status| status.code());
        let duration = started.elapsed();
        info!(
            reason = %reason,
            exit_code = ?exit_code,
            duration_secs = duration.as_secs(),
            "tool finished"
        );
        ExecutionOutcome {
            tool: tool.to_string(),
            terminated,
            reason,
            exit_code,
            duration,
            output_lines: tail.into(),
            error_keyword: monitor.error_keyword().map(str::to_string),
            loop_detected: monitor.loop_detected(),
            probe_sent: monitor.probe_sent(),
        }
    }

    /// Collect lines still buffered after the child exited. Grandchildren may
    /// keep the pipes open, so this waits at most one poll interval of silence.
    fn drain_after_exit(
        &self,
        rx: &Receiver<StreamEvent>,
        mut open_streams: usize,
        tail: &mut VecDeque<String>,
        monitor: &mut OutputMonitor,
    ) -> Option<TerminationReason> {
        while open_streams > 0 {
            match rx.recv_timeout(self.settings.poll_interval) {
                Ok(StreamEvent::Line(at, line)) => {
                    let action = monitor.observe_line(at, &line);
                    push_tail(tail, line, self.settings.tail_lines);
                    if let LineAction::Halt(reason) = action {
                        return Some(reason);
                    }
                }
                Ok(StreamEvent::Closed) => open_streams -= 1,
                Err(_) => break,
            }
        }
        None
    }
}

impl ToolRunner for ProcessSupervisor {
    fn run(&self, tool: &str, spec: &CommandSpec, policy: TimeoutPolicy) -> ExecutionOutcome {
        self.supervise(tool, spec, policy)
    }

    #[instrument(skip_all, fields(tool, program = %spec.program))]
    fn run_interactive(&self, tool: &str, spec: &CommandSpec) -> ExecutionOutcome {
        let started = Instant::now();
        if spec.stdin_payload.is_some() {
            warn!("interactive invocation ignores the stdin prompt; pass it as an argument");
        }
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        info!(command = %spec, "starting interactive session");
        let status = match cmd.status() {
            Ok(status) => status,
            Err(err) => {
                warn!(err = %err, "failed to start interactive session");
                return ExecutionOutcome::spawn_failed(tool, format!("{}: {err}", spec.program));
            }
        };
        let exit_code = status.code();
        let reason = if status.success() {
            TerminationReason::Completed
        } else {
            TerminationReason::InteractiveExitNonzero
        };
        ExecutionOutcome {
            tool: tool.to_string(),
            terminated: false,
            reason,
            exit_code,
            duration: started.elapsed(),
            output_lines: Vec::new(),
            error_keyword: None,
            loop_detected: false,
            probe_sent: false,
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, tx: Sender<StreamEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(StreamEvent::Line(Instant::now(), line)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(err = %err, "output stream read failed");
                    break;
                }
            }
        }
        let _ = tx.send(StreamEvent::Closed);
    });
}

fn send_input(stdin: &mut Option<ChildStdin>, text: &str) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let result = pipe
        .write_all(text.as_bytes())
        .and_then(|()| pipe.write_all(b"\n"))
        .and_then(|()| pipe.flush());
    if let Err(err) = result {
        debug!(err = %err, "tool input closed");
        *stdin = None;
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String, limit: usize) {
    tail.push_back(line);
    while tail.len() > limit {
        tail.pop_front();
    }
}
