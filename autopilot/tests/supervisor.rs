//! Process supervisor scenarios against real `sh -c` scripts with shortened
//! timeout policies.
#![cfg(unix)]

use std::time::Duration;

use autopilot::core::monitor::MonitorSettings;
use autopilot::core::types::{TerminationReason, TimeoutPolicy};
use autopilot::io::supervisor::{ProcessSupervisor, SupervisorSettings, ToolRunner};
use autopilot::io::tools::CommandSpec;

fn supervisor(monitor: MonitorSettings) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorSettings {
        monitor,
        poll_interval: Duration::from_millis(100),
        termination_grace: Duration::from_secs(2),
        ..SupervisorSettings::default()
    })
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        stdin_payload: None,
        keep_stdin_open: false,
        workdir: std::env::temp_dir(),
    }
}

fn policy(idle: u64, probe_after: u64, probe_wait: u64, max_runtime: u64) -> TimeoutPolicy {
    TimeoutPolicy {
        idle: Duration::from_secs(idle),
        probe_after: Duration::from_secs(probe_after),
        probe_wait: Duration::from_secs(probe_wait),
        max_runtime: Duration::from_secs(max_runtime),
    }
}

#[test]
fn silent_process_hits_idle_timeout() {
    let out = supervisor(MonitorSettings::default()).run("sh", &sh("echo start; sleep 30"), policy(1, 60, 30, 60));
    assert!(out.terminated);
    assert_eq!(out.reason, TerminationReason::IdleTimeout);
    assert!(out.duration < Duration::from_secs(10));
    assert!(out.is_call_failure());
}

#[test]
fn steady_output_resets_the_idle_timer() {
    let script = "for i in 1 2 3 4 5 6 7 8; do echo tick $i; sleep 0.3; done";
    let out = supervisor(MonitorSettings::default()).run("sh", &sh(script), policy(1, 60, 30, 60));
    assert!(!out.terminated);
    assert_eq!(out.reason, TerminationReason::Completed);
    assert_eq!(out.exit_code, Some(0));
    assert_eq!(out.output_lines.len(), 8);
}

#[test]
fn repeated_operation_line_is_a_loop() {
    let script = "for i in 1 2 3 4 5; do echo 'running tests...'; done; sleep 10";
    let out = supervisor(MonitorSettings::default()).run("sh", &sh(script), policy(20, 60, 30, 60));
    assert!(out.terminated);
    assert!(out.loop_detected);
    assert_eq!(out.reason, TerminationReason::LoopDetected);
}

#[test]
fn repeated_blank_lines_are_not_a_loop() {
    let script = "for i in 1 2 3 4 5 6; do echo; done";
    let out = supervisor(MonitorSettings::default()).run("sh", &sh(script), policy(20, 60, 30, 60));
    assert!(!out.loop_detected);
    assert_eq!(out.reason, TerminationReason::Completed);
}

#[test]
fn error_keyword_halts_immediately() {
    let monitor = MonitorSettings {
        error_keywords: vec!["fatal error".to_string()],
        ..MonitorSettings::default()
    };
    let script = "echo 'Fatal Error: quota exceeded'; sleep 10";
    let out = supervisor(monitor).run("sh", &sh(script), policy(20, 60, 30, 60));
    assert!(out.terminated);
    assert_eq!(out.error_keyword.as_deref(), Some("fatal error"));
    assert_eq!(
        out.reason,
        TerminationReason::ErrorKeyword {
            keyword: "fatal error".to_string()
        }
    );
}

#[test]
fn runtime_ceiling_stops_busy_process() {
    let script = "i=0; while true; do i=$((i+1)); echo \"progress $i\"; sleep 0.2; done";
    let out = supervisor(MonitorSettings::default()).run("sh", &sh(script), policy(5, 60, 30, 1));
    assert!(out.terminated);
    assert_eq!(out.reason, TerminationReason::MaxRuntime);
}

#[test]
fn unanswered_probe_ends_the_run() {
    let out = supervisor(MonitorSettings::default()).run("sh", &sh("echo start; sleep 20"), policy(30, 1, 1, 60));
    assert!(out.terminated);
    assert!(out.probe_sent);
    assert_eq!(out.reason, TerminationReason::ProbeNoResponse);
}

#[test]
fn vague_probe_answer_is_unclear() {
    let script = "echo start; sleep 1.5; echo 'still thinking'; sleep 20";
    let out = supervisor(MonitorSettings::default()).run("sh", &sh(script), policy(30, 1, 2, 60));
    assert!(out.terminated);
    assert_eq!(out.reason, TerminationReason::ProbeUnclear);
}

#[test]
fn nonzero_exit_is_a_call_failure_without_termination() {
    let out = supervisor(MonitorSettings::default()).run("sh", &sh("echo done; exit 3"), policy(20, 60, 30, 60));
    assert!(!out.terminated);
    assert_eq!(out.reason, TerminationReason::Completed);
    assert_eq!(out.exit_code, Some(3));
    assert!(out.is_call_failure());
    assert_eq!(out.failure_reason(), "exit_code_3");
}

#[test]
fn missing_program_is_reported_not_raised() {
    let spec = CommandSpec {
        program: "autopilot-no-such-program".to_string(),
        args: Vec::new(),
        stdin_payload: None,
        keep_stdin_open: false,
        workdir: std::env::temp_dir(),
    };
    let out = supervisor(MonitorSettings::default()).run("ghost", &spec, policy(20, 60, 30, 60));
    assert!(out.terminated);
    assert!(matches!(out.reason, TerminationReason::SpawnFailed { .. }));
    assert_eq!(out.exit_code, None);
}
