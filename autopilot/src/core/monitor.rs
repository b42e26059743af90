//! Timeout and health state machine for one supervised invocation.
//!
//! [`OutputMonitor`] owns every timer and counter the supervisor consults but
//! never touches the process itself. The supervisor feeds it output lines and
//! poll ticks (with monotonic timestamps) and acts on the returned actions.

use std::time::{Duration, Instant};

use crate::core::signals::{
    find_error_keyword, has_clear_progress, looks_like_operation, normalize_signature,
    should_auto_confirm,
};
use crate::core::types::{TerminationReason, TimeoutPolicy};

/// Line-level policy knobs shared by every supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Lowercase deny-list keywords.
    pub error_keywords: Vec<String>,
    /// Loop fires when an operation signature repeats more than this many times.
    pub loop_repeat_threshold: usize,
    /// Minimum gap between two auto-confirm replies.
    pub auto_confirm_gap: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            error_keywords: Vec::new(),
            loop_repeat_threshold: 3,
            auto_confirm_gap: Duration::from_secs(2),
        }
    }
}

/// What the supervisor should do after a line was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAction {
    Continue,
    /// Write the auto-confirm token to the process input.
    AutoConfirm,
    Halt(TerminationReason),
}

/// What the supervisor should do after a poll tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    Continue,
    /// Write the progress probe to the process input.
    SendProbe,
    Halt(TerminationReason),
}

#[derive(Debug)]
pub struct OutputMonitor {
    policy: TimeoutPolicy,
    settings: MonitorSettings,
    started_at: Instant,
    last_output_at: Instant,
    last_signature: String,
    repeat_count: usize,
    last_auto_confirm_at: Option<Instant>,
    probe_sent_at: Option<Instant>,
    probe_answered: bool,
    probe_clear: bool,
    error_keyword: Option<String>,
    loop_detected: bool,
}

impl OutputMonitor {
    pub fn new(policy: TimeoutPolicy, settings: MonitorSettings, started_at: Instant) -> Self {
        Self {
            policy,
            settings,
            started_at,
            last_output_at: started_at,
            last_signature: String::new(),
            repeat_count: 0,
            last_auto_confirm_at: None,
            probe_sent_at: None,
            probe_answered: false,
            probe_clear: false,
            error_keyword: None,
            loop_detected: false,
        }
    }

    /// Process one output line received at `at`.
    pub fn observe_line(&mut self, at: Instant, line: &str) -> LineAction {
        self.last_output_at = at;

        if let Some(keyword) = find_error_keyword(line, &self.settings.error_keywords) {
            self.error_keyword = Some(keyword.to_string());
            return LineAction::Halt(TerminationReason::ErrorKeyword {
                keyword: keyword.to_string(),
            });
        }

        let signature = normalize_signature(line);
        if !signature.is_empty() && signature == self.last_signature {
            self.repeat_count += 1;
        } else {
            self.last_signature = signature;
            self.repeat_count = 1;
        }
        if self.repeat_count > self.settings.loop_repeat_threshold
            && looks_like_operation(&self.last_signature)
        {
            self.loop_detected = true;
            return LineAction::Halt(TerminationReason::LoopDetected);
        }

        if let Some(sent_at) = self.probe_sent_at
            && at >= sent_at
        {
            self.probe_answered = true;
            if has_clear_progress(line) {
                self.probe_clear = true;
            }
        }

        if should_auto_confirm(line) {
            let due = self
                .last_auto_confirm_at
                .is_none_or(|last| at.saturating_duration_since(last) > self.settings.auto_confirm_gap);
            if due {
                self.last_auto_confirm_at = Some(at);
                return LineAction::AutoConfirm;
            }
        }

        LineAction::Continue
    }

    /// Evaluate timers at `now`.
    pub fn tick(&mut self, now: Instant) -> TickAction {
        let runtime = now.saturating_duration_since(self.started_at);
        let silent_for = now.saturating_duration_since(self.last_output_at);

        if runtime > self.policy.idle && silent_for > self.policy.idle {
            return TickAction::Halt(TerminationReason::IdleTimeout);
        }

        let mut send_probe = false;
        if self.probe_sent_at.is_none() && runtime >= self.policy.probe_after {
            self.probe_sent_at = Some(now);
            send_probe = true;
        }

        if let Some(sent_at) = self.probe_sent_at
            && now.saturating_duration_since(sent_at) > self.policy.probe_wait
        {
            if !self.probe_answered {
                return TickAction::Halt(TerminationReason::ProbeNoResponse);
            }
            if !self.probe_clear {
                return TickAction::Halt(TerminationReason::ProbeUnclear);
            }
        }

        if runtime > self.policy.max_runtime {
            return TickAction::Halt(TerminationReason::MaxRuntime);
        }

        if send_probe {
            TickAction::SendProbe
        } else {
            TickAction::Continue
        }
    }

    pub fn probe_sent(&self) -> bool {
        self.probe_sent_at.is_some()
    }

    pub fn error_keyword(&self) -> Option<&str> {
        self.error_keyword.as_deref()
    }

    pub fn loop_detected(&self) -> bool {
        self.loop_detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy {
            idle: secs(30),
            probe_after: secs(900),
            probe_wait: secs(300),
            max_runtime: secs(1800),
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            error_keywords: vec!["quota exceeded".to_string()],
            ..MonitorSettings::default()
        }
    }

    #[test]
    fn idle_fires_after_silence() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        assert_eq!(monitor.tick(start + secs(30)), TickAction::Continue);
        assert_eq!(
            monitor.tick(start + secs(31)),
            TickAction::Halt(TerminationReason::IdleTimeout)
        );
    }

    #[test]
    fn idle_timer_resets_on_every_line() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        for step in 1..=20u64 {
            let at = start + secs(step * 25);
            assert_eq!(monitor.observe_line(at, &format!("step {step} ok")), LineAction::Continue);
            assert_eq!(monitor.tick(at + secs(29)), TickAction::Continue);
        }
    }

    #[test]
    fn error_keyword_halts_immediately() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        let action = monitor.observe_line(start + secs(1), "Error: QUOTA EXCEEDED, try later");
        assert_eq!(
            action,
            LineAction::Halt(TerminationReason::ErrorKeyword {
                keyword: "quota exceeded".to_string()
            })
        );
        assert_eq!(monitor.error_keyword(), Some("quota exceeded"));
    }

    #[test]
    fn capitalized_keyword_in_settings_still_halts() {
        let start = Instant::now();
        let settings = MonitorSettings {
            error_keywords: vec!["Traceback".to_string()],
            ..MonitorSettings::default()
        };
        let mut monitor = OutputMonitor::new(policy(), settings, start);
        let action = monitor.observe_line(start + secs(1), "traceback (most recent call last):");
        assert_eq!(
            action,
            LineAction::Halt(TerminationReason::ErrorKeyword {
                keyword: "Traceback".to_string()
            })
        );
    }

    #[test]
    fn repeated_operation_lines_trigger_loop() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        let mut actions = Vec::new();
        for i in 0..5u64 {
            actions.push(monitor.observe_line(start + secs(i), "running tests..."));
        }
        assert_eq!(actions[2], LineAction::Continue);
        assert_eq!(actions[3], LineAction::Halt(TerminationReason::LoopDetected));
        assert!(monitor.loop_detected());
    }

    #[test]
    fn repeated_blank_lines_never_trigger_loop() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        for i in 0..50u64 {
            assert_eq!(monitor.observe_line(start + secs(i), ""), LineAction::Continue);
        }
        assert!(!monitor.loop_detected());
    }

    #[test]
    fn repeated_non_operation_lines_do_not_trigger_loop() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        for i in 0..10u64 {
            assert_eq!(monitor.observe_line(start + secs(i), "hello"), LineAction::Continue);
        }
    }

    #[test]
    fn interleaved_lines_reset_repeat_count() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        for i in 0..10u64 {
            let line = if i % 3 == 2 { "compiling crate" } else { "running tests" };
            assert_eq!(monitor.observe_line(start + secs(i), line), LineAction::Continue);
        }
    }

    #[test]
    fn auto_confirm_is_rate_limited() {
        let start = Instant::now();
        let mut monitor = OutputMonitor::new(policy(), settings(), start);
        assert_eq!(
            monitor.observe_line(start, "Proceed with changes? (y/n)"),
            LineAction::AutoConfirm
        );
        assert_eq!(
            monitor.observe_line(start + secs(1), "Confirm overwrite? (y/n)"),
            LineAction::Continue
        );
        assert_eq!(
            monitor.observe_line(start + secs(4), "Confirm delete? (y/n)"),
            LineAction::AutoConfirm
        );
    }

    #[test]
    fn probe_is_sent_once_then_waits_for_answer() {
        let start = Instant::now();
        let policy = TimeoutPolicy {
            idle: secs(100),
            probe_after: secs(10),
            probe_wait: secs(5),
            max_runtime: secs(1000),
        };
        let mut monitor = OutputMonitor::new(policy, settings(), start);
        monitor.observe_line(start + secs(9), "working");
        assert_eq!(monitor.tick(start + secs(10)), TickAction::SendProbe);
        assert!(monitor.probe_sent());
        assert_eq!(monitor.tick(start + secs(12)), TickAction::Continue);
        assert_eq!(
            monitor.tick(start + secs(16)),
            TickAction::Halt(TerminationReason::ProbeNoResponse)
        );
    }

    #[test]
    fn probe_answer_without_progress_is_unclear() {
        let start = Instant::now();
        let policy = TimeoutPolicy {
            idle: secs(100),
            probe_after: secs(10),
            probe_wait: secs(5),
            max_runtime: secs(1000),
        };
        let mut monitor = OutputMonitor::new(policy, settings(), start);
        assert_eq!(monitor.tick(start + secs(10)), TickAction::SendProbe);
        monitor.observe_line(start + secs(11), "yes I am still here");
        assert_eq!(
            monitor.tick(start + secs(16)),
            TickAction::Halt(TerminationReason::ProbeUnclear)
        );
    }

    #[test]
    fn probe_answer_with_progress_keeps_running() {
        let start = Instant::now();
        let policy = TimeoutPolicy {
            idle: secs(100),
            probe_after: secs(10),
            probe_wait: secs(5),
            max_runtime: secs(1000),
        };
        let mut monitor = OutputMonitor::new(policy, settings(), start);
        assert_eq!(monitor.tick(start + secs(10)), TickAction::SendProbe);
        monitor.observe_line(start + secs(11), "progress: 60% done, ETA 3 minutes");
        assert_eq!(monitor.tick(start + secs(16)), TickAction::Continue);
        assert_eq!(monitor.tick(start + secs(60)), TickAction::Continue);
    }

    #[test]
    fn max_runtime_fires_even_with_steady_output() {
        let start = Instant::now();
        let policy = TimeoutPolicy {
            idle: secs(30),
            probe_after: secs(10_000),
            probe_wait: secs(1),
            max_runtime: secs(60),
        };
        let mut monitor = OutputMonitor::new(policy, settings(), start);
        monitor.observe_line(start + secs(60), "still compiling");
        assert_eq!(
            monitor.tick(start + secs(61)),
            TickAction::Halt(TerminationReason::MaxRuntime)
        );
    }

    #[test]
    fn idle_takes_priority_over_max_runtime() {
        let start = Instant::now();
        let policy = TimeoutPolicy {
            idle: secs(30),
            probe_after: secs(10_000),
            probe_wait: secs(1),
            max_runtime: secs(20),
        };
        let mut monitor = OutputMonitor::new(policy, settings(), start);
        assert_eq!(
            monitor.tick(start + secs(31)),
            TickAction::Halt(TerminationReason::IdleTimeout)
        );
    }
}
