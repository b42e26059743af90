//! Outer driver for `autopilot run`: repeat rounds on an interval.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::types::{RoundOutcome, RoundStatus};
use crate::io::history::{
    append_round_history, clear_pause_reason, write_first_round_report, write_pause_reason,
};
use crate::round::RoundOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Stop after the first round.
    pub once: bool,
    /// Sleep between rounds.
    pub interval: Duration,
    /// Id of the first round.
    pub first_round: u32,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            once: false,
            interval: Duration::from_secs(3600),
            first_round: 1,
        }
    }
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// `once` was set and the round succeeded.
    Once,
    /// A round ended paused.
    Paused,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub rounds_executed: u32,
    pub stop: LoopStop,
    pub last: RoundOutcome,
}

/// Run rounds until one pauses, or after one round when `once` is set.
///
/// Every round is appended to the history; a paused round writes the pause
/// record and a successful one clears it. The first round also writes the
/// first-round report. Only artifact write failures are returned as errors.
pub fn run_loop<F: FnMut(&RoundOutcome)>(
    log_dir: &Path,
    orchestrator: &RoundOrchestrator<'_>,
    options: LoopOptions,
    mut on_round: F,
) -> Result<LoopOutcome> {
    let mut rounds_executed = 0u32;
    let mut round_id = options.first_round.max(1);
    loop {
        let outcome = orchestrator.run_round(round_id);
        rounds_executed += 1;
        record_round(log_dir, &outcome)?;
        if rounds_executed == 1 {
            write_first_round_report(log_dir, &outcome)?;
        }
        on_round(&outcome);

        if outcome.status == RoundStatus::Paused {
            warn!(round_id, message = %outcome.message, "round paused, stopping");
            return Ok(LoopOutcome {
                rounds_executed,
                stop: LoopStop::Paused,
                last: outcome,
            });
        }
        if options.once {
            return Ok(LoopOutcome {
                rounds_executed,
                stop: LoopStop::Once,
                last: outcome,
            });
        }
        info!(round_id, sleep_secs = options.interval.as_secs(), "round complete, sleeping");
        thread::sleep(options.interval);
        round_id += 1;
    }
}

/// Append history and update the pause record for one finished round.
pub fn record_round(log_dir: &Path, outcome: &RoundOutcome) -> Result<()> {
    let now = Utc::now();
    append_round_history(log_dir, outcome, now)?;
    match outcome.status {
        RoundStatus::Paused => write_pause_reason(log_dir, outcome, now),
        RoundStatus::Success => clear_pause_reason(log_dir),
    }
}
