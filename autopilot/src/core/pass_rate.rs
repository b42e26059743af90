//! Pass-rate parsing and estimation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::PassRate;

static FIRST_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());
static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());

/// Parse a reported pass rate. Text values use their first embedded number;
/// anything unparseable is 0.
pub fn parse_rate(value: &PassRate) -> f64 {
    match value {
        PassRate::Number(number) if number.is_finite() => *number,
        PassRate::Number(_) => 0.0,
        PassRate::Text(text) => FIRST_NUMBER_RE
            .find(text)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0),
    }
}

/// Where an estimated pass rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    /// Derived from `N passed` / `N failed` counts in the output.
    Counted,
    /// No usable counts; inferred from the command's exit code alone.
    ExitCode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassRateEstimate {
    pub rate: f64,
    pub basis: RateBasis,
}

/// Estimate a pass rate from validation output.
///
/// The last `N passed` and `N failed` counts win. Without both counts the
/// rate is 100 for a zero exit code and 0 otherwise, tagged
/// [`RateBasis::ExitCode`] because "no tests ran" looks the same as "all
/// passed" here.
pub fn estimate_pass_rate(output: &str, exit_code: i32) -> PassRateEstimate {
    let lowered = output.to_lowercase();
    let passed = last_count(&PASSED_RE, &lowered);
    let failed = last_count(&FAILED_RE, &lowered);

    if let (Some(passed), Some(failed)) = (passed, failed)
        && passed + failed > 0
    {
        return PassRateEstimate {
            rate: passed as f64 * 100.0 / (passed + failed) as f64,
            basis: RateBasis::Counted,
        };
    }

    PassRateEstimate {
        rate: if exit_code == 0 { 100.0 } else { 0.0 },
        basis: RateBasis::ExitCode,
    }
}

fn last_count(re: &Regex, text: &str) -> Option<u64> {
    re.captures_iter(text)
        .last()
        .and_then(|caps| caps[1].parse::<u64>().ok())
}
