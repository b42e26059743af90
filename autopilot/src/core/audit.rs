//! Approve/reject decision for a completion report.

use crate::core::pass_rate::parse_rate;
use crate::core::types::{AuditDecision, CompletionReport};

/// Run statuses accepted as a successful run (after trim + lowercase).
const SUCCESS_STATUSES: &[&str] = &["success", "ok", "passed", "true"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuditPolicy {
    /// Minimum pass rate in percent.
    pub min_pass_rate: f64,
    /// Reject synthesized reports outright.
    pub strict_require_real_report: bool,
}

/// Decide whether a report is approved.
///
/// Rejections are checked in order: synthesized report under strict mode,
/// unsuccessful run status, pass rate below the minimum.
pub fn decide(report: &CompletionReport, policy: &AuditPolicy) -> AuditDecision {
    let pass_rate = parse_rate(&report.test_pass_rate);
    let core_optimization = report.core_optimization.trim().to_string();

    if policy.strict_require_real_report && report.fallback_generated {
        return AuditDecision {
            approved: false,
            run_success: false,
            pass_rate,
            core_optimization,
            reason: "tool did not write its own report (fallback report only)".to_string(),
        };
    }

    let status = report.run_status.trim().to_lowercase();
    if !SUCCESS_STATUSES.contains(&status.as_str()) {
        return AuditDecision {
            approved: false,
            run_success: false,
            pass_rate,
            core_optimization,
            reason: format!("run status is not success ({})", report.run_status.trim()),
        };
    }

    if pass_rate < policy.min_pass_rate {
        return AuditDecision {
            approved: false,
            run_success: true,
            pass_rate,
            core_optimization,
            reason: format!(
                "test pass rate below threshold ({pass_rate:.2}% < {:.2}%)",
                policy.min_pass_rate
            ),
        };
    }

    AuditDecision {
        approved: true,
        run_success: true,
        pass_rate,
        core_optimization,
        reason: "approved".to_string(),
    }
}
