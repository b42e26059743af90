//! Stable exit codes for autopilot CLI commands.

/// Command succeeded; for `run`, the last round succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid config, CLI usage or an artifact write error.
pub const INVALID: i32 = 1;
/// The last round ended paused (see `PAUSED_REASON.txt`).
pub const PAUSED: i32 = 2;
/// No enabled tool is left after filtering and availability checks.
pub const NO_TOOL: i32 = 3;
/// The remote could not be reached with the configured credentials.
pub const ACCESS_DENIED: i32 = 4;
