//! Supervisor and arbiter for autonomous coding-agent CLIs.
//!
//! Each round resets a git workspace to the remote branch, runs external
//! agent tools under timeout and health supervision, audits the completion
//! report each tool writes, and commits and pushes only approved, substantive
//! changes. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (output heuristics, timeout
//!   monitor, audit, change classification). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (config, processes, git, prompts,
//!   reports, run artifacts). Isolated behind traits where tests need to
//!   script behaviour.
//!
//! Orchestration modules ([`gate`], [`round`], [`looping`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod looping;
pub mod round;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
