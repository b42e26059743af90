//! Deterministic, pure logic shared by the autopilot.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod audit;
pub mod classifier;
pub mod monitor;
pub mod pass_rate;
pub mod signals;
pub mod types;
