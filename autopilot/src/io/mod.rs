//! Side-effecting adapters: configuration, processes, git and run artifacts.

pub mod bootstrap;
pub mod config;
pub mod git;
pub mod history;
pub mod process;
pub mod prompt;
pub mod report;
pub mod supervisor;
pub mod tools;
pub mod transcript;
pub mod validation;
pub mod workspace;
