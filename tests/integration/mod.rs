//! Integration testing framework for kernel-tester
//!
//! Runs the compiled binary against fake configure/make/simulator scripts.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{RunOutput, ToolchainHarness};
