pub mod report_assertions;
pub mod toolchain_harness;

pub use report_assertions::*;
pub use toolchain_harness::{RunOutput, ToolchainHarness};
