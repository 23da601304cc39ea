use crate::descriptor::TestEntry;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// Outcome of one test as it appears in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    pub fn passed(entry: &TestEntry) -> Self {
        Self {
            kind: entry.kind.clone(),
            name: entry.name.clone(),
            status: TestStatus::Passed,
            message: None,
        }
    }

    pub fn failed(entry: &TestEntry, message: impl Into<String>) -> Self {
        Self {
            kind: entry.kind.clone(),
            name: entry.name.clone(),
            status: TestStatus::Failed,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Results of a suite run in execution order.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    #[serde(rename = "counts")]
    pub totals: Totals,
    #[serde(rename = "tests")]
    pub results: Vec<TestResult>,
    pub generated_at: String,
}

impl SuiteReport {
    pub fn new(results: Vec<TestResult>) -> Self {
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        Self {
            totals: Totals {
                total: results.len(),
                passed,
                failed: results.len() - passed,
            },
            results,
            generated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.totals.failed == 0
    }

    /// Logs a human readable summary.
    pub fn log_summary(&self) {
        info!("");
        info!("Test run report:");
        info!("");
        for result in &self.results {
            match (&result.status, &result.message) {
                (TestStatus::Passed, _) => info!(" - {} passed", result.name),
                (TestStatus::Failed, Some(message)) => {
                    info!(" - {} FAILED ({})", result.name, message)
                }
                (TestStatus::Failed, None) => info!(" - {} FAILED", result.name),
            }
        }
        info!("");
        if self.all_passed() {
            info!("All tests passed.");
        } else {
            info!(
                "There were failures: {} passed, {} failed.",
                self.totals.passed, self.totals.failed
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        writeln!(file)?;
        file.flush()
    }
}
