use crate::descriptor::TestEntry;
use crate::driver::{self, DriverConfig};
use crate::error::{FailureKind, Stage, SuiteError, TestFailure};
use crate::http_server::{HttpServer, HttpServerConfig};
use crate::report::{SuiteReport, TestResult};
use tracing::{debug, error, info, warn};

/// Suite-wide policy
#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    /// Stop after the first failed test
    pub fail_fast: bool,
    /// Auxiliary HTTP server used by network-boot tests
    pub server: HttpServerConfig,
}

/// Runs tests one after another with the HTTP server up for the whole run.
///
/// Individual test failures end up in the report; only failing to start the
/// server aborts the run. The server is stopped before this returns.
pub async fn run_suite(
    tests: &[TestEntry],
    options: &SuiteOptions,
    driver_config: &DriverConfig,
) -> Result<SuiteReport, SuiteError> {
    let server = HttpServer::start(options.server.clone()).map_err(|source| SuiteError::Server {
        port: options.server.port,
        source,
    })?;
    debug!("Auxiliary HTTP server listening on {}", server.local_addr());

    let results = run_tests(tests, options.fail_fast, driver_config).await;

    server.stop().await;
    Ok(SuiteReport::new(results))
}

async fn run_tests(
    tests: &[TestEntry],
    fail_fast: bool,
    driver_config: &DriverConfig,
) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(tests.len());
    for entry in tests {
        info!("Running {} test {}", entry.kind, entry.name);
        match run_test(entry, driver_config).await {
            Ok(()) => results.push(TestResult::passed(entry)),
            Err(failure) => {
                error!(
                    "Test {} failed at {}: {} ({}).",
                    entry.name, failure.stage, failure.message, failure.diagnostic
                );
                if let Some(detail) = failure.kind.detail() {
                    debug!("Test {} failure detail: {}", entry.name, detail);
                }
                results.push(TestResult::failed(entry, failure.message));
                if fail_fast {
                    warn!("Fail fast turned on, terminating immediately.");
                    break;
                }
            }
        }
    }
    results
}

async fn run_test(entry: &TestEntry, driver_config: &DriverConfig) -> Result<(), TestFailure> {
    match entry.kind.as_str() {
        "kernel" => driver::run_kernel_test(&entry.name, driver_config).await,
        other => Err(TestFailure::new(
            Stage::Initialization,
            FailureKind::Setup,
            format!("unknown test type {} for {}", other, entry.name),
            "",
        )),
    }
}
