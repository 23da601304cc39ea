use crate::integration::infrastructure::*;
use anyhow::Result;

#[tokio::test]
async fn test_passing_kernel_test_with_json_report() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.simulator_output(
        "timer",
        "[EXPECTED BLOCK]: tick\n[EXPECTED BLOCK]: tock\ntick\ntock\n\
         [EXPECTED]: 5\n[ ACTUAL ]: 5\nTest finished.\n",
    )?;

    let output = harness
        .run_tests(&[
            "kernel",
            "timer:m16:DFAST",
            "--configure-arg=--memory-size=4",
            "--json-report",
            "report.json",
        ])
        .await?;
    assert!(output.status.success(), "stderr: {}", output.stderr);

    let report = harness.read_json("report.json")?;
    assert_counts(&report, 1, 1, 0);
    assert_test(&report, 0, "timer:m16:DFAST", "passed", None);

    let build_dir = harness.build_dir("timer:m16:DFAST")?;
    let args = std::fs::read_to_string(build_dir.join("configure.args"))?;
    assert_eq!(
        args.trim_end(),
        "--verbose --kernel-test=timer --memory-size=4 --memory-size=16 --kernel-cflags=FAST"
    );
    Ok(())
}

#[tokio::test]
async fn test_configure_failure_is_reported() -> Result<()> {
    let harness = ToolchainHarness::new()?;

    let output = harness
        .run_tests(&["kernel", "broken", "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stderr.contains("configuration failed"), "stderr: {}", output.stderr);
    assert!(output.stderr.contains("There were failures: 0 passed, 1 failed."));

    let report = harness.read_json("report.json")?;
    assert_test(&report, 0, "broken", "failed", Some("configuration failed"));

    let log = std::fs::read_to_string(harness.build_dir("broken")?.join("configure.log"))?;
    assert_eq!(log, "configure: no such test\n");
    Ok(())
}

#[tokio::test]
async fn test_verification_mismatch_writes_report_log() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.simulator_output("math", "[EXPECTED]: 4\n[ ACTUAL ]: 5\nTest finished.\n")?;

    let output = harness
        .run_tests(&["kernel", "math", "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));

    let report = harness.read_json("report.json")?;
    assert_test(&report, 0, "math", "failed", Some("test failed"));

    let log = std::fs::read_to_string(harness.build_dir("math")?.join("report.log"))?;
    assert_eq!(log, "Mismatch on lines 1 and 2 (\"4\" != \"5\")\n");
    Ok(())
}

#[tokio::test]
async fn test_expected_panic() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.simulator_output("oops", "[ ENDS WITH PANIC ]\nKernel panic: on purpose\n")?;
    harness.simulator_output("calm", "[ ENDS WITH PANIC ]\nTest finished.\n")?;

    let output = harness
        .run_tests(&["kernel", "oops", "calm", "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));

    let report = harness.read_json("report.json")?;
    assert_counts(&report, 2, 1, 1);
    assert_test(&report, 0, "oops", "passed", None);
    assert_test(&report, 1, "calm", "failed", Some("test failed (did not panic)"));
    Ok(())
}

#[tokio::test]
async fn test_simulator_timeout() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.write_tool("msim", "echo started; sleep 30")?;

    let output = harness
        .run_tests(&[
            "kernel",
            "hang",
            "--execute-timeout-secs",
            "1",
            "--json-report",
            "report.json",
        ])
        .await?;
    assert_eq!(output.status.code(), Some(1));

    let report = harness.read_json("report.json")?;
    let message = report["tests"][0]["message"].as_str().unwrap_or_default().to_string();
    assert!(message.ends_with("timed-out"), "message: {message}");

    let log = std::fs::read_to_string(harness.build_dir("hang")?.join("msim.log"))?;
    assert_eq!(log, "started\n");
    Ok(())
}

#[tokio::test]
async fn test_unknown_descriptor_directive() -> Result<()> {
    let harness = ToolchainHarness::new()?;

    let output = harness
        .run_tests(&["kernel", "basic:x1", "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));

    let report = harness.read_json("report.json")?;
    assert_test(&report, 0, "basic:x1", "failed", Some("initialization failed"));
    Ok(())
}
