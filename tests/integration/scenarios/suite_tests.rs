use crate::integration::infrastructure::*;
use anyhow::Result;

fn write_suite(harness: &ToolchainHarness, name: &str, content: &str) -> Result<String> {
    std::fs::write(harness.path().join(name), content)?;
    Ok(name.to_string())
}

#[tokio::test]
async fn test_suite_runs_every_test() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.simulator_output("first", "Test finished.\n")?;
    harness.simulator_output("last", "Test finished.\n")?;
    let suite = write_suite(
        &harness,
        "basic.suite",
        "# basic tests\nkernel first\n\nkernel broken\nkernel last\n",
    )?;

    let output = harness
        .run_tests(&["suite", &suite, "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));

    let report = harness.read_json("report.json")?;
    assert_eq!(test_names(&report), vec!["first", "broken", "last"]);
    assert_counts(&report, 3, 2, 1);
    assert_test(&report, 1, "broken", "failed", Some("configuration failed"));
    Ok(())
}

#[tokio::test]
async fn test_suite_fail_fast() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    harness.simulator_output("first", "Test finished.\n")?;
    harness.simulator_output("last", "Test finished.\n")?;
    let suite = write_suite(&harness, "basic.suite", "kernel first\nkernel broken\nkernel last\n")?;

    let output = harness
        .run_tests(&["suite", &suite, "--fail-fast", "--json-report", "report.json"])
        .await?;
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stderr.contains("Fail fast turned on, terminating immediately."));

    let report = harness.read_json("report.json")?;
    assert_eq!(test_names(&report), vec!["first", "broken"]);
    assert_counts(&report, 2, 1, 1);
    assert!(harness.build_dir("last").is_err());
    Ok(())
}

#[tokio::test]
async fn test_several_suite_files_keep_order() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    for name in ["a", "b", "c"] {
        harness.simulator_output(name, "Test finished.\n")?;
    }
    let one = write_suite(&harness, "one.suite", "kernel b\n")?;
    let two = write_suite(&harness, "two.suite", "kernel c\nkernel a\n")?;

    let output = harness
        .run_tests(&["suite", &one, &two, "--json-report", "report.json"])
        .await?;
    assert!(output.status.success(), "stderr: {}", output.stderr);

    let report = harness.read_json("report.json")?;
    assert_eq!(test_names(&report), vec!["b", "c", "a"]);
    Ok(())
}

#[tokio::test]
async fn test_malformed_suite_file_is_rejected() -> Result<()> {
    let harness = ToolchainHarness::new()?;
    let suite = write_suite(&harness, "bad.suite", "kernel\n")?;

    let output = harness.run_tests(&["suite", &suite]).await?;
    assert!(!output.status.success());
    assert!(!harness.path().join("target").exists());
    Ok(())
}
