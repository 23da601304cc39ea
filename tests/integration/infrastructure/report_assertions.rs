use serde_json::Value;

/// Asserts the `counts` object of a JSON report
pub fn assert_counts(report: &Value, total: u64, passed: u64, failed: u64) {
    let counts = &report["counts"];
    assert_eq!(counts["total"], total, "total in {report}");
    assert_eq!(counts["passed"], passed, "passed in {report}");
    assert_eq!(counts["failed"], failed, "failed in {report}");
}

/// Asserts the entry at `index` of the `tests` array
pub fn assert_test(report: &Value, index: usize, name: &str, status: &str, message: Option<&str>) {
    let test = &report["tests"][index];
    assert_eq!(test["type"], "kernel", "type of {test}");
    assert_eq!(test["name"], name, "name of {test}");
    assert_eq!(test["status"], status, "status of {test}");
    match message {
        Some(message) => assert_eq!(test["message"], message, "message of {test}"),
        None => assert!(test.get("message").is_none(), "unexpected message in {test}"),
    }
}

/// Names of the tests in the report, in order
pub fn test_names(report: &Value) -> Vec<String> {
    report["tests"]
        .as_array()
        .map(|tests| {
            tests
                .iter()
                .filter_map(|t| t["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
