mod kernel_test_scenarios;
mod suite_tests;
