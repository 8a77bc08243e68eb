//! kafka_conduit E2E Test Suite Orchestrator
//!
//! Runs the producer tests first, then the consumer group tests, which
//! depend on producing working.
//!
//! ## Exit Codes
//!
//! - 0: All tests passed
//! - 1: One or more tests failed

use kafka_conduit::logging::{self, LogLevel};
use kafka_test::setup::verify_server_ready;
use kafka_test::{
    test_group_receives_everything, test_key_routing, test_produce_and_read_back,
    test_rebalance_keeps_channel, test_restart_resumes_from_commit,
};

/// Test suite result tracking
struct TestSuiteResults {
    passed: usize,
    failed: usize,
    results: Vec<(&'static str, &'static str, bool)>, // (category, name, passed)
}

impl TestSuiteResults {
    fn new() -> Self {
        Self {
            passed: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    fn record(&mut self, category: &'static str, name: &'static str, passed: bool) {
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push((category, name, passed));
    }

    fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("TEST SUITE SUMMARY");
        println!("{}\n", "=".repeat(60));

        let mut current_category = "";
        for (category, name, passed) in &self.results {
            if *category != current_category {
                if !current_category.is_empty() {
                    println!();
                }
                println!("{}:", category);
                current_category = category;
            }
            let status = if *passed { "✅ PASSED" } else { "❌ FAILED" };
            println!("  {} - {}", name, status);
        }

        println!("\n{}", "-".repeat(60));
        println!(
            "Total: {} passed, {} failed, {} total",
            self.passed,
            self.failed,
            self.passed + self.failed
        );
    }
}

/// Run a single test and record the result
macro_rules! run_test {
    ($results:expr, $category:expr, $name:expr, $test_fn:expr) => {{
        let result = $test_fn.await;
        if let Err(e) = &result {
            println!("❌ Test failed: {}", e);
        }
        $results.record($category, $name, result.is_ok());
    }};
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(LogLevel::Warn);
    logging::init(level);

    println!("kafka_conduit E2E Test Suite\n");
    verify_server_ready().await?;

    let mut results = TestSuiteResults::new();

    // ==================== PRODUCER TESTS ====================
    run_test!(results, "Producer", "Produce and Read Back", test_produce_and_read_back());
    run_test!(results, "Producer", "Key Routing", test_key_routing());

    // ==================== CONSUMER GROUP TESTS ====================
    run_test!(
        results,
        "Consumer Group",
        "Receives Everything",
        test_group_receives_everything()
    );
    run_test!(
        results,
        "Consumer Group",
        "Rebalance Keeps Channel",
        test_rebalance_keeps_channel()
    );
    run_test!(
        results,
        "Consumer Group",
        "Restart Resumes From Commit",
        test_restart_resumes_from_commit()
    );

    results.print_summary();

    if results.failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
