//! Per-interface statistics
//!
//! Counters come in per-connection and lifetime flavours: the per-connection
//! counters are cleared every time a connection settles, the lifetime totals
//! are never reset.

use serde::Serialize;

/// Counters for individual test executions.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TestStatistics {
    /// Passes since the current connection settled
    pub total_passes_this_connection: u64,
    /// Lifetime passes
    pub total_passes: u64,
    /// Failures since the current connection settled
    pub total_failures_this_connection: u64,
    /// Lifetime failures
    pub total_failures: u64,
}

/// Counters for completed test-runs.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TestRunStatistics {
    /// Current streak of passing test-runs
    pub consecutive_passes: u64,
    /// Passing test-runs since the current connection settled
    pub total_passes_this_connection: u64,
    /// Lifetime passing test-runs
    pub total_passes: u64,
    /// Current streak of failing test-runs
    pub consecutive_failures: u64,
    /// Failing test-runs since the current connection settled
    pub total_failures_this_connection: u64,
    /// Lifetime failing test-runs
    pub total_failures: u64,
}

/// Counters for recovery actions that actually started.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoveryStatistics {
    /// Recovery actions started since the current connection settled
    pub total_this_connection: u64,
    /// Lifetime recovery actions started
    pub total: u64,
}

/// All statistics kept for one interface.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TesterStatistics {
    /// Test-run counters
    pub test_runs: TestRunStatistics,
    /// Individual test counters
    pub tests: TestStatistics,
    /// Recovery action counters
    pub recovery: RecoveryStatistics,
}

impl TesterStatistics {
    /// Clear the per-connection counters; lifetime totals are untouched.
    pub fn reset_connection_counters(&mut self) {
        self.tests.total_passes_this_connection = 0;
        self.tests.total_failures_this_connection = 0;
        self.test_runs.total_passes_this_connection = 0;
        self.test_runs.total_failures_this_connection = 0;
        self.recovery.total_this_connection = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_preserves_lifetime_totals() {
        let mut stats = TesterStatistics::default();
        stats.tests.total_passes = 5;
        stats.tests.total_passes_this_connection = 3;
        stats.test_runs.total_failures = 2;
        stats.test_runs.total_failures_this_connection = 2;
        stats.test_runs.consecutive_failures = 2;
        stats.recovery.total = 4;
        stats.recovery.total_this_connection = 1;

        stats.reset_connection_counters();

        assert_eq!(stats.tests.total_passes, 5);
        assert_eq!(stats.tests.total_passes_this_connection, 0);
        assert_eq!(stats.test_runs.total_failures, 2);
        assert_eq!(stats.test_runs.total_failures_this_connection, 0);
        assert_eq!(stats.recovery.total, 4);
        assert_eq!(stats.recovery.total_this_connection, 0);
        // streaks span connections
        assert_eq!(stats.test_runs.consecutive_failures, 2);
    }
}
