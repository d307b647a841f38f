//! Tester state machine
//!
//! Schedules test-runs over the configured probe executables, times them
//! out, derives test-run pass/fail from the success condition, and feeds the
//! result into the classification logic. Recovery actions launched by a
//! failing test-run are deliberately not killed when the interface
//! disconnects: the disconnect may be a consequence of the recovery itself.

use crate::bus::OutboundEvent;
use crate::domain::stats::TesterStatistics;
use crate::engine::process::{ProcessRunner, EXEC_FAILURE_STATUS};
use crate::engine::recovery::Classification;
use crate::engine::timer::Timer;
use crate::engine::ConnectionState;
use crate::engine::Interface;
use crate::domain::config::SuccessCondition;
use tracing::{debug, info, warn};

/// State of the test scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterState {
    /// Not running; the connection has not settled
    Stopped,
    /// Between test-runs, waiting for the interval timer
    Sleeping,
    /// A test child is in flight
    Testing,
    /// A recovery action is in flight
    Recovering,
}

impl TesterState {
    /// Stable name used in logs and dumps
    pub fn as_str(&self) -> &'static str {
        match self {
            TesterState::Stopped => "stopped",
            TesterState::Sleeping => "sleeping",
            TesterState::Testing => "testing",
            TesterState::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for TesterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events consumed by the tester state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterEvent {
    /// The connection dropped after having settled
    InterfaceDisconnected,
    /// The settling delay after link-up ran out
    InterfaceSettled,
    /// The between-runs interval timer fired
    IntervalTimerElapsed,
    /// An external request to start a test-run immediately
    TestRunRequested,
    /// The current test exited with status 0
    TestPassed,
    /// The current test exited with a non-zero status
    TestFailed,
    /// The current test outlived its response timeout
    TestTimedOut,
    /// The current recovery action exited
    RecoveryTaskEnded,
    /// The current recovery action outlived its response timeout
    RecoveryTaskTimedOut,
}

impl TesterEvent {
    /// Stable name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TesterEvent::InterfaceDisconnected => "connection disconnected",
            TesterEvent::InterfaceSettled => "connection settled",
            TesterEvent::IntervalTimerElapsed => "interval timer elapsed",
            TesterEvent::TestRunRequested => "start_test_run",
            TesterEvent::TestPassed => "test passed",
            TesterEvent::TestFailed => "test failed",
            TesterEvent::TestTimedOut => "test timed out",
            TesterEvent::RecoveryTaskEnded => "recovery task ended",
            TesterEvent::RecoveryTaskTimedOut => "recovery task timed out",
        }
    }
}

impl std::fmt::Display for TesterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tester FSM state owned by one interface.
#[derive(Debug)]
pub struct Tester {
    pub(crate) state: TesterState,
    /// Position in the test list during a test-run.
    pub(crate) test_index: usize,
    pub(crate) process: ProcessRunner,
    pub(crate) response_timer: Timer,
    pub(crate) interval_timer: Timer,
    /// Raw wait status of the last completed test.
    pub(crate) last_test_exit_code: i32,
    pub(crate) last_test_passed: bool,
    pub(crate) stats: TesterStatistics,
}

impl Tester {
    pub(crate) fn new(process: ProcessRunner, response_timer: Timer, interval_timer: Timer) -> Self {
        Self {
            state: TesterState::Stopped,
            test_index: 0,
            process,
            response_timer,
            interval_timer,
            last_test_exit_code: 0,
            last_test_passed: false,
            stats: TesterStatistics::default(),
        }
    }

    fn transition(&mut self, name: &str, new_state: TesterState) {
        info!(interface = %name, from = %self.state, to = %new_state, "tester state change");
        self.state = new_state;
    }
}

impl Interface {
    pub(crate) async fn handle_tester_event(&mut self, event: TesterEvent) {
        debug!(interface = %self.name, event = %event, state = %self.tester.state,
               "handling tester event");

        let handled = match self.tester.state {
            TesterState::Stopped => self.stopped_state_event(event),
            TesterState::Sleeping => self.sleeping_state_event(event),
            TesterState::Testing => self.testing_state_event(event).await,
            TesterState::Recovering => self.recovering_state_event(event),
        };

        if handled {
            debug!(interface = %self.name, event = %event, state = %self.tester.state,
                   "handled tester event");
        } else {
            debug!(interface = %self.name, event = %event, state = %self.tester.state,
                   "unhandled tester event");
        }
    }

    fn stopped_state_event(&mut self, event: TesterEvent) -> bool {
        match event {
            TesterEvent::InterfaceSettled => {
                self.tester.stats.reset_connection_counters();
                self.start_tester();
                true
            }
            // A recovery task may outlive the connection it was started on;
            // its completion lands here and is consumed silently.
            TesterEvent::RecoveryTaskEnded | TesterEvent::RecoveryTaskTimedOut => true,
            _ => false,
        }
    }

    fn sleeping_state_event(&mut self, event: TesterEvent) -> bool {
        match event {
            TesterEvent::TestRunRequested => {
                self.tester.interval_timer.stop();
                self.start_tester();
                true
            }
            TesterEvent::IntervalTimerElapsed => {
                self.start_tester();
                true
            }
            TesterEvent::InterfaceDisconnected => {
                self.stop_tester();
                true
            }
            _ => false,
        }
    }

    async fn testing_state_event(&mut self, event: TesterEvent) -> bool {
        match event {
            TesterEvent::TestPassed => {
                self.tester.response_timer.stop();
                self.test_passed().await;
                true
            }
            TesterEvent::TestFailed => {
                self.tester.response_timer.stop();
                self.test_failed().await;
                true
            }
            TesterEvent::TestTimedOut => {
                // The test took too long to complete. Call this a failure.
                self.tester.process.kill();
                self.test_failed().await;
                true
            }
            TesterEvent::InterfaceDisconnected => {
                self.stop_tester();
                true
            }
            _ => false,
        }
    }

    fn recovering_state_event(&mut self, event: TesterEvent) -> bool {
        match event {
            TesterEvent::RecoveryTaskTimedOut => {
                self.recovery.process.kill();
                self.tester_sleep();
                true
            }
            TesterEvent::RecoveryTaskEnded => {
                self.recovery.response_timer.stop();
                self.tester_sleep();
                true
            }
            TesterEvent::InterfaceDisconnected => {
                self.stop_tester();
                true
            }
            _ => false,
        }
    }

    /// Stop testing: kill the test child, stop the tester's timers. The
    /// recovery task is not stopped — the interface disconnecting may be a
    /// normal part of the recovery process.
    pub(crate) fn stop_tester(&mut self) {
        self.tester.transition(&self.name, TesterState::Stopped);
        self.tester.process.kill();
        self.tester.response_timer.stop();
        self.tester.interval_timer.stop();
        self.tester.test_index = 0;
    }

    /// Begin a test-run if the connection has settled.
    ///
    /// The recovery index is left alone: the interface may have been
    /// reconnected by a recovery task, and the rotation must continue across
    /// connection instances while the interface stays broken.
    pub(crate) fn start_tester(&mut self) {
        if self.connection.state != ConnectionState::Connected {
            debug!(interface = %self.name, "not connected, tester stays stopped");
            return;
        }
        self.tester.transition(&self.name, TesterState::Testing);
        self.tester.test_index = 0;
        self.run_test();
    }

    /// Restart testing after a configuration change; the rotation starts
    /// afresh because the recovery task list may have changed.
    pub(crate) fn restart_tester(&mut self) {
        self.recovery.recovery_index = 0;
        self.start_tester();
    }

    /// Spawn the test at `test_index`. A spawn failure counts as the test
    /// having failed with an exec error.
    fn run_test(&mut self) {
        let test = &self.config.tests[self.tester.test_index];
        debug!(interface = %self.name, label = %test.label, executable = %test.executable,
               index = test.index, "running test");

        let args = [self.name.clone(), test.executable.clone(), test.params_json()];
        let started = self
            .tester
            .process
            .start(&test.executable, &args, &self.ctx.test_dir);
        match started {
            Ok(()) => {
                let timeout_ms = u64::from(self.config.effective_timeout_secs(test)) * 1000;
                self.tester.response_timer.start(timeout_ms);
            }
            Err(err) => {
                warn!(interface = %self.name, executable = %test.executable, error = %err,
                      "failed to start test process");
                self.tester.last_test_exit_code = EXEC_FAILURE_STATUS;
                self.tester.last_test_passed = false;
                self.post(TesterEvent::TestFailed);
            }
        }
    }

    async fn test_passed(&mut self) {
        debug!(interface = %self.name, "test passed");

        self.tester.stats.tests.total_passes_this_connection += 1;
        self.tester.stats.tests.total_passes += 1;

        match self.config.success_condition {
            SuccessCondition::OneTestMustPass => {
                // One test had to pass; the test-run passed.
                self.test_run_completed(true).await;
            }
            SuccessCondition::AllTestsMustPass => {
                self.tester.test_index += 1;
                if self.tester.test_index >= self.config.tests.len() {
                    // The last test in the list passed; the test-run passed.
                    self.test_run_completed(true).await;
                } else {
                    self.run_test();
                }
            }
        }
    }

    async fn test_failed(&mut self) {
        debug!(interface = %self.name, "test failed");

        self.tester.stats.tests.total_failures_this_connection += 1;
        self.tester.stats.tests.total_failures += 1;

        match self.config.success_condition {
            SuccessCondition::OneTestMustPass => {
                self.tester.test_index += 1;
                if self.tester.test_index >= self.config.tests.len() {
                    // The last test in the list failed; the test-run failed.
                    self.test_run_completed(false).await;
                } else {
                    self.run_test();
                }
            }
            SuccessCondition::AllTestsMustPass => {
                // All tests had to pass, but one failed; the test-run failed.
                self.test_run_completed(false).await;
            }
        }
    }

    async fn test_run_completed(&mut self, passed: bool) {
        self.tester.test_index = 0;

        let event = OutboundEvent::TestRun {
            interface: self.name.clone(),
            passed,
        };
        if let Err(err) = self.ctx.bus.publish(event).await {
            warn!(interface = %self.name, error = %err, "failed to publish test run event");
        }

        if passed {
            self.test_run_passed().await;
        } else {
            self.test_run_failed().await;
        }

        if self.tester.state != TesterState::Recovering {
            self.tester_sleep();
        }
    }

    async fn test_run_passed(&mut self) {
        let stats = &mut self.tester.stats.test_runs;
        stats.consecutive_failures = 0;
        stats.consecutive_passes += 1;
        stats.total_passes_this_connection += 1;
        stats.total_passes += 1;

        info!(interface = %self.name, consecutive = stats.consecutive_passes, "test run passed");

        if self.recovery.classification == Classification::Broken
            && self.tester.stats.test_runs.consecutive_passes == u64::from(self.config.pass_threshold)
        {
            info!(interface = %self.name, "pass threshold reached");
            self.transition_to_operational().await;
        }
    }

    async fn test_run_failed(&mut self) {
        let stats = &mut self.tester.stats.test_runs;
        stats.consecutive_passes = 0;
        stats.consecutive_failures += 1;
        stats.total_failures_this_connection += 1;
        stats.total_failures += 1;

        info!(interface = %self.name, consecutive = stats.consecutive_failures, "test run failed");

        let consecutive_failures = self.tester.stats.test_runs.consecutive_failures;
        let threshold_reached = self.config.fail_threshold == 0
            || consecutive_failures % u64::from(self.config.fail_threshold) == 0;

        if threshold_reached {
            if self.recovery.classification == Classification::Operational {
                info!(interface = %self.name, "failure threshold reached");
                self.transition_to_broken().await;
            }

            // Perform the next recovery action if any have been configured.
            if !self.config.recovery_tasks.is_empty() {
                let task_index = self.next_recovery_task_index();
                if self.run_recovery_task(task_index) {
                    self.tester.stats.recovery.total_this_connection += 1;
                    self.tester.stats.recovery.total += 1;
                    self.tester.transition(&self.name, TesterState::Recovering);
                }
            }
        }
    }

    /// Enter Sleeping with the interval appropriate to the current health.
    fn tester_sleep(&mut self) {
        let interval_secs = if self.recovery.classification == Classification::Operational
            && self.tester.stats.test_runs.consecutive_failures == 0
        {
            self.config.passing_interval_secs
        } else {
            self.config.failing_interval_secs
        };

        self.tester.transition(&self.name, TesterState::Sleeping);
        self.tester.interval_timer.start(u64::from(interval_secs) * 1000);
    }
}
