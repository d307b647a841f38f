//! Operational / broken classification and recovery-action rotation

use crate::bus::OutboundEvent;
use crate::engine::process::ProcessRunner;
use crate::engine::timer::Timer;
use crate::engine::Interface;
use tracing::{info, warn};

/// Published classification of an interface; distinct from link up/down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Test-runs are passing (or have not yet disproved it)
    Operational,
    /// The fail threshold has been reached
    Broken,
}

impl Classification {
    /// Stable name used in logs and dumps
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Operational => "operational",
            Classification::Broken => "broken",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery FSM state owned by one interface.
#[derive(Debug)]
pub struct Recovery {
    pub(crate) classification: Classification,
    /// Next recovery action in the round-robin rotation.
    pub(crate) recovery_index: usize,
    pub(crate) process: ProcessRunner,
    pub(crate) response_timer: Timer,
    #[cfg(feature = "route-metrics")]
    pub(crate) metrics_are_adjusted: bool,
}

impl Recovery {
    pub(crate) fn new(process: ProcessRunner, response_timer: Timer) -> Self {
        Self {
            classification: Classification::Operational,
            recovery_index: 0,
            process,
            response_timer,
            #[cfg(feature = "route-metrics")]
            metrics_are_adjusted: false,
        }
    }

    fn transition(&mut self, name: &str, new_state: Classification) {
        info!(interface = %name, from = %self.classification, to = %new_state, "classification change");
        self.classification = new_state;
    }
}

impl Interface {
    pub(crate) async fn publish_operational(&mut self, is_operational: bool) {
        let event = OutboundEvent::Operational {
            interface: self.name.clone(),
            is_operational,
        };
        if let Err(err) = self.ctx.bus.publish(event).await {
            warn!(interface = %self.name, error = %err, "failed to publish operational event");
        }
    }

    #[cfg(feature = "route-metrics")]
    pub(crate) async fn adjust_route_metrics(&mut self, amount: u32) {
        let bus = self.ctx.bus.clone();
        if let Err(err) = bus.adjust_route_metrics(&self.name, amount).await {
            warn!(interface = %self.name, amount, error = %err, "route metrics adjustment failed");
        }
    }

    /// Broken -> Operational: restart the recovery rotation, withdraw a live
    /// metrics adjustment and announce the flip.
    pub(crate) async fn transition_to_operational(&mut self) {
        self.recovery.transition(&self.name, Classification::Operational);
        self.recovery.recovery_index = 0;

        #[cfg(feature = "route-metrics")]
        if self.recovery.metrics_are_adjusted {
            self.adjust_route_metrics(0).await;
            self.recovery.metrics_are_adjusted = false;
        }

        self.publish_operational(true).await;
    }

    /// Operational -> Broken: apply the configured metrics penalty and
    /// announce the flip.
    pub(crate) async fn transition_to_broken(&mut self) {
        self.recovery.transition(&self.name, Classification::Broken);

        #[cfg(feature = "route-metrics")]
        if self.config.failing_tests_metrics_increase > 0 {
            let amount = self.config.failing_tests_metrics_increase;
            self.adjust_route_metrics(amount).await;
            self.recovery.metrics_are_adjusted = true;
        }

        self.publish_operational(false).await;
    }

    /// Restore the Operational classification after a config change without
    /// emitting a duplicate event when nothing flips.
    pub(crate) async fn restore_operational(&mut self) {
        if self.recovery.classification == Classification::Broken {
            self.transition_to_operational().await;
        } else {
            self.recovery.recovery_index = 0;
        }
    }

    /// Pick the recovery action to run next and advance the rotation.
    pub(crate) fn next_recovery_task_index(&mut self) -> usize {
        let num_tasks = self.config.recovery_tasks.len();
        let mut next_task = self.recovery.recovery_index;

        self.recovery.recovery_index += 1;
        if self.recovery.recovery_index >= num_tasks {
            self.recovery.recovery_index = 0;
        }

        // Shouldn't happen, but keep the index in bounds.
        if next_task >= num_tasks {
            warn!(interface = %self.name, index = next_task, max = num_tasks,
                  "recovery task index out of bounds");
            next_task = 0;
        }

        next_task
    }

    /// Start the recovery action at `task_index`. Returns false when the
    /// child could not be spawned; the action is then skipped entirely.
    pub(crate) fn run_recovery_task(&mut self, task_index: usize) -> bool {
        let task = &self.config.recovery_tasks[task_index];
        info!(interface = %self.name, label = %task.label, executable = %task.executable,
              index = task.index, "running recovery task");

        let args = [self.name.clone(), task.executable.clone(), task.params_json()];
        let started = self
            .recovery
            .process
            .start(&task.executable, &args, &self.ctx.recovery_dir);
        match started {
            Ok(()) => {
                let timeout_ms = u64::from(self.config.effective_timeout_secs(task)) * 1000;
                self.recovery.response_timer.start(timeout_ms);
                true
            }
            Err(err) => {
                warn!(interface = %self.name, executable = %task.executable, error = %err,
                      "failed to start recovery task");
                false
            }
        }
    }
}
