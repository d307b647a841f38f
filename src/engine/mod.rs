//! Per-interface control engine
//!
//! An [`Interface`] couples three state machines — connection lifecycle,
//! test scheduling and operational classification — behind a serialised
//! event queue. Timers and child-process exits are delivered through the
//! daemon's message channel and re-enter the engine via [`Interface::handle_timer`]
//! and [`Interface::handle_process_exit`]; bus link events enter via
//! [`Interface::link_up`] / [`Interface::link_down`].

use crate::bus::Bus;
use crate::daemon::DaemonMessage;
use crate::domain::config::InterfaceConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod connection;
pub mod dump;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod tester;
pub mod timer;

pub use connection::{Connection, ConnectionState};
pub use queue::EventQueue;
pub use recovery::{Classification, Recovery};
pub use registry::Registry;
pub use tester::{Tester, TesterEvent, TesterState};

use process::{exit_status_passed, ProcessKind, ProcessRunner};
use timer::{Timer, TimerKind};

/// Shared dependencies handed to every interface controller.
pub struct EngineCtx {
    /// Bus used for events, link-state queries and metric adjustments
    pub bus: Arc<dyn Bus>,
    /// Channel all asynchronous sources deliver their messages on
    pub tx: mpsc::UnboundedSender<DaemonMessage>,
    /// Working directory containing the test executables
    pub test_dir: PathBuf,
    /// Working directory containing the recovery executables
    pub recovery_dir: PathBuf,
    next_interface_id: AtomicU64,
}

impl EngineCtx {
    /// Create a shared engine context.
    pub fn new(
        bus: Arc<dyn Bus>,
        tx: mpsc::UnboundedSender<DaemonMessage>,
        test_dir: PathBuf,
        recovery_dir: PathBuf,
    ) -> Self {
        Self {
            bus,
            tx,
            test_dir,
            recovery_dir,
            next_interface_id: AtomicU64::new(1),
        }
    }

    fn next_interface_id(&self) -> u64 {
        self.next_interface_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Address used by timers and process waiters to find their way back to the
/// owning interface through the daemon channel.
#[derive(Debug, Clone)]
pub struct NotifyHandle {
    /// Daemon message channel
    pub tx: mpsc::UnboundedSender<DaemonMessage>,
    /// Owning interface name
    pub interface: String,
    /// Owning interface instance id; guards against delivery to a later
    /// interface reusing the same name
    pub iface_id: u64,
}

/// One independently scheduled interface controller.
pub struct Interface {
    pub(crate) name: String,
    pub(crate) id: u64,
    pub(crate) ctx: Arc<EngineCtx>,
    pub(crate) config: InterfaceConfig,
    pub(crate) queue: EventQueue,
    pub(crate) connection: Connection,
    pub(crate) tester: Tester,
    pub(crate) recovery: Recovery,
}

impl Interface {
    /// Create a controller for `name` with `config`. The controller is inert
    /// until [`Interface::begin`] is called.
    pub fn new(ctx: Arc<EngineCtx>, name: String, config: InterfaceConfig) -> Self {
        let id = ctx.next_interface_id();
        let notify = NotifyHandle {
            tx: ctx.tx.clone(),
            interface: name.clone(),
            iface_id: id,
        };

        let connection = Connection::new(Timer::new(
            "settling_delay_timer",
            TimerKind::SettlingDelay,
            notify.clone(),
        ));
        let tester = Tester::new(
            ProcessRunner::new(ProcessKind::Test, notify.clone()),
            Timer::new("test_response_timer", TimerKind::TestResponse, notify.clone()),
            Timer::new("test_interval_timer", TimerKind::TestInterval, notify.clone()),
        );
        let recovery = Recovery::new(
            ProcessRunner::new(ProcessKind::Recovery, notify.clone()),
            Timer::new("recovery_task_timer", TimerKind::RecoveryResponse, notify),
        );

        Self {
            name,
            id,
            ctx,
            config,
            queue: EventQueue::new(),
            connection,
            tester,
            recovery,
        }
    }

    /// Interface name (primary key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance id used to fence stale timer and process notifications.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Active configuration.
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state
    }

    /// Current tester state.
    pub fn tester_state(&self) -> TesterState {
        self.tester.state
    }

    /// Current operational classification.
    pub fn classification(&self) -> Classification {
        self.recovery.classification
    }

    /// Announce the initial Operational classification and drive the
    /// connection FSM from the bus-reported link state.
    pub async fn begin(&mut self) {
        debug!(interface = %self.name, "begin");
        self.recovery.classification = Classification::Operational;
        self.recovery.recovery_index = 0;
        self.publish_operational(true).await;
        self.connection_begin().await;
    }

    /// Deliver `event` to the tester FSM with run-to-completion semantics:
    /// the first enqueuer drains the queue, events enqueued by handlers are
    /// picked up before control returns to the asynchronous source.
    pub async fn dispatch(&mut self, event: TesterEvent) {
        if !self.queue.push(event) {
            warn!(interface = %self.name, event = %event, "event queue full, dropping event");
            return;
        }
        self.drain_queue().await;
    }

    /// Enqueue an event from within a handler; the active drain loop will
    /// deliver it.
    pub(crate) fn post(&mut self, event: TesterEvent) {
        if !self.queue.push(event) {
            warn!(interface = %self.name, event = %event, "event queue full, dropping event");
        }
    }

    pub(crate) async fn drain_queue(&mut self) {
        if self.queue.is_draining() {
            return;
        }
        self.queue.begin_drain();
        while let Some(event) = self.queue.pop() {
            self.handle_tester_event(event).await;
        }
        self.queue.end_drain();
    }

    /// Route an expired timer to its state machine.
    pub async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::SettlingDelay => self.settling_delay_elapsed().await,
            TimerKind::TestInterval => self.dispatch(TesterEvent::IntervalTimerElapsed).await,
            TimerKind::TestResponse => self.dispatch(TesterEvent::TestTimedOut).await,
            TimerKind::RecoveryResponse => self.dispatch(TesterEvent::RecoveryTaskTimedOut).await,
        }
    }

    /// Route a child-process exit to its state machine. Stale notifications
    /// from killed or replaced children are dropped.
    pub async fn handle_process_exit(&mut self, kind: ProcessKind, generation: u64, raw_status: i32) {
        match kind {
            ProcessKind::Test => {
                if !self.tester.process.complete(generation) {
                    debug!(interface = %self.name, "ignoring stale test exit");
                    return;
                }
                let passed = exit_status_passed(raw_status);
                self.tester.last_test_exit_code = raw_status;
                self.tester.last_test_passed = passed;
                let event = if passed {
                    TesterEvent::TestPassed
                } else {
                    TesterEvent::TestFailed
                };
                self.dispatch(event).await;
            }
            ProcessKind::Recovery => {
                if !self.recovery.process.complete(generation) {
                    debug!(interface = %self.name, "ignoring stale recovery exit");
                    return;
                }
                self.dispatch(TesterEvent::RecoveryTaskEnded).await;
            }
        }
    }

    /// Swap in a changed configuration: stop the tester, restore the
    /// Operational classification, and restart with the rotation reset.
    pub async fn apply_config_update(&mut self, config: InterfaceConfig) {
        info!(interface = %self.name, "configuration changed, restarting tester");
        self.stop_tester();
        self.config = config;
        self.restore_operational().await;
        self.restart_tester();
        // a synthesised failure from a spawn error may be pending
        self.drain_queue().await;
    }

    /// Release everything the controller owns: both children, all timers,
    /// a live metrics adjustment and the per-interface bus object.
    pub async fn shutdown(&mut self) {
        debug!(interface = %self.name, "shutting down interface");

        let bus = self.ctx.bus.clone();
        if let Err(err) = bus.remove_interface_object(&self.name).await {
            debug!(interface = %self.name, error = %err, "failed to remove interface object");
        }

        self.recovery.process.kill();
        self.recovery.response_timer.stop();
        #[cfg(feature = "route-metrics")]
        if self.recovery.metrics_are_adjusted {
            self.adjust_route_metrics(0).await;
            self.recovery.metrics_are_adjusted = false;
        }
        self.recovery.recovery_index = 0;

        self.connection.settling_timer.stop();
        self.stop_tester();
        self.queue.clear();
    }
}
