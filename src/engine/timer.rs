//! Named one-shot timers
//!
//! A timer arms a background sleep that delivers a [`TimerKind`] message onto
//! the owning interface's queue context when it expires. Re-arming cancels
//! the previous sleep; expiry delivery therefore always matches the latest
//! `start`.

use crate::daemon::DaemonMessage;
use crate::engine::NotifyHandle;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which timer fired; routed back to the owning interface by the daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Post-link-up settling delay
    SettlingDelay,
    /// Interval between test-runs
    TestInterval,
    /// Per-test response timeout
    TestResponse,
    /// Per-recovery-task response timeout
    RecoveryResponse,
}

/// One-shot timer with remaining-time introspection.
#[derive(Debug)]
pub struct Timer {
    label: &'static str,
    kind: TimerKind,
    notify: NotifyHandle,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl Timer {
    /// Create a disarmed timer.
    pub fn new(label: &'static str, kind: TimerKind, notify: NotifyHandle) -> Self {
        Self {
            label,
            kind,
            notify,
            deadline: None,
            cancel: None,
        }
    }

    /// Arm the timer for `timeout_ms` milliseconds, re-arming if running.
    pub fn start(&mut self, timeout_ms: u64) {
        self.stop();

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        self.deadline = Some(deadline);

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        let notify = self.notify.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = notify.tx.send(DaemonMessage::TimerExpired {
                        interface: notify.interface.clone(),
                        iface_id: notify.iface_id,
                        kind,
                    });
                }
            }
        });
    }

    /// Disarm the timer; a no-op when it is not running.
    pub fn stop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.deadline = None;
    }

    /// Whether the timer is armed and has not yet reached its deadline.
    pub fn is_running(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Milliseconds until expiry; 0 when not running.
    pub fn remaining_ms(&self) -> u64 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0)
    }

    /// Diagnostic label for dump output.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(tx: mpsc::UnboundedSender<DaemonMessage>) -> NotifyHandle {
        NotifyHandle {
            tx,
            interface: String::from("wan"),
            iface_id: 7,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_delivers_kind_and_owner() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new("test_interval_timer", TimerKind::TestInterval, handle(tx));

        timer.start(5_000);
        assert!(timer.is_running());
        assert!(timer.remaining_ms() <= 5_000);

        match rx.recv().await {
            Some(DaemonMessage::TimerExpired { interface, iface_id, kind }) => {
                assert_eq!(interface, "wan");
                assert_eq!(iface_id, 7);
                assert_eq!(kind, TimerKind::TestInterval);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(!timer.is_running());
        assert_eq!(timer.remaining_ms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_suppresses_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new("test_response_timer", TimerKind::TestResponse, handle(tx));

        timer.start(1_000);
        timer.stop();
        assert!(!timer.is_running());

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new("settling_delay_timer", TimerKind::SettlingDelay, handle(tx));

        timer.start(1_000);
        timer.start(10_000);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "cancelled arm must not fire");
        assert!(timer.is_running());

        assert!(rx.recv().await.is_some(), "replacement arm fires once");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
