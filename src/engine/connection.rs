//! Connection state machine
//!
//! Tracks link state with a settling delay between link-up and the first
//! test-run, so that route and address setup can finish before probing
//! starts.

use crate::engine::timer::Timer;
use crate::engine::tester::TesterEvent;
use crate::engine::Interface;
use tracing::{debug, warn};

/// Link state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Link is down
    Disconnected,
    /// Link is up, waiting out the settling delay
    Settling,
    /// Link is up and settled
    Connected,
}

impl ConnectionState {
    /// Stable name used in logs and dumps
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Settling => "settling",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection FSM state owned by one interface.
#[derive(Debug)]
pub struct Connection {
    pub(crate) state: ConnectionState,
    pub(crate) settling_timer: Timer,
}

impl Connection {
    pub(crate) fn new(settling_timer: Timer) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            settling_timer,
        }
    }

    fn transition(&mut self, name: &str, new_state: ConnectionState) {
        debug!(interface = %name, from = %self.state, to = %new_state, "connection state change");
        self.state = new_state;
    }
}

impl Interface {
    /// The link came up; start settling unless already up.
    pub fn link_up(&mut self) {
        if self.connection.state == ConnectionState::Disconnected {
            let delay_ms = u64::from(self.config.settling_delay_secs) * 1000;
            self.connection.settling_timer.start(delay_ms);
            self.connection.transition(&self.name, ConnectionState::Settling);
        }
    }

    /// The link went down; the tester only learns about it if the connection
    /// had settled (a tester that never started has nothing to stop).
    pub async fn link_down(&mut self) {
        if self.connection.state != ConnectionState::Disconnected {
            let was_connected = self.connection.state == ConnectionState::Connected;
            self.connection.transition(&self.name, ConnectionState::Disconnected);
            self.connection.settling_timer.stop();
            if was_connected {
                self.dispatch(TesterEvent::InterfaceDisconnected).await;
            }
        }
    }

    /// The settling delay ran out.
    pub(crate) async fn settling_delay_elapsed(&mut self) {
        if self.connection.state == ConnectionState::Settling {
            self.connection.transition(&self.name, ConnectionState::Connected);
            self.dispatch(TesterEvent::InterfaceSettled).await;
        }
    }

    /// Query the current link state from the bus and drive the FSM
    /// accordingly. A failed query is treated as "link is down".
    pub(crate) async fn connection_begin(&mut self) {
        let bus = self.ctx.bus.clone();
        let is_up = match bus.link_is_up(&self.name).await {
            Ok(state) => state,
            Err(err) => {
                warn!(interface = %self.name, error = %err, "link state query failed, assuming down");
                false
            }
        };
        if is_up {
            self.link_up();
        } else {
            self.link_down().await;
        }
    }
}
