//! Bus abstraction
//!
//! The engine talks to the IPC bus through the [`Bus`] trait and never sees
//! the transport. [`socket::SocketBus`] is the production binding; tests
//! substitute their own implementation.

use crate::domain::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;

pub mod socket;

/// Topic of the daemon up/down announcement and name of the daemon RPC object.
pub const TESTER_OBJECT: &str = "interface.tester";
/// Prefix of the per-interface RPC objects.
pub const INTERFACE_OBJECT_PREFIX: &str = "interface.tester.interface.";
/// Topic carrying operational/broken transitions.
pub const OPERATIONAL_TOPIC: &str = "interface.tester.operational";
/// Topic carrying completed test-run results.
pub const TEST_RUN_TOPIC: &str = "interface.tester.test_run";
/// Inbound topic carrying interface down actions.
pub const NETWORK_INTERFACE_TOPIC: &str = "network.interface";
/// Inbound topic carrying interface up states.
pub const INTERFACE_STATE_TOPIC: &str = "interface.state";

/// Events the daemon broadcasts on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// Daemon presence announcement
    TesterState {
        /// True on connect, false on orderly shutdown
        up: bool,
    },
    /// Classification flip of one interface
    Operational {
        /// Interface name
        interface: String,
        /// New classification
        is_operational: bool,
    },
    /// Completed test-run result of one interface
    TestRun {
        /// Interface name
        interface: String,
        /// Whether the run passed
        passed: bool,
    },
}

impl OutboundEvent {
    /// Bus topic the event is published under
    pub fn topic(&self) -> &'static str {
        match self {
            OutboundEvent::TesterState { .. } => TESTER_OBJECT,
            OutboundEvent::Operational { .. } => OPERATIONAL_TOPIC,
            OutboundEvent::TestRun { .. } => TEST_RUN_TOPIC,
        }
    }

    /// Wire payload of the event
    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::TesterState { up } => {
                json!({ "state": if *up { "up" } else { "down" } })
            }
            OutboundEvent::Operational { interface, is_operational } => {
                json!({ "is_operational": is_operational, "interface": interface })
            }
            OutboundEvent::TestRun { interface, passed } => {
                json!({ "result": if *passed { "pass" } else { "fail" }, "interface": interface })
            }
        }
    }
}

/// Reply carried back to the bus for an incoming call.
pub type CallReply = std::result::Result<Value, String>;

/// Inbound traffic surfaced by a bus transport.
#[derive(Debug)]
pub enum Incoming {
    /// A broadcast event we are subscribed to
    Event {
        /// Event topic
        topic: String,
        /// Event payload
        payload: Value,
    },
    /// An RPC call addressed to one of our registered objects
    Call {
        /// Target object
        object: String,
        /// Method name
        method: String,
        /// Call arguments
        args: Value,
        /// Channel the reply must be sent on
        reply: oneshot::Sender<CallReply>,
    },
}

/// Outbound bus operations used by the engine.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Broadcast an event.
    async fn publish(&self, event: OutboundEvent) -> Result<()>;

    /// Query the current link state of `interface`.
    async fn link_is_up(&self, interface: &str) -> Result<bool>;

    /// Set the route-metric adjustment of `interface` (0 removes it).
    async fn adjust_route_metrics(&self, interface: &str, adjustment: u32) -> Result<()>;

    /// Publish the per-interface RPC object for `interface`.
    async fn add_interface_object(&self, interface: &str) -> Result<()>;

    /// Remove the per-interface RPC object for `interface`.
    async fn remove_interface_object(&self, interface: &str) -> Result<()>;
}

/// Name of the per-interface RPC object for `interface`.
pub fn interface_object_name(interface: &str) -> String {
    format!("{INTERFACE_OBJECT_PREFIX}{interface}")
}
