//! Daemon event loop and RPC dispatch
//!
//! A single task owns every interface controller. Timers, child-exit
//! waiters and the bus adapter all funnel their work through one message
//! channel, which gives each interface a totally ordered event stream and
//! keeps the engine free of shared mutable state.

use crate::bus::socket::SocketBus;
use crate::bus::{
    Bus, CallReply, Incoming, OutboundEvent, INTERFACE_OBJECT_PREFIX, INTERFACE_STATE_TOPIC,
    NETWORK_INTERFACE_TOPIC, TESTER_OBJECT,
};
use crate::domain::config;
use crate::domain::error::{Error, Result};
use crate::engine::process::ProcessKind;
use crate::engine::timer::TimerKind;
use crate::engine::{EngineCtx, Registry, TesterEvent};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeout for synchronous bus calls made by the daemon.
pub const DAEMON_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between broker reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A message delivered to the daemon loop.
#[derive(Debug)]
pub enum DaemonMessage {
    /// Classified link event for one interface
    LinkEvent {
        /// Interface name
        interface: String,
        /// True for link-up, false for link-down
        up: bool,
    },
    /// A timer owned by one interface expired
    TimerExpired {
        /// Owning interface name
        interface: String,
        /// Owning interface instance id
        iface_id: u64,
        /// Which timer fired
        kind: TimerKind,
    },
    /// A child process owned by one interface exited
    ProcessExited {
        /// Owning interface name
        interface: String,
        /// Owning interface instance id
        iface_id: u64,
        /// Which runner the child belonged to
        kind: ProcessKind,
        /// Spawn generation, used to drop stale exits
        generation: u64,
        /// Raw wait status
        raw_status: i32,
    },
    /// An RPC addressed to the daemon or one of its interfaces
    Rpc(RpcRequest),
}

/// Routing target of an incoming RPC.
#[derive(Debug)]
pub enum RpcTarget {
    /// `interface.tester` `config`
    Config,
    /// `interface.tester` `state`
    State,
    /// `interface.tester` `config_reload`
    ConfigReload,
    /// Per-interface `state`
    InterfaceState(String),
    /// Per-interface `start_test_run`
    StartTestRun(String),
}

/// An incoming RPC with its reply channel.
#[derive(Debug)]
pub struct RpcRequest {
    /// What is being invoked
    pub target: RpcTarget,
    /// Call arguments
    pub args: Value,
    /// Channel the reply is sent on
    pub reply: oneshot::Sender<CallReply>,
}

/// Filesystem locations the daemon works with.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    /// Directory containing the test executables
    pub test_dir: PathBuf,
    /// Directory containing the recovery executables
    pub recovery_dir: PathBuf,
    /// Configuration file read at connect and on `config_reload`
    pub config_file: Option<PathBuf>,
}

/// The daemon: a registry of interface controllers plus the message channel
/// that drives them.
pub struct Daemon {
    ctx: Arc<EngineCtx>,
    registry: Registry,
    rx: Option<mpsc::UnboundedReceiver<DaemonMessage>>,
    config_file: Option<PathBuf>,
}

impl Daemon {
    /// Create a daemon using `bus` for all outbound bus traffic.
    pub fn new(bus: Arc<dyn Bus>, paths: DaemonPaths) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(EngineCtx::new(bus, tx, paths.test_dir, paths.recovery_dir));
        Self {
            ctx,
            registry: Registry::new(),
            rx: Some(rx),
            config_file: paths.config_file,
        }
    }

    /// Sender feeding the daemon's message channel.
    pub fn sender(&self) -> mpsc::UnboundedSender<DaemonMessage> {
        self.ctx.tx.clone()
    }

    /// The engine context shared with the controllers.
    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    /// Live interface controllers.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply a configuration document: diff against the live interfaces and
    /// add / update / remove controllers accordingly. A malformed document
    /// is rejected without touching the registry.
    pub async fn apply_config(&mut self, document: &Value) -> Result<()> {
        let parsed = config::parse_document(document)?;
        self.registry.begin_update();
        for (name, interface_config) in parsed {
            self.registry.stage(name, interface_config);
        }
        self.registry.flush(&self.ctx).await;
        Ok(())
    }

    /// Re-read the configuration file, if one was given. Failures are
    /// logged; the active configuration is kept.
    pub async fn reload_config_file(&mut self) {
        let Some(path) = self.config_file.clone() else {
            debug!("no configuration file configured");
            return;
        };
        let loaded: Result<Value> = async {
            let bytes = tokio::fs::read(&path).await?;
            Ok(serde_json::from_slice(&bytes)?)
        }
        .await;
        match loaded {
            Ok(document) => {
                if let Err(err) = self.apply_config(&document).await {
                    warn!(path = %path.display(), error = %err, "failed to load configuration");
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read configuration file");
            }
        }
    }

    /// Aggregated state dump, nested per interface name.
    pub fn state(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, iface) in self.registry.iter() {
            out.insert(name.clone(), iface.state_dump());
        }
        Value::Object(out)
    }

    /// Handle one daemon message.
    pub async fn handle_message(&mut self, message: DaemonMessage) {
        match message {
            DaemonMessage::LinkEvent { interface, up } => {
                match self.registry.get_mut(&interface) {
                    Some(iface) => {
                        if up {
                            iface.link_up();
                        } else {
                            iface.link_down().await;
                        }
                    }
                    None => debug!(interface = %interface, "link event for unknown interface"),
                }
            }
            DaemonMessage::TimerExpired { interface, iface_id, kind } => {
                if let Some(iface) = self.registry.get_mut(&interface) {
                    if iface.id() == iface_id {
                        iface.handle_timer(kind).await;
                    }
                }
            }
            DaemonMessage::ProcessExited { interface, iface_id, kind, generation, raw_status } => {
                if let Some(iface) = self.registry.get_mut(&interface) {
                    if iface.id() == iface_id {
                        iface.handle_process_exit(kind, generation, raw_status).await;
                    }
                }
            }
            DaemonMessage::Rpc(request) => self.handle_rpc(request).await,
        }
    }

    async fn handle_rpc(&mut self, request: RpcRequest) {
        let result = match request.target {
            RpcTarget::Config => self
                .apply_config(&request.args)
                .await
                .map(|_| json!({}))
                .map_err(|err| err.to_string()),
            RpcTarget::State => Ok(self.state()),
            RpcTarget::ConfigReload => {
                self.reload_config_file().await;
                Ok(json!({}))
            }
            RpcTarget::InterfaceState(name) => self
                .registry
                .get(&name)
                .map(|iface| iface.state_dump())
                .ok_or_else(|| format!("unknown interface: {name}")),
            RpcTarget::StartTestRun(name) => match self.registry.get_mut(&name) {
                Some(iface) => {
                    iface.dispatch(TesterEvent::TestRunRequested).await;
                    Ok(json!({}))
                }
                None => Err(format!("unknown interface: {name}")),
            },
        };
        let _ = request.reply.send(result);
    }

    /// Receive and handle one message; returns false once the channel is
    /// closed or the receiver has been taken by [`run`].
    pub async fn tick(&mut self) -> bool {
        let message = match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => return false,
        };
        match message {
            Some(message) => {
                self.handle_message(message).await;
                true
            }
            None => false,
        }
    }

    /// Handle messages that are already queued without waiting for more.
    pub async fn drain_queued(&mut self) {
        loop {
            let message = match self.rx.as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => return,
            };
            match message {
                Some(message) => self.handle_message(message).await,
                None => return,
            }
        }
    }

    /// Announce departure and tear down every interface.
    pub async fn shutdown(&mut self) {
        info!("interface tester stopping");
        let bus = self.ctx.bus.clone();
        if let Err(err) = bus.publish(OutboundEvent::TesterState { up: false }).await {
            debug!(error = %err, "failed to publish down event");
        }
        self.registry.clear().await;
    }

    fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<DaemonMessage>> {
        self.rx.take()
    }

    async fn republish_interface_objects(&self) {
        for name in self.registry.names() {
            if let Err(err) = self.ctx.bus.add_interface_object(&name).await {
                warn!(interface = %name, error = %err, "failed to publish interface object");
            }
        }
    }
}

/// Translate inbound bus traffic into daemon messages.
///
/// Only `network.interface` events with `action == "ifdown"` and
/// `interface.state` events with `state == "ifup"` are acted upon; other
/// actions and states are ignored.
pub fn spawn_bus_adapter(
    mut incoming: mpsc::UnboundedReceiver<Incoming>,
    tx: mpsc::UnboundedSender<DaemonMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = incoming.recv().await {
            match item {
                Incoming::Event { topic, payload } => {
                    if let Some(message) = classify_link_event(&topic, &payload) {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Incoming::Call { object, method, args, reply } => {
                    match classify_call(&object, &method) {
                        Some(target) => {
                            let forwarded = tx.send(DaemonMessage::Rpc(RpcRequest {
                                target,
                                args,
                                reply,
                            }));
                            if forwarded.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = reply.send(Err(format!("unknown method: {object}.{method}")));
                        }
                    }
                }
            }
        }
    })
}

fn classify_link_event(topic: &str, payload: &Value) -> Option<DaemonMessage> {
    let interface = payload.get("interface").and_then(Value::as_str)?;
    match topic {
        NETWORK_INTERFACE_TOPIC => {
            // Only "ifdown" is of interest here; the matching up transition
            // arrives on interface.state once routing has been set up.
            let action = payload.get("action").and_then(Value::as_str)?;
            (action == "ifdown").then(|| DaemonMessage::LinkEvent {
                interface: interface.to_owned(),
                up: false,
            })
        }
        INTERFACE_STATE_TOPIC => {
            let state = payload.get("state").and_then(Value::as_str)?;
            (state == "ifup").then(|| DaemonMessage::LinkEvent {
                interface: interface.to_owned(),
                up: true,
            })
        }
        _ => None,
    }
}

fn classify_call(object: &str, method: &str) -> Option<RpcTarget> {
    if object == TESTER_OBJECT {
        return match method {
            "config" => Some(RpcTarget::Config),
            "state" => Some(RpcTarget::State),
            "config_reload" => Some(RpcTarget::ConfigReload),
            _ => None,
        };
    }
    let interface = object.strip_prefix(INTERFACE_OBJECT_PREFIX)?;
    match method {
        "state" => Some(RpcTarget::InterfaceState(interface.to_owned())),
        "start_test_run" => Some(RpcTarget::StartTestRun(interface.to_owned())),
        _ => None,
    }
}


/// Bus handle whose underlying connection can be swapped on reconnect while
/// the engine keeps holding one `Arc<dyn Bus>`.
#[derive(Default)]
pub struct BusHandle {
    inner: RwLock<Option<Arc<dyn Bus>>>,
}

impl BusHandle {
    /// Create a disconnected handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a live connection.
    pub fn replace(&self, bus: Arc<dyn Bus>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(bus);
    }

    /// Drop the current connection.
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current(&self) -> Result<Arc<dyn Bus>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::bus("not connected"))
    }
}

#[async_trait::async_trait]
impl Bus for BusHandle {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        self.current()?.publish(event).await
    }

    async fn link_is_up(&self, interface: &str) -> Result<bool> {
        self.current()?.link_is_up(interface).await
    }

    async fn adjust_route_metrics(&self, interface: &str, adjustment: u32) -> Result<()> {
        self.current()?.adjust_route_metrics(interface, adjustment).await
    }

    async fn add_interface_object(&self, interface: &str) -> Result<()> {
        self.current()?.add_interface_object(interface).await
    }

    async fn remove_interface_object(&self, interface: &str) -> Result<()> {
        self.current()?.remove_interface_object(interface).await
    }
}

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Broker socket path
    pub socket_path: PathBuf,
    /// Filesystem locations
    pub paths: DaemonPaths,
}

async fn connect_and_announce(
    options: &DaemonOptions,
    handle: &Arc<BusHandle>,
    daemon: &mut Daemon,
    tx: &mpsc::UnboundedSender<DaemonMessage>,
) -> Result<JoinHandle<()>> {
    let (bus, incoming) = SocketBus::connect(&options.socket_path, DAEMON_CALL_TIMEOUT).await?;
    bus.register(TESTER_OBJECT).await?;
    bus.subscribe(NETWORK_INTERFACE_TOPIC).await?;
    bus.subscribe(INTERFACE_STATE_TOPIC).await?;
    handle.replace(bus);

    let adapter = spawn_bus_adapter(incoming, tx.clone());

    daemon.republish_interface_objects().await;
    daemon.reload_config_file().await;
    let bus = daemon.ctx.bus.clone();
    if let Err(err) = bus.publish(OutboundEvent::TesterState { up: true }).await {
        warn!(error = %err, "failed to publish up event");
    }
    info!("connected to bus");
    Ok(adapter)
}

/// Run the daemon until interrupted.
///
/// Failure to reach the broker at startup is fatal; a later broker
/// disconnect triggers reconnection with a fixed backoff.
pub async fn run(options: DaemonOptions) -> Result<()> {
    let handle = Arc::new(BusHandle::new());
    let mut daemon = Daemon::new(handle.clone(), options.paths.clone());
    let tx = daemon.sender();
    let mut rx = daemon
        .take_receiver()
        .ok_or_else(|| Error::internal("daemon receiver already taken"))?;

    let mut adapter = connect_and_announce(&options, &handle, &mut daemon, &tx).await?;
    info!("interface tester started");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    enum Action {
        Message(DaemonMessage),
        AdapterDown,
        Terminate,
    }

    loop {
        let action = tokio::select! {
            message = rx.recv() => match message {
                Some(message) => Action::Message(message),
                // All senders live in the daemon context; this cannot happen.
                None => Action::Terminate,
            },
            _ = &mut adapter => Action::AdapterDown,
            _ = sigterm.recv() => Action::Terminate,
            _ = sigint.recv() => Action::Terminate,
        };

        match action {
            Action::Message(message) => daemon.handle_message(message).await,
            Action::AdapterDown => {
                warn!("lost bus connection, reconnecting");
                handle.clear();
                loop {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    match connect_and_announce(&options, &handle, &mut daemon, &tx).await {
                        Ok(new_adapter) => {
                            adapter = new_adapter;
                            break;
                        }
                        Err(err) => debug!(error = %err, "reconnect attempt failed"),
                    }
                }
            }
            Action::Terminate => break,
        }
    }

    daemon.shutdown().await;
    Ok(())
}
