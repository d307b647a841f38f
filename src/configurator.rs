//! Configurator event loop
//!
//! Watches the bus for the daemon's presence, feeds it the configuration
//! document whenever it announces itself, and runs the operator-supplied
//! notifier executable on every operational transition.

use crate::bus::socket::SocketBus;
use crate::bus::{Incoming, OPERATIONAL_TOPIC, TESTER_OBJECT};
use crate::domain::error::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Timeout for the `config` push and other calls made by the configurator.
pub const CONFIGURATOR_CALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for [`run`].
#[derive(Debug, Clone)]
pub struct ConfiguratorOptions {
    /// Broker socket path
    pub socket_path: PathBuf,
    /// Configuration file pushed to the daemon
    pub config_file: PathBuf,
    /// Notifier executable run on operational transitions
    pub event_processor: Option<PathBuf>,
}

/// Run the configurator until the bus connection is lost.
pub async fn run(options: ConfiguratorOptions) -> Result<()> {
    let (bus, mut incoming) = SocketBus::connect(&options.socket_path, CONFIGURATOR_CALL_TIMEOUT).await?;
    bus.subscribe("interface.tester*").await?;
    info!("configurator started");

    while let Some(item) = incoming.recv().await {
        match item {
            Incoming::Event { topic, payload } if topic == TESTER_OBJECT => {
                let state = payload.get("state").and_then(Value::as_str);
                if state == Some("up") {
                    push_config(&bus, &options.config_file).await;
                }
            }
            Incoming::Event { topic, payload } if topic == OPERATIONAL_TOPIC => {
                handle_operational_event(options.event_processor.as_deref(), &payload);
            }
            Incoming::Event { .. } => {}
            Incoming::Call { object, method, reply, .. } => {
                let _ = reply.send(Err(format!("unknown method: {object}.{method}")));
            }
        }
    }

    Ok(())
}

/// Read the configuration file and hand it to the daemon's `config` RPC.
/// Failures are logged and do not abort the configurator.
async fn push_config(bus: &SocketBus, config_file: &Path) {
    let document: Result<Value> = async {
        let bytes = tokio::fs::read(config_file).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
    .await;
    let document = match document {
        Ok(document) => document,
        Err(err) => {
            warn!(path = %config_file.display(), error = %err, "failed to read configuration file");
            return;
        }
    };

    match bus.call(TESTER_OBJECT, "config", document).await {
        Ok(_) => info!("configuration pushed to interface tester"),
        Err(err) => warn!(error = %err, "failed to push configuration"),
    }
}

fn handle_operational_event(event_processor: Option<&Path>, payload: &Value) {
    let Some(processor) = event_processor else {
        return;
    };
    let Some(interface) = payload.get("interface").and_then(Value::as_str) else {
        return;
    };
    let Some(is_operational) = payload.get("is_operational").and_then(Value::as_bool) else {
        return;
    };

    run_event_processor(processor, interface, is_operational);
}

/// Spawn the notifier as `./<name> <interface> operational|broken` from its
/// own directory with a scrubbed environment. Fire and forget; the exit
/// status is only logged.
fn run_event_processor(processor: &Path, interface: &str, is_operational: bool) {
    let Some(file_name) = processor.file_name() else {
        warn!(path = %processor.display(), "event processor path has no file name");
        return;
    };
    let working_dir = processor.parent().unwrap_or_else(|| Path::new("."));
    let program = PathBuf::from(".").join(file_name);
    let state = if is_operational { "operational" } else { "broken" };

    debug!(interface = %interface, state, "running event processor");

    let spawned = Command::new(&program)
        .arg(interface)
        .arg(state)
        .current_dir(working_dir)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(mut child) => {
            let interface = interface.to_owned();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(interface = %interface, %status, "event processor finished"),
                    Err(err) => debug!(interface = %interface, error = %err, "event processor wait failed"),
                }
            });
        }
        Err(err) => {
            warn!(interface = %interface, error = %err, "failed to run event processor");
        }
    }
}
