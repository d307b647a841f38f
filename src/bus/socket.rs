//! Unix-socket bus client
//!
//! Speaks newline-delimited JSON frames to an external broker. Frames are
//! either broadcast events, object registrations/subscriptions, or calls with
//! id-matched replies. Inbound events and calls are surfaced through an
//! [`Incoming`] channel; the connection is considered gone once that channel
//! closes.

use crate::bus::{interface_object_name, Bus, CallReply, Incoming, OutboundEvent};
use crate::domain::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Register {
        object: String,
    },
    Unregister {
        object: String,
    },
    Subscribe {
        pattern: String,
    },
    Event {
        topic: String,
        payload: Value,
    },
    Call {
        id: u64,
        object: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    Reply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<CallReply>>>>;

/// Bus client over a unix socket.
pub struct SocketBus {
    writer: mpsc::UnboundedSender<Frame>,
    pending: PendingCalls,
    next_call_id: AtomicU64,
    call_timeout: Duration,
}

impl SocketBus {
    /// Connect to the broker socket at `path`.
    ///
    /// Returns the client and the stream of inbound events and calls. The
    /// stream ends when the broker connection is lost.
    pub async fn connect(
        path: &Path,
        call_timeout: Duration,
    ) -> Result<(Arc<SocketBus>, mpsc::UnboundedReceiver<Incoming>)> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "failed to serialise bus frame");
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let bus = Arc::new(SocketBus {
            writer: writer_tx,
            pending: pending.clone(),
            next_call_id: AtomicU64::new(1),
            call_timeout,
        });

        let reply_writer = bus.writer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                if line.is_empty() {
                    continue;
                }
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "dropping unparseable bus frame");
                        continue;
                    }
                };
                match frame {
                    Frame::Event { topic, payload } => {
                        if incoming_tx.send(Incoming::Event { topic, payload }).is_err() {
                            break;
                        }
                    }
                    Frame::Call { id, object, method, args } => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        let forwarded = incoming_tx.send(Incoming::Call {
                            object,
                            method,
                            args,
                            reply: reply_tx,
                        });
                        if forwarded.is_err() {
                            break;
                        }
                        let writer = reply_writer.clone();
                        tokio::spawn(async move {
                            let reply = reply_rx
                                .await
                                .unwrap_or_else(|_| Err(String::from("request dropped")));
                            let frame = match reply {
                                Ok(result) => Frame::Reply { id, result: Some(result), error: None },
                                Err(message) => Frame::Reply { id, result: None, error: Some(message) },
                            };
                            let _ = writer.send(frame);
                        });
                    }
                    Frame::Reply { id, result, error } => {
                        let slot = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                        match slot {
                            Some(tx) => {
                                let reply = match error {
                                    Some(message) => Err(message),
                                    None => Ok(result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(reply);
                            }
                            None => debug!(id, "reply for unknown call id"),
                        }
                    }
                    Frame::Register { .. } | Frame::Unregister { .. } | Frame::Subscribe { .. } => {
                        debug!("ignoring broker-only frame");
                    }
                }
            }
        });

        Ok((bus, incoming_rx))
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.writer
            .send(frame)
            .map_err(|_| Error::bus("bus connection closed"))
    }

    /// Publish an RPC object under `object`.
    pub async fn register(&self, object: &str) -> Result<()> {
        self.send(Frame::Register { object: object.to_owned() })
    }

    /// Remove a previously registered RPC object.
    pub async fn unregister(&self, object: &str) -> Result<()> {
        self.send(Frame::Unregister { object: object.to_owned() })
    }

    /// Subscribe to events whose topic matches `pattern`.
    pub async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.send(Frame::Subscribe { pattern: pattern.to_owned() })
    }

    /// Invoke `method` on a remote object and wait for its reply.
    pub async fn call(&self, object: &str, method: &str, args: Value) -> Result<Value> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let sent = self.send(Frame::Call {
            id,
            object: object.to_owned(),
            method: method.to_owned(),
            args,
        });
        if let Err(err) = sent {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::bus(format!("{object}.{method} failed: {message}"))),
            Ok(Err(_)) => Err(Error::bus("bus connection closed")),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(Error::bus(format!("{object}.{method} timed out")))
            }
        }
    }
}

#[async_trait]
impl Bus for SocketBus {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        self.send(Frame::Event {
            topic: event.topic().to_owned(),
            payload: event.payload(),
        })
    }

    async fn link_is_up(&self, interface: &str) -> Result<bool> {
        let reply = self
            .call(&format!("network.interface.{interface}"), "status", Value::Null)
            .await?;
        Ok(reply.get("up").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn adjust_route_metrics(&self, interface: &str, adjustment: u32) -> Result<()> {
        self.call(
            &format!("network.interface.{interface}"),
            "adjust_metrics",
            serde_json::json!({ "adjustment": adjustment, "persist": true }),
        )
        .await?;
        Ok(())
    }

    async fn add_interface_object(&self, interface: &str) -> Result<()> {
        self.register(&interface_object_name(interface)).await
    }

    async fn remove_interface_object(&self, interface: &str) -> Result<()> {
        self.unregister(&interface_object_name(interface)).await
    }
}
