//! Config registry with keyed diff
//!
//! Reloading replaces the active interface set atomically: an update opens an
//! epoch, staged entries are collected, and the flush fires add / update /
//! remove handling by diffing staged entries against the live interfaces by
//! name. A name staged twice in one epoch silently keeps the later entry.

use crate::domain::config::InterfaceConfig;
use crate::engine::{EngineCtx, Interface};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The set of live interface controllers, keyed by interface name.
#[derive(Default)]
pub struct Registry {
    interfaces: HashMap<String, Interface>,
    staged: Option<HashMap<String, InterfaceConfig>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an update epoch.
    pub fn begin_update(&mut self) {
        self.staged = Some(HashMap::new());
    }

    /// Stage a configuration entry for the open epoch. A duplicate name
    /// overrides the earlier entry.
    pub fn stage(&mut self, name: String, config: InterfaceConfig) {
        match self.staged.as_mut() {
            Some(staged) => {
                staged.insert(name, config);
            }
            None => warn!(interface = %name, "stage called outside an update epoch"),
        }
    }

    /// Close the epoch: remove interfaces that were not re-staged, update
    /// changed ones in place, and create the new ones.
    pub async fn flush(&mut self, ctx: &Arc<EngineCtx>) {
        let staged = self.staged.take().unwrap_or_default();

        let removed: Vec<String> = self
            .interfaces
            .keys()
            .filter(|name| !staged.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            debug!(interface = %name, "removing interface");
            if let Some(mut iface) = self.interfaces.remove(&name) {
                iface.shutdown().await;
            }
        }

        for (name, config) in staged {
            match self.interfaces.get_mut(&name) {
                Some(iface) => {
                    if iface.config() != &config {
                        iface.apply_config_update(config).await;
                    } else {
                        debug!(interface = %name, "configuration unchanged");
                    }
                }
                None => {
                    debug!(interface = %name, "adding interface");
                    let mut iface = Interface::new(ctx.clone(), name.clone(), config);
                    if let Err(err) = ctx.bus.add_interface_object(&name).await {
                        warn!(interface = %name, error = %err,
                              "failed to publish interface object");
                    }
                    iface.begin().await;
                    self.interfaces.insert(name, iface);
                }
            }
        }
    }

    /// Look up an interface by name.
    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name)
    }

    /// Look up an interface by name for mutation.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interfaces.get_mut(name)
    }

    /// Iterate over all interfaces.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Interface)> {
        self.interfaces.iter()
    }

    /// Names of all live interfaces.
    pub fn names(&self) -> Vec<String> {
        self.interfaces.keys().cloned().collect()
    }

    /// Number of live interfaces.
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Whether no interfaces are live.
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Tear down every interface (daemon shutdown).
    pub async fn clear(&mut self) {
        for (_, mut iface) in self.interfaces.drain() {
            iface.shutdown().await;
        }
    }
}
