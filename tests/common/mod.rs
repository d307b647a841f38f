//! Shared harness for the integration tests: a recording mock bus, stub
//! executables, configuration builders and a daemon pump.

#![allow(dead_code)]

use async_trait::async_trait;
use interface_tester::bus::{Bus, OutboundEvent};
use interface_tester::daemon::{Daemon, DaemonMessage, DaemonPaths};
use interface_tester::domain::error::Result;
use serde_json::{json, Value};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Bus double that records everything the engine does with it.
#[derive(Default)]
pub struct MockBus {
    /// Published events, in order
    pub events: Mutex<Vec<OutboundEvent>>,
    /// Link state handed out to `link_is_up` queries
    pub link_up: AtomicBool,
    /// Metric adjustments requested, in order
    pub adjustments: Mutex<Vec<(String, u32)>>,
    /// Object lifecycle log: `+name` on add, `-name` on remove
    pub objects: Mutex<Vec<String>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn operational_flips(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutboundEvent::Operational { is_operational, .. } => Some(is_operational),
                _ => None,
            })
            .collect()
    }

    pub fn test_run_results(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                OutboundEvent::TestRun { passed, .. } => Some(passed),
                _ => None,
            })
            .collect()
    }

    pub fn objects(&self) -> Vec<String> {
        self.objects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn link_is_up(&self, _interface: &str) -> Result<bool> {
        Ok(self.link_up.load(Ordering::SeqCst))
    }

    async fn adjust_route_metrics(&self, interface: &str, adjustment: u32) -> Result<()> {
        self.adjustments
            .lock()
            .unwrap()
            .push((interface.to_owned(), adjustment));
        Ok(())
    }

    async fn add_interface_object(&self, interface: &str) -> Result<()> {
        self.objects.lock().unwrap().push(format!("+{interface}"));
        Ok(())
    }

    async fn remove_interface_object(&self, interface: &str) -> Result<()> {
        self.objects.lock().unwrap().push(format!("-{interface}"));
        Ok(())
    }
}

/// Daemon plus the scratch directories its stub executables live in.
pub struct Harness {
    pub daemon: Daemon,
    pub bus: Arc<MockBus>,
    pub test_dir: TempDir,
    pub recovery_dir: TempDir,
}

impl Harness {
    /// Create a harness whose mock bus reports the link as `link_up`.
    pub fn new(link_up: bool) -> Self {
        let bus = MockBus::new();
        bus.link_up.store(link_up, Ordering::SeqCst);
        let test_dir = TempDir::new().unwrap();
        let recovery_dir = TempDir::new().unwrap();
        let daemon = Daemon::new(
            bus.clone(),
            DaemonPaths {
                test_dir: test_dir.path().to_path_buf(),
                recovery_dir: recovery_dir.path().to_path_buf(),
                config_file: None,
            },
        );
        Self {
            daemon,
            bus,
            test_dir,
            recovery_dir,
        }
    }

    /// Write a stub executable into the test directory.
    pub fn test_script(&self, name: &str, body: &str) {
        write_script(self.test_dir.path(), name, body);
    }

    /// Write a stub executable into the recovery directory.
    pub fn recovery_script(&self, name: &str, body: &str) {
        write_script(self.recovery_dir.path(), name, body);
    }

    /// Apply a config document and fail the test if it is rejected.
    pub async fn load(&mut self, document: Value) {
        self.daemon.apply_config(&document).await.unwrap();
    }

    /// Inject a classified link event, as the bus adapter would.
    pub async fn link_event(&mut self, interface: &str, up: bool) {
        self.daemon
            .handle_message(DaemonMessage::LinkEvent {
                interface: interface.to_owned(),
                up,
            })
            .await;
    }

    /// Pump daemon messages until `pred` holds or `timeout` passes.
    pub async fn drive_until<F>(&mut self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut(&Daemon) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.daemon) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            match tokio::time::timeout(deadline - now, self.daemon.tick()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return pred(&self.daemon),
            }
        }
    }

    /// Full state dump of one interface.
    pub fn dump(&self, interface: &str) -> Value {
        self.daemon.state()[interface].clone()
    }
}

/// Write an executable `#!/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
}

/// Configuration entry builder with the scenario defaults.
pub struct ConfigBuilder {
    pub success_condition: &'static str,
    pub settling_delay_secs: u32,
    pub passing_interval_secs: u32,
    pub failing_interval_secs: u32,
    pub pass_threshold: u32,
    pub fail_threshold: u32,
    pub response_timeout_secs: u32,
    pub tests: Vec<Value>,
    pub recovery_tasks: Vec<Value>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            success_condition: "one_test_must_pass",
            settling_delay_secs: 0,
            passing_interval_secs: 30,
            failing_interval_secs: 1,
            pass_threshold: 1,
            fail_threshold: 1,
            response_timeout_secs: 10,
            tests: Vec::new(),
            recovery_tasks: Vec::new(),
        }
    }
}

impl ConfigBuilder {
    pub fn test(mut self, executable: &str) -> Self {
        self.tests.push(task_entry(executable, executable, None));
        self
    }

    pub fn test_with_timeout(mut self, executable: &str, timeout_secs: u32) -> Self {
        self.tests
            .push(task_entry(executable, executable, Some(timeout_secs)));
        self
    }

    pub fn recovery(mut self, executable: &str) -> Self {
        self.recovery_tasks
            .push(task_entry(executable, executable, None));
        self
    }

    pub fn entry(&self) -> Value {
        json!({
            "success_condition": self.success_condition,
            "settling_delay_secs": self.settling_delay_secs,
            "passing_interval_secs": self.passing_interval_secs,
            "failing_interval_secs": self.failing_interval_secs,
            "pass_threshold": self.pass_threshold,
            "fail_threshold": self.fail_threshold,
            "response_timeout_secs": self.response_timeout_secs,
            "tests": self.tests,
            "recovery_tasks": self.recovery_tasks,
        })
    }

    pub fn document(&self, interface: &str) -> Value {
        json!({ "interfaces": { interface: self.entry() } })
    }
}

fn task_entry(executable: &str, label: &str, timeout_secs: Option<u32>) -> Value {
    let mut entry = json!({
        "executable": executable,
        "label": label,
        "params": {},
    });
    if let Some(timeout) = timeout_secs {
        entry["response_timeout_secs"] = json!(timeout);
    }
    entry
}

/// Read a field out of an interface dump, e.g. `["state", "tester", "state"]`.
pub fn dump_field<'a>(dump: &'a Value, path: &[&str]) -> &'a Value {
    let mut current = dump;
    for key in path {
        current = &current[key];
    }
    current
}

pub fn tester_state(dump: &Value) -> String {
    dump_field(dump, &["state", "tester", "state"])
        .as_str()
        .unwrap_or_default()
        .to_owned()
}

pub fn operational_state(dump: &Value) -> String {
    dump_field(dump, &["state", "tester", "operational_state"])
        .as_str()
        .unwrap_or_default()
        .to_owned()
}

pub fn stat(dump: &Value, group: &str, counter: &str) -> u64 {
    dump_field(dump, &["state", "tester", "stats", group, counter])
        .as_u64()
        .unwrap_or_default()
}

/// Strip time-dependent fields so two dumps taken in a row compare equal.
pub fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| *key != "remaining")
                .map(|(key, entry)| (key.clone(), strip_volatile(entry)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_volatile).collect()),
        other => other.clone(),
    }
}
