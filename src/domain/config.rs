//! Interface configuration model
//!
//! The configuration document arrives as JSON, either over the bus `config`
//! RPC or from the `-c` file. Each interface entry is parsed and validated
//! independently so that one invalid entry does not prevent its siblings from
//! loading.

use crate::domain::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How the outcome of a test-run is derived from its individual tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCondition {
    /// A single passing test makes the whole test-run pass.
    OneTestMustPass,
    /// Every configured test must pass for the test-run to pass.
    AllTestsMustPass,
}

impl SuccessCondition {
    /// Stable name as used on the wire and in dumps
    pub fn as_str(&self) -> &'static str {
        match self {
            SuccessCondition::OneTestMustPass => "one_test_must_pass",
            SuccessCondition::AllTestsMustPass => "all_tests_must_pass",
        }
    }
}

impl std::fmt::Display for SuccessCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an interface's test or recovery-task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Position in the owning list; used for rotation, tie-break and logging.
    #[serde(skip)]
    pub index: usize,
    /// Executable name, invoked as `./<executable>` from the task directory.
    pub executable: String,
    /// Human-readable label for logs and the state dump.
    pub label: String,
    /// Per-task response timeout; 0 or absent falls back to the interface
    /// default.
    #[serde(default)]
    pub response_timeout_secs: u32,
    /// Opaque parameter table handed to the executable as serialised JSON.
    pub params: Value,
}

impl TaskConfig {
    /// Compact JSON rendering of `params`, passed as the task's last argument.
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.params).unwrap_or_else(|_| String::from("{}"))
    }

    fn validate(&self, list: &str) -> Result<()> {
        if self.executable.is_empty() {
            return Err(Error::config(format!("{list} entry has an empty executable")));
        }
        if !self.params.is_object() {
            return Err(Error::config(format!("{list} entry params must be a table")));
        }
        Ok(())
    }
}

/// Declarative parameters of one interface controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Pass/fail rule applied across the test list
    pub success_condition: SuccessCondition,
    /// Delay between link-up and the first test-run
    pub settling_delay_secs: u32,
    /// Interval between test-runs while tests are passing
    pub passing_interval_secs: u32,
    /// Interval between test-runs while tests are failing
    pub failing_interval_secs: u32,
    /// Consecutive passing test-runs required to leave the broken state
    pub pass_threshold: u32,
    /// Consecutive failing test-runs per broken-action cycle; 0 acts on every
    /// failing test-run
    pub fail_threshold: u32,
    /// Default per-task response timeout
    pub response_timeout_secs: u32,
    /// Route-metric penalty applied while the interface is broken; 0 disables
    #[cfg(feature = "route-metrics")]
    #[serde(default)]
    pub failing_tests_metrics_increase: u32,
    /// Ordered list of tests; must not be empty
    pub tests: Vec<TaskConfig>,
    /// Ordered list of recovery tasks; may be empty
    pub recovery_tasks: Vec<TaskConfig>,
}

impl InterfaceConfig {
    /// Effective response timeout for `task`, in seconds.
    pub fn effective_timeout_secs(&self, task: &TaskConfig) -> u32 {
        if task.response_timeout_secs > 0 {
            task.response_timeout_secs
        } else {
            self.response_timeout_secs
        }
    }

    /// Check the value constraints the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.passing_interval_secs == 0 {
            return Err(Error::config("passing_interval_secs must be greater than 0"));
        }
        if self.failing_interval_secs == 0 {
            return Err(Error::config("failing_interval_secs must be greater than 0"));
        }
        if self.pass_threshold == 0 {
            return Err(Error::config("pass_threshold must be greater than 0"));
        }
        if self.response_timeout_secs == 0 {
            return Err(Error::config("response_timeout_secs must be greater than 0"));
        }
        if self.tests.is_empty() {
            return Err(Error::config("at least one test must be configured"));
        }
        for test in &self.tests {
            test.validate("tests")?;
        }
        for task in &self.recovery_tasks {
            task.validate("recovery_tasks")?;
        }
        Ok(())
    }
}

/// Parse one interface entry from the configuration document.
pub fn parse_interface(value: &Value) -> Result<InterfaceConfig> {
    if !value.is_object() {
        return Err(Error::config("interface entry must be a table"));
    }
    let mut config: InterfaceConfig = serde_json::from_value(value.clone())
        .map_err(|err| Error::config(err.to_string()))?;
    for (index, test) in config.tests.iter_mut().enumerate() {
        test.index = index;
    }
    for (index, task) in config.recovery_tasks.iter_mut().enumerate() {
        task.index = index;
    }
    config.validate()?;
    Ok(config)
}

/// Parse the whole configuration document.
///
/// A malformed document (no `interfaces` table) is an error; an invalid
/// individual interface is skipped with a warning and does not prevent the
/// remaining interfaces from loading. A name that appears twice keeps the
/// later entry.
pub fn parse_document(document: &Value) -> Result<Vec<(String, InterfaceConfig)>> {
    let interfaces = document
        .get("interfaces")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::invalid_argument("config document must contain an 'interfaces' table"))?;

    let mut parsed = Vec::with_capacity(interfaces.len());
    for (name, entry) in interfaces {
        match parse_interface(entry) {
            Ok(config) => parsed.push((name.clone(), config)),
            Err(err) => {
                warn!(interface = %name, error = %err, "skipping interface with invalid configuration");
            }
        }
    }
    Ok(parsed)
}
