//! Read-only state snapshot for the `state` RPCs

use crate::engine::timer::Timer;
use crate::engine::{ConnectionState, Interface};
use serde_json::{json, Map, Value};

fn timer_entry(target: &mut Map<String, Value>, timer: &Timer) {
    target.insert(
        timer.label().to_owned(),
        json!({
            "running": timer.is_running(),
            "remaining": timer.remaining_ms(),
        }),
    );
}

fn connection_dump(iface: &Interface) -> Value {
    let mut out = Map::new();
    out.insert(
        "connected".to_owned(),
        Value::from(if iface.connection.state != ConnectionState::Disconnected { "yes" } else { "no" }),
    );
    out.insert("state".to_owned(), Value::from(iface.connection.state.as_str()));
    timer_entry(&mut out, &iface.connection.settling_timer);
    Value::Object(out)
}

fn tester_dump(iface: &Interface) -> Value {
    let mut out = Map::new();
    out.insert("test_index".to_owned(), Value::from(iface.tester.test_index));
    out.insert("state".to_owned(), Value::from(iface.tester.state.as_str()));
    out.insert(
        "operational_state".to_owned(),
        Value::from(iface.recovery.classification.as_str()),
    );
    #[cfg(feature = "route-metrics")]
    out.insert(
        "metrics_are_adjusted".to_owned(),
        Value::from(iface.recovery.metrics_are_adjusted),
    );

    timer_entry(&mut out, &iface.tester.response_timer);
    timer_entry(&mut out, &iface.tester.interval_timer);
    timer_entry(&mut out, &iface.recovery.response_timer);

    let next = iface.recovery.recovery_index;
    if let Some(task) = iface.config.recovery_tasks.get(next) {
        out.insert("next_recovery_task".to_owned(), Value::from(next));
        out.insert("next_recovery_label".to_owned(), Value::from(task.label.clone()));
    }

    out.insert(
        "test_process_running".to_owned(),
        Value::from(iface.tester.process.is_running()),
    );
    if let Some(pid) = iface.tester.process.pid() {
        out.insert("test_process_pid".to_owned(), Value::from(pid));
    }
    out.insert(
        "last_test_exit_code".to_owned(),
        Value::from(iface.tester.last_test_exit_code),
    );
    out.insert(
        "last_test_passed".to_owned(),
        Value::from(iface.tester.last_test_passed),
    );

    out.insert(
        "recovery_task_running".to_owned(),
        Value::from(iface.recovery.process.is_running()),
    );
    if let Some(pid) = iface.recovery.process.pid() {
        out.insert("recovery_task_process_pid".to_owned(), Value::from(pid));
    }

    out.insert(
        "stats".to_owned(),
        serde_json::to_value(&iface.tester.stats).unwrap_or(Value::Null),
    );

    Value::Object(out)
}

impl Interface {
    /// Snapshot of this interface's state and a verbatim echo of its active
    /// configuration.
    pub fn state_dump(&self) -> Value {
        json!({
            "state": {
                "interface": connection_dump(self),
                "tester": tester_dump(self),
            },
            "config": serde_json::to_value(&self.config).unwrap_or(Value::Null),
        })
    }
}
