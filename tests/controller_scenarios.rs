//! End-to-end controller scenarios driven through the daemon API with a mock
//! bus and real stub executables.

mod common;

use common::{operational_state, stat, tester_state, ConfigBuilder, Harness};
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn settle_then_pass() {
    let mut harness = Harness::new(false);
    harness.test_script("probe", "exit 0");

    let config = ConfigBuilder {
        settling_delay_secs: 2,
        failing_interval_secs: 5,
        ..ConfigBuilder::default()
    }
    .test("probe");
    harness.load(config.document("wan")).await;

    // Nothing runs before link-up.
    assert_eq!(tester_state(&harness.dump("wan")), "stopped");

    harness.link_event("wan", true).await;
    let settled = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "sleeping"
        })
        .await;
    assert!(settled, "tester did not reach sleeping");

    let dump = harness.dump("wan");
    assert_eq!(stat(&dump, "test_runs", "consecutive_passes"), 1);
    assert_eq!(stat(&dump, "tests", "total_passes"), 1);
    assert_eq!(operational_state(&dump), "operational");

    // Passing interval: the sleep timer runs against the 30 s passing value.
    let timer = &dump["state"]["tester"]["test_interval_timer"];
    assert_eq!(timer["running"], serde_json::json!(true));
    let remaining = timer["remaining"].as_u64().unwrap();
    assert!(remaining > 25_000 && remaining <= 30_000, "remaining = {remaining}");

    // Already operational at begin: one pass produces no further flips.
    assert_eq!(harness.bus.operational_flips(), vec![true]);
    assert_eq!(harness.bus.test_run_results(), vec![true]);
}

#[tokio::test]
async fn broken_then_recover_rotates_recovery_tasks() {
    let mut harness = Harness::new(true);
    harness.test_script("probe", "if [ -e passflag ]; then exit 0; else exit 1; fi");
    harness.recovery_script("r1", "echo r1 >> recovery.log");
    harness.recovery_script("r2", "echo r2 >> recovery.log");

    let config = ConfigBuilder {
        pass_threshold: 2,
        fail_threshold: 2,
        ..ConfigBuilder::default()
    }
    .test("probe")
    .recovery("r1")
    .recovery("r2");
    harness.load(config.document("wan")).await;

    let failed_four_times = harness
        .drive_until(DEADLINE, |daemon| {
            let dump = &daemon.state()["wan"];
            stat(dump, "test_runs", "total_failures") >= 4 && tester_state(dump) == "sleeping"
        })
        .await;
    assert!(failed_four_times, "did not reach four failing test runs");

    let dump = harness.dump("wan");
    assert_eq!(operational_state(&dump), "broken");
    // Recoveries fired on the 2nd and 4th failures.
    assert_eq!(stat(&dump, "recovery", "total"), 2);

    // Let the tests pass; two consecutive passes flip the state back.
    std::fs::write(harness.test_dir.path().join("passflag"), b"").unwrap();

    let recovered = harness
        .drive_until(DEADLINE, |daemon| {
            let dump = &daemon.state()["wan"];
            operational_state(dump) == "operational"
        })
        .await;
    assert!(recovered, "did not return to operational");

    let dump = harness.dump("wan");
    assert_eq!(stat(&dump, "test_runs", "consecutive_passes"), 2);
    // Broken -> Operational resets the rotation.
    assert_eq!(dump["state"]["tester"]["next_recovery_task"], serde_json::json!(0));

    // Exactly one broken announcement and one recovery announcement (plus
    // the initial one from begin).
    assert_eq!(harness.bus.operational_flips(), vec![true, false, true]);

    // The rotation used r1 first, then r2.
    let log = std::fs::read_to_string(harness.recovery_dir.path().join("recovery.log")).unwrap();
    assert_eq!(log, "r1\nr2\n");
}

#[tokio::test]
async fn all_tests_condition_fails_run_on_single_failure() {
    let mut harness = Harness::new(true);
    harness.test_script("t1", "exit 0");
    harness.test_script("t2", "exit 0");
    harness.test_script("t3", "exit 1");

    let config = ConfigBuilder {
        success_condition: "all_tests_must_pass",
        failing_interval_secs: 5,
        ..ConfigBuilder::default()
    }
    .test("t1")
    .test("t2")
    .test("t3");
    harness.load(config.document("wan")).await;

    let slept = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "sleeping"
        })
        .await;
    assert!(slept);

    let dump = harness.dump("wan");
    assert_eq!(stat(&dump, "tests", "total_passes"), 2);
    assert_eq!(stat(&dump, "tests", "total_failures"), 1);
    assert_eq!(stat(&dump, "test_runs", "consecutive_failures"), 1);
    // One accounting event for the whole run.
    assert_eq!(harness.bus.test_run_results(), vec![false]);

    // Failing interval applies.
    let remaining = dump["state"]["tester"]["test_interval_timer"]["remaining"]
        .as_u64()
        .unwrap();
    assert!(remaining <= 5_000, "remaining = {remaining}");
}

#[tokio::test]
async fn timeout_counts_as_failure() {
    let mut harness = Harness::new(true);
    harness.test_script("hang", "sleep 30");

    let config = ConfigBuilder {
        response_timeout_secs: 1,
        ..ConfigBuilder::default()
    }
    .test("hang");
    harness.load(config.document("wan")).await;

    let slept = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "sleeping"
        })
        .await;
    assert!(slept, "timed-out test did not complete a failing run");

    let dump = harness.dump("wan");
    // Same accounting as a non-zero exit.
    assert_eq!(stat(&dump, "tests", "total_failures"), 1);
    assert_eq!(stat(&dump, "test_runs", "consecutive_failures"), 1);
    assert_eq!(harness.bus.test_run_results(), vec![false]);
    // The child was killed.
    assert_eq!(dump["state"]["tester"]["test_process_running"], serde_json::json!(false));
}

#[tokio::test]
async fn per_test_timeout_overrides_interface_default() {
    let mut harness = Harness::new(true);
    harness.test_script("hang", "sleep 30");

    let config = ConfigBuilder {
        response_timeout_secs: 600,
        ..ConfigBuilder::default()
    }
    .test_with_timeout("hang", 1);
    harness.load(config.document("wan")).await;

    let slept = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "sleeping"
        })
        .await;
    assert!(slept, "per-test timeout was not applied");
}

#[tokio::test]
async fn disconnect_during_recovery_leaves_recovery_running() {
    let mut harness = Harness::new(true);
    harness.test_script("probe", "exit 1");
    harness.recovery_script("slow", "sleep 2\necho done >> recovery.log");

    let config = ConfigBuilder::default().test("probe").recovery("slow");
    harness.load(config.document("wan")).await;

    let recovering = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "recovering"
        })
        .await;
    assert!(recovering);

    harness.link_event("wan", false).await;

    let dump = harness.dump("wan");
    assert_eq!(tester_state(&dump), "stopped");
    // The recovery child is deliberately left running.
    assert_eq!(dump["state"]["tester"]["recovery_task_running"], serde_json::json!(true));

    // Its eventual exit lands in Stopped and is consumed silently.
    let ended = harness
        .drive_until(DEADLINE, |daemon| {
            let dump = &daemon.state()["wan"];
            dump["state"]["tester"]["recovery_task_running"] == serde_json::json!(false)
        })
        .await;
    assert!(ended, "recovery child exit was not observed");
    assert_eq!(tester_state(&harness.dump("wan")), "stopped");

    let log = std::fs::read_to_string(harness.recovery_dir.path().join("recovery.log")).unwrap();
    assert_eq!(log, "done\n");
}

#[tokio::test]
async fn fail_threshold_zero_acts_on_every_failure() {
    let mut harness = Harness::new(true);
    harness.test_script("probe", "exit 1");
    harness.recovery_script("fix", "echo fix >> recovery.log");

    let config = ConfigBuilder {
        fail_threshold: 0,
        ..ConfigBuilder::default()
    }
    .test("probe")
    .recovery("fix");
    harness.load(config.document("wan")).await;

    let twice = harness
        .drive_until(DEADLINE, |daemon| {
            stat(&daemon.state()["wan"], "recovery", "total") >= 2
        })
        .await;
    assert!(twice, "recovery did not fire on every failing run");

    let dump = harness.dump("wan");
    assert!(stat(&dump, "test_runs", "total_failures") >= 2);
    // Still exactly one broken flip.
    assert_eq!(harness.bus.operational_flips(), vec![true, false]);
}

#[tokio::test]
async fn no_recovery_tasks_keeps_cycling_while_broken() {
    let mut harness = Harness::new(true);
    harness.test_script("probe", "exit 1");

    let config = ConfigBuilder::default().test("probe");
    harness.load(config.document("wan")).await;

    let cycled = harness
        .drive_until(DEADLINE, |daemon| {
            stat(&daemon.state()["wan"], "test_runs", "total_failures") >= 3
        })
        .await;
    assert!(cycled, "tester did not keep cycling");

    let dump = harness.dump("wan");
    assert_eq!(operational_state(&dump), "broken");
    assert_eq!(stat(&dump, "recovery", "total"), 0);
    let state = tester_state(&dump);
    assert!(state == "sleeping" || state == "testing", "state = {state}");
}

#[tokio::test]
async fn spawn_failure_counts_as_exec_failure() {
    let mut harness = Harness::new(true);
    // Neither test executable exists; both spawn attempts fail.

    let config = ConfigBuilder {
        failing_interval_secs: 5,
        ..ConfigBuilder::default()
    }
    .test("missing-a")
    .test("missing-b");
    harness.load(config.document("wan")).await;

    let slept = harness
        .drive_until(DEADLINE, |daemon| {
            tester_state(&daemon.state()["wan"]) == "sleeping"
        })
        .await;
    assert!(slept, "spawn failures did not complete a failing run");

    let dump = harness.dump("wan");
    assert_eq!(stat(&dump, "tests", "total_failures"), 2);
    assert_eq!(stat(&dump, "test_runs", "total_failures"), 1);
    assert_eq!(
        dump["state"]["tester"]["last_test_exit_code"],
        serde_json::json!(127 << 8)
    );
    assert_eq!(harness.bus.test_run_results(), vec![false]);
}

#[tokio::test]
async fn reconnect_resets_per_connection_counters_only() {
    let mut harness = Harness::new(true);
    harness.test_script("probe", "exit 0");

    let config = ConfigBuilder::default().test("probe");
    harness.load(config.document("wan")).await;

    let first_pass = harness
        .drive_until(DEADLINE, |daemon| {
            stat(&daemon.state()["wan"], "tests", "total_passes") >= 1
        })
        .await;
    assert!(first_pass);

    harness.link_event("wan", false).await;
    assert_eq!(tester_state(&harness.dump("wan")), "stopped");

    harness.link_event("wan", true).await;
    let second_pass = harness
        .drive_until(DEADLINE, |daemon| {
            stat(&daemon.state()["wan"], "tests", "total_passes") >= 2
        })
        .await;
    assert!(second_pass);

    let dump = harness.dump("wan");
    // Lifetime counters accumulate, per-connection counters restarted.
    assert_eq!(stat(&dump, "tests", "total_passes"), 2);
    assert_eq!(stat(&dump, "tests", "total_passes_this_connection"), 1);
}
