//! Child-process runner
//!
//! Spawns probe and recovery executables with a cleared environment, null
//! stdio and the configured working directory, and delivers the raw wait
//! status back onto the owning interface's queue context. Killing a child
//! detaches it: a detached child's eventual exit is dropped through the
//! generation check rather than dispatched.

use crate::daemon::DaemonMessage;
use crate::domain::error::Result;
use crate::engine::NotifyHandle;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Raw wait status equivalent to a child that exited with 127, the status an
/// exec failure produces.
pub const EXEC_FAILURE_STATUS: i32 = 127 << 8;

/// Which runner a child belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The interface's current test
    Test,
    /// The interface's current recovery action
    Recovery,
}

/// Handle for at most one running child process.
#[derive(Debug)]
pub struct ProcessRunner {
    kind: ProcessKind,
    notify: NotifyHandle,
    pid: Option<i32>,
    generation: u64,
}

impl ProcessRunner {
    /// Create an idle runner.
    pub fn new(kind: ProcessKind, notify: NotifyHandle) -> Self {
        Self {
            kind,
            notify,
            pid: None,
            generation: 0,
        }
    }

    /// Spawn `./<executable>` in `working_dir` with `args`, killing any
    /// previous child bound to this handle first.
    pub fn start(&mut self, executable: &str, args: &[String], working_dir: &Path) -> Result<()> {
        self.kill();

        let program = format!("./{executable}");
        let mut child = Command::new(&program)
            .args(args)
            .current_dir(working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        self.pid = child.id().map(|pid| pid as i32);
        self.generation += 1;

        let generation = self.generation;
        let notify = self.notify.clone();
        let kind = self.kind;
        tokio::spawn(async move {
            let raw_status = match child.wait().await {
                Ok(status) => status.into_raw(),
                Err(_) => EXEC_FAILURE_STATUS,
            };
            let _ = notify.tx.send(DaemonMessage::ProcessExited {
                interface: notify.interface.clone(),
                iface_id: notify.iface_id,
                kind,
                generation,
                raw_status,
            });
        });

        Ok(())
    }

    /// SIGKILL the current child and detach; safe to call when idle.
    pub fn kill(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            // Invalidate the in-flight exit notification.
            self.generation += 1;
        }
    }

    /// Accept an exit notification. Returns false for a stale notification
    /// belonging to a child that has since been killed or replaced.
    #[must_use]
    pub fn complete(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.pid.is_none() {
            return false;
        }
        self.pid = None;
        true
    }

    /// Whether a child is currently bound to this handle.
    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Pid of the running child, if any.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

/// Whether a raw wait status denotes a normal exit with status 0.
pub fn exit_status_passed(raw_status: i32) -> bool {
    std::process::ExitStatus::from_raw(raw_status).success()
}
