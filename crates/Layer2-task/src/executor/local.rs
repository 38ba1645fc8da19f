//! Local launcher - runs a command through the configured shell
//!
//! Features:
//! - stdout/stderr drained line by line into the task's output buffer
//! - process tree registration at spawn time
//! - a supervisor worker that owns the child and reports its exit once
//! - cooperative cancellation (kills the direct child, tree kill is the caller's job)

use crate::executor::tree::{ProcessTreeController, TreeHandle};
use crate::output::{spawn_drain, OutputBuffer, StreamKind};
use forgeshell_foundation::{Error, Result, ShellType};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a launched process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,

    /// Terminating signal (Unix)
    pub signal: Option<i32>,

    /// The cancel token fired before the process was reaped
    pub cancelled: bool,

    /// Both drain workers finished within the drain timeout
    pub drains_complete: bool,

    /// Waiting on the process failed
    pub wait_error: Option<String>,
}

impl ProcessExit {
    fn from_wait(
        status: std::io::Result<ExitStatus>,
        cancelled: bool,
        drains_complete: bool,
    ) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(&status),
                cancelled,
                drains_complete,
                wait_error: None,
            },
            Err(e) => Self {
                code: None,
                signal: None,
                cancelled,
                drains_complete,
                wait_error: Some(e.to_string()),
            },
        }
    }

    /// Ended by a signal rather than an exit call
    pub fn was_killed(&self) -> bool {
        self.signal.is_some()
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// A launched process
pub struct RunningProcess {
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
    pub tree: Option<Arc<TreeHandle>>,
    /// Fires exactly once, after the drains have been joined
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Launches shell commands with tree control and output capture
pub struct LocalLauncher {
    shell: ShellType,
    controller: Arc<dyn ProcessTreeController>,
    drain_timeout: Duration,
}

impl LocalLauncher {
    pub fn new(
        shell: ShellType,
        controller: Arc<dyn ProcessTreeController>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            shell,
            controller,
            drain_timeout,
        }
    }

    pub fn shell(&self) -> ShellType {
        self.shell
    }

    pub fn controller(&self) -> &Arc<dyn ProcessTreeController> {
        &self.controller
    }

    /// Start `command`, capturing its output into `buffer`
    pub fn launch(&self, command: &str, buffer: Arc<OutputBuffer>) -> Result<RunningProcess> {
        let mut cmd = Command::new(self.shell.executable());
        cmd.args(self.shell.exec_args())
            .arg(self.shell.wrap_command(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.controller.prepare(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Launch(format!("{}: {}", self.shell, e)))?;

        let pid = child.id();
        let tree = self.controller.attach(&child).map(Arc::new);
        if tree.is_none() {
            debug!("No tree handle for pid {:?}, termination will use pid fallback", pid);
        }

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, Arc::clone(&buffer), StreamKind::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, Arc::clone(&buffer), StreamKind::Stderr));
        }

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let supervisor_cancel = cancel.clone();
        let drain_timeout = self.drain_timeout;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = supervisor_cancel.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!("start_kill after cancel: {}", e);
                    }
                    child.wait().await
                }
            };

            let drains_complete = join_drains(drains, drain_timeout).await;
            let cancelled = supervisor_cancel.is_cancelled();
            let exit = ProcessExit::from_wait(status, cancelled, drains_complete);
            debug!("Process {:?} exited: {:?}", pid, exit);

            if exit_tx.send(exit).is_err() {
                debug!("Nobody waiting on exit of pid {:?}", pid);
            }
        });

        debug!("Launched pid {:?} via {}: {}", pid, self.shell, command);
        Ok(RunningProcess {
            pid,
            cancel,
            tree,
            exit: exit_rx,
        })
    }
}

/// Wait for drain workers, giving up after `limit`
///
/// A grandchild holding the pipe open would otherwise block forever.
async fn join_drains(mut drains: Vec<JoinHandle<()>>, limit: Duration) -> bool {
    let joined = tokio::time::timeout(limit, async {
        for drain in drains.iter_mut() {
            let _ = drain.await;
        }
    })
    .await;

    if joined.is_err() {
        warn!("Output drain did not finish within {:?}, keeping captured output", limit);
        for drain in &drains {
            drain.abort();
        }
        return false;
    }
    true
}
