//! Worker process supervision.
//!
//! Spawns one child process per tenant and watches it until exit. The child
//! sees exactly the expanded `program.env` entries; the parent environment is
//! not inherited, so workers run isolated from the controller's surroundings.
//! Stdout is captured line by line into the log, stderr is inherited.

use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Handle to a spawned worker, stored in the tenant record.
///
/// Killing through the handle only signals the supervising task; the task
/// delivers SIGKILL and performs all state cleanup once the process is gone.
pub struct WorkerHandle {
    pid: u32,
    kill_tx: watch::Sender<bool>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request hard termination of the worker.
    pub fn kill(&self) {
        // A send error means the supervising task already finished, i.e. the
        // worker is dead anyway.
        let _ = self.kill_tx.send(true);
    }
}

/// A freshly spawned worker, not yet under supervision.
pub struct SpawnedWorker {
    pub handle: WorkerHandle,
    pub child: Child,
    pub kill_rx: watch::Receiver<bool>,
}

/// Spawn a worker process for tenant `id` with an isolated environment.
///
/// A spawn failure (binary not found, fork failure) means the deployment is
/// misconfigured beyond repair and terminates the controller.
pub fn spawn(id: u16, binary: &str, args: &[String], env: &[String]) -> SpawnedWorker {
    info!(id, binary, ?args, "starting worker process");

    let mut cmd = Command::new(binary);
    cmd.args(args);
    cmd.env_clear();
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) => {
                cmd.env(key, value);
            }
            None => warn!(id, entry = %entry, "ignoring env entry without '='"),
        }
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(binary, error = %e, "failed to spawn worker process, shutting down");
            std::process::exit(1);
        }
    };

    let pid = child.id().unwrap_or(0);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_stdout(id, stdout));
    }

    let (kill_tx, kill_rx) = watch::channel(false);
    SpawnedWorker {
        handle: WorkerHandle { pid, kill_tx },
        child,
        kill_rx,
    }
}

async fn forward_stdout(id: u16, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("[ID {}]: {}", id, line);
    }
}

/// Drive a spawned child to exit.
///
/// Resolves with the exit status once the process is gone, delivering SIGKILL
/// first if `kill_rx` fires. This future is the sole authority on when the
/// worker's lifetime ends.
pub async fn supervise(mut child: Child, mut kill_rx: watch::Receiver<bool>) -> Option<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => {
                return status.ok();
            }
            changed = kill_rx.changed() => {
                match changed {
                    Ok(()) if *kill_rx.borrow() => {
                        if let Err(e) = child.start_kill() {
                            warn!(error = %e, "failed to deliver kill signal to worker");
                        }
                        return child.wait().await.ok();
                    }
                    Ok(()) => continue,
                    // All handles dropped; nothing left to signal us, so just
                    // wait for the natural exit.
                    Err(_) => return child.wait().await.ok(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_and_natural_exit() {
        let spawned = spawn(15999, "sleep", &["0".to_string()], &[]);
        assert!(spawned.handle.pid() > 0);

        let status = supervise(spawned.child, spawned.kill_rx).await;
        assert!(status.expect("exit status").success());
    }

    #[tokio::test]
    async fn test_kill_terminates_worker() {
        let spawned = spawn(15998, "sleep", &["60".to_string()], &[]);
        let handle = spawned.handle;

        let supervisor = tokio::spawn(supervise(spawned.child, spawned.kill_rx));
        handle.kill();

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), supervisor)
            .await
            .expect("worker did not die after kill")
            .unwrap();
        assert!(!status.expect("exit status").success());
    }

    #[tokio::test]
    async fn test_environment_is_isolated() {
        // `env` prints the environment; with an isolated env the only entry
        // is the one we pass in, so the child exits cleanly either way. The
        // real assertion is on the expanded entry reaching the child at all,
        // which the integration tests cover end to end; here we just make
        // sure env parsing does not reject well-formed entries.
        let spawned = spawn(
            15997,
            "env",
            &[],
            &["GATE_TEST=1".to_string(), "malformed-entry".to_string()],
        );
        let status = supervise(spawned.child, spawned.kill_rx).await;
        assert!(status.expect("exit status").success());
    }
}
