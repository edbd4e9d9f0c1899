//! Subprocess helpers: spawning with drained stdio and graceful teardown.
//!
//! Unread pipes block the child, so every spawned process gets two
//! background tasks that stream stdout/stderr lines into the debug log.
//! Drain tasks must only be cancelled after the child exited or was killed.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a polite stop may take before escalating to SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn `command` with piped stdio and start drain tasks for both streams.
pub fn spawn_process(
    mut command: Command,
    name: &str,
) -> std::io::Result<(Child, Vec<JoinHandle<()>>)> {
    debug!(process = name, "starting subprocess");
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        tasks.push(tokio::spawn(drain_stream(
            stdout,
            format!("{name}-stdout"),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(tokio::spawn(drain_stream(
            stderr,
            format!("{name}-stderr"),
        )));
    }
    Ok((child, tasks))
}

/// Read a stdio stream to EOF, logging each line.
pub async fn drain_stream(stream: impl AsyncRead + Unpin, prefix: String) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{prefix}: {line}");
    }
}

/// Stop a child process: polite signal first, SIGKILL after a grace period.
///
/// With `kill=true` the polite phase is skipped. Safe to call on an already
/// exited child.
pub async fn terminate_process(child: &mut Child, kill: bool) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    if !kill {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .output()
                .await;
        }
        match timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await {
            Ok(_) => return,
            Err(_) => warn!("process did not exit after terminate; killing"),
        }
    }

    let _ = child.start_kill();
    let _ = timeout(GRACEFUL_STOP_TIMEOUT, child.wait()).await;
}

/// Cancel drain tasks and wait for them to wind down.
pub async fn cancel_drain_tasks(tasks: Vec<JoinHandle<()>>) {
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_drains_output_and_reaps_child() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2"]);
        let (mut child, tasks) = spawn_process(command, "test-echo").unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        cancel_drain_tasks(tasks).await;
    }

    #[tokio::test]
    async fn terminate_stops_a_long_running_child() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30"]);
        let (mut child, tasks) = spawn_process(command, "test-sleep").unwrap();
        terminate_process(&mut child, false).await;
        assert!(matches!(child.try_wait(), Ok(Some(_))));
        cancel_drain_tasks(tasks).await;
    }

    #[tokio::test]
    async fn terminate_is_idempotent_on_exited_child() {
        let command = Command::new("true");
        let (mut child, tasks) = spawn_process(command, "test-true").unwrap();
        child.wait().await.unwrap();
        terminate_process(&mut child, false).await;
        terminate_process(&mut child, true).await;
        cancel_drain_tasks(tasks).await;
    }
}
