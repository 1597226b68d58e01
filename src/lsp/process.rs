// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! The server child process and its pipe pumps.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::binding::LaunchCommand;
use crate::error::ClientError;

const READ_CHUNK: usize = 8192;

/// Something observed on the process pipes.
#[derive(Debug)]
pub enum ProcessOutput {
    /// Raw bytes from stdout, in arrival order.
    Stdout(Bytes),
    /// One line from stderr.
    Stderr(String),
    /// Stdout reached end of file or failed.
    Closed,
    /// A write to stdin failed.
    WriteFailed(String),
}

/// A running language server.
///
/// Stdin is fed by a writer task so callers never block on a full pipe.
/// Output from both stdout and stderr arrives through [`Self::next_output`].
/// The child is killed if this value is dropped without [`Self::terminate`].
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    output: mpsc::UnboundedReceiver<ProcessOutput>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Spawns `command` with piped stdio, running in `workspace` when it is
    /// an existing directory.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Spawn`] if the process cannot be started.
    pub fn spawn(
        command: &LaunchCommand,
        workspace: &Path,
        server: &str,
    ) -> Result<Self, ClientError> {
        let spawn_error = |source| ClientError::Spawn {
            server: server.to_string(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if workspace.is_dir() {
            cmd.current_dir(workspace);
        } else {
            warn!("Workspace {} is not a directory, inheriting cwd", workspace.display());
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(spawn_error(std::io::Error::other("stdio not captured")));
        };

        debug!(
            "Spawned {server} (pid {:?}): {}",
            child.id(),
            command.program.display()
        );

        let (out_tx, output) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(write_task(stdin, in_rx, out_tx.clone())),
            tokio::spawn(read_task(stdout, out_tx.clone())),
            tokio::spawn(stderr_task(stderr, out_tx)),
        ];

        Ok(Self {
            child,
            stdin: Some(in_tx),
            output,
            tasks,
        })
    }

    /// OS process id, while the child has not been reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Queues one frame for stdin. Returns `false` once stdin is closed.
    pub fn write(&self, frame: Bytes) -> bool {
        self.stdin
            .as_ref()
            .is_some_and(|stdin| stdin.send(frame).is_ok())
    }

    /// Next pipe event. `None` once every pump has finished.
    pub async fn next_output(&mut self) -> Option<ProcessOutput> {
        self.output.recv().await
    }

    /// Exit description if the process has exited.
    pub fn try_wait(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    /// Ends the process in stages, each allowed half of `grace`: stdin is
    /// closed once queued frames are written, then the process is sent
    /// SIGTERM, then it is killed.
    ///
    /// Returns the exit status unless the process had to be killed.
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        drop(self.stdin.take());
        let step = grace / 2;

        let mut status = self.wait_for_exit(step).await;
        if status.is_none() {
            debug!("Server still running after stdin closed, sending SIGTERM");
            self.signal_terminate();
            status = self.wait_for_exit(grace.saturating_sub(step)).await;
        }
        if status.is_none() {
            debug!("Server still running after {grace:?}, killing");
            self.kill_now().await;
        }
        self.abort_tasks();
        status
    }

    async fn wait_for_exit(&mut self, within: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(within, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Server exited: {status}");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Failed to wait for server: {e}");
                None
            }
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!("Failed to signal server: {e}");
        }
    }

    #[cfg(not(unix))]
    const fn signal_terminate(&self) {}

    /// Kills the process immediately.
    pub async fn kill(mut self) {
        drop(self.stdin.take());
        self.kill_now().await;
        self.abort_tasks();
    }

    async fn kill_now(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill server: {e}");
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn write_task(
    mut stdin: ChildStdin,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    output: mpsc::UnboundedSender<ProcessOutput>,
) {
    while let Some(frame) = frames.recv().await {
        let result = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to write to server stdin: {e}");
            let _ = output.send(ProcessOutput::WriteFailed(e.to_string()));
            return;
        }
    }
    trace!("Server stdin closed");
}

async fn read_task(mut stdout: ChildStdout, output: mpsc::UnboundedSender<ProcessOutput>) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buffer.reserve(READ_CHUNK);
        match stdout.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("Server stdout closed");
                break;
            }
            Ok(_) => {
                if output.send(ProcessOutput::Stdout(buffer.split().freeze())).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Error reading from server stdout: {e}");
                break;
            }
        }
    }
    let _ = output.send(ProcessOutput::Closed);
}

async fn stderr_task(stderr: ChildStderr, output: mpsc::UnboundedSender<ProcessOutput>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if output.send(ProcessOutput::Stderr(line)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                trace!("Server stderr unreadable: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("GROVE_TEST".to_string(), "on".to_string())],
        }
    }

    #[tokio::test]
    async fn test_echoes_stdin_to_stdout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut process = ServerProcess::spawn(&shell("head -c 5"), dir.path(), "sh")?;
        assert!(process.write(Bytes::from_static(b"hello")));

        let mut received = Vec::new();
        while let Some(output) = process.next_output().await {
            match output {
                ProcessOutput::Stdout(chunk) => received.extend_from_slice(&chunk),
                ProcessOutput::Closed => break,
                other => anyhow::bail!("unexpected output: {other:?}"),
            }
        }
        assert_eq!(received, b"hello");
        process.terminate(Duration::from_secs(1)).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_stderr_and_environment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut process =
            ServerProcess::spawn(&shell("echo \"$GROVE_TEST $(pwd)\" >&2"), dir.path(), "sh")?;

        let mut line = None;
        while let Some(output) = process.next_output().await {
            if let ProcessOutput::Stderr(text) = output {
                line = Some(text);
                break;
            }
        }
        let line = line.unwrap_or_default();
        assert!(line.starts_with("on "));
        let name = dir.path().file_name().map(|n| n.to_string_lossy().into_owned());
        assert!(name.is_some_and(|n| line.ends_with(&n)));
        process.kill().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_kills_stubborn_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let process = ServerProcess::spawn(&shell("trap '' TERM; sleep 30"), dir.path(), "sh")?;
        let started = std::time::Instant::now();
        let status = process.terminate(Duration::from_millis(100)).await;
        assert!(status.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_lets_process_exit_on_stdin_close() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let process = ServerProcess::spawn(&shell("cat >/dev/null; exit 3"), dir.path(), "sh")?;
        let status = process.terminate(Duration::from_secs(4)).await;
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_signals_before_killing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let process = ServerProcess::spawn(
            &shell("trap 'exit 7' TERM; while :; do sleep 0.1; done"),
            dir.path(),
            "sh",
        )?;
        let status = process.terminate(Duration::from_secs(4)).await;
        assert_eq!(status.and_then(|s| s.code()), Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let command = LaunchCommand {
            program: PathBuf::from("/definitely/not/a/server"),
            args: Vec::new(),
            env: Vec::new(),
        };
        let result = ServerProcess::spawn(&command, Path::new("/"), "ghost");
        assert!(matches!(result, Err(ClientError::Spawn { server, .. }) if server == "ghost"));
    }
}
