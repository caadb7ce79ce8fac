use std::{path::PathBuf, time::Duration};

use tokio::{
    process::{ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

use crate::MonitorError;

/// Best-effort signals deliverable to the wrapped server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalKind {
    Terminate,
    Interrupt,
    Kill,
}

/// What to spawn: the wrapped MCP server's command line.
#[derive(Clone, Debug, Default)]
pub struct ChildSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ChildSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Default::default()
        }
    }
}

/// Owns exactly one spawned child for the lifetime of the monitor.
///
/// The three stream ends are taken once by the proxy; signals and exit
/// observation go through channels so any number of tasks can `wait()`
/// and all of them observe the same exit code.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    signals: mpsc::UnboundedSender<SignalKind>,
    exit: watch::Receiver<Option<i32>>,
}

impl ChildProcess {
    /// Spawns the child with piped stdio. Transient `ETXTBSY` during spawn
    /// is retried with a short backoff.
    pub async fn spawn(spec: &ChildSpec) -> Result<Self, MonitorError> {
        let binary = PathBuf::from(&spec.command);
        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return Err(MonitorError::WorkingDirMissing { dir: dir.clone() });
            }
        }

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = spawn_with_retry(&mut command, &binary).await?;
        let pid = child.id().ok_or_else(|| MonitorError::Spawn {
            binary: binary.clone(),
            source: std::io::Error::other("child exited before pid was read"),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        // The supervisor task is the only owner of the tokio Child: it
        // reaps exactly once and applies signals until then.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = match status {
                            Ok(status) => exit_code(status),
                            Err(source) => {
                                warn!(pid, error = %source, "wait on child failed");
                                1
                            }
                        };
                        debug!(pid, code, "child exited");
                        let _ = exit_tx.send(Some(code));
                        break;
                    }
                    signal = signal_rx.recv() => {
                        match signal {
                            Some(SignalKind::Kill) => {
                                let _ = child.start_kill();
                            }
                            Some(kind) => deliver_signal(pid, kind),
                            // All senders dropped: keep waiting for exit.
                            None => {
                                let code = child.wait().await.map(exit_code).unwrap_or(1);
                                let _ = exit_tx.send(Some(code));
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            pid,
            stdin,
            stdout,
            stderr,
            signals: signal_tx,
            exit: exit_rx,
        })
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Best-effort delivery; a no-op once the child has been reaped.
    pub fn signal(&self, kind: SignalKind) {
        if self.exit_code().is_some() {
            return;
        }
        let _ = self.signals.send(kind);
    }

    /// Blocks until the child is reaped. Safe to call from any number of
    /// tasks; every caller sees the same code.
    pub async fn wait(&self) -> i32 {
        let mut exit = self.exit.clone();
        loop {
            if let Some(code) = *exit.borrow() {
                return code;
            }
            if exit.changed().await.is_err() {
                // Supervisor task gone without publishing: treat as failure.
                return 1;
            }
        }
    }

    /// Like [`ChildProcess::wait`] but bounded; `None` on deadline expiry.
    pub async fn wait_timeout(&self, deadline: Duration) -> Option<i32> {
        tokio::time::timeout(deadline, self.wait()).await.ok()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }
}

async fn spawn_with_retry(
    command: &mut Command,
    binary: &std::path::Path,
) -> Result<tokio::process::Child, MonitorError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    return Err(MonitorError::ExecutableMissing {
                        binary: binary.to_path_buf(),
                    });
                }
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(MonitorError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
fn deliver_signal(pid: u32, kind: SignalKind) {
    let signal = match kind {
        SignalKind::Terminate => libc::SIGTERM,
        SignalKind::Interrupt => libc::SIGINT,
        SignalKind::Kill => libc::SIGKILL,
    };
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret != 0 {
        debug!(pid, signal, "signal delivery failed (child likely gone)");
    }
}

#[cfg(not(unix))]
fn deliver_signal(pid: u32, _kind: SignalKind) {
    // Graceful signals are unavailable; the Kill path goes through
    // tokio's start_kill in the supervisor task.
    debug!(pid, "graceful signals unsupported on this platform");
}
