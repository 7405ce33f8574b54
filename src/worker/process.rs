//! Worker process handle: spawn, liveness, graceful termination

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::config::WorkerConfig;
use super::diagnostics::DiagnosticBuffer;
use super::error::WorkerError;

/// Extra time allowed after the grace period for the forced kill to land.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

struct TerminateRequest {
    grace: Duration,
}

/// Handles to one running worker process.
///
/// The child itself is owned by a background watcher task; the session talks
/// to it through the exit watch channel and a one-shot terminate request.
pub struct WorkerSession {
    pid: Option<u32>,
    started_at: Instant,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    exit: watch::Receiver<Option<WorkerExit>>,
    control: Mutex<Option<oneshot::Sender<TerminateRequest>>>,
}

/// A freshly spawned worker, with its output pipes still to be attached to
/// readers.
pub struct SpawnedWorker {
    pub session: WorkerSession,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn the configured worker with all three standard streams piped.
pub fn spawn(
    config: &WorkerConfig,
    diagnostics: DiagnosticBuffer,
) -> Result<SpawnedWorker, WorkerError> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    // Own process group so termination reaches anything the worker spawns
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
        program: config.program.clone(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or(WorkerError::MissingPipe("stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or(WorkerError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(WorkerError::MissingPipe("stderr"))?;

    let pid = child.id();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (control_tx, control_rx) = oneshot::channel();
    tokio::spawn(watch_exit(child, pid, exit_tx, control_rx, diagnostics));

    tracing::debug!("Spawned worker process {:?}: {}", pid, config.display_command());

    Ok(SpawnedWorker {
        session: WorkerSession {
            pid,
            started_at: Instant::now(),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            exit: exit_rx,
            control: Mutex::new(Some(control_tx)),
        },
        stdout,
        stderr,
    })
}

/// Owns the child until it exits, either by itself or on request.
async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    control: oneshot::Receiver<TerminateRequest>,
    diagnostics: DiagnosticBuffer,
) {
    let exit = tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => {
                    tracing::error!("Failed to collect status of worker {:?}: {}", pid, e);
                    WorkerExit::unknown()
                }
            };
            tracing::error!("Worker process {:?} exited unexpectedly ({})", pid, exit);
            diagnostics.log_recent("Worker process exited");
            exit
        }
        request = control => {
            // A dropped session without an explicit stop gets no grace period
            let grace = request.map(|r| r.grace).unwrap_or(Duration::ZERO);
            let exit = terminate_child(&mut child, pid, grace).await;
            tracing::info!("Worker process {:?} stopped ({})", pid, exit);
            exit
        }
    };
    exit_tx.send_replace(Some(exit));
}

/// SIGTERM the process group, wait out `grace`, then SIGKILL.
async fn terminate_child(child: &mut Child, pid: Option<u32>, grace: Duration) -> WorkerExit {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(-(pid as i32));
            if let Err(e) = signal::kill(pgid, Signal::SIGTERM) {
                tracing::debug!("SIGTERM to worker group {} failed: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return WorkerExit::from_status(status),
        Ok(Err(e)) => {
            tracing::warn!("Error waiting for worker {:?} to exit: {}", pid, e);
        }
        Err(_) => {
            tracing::warn!(
                "Worker {:?} did not exit within {:?}, killing it",
                pid,
                grace
            );
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            let _ = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
        }
    }
    let _ = child.start_kill();

    match child.wait().await {
        Ok(status) => WorkerExit::from_status(status),
        Err(e) => {
            tracing::error!("Failed to reap worker {:?}: {}", pid, e);
            WorkerExit::unknown()
        }
    }
}

impl WorkerSession {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status, once the process has been observed to end.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolve when the process exits.
    ///
    /// Returns `None` only if the watcher went away without reporting.
    pub async fn wait_exit(&self) -> Option<WorkerExit> {
        let mut exit = self.exit.clone();
        let observed = exit.wait_for(Option::is_some).await.map(|e| *e);
        match observed {
            Ok(status) => status,
            Err(_) => *exit.borrow(),
        }
    }

    /// Write one complete line to the worker's stdin and flush it.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin is closed")
        })?;
        pipe.write_all(line.as_bytes()).await?;
        pipe.flush().await
    }

    fn control(&self) -> MutexGuard<'_, Option<oneshot::Sender<TerminateRequest>>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop the process: graceful signal, `grace` to comply, then a kill.
    ///
    /// Safe to call more than once and on a process that already exited.
    pub async fn terminate(&self, grace: Duration) -> Result<WorkerExit, WorkerError> {
        let request = self.control().take();
        if let Some(control) = request {
            let _ = control.send(TerminateRequest { grace });
        }
        // Stdin is released after the signal so a writer stuck on a full pipe
        // cannot hold the lock against us
        drop(self.stdin.lock().await.take());

        let limit = grace + KILL_WAIT;
        match tokio::time::timeout(limit, self.wait_exit()).await {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => Ok(WorkerExit::unknown()),
            Err(_) => Err(WorkerError::StopTimeout(limit)),
        }
    }
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("pid", &self.pid)
            .field("exit", &self.exit_status())
            .finish()
    }
}
