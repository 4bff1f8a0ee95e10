// File: devstack/src/process/mod.rs
//
// Process Supervisor
//
// Owns the lifecycle of one external OS process: spawn, combined output
// capture, liveness, graceful termination with escalation, and reporting of
// unexpected exits to a registered observer.

/// Combined stdout/stderr capture and log files
pub mod output;
/// Signal extraction from process output
pub mod signal;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::error::ProcessError;

pub use output::{LogSink, DEFAULT_TAIL_LINES};
pub use signal::{Capture, MarkerExtractor, SignalBoard, SignalExtractor};

use output::OutputCapture;

/// Default time a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long output readers may keep draining after the process exited.
/// Grandchildren inheriting the pipes would otherwise keep them open forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Role of a supervised process within the stack.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Node,
    Worker,
    Relay,
    Builder,
}

/// Everything needed to spawn a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Resolve the executable to an absolute path.
    ///
    /// Bare names are looked up on `PATH`; anything with a directory component
    /// is taken relative to the current directory (not `cwd`).
    ///
    /// # Errors
    ///
    /// `ProcessError::ResourceNotFound` when the executable or the working
    /// directory does not exist.
    pub fn resolve_program(&self) -> Result<PathBuf, ProcessError> {
        if let Some(cwd) = &self.cwd {
            if !cwd.is_dir() {
                return Err(ProcessError::ResourceNotFound(cwd.clone()));
            }
        }

        let has_dir = self.program.components().count() > 1 || self.program.is_absolute();
        if has_dir {
            let path = if self.program.is_absolute() {
                self.program.clone()
            } else {
                std::env::current_dir()?.join(&self.program)
            };
            return if path.is_file() {
                Ok(path)
            } else {
                Err(ProcessError::ResourceNotFound(self.program.clone()))
            };
        }

        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(&self.program))
                    .find(|candidate| candidate.is_file())
            })
            .ok_or_else(|| ProcessError::ResourceNotFound(self.program.clone()))
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: Option<u32> },
    Stopping,
    /// `requested` is true when the exit followed a stop request
    Exited { code: Option<i32>, requested: bool },
}

/// Unexpected exit reported to the exit observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub role: ProcessRole,
    pub code: Option<i32>,
}

struct RunHandle {
    pid: Option<u32>,
    capture: Arc<OutputCapture>,
    kill_tx: mpsc::Sender<()>,
    monitor: Option<JoinHandle<()>>,
}

/// Supervisor of one external process.
///
/// # Example
///
/// ```rust,ignore
/// let (exit_tx, mut exit_rx) = tokio::sync::mpsc::unbounded_channel();
/// let mut node = ProcessSupervisor::new(ProcessRole::Node)
///     .with_grace(Duration::from_secs(5))
///     .observe_exits(exit_tx);
///
/// node.start(&LaunchSpec::new("./node").arg("--dev"), LogSink::memory()).await?;
/// assert!(node.probe());
/// node.stop(false).await?;
/// ```
pub struct ProcessSupervisor {
    role: ProcessRole,
    grace: Duration,
    extractors: Vec<Arc<dyn SignalExtractor>>,
    exit_observer: Option<mpsc::UnboundedSender<ProcessExit>>,
    state: Arc<watch::Sender<ProcessState>>,
    stop_requested: Arc<AtomicBool>,
    run: Option<RunHandle>,
}

impl ProcessSupervisor {
    pub fn new(role: ProcessRole) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            role,
            grace: DEFAULT_STOP_GRACE,
            extractors: Vec::new(),
            exit_observer: None,
            state: Arc::new(state),
            stop_requested: Arc::new(AtomicBool::new(false)),
            run: None,
        }
    }

    /// Grace window between SIGTERM and a forced kill.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_extractors(mut self, extractors: Vec<Arc<dyn SignalExtractor>>) -> Self {
        self.extractors = extractors;
        self
    }

    /// Report exits that happen before any stop request (non-zero code or
    /// killed by a signal) on `observer`.
    pub fn observe_exits(mut self, observer: mpsc::UnboundedSender<ProcessExit>) -> Self {
        self.exit_observer = Some(observer);
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.run.as_ref().and_then(|run| run.pid)
    }

    /// Liveness: the process was started and has not exited yet.
    pub fn probe(&self) -> bool {
        matches!(
            self.state(),
            ProcessState::Running { .. } | ProcessState::Stopping
        )
    }

    /// Signals captured from the current run's output.
    pub fn signals(&self) -> SignalBoard {
        self.run
            .as_ref()
            .map(|run| run.capture.signals())
            .unwrap_or_default()
    }

    /// Last `lines` lines of combined output.
    pub fn output_tail(&self, lines: usize) -> Vec<String> {
        self.run
            .as_ref()
            .map(|run| run.capture.tail(lines))
            .unwrap_or_default()
    }

    /// Spawn the process.
    ///
    /// # Arguments
    ///
    /// * `spec` - Program, arguments, working directory and environment
    /// * `sink` - Where combined stdout/stderr goes
    ///
    /// # Errors
    ///
    /// - `ProcessError::ResourceNotFound` if the binary or working directory is missing
    /// - `ProcessError::AlreadyRunning` if a previous run is still alive
    /// - `ProcessError::Spawn` if the OS refused to start the process
    /// - `ProcessError::Io` if the log file cannot be created
    pub async fn start(&mut self, spec: &LaunchSpec, sink: LogSink) -> Result<(), ProcessError> {
        if self.probe() {
            return Err(ProcessError::AlreadyRunning { role: self.role });
        }
        let program = spec.resolve_program()?;

        let capture = Arc::new(OutputCapture::new(self.role, &sink, self.extractors.clone()));
        let file_writer = match &sink.file {
            Some(path) => Some(capture.open_file(path).await?),
            None => None,
        };

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                capture.close_file();
                return Err(ProcessError::Spawn {
                    role: self.role,
                    source,
                });
            }
        };
        let pid = child.id();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(output::spawn_reader(stdout, capture.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output::spawn_reader(stderr, capture.clone()));
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.state.send_replace(ProcessState::Running { pid });

        if log::log_enabled!(log::Level::Info) {
            log::info!(
                "Started {} ({} {}) pid {:?}",
                self.role,
                program.display(),
                spec.args.join(" "),
                pid
            );
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let monitor = tokio::spawn(monitor_exit(
            child,
            kill_rx,
            readers,
            file_writer,
            ExitContext {
                role: self.role,
                capture: capture.clone(),
                state: self.state.clone(),
                stop_requested: self.stop_requested.clone(),
                observer: self.exit_observer.clone(),
            },
        ));

        self.run = Some(RunHandle {
            pid,
            capture,
            kill_tx,
            monitor: Some(monitor),
        });
        Ok(())
    }

    /// Terminate the process.
    ///
    /// Sends SIGTERM (or kills right away when `force` is set), waits up to
    /// the grace window, then kills. Stopping a process that was never
    /// started or has already been stopped is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails once the process was started; signalling problems are
    /// logged and escalated to a kill.
    pub async fn stop(&mut self, force: bool) -> Result<(), ProcessError> {
        let role = self.role;
        let grace = self.grace;
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        let Some(mut monitor) = run.monitor.take() else {
            return Ok(());
        };

        if monitor.is_finished() {
            log_join(role, monitor.await);
            return Ok(());
        }

        self.stop_requested.store(true, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if matches!(state, ProcessState::Running { .. }) {
                *state = ProcessState::Stopping;
                true
            } else {
                false
            }
        });

        if force {
            log::info!("Killing {}", role);
            let _ = run.kill_tx.try_send(());
        } else {
            log::info!("Stopping {}", role);
            if let Err(e) = terminate(role, run.pid) {
                log::warn!("{}, killing instead", e);
                let _ = run.kill_tx.try_send(());
            }
        }

        match time::timeout(grace, &mut monitor).await {
            Ok(result) => log_join(role, result),
            Err(_) => {
                log::warn!("{} did not exit within {:?}, killing", role, grace);
                let _ = run.kill_tx.try_send(());
                log_join(role, monitor.await);
            }
        }
        Ok(())
    }

    /// Wait for the process to exit on its own and return its exit code.
    ///
    /// Returns once the output has been fully drained, so `output_tail` and
    /// `signals` are complete afterwards. Returns `None` right away if the
    /// process was never started.
    pub async fn wait_exit(&mut self) -> Option<i32> {
        let role = self.role;
        let run = self.run.as_mut()?;
        if let Some(monitor) = run.monitor.take() {
            log_join(role, monitor.await);
        }
        match self.state() {
            ProcessState::Exited { code, .. } => code,
            _ => None,
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(run) = &self.run {
            if run.monitor.as_ref().is_some_and(|m| !m.is_finished()) {
                let _ = run.kill_tx.try_send(());
            }
        }
    }
}

fn log_join(role: ProcessRole, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        log::error!("{} monitor task failed: {}", role, e);
    }
}

#[cfg(unix)]
fn terminate(role: ProcessRole, pid: Option<u32>) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = pid.ok_or_else(|| ProcessError::Signal {
        role,
        reason: "process id unavailable".to_string(),
    })?;
    let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
        role,
        reason: format!("pid {} out of range", pid),
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // Already gone; the monitor will observe the exit
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            role,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn terminate(role: ProcessRole, _pid: Option<u32>) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        role,
        reason: "graceful termination is not supported on this platform".to_string(),
    })
}

struct ExitContext {
    role: ProcessRole,
    capture: Arc<OutputCapture>,
    state: Arc<watch::Sender<ProcessState>>,
    stop_requested: Arc<AtomicBool>,
    observer: Option<mpsc::UnboundedSender<ProcessExit>>,
}

async fn monitor_exit(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<()>,
    mut readers: Vec<JoinHandle<()>>,
    file_writer: Option<JoinHandle<()>>,
    ctx: ExitContext,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    log::warn!("Failed to kill {}: {}", ctx.role, e);
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("Failed to collect exit status of {}: {}", ctx.role, e);
            None
        }
    };
    let requested = ctx.stop_requested.load(Ordering::SeqCst);
    ctx.state
        .send_replace(ProcessState::Exited { code, requested });

    let drained = time::timeout(
        OUTPUT_DRAIN_TIMEOUT,
        futures::future::join_all(readers.iter_mut()),
    )
    .await;
    if drained.is_err() {
        for reader in &readers {
            reader.abort();
        }
    }
    ctx.capture.close_file();
    if let Some(writer) = file_writer {
        log_join(ctx.role, writer.await);
    }

    if requested {
        log::info!("{} stopped (code {:?})", ctx.role, code);
        return;
    }
    if code == Some(0) {
        log::info!("{} exited", ctx.role);
        return;
    }

    log::warn!("{} exited unexpectedly (code {:?})", ctx.role, code);
    if log::log_enabled!(log::Level::Debug) {
        for line in ctx.capture.tail(20) {
            log::debug!("[{}] {}", ctx.role, line);
        }
    }
    if let Some(observer) = &ctx.observer {
        let _ = observer.send(ProcessExit {
            role: ctx.role,
            code,
        });
    }
}

/// Directory containing `binary`, used as the working directory of a role.
pub fn binary_dir(binary: &Path) -> Option<PathBuf> {
    binary
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}
