// File: devstack/src/stack/mod.rs
//
// Stack Orchestrator
//
// Starts the processes of a stack in declared order, gating each one on its
// readiness probe, and offers one start/stop lifecycle for the whole stack.
// Stop always terminates exactly the processes that were started, in reverse
// order, whatever happened during start.

/// Release download of missing stack binaries
pub mod binaries;
/// Declared roles and the default dev stack
pub mod descriptor;
/// Per-run log file naming
pub mod logs;
/// Readiness probes
pub mod probe;

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{self, Duration};

use crate::config::StackConfig;
use crate::error::{StackError, WaitError};
use crate::process::{
    LogSink, ProcessExit, ProcessRole, ProcessState, ProcessSupervisor, DEFAULT_STOP_GRACE,
};
use crate::waiter::{wait_for, Readiness, ShutdownListener, ShutdownSignal, WaitSpec};

pub use crate::config::RunMode;
pub use binaries::StackBinaryDownloader;
pub use descriptor::{RoleSpec, StackDescriptor, DEFAULT_READINESS_TIMEOUT};
pub use logs::LogLayout;
pub use probe::{
    LivenessProbe, NodeRpcProbe, OutputSignalProbe, ProbeContext, ReadinessProbe, WorkerInfo,
    WorkerInfoProbe,
};

/// Lifecycle of the whole stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StackState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// A start attempt failed; `stop_stack` brings it back to `Stopped`
    Failed,
}

/// Why `run_until_shutdown` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupted,
    TimeLimit,
    ProcessExited(ProcessExit),
}

#[derive(Debug, Clone)]
pub struct StackOptions {
    pub mode: RunMode,
    pub save_logs: bool,
    pub logs_dir: PathBuf,
    pub stop_grace: Duration,
}

impl StackOptions {
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            mode: config.mode,
            save_logs: config.save_logs,
            logs_dir: config.logs_dir.clone(),
            stop_grace: config.stop_grace(),
        }
    }
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Full,
            save_logs: false,
            logs_dir: PathBuf::from(crate::config::DEFAULT_LOGS_DIR),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Orchestrator of one stack.
///
/// All lifecycle methods take `&self`: `stop_stack` may be called from a
/// signal handler while `start_stack` is still waiting for a role, in which
/// case the pending readiness wait is interrupted right away.
///
/// # Example
///
/// ```rust,ignore
/// let config = StackConfig::default();
/// let stack = StackOrchestrator::new(
///     StackDescriptor::from_config(&config),
///     StackOptions::from_config(&config),
/// );
///
/// stack.launch().await?;
/// let reason = stack.run_until_shutdown(config.time_limit()).await;
/// ```
pub struct StackOrchestrator {
    descriptor: StackDescriptor,
    options: StackOptions,
    state: Mutex<StackState>,
    // Supervisors in start order
    started: AsyncMutex<Vec<ProcessSupervisor>>,
    // Serializes start and stop
    lifecycle: AsyncMutex<()>,
    shutdown: ShutdownSignal,
    // Bumped by every stop request, even one still waiting for `lifecycle`
    stop_requests: AtomicU64,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    exit_rx: AsyncMutex<mpsc::UnboundedReceiver<ProcessExit>>,
}

impl StackOrchestrator {
    pub fn new(descriptor: StackDescriptor, options: StackOptions) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            descriptor,
            options,
            state: Mutex::new(StackState::Stopped),
            started: AsyncMutex::new(Vec::new()),
            lifecycle: AsyncMutex::new(()),
            shutdown: ShutdownSignal::new(),
            stop_requests: AtomicU64::new(0),
            exit_tx,
            exit_rx: AsyncMutex::new(exit_rx),
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(
            StackDescriptor::from_config(config),
            StackOptions::from_config(config),
        )
    }

    pub fn state(&self) -> StackState {
        *self.state.lock()
    }

    pub fn descriptor(&self) -> &StackDescriptor {
        &self.descriptor
    }

    /// Listener firing when the stack is being stopped. Hand it to waits that
    /// should not outlive the stack.
    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.subscribe()
    }

    /// Roles with a live supervisor, in start order.
    pub async fn started_roles(&self) -> Vec<ProcessRole> {
        self.started
            .lock()
            .await
            .iter()
            .map(ProcessSupervisor::role)
            .collect()
    }

    /// Last `lines` lines of output of a started role.
    pub async fn output_tail(&self, role: ProcessRole, lines: usize) -> Vec<String> {
        self.started
            .lock()
            .await
            .iter()
            .find(|supervisor| supervisor.role() == role)
            .map(|supervisor| supervisor.output_tail(lines))
            .unwrap_or_default()
    }

    /// Start every role in declared order.
    ///
    /// A role is launched only after the previous one passed its readiness
    /// probe. On failure the stack moves to `Failed` and already started
    /// processes keep running: call `stop_stack` to unwind (or use `launch`).
    ///
    /// # Errors
    ///
    /// - `StackError::InvalidState` unless the stack is `Stopped`
    /// - `StackError::Process` for a missing binary (before anything is
    ///   launched) or a spawn failure
    /// - `StackError::Readiness` carrying the role's timeout or fatal probe error
    /// - `StackError::ProcessExited` if a process died before becoming ready
    /// - `StackError::Cancelled` if `stop_stack` was called while this call
    ///   waited for a previous start or stop to finish
    pub async fn start_stack(&self) -> Result<(), StackError> {
        let stops_seen = self.stop_requests.load(Ordering::SeqCst);
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut state = self.state.lock();
            if *state != StackState::Stopped {
                return Err(StackError::InvalidState(*state));
            }
            if self.stop_requests.load(Ordering::SeqCst) != stops_seen {
                log::warn!("Stop requested before the stack started, not starting");
                return Err(StackError::Cancelled);
            }
            *state = StackState::Starting;
        }
        self.shutdown.reset();
        self.drain_stale_exits().await;

        log::info!(
            "Starting stack ({} mode, {} roles)",
            self.options.mode,
            self.descriptor.roles().len()
        );
        match self.start_roles().await {
            Ok(()) => {
                *self.state.lock() = StackState::Running;
                log::info!("Stack is running");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = StackState::Failed;
                log::error!("Stack failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn drain_stale_exits(&self) {
        let mut exits = self.exit_rx.lock().await;
        while exits.try_recv().is_ok() {}
    }

    async fn start_roles(&self) -> Result<(), StackError> {
        if self.options.mode == RunMode::Full {
            self.descriptor.verify_binaries()?;
        }
        let layout = self
            .options
            .save_logs
            .then(|| LogLayout::new(&self.options.logs_dir, Local::now()));

        for spec in self.descriptor.roles() {
            let (liveness, signals) = match self.options.mode {
                RunMode::Full => {
                    let mut supervisor = ProcessSupervisor::new(spec.role)
                        .with_grace(self.options.stop_grace)
                        .with_extractors(spec.extractors.clone())
                        .observe_exits(self.exit_tx.clone());

                    let sink = match &layout {
                        Some(layout) => LogSink::memory().with_file(layout.path_for(spec.role)),
                        None => LogSink::memory(),
                    };
                    supervisor.start(&spec.launch, sink).await?;

                    let liveness = supervisor.subscribe_state();
                    let signals = supervisor.signals();
                    self.started.lock().await.push(supervisor);
                    (Some(liveness), Some(signals))
                }
                RunMode::Attach => (None, None),
            };

            self.await_ready(spec, liveness, ProbeContext::new(spec.role, signals))
                .await?;
            log::info!("{} is ready", spec.role);
        }
        Ok(())
    }

    async fn await_ready(
        &self,
        spec: &RoleSpec,
        liveness: Option<watch::Receiver<ProcessState>>,
        ctx: ProbeContext,
    ) -> Result<(), StackError> {
        let wait = WaitSpec::new(format!("{} ({})", spec.role, spec.probe.describe()), spec.timeout)
            .poll_every(spec.poll_interval)
            .interruptible(self.shutdown.subscribe());

        let ctx = &ctx;
        let probe = spec.probe.as_ref();
        let watched = liveness.clone();
        let result = wait_for(wait, move || {
            let liveness = watched.clone();
            async move {
                match liveness {
                    None => probe.check(ctx).await,
                    Some(rx) => check_alive_and_ready(rx, probe.check(ctx)).await,
                }
            }
        })
        .await;

        result.map_err(|source| {
            let exited = liveness.as_ref().and_then(|rx| exit_code(&rx.borrow()));
            match (exited, &source) {
                (Some(code), WaitError::Fatal { .. }) => StackError::ProcessExited {
                    role: spec.role,
                    code,
                },
                _ => StackError::Readiness {
                    role: spec.role,
                    source,
                },
            }
        })
    }

    /// Stop every started process in reverse start order.
    ///
    /// Interrupts a concurrent `start_stack`, tolerates processes that
    /// already exited and never fails: individual stop errors are logged.
    /// Calling it on a stopped stack is a no-op.
    pub async fn stop_stack(&self, force: bool) {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        self.shutdown.trigger();
        let _lifecycle = self.lifecycle.lock().await;
        let mut started = self.started.lock().await;
        {
            let mut state = self.state.lock();
            if *state == StackState::Stopped && started.is_empty() {
                return;
            }
            *state = StackState::Stopping;
        }

        log::info!("Stopping stack");
        while let Some(mut supervisor) = started.pop() {
            if let Err(e) = supervisor.stop(force).await {
                log::error!("Failed to stop {}: {}", supervisor.role(), e);
            }
        }
        *self.state.lock() = StackState::Stopped;
        log::info!("Stack stopped");
    }

    /// Start the stack; on failure stop whatever was started, then return
    /// the original error.
    pub async fn launch(&self) -> Result<(), StackError> {
        if let Err(e) = self.start_stack().await {
            self.stop_stack(false).await;
            return Err(e);
        }
        Ok(())
    }

    /// Block until Ctrl-C or SIGTERM, the time limit, or an unexpected
    /// process exit, then stop the stack.
    pub async fn run_until_shutdown(&self, time_limit: Option<Duration>) -> ShutdownReason {
        match external_shutdown() {
            Ok(signal) => self.run_until(time_limit, signal).await,
            Err(e) => {
                log::error!("Unable to install signal handlers: {}", e);
                self.run_until(time_limit, std::future::pending()).await
            }
        }
    }

    /// Like `run_until_shutdown` with a caller-provided interrupt.
    pub async fn run_until<F>(&self, time_limit: Option<Duration>, interrupt: F) -> ShutdownReason
    where
        F: Future<Output = ()>,
    {
        let reason = {
            let mut exits = self.exit_rx.lock().await;
            let limit = async {
                match time_limit {
                    Some(limit) => time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = interrupt => {
                    log::warn!("Got interrupt - shutting down");
                    ShutdownReason::Interrupted
                }
                _ = limit => {
                    log::info!("Time limit reached");
                    ShutdownReason::TimeLimit
                }
                Some(exit) = exits.recv() => {
                    log::error!("{} exited unexpectedly (code {:?}) - shutting down", exit.role, exit.code);
                    ShutdownReason::ProcessExited(exit)
                }
            }
        };

        self.stop_stack(false).await;
        reason
    }
}

/// Resolves on Ctrl-C, or on SIGTERM on unix.
///
/// The SIGTERM handler is installed when this is called, not when the
/// future is first polled.
///
/// # Errors
///
/// Fails if the SIGTERM handler cannot be installed.
pub fn external_shutdown() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let terminate = {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sig = signal(SignalKind::terminate())?;
        async move { sig.recv().await }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    Ok(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => log::warn!("Ctrl-C signal received"),
                Err(e) => {
                    log::error!("Unable to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            },
            Some(()) = terminate => log::warn!("Terminate signal received"),
        }
    })
}

fn exit_code(state: &ProcessState) -> Option<Option<i32>> {
    match state {
        ProcessState::Exited { code, .. } => Some(*code),
        _ => None,
    }
}

/// Runs `check` unless the process exits first.
async fn check_alive_and_ready<F>(
    mut liveness: watch::Receiver<ProcessState>,
    check: F,
) -> Readiness<()>
where
    F: Future<Output = Readiness<()>>,
{
    if let Some(code) = exit_code(&liveness.borrow()) {
        return Readiness::Fatal(format!("process exited (code {:?})", code));
    }

    let exited = async {
        let observed = liveness
            .wait_for(|state| matches!(state, ProcessState::Exited { .. }))
            .await
            .is_ok();
        if !observed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        readiness = check => readiness,
        _ = exited => Readiness::Fatal("process exited".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(StackState::Failed.to_string(), "failed");
        assert_eq!(
            StackError::InvalidState(StackState::Running).to_string(),
            "Stack cannot be started from state running"
        );
    }

    #[tokio::test]
    async fn test_attach_mode_only_waits() {
        let descriptor = StackDescriptor::new(vec![RoleSpec::new(
            ProcessRole::Node,
            crate::process::LaunchSpec::new("/definitely/not/here"),
            std::sync::Arc::new(LivenessProbe),
        )]);
        let stack = StackOrchestrator::new(
            descriptor,
            StackOptions {
                mode: RunMode::Attach,
                ..StackOptions::default()
            },
        );

        stack.start_stack().await.unwrap();
        assert_eq!(stack.state(), StackState::Running);
        assert!(stack.started_roles().await.is_empty());

        stack.stop_stack(false).await;
        assert_eq!(stack.state(), StackState::Stopped);
    }

    #[tokio::test]
    async fn test_start_requires_stopped() {
        let stack = StackOrchestrator::new(
            StackDescriptor::default(),
            StackOptions {
                mode: RunMode::Attach,
                ..StackOptions::default()
            },
        );
        stack.start_stack().await.unwrap();
        assert!(matches!(
            stack.start_stack().await,
            Err(StackError::InvalidState(StackState::Running))
        ));
        stack.stop_stack(false).await;
        stack.start_stack().await.unwrap();
        stack.stop_stack(false).await;
    }

    #[tokio::test]
    async fn test_stop_while_start_waits_for_lock_wins() {
        let descriptor = StackDescriptor::new(vec![RoleSpec::new(
            ProcessRole::Node,
            crate::process::LaunchSpec::new("sh").arg("-c").arg("sleep 30"),
            std::sync::Arc::new(LivenessProbe),
        )]);
        let stack = std::sync::Arc::new(StackOrchestrator::new(descriptor, StackOptions::default()));

        // Stand-in for a stop that is still unwinding
        let busy = stack.lifecycle.lock().await;
        let starting = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.start_stack().await })
        };
        time::sleep(Duration::from_millis(50)).await;
        let stopping = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.stop_stack(false).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        drop(busy);

        assert!(matches!(starting.await.unwrap(), Err(StackError::Cancelled)));
        stopping.await.unwrap();
        assert_eq!(stack.state(), StackState::Stopped);
        assert!(stack.started_roles().await.is_empty());

        // A later start is not affected
        stack.start_stack().await.unwrap();
        assert_eq!(stack.started_roles().await, vec![ProcessRole::Node]);
        stack.stop_stack(false).await;
    }

    #[tokio::test]
    async fn test_missing_binary_fails_before_launch() {
        let config = StackConfig {
            node_binary: PathBuf::from("./not/here/node"),
            ..StackConfig::default()
        };
        let stack = StackOrchestrator::from_config(&config);
        assert!(matches!(
            stack.start_stack().await,
            Err(StackError::Process(crate::error::ProcessError::ResourceNotFound(_)))
        ));
        assert_eq!(stack.state(), StackState::Failed);
        assert!(stack.started_roles().await.is_empty());

        stack.stop_stack(false).await;
        assert_eq!(stack.state(), StackState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_time_limit() {
        let stack = StackOrchestrator::new(
            StackDescriptor::default(),
            StackOptions {
                mode: RunMode::Attach,
                ..StackOptions::default()
            },
        );
        stack.start_stack().await.unwrap();

        let reason = stack
            .run_until(Some(Duration::from_secs(3)), std::future::pending())
            .await;
        assert_eq!(reason, ShutdownReason::TimeLimit);
        assert_eq!(stack.state(), StackState::Stopped);
    }
}
