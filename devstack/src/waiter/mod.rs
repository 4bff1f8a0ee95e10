// File: devstack/src/waiter/mod.rs
//
// Readiness Waiter
//
// Generic polling primitive used by every other component: evaluate a
// predicate immediately, then on a fixed interval, until it reports ready,
// reports a fatal condition, the deadline passes, or shutdown is requested.

/// Shutdown signal that interrupts in-flight waits
pub mod shutdown;

use std::future::Future;

use tokio::time::{self, Duration, Instant};

use crate::error::WaitError;

pub use shutdown::{ShutdownListener, ShutdownSignal};

/// Poll interval used when a wait does not specify one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of a single predicate evaluation.
///
/// `NotReady` keeps the wait polling; `Fatal` aborts it at once. This is how
/// a probe distinguishes "the worker is still booting" from "the worker
/// answered with HTTP 500".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),
    NotReady,
    Fatal(String),
}

impl<T> Readiness<T> {
    /// `Some` is ready, `None` is not ready yet.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Ready(value),
            None => Self::NotReady,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Readiness<U> {
        match self {
            Self::Ready(value) => Readiness::Ready(f(value)),
            Self::NotReady => Readiness::NotReady,
            Self::Fatal(reason) => Readiness::Fatal(reason),
        }
    }
}

impl Readiness<()> {
    pub fn from_bool(ready: bool) -> Self {
        if ready {
            Self::Ready(())
        } else {
            Self::NotReady
        }
    }
}

/// Parameters of one wait. Built per call, never stored.
///
/// # Example
///
/// ```rust,ignore
/// let spec = WaitSpec::new("pRuntime initialization", Duration::from_secs(20))
///     .poll_every(Duration::from_millis(250))
///     .interruptible(shutdown.subscribe());
/// let info = wait_for(spec, || probe.fetch()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct WaitSpec {
    label: String,
    timeout: Duration,
    poll_interval: Duration,
    shutdown: Option<ShutdownListener>,
}

impl WaitSpec {
    pub fn new(label: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown: None,
        }
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Abort the wait with `WaitError::Cancelled` as soon as shutdown is triggered.
    pub fn interruptible(mut self, listener: ShutdownListener) -> Self {
        self.shutdown = Some(listener);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

async fn shutdown_requested(listener: &mut Option<ShutdownListener>) {
    match listener {
        Some(listener) => listener.triggered().await,
        None => std::future::pending::<()>().await,
    }
}

/// Wait until `predicate` reports ready.
///
/// The predicate is evaluated immediately; when it is already ready the
/// result is returned without any delay. Otherwise it is re-evaluated every
/// poll interval until the timeout elapses. A single evaluation that does not
/// complete before the deadline also counts as a timeout.
///
/// # Errors
///
/// - `WaitError::Fatal` as soon as the predicate returns `Readiness::Fatal`
///   (never retried)
/// - `WaitError::Timeout` once the deadline passes
/// - `WaitError::Cancelled` when the attached shutdown signal fires
pub async fn wait_for<T, F, Fut>(spec: WaitSpec, mut predicate: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness<T>>,
{
    let WaitSpec {
        label,
        timeout,
        poll_interval,
        mut shutdown,
    } = spec;

    let started = Instant::now();
    let deadline = started + timeout;
    let mut announced = false;

    loop {
        if shutdown.as_ref().is_some_and(|s| s.is_triggered()) {
            return Err(WaitError::Cancelled { label });
        }

        let outcome = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                return Err(WaitError::Cancelled { label });
            }
            outcome = time::timeout_at(deadline, predicate()) => outcome,
        };

        match outcome {
            Ok(Readiness::Ready(value)) => {
                if announced {
                    log::debug!("{} ready", label);
                }
                return Ok(value);
            }
            Ok(Readiness::Fatal(reason)) => {
                return Err(WaitError::Fatal { label, reason });
            }
            Ok(Readiness::NotReady) => {}
            Err(_) => {
                return Err(WaitError::Timeout {
                    label,
                    elapsed: started.elapsed(),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                label,
                elapsed: started.elapsed(),
            });
        }

        if !announced {
            log::debug!("Waiting for {}", label);
            announced = true;
        }

        let wake_at = std::cmp::min(now + poll_interval, deadline);
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                return Err(WaitError::Cancelled { label });
            }
            _ = time::sleep_until(wake_at) => {}
        }
    }
}
