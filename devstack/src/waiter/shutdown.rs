// File: devstack/src/waiter/shutdown.rs
//
// Shutdown signal shared between the stack orchestrator and every in-flight
// wait, so that stopping the stack interrupts waits immediately instead of
// after their own timeout.

use tokio::sync::watch;

/// Owner side of the shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Interrupt every listener, current and future, until `reset` is called.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Re-arm the signal for the next run.
    pub fn reset(&self) {
        self.sender.send_replace(false);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener side, handed to waits.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is triggered.
    ///
    /// If the owning `ShutdownSignal` is dropped this never resolves: a
    /// dropped owner means nobody can request shutdown anymore.
    pub async fn triggered(&mut self) {
        if self.receiver.wait_for(|triggered| *triggered).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
