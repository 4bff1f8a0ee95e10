// File: devstack/src/tx.rs
//
// Transaction Coordinator
//
// One sequential queue per signing identity: a transaction is only
// submitted once the previous one from the same identity reached a terminal
// status, and its nonce is read from the chain at that point. The finalized
// result is then correlated with the events of the finalizing block.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use crate::chain::{
    BlockRef, Call, ChainConnection, ChainEvent, SignedCall, SignerId, TxHash, TxStatus,
    TxSubscription,
};
use crate::error::{EventError, TxError, WaitError};
use crate::events::{EventBus, EventMatcher};
use crate::waiter::{wait_for, Readiness, WaitSpec};

/// Budget from submission to finalization.
pub const DEFAULT_FINALIZATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Budget for the finalizing block to show up on the event bus.
pub const DEFAULT_BLOCK_EVENTS_TIMEOUT: Duration = Duration::from_secs(10);

/// A transaction to submit.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub label: String,
    pub call: Call,
    /// Event the transaction must emit in its finalizing block
    pub expect: Option<EventMatcher>,
}

impl TxRequest {
    /// Labelled after the call, e.g. `sudo(phalaRegistry.registerGatekeeper)`.
    pub fn new(call: Call) -> Self {
        Self {
            label: call.label(),
            call,
            expect: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn expect(mut self, matcher: EventMatcher) -> Self {
        self.expect = Some(matcher);
        self
    }
}

/// Tracked status of a coordinated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    Queued,
    Submitted,
    Included(BlockRef),
    Finalized(BlockRef),
    Failed,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Submitted => write!(f, "submitted"),
            Self::Included(block) => write!(f, "included in {}", block),
            Self::Finalized(block) => write!(f, "finalized in {}", block),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Successful terminal result.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub label: String,
    pub signer: SignerId,
    pub nonce: u64,
    pub hash: TxHash,
    pub block: BlockRef,
    /// Events emitted by the transaction in its block
    pub events: Vec<ChainEvent>,
    /// Event matched by the request's expectation
    pub matched: Option<ChainEvent>,
}

/// Handle returned by `submit`.
pub struct PendingTx {
    label: String,
    signer: SignerId,
    state: watch::Receiver<TxState>,
    result: oneshot::Receiver<Result<TxOutcome, TxError>>,
}

impl PendingTx {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn signer(&self) -> &SignerId {
        &self.signer
    }

    pub fn state(&self) -> TxState {
        self.state.borrow().clone()
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> Result<TxOutcome, TxError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(TxError::Closed { label: self.label }),
        }
    }
}

struct Job {
    request: TxRequest,
    state: watch::Sender<TxState>,
    reply: oneshot::Sender<Result<TxOutcome, TxError>>,
}

struct Inner {
    connection: Arc<dyn ChainConnection>,
    events: Arc<EventBus>,
    timeouts: Mutex<Timeouts>,
}

/// Read by each job when it starts, so a change applies to every later job.
#[derive(Debug, Clone, Copy)]
struct Timeouts {
    finalization: Duration,
    block_events: Duration,
}

/// Sequential gatekeeper of outgoing transactions.
///
/// # Example
///
/// ```rust,ignore
/// let coordinator = TransactionCoordinator::new(connection, events);
/// let outcome = coordinator
///     .submit_and_wait(
///         &SignerId::from("//Alice"),
///         TxRequest::new(Call::sudo(add_cluster))
///             .expect(EventMatcher::new("phalaFatContracts", "ClusterCreated")),
///     )
///     .await?;
/// let cluster_id = outcome.matched.and_then(|e| e.field(0).cloned());
/// ```
pub struct TransactionCoordinator {
    inner: Arc<Inner>,
    queues: Mutex<HashMap<SignerId, mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionCoordinator {
    pub fn new(connection: Arc<dyn ChainConnection>, events: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                events,
                timeouts: Mutex::new(Timeouts {
                    finalization: DEFAULT_FINALIZATION_TIMEOUT,
                    block_events: DEFAULT_BLOCK_EVENTS_TIMEOUT,
                }),
            }),
            queues: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeouts(self, finalization: Duration, block_events: Duration) -> Self {
        self.set_timeouts(finalization, block_events);
        self
    }

    /// Applies to transactions that start processing after this call,
    /// including those already queued.
    pub fn set_timeouts(&self, finalization: Duration, block_events: Duration) {
        *self.inner.timeouts.lock() = Timeouts {
            finalization,
            block_events,
        };
    }

    /// Enqueue `request` on the queue of `signer`.
    ///
    /// Enqueueing happens before this returns, so the order of `submit` calls
    /// for one identity is the order of their nonces.
    pub fn submit(&self, signer: &SignerId, request: TxRequest) -> PendingTx {
        let (state_tx, state_rx) = watch::channel(TxState::Queued);
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingTx {
            label: request.label.clone(),
            signer: signer.clone(),
            state: state_rx,
            result: reply_rx,
        };

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}: queued for {}", request.label, signer);
        }

        let job = Job {
            request,
            state: state_tx,
            reply: reply_tx,
        };
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(signer.clone())
            .or_insert_with(|| self.spawn_queue(signer.clone()));
        if let Err(mpsc::error::SendError(job)) = queue.send(job) {
            // Worker is gone, only after shutdown
            let label = job.request.label.clone();
            let _ = job.reply.send(Err(TxError::Closed { label }));
        }
        pending
    }

    pub async fn submit_and_wait(
        &self,
        signer: &SignerId,
        request: TxRequest,
    ) -> Result<TxOutcome, TxError> {
        self.submit(signer, request).wait().await
    }

    /// Abort every queue. Pending transactions resolve to `TxError::Closed`.
    pub fn shutdown(&self) {
        self.queues.lock().clear();
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    fn spawn_queue(&self, signer: SignerId) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_queue(self.inner.clone(), signer, rx));
        self.workers.lock().push(worker);
        tx
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_queue(inner: Arc<Inner>, signer: SignerId, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let result = inner.process(&signer, &job).await;
        match &result {
            Ok(outcome) => log::info!(
                "{}: finalized in block {} (signer {}, nonce {})",
                outcome.label,
                outcome.block,
                outcome.signer,
                outcome.nonce
            ),
            Err(e) => {
                job.state.send_replace(TxState::Failed);
                log::error!("{}", e);
            }
        }
        let _ = job.reply.send(result);
    }
}

fn describe(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

impl Inner {
    async fn process(&self, signer: &SignerId, job: &Job) -> Result<TxOutcome, TxError> {
        let label = job.request.label.as_str();
        if !self.events.is_initialized() {
            return Err(TxError::Connection {
                label: label.to_string(),
                reason: "event bus is not initialized".to_string(),
            });
        }

        let timeouts = *self.timeouts.lock();

        // Nothing else from this signer is in flight here
        let nonce = self
            .connection
            .account_nonce(signer)
            .await
            .map_err(|e| connection_error(label, e))?;

        log::info!("{}: submitting as {} (nonce {})", label, signer, nonce);
        let mut subscription = self
            .connection
            .submit(SignedCall {
                signer: signer.clone(),
                nonce,
                call: job.request.call.clone(),
            })
            .await
            .map_err(|e| connection_error(label, e))?;
        job.state.send_replace(TxState::Submitted);

        let block = self
            .await_finalized(label, &mut subscription, &job.state, timeouts.finalization)
            .await?;
        job.state.send_replace(TxState::Finalized(block.clone()));

        self.await_block_events(label, &block, timeouts.block_events)
            .await?;
        let hash = subscription.hash;
        let events: Vec<ChainEvent> = self
            .events
            .block_events(&block)
            .into_iter()
            .filter(|event| event.tx.as_deref() == Some(hash.as_str()))
            .collect();

        if let Some(failed) = events.iter().find(|e| e.is("system", "ExtrinsicFailed")) {
            return Err(TxError::Failed {
                label: label.to_string(),
                reason: failed
                    .field(0)
                    .map(describe)
                    .unwrap_or_else(|| "ExtrinsicFailed".to_string()),
            });
        }

        let matched = match &job.request.expect {
            Some(matcher) => Some(self.expected_event(label, matcher, &block, &hash).await?),
            None => None,
        };

        Ok(TxOutcome {
            label: label.to_string(),
            signer: signer.clone(),
            nonce,
            hash,
            block,
            events,
            matched,
        })
    }

    async fn await_finalized(
        &self,
        label: &str,
        subscription: &mut TxSubscription,
        state: &watch::Sender<TxState>,
        timeout: Duration,
    ) -> Result<BlockRef, TxError> {
        let statuses = async {
            while let Some(status) = subscription.statuses.recv().await {
                match status {
                    TxStatus::Submitted => {}
                    TxStatus::Included(block) => {
                        if log::log_enabled!(log::Level::Debug) {
                            log::debug!("{}: included in block {}", label, block);
                        }
                        state.send_replace(TxState::Included(block));
                    }
                    TxStatus::Finalized(block) => return Ok(block),
                    TxStatus::Dropped(reason) => {
                        return Err(TxError::Dropped {
                            label: label.to_string(),
                            reason,
                        })
                    }
                    TxStatus::Invalid(reason) => {
                        return Err(TxError::Failed {
                            label: label.to_string(),
                            reason: format!("invalid transaction: {}", reason),
                        })
                    }
                }
            }
            Err(TxError::Connection {
                label: label.to_string(),
                reason: "status stream closed before finalization".to_string(),
            })
        };

        match time::timeout(timeout, statuses).await {
            Ok(result) => result,
            Err(_) => Err(TxError::Timeout {
                label: label.to_string(),
                source: WaitError::Timeout {
                    label: format!("{} finalization", label),
                    elapsed: timeout,
                },
            }),
        }
    }

    /// The finalizing block may reach the event bus after the status stream.
    async fn await_block_events(
        &self,
        label: &str,
        block: &BlockRef,
        timeout: Duration,
    ) -> Result<(), TxError> {
        let spec = WaitSpec::new(format!("{} events of block {}", label, block), timeout)
        .poll_every(self.events.poll_interval());

        wait_for(spec, || {
            let readiness = if self.events.has_block(block) {
                Readiness::Ready(())
            } else {
                match self.events.closed_reason() {
                    Some(reason) => Readiness::Fatal(reason),
                    None => Readiness::NotReady,
                }
            };
            std::future::ready(readiness)
        })
        .await
        .map_err(|source| match source {
            WaitError::Fatal { reason, .. } => TxError::Connection {
                label: label.to_string(),
                reason,
            },
            source => TxError::Timeout {
                label: label.to_string(),
                source,
            },
        })
    }

    /// Match the expectation against the events of the finalizing block.
    async fn expected_event(
        &self,
        label: &str,
        matcher: &EventMatcher,
        block: &BlockRef,
        hash: &str,
    ) -> Result<ChainEvent, TxError> {
        let scoped = matcher.clone().in_block(block).from_tx(hash);
        // The whole block is buffered already: a single look is enough
        match self.events.wait_for_event(&scoped, Duration::ZERO).await {
            Ok(event) => Ok(event),
            Err(EventError::Timeout { .. }) => Err(TxError::ExpectedEventMissing {
                label: label.to_string(),
                block: block.clone(),
                expected: matcher.to_string(),
            }),
            Err(e) => Err(TxError::Connection {
                label: label.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

fn connection_error(label: &str, error: anyhow::Error) -> TxError {
    TxError::Connection {
        label: label.to_string(),
        reason: format!("{:#}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Dispatch, InMemoryChain, RuntimeEvent};

    async fn setup(chain: InMemoryChain) -> (Arc<InMemoryChain>, Arc<EventBus>, TransactionCoordinator) {
        let chain = Arc::new(chain);
        let events = Arc::new(EventBus::new());
        events.init(chain.clone()).await.unwrap();
        chain.spawn_block_production(Duration::from_millis(100));
        let coordinator = TransactionCoordinator::new(chain.clone(), events.clone());
        (chain, events, coordinator)
    }

    #[test]
    fn test_request_label_defaults_to_call() {
        let request = TxRequest::new(Call::sudo(Call::new("phalaRegistry", "forceRegisterWorker")));
        assert_eq!(request.label, "sudo(phalaRegistry.forceRegisterWorker)");
        assert_eq!(request.with_label("register").label, "register");
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalized_with_expected_event() {
        let chain = InMemoryChain::new().with_dispatcher(|_, _| {
            Dispatch::Ok(vec![RuntimeEvent::new("phalaFatContracts", "ClusterCreated").field("0x01")])
        });
        let (_chain, events, coordinator) = setup(chain).await;

        let pending = coordinator.submit(
            &SignerId::from("alice"),
            TxRequest::new(Call::sudo(Call::new("phalaFatContracts", "addCluster")))
                .expect(EventMatcher::new("phalaFatContracts", "ClusterCreated")),
        );
        assert_eq!(pending.state(), TxState::Queued);

        let outcome = pending.wait().await.unwrap();
        assert_eq!(outcome.nonce, 0);
        assert_eq!(outcome.events.len(), 2);
        let matched = outcome.matched.unwrap();
        assert_eq!(matched.field(0), Some(&Value::from("0x01")));
        assert_eq!(matched.block, outcome.block);
        events.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_expected_event_is_distinct() {
        let (_chain, events, coordinator) = setup(InMemoryChain::new()).await;

        let result = coordinator
            .submit_and_wait(
                &SignerId::from("alice"),
                TxRequest::new(Call::new("phalaFatContracts", "addCluster"))
                    .expect(EventMatcher::new("phalaFatContracts", "ClusterCreated")),
            )
            .await;
        match result {
            Err(TxError::ExpectedEventMissing { label, block, expected }) => {
                assert_eq!(label, "phalaFatContracts.addCluster");
                assert_eq!(block.number, 1);
                assert_eq!(expected, "phalaFatContracts.ClusterCreated");
            }
            other => panic!("unexpected {:?}", other.map(|o| o.label)),
        }
        events.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extrinsic_failed_is_failure() {
        let chain = InMemoryChain::new().with_dispatcher(|_, _| Dispatch::Failed("BadOrigin".to_string()));
        let (chain, events, coordinator) = setup(chain).await;

        let result = coordinator
            .submit_and_wait(&SignerId::from("bob"), TxRequest::new(Call::new("balances", "transfer")))
            .await;
        assert!(matches!(
            result,
            Err(TxError::Failed { ref reason, .. }) if reason == "BadOrigin"
        ));
        // A failed call still consumes the nonce
        assert_eq!(chain.nonce_of(&SignerId::from("bob")), 1);
        events.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_is_not_retried() {
        let chain = InMemoryChain::new().with_dispatcher(|_, _| Dispatch::Drop("pool full".to_string()));
        let (chain, events, coordinator) = setup(chain).await;

        let result = coordinator
            .submit_and_wait(&SignerId::from("bob"), TxRequest::new(Call::new("balances", "transfer")))
            .await;
        assert!(matches!(result, Err(TxError::Dropped { .. })));
        assert_eq!(chain.submission_log().len(), 1);
        events.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalization_timeout() {
        // No block production: the transaction never finalizes
        let chain = Arc::new(InMemoryChain::new());
        let events = Arc::new(EventBus::new());
        events.init(chain.clone()).await.unwrap();
        let coordinator = TransactionCoordinator::new(chain.clone(), events.clone())
            .with_timeouts(Duration::from_secs(3), Duration::from_secs(1));

        let result = coordinator
            .submit_and_wait(&SignerId::from("carol"), TxRequest::new(Call::new("system", "remark")))
            .await;
        match result {
            Err(TxError::Timeout { label, source }) => {
                assert_eq!(label, "system.remark");
                assert!(source.is_timeout());
            }
            other => panic!("unexpected {:?}", other.map(|o| o.label)),
        }
        events.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_changed_after_first_submit_apply() {
        let chain = Arc::new(InMemoryChain::new());
        let events = Arc::new(EventBus::new());
        events.init(chain.clone()).await.unwrap();
        let coordinator = TransactionCoordinator::new(chain.clone(), events.clone());
        let grace = SignerId::from("grace");

        // The first transaction spawns the signer's queue
        let first = coordinator.submit(&grace, TxRequest::new(Call::new("system", "remark")));
        while chain.pending_count() == 0 {
            time::sleep(Duration::from_millis(10)).await;
        }
        chain.produce_block();
        assert_eq!(first.wait().await.unwrap().nonce, 0);

        let coordinator = coordinator.with_timeouts(Duration::from_secs(3), Duration::from_secs(1));
        let started = time::Instant::now();
        let result = coordinator
            .submit_and_wait(&grace, TxRequest::new(Call::new("system", "remark")))
            .await;
        match result {
            Err(TxError::Timeout {
                source: WaitError::Timeout { elapsed, .. },
                ..
            }) => assert_eq!(elapsed, Duration::from_secs(3)),
            other => panic!("unexpected {:?}", other.map(|o| o.label)),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        events.destroy();
    }

    #[tokio::test]
    async fn test_uninitialized_bus_is_rejected() {
        let chain = Arc::new(InMemoryChain::new());
        let coordinator = TransactionCoordinator::new(chain.clone(), Arc::new(EventBus::new()));
        let result = coordinator
            .submit_and_wait(&SignerId::from("dave"), TxRequest::new(Call::new("system", "remark")))
            .await;
        assert!(matches!(result, Err(TxError::Connection { .. })));
        assert!(chain.submission_log().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_pending() {
        let chain = Arc::new(InMemoryChain::new());
        let events = Arc::new(EventBus::new());
        events.init(chain.clone()).await.unwrap();
        let coordinator = TransactionCoordinator::new(chain.clone(), events.clone());

        let pending = coordinator.submit(&SignerId::from("erin"), TxRequest::new(Call::new("system", "remark")));
        coordinator.shutdown();
        assert!(matches!(pending.wait().await, Err(TxError::Closed { .. })));

        let late = coordinator.submit(&SignerId::from("erin"), TxRequest::new(Call::new("system", "remark")));
        coordinator.shutdown();
        assert!(matches!(late.wait().await, Err(TxError::Closed { .. })));
        events.destroy();
    }
}
