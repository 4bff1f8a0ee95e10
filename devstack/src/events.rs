// File: devstack/src/events.rs
//
// Event Bus
//
// Keeps a live subscription to finalized blocks, buffers their events in
// arrival order (bounded, oldest first eviction) and lets callers wait for a
// matching event within a time budget.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::chain::{BlockRef, ChainConnection, ChainEvent, FinalizedBlock, TxHash};
use crate::error::{EventError, WaitError};
use crate::waiter::{wait_for, Readiness, WaitSpec};

/// Events kept in memory; only recent events matter for correlation.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;
/// Finalized blocks remembered for `has_block`.
pub const DEFAULT_BLOCK_HISTORY: usize = 1024;
/// Poll interval of event waits.
pub const DEFAULT_EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Selects events by section, method and optionally payload fields, block
/// and originating transaction.
///
/// # Example
///
/// ```rust,ignore
/// let matcher = EventMatcher::new("phalaFatContracts", "ClusterCreated")
///     .in_block(&block)
///     .from_tx(&hash);
/// let event = bus.wait_for_event(&matcher, Duration::from_secs(10)).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EventMatcher {
    section: String,
    method: String,
    fields: Vec<(usize, Value)>,
    block: Option<String>,
    tx: Option<TxHash>,
}

impl EventMatcher {
    pub fn new(section: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            method: method.into(),
            fields: Vec::new(),
            block: None,
            tx: None,
        }
    }

    /// Require payload field `index` to equal `value`.
    pub fn field(mut self, index: usize, value: impl Into<Value>) -> Self {
        self.fields.push((index, value.into()));
        self
    }

    pub fn in_block(mut self, block: &BlockRef) -> Self {
        self.block = Some(block.hash.clone());
        self
    }

    /// Only events emitted by `tx` (or by no transaction at all).
    pub fn from_tx(mut self, tx: &str) -> Self {
        self.tx = Some(tx.to_string());
        self
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn matches(&self, event: &ChainEvent) -> bool {
        if !event.is(&self.section, &self.method) {
            return false;
        }
        if let Some(hash) = &self.block {
            if &event.block.hash != hash {
                return false;
            }
        }
        if let (Some(expected), Some(origin)) = (&self.tx, &event.tx) {
            if expected != origin {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(index, value)| event.field(*index) == Some(value))
    }
}

impl fmt::Display for EventMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.method)
    }
}

struct BufferedEvent {
    event: ChainEvent,
    consumed: bool,
}

struct EventBuffer {
    events: VecDeque<BufferedEvent>,
    capacity: usize,
    blocks: VecDeque<BlockRef>,
    block_history: usize,
    closed: Option<String>,
}

impl EventBuffer {
    fn new(capacity: usize, block_history: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity,
            blocks: VecDeque::new(),
            block_history,
            closed: None,
        }
    }

    fn push_block(&mut self, block: FinalizedBlock) {
        for event in block.events {
            if self.events.len() == self.capacity {
                self.events.pop_front();
            }
            if self.capacity > 0 {
                self.events.push_back(BufferedEvent {
                    event,
                    consumed: false,
                });
            }
        }
        if self.blocks.len() == self.block_history {
            self.blocks.pop_front();
        }
        if self.block_history > 0 {
            self.blocks.push_back(block.block);
        }
    }

    /// First unconsumed matching event, marked consumed.
    fn take_first(&mut self, matcher: &EventMatcher) -> Option<ChainEvent> {
        let entry = self
            .events
            .iter_mut()
            .find(|entry| !entry.consumed && matcher.matches(&entry.event))?;
        entry.consumed = true;
        Some(entry.event.clone())
    }

    fn has_block(&self, hash: &str) -> bool {
        self.blocks.iter().any(|block| block.hash == hash)
    }

    fn block_events(&self, hash: &str) -> Vec<ChainEvent> {
        self.events
            .iter()
            .filter(|entry| entry.event.block.hash == hash)
            .map(|entry| entry.event.clone())
            .collect()
    }
}

pub struct EventBus {
    buffer: Arc<Mutex<EventBuffer>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<Arc<dyn ChainConnection>>>,
    poll_interval: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(EventBuffer::new(capacity, DEFAULT_BLOCK_HISTORY))),
            subscription: Mutex::new(None),
            connection: Mutex::new(None),
            poll_interval: DEFAULT_EVENT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn is_initialized(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Subscribe to finalized blocks of `connection`.
    ///
    /// # Errors
    ///
    /// - `EventError::AlreadyInitialized` if the bus is already subscribed
    /// - `EventError::Subscription` if the connection refused the subscription;
    ///   the bus stays uninitialized and `destroy` remains safe to call
    pub async fn init(&self, connection: Arc<dyn ChainConnection>) -> Result<(), EventError> {
        if self.is_initialized() {
            return Err(EventError::AlreadyInitialized);
        }

        let mut blocks = connection
            .subscribe_finalized()
            .await
            .map_err(|e| EventError::Subscription(format!("{:#}", e)))?;

        self.buffer.lock().closed = None;
        let buffer = self.buffer.clone();
        let task = tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("Finalized block {} ({} events)", block.block, block.events.len());
                }
                buffer.lock().push_block(block);
            }
            log::warn!("Finalized block subscription ended");
            buffer.lock().closed = Some("finalized block subscription ended".to_string());
        });

        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            // Lost a race with a concurrent init
            task.abort();
            return Err(EventError::AlreadyInitialized);
        }
        *subscription = Some(task);
        *self.connection.lock() = Some(connection);
        log::debug!("Event bus subscribed to finalized blocks");
        Ok(())
    }

    /// Unsubscribe and release the connection. Safe to call more than once
    /// and without a successful `init`.
    pub fn destroy(&self) {
        let task = self.subscription.lock().take();
        let connection = self.connection.lock().take();
        if let Some(task) = task {
            task.abort();
            self.buffer.lock().closed = Some("event bus destroyed".to_string());
            log::debug!("Event bus destroyed");
        }
        drop(connection);
    }

    /// Wait for the first buffered, not yet consumed event matching `matcher`.
    ///
    /// A returned event is consumed: a later wait with the same matcher will
    /// not observe it again.
    ///
    /// # Errors
    ///
    /// - `EventError::NotInitialized` if `init` was not called
    /// - `EventError::Timeout` if no matching event arrived within `timeout`
    /// - `EventError::Subscription` if the block subscription ended meanwhile
    pub async fn wait_for_event(
        &self,
        matcher: &EventMatcher,
        timeout: Duration,
    ) -> Result<ChainEvent, EventError> {
        if !self.is_initialized() {
            return Err(EventError::NotInitialized);
        }

        let spec = WaitSpec::new(format!("event {}", matcher), timeout).poll_every(self.poll_interval);
        let result = wait_for(spec, || {
            let readiness = {
                let mut buffer = self.buffer.lock();
                match buffer.take_first(matcher) {
                    Some(event) => Readiness::Ready(event),
                    None => match &buffer.closed {
                        Some(reason) => Readiness::Fatal(reason.clone()),
                        None => Readiness::NotReady,
                    },
                }
            };
            std::future::ready(readiness)
        })
        .await;

        result.map_err(|source| match source {
            WaitError::Fatal { reason, .. } => EventError::Subscription(reason),
            source => EventError::Timeout {
                expected: matcher.to_string(),
                source,
            },
        })
    }

    /// Whether the finalized block `block` has been observed.
    pub fn has_block(&self, block: &BlockRef) -> bool {
        self.buffer.lock().has_block(&block.hash)
    }

    /// Buffered events of `block`, consumed or not, in block order.
    pub fn block_events(&self, block: &BlockRef) -> Vec<ChainEvent> {
        self.buffer.lock().block_events(&block.hash)
    }

    pub fn latest_block(&self) -> Option<BlockRef> {
        self.buffer.lock().blocks.back().cloned()
    }

    /// Subscription ended (or bus destroyed) with this reason.
    pub fn closed_reason(&self) -> Option<String> {
        self.buffer.lock().closed.clone()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(task) = self.subscription.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{InMemoryChain, RuntimeEvent};
    use crate::chain::{Call, Dispatch, SignedCall, SignerId};
    use proptest::prelude::*;
    use serde_json::json;

    fn event(section: &str, method: &str, block: &BlockRef, seq: u64) -> ChainEvent {
        ChainEvent {
            section: section.to_string(),
            method: method.to_string(),
            fields: vec![json!(seq)],
            block: block.clone(),
            tx: None,
            index: 0,
        }
    }

    #[test]
    fn test_matcher_fields_block_and_tx() {
        let block = BlockRef::new(1, "0x01");
        let mut e = event("phalaFatContracts", "ClusterCreated", &block, 5);
        e.tx = Some("0xaa".to_string());

        let matcher = EventMatcher::new("phalaFatContracts", "ClusterCreated");
        assert!(matcher.matches(&e));
        assert!(matcher.clone().field(0, 5).matches(&e));
        assert!(!matcher.clone().field(0, 6).matches(&e));
        assert!(!matcher.clone().field(1, 5).matches(&e));
        assert!(matcher.clone().in_block(&block).matches(&e));
        assert!(!matcher.clone().in_block(&BlockRef::new(2, "0x02")).matches(&e));
        assert!(matcher.clone().from_tx("0xaa").matches(&e));
        assert!(!matcher.clone().from_tx("0xbb").matches(&e));

        e.tx = None;
        assert!(matcher.clone().from_tx("0xbb").matches(&e));
        assert_eq!(matcher.to_string(), "phalaFatContracts.ClusterCreated");
    }

    #[test]
    fn test_take_first_consumes() {
        let block = BlockRef::new(1, "0x01");
        let mut buffer = EventBuffer::new(10, 10);
        buffer.push_block(FinalizedBlock {
            block: block.clone(),
            events: vec![event("a", "X", &block, 1), event("a", "X", &block, 2)],
        });

        let matcher = EventMatcher::new("a", "X");
        assert_eq!(buffer.take_first(&matcher).unwrap().fields, vec![json!(1)]);
        assert_eq!(buffer.take_first(&matcher).unwrap().fields, vec![json!(2)]);
        assert!(buffer.take_first(&matcher).is_none());
        // Consumed events are still part of the block view
        assert_eq!(buffer.block_events("0x01").len(), 2);
    }

    #[tokio::test]
    async fn test_wait_before_init_fails() {
        let bus = EventBus::new();
        let result = bus
            .wait_for_event(&EventMatcher::new("a", "X"), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(EventError::NotInitialized)));
        // Destroy without init is fine
        bus.destroy();
        bus.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_event_from_chain() {
        let chain = Arc::new(InMemoryChain::new().with_dispatcher(|_, _| {
            Dispatch::Ok(vec![RuntimeEvent::new("test", "Done").field(42)])
        }));
        let bus = Arc::new(EventBus::new());
        bus.init(chain.clone()).await.unwrap();
        assert!(matches!(
            bus.init(chain.clone()).await,
            Err(EventError::AlreadyInitialized)
        ));

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for_event(
                    &EventMatcher::new("test", "Done").field(0, 42),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        chain
            .submit(SignedCall {
                signer: SignerId::from("alice"),
                nonce: 0,
                call: Call::new("test", "run"),
            })
            .await
            .unwrap();
        let block = chain.produce_block();

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.block, block.block);

        // Block becomes visible once the subscription task ran
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.has_block(&block.block));
        assert_eq!(bus.block_events(&block.block).len(), 2);
        bus.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_event_timeout() {
        let chain = Arc::new(InMemoryChain::new());
        let bus = EventBus::new();
        bus.init(chain.clone()).await.unwrap();

        let result = bus
            .wait_for_event(&EventMatcher::new("test", "Never"), Duration::from_secs(2))
            .await;
        match result {
            Err(EventError::Timeout { expected, source }) => {
                assert_eq!(expected, "test.Never");
                assert!(source.is_timeout());
            }
            other => panic!("unexpected {:?}", other),
        }
        bus.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscription_fails_fast() {
        let chain = Arc::new(InMemoryChain::new());
        let bus = EventBus::new();
        bus.init(chain.clone()).await.unwrap();
        chain.close_subscriptions();

        let started = tokio::time::Instant::now();
        let result = bus
            .wait_for_event(&EventMatcher::new("test", "Never"), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(EventError::Subscription(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_buffer_keeps_most_recent_events(
            capacity in 1usize..40,
            blocks in proptest::collection::vec(0usize..8, 0..30),
        ) {
            let mut buffer = EventBuffer::new(capacity, 4);
            let mut seq = 0u64;
            for (number, size) in blocks.iter().enumerate() {
                let block = BlockRef::new(number as u64, format!("0x{:x}", number));
                let events = (0..*size)
                    .map(|_| {
                        seq += 1;
                        event("a", "X", &block, seq)
                    })
                    .collect();
                buffer.push_block(FinalizedBlock { block, events });
            }

            let total = seq as usize;
            let kept: Vec<u64> = buffer
                .events
                .iter()
                .map(|entry| entry.event.fields[0].as_u64().unwrap())
                .collect();
            prop_assert_eq!(kept.len(), total.min(capacity));
            let first = (total - kept.len()) as u64 + 1;
            let expected: Vec<u64> = (first..=seq).collect();
            prop_assert_eq!(kept, expected);
            prop_assert!(buffer.blocks.len() <= 4);
        }
    }
}
