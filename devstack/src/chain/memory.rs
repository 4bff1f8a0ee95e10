//! In-process chain implementing `ChainConnection`.
//!
//! Instant finality: a produced block is final right away. Nonces are
//! validated strictly, so any out-of-order submission shows up as an
//! `Invalid` status instead of being silently reordered.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    BlockRef, ChainConnection, ChainEvent, FinalizedBlock, SignedCall, SignerId, StorageKey,
    TxHash, TxStatus, TxSubscription,
};

const SUBSCRIPTION_CAPACITY: usize = 1024;
const STATUS_CAPACITY: usize = 8;

/// Event produced by a dispatched call, before it is placed in a block.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeEvent {
    pub section: String,
    pub method: String,
    pub fields: Vec<Value>,
}

impl RuntimeEvent {
    pub fn new(section: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            method: method.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, value: impl Into<Value>) -> Self {
        self.fields.push(value.into());
        self
    }
}

/// Outcome of dispatching one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Call executed; events are emitted in order after it
    Ok(Vec<RuntimeEvent>),
    /// Call included but failed (`system.ExtrinsicFailed`); nonce is consumed
    Failed(String),
    /// Transaction never makes it into the block
    Drop(String),
}

/// Mutable runtime storage visible to dispatchers.
#[derive(Debug, Default)]
pub struct RuntimeState {
    storage: HashMap<StorageKey, Value>,
}

impl RuntimeState {
    pub fn get(&self, key: &StorageKey) -> Option<&Value> {
        self.storage.get(key)
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.storage.contains_key(key)
    }

    pub fn insert(&mut self, key: StorageKey, value: Value) {
        self.storage.insert(key, value);
    }

    pub fn remove(&mut self, key: &StorageKey) -> Option<Value> {
        self.storage.remove(key)
    }
}

type Dispatcher = Arc<dyn Fn(&SignedCall, &mut RuntimeState) -> Dispatch + Send + Sync>;

fn accept_all(_tx: &SignedCall, _runtime: &mut RuntimeState) -> Dispatch {
    Dispatch::Ok(Vec::new())
}

struct PoolEntry {
    tx: SignedCall,
    hash: TxHash,
    status: mpsc::Sender<TxStatus>,
}

#[derive(Default)]
struct ChainState {
    nonces: HashMap<SignerId, u64>,
    runtime: RuntimeState,
    pool: Vec<PoolEntry>,
    blocks: Vec<FinalizedBlock>,
    subscribers: Vec<mpsc::Sender<FinalizedBlock>>,
    submissions: Vec<SignedCall>,
    tx_counter: u64,
}

impl ChainState {
    /// Nonce the next submission from `signer` must carry.
    fn expected_nonce(&self, signer: &SignerId) -> u64 {
        let base = self.nonces.get(signer).copied().unwrap_or(0);
        let pending = self.pool.iter().filter(|e| &e.tx.signer == signer).count() as u64;
        base + pending
    }
}

pub struct InMemoryChain {
    state: Mutex<ChainState>,
    dispatcher: RwLock<Dispatcher>,
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChain {
    /// Chain where every call succeeds without emitting business events.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            dispatcher: RwLock::new(Arc::new(accept_all)),
        }
    }

    pub fn with_dispatcher<F>(self, dispatcher: F) -> Self
    where
        F: Fn(&SignedCall, &mut RuntimeState) -> Dispatch + Send + Sync + 'static,
    {
        self.set_dispatcher(dispatcher);
        self
    }

    pub fn set_dispatcher<F>(&self, dispatcher: F)
    where
        F: Fn(&SignedCall, &mut RuntimeState) -> Dispatch + Send + Sync + 'static,
    {
        *self.dispatcher.write() = Arc::new(dispatcher);
    }

    pub fn set_storage(&self, key: StorageKey, value: Value) {
        self.state.lock().runtime.insert(key, value);
    }

    pub fn storage(&self, key: &StorageKey) -> Option<Value> {
        self.state.lock().runtime.get(key).cloned()
    }

    pub fn nonce_of(&self, signer: &SignerId) -> u64 {
        self.state.lock().nonces.get(signer).copied().unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Every accepted submission, in arrival order.
    pub fn submission_log(&self) -> Vec<SignedCall> {
        self.state.lock().submissions.clone()
    }

    pub fn blocks(&self) -> Vec<FinalizedBlock> {
        self.state.lock().blocks.clone()
    }

    pub fn best_block(&self) -> Option<BlockRef> {
        self.state.lock().blocks.last().map(|b| b.block.clone())
    }

    /// Drop every finalized-block subscription, as a lost connection would.
    pub fn close_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Build and finalize the next block from the pool, in submission order.
    pub fn produce_block(&self) -> FinalizedBlock {
        let dispatcher = self.dispatcher.read().clone();
        let mut state = self.state.lock();

        let number = state.blocks.len() as u64 + 1;
        let block = BlockRef::new(number, format!("0xb{:063x}", number));
        let pool = std::mem::take(&mut state.pool);

        let mut events = Vec::new();
        let mut notifications = Vec::with_capacity(pool.len());
        for entry in pool {
            let expected = state.nonces.get(&entry.tx.signer).copied().unwrap_or(0);
            if entry.tx.nonce != expected {
                notifications.push((
                    entry.status,
                    vec![TxStatus::Invalid(format!(
                        "stale nonce {} (expected {})",
                        entry.tx.nonce, expected
                    ))],
                ));
                continue;
            }

            let outcome = dispatcher(&entry.tx, &mut state.runtime);
            let emitted = match outcome {
                Dispatch::Drop(reason) => {
                    notifications.push((entry.status, vec![TxStatus::Dropped(reason)]));
                    continue;
                }
                Dispatch::Ok(mut emitted) => {
                    emitted.push(RuntimeEvent::new("system", "ExtrinsicSuccess"));
                    emitted
                }
                Dispatch::Failed(reason) => {
                    vec![RuntimeEvent::new("system", "ExtrinsicFailed").field(reason)]
                }
            };

            state.nonces.insert(entry.tx.signer.clone(), expected + 1);
            for event in emitted {
                let index = events.len() as u32;
                events.push(ChainEvent {
                    section: event.section,
                    method: event.method,
                    fields: event.fields,
                    block: block.clone(),
                    tx: Some(entry.hash.clone()),
                    index,
                });
            }
            notifications.push((
                entry.status,
                vec![
                    TxStatus::Included(block.clone()),
                    TxStatus::Finalized(block.clone()),
                ],
            ));
        }

        let finalized = FinalizedBlock { block, events };
        state.blocks.push(finalized.clone());
        state.subscribers.retain(|subscriber| match subscriber.try_send(finalized.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Finalized block subscriber lagging, dropping block {}", finalized.block);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        drop(state);

        // Statuses go out after the block is visible to subscribers
        for (status, updates) in notifications {
            for update in updates {
                let _ = status.try_send(update);
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "Produced block {} with {} events",
                finalized.block,
                finalized.events.len()
            );
        }
        finalized
    }

    /// Produce a block every `interval` until the chain is dropped.
    pub fn spawn_block_production(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let chain: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match chain.upgrade() {
                    Some(chain) => {
                        chain.produce_block();
                    }
                    None => return,
                }
            }
        })
    }
}

#[async_trait]
impl ChainConnection for InMemoryChain {
    async fn account_nonce(&self, signer: &SignerId) -> Result<u64> {
        Ok(self.nonce_of(signer))
    }

    async fn submit(&self, tx: SignedCall) -> Result<TxSubscription> {
        let (status_tx, statuses) = mpsc::channel(STATUS_CAPACITY);
        let mut state = self.state.lock();

        let expected = state.expected_nonce(&tx.signer);
        if tx.nonce != expected {
            bail!(
                "Invalid transaction nonce for {}: expected {}, got {}",
                tx.signer,
                expected,
                tx.nonce
            );
        }

        state.tx_counter += 1;
        let hash = format!("0xe{:063x}", state.tx_counter);
        state.submissions.push(tx.clone());
        state.pool.push(PoolEntry {
            tx,
            hash: hash.clone(),
            status: status_tx.clone(),
        });
        drop(state);

        let _ = status_tx.try_send(TxStatus::Submitted);
        Ok(TxSubscription { hash, statuses })
    }

    async fn query_storage(&self, key: &StorageKey) -> Result<Option<Value>> {
        Ok(self.storage(key))
    }

    async fn subscribe_finalized(&self) -> Result<mpsc::Receiver<FinalizedBlock>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.state.lock().subscribers.push(tx);
        Ok(rx)
    }
}
