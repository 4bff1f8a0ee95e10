// File: devstack/src/chain/mod.rs
//
// Chain connection capability shared by the event bus and the transaction
// coordinator. Wire protocol and call encoding live behind this trait.

/// In-process chain used by tests and local harness runs
pub mod memory;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::{Dispatch, InMemoryChain, RuntimeEvent, RuntimeState};

/// Hex encoded transaction hash.
pub type TxHash = String;

/// Signing identity (account) on whose behalf transactions are submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerId(String);

impl SignerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SignerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

impl BlockRef {
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// A runtime call. Arguments are opaque JSON values; encoding is up to the
/// connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub section: String,
    pub method: String,
    pub args: Vec<Value>,
    /// Wrapped call for dispatch wrappers such as `sudo`
    pub inner: Option<Box<Call>>,
}

impl Call {
    pub fn new(section: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            method: method.into(),
            args: Vec::new(),
            inner: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `sudo.sudo(inner)`
    pub fn sudo(inner: Call) -> Self {
        Self {
            section: "sudo".to_string(),
            method: "sudo".to_string(),
            args: Vec::new(),
            inner: Some(Box::new(inner)),
        }
    }

    /// The call that ends up executing, unwrapping dispatch wrappers.
    pub fn dispatched(&self) -> &Call {
        match &self.inner {
            Some(inner) => inner.dispatched(),
            None => self,
        }
    }

    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }

    /// Human readable label, e.g. `sudo(phalaRegistry.registerGatekeeper)`.
    pub fn label(&self) -> String {
        match &self.inner {
            Some(inner) => format!("{}({})", self.method, inner.label()),
            None => format!("{}.{}", self.section, self.method),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedCall {
    pub signer: SignerId,
    pub nonce: u64,
    pub call: Call,
}

/// Progress of a submitted transaction as reported by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Submitted,
    Included(BlockRef),
    Finalized(BlockRef),
    Dropped(String),
    Invalid(String),
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finalized(_) | Self::Dropped(_) | Self::Invalid(_)
        )
    }
}

/// Handle on a submitted transaction. The status stream ends after a
/// terminal status.
#[derive(Debug)]
pub struct TxSubscription {
    pub hash: TxHash,
    pub statuses: mpsc::Receiver<TxStatus>,
}

/// Event emitted by the runtime, never mutated once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub section: String,
    pub method: String,
    pub fields: Vec<Value>,
    pub block: BlockRef,
    /// Transaction that emitted the event, if any
    pub tx: Option<TxHash>,
    /// Position within the block
    pub index: u32,
}

impl ChainEvent {
    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.section, self.method)
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedBlock {
    pub block: BlockRef,
    pub events: Vec<ChainEvent>,
}

/// Storage entry address: `section.item` or `section.item(key)` for maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub section: String,
    pub item: String,
    pub key: Option<String>,
}

impl StorageKey {
    pub fn new(section: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            item: item.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}.{}({})", self.section, self.item, key),
            None => write!(f, "{}.{}", self.section, self.item),
        }
    }
}

/// Generic connection to a chain.
///
/// Shared read-only by the event bus and the transaction coordinator.
#[async_trait]
pub trait ChainConnection: Send + Sync {
    /// Current on-chain nonce of `signer` (pending transactions excluded).
    ///
    /// # Errors
    ///
    /// Returns an error if the chain is unreachable or the query fails.
    async fn account_nonce(&self, signer: &SignerId) -> Result<u64>;

    /// Sign and broadcast `tx`, returning its status stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction could not be handed to the chain.
    /// Rejections after that point are reported on the status stream.
    async fn submit(&self, tx: SignedCall) -> Result<TxSubscription>;

    /// Read one storage entry. `None` when the entry does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the chain is unreachable or the query fails.
    async fn query_storage(&self, key: &StorageKey) -> Result<Option<Value>>;

    /// Subscribe to finalized blocks with their decoded events.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    async fn subscribe_finalized(&self) -> Result<mpsc::Receiver<FinalizedBlock>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sudo_label_and_dispatch() {
        let call = Call::sudo(
            Call::new("phalaRegistry", "registerGatekeeper").arg(json!("0xaa")),
        );
        assert_eq!(call.label(), "sudo(phalaRegistry.registerGatekeeper)");
        assert!(call.dispatched().is("phalaRegistry", "registerGatekeeper"));
        assert_eq!(call.dispatched().args, vec![json!("0xaa")]);
    }

    #[test]
    fn test_storage_key_display() {
        assert_eq!(
            StorageKey::new("phalaRegistry", "gatekeeper").to_string(),
            "phalaRegistry.gatekeeper"
        );
        assert_eq!(
            StorageKey::new("phalaRegistry", "workers")
                .with_key("0xaa")
                .to_string(),
            "phalaRegistry.workers(0xaa)"
        );
    }

    #[test]
    fn test_block_ref_display() {
        assert_eq!(BlockRef::new(7, "0x07").to_string(), "#7 (0x07)");
    }
}
