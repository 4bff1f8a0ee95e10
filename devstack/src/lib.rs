//! Local development stack harness.
//!
//! Launches and supervises the node, worker and relay processes of a dev
//! chain, waits for each of them to become ready, and coordinates
//! transactions and their events once the stack is live.

pub mod chain;
pub mod config;
pub mod contract;
pub mod error;
pub mod events;
pub mod process;
pub mod setup;
pub mod stack;
pub mod tx;
pub mod waiter;

pub use chain::{ChainConnection, InMemoryChain, SignerId};
pub use config::{RunMode, StackConfig};
pub use contract::{CargoContractBuilder, ContractBuilder};
pub use events::{EventBus, EventMatcher};
pub use process::{LaunchSpec, ProcessRole, ProcessSupervisor};
pub use setup::{SetupOptions, SetupReport, StackSetup};
pub use stack::{StackDescriptor, StackOrchestrator, StackState};
pub use tx::{TransactionCoordinator, TxRequest};
pub use waiter::{wait_for, Readiness, WaitSpec};
