use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::chain::BlockRef;
use crate::process::ProcessRole;
use crate::stack::StackState;

/// Failure of a readiness wait.
///
/// Every variant carries the label of the wait so that two waits with the
/// same shape (e.g. two storage polls) can be told apart in logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("Timed out after {elapsed:?} waiting for {label}")]
    Timeout { label: String, elapsed: Duration },

    #[error("{label} failed: {reason}")]
    Fatal { label: String, reason: String },

    #[error("Wait for {label} interrupted by shutdown")]
    Cancelled { label: String },
}

impl WaitError {
    pub fn label(&self) -> &str {
        match self {
            Self::Timeout { label, .. } | Self::Fatal { label, .. } | Self::Cancelled { label } => {
                label
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Resource not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    #[error("Failed to spawn {role}: {source}")]
    Spawn {
        role: ProcessRole,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} is already running")]
    AlreadyRunning { role: ProcessRole },

    #[error("Failed to signal {role}: {reason}")]
    Signal { role: ProcessRole, reason: String },

    #[error("Log sink error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{role} did not become ready: {source}")]
    Readiness {
        role: ProcessRole,
        #[source]
        source: WaitError,
    },

    #[error("{role} exited before becoming ready (code {code:?})")]
    ProcessExited { role: ProcessRole, code: Option<i32> },

    #[error("Stack cannot be started from state {0}")]
    InvalidState(StackState),

    #[error("Stack start cancelled by a stop request")]
    Cancelled,
}

/// Failure while provisioning the stack binaries from a release.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Unable to fetch releases list: {0}")]
    ReleasesList(String),

    #[error("Unable to find target {0} release")]
    ReleaseNotFound(String),

    #[error("Unable to download release asset {asset}: {reason}")]
    Asset { asset: String, reason: String },

    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event bus is not initialized")]
    NotInitialized,

    #[error("Event bus is already initialized")]
    AlreadyInitialized,

    #[error("Event subscription failed: {0}")]
    Subscription(String),

    #[error("Event {expected} not observed: {source}")]
    Timeout {
        expected: String,
        #[source]
        source: WaitError,
    },
}

/// Terminal failure of a coordinated transaction.
///
/// None of these are retried by the coordinator.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("{label}: transaction failed: {reason}")]
    Failed { label: String, reason: String },

    #[error("{label}: transaction dropped: {reason}")]
    Dropped { label: String, reason: String },

    #[error("{label}: finalized in block {block} without expected event {expected}")]
    ExpectedEventMissing {
        label: String,
        block: BlockRef,
        expected: String,
    },

    #[error("{label}: {source}")]
    Timeout {
        label: String,
        #[source]
        source: WaitError,
    },

    #[error("{label}: chain connection error: {reason}")]
    Connection { label: String, reason: String },

    #[error("{label}: transaction coordinator is shut down")]
    Closed { label: String },
}

impl TxError {
    pub fn label(&self) -> &str {
        match self {
            Self::Failed { label, .. }
            | Self::Dropped { label, .. }
            | Self::ExpectedEventMissing { label, .. }
            | Self::Timeout { label, .. }
            | Self::Connection { label, .. }
            | Self::Closed { label } => label,
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{step}: {source}")]
    Wait {
        step: String,
        #[source]
        source: WaitError,
    },

    #[error(transparent)]
    Transaction(#[from] TxError),

    #[error("{step}: {reason}")]
    Chain { step: String, reason: String },

    #[error("{step}: {reason}")]
    InvalidState { step: String, reason: String },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed building contract {contract} (code {code:?})")]
    Failed {
        contract: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Unable to detect output directory of contract {contract}")]
    OutputDirectoryNotDetected { contract: String, output: String },

    #[error("File {file} not generated under {}", dir.display())]
    MissingArtifact { file: String, dir: PathBuf },

    #[error("Artifact copy failed: {0}")]
    Io(#[from] std::io::Error),
}
