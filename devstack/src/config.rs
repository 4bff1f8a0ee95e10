use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NODE_BINARY: &str = "stacks/phala-node";
pub const DEFAULT_WORKER_BINARY: &str = "stacks/pruntime/pruntime";
pub const DEFAULT_RELAY_BINARY: &str = "stacks/pherry";

/// Releases API the stack binaries are provisioned from.
pub const DEFAULT_RELEASES_URL: &str =
    "https://api.github.com/repos/Phala-Network/phala-blockchain/releases";

// Ports exposed by the dev stack
pub const DEFAULT_NODE_PORT: u16 = 9944;
pub const DEFAULT_WORKER_PORT: u16 = 8000;

pub const DEFAULT_BLOCK_TIME_MS: u64 = 6000;
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
pub const DEFAULT_LOGS_DIR: &str = "logs/";

/// Output lines the relay prints once it talks to the node and to the worker.
pub const DEFAULT_RELAY_MARKERS: [&str; 2] = ["Connected to substrate", "pRuntime get_info response"];

/// How much of the stack the orchestrator manages.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Spawn and supervise every process
    #[default]
    Full,
    /// Processes are already running; only wait for their readiness
    Attach,
}

// Functions Helpers
fn default_node_binary() -> PathBuf {
    PathBuf::from(DEFAULT_NODE_BINARY)
}

fn default_worker_binary() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_BINARY)
}

fn default_relay_binary() -> PathBuf {
    PathBuf::from(DEFAULT_RELAY_BINARY)
}

fn default_releases_url() -> String {
    DEFAULT_RELEASES_URL.to_string()
}

fn default_node_port() -> u16 {
    DEFAULT_NODE_PORT
}

fn default_worker_port() -> u16 {
    DEFAULT_WORKER_PORT
}

fn default_block_time_ms() -> u64 {
    DEFAULT_BLOCK_TIME_MS
}

fn default_readiness_timeout_ms() -> u64 {
    DEFAULT_READINESS_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOGS_DIR)
}

fn default_relay_markers() -> Vec<String> {
    DEFAULT_RELAY_MARKERS.iter().map(|m| m.to_string()).collect()
}

/// Parameters of one stack run.
///
/// Every field can be set from the command line or from a JSON config file;
/// missing JSON fields fall back to the same defaults as the CLI.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args, Serialize, Deserialize)]
pub struct StackConfig {
    /// Run mode: spawn the processes or attach to running ones
    #[clap(long, value_enum, default_value_t)]
    #[serde(default)]
    pub mode: RunMode,
    /// Path to the chain node binary
    #[clap(long, default_value = DEFAULT_NODE_BINARY)]
    #[serde(default = "default_node_binary")]
    pub node_binary: PathBuf,
    /// Path to the off-chain worker binary
    #[clap(long, default_value = DEFAULT_WORKER_BINARY)]
    #[serde(default = "default_worker_binary")]
    pub worker_binary: PathBuf,
    /// Path to the relay binary
    #[clap(long, default_value = DEFAULT_RELAY_BINARY)]
    #[serde(default = "default_relay_binary")]
    pub relay_binary: PathBuf,
    /// Release tag (or `latest`) to download missing binaries from
    #[clap(long)]
    #[serde(default)]
    pub stack_version: Option<String>,
    /// Releases API listing the downloadable stack releases
    #[clap(long, default_value = DEFAULT_RELEASES_URL)]
    #[serde(default = "default_releases_url")]
    pub releases_url: String,
    /// Node RPC port
    #[clap(long, default_value_t = DEFAULT_NODE_PORT)]
    #[serde(default = "default_node_port")]
    pub node_port: u16,
    /// Worker HTTP port
    #[clap(long, default_value_t = DEFAULT_WORKER_PORT)]
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    /// Extra arguments appended to the node command line
    #[clap(long = "node-arg", allow_hyphen_values = true)]
    #[serde(default)]
    pub node_args: Vec<String>,
    /// Extra arguments appended to the worker command line
    #[clap(long = "worker-arg", allow_hyphen_values = true)]
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Extra arguments appended to the relay command line
    #[clap(long = "relay-arg", allow_hyphen_values = true)]
    #[serde(default)]
    pub relay_args: Vec<String>,
    /// Block time of the dev chain (ms)
    #[clap(long, default_value_t = DEFAULT_BLOCK_TIME_MS)]
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    /// Time each process gets to become ready (ms)
    #[clap(long, default_value_t = DEFAULT_READINESS_TIMEOUT_MS)]
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// Interval between two readiness checks (ms)
    #[clap(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time a process gets to exit after SIGTERM before it is killed (ms)
    #[clap(long, default_value_t = DEFAULT_STOP_GRACE_MS)]
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Save the output of every process to a log file
    #[clap(long)]
    #[serde(default)]
    pub save_logs: bool,
    /// Directory receiving the log files
    #[clap(long, default_value = DEFAULT_LOGS_DIR)]
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Output lines proving the relay is connected (all must appear)
    #[clap(long = "relay-marker", default_values_t = default_relay_markers())]
    #[serde(default = "default_relay_markers")]
    pub relay_markers: Vec<String>,
    /// Stop the stack automatically after this many ms (0 = no limit)
    #[clap(long, default_value_t = 0)]
    #[serde(default)]
    pub timelimit_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            node_binary: default_node_binary(),
            worker_binary: default_worker_binary(),
            relay_binary: default_relay_binary(),
            stack_version: None,
            releases_url: default_releases_url(),
            node_port: DEFAULT_NODE_PORT,
            worker_port: DEFAULT_WORKER_PORT,
            node_args: Vec::new(),
            worker_args: Vec::new(),
            relay_args: Vec::new(),
            block_time_ms: DEFAULT_BLOCK_TIME_MS,
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            save_logs: false,
            logs_dir: default_logs_dir(),
            relay_markers: default_relay_markers(),
            timelimit_ms: 0,
        }
    }
}

impl StackConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// `None` when the run is not time limited.
    pub fn time_limit(&self) -> Option<Duration> {
        (self.timelimit_ms > 0).then(|| Duration::from_millis(self.timelimit_ms))
    }

    pub fn node_rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.node_port)
    }

    pub fn node_ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.node_port)
    }

    pub fn worker_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.worker_port)
    }

    /// Reject values that would make waits spin or never finish.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll interval must be greater than 0");
        }
        if self.readiness_timeout_ms == 0 {
            bail!("readiness timeout must be greater than 0");
        }
        if self.stack_version.as_deref().is_some_and(str::is_empty) {
            bail!("stack version cannot be empty");
        }
        if self.node_port == self.worker_port {
            bail!("node and worker cannot share port {}", self.node_port);
        }
        Ok(())
    }
}
