// File: devstack/src/stack/descriptor.rs
//
// Ordered description of the processes making up a stack, with the
// readiness probe gating each of them.

use std::sync::Arc;
use std::time::Duration;

use crate::config::StackConfig;
use crate::error::ProcessError;
use crate::process::{binary_dir, LaunchSpec, MarkerExtractor, ProcessRole, SignalExtractor};
use crate::waiter::DEFAULT_POLL_INTERVAL;

use super::probe::{NodeRpcProbe, OutputSignalProbe, ReadinessProbe, WorkerInfoProbe};

/// Key the relay gets injected into the worker on a dev chain.
const DEV_WORKER_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// Default time a role gets to become ready.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(20);

/// One process of the stack.
#[derive(Clone)]
pub struct RoleSpec {
    pub role: ProcessRole,
    pub launch: LaunchSpec,
    pub probe: Arc<dyn ReadinessProbe>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub extractors: Vec<Arc<dyn SignalExtractor>>,
}

impl RoleSpec {
    pub fn new(role: ProcessRole, launch: LaunchSpec, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            role,
            launch,
            probe,
            timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            extractors: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_extractors(mut self, extractors: Vec<Arc<dyn SignalExtractor>>) -> Self {
        self.extractors = extractors;
        self
    }
}

impl std::fmt::Debug for RoleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleSpec")
            .field("role", &self.role)
            .field("launch", &self.launch)
            .field("probe", &self.probe.describe())
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("extractors", &self.extractors.len())
            .finish()
    }
}

/// Roles in start order. Stopped in reverse.
#[derive(Debug, Clone, Default)]
pub struct StackDescriptor {
    roles: Vec<RoleSpec>,
}

impl StackDescriptor {
    pub fn new(roles: Vec<RoleSpec>) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &[RoleSpec] {
        &self.roles
    }

    pub fn role(&self, role: ProcessRole) -> Option<&RoleSpec> {
        self.roles.iter().find(|spec| spec.role == role)
    }

    /// Fail fast on a missing binary before anything is launched.
    pub fn verify_binaries(&self) -> Result<(), ProcessError> {
        for spec in &self.roles {
            spec.launch.resolve_program()?;
        }
        Ok(())
    }

    /// Default dev stack: node, then worker, then relay.
    pub fn from_config(config: &StackConfig) -> Self {
        let timeout = config.readiness_timeout();
        let interval = config.poll_interval();

        let node = RoleSpec::new(
            ProcessRole::Node,
            launch_in_binary_dir(&config.node_binary)
                .args([
                    "--dev".to_string(),
                    "--rpc-methods=Unsafe".to_string(),
                    "--rpc-cors=all".to_string(),
                    format!("--rpc-port={}", config.node_port),
                    format!("--block-millisecs={}", config.block_time_ms),
                ])
                .args(config.node_args.iter().cloned()),
            Arc::new(NodeRpcProbe::new(config.node_rpc_url())),
        );

        let worker = RoleSpec::new(
            ProcessRole::Worker,
            launch_in_binary_dir(&config.worker_binary)
                .args([
                    "--cores=0".to_string(),
                    format!("--port={}", config.worker_port),
                    "--allow-cors".to_string(),
                ])
                .args(config.worker_args.iter().cloned()),
            Arc::new(WorkerInfoProbe::new(config.worker_url())),
        );

        let relay_extractors: Vec<Arc<dyn SignalExtractor>> = config
            .relay_markers
            .iter()
            .map(|marker| {
                Arc::new(MarkerExtractor::line(marker.clone(), marker.clone()))
                    as Arc<dyn SignalExtractor>
            })
            .collect();
        let relay = RoleSpec::new(
            ProcessRole::Relay,
            launch_in_binary_dir(&config.relay_binary)
                .args([
                    "--no-wait".to_string(),
                    "--mnemonic=//Alice".to_string(),
                    format!("--inject-key={}", DEV_WORKER_KEY),
                    format!("--substrate-ws-endpoint={}", config.node_ws_url()),
                    format!("--pruntime-endpoint={}", config.worker_url()),
                    format!("--dev-wait-block-ms={}", config.block_time_ms),
                ])
                .args(config.relay_args.iter().cloned()),
            Arc::new(OutputSignalProbe::new(config.relay_markers.iter().cloned())),
        )
        .with_extractors(relay_extractors);

        Self::new(
            [node, worker, relay]
                .into_iter()
                .map(|spec| spec.with_timeout(timeout).poll_every(interval))
                .collect(),
        )
    }
}

fn launch_in_binary_dir(binary: &std::path::Path) -> LaunchSpec {
    let launch = LaunchSpec::new(binary);
    match binary_dir(binary) {
        Some(dir) => launch.current_dir(dir),
        None => launch,
    }
}
