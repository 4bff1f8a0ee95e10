// File: devstack/src/setup.rs
//
// Default environment setup run once the stack is live: register the worker
// and the gatekeeper, wait for the gatekeeper master key, create the main
// cluster and wait for it to be ready. Every step is idempotent against a
// chain prepared by a previous run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chain::{Call, ChainConnection, SignerId, StorageKey};
use crate::error::{SetupError, TxError};
use crate::events::EventMatcher;
use crate::stack::{WorkerInfo, WorkerInfoProbe};
use crate::tx::{TransactionCoordinator, TxOutcome, TxRequest};
use crate::waiter::{wait_for, Readiness, ShutdownListener, WaitSpec, DEFAULT_POLL_INTERVAL};

/// Id of the cluster created on a fresh dev chain.
pub const DEFAULT_CLUSTER_ID: &str =
    "0x0000000000000000000000000000000000000000000000000000000000000000";

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(20);

const STEP_WORKER_INFO: &str = "pRuntime initialization";
const STEP_WORKER_REGISTRATION: &str = "Worker registration";
const STEP_GATEKEEPER_REGISTRATION: &str = "Gatekeeper registration";
const STEP_MASTER_KEY: &str = "GK master key generation";
const STEP_CLUSTER_CREATION: &str = "Cluster creation";
const STEP_CLUSTER_READY: &str = "Cluster ready";

/// Where the worker keys come from.
#[async_trait]
pub trait WorkerInfoSource: Send + Sync {
    async fn worker_info(&self) -> Readiness<WorkerInfo>;
}

#[async_trait]
impl WorkerInfoSource for WorkerInfoProbe {
    async fn worker_info(&self) -> Readiness<WorkerInfo> {
        self.fetch().await
    }
}

#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Account allowed to dispatch `sudo` calls
    pub sudo: SignerId,
    /// Owner address of a newly created cluster
    pub cluster_owner: String,
    /// Use this cluster instead of detecting or creating one
    pub cluster_id: Option<String>,
    pub step_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            sudo: SignerId::from("//Alice"),
            cluster_owner: "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY".to_string(),
            cluster_id: None,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// State was already in place
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SetupReport {
    pub worker: WorkerInfo,
    pub cluster_id: String,
    pub steps: Vec<(&'static str, StepOutcome)>,
}

impl SetupReport {
    pub fn outcome(&self, step: &str) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, outcome)| *outcome)
    }
}

fn workers_key(ecdh_public_key: &str) -> StorageKey {
    StorageKey::new("phalaRegistry", "workers").with_key(ecdh_public_key)
}

fn gatekeeper_key() -> StorageKey {
    StorageKey::new("phalaRegistry", "gatekeeper")
}

fn master_key() -> StorageKey {
    StorageKey::new("phalaRegistry", "gatekeeperMasterPubkey")
}

fn cluster_counter_key() -> StorageKey {
    StorageKey::new("phalaFatContracts", "clusterCounter")
}

fn cluster_key(cluster_id: &str) -> StorageKey {
    StorageKey::new("phalaFatContracts", "clusters").with_key(cluster_id)
}

fn cluster_keys_key(cluster_id: &str) -> StorageKey {
    StorageKey::new("phalaRegistry", "clusterKeys").with_key(cluster_id)
}

/// Empty storage entries may come back as `null`.
fn present(value: &Option<Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

pub struct StackSetup {
    connection: Arc<dyn ChainConnection>,
    coordinator: Arc<TransactionCoordinator>,
    worker: Arc<dyn WorkerInfoSource>,
    options: SetupOptions,
    shutdown: Option<ShutdownListener>,
}

impl StackSetup {
    pub fn new(
        connection: Arc<dyn ChainConnection>,
        coordinator: Arc<TransactionCoordinator>,
        worker: Arc<dyn WorkerInfoSource>,
        options: SetupOptions,
    ) -> Self {
        Self {
            connection,
            coordinator,
            worker,
            options,
            shutdown: None,
        }
    }

    /// Abort pending waits when the stack shuts down.
    pub fn interruptible(mut self, listener: ShutdownListener) -> Self {
        self.shutdown = Some(listener);
        self
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// - `SetupError::Wait` when a step's wait times out or fails
    /// - `SetupError::Transaction` when a setup transaction fails
    /// - `SetupError::Chain` when a storage query fails
    pub async fn run(&self) -> Result<SetupReport, SetupError> {
        let mut steps = Vec::with_capacity(6);

        let worker = self.fetch_worker_info().await?;
        steps.push((STEP_WORKER_INFO, StepOutcome::Completed));

        steps.push((STEP_WORKER_REGISTRATION, self.register_worker(&worker).await?));
        steps.push((
            STEP_GATEKEEPER_REGISTRATION,
            self.register_gatekeeper(&worker).await?,
        ));

        self.wait_storage(STEP_MASTER_KEY, master_key()).await?;
        steps.push((STEP_MASTER_KEY, StepOutcome::Completed));

        let (cluster_id, outcome) = self.prepare_cluster(&worker).await?;
        steps.push((STEP_CLUSTER_CREATION, outcome));

        self.wait_cluster_ready(&cluster_id).await?;
        steps.push((STEP_CLUSTER_READY, StepOutcome::Completed));

        log::info!("Stack setup done, main cluster {}", cluster_id);
        Ok(SetupReport {
            worker,
            cluster_id,
            steps,
        })
    }

    fn wait_spec(&self, step: &str) -> WaitSpec {
        let spec = WaitSpec::new(step, self.options.step_timeout)
            .poll_every(self.options.poll_interval);
        match &self.shutdown {
            Some(listener) => spec.interruptible(listener.clone()),
            None => spec,
        }
    }

    async fn fetch_worker_info(&self) -> Result<WorkerInfo, SetupError> {
        wait_for(self.wait_spec(STEP_WORKER_INFO), || self.worker.worker_info())
            .await
            .map_err(|source| SetupError::Wait {
                step: STEP_WORKER_INFO.to_string(),
                source,
            })
    }

    async fn query(&self, step: &str, key: &StorageKey) -> Result<Option<Value>, SetupError> {
        self.connection
            .query_storage(key)
            .await
            .map_err(|e| SetupError::Chain {
                step: step.to_string(),
                reason: format!("query {} failed: {:#}", key, e),
            })
    }

    async fn wait_storage(&self, step: &str, key: StorageKey) -> Result<Value, SetupError> {
        let key = &key;
        wait_for(self.wait_spec(step), || async move {
            match self.connection.query_storage(key).await {
                Ok(Some(value)) if !value.is_null() => Readiness::Ready(value),
                Ok(_) => Readiness::NotReady,
                Err(e) => Readiness::Fatal(format!("query {} failed: {:#}", key, e)),
            }
        })
        .await
        .map_err(|source| SetupError::Wait {
            step: step.to_string(),
            source,
        })
    }

    async fn sudo(&self, call: Call, expect: Option<EventMatcher>) -> Result<TxOutcome, TxError> {
        let mut request = TxRequest::new(Call::sudo(call));
        if let Some(matcher) = expect {
            request = request.expect(matcher);
        }
        self.coordinator
            .submit_and_wait(&self.options.sudo, request)
            .await
    }

    async fn register_worker(&self, worker: &WorkerInfo) -> Result<StepOutcome, SetupError> {
        let key = workers_key(&worker.ecdh_public_key);
        if present(&self.query(STEP_WORKER_REGISTRATION, &key).await?) {
            return Ok(StepOutcome::Skipped);
        }

        self.sudo(
            Call::new("phalaRegistry", "forceRegisterWorker")
                .arg(worker.public_key.clone())
                .arg(worker.ecdh_public_key.clone())
                .arg(Value::Null),
            None,
        )
        .await?;
        self.wait_storage(STEP_WORKER_REGISTRATION, key).await?;
        Ok(StepOutcome::Completed)
    }

    async fn register_gatekeeper(&self, worker: &WorkerInfo) -> Result<StepOutcome, SetupError> {
        let gatekeepers = self
            .query(STEP_GATEKEEPER_REGISTRATION, &gatekeeper_key())
            .await?;
        let registered = gatekeepers
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|keys| keys.iter().any(|k| k.as_str() == Some(worker.public_key.as_str())));
        if registered {
            return Ok(StepOutcome::Skipped);
        }

        self.sudo(
            Call::new("phalaRegistry", "registerGatekeeper").arg(worker.public_key.clone()),
            None,
        )
        .await?;
        Ok(StepOutcome::Completed)
    }

    async fn prepare_cluster(&self, worker: &WorkerInfo) -> Result<(String, StepOutcome), SetupError> {
        if let Some(cluster_id) = &self.options.cluster_id {
            return Ok((cluster_id.clone(), StepOutcome::Skipped));
        }

        let counter = self
            .query(STEP_CLUSTER_CREATION, &cluster_counter_key())
            .await?
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        if counter > 0 {
            return Ok((DEFAULT_CLUSTER_ID.to_string(), StepOutcome::Skipped));
        }

        log::info!("Creating cluster");
        let outcome = self
            .sudo(
                Call::new("phalaFatContracts", "addCluster")
                    .arg(self.options.cluster_owner.clone())
                    .arg(json!({ "Public": null }))
                    .arg(json!([worker.public_key])),
                Some(EventMatcher::new("phalaFatContracts", "ClusterCreated")),
            )
            .await?;

        let cluster_id = outcome
            .matched
            .as_ref()
            .and_then(|event| event.field(0))
            .map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string()))
            .ok_or_else(|| SetupError::InvalidState {
                step: STEP_CLUSTER_CREATION.to_string(),
                reason: "ClusterCreated event carries no cluster id".to_string(),
            })?;
        log::info!("Cluster created: {}", cluster_id);
        Ok((cluster_id, StepOutcome::Completed))
    }

    async fn wait_cluster_ready(&self, cluster_id: &str) -> Result<(), SetupError> {
        let cluster = cluster_key(cluster_id);
        let cluster_keys = cluster_keys_key(cluster_id);
        let (cluster, cluster_keys) = (&cluster, &cluster_keys);

        wait_for(self.wait_spec(STEP_CLUSTER_READY), || async move {
            let exists = match self.connection.query_storage(cluster).await {
                Ok(value) => present(&value),
                Err(e) => return Readiness::Fatal(format!("query {} failed: {:#}", cluster, e)),
            };
            if !exists {
                return Readiness::NotReady;
            }
            match self.connection.query_storage(cluster_keys).await {
                Ok(value) => Readiness::from_bool(present(&value)),
                Err(e) => Readiness::Fatal(format!("query {} failed: {:#}", cluster_keys, e)),
            }
        })
        .await
        .map_err(|source| SetupError::Wait {
            step: STEP_CLUSTER_READY.to_string(),
            source,
        })
    }
}
