// File: devstack/tests/setup_flow_test.rs
//
// Stack Setup Integration Tests
//
// Runs the default environment setup against the in-memory chain with a
// runtime that emulates the registry and cluster pallets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use devstack::chain::{Dispatch, InMemoryChain, RuntimeEvent, RuntimeState, SignedCall, StorageKey};
use devstack::error::{SetupError, WaitError};
use devstack::events::EventBus;
use devstack::setup::{
    SetupOptions, StackSetup, StepOutcome, WorkerInfoSource, DEFAULT_CLUSTER_ID,
};
use devstack::stack::WorkerInfo;
use devstack::tx::TransactionCoordinator;
use devstack::waiter::Readiness;

const PUBLIC_KEY: &str = "0x0101";
const ECDH_PUBLIC_KEY: &str = "0x0202";

/// Worker that needs a few polls before it reports initialized.
struct BootingWorker {
    polls_before_ready: usize,
    polls: AtomicUsize,
}

impl BootingWorker {
    fn new(polls_before_ready: usize) -> Self {
        Self {
            polls_before_ready,
            polls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WorkerInfoSource for BootingWorker {
    async fn worker_info(&self) -> Readiness<WorkerInfo> {
        if self.polls.fetch_add(1, Ordering::SeqCst) < self.polls_before_ready {
            return Readiness::NotReady;
        }
        Readiness::Ready(WorkerInfo {
            public_key: PUBLIC_KEY.to_string(),
            ecdh_public_key: ECDH_PUBLIC_KEY.to_string(),
        })
    }
}

struct BrokenWorker;

#[async_trait]
impl WorkerInfoSource for BrokenWorker {
    async fn worker_info(&self) -> Readiness<WorkerInfo> {
        Readiness::Fatal("Unable to get worker info: HTTP 500".to_string())
    }
}

fn key(section: &str, item: &str) -> StorageKey {
    StorageKey::new(section, item)
}

/// Registry and cluster runtime. `master_key` controls whether registering a
/// gatekeeper yields a master key.
fn runtime(master_key: bool) -> impl Fn(&SignedCall, &mut RuntimeState) -> Dispatch + Send + Sync {
    move |tx: &SignedCall, runtime: &mut RuntimeState| {
        let call = tx.call.dispatched();
        let arg = |i: usize| call.args.get(i).cloned().unwrap_or(Value::Null);
        let arg_str = |i: usize| arg(i).as_str().unwrap_or_default().to_string();

        if call.is("phalaRegistry", "forceRegisterWorker") {
            runtime.insert(
                key("phalaRegistry", "workers").with_key(arg_str(1)),
                json!({ "pubkey": arg(0) }),
            );
            Dispatch::Ok(vec![RuntimeEvent::new("phalaRegistry", "WorkerAdded").field(arg(0))])
        } else if call.is("phalaRegistry", "registerGatekeeper") {
            let gk = key("phalaRegistry", "gatekeeper");
            let mut keys = runtime
                .get(&gk)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            keys.push(arg(0));
            runtime.insert(gk, Value::Array(keys));
            if master_key {
                runtime.insert(key("phalaRegistry", "gatekeeperMasterPubkey"), json!("0xmaster"));
            }
            Dispatch::Ok(Vec::new())
        } else if call.is("phalaFatContracts", "addCluster") {
            let counter = key("phalaFatContracts", "clusterCounter");
            let id = runtime.get(&counter).and_then(Value::as_u64).unwrap_or(0);
            let cluster_id = format!("0x{:064x}", id);
            runtime.insert(counter, json!(id + 1));
            runtime.insert(
                key("phalaFatContracts", "clusters").with_key(cluster_id.clone()),
                json!({ "owner": arg(0), "workers": arg(2) }),
            );
            runtime.insert(
                key("phalaRegistry", "clusterKeys").with_key(cluster_id.clone()),
                json!("0xclusterkey"),
            );
            Dispatch::Ok(vec![
                RuntimeEvent::new("phalaFatContracts", "ClusterCreated").field(cluster_id)
            ])
        } else {
            Dispatch::Failed(format!("unsupported call {}", call.label()))
        }
    }
}

async fn start_chain(
    chain: InMemoryChain,
) -> (Arc<InMemoryChain>, Arc<EventBus>, Arc<TransactionCoordinator>) {
    let chain = Arc::new(chain);
    let events = Arc::new(EventBus::new());
    events.init(chain.clone()).await.unwrap();
    chain.spawn_block_production(Duration::from_millis(200));
    let coordinator = Arc::new(TransactionCoordinator::new(chain.clone(), events.clone()));
    (chain, events, coordinator)
}

// ============================================================================
// TEST 1: Fresh chain
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_on_fresh_chain() {
    let (chain, events, coordinator) = start_chain(InMemoryChain::new().with_dispatcher(runtime(true))).await;

    let setup = StackSetup::new(
        chain.clone(),
        coordinator,
        Arc::new(BootingWorker::new(3)),
        SetupOptions::default(),
    );
    let report = setup.run().await.unwrap();

    assert_eq!(report.worker.public_key, PUBLIC_KEY);
    assert_eq!(report.cluster_id, DEFAULT_CLUSTER_ID);
    let steps: Vec<_> = report.steps.iter().map(|(name, _)| *name).collect();
    assert_eq!(
        steps,
        vec![
            "pRuntime initialization",
            "Worker registration",
            "Gatekeeper registration",
            "GK master key generation",
            "Cluster creation",
            "Cluster ready",
        ]
    );
    assert!(report
        .steps
        .iter()
        .all(|(_, outcome)| *outcome == StepOutcome::Completed));

    // Three sudo calls from the same account, in order
    let log = chain.submission_log();
    let labels: Vec<_> = log.iter().map(|tx| tx.call.label()).collect();
    assert_eq!(
        labels,
        vec![
            "sudo(phalaRegistry.forceRegisterWorker)",
            "sudo(phalaRegistry.registerGatekeeper)",
            "sudo(phalaFatContracts.addCluster)",
        ]
    );
    assert_eq!(log.iter().map(|tx| tx.nonce).collect::<Vec<_>>(), vec![0, 1, 2]);
    events.destroy();
}

// ============================================================================
// TEST 2: Re-running against a prepared chain
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_setup_is_idempotent() {
    let (chain, events, coordinator) = start_chain(InMemoryChain::new().with_dispatcher(runtime(true))).await;
    let worker = Arc::new(BootingWorker::new(0));

    StackSetup::new(chain.clone(), coordinator.clone(), worker.clone(), SetupOptions::default())
        .run()
        .await
        .unwrap();
    let submitted = chain.submission_log().len();

    let report = StackSetup::new(chain.clone(), coordinator, worker, SetupOptions::default())
        .run()
        .await
        .unwrap();
    assert_eq!(chain.submission_log().len(), submitted);
    assert_eq!(report.outcome("Worker registration"), Some(StepOutcome::Skipped));
    assert_eq!(report.outcome("Gatekeeper registration"), Some(StepOutcome::Skipped));
    assert_eq!(report.outcome("Cluster creation"), Some(StepOutcome::Skipped));
    assert_eq!(report.outcome("Cluster ready"), Some(StepOutcome::Completed));
    assert_eq!(report.cluster_id, DEFAULT_CLUSTER_ID);
    events.destroy();
}

// ============================================================================
// TEST 3: Configured cluster
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_configured_cluster_is_not_created() {
    let cluster_id = "0x00000000000000000000000000000000000000000000000000000000000000aa";
    let chain = InMemoryChain::new().with_dispatcher(runtime(true));
    chain.set_storage(
        key("phalaFatContracts", "clusters").with_key(cluster_id),
        json!({ "owner": "alice" }),
    );
    chain.set_storage(
        key("phalaRegistry", "clusterKeys").with_key(cluster_id),
        json!("0xkey"),
    );
    let (chain, events, coordinator) = start_chain(chain).await;

    let report = StackSetup::new(
        chain.clone(),
        coordinator,
        Arc::new(BootingWorker::new(0)),
        SetupOptions {
            cluster_id: Some(cluster_id.to_string()),
            ..SetupOptions::default()
        },
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.cluster_id, cluster_id);
    assert_eq!(report.outcome("Cluster creation"), Some(StepOutcome::Skipped));
    assert!(chain
        .submission_log()
        .iter()
        .all(|tx| !tx.call.dispatched().is("phalaFatContracts", "addCluster")));
    events.destroy();
}

// ============================================================================
// TEST 4: Failures carry the step label
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_master_key_times_out_with_step_label() {
    let (chain, events, coordinator) = start_chain(InMemoryChain::new().with_dispatcher(runtime(false))).await;

    let err = StackSetup::new(
        chain,
        coordinator,
        Arc::new(BootingWorker::new(0)),
        SetupOptions {
            step_timeout: Duration::from_secs(5),
            ..SetupOptions::default()
        },
    )
    .run()
    .await
    .unwrap_err();

    match err {
        SetupError::Wait { step, source } => {
            assert_eq!(step, "GK master key generation");
            assert!(source.is_timeout());
        }
        other => panic!("unexpected error: {}", other),
    }
    events.destroy();
}

#[tokio::test(start_paused = true)]
async fn test_worker_info_error_aborts_setup() {
    let (chain, events, coordinator) = start_chain(InMemoryChain::new().with_dispatcher(runtime(true))).await;

    let err = StackSetup::new(chain.clone(), coordinator, Arc::new(BrokenWorker), SetupOptions::default())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SetupError::Wait {
            source: WaitError::Fatal { .. },
            ..
        }
    ));
    assert!(chain.submission_log().is_empty());
    events.destroy();
}
