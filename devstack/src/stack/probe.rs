//! Role-specific readiness probes.
//!
//! A probe answers one question ("is this role ready?") with a three-way
//! `Readiness`: connection failures while a process boots are `NotReady`,
//! unexpected answers are `Fatal` and abort the start at once.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::process::{ProcessRole, SignalBoard};
use crate::waiter::Readiness;

/// What a probe may look at besides the network.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub role: ProcessRole,
    /// Signals captured from the role's output; `None` when the process is
    /// not supervised by this stack (attach mode)
    pub signals: Option<SignalBoard>,
}

impl ProbeContext {
    pub fn new(role: ProcessRole, signals: Option<SignalBoard>) -> Self {
        Self { role, signals }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Short description used in wait labels and logs.
    fn describe(&self) -> String;

    async fn check(&self, ctx: &ProbeContext) -> Readiness<()>;
}

/// Ready as soon as the process is alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessProbe;

#[async_trait]
impl ReadinessProbe for LivenessProbe {
    fn describe(&self) -> String {
        "process alive".to_string()
    }

    async fn check(&self, _ctx: &ProbeContext) -> Readiness<()> {
        Readiness::Ready(())
    }
}

// ============================================================================
// Node
// ============================================================================

/// Node RPC accepts a basic query (`system_health`).
pub struct NodeRpcProbe {
    client: Client,
    url: String,
}

impl NodeRpcProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for NodeRpcProbe {
    fn describe(&self) -> String {
        format!("node RPC at {}", self.url)
    }

    async fn check(&self, _ctx: &ProbeContext) -> Readiness<()> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "system_health",
            "params": []
        });

        let response = match self.client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("Node RPC not reachable yet: {}", e);
                }
                return Readiness::NotReady;
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Readiness::Fatal(format!("Node RPC returned HTTP {}", status));
        }

        match response.json::<Value>().await {
            Ok(body) => match body.get("error") {
                Some(error) => Readiness::Fatal(format!("Node RPC error: {}", error)),
                None => Readiness::from_bool(body.get("result").is_some()),
            },
            // Body cut short while the node is still booting
            Err(_) => Readiness::NotReady,
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Keys announced by an initialized worker, `0x`-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub public_key: String,
    pub ecdh_public_key: String,
}

#[derive(Deserialize)]
struct InfoEnvelope {
    payload: String,
}

#[derive(Deserialize)]
struct InfoPayload {
    #[serde(default)]
    initialized: bool,
    public_key: Option<String>,
    ecdh_public_key: Option<String>,
}

fn hex_prefixed(key: &str) -> String {
    if key.starts_with("0x") {
        key.to_string()
    } else {
        format!("0x{}", key)
    }
}

/// Worker reports `initialized: true` from `GET /get_info`.
pub struct WorkerInfoProbe {
    client: Client,
    base_url: String,
}

impl WorkerInfoProbe {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the worker keys.
    ///
    /// Any HTTP status other than 200 is fatal: the worker is up but refuses
    /// to answer, waiting longer will not help.
    pub async fn fetch(&self) -> Readiness<WorkerInfo> {
        let url = format!("{}/get_info", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("Worker not reachable yet: {}", e);
                }
                return Readiness::NotReady;
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Readiness::Fatal(format!("Unable to get worker info: HTTP {}", status));
        }

        let envelope: InfoEnvelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(e) => return Readiness::Fatal(format!("Malformed worker info: {}", e)),
        };
        let payload: InfoPayload = match serde_json::from_str(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => return Readiness::Fatal(format!("Malformed worker info payload: {}", e)),
        };

        if !payload.initialized {
            return Readiness::NotReady;
        }
        match (payload.public_key, payload.ecdh_public_key) {
            (Some(public_key), Some(ecdh_public_key)) => Readiness::Ready(WorkerInfo {
                public_key: hex_prefixed(&public_key),
                ecdh_public_key: hex_prefixed(&ecdh_public_key),
            }),
            _ => Readiness::Fatal("Initialized worker did not report its keys".to_string()),
        }
    }
}

#[async_trait]
impl ReadinessProbe for WorkerInfoProbe {
    fn describe(&self) -> String {
        format!("worker info at {}", self.base_url)
    }

    async fn check(&self, _ctx: &ProbeContext) -> Readiness<()> {
        self.fetch().await.map(|_| ())
    }
}

// ============================================================================
// Output signals
// ============================================================================

/// Ready once every named signal has been captured from the role's output.
#[derive(Debug, Clone)]
pub struct OutputSignalProbe {
    signals: Vec<String>,
}

impl OutputSignalProbe {
    pub fn new<I, S>(signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signals: signals.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for OutputSignalProbe {
    fn describe(&self) -> String {
        format!("output signals [{}]", self.signals.join(", "))
    }

    async fn check(&self, ctx: &ProbeContext) -> Readiness<()> {
        match &ctx.signals {
            Some(board) => Readiness::from_bool(self.signals.iter().all(|s| board.contains(s))),
            // Output of an attached process is not visible
            None => Readiness::Ready(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `status` + `body` to every connection.
    async fn serve(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn info_body(initialized: bool) -> String {
        let payload = json!({
            "initialized": initialized,
            "public_key": "aa11",
            "ecdh_public_key": "0xbb22",
        });
        json!({ "status": "ok", "payload": payload.to_string() }).to_string()
    }

    fn ctx(role: ProcessRole) -> ProbeContext {
        ProbeContext::new(role, None)
    }

    #[tokio::test]
    async fn test_worker_info_ready() {
        let url = serve("200 OK", info_body(true)).await;
        let probe = WorkerInfoProbe::new(url);
        assert_eq!(
            probe.fetch().await,
            Readiness::Ready(WorkerInfo {
                public_key: "0xaa11".to_string(),
                ecdh_public_key: "0xbb22".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_worker_not_initialized() {
        let url = serve("200 OK", info_body(false)).await;
        let probe = WorkerInfoProbe::new(url);
        assert_eq!(probe.check(&ctx(ProcessRole::Worker)).await, Readiness::NotReady);
    }

    #[tokio::test]
    async fn test_worker_http_500_is_fatal() {
        let url = serve("500 Internal Server Error", "{}".to_string()).await;
        let probe = WorkerInfoProbe::new(url);
        match probe.check(&ctx(ProcessRole::Worker)).await {
            Readiness::Fatal(reason) => assert!(reason.contains("Unable to get worker info")),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_is_not_ready() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let worker = WorkerInfoProbe::new(format!("http://{}", addr));
        assert_eq!(worker.check(&ctx(ProcessRole::Worker)).await, Readiness::NotReady);
        let node = NodeRpcProbe::new(format!("http://{}", addr));
        assert_eq!(node.check(&ctx(ProcessRole::Node)).await, Readiness::NotReady);
    }

    #[tokio::test]
    async fn test_node_rpc_health() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": {"peers": 0, "isSyncing": false}});
        let url = serve("200 OK", body.to_string()).await;
        let probe = NodeRpcProbe::new(url);
        assert_eq!(probe.check(&ctx(ProcessRole::Node)).await, Readiness::Ready(()));
    }

    #[tokio::test]
    async fn test_node_rpc_error_status_is_fatal() {
        let url = serve("503 Service Unavailable", "{}".to_string()).await;
        let probe = NodeRpcProbe::new(url);
        assert!(probe.check(&ctx(ProcessRole::Node)).await.is_fatal());
    }

    #[tokio::test]
    async fn test_output_signal_probe() {
        let board = SignalBoard::new();
        let probe = OutputSignalProbe::new(["a", "b"]);
        let ctx = ProbeContext::new(ProcessRole::Relay, Some(board.clone()));

        assert_eq!(probe.check(&ctx).await, Readiness::NotReady);
        board.insert_once("a", "line a".to_string());
        assert_eq!(probe.check(&ctx).await, Readiness::NotReady);
        board.insert_once("b", "line b".to_string());
        assert_eq!(probe.check(&ctx).await, Readiness::Ready(()));

        // Attached processes cannot be observed
        let attached = ProbeContext::new(ProcessRole::Relay, None);
        assert_eq!(probe.check(&attached).await, Readiness::Ready(()));
    }
}
