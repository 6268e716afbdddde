//! # Federation Connector
//!
//! Translates a wallet session's abstract operation into the federation's
//! request/response protocol and back. The wire format is JSON-RPC 2.0 with
//! `lumen_`-prefixed methods; the transport is assumed reliable-but-slow.
//!
//! ## Quorum Reconciliation
//!
//! A federation is a set of guardians, any minority of which may be down,
//! lagging, or lying. [`QuorumConnector`] therefore fans every request out
//! to all guardians concurrently, groups the answers by content, and accepts
//! a result only when at least `quorum_threshold` guardians agree on it.
//! Fewer agreeing answers than the threshold is [`ConnectorError::QuorumUnreachable`]
//! — a transient condition the session retries.
//!
//! ## Session Epoch
//!
//! Every request carries the connector's view of the federation epoch.
//! Guardians reject stale epochs with a well-known error code carrying the
//! current epoch; the connector resyncs (adopts the newer epoch) and
//! retransmits once before surfacing [`ConnectorError::StaleEpoch`] to the
//! session.
//!
//! ## Isolation
//!
//! A connector belongs to exactly one wallet. Two wallets pointed at the
//! same federation get two connectors with independent sessions and epochs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::federation::{FederationDescriptor, GuardianEndpoint};
use crate::operation::{OperationId, OperationKind};

// ---------------------------------------------------------------------------
// Wire Error Codes
// ---------------------------------------------------------------------------

/// Guardian rejected the session's credentials.
pub const ERR_AUTH_REJECTED: i32 = -32020;

/// The request carried an out-of-date federation epoch. The error `data`
/// field holds `{"epoch": <current>}`.
pub const ERR_STALE_EPOCH: i32 = -32021;

/// The federation states the wallet lacks the funds for the operation.
pub const ERR_INSUFFICIENT_FUNDS: i32 = -32022;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by a connector to its session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Fewer than `required` guardians produced a matching answer.
    #[error("quorum unreachable: {reachable} guardians reachable, {required} required")]
    QuorumUnreachable { reachable: usize, required: usize },

    /// A guardian quorum rejected the session's credentials.
    #[error("federation rejected session auth: {0}")]
    AuthRejected(String),

    /// The epoch resync itself failed — our view is stale and the
    /// retransmit with the refreshed epoch was rejected again.
    #[error("stale federation epoch: ours {ours}, federation {federation}")]
    StaleEpoch { ours: u64, federation: u64 },

    /// The round timed out end to end.
    #[error("federation round timed out")]
    Timeout,

    /// A guardian quorum rejected the operation itself. `code` is the wire
    /// error code; `detail` is the federation's stated reason, verbatim.
    #[error("operation rejected by federation ({code}): {detail}")]
    Rejected { code: i32, detail: String },
}

impl ConnectorError {
    /// Transient errors are retried by the session up to its attempt
    /// ceiling; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QuorumUnreachable { .. } | Self::Timeout)
    }
}

/// One guardian exchange gone wrong. Swallowed by quorum reconciliation —
/// individual guardian failures only matter in aggregate.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("guardian request timed out")]
    Timeout,

    #[error("guardian unreachable: {0}")]
    Unreachable(String),

    #[error("malformed guardian response: {0}")]
    BadResponse(String),
}

// ---------------------------------------------------------------------------
// Wire Types (JSON-RPC 2.0)
// ---------------------------------------------------------------------------

/// JSON-RPC methods of the guardian API consumed by this runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMethod {
    /// Spend notes. Params: `{epoch, operation_id, amount_msat, recipient}`.
    #[serde(rename = "lumen_submitSend")]
    SubmitSend,
    /// Redeem notes. Params: `{epoch, operation_id, amount_msat}`.
    #[serde(rename = "lumen_submitReceive")]
    SubmitReceive,
    /// (Re-)affirm membership. Params: `{epoch, operation_id}`.
    #[serde(rename = "lumen_join")]
    Join,
}

/// A JSON-RPC 2.0 request as sent to every guardian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always "2.0".
    pub jsonrpc: String,
    /// Request identifier, echoed back. We use `<operation-id>/<seq>` so
    /// retransmits are distinguishable in guardian logs.
    pub id: String,
    /// The method to invoke.
    pub method: RpcMethod,
    /// Method-specific parameters.
    pub params: serde_json::Value,
}

/// A JSON-RPC 2.0 response from one guardian. Exactly one of `result` /
/// `error` is set by a conforming guardian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Session-Facing Types
// ---------------------------------------------------------------------------

/// An abstract operation handed down by the session.
#[derive(Debug, Clone)]
pub struct FederationRequest {
    pub operation_id: OperationId,
    pub kind: OperationKind,
}

/// A quorum-agreed federation answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationResponse {
    /// The federation epoch the result was finalized in.
    pub epoch: u64,
    /// The agreed result payload, opaque to the connector.
    pub result: serde_json::Value,
}

/// Connector health, derived from the most recent fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorHealth {
    /// Every guardian answered the last round.
    Healthy,
    /// A quorum answered, but some guardians did not.
    Degraded { reachable: usize, total: usize },
    /// Fewer than a quorum answered the last round.
    Down,
}

/// The seam between a wallet session and the federation.
///
/// Sessions only ever see this trait; production wires in a
/// [`QuorumConnector`], tests wire in scripted fakes.
#[async_trait]
pub trait FederationConnector: Send + Sync {
    /// Dispatch one operation and await the quorum-agreed answer. May
    /// suspend for a full federation round.
    async fn send(&self, request: FederationRequest) -> Result<FederationResponse, ConnectorError>;

    /// Health as of the last completed fan-out.
    fn health(&self) -> ConnectorHealth;
}

/// Builds one connector per wallet. The registry owns a factory so tests
/// can substitute scripted connectors without touching lifecycle logic.
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, descriptor: &FederationDescriptor) -> Arc<dyn FederationConnector>;
}

// ---------------------------------------------------------------------------
// GuardianTransport
// ---------------------------------------------------------------------------

/// One request/response exchange with a single guardian. Everything above
/// this seam (quorum counting, epochs, retries) is transport-agnostic.
#[async_trait]
pub trait GuardianTransport: Send + Sync {
    async fn exchange(
        &self,
        endpoint: &GuardianEndpoint,
        request: &RpcRequest,
    ) -> Result<RpcResponse, TransportError>;
}

/// HTTP transport: POSTs the JSON-RPC body to the guardian's endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a per-request timeout.
    pub fn new(request_timeout: Duration) -> Self {
        // Only a timeout is configured; the build can fail only if the TLS
        // backend cannot initialize, and the default constructor would
        // panic on exactly that too.
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("HTTP client with static configuration builds");
        Self { client }
    }
}

#[async_trait]
impl GuardianTransport for HttpTransport {
    async fn exchange(
        &self,
        endpoint: &GuardianEndpoint,
        request: &RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        let response = self
            .client
            .post(endpoint.url())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Unreachable(e.to_string())
                }
            })?;

        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| TransportError::BadResponse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// QuorumConnector
// ---------------------------------------------------------------------------

/// The production connector: fan-out, response reconciliation, epoch
/// tracking. Generic over the transport seam only through the trait object,
/// which keeps the registry's factory signature simple.
pub struct QuorumConnector {
    descriptor: FederationDescriptor,
    transport: Arc<dyn GuardianTransport>,
    /// Our view of the federation epoch, refreshed from responses.
    epoch: AtomicU64,
    /// Reachable-guardian count from the last fan-out; usize::MAX until the
    /// first round completes.
    last_reachable: AtomicUsize,
    /// Monotonic per-connector sequence for wire request ids.
    seq: AtomicU64,
}

impl QuorumConnector {
    pub fn new(descriptor: FederationDescriptor, transport: Arc<dyn GuardianTransport>) -> Self {
        Self {
            descriptor,
            transport,
            epoch: AtomicU64::new(0),
            last_reachable: AtomicUsize::new(usize::MAX),
            seq: AtomicU64::new(0),
        }
    }

    /// Current epoch view. Exposed for tests and diagnostics.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn build_request(&self, request: &FederationRequest) -> RpcRequest {
        let epoch = self.epoch();
        let (method, params) = match &request.kind {
            OperationKind::Send {
                amount_msat,
                recipient,
            } => (
                RpcMethod::SubmitSend,
                serde_json::json!({
                    "epoch": epoch,
                    "operation_id": request.operation_id.to_string(),
                    "amount_msat": amount_msat,
                    "recipient": recipient,
                }),
            ),
            OperationKind::Receive { amount_msat } => (
                RpcMethod::SubmitReceive,
                serde_json::json!({
                    "epoch": epoch,
                    "operation_id": request.operation_id.to_string(),
                    "amount_msat": amount_msat,
                }),
            ),
            OperationKind::Join => (
                RpcMethod::Join,
                serde_json::json!({
                    "epoch": epoch,
                    "operation_id": request.operation_id.to_string(),
                }),
            ),
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id: format!("{}/{}", request.operation_id, seq),
            method,
            params,
        }
    }

    /// One fan-out to all guardians. Returns the per-guardian outcomes and
    /// records reachability for `health()`.
    async fn fan_out(&self, wire: &RpcRequest) -> Vec<Result<RpcResponse, TransportError>> {
        let exchanges = self
            .descriptor
            .guardians
            .iter()
            .map(|endpoint| self.transport.exchange(endpoint, wire));
        let outcomes = futures::future::join_all(exchanges).await;

        let reachable = outcomes.iter().filter(|o| o.is_ok()).count();
        self.last_reachable.store(reachable, Ordering::Release);
        outcomes
    }

    /// Reconcile one fan-out's outcomes into a single verdict.
    fn reconcile(
        &self,
        outcomes: Vec<Result<RpcResponse, TransportError>>,
    ) -> Result<FederationResponse, Verdict> {
        let required = self.descriptor.quorum_threshold;
        let reachable = outcomes.iter().filter(|o| o.is_ok()).count();

        // Group successful results by canonical JSON content.
        let mut result_groups: HashMap<String, (usize, serde_json::Value)> = HashMap::new();
        // Group application errors by code.
        let mut error_groups: HashMap<i32, (usize, RpcError)> = HashMap::new();

        for outcome in outcomes.into_iter().flatten() {
            if let Some(result) = outcome.result {
                let key = result.to_string();
                result_groups
                    .entry(key)
                    .and_modify(|(n, _)| *n += 1)
                    .or_insert((1, result));
            } else if let Some(error) = outcome.error {
                error_groups
                    .entry(error.code)
                    .and_modify(|(n, _)| *n += 1)
                    .or_insert((1, error));
            }
        }

        // A quorum of matching results wins outright.
        if let Some((_, result)) = result_groups
            .into_values()
            .find(|(count, _)| *count >= required)
        {
            let epoch = result
                .get("epoch")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| self.epoch());
            // Never regress the epoch: a lagging guardian's view must not
            // roll ours back.
            self.epoch.fetch_max(epoch, Ordering::AcqRel);
            return Ok(FederationResponse { epoch, result });
        }

        // A quorum of matching rejections is an authoritative answer too.
        if let Some((_, error)) = error_groups
            .into_values()
            .find(|(count, _)| *count >= required)
        {
            return Err(match error.code {
                ERR_STALE_EPOCH => {
                    let federation_epoch = error
                        .data
                        .as_ref()
                        .and_then(|d| d.get("epoch"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or_else(|| self.epoch() + 1);
                    Verdict::StaleEpoch(federation_epoch)
                }
                ERR_AUTH_REJECTED => Verdict::Error(ConnectorError::AuthRejected(error.message)),
                code => Verdict::Error(ConnectorError::Rejected {
                    code,
                    detail: error.message,
                }),
            });
        }

        Err(Verdict::Error(ConnectorError::QuorumUnreachable {
            reachable,
            required,
        }))
    }
}

/// Internal reconciliation verdict: either a final error or a stale-epoch
/// signal that the send loop may still recover from.
enum Verdict {
    StaleEpoch(u64),
    Error(ConnectorError),
}

#[async_trait]
impl FederationConnector for QuorumConnector {
    async fn send(&self, request: FederationRequest) -> Result<FederationResponse, ConnectorError> {
        // At most one resync retransmit: first pass with our epoch, second
        // pass with the epoch the federation told us about.
        for resync in 0..2 {
            let wire = self.build_request(&request);
            debug!(
                federation = self.descriptor.id.short(),
                operation = %request.operation_id,
                method = ?wire.method,
                epoch = self.epoch(),
                resync,
                "dispatching federation round"
            );

            let outcomes = self.fan_out(&wire).await;
            match self.reconcile(outcomes) {
                Ok(response) => return Ok(response),
                Err(Verdict::StaleEpoch(federation_epoch)) => {
                    let ours = self.epoch();
                    if resync == 1 {
                        return Err(ConnectorError::StaleEpoch {
                            ours,
                            federation: federation_epoch,
                        });
                    }
                    warn!(
                        federation = self.descriptor.id.short(),
                        ours,
                        federation_epoch,
                        "stale epoch, resyncing and retransmitting"
                    );
                    self.epoch.fetch_max(federation_epoch, Ordering::AcqRel);
                }
                Err(Verdict::Error(e)) => return Err(e),
            }
        }
        unreachable!("resync loop returns within two passes")
    }

    fn health(&self) -> ConnectorHealth {
        let reachable = self.last_reachable.load(Ordering::Acquire);
        let total = self.descriptor.guardians.len();
        if reachable == usize::MAX || reachable == total {
            // No round yet, or a fully clean one.
            ConnectorHealth::Healthy
        } else if reachable >= self.descriptor.quorum_threshold {
            ConnectorHealth::Degraded { reachable, total }
        } else {
            ConnectorHealth::Down
        }
    }
}

// ---------------------------------------------------------------------------
// HttpConnectorFactory
// ---------------------------------------------------------------------------

/// Default factory: HTTP transport, one fresh connector per wallet.
pub struct HttpConnectorFactory {
    request_timeout: Duration,
}

impl HttpConnectorFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ConnectorFactory for HttpConnectorFactory {
    fn build(&self, descriptor: &FederationDescriptor) -> Arc<dyn FederationConnector> {
        // A dedicated transport per wallet keeps connection pools (and thus
        // guardian-visible sessions) unshared across wallets.
        let transport = Arc::new(HttpTransport::new(self.request_timeout));
        Arc::new(QuorumConnector::new(descriptor.clone(), transport))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
