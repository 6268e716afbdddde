//! # Runtime Facade
//!
//! The single entry point an embedding host links against. Everything
//! crossing this boundary is plain data — handles, ids, status snapshots,
//! and a uniformly tagged [`RuntimeError`] — so binding layers (FFI, IPC,
//! test harnesses) can marshal it without touching runtime internals.
//!
//! The facade adds no behavior of its own: it owns a [`WalletRegistry`],
//! forwards each call, and folds the layered internal errors into the
//! four-way [`ErrorKind`] taxonomy hosts branch on:
//!
//! | Kind               | Host's move                                  |
//! |--------------------|----------------------------------------------|
//! | `Validation`       | Fix the request; retrying verbatim won't help |
//! | `Resource`         | Local environment problem (storage, handles)  |
//! | `TransientNetwork` | Safe to retry later                           |
//! | `Protocol`         | The federation said no; treat as final        |

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::connector::{ConnectorFactory, HttpConnectorFactory};
use crate::federation::FederationDescriptor;
use crate::operation::{FailureReason, OperationId, OperationKind, OperationStatus};
use crate::registry::{RegistryError, WalletHandle, WalletRecord, WalletRegistry};
use crate::session::{BalanceSnapshot, SessionError};
use crate::storage::StoreError;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Coarse classification of a [`RuntimeError`]. See the module docs for what
/// each kind means to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Resource,
    TransientNetwork,
    Protocol,
}

/// The one error type that crosses the facade boundary.
///
/// `code` is a stable machine-readable tag; `message` is human-readable and
/// unstable. Hosts must branch on `kind` and `code`, never on `message`.
#[derive(Debug, Clone, Serialize, Error)]
#[error("[{code}] {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl RuntimeError {
    fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Render a terminal operation failure as an error. For binding layers
    /// that surface a `Failed` poll result through their error channel.
    pub fn from_failure(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::FederationUnresponsive { .. } => {
                Self::new(ErrorKind::TransientNetwork, "federation_unresponsive", reason.to_string())
            }
            FailureReason::InsufficientFunds => {
                Self::new(ErrorKind::Protocol, "insufficient_funds", reason.to_string())
            }
            FailureReason::Rejected { .. } => {
                Self::new(ErrorKind::Protocol, "federation_rejected", reason.to_string())
            }
        }
    }
}

impl From<RegistryError> for RuntimeError {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::Descriptor(_) => {
                Self::new(ErrorKind::Validation, "invalid_descriptor", message)
            }
            RegistryError::Storage(StoreError::Unavailable(_)) => {
                Self::new(ErrorKind::Resource, "storage_unavailable", message)
            }
            RegistryError::Storage(_) => Self::new(ErrorKind::Resource, "storage_error", message),
            RegistryError::DuplicateStorageLocation(_) => {
                Self::new(ErrorKind::Resource, "duplicate_storage_location", message)
            }
            RegistryError::UnknownHandle(_) => {
                Self::new(ErrorKind::Resource, "unknown_handle", message)
            }
            RegistryError::WalletClosing(_) => {
                Self::new(ErrorKind::Resource, "wallet_closing", message)
            }
            RegistryError::CloseTimedOut(_) => {
                Self::new(ErrorKind::Resource, "close_timed_out", message)
            }
            RegistryError::UnknownOperation(_) => {
                Self::new(ErrorKind::Validation, "unknown_operation", message)
            }
            RegistryError::Session(session) => match session {
                SessionError::InvalidOperation(_) => {
                    Self::new(ErrorKind::Validation, "invalid_operation", message)
                }
                SessionError::InsufficientFunds { .. } => {
                    Self::new(ErrorKind::Validation, "insufficient_funds", message)
                }
                SessionError::Store(StoreError::Unavailable(_)) => {
                    Self::new(ErrorKind::Resource, "storage_unavailable", message)
                }
                SessionError::Store(_) => Self::new(ErrorKind::Resource, "storage_error", message),
                SessionError::Draining => {
                    Self::new(ErrorKind::Resource, "wallet_closing", message)
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// The embedding host's view of the whole runtime.
///
/// Construct one per process, clone freely — clones share the registry.
/// Requires a running tokio runtime: operation drivers and deferred drains
/// run as tasks.
#[derive(Clone)]
pub struct Runtime {
    registry: WalletRegistry,
}

impl Runtime {
    /// Production runtime: HTTP connectors built per wallet.
    pub fn new(config: RuntimeConfig) -> Self {
        let factory = Arc::new(HttpConnectorFactory::new(config.request_timeout));
        Self::with_connector_factory(config, factory)
    }

    /// Runtime with a custom connector factory. The seam tests and
    /// simulators use to stand in for a real federation.
    pub fn with_connector_factory(config: RuntimeConfig, factory: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            registry: WalletRegistry::new(factory, config),
        }
    }

    /// Open a wallet from a validated descriptor, persisted under `location`.
    pub fn create_wallet(
        &self,
        descriptor: FederationDescriptor,
        location: &Path,
    ) -> Result<WalletHandle, RuntimeError> {
        Ok(self.registry.create_wallet(descriptor, location)?)
    }

    /// Open a wallet from a compact invite string
    /// (`lumen1:<id>:<threshold>:<url>[,<url>...]`).
    pub fn create_wallet_from_invite(
        &self,
        invite: &str,
        location: &Path,
    ) -> Result<WalletHandle, RuntimeError> {
        let descriptor = FederationDescriptor::from_invite(invite)
            .map_err(|e| RuntimeError::new(ErrorKind::Validation, "invalid_invite", e.to_string()))?;
        self.create_wallet(descriptor, location)
    }

    /// Close a wallet, draining in-flight operations first. See
    /// [`WalletRegistry::close_wallet`] for the timeout semantics.
    pub async fn close_wallet(&self, handle: WalletHandle) -> Result<(), RuntimeError> {
        Ok(self.registry.close_wallet(handle).await?)
    }

    /// Spend `amount_msat` in favor of `recipient`.
    pub fn send(
        &self,
        handle: WalletHandle,
        amount_msat: u64,
        recipient: &str,
    ) -> Result<OperationId, RuntimeError> {
        self.submit(
            handle,
            OperationKind::Send {
                amount_msat,
                recipient: recipient.to_string(),
            },
        )
    }

    /// Redeem `amount_msat` of incoming notes.
    pub fn receive(&self, handle: WalletHandle, amount_msat: u64) -> Result<OperationId, RuntimeError> {
        self.submit(handle, OperationKind::Receive { amount_msat })
    }

    /// (Re-)affirm the wallet's federation membership.
    pub fn join(&self, handle: WalletHandle) -> Result<OperationId, RuntimeError> {
        self.submit(handle, OperationKind::Join)
    }

    /// Submit any operation kind. The typed helpers above forward here.
    pub fn submit(
        &self,
        handle: WalletHandle,
        kind: OperationKind,
    ) -> Result<OperationId, RuntimeError> {
        Ok(self.registry.dispatch(handle, kind)?)
    }

    /// Status snapshot of one operation.
    pub fn poll(
        &self,
        handle: WalletHandle,
        operation_id: OperationId,
    ) -> Result<OperationStatus, RuntimeError> {
        Ok(self.registry.poll_operation(handle, operation_id)?)
    }

    /// The wallet's confirmed balance snapshot.
    pub fn balance(&self, handle: WalletHandle) -> Result<BalanceSnapshot, RuntimeError> {
        Ok(self.registry.balance(handle)?)
    }

    /// Every registered wallet, ordered by handle. Closing wallets included.
    pub fn list_wallets(&self) -> Vec<WalletRecord> {
        self.registry.list_wallets()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{
        ConnectorError, ConnectorHealth, FederationConnector, FederationRequest,
        FederationResponse,
    };
    use crate::federation::{FederationId, GuardianEndpoint};
    use crate::operation::OperationState;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ConfirmingConnector;

    #[async_trait]
    impl FederationConnector for ConfirmingConnector {
        async fn send(
            &self,
            _request: FederationRequest,
        ) -> Result<FederationResponse, ConnectorError> {
            Ok(FederationResponse {
                epoch: 1,
                result: serde_json::json!({"outcome": "accepted"}),
            })
        }

        fn health(&self) -> ConnectorHealth {
            ConnectorHealth::Healthy
        }
    }

    struct ConfirmingFactory;

    impl ConnectorFactory for ConfirmingFactory {
        fn build(&self, _descriptor: &FederationDescriptor) -> Arc<dyn FederationConnector> {
            Arc::new(ConfirmingConnector)
        }
    }

    fn runtime() -> Runtime {
        Runtime::with_connector_factory(RuntimeConfig::default(), Arc::new(ConfirmingFactory))
    }

    fn invite() -> String {
        format!("lumen1:{}:1:https://g0.example.net", "ab".repeat(32))
    }

    async fn settle(runtime: &Runtime, handle: WalletHandle, op: OperationId) -> OperationState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = runtime.poll(handle, op).unwrap();
            if status.state.is_terminal() {
                return status.state;
            }
            assert!(tokio::time::Instant::now() < deadline, "operation stuck");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn invite_to_confirmed_receive() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();

        let handle = runtime
            .create_wallet_from_invite(&invite(), dir.path())
            .unwrap();
        let op = runtime.receive(handle, 1_000).unwrap();
        let state = settle(&runtime, handle, op).await;

        assert!(matches!(state, OperationState::Confirmed { .. }));
        assert_eq!(runtime.balance(handle).unwrap().available_msat, 1_000);
        runtime.close_wallet(handle).await.unwrap();
        assert!(runtime.list_wallets().is_empty());
    }

    #[tokio::test]
    async fn bad_invite_is_a_validation_error() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();

        let err = runtime
            .create_wallet_from_invite("nonsense", dir.path())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, "invalid_invite");
    }

    #[tokio::test]
    async fn deserialized_descriptor_is_revalidated_at_create() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();

        // Arrives from the host as JSON, bypassing the parse constructors.
        let descriptor: FederationDescriptor = serde_json::from_str(
            r#"{"id":"zz","guardians":["ftp://nope"],"quorum_threshold":1}"#,
        )
        .unwrap();
        let err = runtime.create_wallet(descriptor, dir.path()).unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, "invalid_descriptor");
        assert!(runtime.list_wallets().is_empty());
    }

    #[tokio::test]
    async fn error_kinds_match_their_sources() {
        let runtime = runtime();
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FederationDescriptor::new(
            FederationId::parse(&"ab".repeat(32)).unwrap(),
            vec![GuardianEndpoint::parse("https://g0.example.net").unwrap()],
            1,
        )
        .unwrap();
        let handle = runtime.create_wallet(descriptor.clone(), dir.path()).unwrap();

        // Duplicate storage location: a local resource conflict.
        let err = runtime
            .create_wallet(descriptor, dir.path())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resource);
        assert_eq!(err.code, "duplicate_storage_location");

        // Overdraft caught at submit: the request itself is wrong.
        let err = runtime.send(handle, 1, "lumen:peer").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.code, "insufficient_funds");

        // Stale handle after close: a handle problem, not a bad request.
        runtime.close_wallet(handle).await.unwrap();
        let err = runtime.join(handle).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resource);
        assert_eq!(err.code, "unknown_handle");
    }

    #[test]
    fn failure_reasons_map_to_protocol_or_transient() {
        let unresponsive =
            RuntimeError::from_failure(&FailureReason::FederationUnresponsive { attempts: 4 });
        assert_eq!(unresponsive.kind, ErrorKind::TransientNetwork);

        let broke = RuntimeError::from_failure(&FailureReason::InsufficientFunds);
        assert_eq!(broke.kind, ErrorKind::Protocol);
        assert_eq!(broke.code, "insufficient_funds");

        let rejected = RuntimeError::from_failure(&FailureReason::Rejected {
            detail: "bad note".into(),
        });
        assert_eq!(rejected.kind, ErrorKind::Protocol);
    }

    #[test]
    fn runtime_error_serializes_for_binding_layers() {
        let err = RuntimeError::new(ErrorKind::Validation, "unknown_handle", "wallet#9");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "validation");
        assert_eq!(json["code"], "unknown_handle");
    }
}
