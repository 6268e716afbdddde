//! # Wallet Registry
//!
//! The runtime's handle table: every open wallet lives here under an opaque
//! [`WalletHandle`], and every call from the embedding host resolves through
//! it. The registry enforces the two global invariants no single session can
//! see on its own:
//!
//! - **Storage exclusivity** — at most one live wallet per storage location,
//!   across the whole process. A second `create_wallet` against the same
//!   directory fails before any state is created.
//! - **Lifecycle** — a handle is dispatched to only while its wallet is
//!   active. Closing stops intake immediately, drains in-flight operations
//!   within a deadline, and never cancels them: a close that times out
//!   parks the wallet as "closing" and keeps draining in the background.
//!
//! Handle lookups ride a [`DashMap`] so dispatch against wallet A never
//! contends with dispatch against wallet B; the rare lifecycle paths
//! (create, close) serialize through one mutex.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::connector::{ConnectorFactory, ConnectorHealth};
use crate::federation::{DescriptorError, FederationDescriptor, FederationId};
use crate::operation::{OperationId, OperationKind, OperationStatus};
use crate::session::{BalanceSnapshot, OperationCounters, SessionError, WalletSession};
use crate::storage::{SledStore, StoreError};

// ---------------------------------------------------------------------------
// Handles and records
// ---------------------------------------------------------------------------

/// Opaque identifier for one open wallet. Never reused within a process;
/// handle `0` is never issued, so it is safe as a sentinel on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletHandle(pub u64);

impl fmt::Display for WalletHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wallet#{}", self.0)
    }
}

/// Lifecycle state of a registered wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    /// Accepting operations.
    Active,
    /// Close was requested; no new operations, in-flight ones still
    /// draining. Leaves this state only by disappearing from the registry.
    Closing,
}

/// One row of `list_wallets`.
#[derive(Debug, Clone, Serialize)]
pub struct WalletRecord {
    pub handle: WalletHandle,
    pub federation_id: FederationId,
    pub status: WalletStatus,
    pub in_flight: usize,
    pub counters: OperationCounters,
    pub connector_health: ConnectorHealth,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The federation descriptor failed validation. Nothing was created.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// The storage backend could not be opened or failed mid-operation.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Another live wallet already owns this storage location.
    #[error("storage location already in use: {0}")]
    DuplicateStorageLocation(PathBuf),

    /// No wallet is registered under this handle.
    #[error("unknown wallet handle: {0}")]
    UnknownHandle(WalletHandle),

    /// The wallet is draining for close and accepts no new work.
    #[error("wallet is closing: {0}")]
    WalletClosing(WalletHandle),

    /// Close could not drain in-flight operations within the deadline. The
    /// wallet remains registered as closing and keeps draining.
    #[error("close timed out with operations in flight: {0}")]
    CloseTimedOut(WalletHandle),

    /// The operation id is unknown to this wallet.
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    /// The wallet session rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct WalletEntry {
    session: WalletSession,
    status: WalletStatus,
    location: PathBuf,
    created_at: DateTime<Utc>,
}

struct RegistryInner {
    wallets: DashMap<WalletHandle, WalletEntry>,
    /// Handle source. Starts at 1; see [`WalletHandle`].
    next_handle: AtomicU64,
    /// Serializes create/close and guards the storage-location set. Never
    /// taken on the dispatch path.
    lifecycle: Mutex<HashSet<PathBuf>>,
    factory: Arc<dyn ConnectorFactory>,
    config: RuntimeConfig,
}

/// The handle table. Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct WalletRegistry {
    inner: Arc<RegistryInner>,
}

impl WalletRegistry {
    pub fn new(factory: Arc<dyn ConnectorFactory>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                wallets: DashMap::new(),
                next_handle: AtomicU64::new(1),
                lifecycle: Mutex::new(HashSet::new()),
                factory,
                config,
            }),
        }
    }

    /// Open a wallet bound to `descriptor`, persisted under `location`.
    ///
    /// Validation runs before any state exists, and the location is claimed
    /// only once the store and session are both up — a failed create leaves
    /// no trace, and the same location can be retried immediately.
    pub fn create_wallet(
        &self,
        descriptor: FederationDescriptor,
        location: &Path,
    ) -> Result<WalletHandle, RegistryError> {
        descriptor.validate()?;
        let location = location.to_path_buf();

        let mut claimed = self.inner.lifecycle.lock();
        if claimed.contains(&location) {
            return Err(RegistryError::DuplicateStorageLocation(location));
        }

        // sled's own directory lock backstops this set across processes.
        let store = Arc::new(SledStore::open(&location)?);
        let connector = self.inner.factory.build(&descriptor);
        let session = WalletSession::open(
            descriptor.id.clone(),
            store,
            connector,
            self.inner.config.clone(),
        )?;

        claimed.insert(location.clone());
        let handle = WalletHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        self.inner.wallets.insert(
            handle,
            WalletEntry {
                session,
                status: WalletStatus::Active,
                location,
                created_at: Utc::now(),
            },
        );

        info!(
            handle = handle.0,
            federation = descriptor.id.short(),
            "wallet created"
        );
        Ok(handle)
    }

    /// Submit an operation to a wallet. Returns the operation id at once;
    /// progress is observed via [`poll_operation`](Self::poll_operation).
    pub fn dispatch(
        &self,
        handle: WalletHandle,
        kind: OperationKind,
    ) -> Result<OperationId, RegistryError> {
        // Clone the session out and release the shard guard before the
        // session does any work, so a slow wallet never blocks the map.
        let session = self.active_session(handle)?;
        Ok(session.submit(kind)?)
    }

    /// Status of one operation. Closing wallets still answer polls.
    pub fn poll_operation(
        &self,
        handle: WalletHandle,
        operation_id: OperationId,
    ) -> Result<OperationStatus, RegistryError> {
        let session = self.any_session(handle)?;
        session
            .poll(operation_id)?
            .ok_or(RegistryError::UnknownOperation(operation_id))
    }

    /// The wallet's confirmed balance snapshot.
    pub fn balance(&self, handle: WalletHandle) -> Result<BalanceSnapshot, RegistryError> {
        Ok(self.any_session(handle)?.balance())
    }

    /// Close a wallet: stop intake, drain in-flight operations, release the
    /// handle and the storage location.
    ///
    /// If the drain misses `close_timeout`, the wallet stays registered as
    /// [`WalletStatus::Closing`] and a background task keeps draining at the
    /// same interval until the last operation settles; the caller gets
    /// [`RegistryError::CloseTimedOut`]. In-flight operations are never
    /// cancelled.
    pub async fn close_wallet(&self, handle: WalletHandle) -> Result<(), RegistryError> {
        let session = {
            let mut entry = self
                .inner
                .wallets
                .get_mut(&handle)
                .ok_or(RegistryError::UnknownHandle(handle))?;
            if entry.status == WalletStatus::Closing {
                return Err(RegistryError::WalletClosing(handle));
            }
            entry.status = WalletStatus::Closing;
            entry.session.stop_accepting();
            entry.session.clone()
        };

        if session.drain(self.inner.config.close_timeout).await {
            self.remove(handle);
            info!(handle = handle.0, "wallet closed");
            return Ok(());
        }

        warn!(
            handle = handle.0,
            in_flight = session.in_flight(),
            "close timed out, draining in background"
        );
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                if session.drain(registry.inner.config.close_timeout).await {
                    registry.remove(handle);
                    info!(handle = handle.0, "wallet closed after deferred drain");
                    return;
                }
            }
        });
        Err(RegistryError::CloseTimedOut(handle))
    }

    /// Snapshot of every registered wallet, ordered by handle.
    pub fn list_wallets(&self) -> Vec<WalletRecord> {
        let mut records: Vec<WalletRecord> = self
            .inner
            .wallets
            .iter()
            .map(|entry| WalletRecord {
                handle: *entry.key(),
                federation_id: entry.session.federation_id().clone(),
                status: entry.status,
                in_flight: entry.session.in_flight(),
                counters: entry.session.counters(),
                connector_health: entry.session.connector_health(),
                created_at: entry.created_at,
            })
            .collect();
        records.sort_by_key(|r| r.handle);
        records
    }

    /// Number of registered wallets, closing ones included.
    pub fn len(&self) -> usize {
        self.inner.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.wallets.is_empty()
    }

    fn remove(&self, handle: WalletHandle) {
        if let Some((_, entry)) = self.inner.wallets.remove(&handle) {
            self.inner.lifecycle.lock().remove(&entry.location);
        }
    }

    /// Session clone for dispatch: the wallet must be active.
    fn active_session(&self, handle: WalletHandle) -> Result<WalletSession, RegistryError> {
        let entry = self
            .inner
            .wallets
            .get(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        if entry.status == WalletStatus::Closing {
            return Err(RegistryError::WalletClosing(handle));
        }
        Ok(entry.session.clone())
    }

    /// Session clone for read paths: closing wallets are still readable.
    fn any_session(&self, handle: WalletHandle) -> Result<WalletSession, RegistryError> {
        let entry = self
            .inner
            .wallets
            .get(&handle)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        Ok(entry.session.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{
        ConnectorError, FederationConnector, FederationRequest, FederationResponse,
    };
    use crate::federation::GuardianEndpoint;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Connector that confirms every request at a fixed epoch.
    struct ConfirmingConnector(u64);

    #[async_trait]
    impl FederationConnector for ConfirmingConnector {
        async fn send(
            &self,
            _request: FederationRequest,
        ) -> Result<FederationResponse, ConnectorError> {
            Ok(FederationResponse {
                epoch: self.0,
                result: serde_json::json!({"outcome": "accepted"}),
            })
        }

        fn health(&self) -> ConnectorHealth {
            ConnectorHealth::Healthy
        }
    }

    /// Connector whose rounds never complete.
    struct HangingConnector;

    #[async_trait]
    impl FederationConnector for HangingConnector {
        async fn send(
            &self,
            _request: FederationRequest,
        ) -> Result<FederationResponse, ConnectorError> {
            futures::future::pending().await
        }

        fn health(&self) -> ConnectorHealth {
            ConnectorHealth::Down
        }
    }

    enum Behavior {
        Confirm(u64),
        Hang,
    }

    struct StubFactory(Behavior);

    impl ConnectorFactory for StubFactory {
        fn build(&self, _descriptor: &FederationDescriptor) -> Arc<dyn FederationConnector> {
            match self.0 {
                Behavior::Confirm(epoch) => Arc::new(ConfirmingConnector(epoch)),
                Behavior::Hang => Arc::new(HangingConnector),
            }
        }
    }

    fn descriptor() -> FederationDescriptor {
        FederationDescriptor::new(
            FederationId::parse(&"ab".repeat(32)).unwrap(),
            vec![GuardianEndpoint::parse("https://g0.example.net").unwrap()],
            1,
        )
        .unwrap()
    }

    fn registry(behavior: Behavior) -> WalletRegistry {
        WalletRegistry::new(Arc::new(StubFactory(behavior)), RuntimeConfig::default())
    }

    fn registry_with_close_timeout(behavior: Behavior, timeout: Duration) -> WalletRegistry {
        let config = RuntimeConfig {
            close_timeout: timeout,
            ..RuntimeConfig::default()
        };
        WalletRegistry::new(Arc::new(StubFactory(behavior)), config)
    }

    #[tokio::test]
    async fn handles_are_distinct_and_never_zero() {
        let registry = registry(Behavior::Confirm(1));
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();

        let handles: Vec<_> = dirs
            .iter()
            .map(|d| registry.create_wallet(descriptor(), d.path()).unwrap())
            .collect();

        assert_eq!(handles.len(), 3);
        for (i, a) in handles.iter().enumerate() {
            assert_ne!(a.0, 0);
            for b in &handles[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(registry.list_wallets().len(), 3);
    }

    #[tokio::test]
    async fn duplicate_location_leaves_no_partial_state() {
        let registry = registry(Behavior::Confirm(1));
        let dir = tempfile::tempdir().unwrap();

        registry.create_wallet(descriptor(), dir.path()).unwrap();
        let err = registry
            .create_wallet(descriptor(), dir.path())
            .unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateStorageLocation(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn invalid_descriptor_rejected_before_any_state() {
        let registry = registry(Behavior::Confirm(1));
        let dir = tempfile::tempdir().unwrap();

        let bad = FederationDescriptor {
            id: FederationId::parse(&"ab".repeat(32)).unwrap(),
            guardians: vec![GuardianEndpoint::parse("https://g0.example.net").unwrap()],
            quorum_threshold: 5, // more than the guardian count
        };
        let err = registry.create_wallet(bad, dir.path()).unwrap_err();

        assert!(matches!(err, RegistryError::Descriptor(_)));
        assert!(registry.is_empty());
        // The location was never claimed; a valid retry succeeds.
        registry.create_wallet(descriptor(), dir.path()).unwrap();
    }

    #[tokio::test]
    async fn close_releases_handle_and_location() {
        let registry = registry(Behavior::Confirm(1));
        let dir = tempfile::tempdir().unwrap();
        let handle = registry.create_wallet(descriptor(), dir.path()).unwrap();

        registry.close_wallet(handle).await.unwrap();

        assert!(registry.is_empty());
        assert!(matches!(
            registry.dispatch(handle, OperationKind::Join),
            Err(RegistryError::UnknownHandle(_))
        ));
        // The storage location is free again.
        registry.create_wallet(descriptor(), dir.path()).unwrap();
    }

    #[tokio::test]
    async fn close_timeout_parks_wallet_as_closing() {
        let registry =
            registry_with_close_timeout(Behavior::Hang, Duration::from_millis(50));
        let dir = tempfile::tempdir().unwrap();
        let handle = registry.create_wallet(descriptor(), dir.path()).unwrap();

        registry
            .dispatch(handle, OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let err = registry.close_wallet(handle).await.unwrap_err();

        assert!(matches!(err, RegistryError::CloseTimedOut(_)));
        let records = registry.list_wallets();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, WalletStatus::Closing);
        assert_eq!(records[0].in_flight, 1);

        // Draining wallet takes no new work, and a second close is an error
        // rather than a second drain.
        assert!(matches!(
            registry.dispatch(handle, OperationKind::Join),
            Err(RegistryError::WalletClosing(_))
        ));
        assert!(matches!(
            registry.close_wallet(handle).await,
            Err(RegistryError::WalletClosing(_))
        ));
    }

    #[tokio::test]
    async fn poll_still_answers_while_closing() {
        let registry =
            registry_with_close_timeout(Behavior::Hang, Duration::from_millis(50));
        let dir = tempfile::tempdir().unwrap();
        let handle = registry.create_wallet(descriptor(), dir.path()).unwrap();

        let op = registry
            .dispatch(handle, OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let _ = registry.close_wallet(handle).await;

        let status = registry.poll_operation(handle, op).unwrap();
        assert!(!status.state.is_terminal());
    }

    #[tokio::test]
    async fn unknown_ids_map_to_the_right_errors() {
        let registry = registry(Behavior::Confirm(1));
        let dir = tempfile::tempdir().unwrap();
        let handle = registry.create_wallet(descriptor(), dir.path()).unwrap();

        assert!(matches!(
            registry.dispatch(WalletHandle(999), OperationKind::Join),
            Err(RegistryError::UnknownHandle(_))
        ));
        assert!(matches!(
            registry.poll_operation(handle, OperationId::new()),
            Err(RegistryError::UnknownOperation(_))
        ));
        assert!(matches!(
            registry.balance(WalletHandle(999)),
            Err(RegistryError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn list_wallets_is_ordered_by_handle() {
        let registry = registry(Behavior::Confirm(1));
        let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
        for dir in &dirs {
            registry.create_wallet(descriptor(), dir.path()).unwrap();
        }

        let records = registry.list_wallets();
        let handles: Vec<u64> = records.iter().map(|r| r.handle.0).collect();
        let mut sorted = handles.clone();
        sorted.sort_unstable();
        assert_eq!(handles, sorted);
    }

    #[tokio::test]
    async fn operations_flow_end_to_end_through_the_registry() {
        let registry = registry(Behavior::Confirm(7));
        let dir = tempfile::tempdir().unwrap();
        let handle = registry.create_wallet(descriptor(), dir.path()).unwrap();

        let op = registry
            .dispatch(handle, OperationKind::Receive { amount_msat: 4_200 })
            .unwrap();

        // Confirming connector settles promptly; spin-poll with a deadline.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = registry.poll_operation(handle, op).unwrap();
            if status.state.is_terminal() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "operation stuck");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let balance = registry.balance(handle).unwrap();
        assert_eq!(balance.available_msat, 4_200);
        assert_eq!(balance.epoch, 7);
    }
}
