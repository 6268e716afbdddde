//! # Wallet Session
//!
//! One live wallet, end to end: the session owns its storage backend and its
//! federation connector exclusively, runs the operation state machine, and
//! keeps the balance snapshot honest. Nothing outside the session ever
//! touches its internals — external callers go through the registry by
//! handle, never by reference.
//!
//! ## Scheduling
//!
//! `submit` validates and enqueues synchronously, then spawns one async task
//! per in-flight operation. State mutation (the pending set, the balance
//! snapshot) serializes through a single mutex, so operations within a
//! wallet commit sequentially, while the federation round-trips themselves
//! overlap freely — a stalled round holds no lock and starves nobody, in
//! this wallet or any other.
//!
//! ## Atomic Confirmation
//!
//! The transition into `Confirmed` and the balance-snapshot update are one
//! step: a single storage [`WriteBatch`] carries both records, and the
//! in-memory flip happens under the state lock in the same call. No observer
//! ever sees a confirmed balance without the matching confirmed operation,
//! or vice versa.
//!
//! ## Retry Policy
//!
//! Transient connector errors (timeouts, quorum shortfalls) are retried with
//! exponential backoff inside `AwaitingFederation`, up to the configured
//! attempt ceiling, after which the operation fails with
//! `FederationUnresponsive`. Protocol-level rejections fail immediately and
//! are never retried.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::connector::{
    ConnectorError, ConnectorHealth, FederationConnector, FederationRequest,
    ERR_INSUFFICIENT_FUNDS,
};
use crate::federation::FederationId;
use crate::operation::{
    FailureReason, Operation, OperationId, OperationKind, OperationStatus,
};
use crate::storage::{operation_key, StoreError, WalletStore, WriteBatch, KEY_BALANCE, KEY_CURSOR};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request failed synchronous validation. Never retried.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The wallet's own snapshot says the funds aren't there. Checked at
    /// submit so the caller learns immediately; the federation remains the
    /// final authority once a round is in flight.
    #[error("insufficient funds: {available_msat} msat available, {requested_msat} requested")]
    InsufficientFunds {
        available_msat: u64,
        requested_msat: u64,
    },

    /// The storage backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The session is draining for close and accepts no new operations.
    #[error("wallet session is draining")]
    Draining,
}

// ---------------------------------------------------------------------------
// BalanceSnapshot
// ---------------------------------------------------------------------------

/// The wallet's confirmed balance as of a federation epoch.
///
/// Updated only on an operation's transition into `Confirmed`, atomically
/// with that transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Confirmed spendable balance in millisatoshis.
    pub available_msat: u64,

    /// The federation epoch the snapshot reflects.
    pub epoch: u64,

    /// When the snapshot last changed (UTC).
    pub updated_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    fn zero() -> Self {
        Self {
            available_msat: 0,
            epoch: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Lifetime operation counters, reported in wallet records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Everything the session mutates, behind one lock.
struct SessionState {
    balance: BalanceSnapshot,
    /// Operations still tracked in memory: in-flight ones, plus terminal
    /// ones younger than the retention window.
    pending: HashMap<OperationId, Operation>,
    /// Count of operations not yet terminal. Drain waits on this.
    in_flight: usize,
    /// Last-applied storage cursor; bumps once per accepted submit.
    cursor: u64,
    counters: OperationCounters,
}

struct SessionInner {
    federation_id: FederationId,
    store: Arc<dyn WalletStore>,
    connector: Arc<dyn FederationConnector>,
    config: RuntimeConfig,
    state: Mutex<SessionState>,
    /// Signalled every time an operation reaches a terminal state.
    terminal: Notify,
    /// Cleared when the session starts draining; no submits after that.
    accepting: AtomicBool,
}

/// One active wallet. Cheap to clone (shared interior); the registry holds
/// the canonical clone and decides when the session dies.
#[derive(Clone)]
pub struct WalletSession {
    inner: Arc<SessionInner>,
}

impl WalletSession {
    /// Open a session over its exclusive store and fresh connector.
    ///
    /// Reloads the persisted balance snapshot and cursor, if any, so a
    /// reopened wallet picks up where it left off.
    pub fn open(
        federation_id: FederationId,
        store: Arc<dyn WalletStore>,
        connector: Arc<dyn FederationConnector>,
        config: RuntimeConfig,
    ) -> Result<Self, SessionError> {
        let balance = match store.get(KEY_BALANCE)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => BalanceSnapshot::zero(),
        };
        let cursor = match store.get(KEY_CURSOR)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("cursor not 8 bytes".into()))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        debug!(
            federation = federation_id.short(),
            balance_msat = balance.available_msat,
            cursor,
            "wallet session opened"
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                federation_id,
                store,
                connector,
                config,
                state: Mutex::new(SessionState {
                    balance,
                    pending: HashMap::new(),
                    in_flight: 0,
                    cursor,
                    counters: OperationCounters::default(),
                }),
                terminal: Notify::new(),
                accepting: AtomicBool::new(true),
            }),
        })
    }

    /// The federation this wallet is bound to.
    pub fn federation_id(&self) -> &FederationId {
        &self.inner.federation_id
    }

    /// Validate, record, and launch one operation. Returns its id
    /// immediately; progress is observed via [`poll`](Self::poll).
    ///
    /// Must be called from within a tokio runtime — each accepted operation
    /// runs as its own task.
    pub fn submit(&self, kind: OperationKind) -> Result<OperationId, SessionError> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SessionError::Draining);
        }
        self.validate(&kind)?;

        let mut op = Operation::new(kind);
        let id = op.id;

        // Created → Submitted happens before the operation is visible
        // anywhere, so the first observable state is already Submitted.
        op.submit().expect("fresh operation accepts submit");
        self.inner
            .store
            .put(&operation_key(&id), &encode(&op)?)?;

        {
            let mut state = self.inner.state.lock();
            state.cursor += 1;
            state.counters.submitted += 1;
            state.in_flight += 1;
            state.pending.insert(id, op);
            // Cursor persistence is advisory; losing it costs nothing but a
            // gap in the sequence.
            if let Err(e) = self
                .inner
                .store
                .put(KEY_CURSOR, &state.cursor.to_be_bytes())
            {
                warn!(error = %e, "failed to persist storage cursor");
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            drive_operation(inner, id).await;
        });

        debug!(
            federation = self.inner.federation_id.short(),
            operation = %id,
            "operation submitted"
        );
        Ok(id)
    }

    /// Status of one operation: from the in-memory set if tracked, from
    /// storage if already archived. `None` means the id was never seen.
    pub fn poll(&self, id: OperationId) -> Result<Option<OperationStatus>, SessionError> {
        {
            let mut state = self.inner.state.lock();
            prune_retained(&mut state, self.inner.config.operation_retention);
            if let Some(op) = state.pending.get(&id) {
                return Ok(Some(OperationStatus::from(op)));
            }
        }

        match self.inner.store.get(&operation_key(&id))? {
            Some(bytes) => {
                let op: Operation = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(OperationStatus::from(&op)))
            }
            None => Ok(None),
        }
    }

    /// Point-in-time balance snapshot.
    pub fn balance(&self) -> BalanceSnapshot {
        self.inner.state.lock().balance.clone()
    }

    /// Lifetime operation counters.
    pub fn counters(&self) -> OperationCounters {
        self.inner.state.lock().counters
    }

    /// Number of operations not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Connector health as of its last federation round.
    pub fn connector_health(&self) -> ConnectorHealth {
        self.inner.connector.health()
    }

    /// Stop accepting new operations. In-flight ones keep running; there is
    /// no way back — a draining session only ever closes.
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    /// Wait until every in-flight operation reaches a terminal state.
    ///
    /// Returns `true` if the session drained within `timeout`, `false`
    /// otherwise. In-flight operations are never cancelled — a `false`
    /// return means they are still running and a later drain may succeed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the count — `notify_waiters`
            // only wakes already-registered waiters, so an operation
            // settling between the check and the await must not be a missed
            // wakeup.
            let notified = self.inner.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    fn validate(&self, kind: &OperationKind) -> Result<(), SessionError> {
        match kind {
            OperationKind::Send {
                amount_msat,
                recipient,
            } => {
                if *amount_msat == 0 {
                    return Err(SessionError::InvalidOperation(
                        "send amount must be non-zero".into(),
                    ));
                }
                if recipient.trim().is_empty() {
                    return Err(SessionError::InvalidOperation(
                        "send recipient must be non-empty".into(),
                    ));
                }
                let available = self.inner.state.lock().balance.available_msat;
                if available < *amount_msat {
                    return Err(SessionError::InsufficientFunds {
                        available_msat: available,
                        requested_msat: *amount_msat,
                    });
                }
                Ok(())
            }
            OperationKind::Receive { amount_msat } => {
                if *amount_msat == 0 {
                    return Err(SessionError::InvalidOperation(
                        "receive amount must be non-zero".into(),
                    ));
                }
                Ok(())
            }
            OperationKind::Join => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation driver
// ---------------------------------------------------------------------------

/// Runs one operation's federation rounds to a terminal state. One task per
/// operation; holds the state lock only for transitions and commits, never
/// across an await.
async fn drive_operation(inner: Arc<SessionInner>, id: OperationId) {
    let max_attempts = inner.config.max_federation_attempts;

    loop {
        // Transition into (or bump) AwaitingFederation and snapshot the kind.
        let (attempt, kind) = {
            let mut state = inner.state.lock();
            let op = state
                .pending
                .get_mut(&id)
                .expect("driver owns a pending operation");
            let attempt = op
                .begin_round()
                .expect("non-terminal operation accepts begin_round");
            let kind = op.kind.clone();
            let record = op.clone();
            drop(state);

            persist_best_effort(&inner, &record);
            (attempt, kind)
        };

        let outcome = inner
            .connector
            .send(FederationRequest {
                operation_id: id,
                kind,
            })
            .await;

        match outcome {
            Ok(response) => {
                settle_confirmed(&inner, id, response.epoch);
                return;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(&inner.config, attempt);
                debug!(
                    federation = inner.federation_id.short(),
                    operation = %id,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient federation error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                warn!(
                    federation = inner.federation_id.short(),
                    operation = %id,
                    attempts = attempt,
                    error = %e,
                    "retry ceiling exhausted"
                );
                settle_failed(
                    &inner,
                    id,
                    FailureReason::FederationUnresponsive { attempts: attempt },
                );
                return;
            }
            Err(e) => {
                settle_failed(&inner, id, protocol_failure(e));
                return;
            }
        }
    }
}

/// Map a non-transient connector error to the operation's failure reason.
fn protocol_failure(e: ConnectorError) -> FailureReason {
    match e {
        ConnectorError::Rejected {
            code: ERR_INSUFFICIENT_FUNDS,
            ..
        } => FailureReason::InsufficientFunds,
        other => FailureReason::Rejected {
            detail: other.to_string(),
        },
    }
}

/// Commit a confirmation: balance update and terminal transition in one
/// atomic storage batch, in-memory flip under the same lock hold.
///
/// Every failure path inside lands the operation in `Failed` instead of
/// returning early — a settle never leaves an operation dangling in
/// `AwaitingFederation` with no driver, or `drain` could never finish.
fn settle_confirmed(inner: &Arc<SessionInner>, id: OperationId, epoch: u64) {
    let mut state = inner.state.lock();

    let op = state
        .pending
        .get(&id)
        .expect("driver owns a pending operation");
    let mut confirmed = op.clone();
    if let Err(e) = confirmed.confirm(epoch) {
        // Unreachable while the driver is the sole mutator; keep the
        // operation observable rather than crash the wallet.
        error!(operation = %id, error = %e, "confirm transition rejected");
        settle_failed_locked(
            inner,
            state,
            id,
            FailureReason::Rejected {
                detail: format!("confirm transition rejected: {e}"),
            },
        );
        return;
    }

    let delta: i64 = match &confirmed.kind {
        OperationKind::Send { amount_msat, .. } => -(*amount_msat as i64),
        OperationKind::Receive { amount_msat } => *amount_msat as i64,
        OperationKind::Join => 0,
    };
    let new_balance = BalanceSnapshot {
        available_msat: state.balance.available_msat.saturating_add_signed(delta),
        epoch,
        updated_at: Utc::now(),
    };

    let mut batch = WriteBatch::new();
    match (encode(&confirmed), bincode::serialize(&new_balance)) {
        (Ok(op_bytes), Ok(balance_bytes)) => {
            batch.put(operation_key(&id), op_bytes);
            batch.put(KEY_BALANCE.to_vec(), balance_bytes);
        }
        _ => {
            error!(operation = %id, "failed to encode confirmation records");
            settle_failed_locked(
                inner,
                state,
                id,
                FailureReason::Rejected {
                    detail: "failed to encode confirmation records".into(),
                },
            );
            return;
        }
    }

    if let Err(e) = inner.store.transaction(batch) {
        // The federation confirmed but our disk did not. Fail the operation
        // so the caller sees the truth; the balance snapshot stays at its
        // last durable value.
        error!(operation = %id, error = %e, "storage commit failed after confirmation");
        settle_failed_locked(
            inner,
            state,
            id,
            FailureReason::Rejected {
                detail: format!("storage commit failed: {e}"),
            },
        );
        return;
    }

    state.pending.insert(id, confirmed);
    state.balance = new_balance;
    state.counters.confirmed += 1;
    state.in_flight = state.in_flight.saturating_sub(1);
    let balance_msat = state.balance.available_msat;
    drop(state);

    inner.terminal.notify_waiters();
    info!(
        federation = inner.federation_id.short(),
        operation = %id,
        epoch,
        balance_msat,
        "operation confirmed"
    );
}

/// Commit a failure: terminal transition, no balance effect.
fn settle_failed(inner: &Arc<SessionInner>, id: OperationId, reason: FailureReason) {
    let state = inner.state.lock();
    settle_failed_locked(inner, state, id, reason);
}

/// Shared terminal-failure bookkeeping: flip the operation, bump the
/// counters, persist the record, wake drainers. The in-flight decrement and
/// the wakeup happen even when the flip itself is rejected, so a wallet can
/// always finish draining.
fn settle_failed_locked(
    inner: &Arc<SessionInner>,
    mut state: MutexGuard<'_, SessionState>,
    id: OperationId,
    reason: FailureReason,
) {
    let mut record = None;
    if let Some(op) = state.pending.get_mut(&id) {
        if op.fail(reason.clone()).is_ok() {
            record = Some(op.clone());
        } else {
            error!(operation = %id, "fail transition rejected");
        }
    }
    if record.is_some() {
        state.counters.failed += 1;
    }
    state.in_flight = state.in_flight.saturating_sub(1);
    drop(state);

    if let Some(record) = record {
        persist_best_effort(inner, &record);
        info!(
            federation = inner.federation_id.short(),
            operation = %id,
            reason = %reason,
            "operation failed"
        );
    }
    inner.terminal.notify_waiters();
}

/// Persist a non-critical operation record; a failed write costs restart
/// fidelity, not correctness, so it is logged and not propagated.
fn persist_best_effort(inner: &Arc<SessionInner>, op: &Operation) {
    match encode(op) {
        Ok(bytes) => {
            if let Err(e) = inner.store.put(&operation_key(&op.id), &bytes) {
                warn!(operation = %op.id, error = %e, "failed to persist operation record");
            }
        }
        Err(e) => warn!(operation = %op.id, error = %e, "failed to encode operation record"),
    }
}

/// Drop terminal operations older than the retention window from the
/// in-memory set. Their on-disk records remain.
fn prune_retained(state: &mut SessionState, retention: Duration) {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::minutes(15));
    state
        .pending
        .retain(|_, op| !op.is_terminal() || op.updated_at > cutoff);
}

/// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, plus up
/// to half the base of random jitter so synchronized wallets don't stampede.
fn backoff_delay(config: &RuntimeConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let scaled = config
        .retry_backoff_base
        .saturating_mul(2u32.saturating_pow(exp))
        .min(config.retry_backoff_cap);
    let jitter_cap = (config.retry_backoff_base.as_millis() as u64 / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_cap);
    scaled + Duration::from_millis(jitter)
}

fn encode(op: &Operation) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(op).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::FederationResponse;
    use crate::operation::OperationState;
    use crate::storage::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Connector scripted per call: times out `timeouts` times, then either
    /// confirms at `epoch` or rejects with `reject_code`.
    struct FakeConnector {
        timeouts: AtomicU32,
        reject_code: Option<i32>,
        epoch: u64,
        calls: AtomicU32,
    }

    impl FakeConnector {
        fn confirming(epoch: u64) -> Self {
            Self {
                timeouts: AtomicU32::new(0),
                reject_code: None,
                epoch,
                calls: AtomicU32::new(0),
            }
        }

        fn flaky(timeouts: u32, epoch: u64) -> Self {
            Self {
                timeouts: AtomicU32::new(timeouts),
                reject_code: None,
                epoch,
                calls: AtomicU32::new(0),
            }
        }

        fn rejecting(code: i32) -> Self {
            Self {
                timeouts: AtomicU32::new(0),
                reject_code: Some(code),
                epoch: 0,
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FederationConnector for FakeConnector {
        async fn send(
            &self,
            _request: FederationRequest,
        ) -> Result<FederationResponse, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .timeouts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ConnectorError::Timeout);
            }
            if let Some(code) = self.reject_code {
                return Err(ConnectorError::Rejected {
                    code,
                    detail: "no".into(),
                });
            }
            Ok(FederationResponse {
                epoch: self.epoch,
                result: serde_json::json!({"outcome": "accepted"}),
            })
        }

        fn health(&self) -> ConnectorHealth {
            ConnectorHealth::Healthy
        }
    }

    /// Connector that confirms after a fixed delay.
    struct SlowConnector(Duration);

    #[async_trait]
    impl FederationConnector for SlowConnector {
        async fn send(
            &self,
            _request: FederationRequest,
        ) -> Result<FederationResponse, ConnectorError> {
            tokio::time::sleep(self.0).await;
            Ok(FederationResponse {
                epoch: 1,
                result: serde_json::json!({"outcome": "accepted"}),
            })
        }

        fn health(&self) -> ConnectorHealth {
            ConnectorHealth::Healthy
        }
    }

    /// Store whose atomic commit always refuses; point reads/writes work.
    struct BrokenCommitStore(MemoryStore);

    impl WalletStore for BrokenCommitStore {
        fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
            self.0.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
            self.0.put(key, value)
        }

        fn transaction(&self, _batch: WriteBatch) -> StoreResult<()> {
            Err(StoreError::Unavailable("commit refused".into()))
        }

        fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
            self.0.scan_prefix(prefix)
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            retry_backoff_base: Duration::from_millis(1),
            retry_backoff_cap: Duration::from_millis(4),
            ..RuntimeConfig::default()
        }
    }

    fn fed_id() -> FederationId {
        FederationId::parse(&"ef".repeat(32)).unwrap()
    }

    fn open_session(connector: Arc<dyn FederationConnector>) -> WalletSession {
        WalletSession::open(
            fed_id(),
            Arc::new(MemoryStore::new()),
            connector,
            fast_config(),
        )
        .unwrap()
    }

    async fn settled(session: &WalletSession, id: OperationId) -> OperationState {
        assert!(session.drain(Duration::from_secs(5)).await, "drain hung");
        session.poll(id).unwrap().unwrap().state
    }

    #[tokio::test]
    async fn receive_confirms_and_credits_balance() {
        let session = open_session(Arc::new(FakeConnector::confirming(3)));

        let id = session
            .submit(OperationKind::Receive { amount_msat: 2_000 })
            .unwrap();
        let state = settled(&session, id).await;

        assert_eq!(state, OperationState::Confirmed { epoch: 3 });
        let balance = session.balance();
        assert_eq!(balance.available_msat, 2_000);
        assert_eq!(balance.epoch, 3);
        assert_eq!(session.counters().confirmed, 1);
    }

    #[tokio::test]
    async fn send_debits_on_confirm_only() {
        let session = open_session(Arc::new(FakeConnector::confirming(1)));
        let id = session
            .submit(OperationKind::Receive { amount_msat: 5_000 })
            .unwrap();
        settled(&session, id).await;

        let id = session
            .submit(OperationKind::Send {
                amount_msat: 1_500,
                recipient: "lumen:peer".into(),
            })
            .unwrap();
        let state = settled(&session, id).await;

        assert!(matches!(state, OperationState::Confirmed { .. }));
        assert_eq!(session.balance().available_msat, 3_500);
    }

    #[tokio::test]
    async fn transient_errors_retry_then_confirm() {
        let connector = Arc::new(FakeConnector::flaky(3, 2));
        let session = open_session(connector.clone());

        let id = session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let state = settled(&session, id).await;

        assert_eq!(state, OperationState::Confirmed { epoch: 2 });
        // 3 timeouts + 1 success = 4 dispatches, exactly the default ceiling.
        assert_eq!(connector.call_count(), 4);
    }

    #[tokio::test]
    async fn retry_ceiling_exhaustion_fails_unresponsive() {
        let connector = Arc::new(FakeConnector::flaky(u32::MAX, 0));
        let session = open_session(connector.clone());

        let id = session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let state = settled(&session, id).await;

        assert_eq!(
            state,
            OperationState::Failed {
                reason: FailureReason::FederationUnresponsive { attempts: 4 }
            }
        );
        assert_eq!(connector.call_count(), 4);
        assert_eq!(session.counters().failed, 1);
        // Failure never touches the balance.
        assert_eq!(session.balance().available_msat, 0);
    }

    #[tokio::test]
    async fn protocol_rejection_never_retries() {
        let connector = Arc::new(FakeConnector::rejecting(-32000));
        let session = open_session(connector.clone());

        let id = session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let state = settled(&session, id).await;

        assert!(matches!(
            state,
            OperationState::Failed {
                reason: FailureReason::Rejected { .. }
            }
        ));
        // One dispatch, no backoff loop.
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test]
    async fn federation_stated_insufficiency_maps_to_reason() {
        let connector = Arc::new(FakeConnector::rejecting(ERR_INSUFFICIENT_FUNDS));
        let session = open_session(connector.clone());

        let id = session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        let state = settled(&session, id).await;

        assert_eq!(
            state,
            OperationState::Failed {
                reason: FailureReason::InsufficientFunds
            }
        );
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test]
    async fn submit_validation_rejects_bad_requests() {
        let session = open_session(Arc::new(FakeConnector::confirming(1)));

        assert!(matches!(
            session.submit(OperationKind::Send {
                amount_msat: 0,
                recipient: "x".into()
            }),
            Err(SessionError::InvalidOperation(_))
        ));
        assert!(matches!(
            session.submit(OperationKind::Send {
                amount_msat: 100,
                recipient: "  ".into()
            }),
            Err(SessionError::InvalidOperation(_))
        ));
        assert!(matches!(
            session.submit(OperationKind::Receive { amount_msat: 0 }),
            Err(SessionError::InvalidOperation(_))
        ));
        // Empty wallet cannot send.
        assert!(matches!(
            session.submit(OperationKind::Send {
                amount_msat: 1,
                recipient: "lumen:peer".into()
            }),
            Err(SessionError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_status_is_idempotent_across_polls() {
        let session = open_session(Arc::new(FakeConnector::confirming(8)));
        let id = session
            .submit(OperationKind::Receive { amount_msat: 700 })
            .unwrap();
        let first = settled(&session, id).await;

        for _ in 0..5 {
            let again = session.poll(id).unwrap().unwrap().state;
            assert_eq!(again, first);
        }
    }

    #[tokio::test]
    async fn failed_storage_commit_still_settles_the_operation() {
        let session = WalletSession::open(
            fed_id(),
            Arc::new(BrokenCommitStore(MemoryStore::new())),
            Arc::new(FakeConnector::confirming(3)),
            fast_config(),
        )
        .unwrap();

        let id = session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();
        // The confirmation cannot commit, but the operation must still
        // reach a terminal state and the drain must still complete.
        let state = settled(&session, id).await;

        assert!(matches!(
            state,
            OperationState::Failed {
                reason: FailureReason::Rejected { .. }
            }
        ));
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.counters().failed, 1);
        // The balance never moved past its last durable value.
        assert_eq!(session.balance().available_msat, 0);
    }

    #[tokio::test]
    async fn drain_wakes_as_soon_as_the_last_operation_settles() {
        let session = open_session(Arc::new(SlowConnector(Duration::from_millis(50))));
        session
            .submit(OperationKind::Receive { amount_msat: 100 })
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(session.drain(Duration::from_secs(30)).await);
        // The settle wakes the drainer directly; nothing should be left
        // sleeping toward the 30s deadline.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn draining_session_rejects_submits() {
        let session = open_session(Arc::new(FakeConnector::confirming(1)));
        session.stop_accepting();

        assert!(matches!(
            session.submit(OperationKind::Join),
            Err(SessionError::Draining)
        ));
    }

    #[tokio::test]
    async fn poll_unknown_id_is_none() {
        let session = open_session(Arc::new(FakeConnector::confirming(1)));
        assert!(session.poll(OperationId::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_answers_from_storage_after_pruning() {
        let mut config = fast_config();
        config.operation_retention = Duration::ZERO;
        let session = WalletSession::open(
            fed_id(),
            Arc::new(MemoryStore::new()),
            Arc::new(FakeConnector::confirming(4)),
            config,
        )
        .unwrap();

        let id = session
            .submit(OperationKind::Receive { amount_msat: 50 })
            .unwrap();
        assert!(session.drain(Duration::from_secs(5)).await);

        // Zero retention: the first poll prunes, and the answer must come
        // from the on-disk record.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let status = session.poll(id).unwrap().unwrap();
        assert_eq!(status.state, OperationState::Confirmed { epoch: 4 });
        assert!(session.inner.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn balance_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        {
            let session = WalletSession::open(
                fed_id(),
                store.clone(),
                Arc::new(FakeConnector::confirming(2)),
                fast_config(),
            )
            .unwrap();
            let id = session
                .submit(OperationKind::Receive { amount_msat: 900 })
                .unwrap();
            settled(&session, id).await;
        }

        let reopened = WalletSession::open(
            fed_id(),
            store,
            Arc::new(FakeConnector::confirming(2)),
            fast_config(),
        )
        .unwrap();
        assert_eq!(reopened.balance().available_msat, 900);
        assert_eq!(reopened.balance().epoch, 2);
    }

    #[tokio::test]
    async fn join_confirms_without_balance_effect() {
        let session = open_session(Arc::new(FakeConnector::confirming(6)));
        let id = session.submit(OperationKind::Join).unwrap();
        let state = settled(&session, id).await;

        assert_eq!(state, OperationState::Confirmed { epoch: 6 });
        assert_eq!(session.balance().available_msat, 0);
        // The snapshot's epoch still advances with the confirmation.
        assert_eq!(session.balance().epoch, 6);
    }
}
