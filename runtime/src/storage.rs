//! # Wallet Storage Backend
//!
//! Durable key-value persistence, scoped per wallet. Each wallet session
//! exclusively owns one store instance; stores are never shared between
//! wallets — that isolation is what lets sessions mutate their state without
//! looking over their shoulder.
//!
//! ## Contract
//!
//! The [`WalletStore`] trait is the minimal surface a session consumes:
//! point reads, point writes, and an atomic multi-key [`WriteBatch`]. The
//! batch is the load-bearing piece — an operation's terminal-state write and
//! the balance-snapshot write commit together or not at all, so no observer
//! ever sees a confirmed balance without the matching confirmed operation.
//!
//! ## Backends
//!
//! - [`SledStore`] — the production backend, one sled database per wallet
//!   directory. sled holds an exclusive file lock on its directory, so a
//!   second open of the same path fails rather than silently corrupting
//!   state.
//! - [`MemoryStore`] — a `HashMap` behind a `RwLock`, for unit tests.
//!
//! ## Key Layout
//!
//! | Key                 | Value                        |
//! |---------------------|------------------------------|
//! | `balance`           | `bincode(BalanceSnapshot)`   |
//! | `cursor`            | `u64` (8B BE)                |
//! | `op/<operation-id>` | `bincode(Operation)`         |
//!
//! Operation keys share the `op/` prefix so a prefix scan recovers the full
//! operation log on wallet startup.

use parking_lot::RwLock;
use sled::{Batch, Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::operation::OperationId;

/// Well-known key for the wallet's balance snapshot.
pub const KEY_BALANCE: &[u8] = b"balance";

/// Well-known key for the last-applied storage cursor.
pub const KEY_CURSOR: &[u8] = b"cursor";

/// Key prefix for persisted operations.
pub const OP_PREFIX: &[u8] = b"op/";

/// Build the storage key for an operation record.
pub fn operation_key(id: &OperationId) -> Vec<u8> {
    let mut key = Vec::with_capacity(OP_PREFIX.len() + 36);
    key.extend_from_slice(OP_PREFIX);
    key.extend_from_slice(id.to_string().as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be opened — bad path, permissions, or the
    /// directory is already locked by another store instance.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A read or write against an open store failed.
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    /// A record failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// WriteBatch
// ---------------------------------------------------------------------------

/// An ordered set of writes that commit atomically.
///
/// Build the batch, hand it to [`WalletStore::transaction`], and either every
/// entry lands or none do — on every exit path, success or failure.
#[derive(Debug, Default)]
pub struct WriteBatch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
    deletes: Vec<Vec<u8>>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key-value write.
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.puts.push((key.into(), value.into()));
        self
    }

    /// Queue a key deletion.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.deletes.push(key.into());
        self
    }

    /// True if the batch carries no writes.
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WalletStore trait
// ---------------------------------------------------------------------------

/// The key-value contract a wallet session consumes.
///
/// Implementations must be safe to call from the session's async task and
/// from `poll` on the caller's thread, hence `Send + Sync`.
pub trait WalletStore: Send + Sync {
    /// Read a value by key. `Ok(None)` means the key has never been written.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Write a single key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Commit a multi-key batch atomically.
    fn transaction(&self, batch: WriteBatch) -> StoreResult<()>;

    /// All key-value pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

// ---------------------------------------------------------------------------
// SledStore
// ---------------------------------------------------------------------------

/// Production store: one sled database per wallet directory.
///
/// All wallet records live in a single named tree (`wallet`) — the keyspace
/// is small enough that prefixes beat separate trees, and a sled [`Batch`]
/// is atomic only within one tree.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    tree: Tree,
}

impl SledStore {
    /// Open (or create) the store rooted at `path`.
    ///
    /// sled takes an exclusive lock on the directory; if another store — in
    /// this process or another — already holds it, this fails with
    /// [`StoreError::Unavailable`] instead of sharing state.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.as_ref().display())))?;
        let tree = db.open_tree("wallet")?;
        Ok(Self { db, tree })
    }

    /// In-memory store that vanishes on drop. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tree = db.open_tree("wallet")?;
        Ok(Self { db, tree })
    }

    /// Block until pending writes are durable on disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl WalletStore for SledStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|ivec| ivec.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn transaction(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut sled_batch = Batch::default();
        for (key, value) in batch.puts {
            sled_batch.insert(key, value);
        }
        for key in batch.deletes {
            sled_batch.remove(key);
        }
        self.tree.apply_batch(sled_batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory store for unit tests. Atomicity of `transaction` falls out of
/// holding the write lock for the whole batch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletStore for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn transaction(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut map = self.map.write();
        for (key, value) in batch.puts {
            map.insert(key, value);
        }
        for key in batch.deletes {
            map.remove(&key);
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read();
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
