// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Lumen Runtime — Multi-Wallet Federation Client
//!
//! Lumen is the client-side runtime that lets one process hold many
//! federated-mint wallets at once: each wallet bound to its own federation,
//! its own storage directory, and its own connector, with no shared fate
//! between them. A stalled federation slows exactly one wallet; everything
//! else keeps moving.
//!
//! The runtime is a library, not a daemon — it embeds into a host app
//! (mobile shell, CLI, bridge process) and exposes a plain-data facade the
//! host drives by handle.
//!
//! ## Architecture
//!
//! Modules mirror the layers a request passes through, top to bottom:
//!
//! - **facade** — The host-facing API: plain data in, plain data out, one
//!   tagged error type.
//! - **registry** — The handle table. Lifecycle, storage exclusivity, and
//!   nothing else.
//! - **session** — One live wallet: the operation drivers, the balance
//!   snapshot, the drain protocol.
//! - **operation** — The send/receive/join state machine. Terminal means
//!   terminal.
//! - **connector** — Guardian fan-out, quorum reconciliation, epoch
//!   tracking. JSON-RPC underneath.
//! - **federation** — Descriptors and invite strings. Dumb data, validated
//!   hard.
//! - **storage** — Per-wallet sled persistence with atomic batches.
//! - **config** — Every tunable, with defaults for flaky mobile links.
//! - **logging** — Optional tracing-subscriber setup for hosts that want it.
//!
//! ## Design Philosophy
//!
//! 1. Wallets never share mutable state. Isolation is the feature.
//! 2. The federation is the authority on money; the runtime is the
//!    authority on nothing but its own bookkeeping.
//! 3. A balance and the operation that produced it commit together or not
//!    at all.
//! 4. If it touches money, it has tests. Plural.

pub mod config;
pub mod connector;
pub mod facade;
pub mod federation;
pub mod logging;
pub mod operation;
pub mod registry;
pub mod session;
pub mod storage;

pub use config::RuntimeConfig;
pub use facade::{ErrorKind, Runtime, RuntimeError};
pub use federation::{FederationDescriptor, FederationId, GuardianEndpoint};
pub use operation::{FailureReason, OperationId, OperationKind, OperationState, OperationStatus};
pub use registry::{WalletHandle, WalletRecord, WalletStatus};
pub use session::BalanceSnapshot;
