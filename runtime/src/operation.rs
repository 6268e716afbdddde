//! # Operation Lifecycle
//!
//! Every user-initiated wallet action — send, receive, join — is tracked as
//! an [`Operation`] with an explicit state machine:
//!
//! ```text
//! Created → Submitted → AwaitingFederation → Confirmed
//!                                          ↘ Failed
//! ```
//!
//! Transitions are methods that consume the current state and return a
//! `Result`, so an illegal jump (say, `Created` straight to `Confirmed`) is
//! a compile-visible call that fails at runtime with [`TransitionError`] —
//! there is no ad-hoc status field to scribble on. Terminal states are
//! reached only from `AwaitingFederation` and never change afterwards: a
//! caller polling mid-flight always observes a valid intermediate state.
//!
//! Retries of transient federation errors happen *inside*
//! `AwaitingFederation` — the attempt counter bumps, the state does not
//! regress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// OperationId
// ---------------------------------------------------------------------------

/// Unique identifier for one operation. UUIDv4 — collision-free without
/// coordination, which matters because ids are minted on the caller's thread
/// before the session's driver ever sees the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Mint a fresh id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the canonical hyphenated form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// What the caller asked the wallet to do. Amounts are in millisatoshis.
///
/// Externally tagged on purpose: these records go through bincode for
/// persistence, which cannot handle internally tagged enums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Spend notes: debit this wallet in favor of `recipient`.
    Send { amount_msat: u64, recipient: String },

    /// Redeem incoming notes: credit this wallet.
    Receive { amount_msat: u64 },

    /// (Re-)affirm membership in the wallet's federation. No balance effect.
    Join,
}

impl OperationKind {
    /// Human-readable kind tag for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::Join => "join",
        }
    }
}

// ---------------------------------------------------------------------------
// FailureReason
// ---------------------------------------------------------------------------

/// Why an operation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The retry ceiling was exhausted without a federation answer.
    FederationUnresponsive { attempts: u32 },

    /// The federation stated the wallet lacks the funds. Never retried.
    InsufficientFunds,

    /// Any other protocol-level rejection, with the federation's stated
    /// reason verbatim. Never retried.
    Rejected { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FederationUnresponsive { attempts } => {
                write!(f, "federation unresponsive after {attempts} attempts")
            }
            Self::InsufficientFunds => write!(f, "insufficient funds"),
            Self::Rejected { detail } => write!(f, "rejected by federation: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationState
// ---------------------------------------------------------------------------

/// The tagged state of one operation. See the module docs for the diagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Validated and recorded, not yet handed to the connector.
    Created,

    /// Handed to the federation connector, first round not yet dispatched.
    Submitted,

    /// A federation round is outstanding. `attempt` counts dispatches,
    /// starting at 1; transient retries bump it without leaving this state.
    AwaitingFederation { attempt: u32 },

    /// Terminal: the federation confirmed the operation in `epoch`.
    Confirmed { epoch: u64 },

    /// Terminal: the operation will never complete.
    Failed { reason: FailureReason },
}

impl OperationState {
    /// True for `Confirmed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::Failed { .. })
    }

    /// Short tag for log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::AwaitingFederation { .. } => "awaiting_federation",
            Self::Confirmed { .. } => "confirmed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// An attempted state transition that the machine does not permit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal operation transition: {from} → {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One tracked wallet action: identity, intent, and current state.
///
/// The owning session is the only mutator; everyone else sees snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Stable identifier, minted at submit time.
    pub id: OperationId,

    /// The caller's intent.
    pub kind: OperationKind,

    /// Current state-machine position.
    pub state: OperationState,

    /// When the operation was created (UTC).
    pub created_at: DateTime<Utc>,

    /// When the state last changed (UTC).
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Record a new operation in `Created`.
    pub fn new(kind: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            kind,
            state: OperationState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// True once the operation can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// `Created → Submitted`.
    pub fn submit(&mut self) -> Result<(), TransitionError> {
        match self.state {
            OperationState::Created => {
                self.set_state(OperationState::Submitted);
                Ok(())
            }
            ref other => Err(illegal(other, "submitted")),
        }
    }

    /// `Submitted → AwaitingFederation{1}`, or bump the attempt counter for
    /// a retry while already awaiting.
    pub fn begin_round(&mut self) -> Result<u32, TransitionError> {
        match self.state {
            OperationState::Submitted => {
                self.set_state(OperationState::AwaitingFederation { attempt: 1 });
                Ok(1)
            }
            OperationState::AwaitingFederation { attempt } => {
                let next = attempt + 1;
                self.set_state(OperationState::AwaitingFederation { attempt: next });
                Ok(next)
            }
            ref other => Err(illegal(other, "awaiting_federation")),
        }
    }

    /// `AwaitingFederation → Confirmed`. The only path into `Confirmed`.
    pub fn confirm(&mut self, epoch: u64) -> Result<(), TransitionError> {
        match self.state {
            OperationState::AwaitingFederation { .. } => {
                self.set_state(OperationState::Confirmed { epoch });
                Ok(())
            }
            ref other => Err(illegal(other, "confirmed")),
        }
    }

    /// `AwaitingFederation → Failed`. The only path into `Failed`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        match self.state {
            OperationState::AwaitingFederation { .. } => {
                self.set_state(OperationState::Failed { reason });
                Ok(())
            }
            ref other => Err(illegal(other, "failed")),
        }
    }

    fn set_state(&mut self, state: OperationState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

fn illegal(from: &OperationState, to: &'static str) -> TransitionError {
    TransitionError {
        from: from.label(),
        to,
    }
}

// ---------------------------------------------------------------------------
// OperationStatus — external view
// ---------------------------------------------------------------------------

/// Plain-data status snapshot handed across the facade boundary on `poll`.
///
/// Mirrors [`OperationState`] but carries the id and kind label alongside,
/// so binding layers don't need a second lookup to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: OperationId,
    pub kind: String,
    pub state: OperationState,
    pub updated_at: DateTime<Utc>,
}

impl From<&Operation> for OperationStatus {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id,
            kind: op.kind.label().to_string(),
            state: op.state.clone(),
            updated_at: op.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
