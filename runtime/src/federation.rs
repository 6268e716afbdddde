//! # Federation Descriptors
//!
//! Everything the runtime needs to know about a federation before it will
//! talk to one: an identifier, the guardian endpoints, and the quorum
//! threshold. The descriptor is deliberately dumb data — the consensus
//! protocol behind it is an opaque dependency reached over the connector,
//! and the runtime never second-guesses it.
//!
//! Descriptors arrive from the host either as JSON (serde) or as a compact
//! invite string suitable for QR codes and deep links:
//!
//! ```text
//! lumen1:<federation-id>:<threshold>:<url>[,<url>...]
//! ```
//!
//! The `lumen1` prefix is versioned so a future format bump doesn't have to
//! guess what it's parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invite string version prefix. Bump to `lumen2` on breaking format changes.
const INVITE_PREFIX: &str = "lumen1";

/// Expected hex length of a federation id (32-byte digest, hex-encoded).
const FEDERATION_ID_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a federation descriptor can be rejected.
///
/// All of these are validation failures: surfaced immediately, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// The federation id is not a 64-character hex string.
    #[error("invalid federation id: {0}")]
    InvalidId(String),

    /// A guardian endpoint failed validation (empty, or not http/https).
    #[error("invalid guardian endpoint: {0}")]
    InvalidEndpoint(String),

    /// The descriptor lists no guardians at all.
    #[error("descriptor has no guardian endpoints")]
    NoGuardians,

    /// The quorum threshold is zero or exceeds the guardian count.
    #[error("invalid quorum threshold {threshold} for {guardians} guardians")]
    InvalidThreshold { threshold: usize, guardians: usize },

    /// An invite string could not be parsed.
    #[error("malformed invite string: {0}")]
    MalformedInvite(String),
}

// ---------------------------------------------------------------------------
// FederationId
// ---------------------------------------------------------------------------

/// Opaque federation identifier.
///
/// On the wire this is the hex encoding of the federation's 32-byte config
/// digest. The runtime treats it as an opaque token — it is compared for
/// equality and logged, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FederationId(String);

impl FederationId {
    /// The format invariant, shared by [`parse`](Self::parse) and
    /// [`FederationDescriptor::validate`] — serde derives bypass `parse`,
    /// so a deserialized id must be re-checkable.
    fn check(s: &str) -> Result<(), DescriptorError> {
        if s.len() != FEDERATION_ID_HEX_LEN || hex::decode(s).is_err() {
            return Err(DescriptorError::InvalidId(s.to_string()));
        }
        Ok(())
    }

    /// Parse and validate a federation id from its hex form.
    pub fn parse(s: &str) -> Result<Self, DescriptorError> {
        Self::check(s)?;
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// The hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A shortened form for log lines (first 8 hex chars). Total even on a
    /// malformed id — log paths must never panic.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for FederationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// GuardianEndpoint
// ---------------------------------------------------------------------------

/// One guardian's API endpoint.
///
/// Only http/https URLs are accepted. The runtime does not resolve or probe
/// the endpoint at descriptor time — reachability is the connector's problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GuardianEndpoint(String);

impl GuardianEndpoint {
    /// The scheme invariant, shared by [`parse`](Self::parse) and
    /// [`FederationDescriptor::validate`] for the same reason as
    /// `FederationId::check`.
    fn check(url: &str) -> Result<(), DescriptorError> {
        let trimmed = url.trim();
        if trimmed.is_empty()
            || !(trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        {
            return Err(DescriptorError::InvalidEndpoint(url.to_string()));
        }
        Ok(())
    }

    /// Validate and wrap a guardian URL.
    pub fn parse(url: &str) -> Result<Self, DescriptorError> {
        Self::check(url)?;
        Ok(Self(url.trim().to_string()))
    }

    /// The endpoint URL.
    pub fn url(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GuardianEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// FederationDescriptor
// ---------------------------------------------------------------------------

/// A validated description of a federation: who to talk to and how many
/// guardians must agree before the runtime believes an answer.
///
/// Construct via [`FederationDescriptor::new`] or [`FederationDescriptor::from_invite`];
/// both enforce the invariants (non-empty guardian set, `1 <= threshold <= len`).
/// Deserialized descriptors must be re-checked with [`validate`](Self::validate)
/// before use — serde alone cannot enforce cross-field rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationDescriptor {
    /// The federation's opaque identifier.
    pub id: FederationId,

    /// Guardian API endpoints, in the order the federation published them.
    pub guardians: Vec<GuardianEndpoint>,

    /// Number of matching guardian responses required to accept a result.
    pub quorum_threshold: usize,
}

impl FederationDescriptor {
    /// Build a descriptor from parts, validating the invariants.
    pub fn new(
        id: FederationId,
        guardians: Vec<GuardianEndpoint>,
        quorum_threshold: usize,
    ) -> Result<Self, DescriptorError> {
        let descriptor = Self {
            id,
            guardians,
            quorum_threshold,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Re-check every invariant, field formats included.
    ///
    /// Needed after deserializing a descriptor from untrusted host input:
    /// serde constructs `FederationId` and `GuardianEndpoint` directly,
    /// bypassing their `parse` constructors, so this must re-run the same
    /// format checks — not just the cross-field rules.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        FederationId::check(&self.id.0)?;
        if self.guardians.is_empty() {
            return Err(DescriptorError::NoGuardians);
        }
        for guardian in &self.guardians {
            GuardianEndpoint::check(&guardian.0)?;
        }
        if self.quorum_threshold == 0 || self.quorum_threshold > self.guardians.len() {
            return Err(DescriptorError::InvalidThreshold {
                threshold: self.quorum_threshold,
                guardians: self.guardians.len(),
            });
        }
        Ok(())
    }

    /// Parse the compact invite form:
    /// `lumen1:<federation-id>:<threshold>:<url>[,<url>...]`.
    ///
    /// Guardian URLs may not contain `:`-separated fields of their own beyond
    /// the scheme, so the string is split into at most four segments and the
    /// remainder is treated as the URL list.
    pub fn from_invite(invite: &str) -> Result<Self, DescriptorError> {
        let mut parts = invite.trim().splitn(4, ':');

        let prefix = parts.next().unwrap_or_default();
        if prefix != INVITE_PREFIX {
            return Err(DescriptorError::MalformedInvite(format!(
                "expected prefix {INVITE_PREFIX}, got {prefix:?}"
            )));
        }

        let id = FederationId::parse(parts.next().unwrap_or_default())?;

        let threshold: usize = parts
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|_| DescriptorError::MalformedInvite("threshold not a number".into()))?;

        let urls = parts
            .next()
            .ok_or_else(|| DescriptorError::MalformedInvite("missing guardian list".into()))?;
        let guardians = urls
            .split(',')
            .map(GuardianEndpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(id, guardians, threshold)
    }

    /// Render the compact invite form.
    pub fn to_invite(&self) -> String {
        let urls: Vec<&str> = self.guardians.iter().map(|g| g.url()).collect();
        format!(
            "{INVITE_PREFIX}:{}:{}:{}",
            self.id,
            self.quorum_threshold,
            urls.join(",")
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
