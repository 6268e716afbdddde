//! # Runtime Configuration
//!
//! Every tunable in the runtime lives here. Defaults are tuned for mobile
//! hosts talking to federations over flaky links: patient enough to ride
//! out a radio handover, bounded enough that nothing waits forever.

use std::time::Duration;

/// Tunable parameters shared by the registry and every wallet session.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long `close_wallet` waits for in-flight operations to drain
    /// before reporting `CloseTimedOut`. A timed-out close leaves the wallet
    /// visible as "closing" and keeps retrying in the background at this
    /// same interval.
    pub close_timeout: Duration,

    /// Attempt ceiling for one operation's federation rounds. Transient
    /// errors are retried until this many dispatches have failed; then the
    /// operation fails with `FederationUnresponsive`.
    pub max_federation_attempts: u32,

    /// Base delay for the exponential backoff between federation retries.
    /// Attempt `n` waits roughly `base * 2^(n-1)` (plus jitter), capped at
    /// `retry_backoff_cap`.
    pub retry_backoff_base: Duration,

    /// Upper bound on a single backoff sleep.
    pub retry_backoff_cap: Duration,

    /// Per-guardian HTTP request timeout for the default transport.
    pub request_timeout: Duration,

    /// How long a terminal operation stays in the session's in-memory
    /// pending set before being pruned. The on-disk record is kept
    /// indefinitely, so `poll` keeps answering from storage afterwards.
    pub operation_retention: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(30),
            max_federation_attempts: 4,
            retry_backoff_base: Duration::from_millis(250),
            retry_backoff_cap: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            operation_retention: Duration::from_secs(15 * 60),
        }
    }
}
