//! Error types for the supply engine.
//!
//! # Error Handling Patterns
//!
//! The supplier never retries anything: a demander that misses a batch
//! reissues its demand. Failures therefore split into three classes:
//!
//! - **Drop silently**: a stale-topology demand is simply ignored; the
//!   demander is already re-demanding at the new version.
//! - **Signal and continue**: a partition we no longer own becomes a
//!   `missed` marker in the outbound stream; an unresolvable deployment
//!   skips one entry.
//! - **Stop the turn**: a recipient that left the cluster ends the demand
//!   without further batches; an internal failure is logged at error level
//!   and never propagated to the bus.
//!
//! Conditions the original engine expressed as exceptions are explicit
//! variants here: [`SendOutcome`] for gone recipients and
//! [`ReserveOutcome`](super::traits::ReserveOutcome) for reservation.

use thiserror::Error;

/// Result type for supply operations.
pub type SupplyResult<T> = Result<T, SupplyError>;

/// Errors that can occur while supplying partitions.
#[derive(Debug, Error)]
pub enum SupplyError {
    /// The message bus failed for a reason other than the recipient
    /// leaving (timeout, serialization, transport fault).
    #[error("message bus send failed: {0}")]
    Bus(String),

    /// The overflow store failed to open a partition scan.
    #[error("overflow scan failed for partition {partition}: {reason}")]
    OverflowScan { partition: u32, reason: String },

    /// Closing an overflow iterator failed. Logged and swallowed during
    /// eviction; the eviction itself still completes.
    #[error("iterator close failed: {0}")]
    IteratorClose(String),

    /// Any other internal failure. Aborts the current demand; stored
    /// contexts are left for topology cleanup.
    #[error("internal supply failure: {0}")]
    Internal(String),
}

/// Outcome of one ordered bus send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The batch was acknowledged by the recipient.
    Delivered,
    /// The recipient has left the cluster. The sender stops its turn
    /// immediately; no further batches follow.
    RecipientGone,
}
