#![warn(missing_docs)]
//! Host and guest sessions on top of an established data channel.

pub mod config;
pub mod coordinator;
mod event;
mod guest;
mod host;

pub use config::SessionConfig;
pub use coordinator::{after_round, check_hello, NextStep, PhaseMachine};
pub use event::SessionEvent;
pub use guest::GuestSession;
pub use host::{HostSession, RoundAdvance};

use tandem_core::SessionPhase;
use thiserror::Error;

/// Misuse of a session operation, or a fatal session condition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Local call would break the phase table.
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current phase.
        from: SessionPhase,
        /// Requested phase.
        to: SessionPhase,
    },
    /// Operation needs a different phase.
    #[error("operation requires {expected:?}, session is in {actual:?}")]
    WrongPhase {
        /// Phase the operation needs.
        expected: SessionPhase,
        /// Current phase.
        actual: SessionPhase,
    },
    /// Round cannot start yet.
    #[error("round not ready (sync acknowledged: {sync_acked}, peer ready: {peer_ready})")]
    NotReady {
        /// Whether the full sync completed.
        sync_acked: bool,
        /// Whether the peer sent ready.
        peer_ready: bool,
    },
    /// Guest has not applied the full sync for the current round.
    #[error("full sync for round {round} not applied yet")]
    SyncPending {
        /// Current round.
        round: u32,
    },
    /// Payload round does not follow the campaign.
    #[error("round {actual} does not follow, expected {expected}")]
    RoundMismatch {
        /// Round the campaign expects.
        expected: u32,
        /// Round supplied.
        actual: u32,
    },
    /// Chat text over the limit.
    #[error("chat message of {len} bytes exceeds {max}")]
    ChatTooLong {
        /// Text length.
        len: usize,
        /// Limit.
        max: usize,
    },
    /// Upgrade key empty or over the limit.
    #[error("invalid upgrade key")]
    InvalidUpgradeKey,
    /// Peer protocol differs.
    #[error("incompatible peer (version {version}, schema {schema_hash:016x})")]
    IncompatiblePeer {
        /// Peer version.
        version: u16,
        /// Peer schema hash.
        schema_hash: u64,
    },
    /// Payload could not be encoded.
    #[error("failed to encode payload: {0}")]
    Encode(String),
    /// Connection is gone.
    #[error("session disconnected")]
    Disconnected,
}
