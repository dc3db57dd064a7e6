//! Reliable hand-off of a round description with acknowledgement and retry.

use crate::codec::digest_u64;
use std::time::{Duration, Instant};
use tandem_core::{FullSyncPayload, SyncSummary};
use tracing::{debug, warn};

/// Default number of resends after the first transmission.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default wait before the first resend; doubles on every resend.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Summarize a payload: round, entity counts and a digest of its encoding.
pub fn summarize(payload: &FullSyncPayload) -> Result<SyncSummary, postcard::Error> {
    let encoded = postcard::to_allocvec(payload)?;
    Ok(SyncSummary {
        round: payload.round,
        npc_count: payload.npcs.len() as u32,
        collectible_count: payload.collectibles.len() as u32,
        content_hash: digest_u64(blake3::hash(&encoded).as_bytes()),
    })
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullSyncConfig {
    /// Resends allowed after the first send.
    pub retry_budget: u32,
    /// Wait before the first resend.
    pub base_backoff: Duration,
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }
}

/// Action requested by [`FullSyncSender::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncAction {
    /// Nothing due.
    Idle,
    /// Send the payload again.
    Resend,
    /// Budget spent without a matching ack. Reported once.
    Exhausted,
}

/// Result of feeding the guest's acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Summary matched; the transfer is complete.
    Completed,
    /// Summary differs; the transfer stays pending.
    Mismatch,
    /// No transfer in flight.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Ready,
    Pending { resends: u32, next_at: Instant },
    Completed,
    Exhausted,
}

/// Host side of one full-sync transfer.
#[derive(Debug, Clone)]
pub struct FullSyncSender {
    payload: FullSyncPayload,
    summary: SyncSummary,
    config: FullSyncConfig,
    state: SyncState,
    sends: u32,
}

impl FullSyncSender {
    /// Prepare a transfer of `payload`.
    pub fn new(payload: FullSyncPayload, config: FullSyncConfig) -> Result<Self, postcard::Error> {
        let summary = summarize(&payload)?;
        Ok(Self {
            payload,
            summary,
            config,
            state: SyncState::Ready,
            sends: 0,
        })
    }

    /// Payload to transmit.
    pub fn payload(&self) -> &FullSyncPayload {
        &self.payload
    }

    /// Summary the guest must echo.
    pub fn summary(&self) -> SyncSummary {
        self.summary
    }

    /// Record the first transmission at `now`. The caller sends the payload.
    pub fn start(&mut self, now: Instant) {
        self.sends = 1;
        self.state = SyncState::Pending {
            resends: 0,
            next_at: now + self.config.base_backoff,
        };
        debug!(round = self.summary.round, "Full sync started");
    }

    /// Advance the retry timer.
    pub fn poll(&mut self, now: Instant) -> FullSyncAction {
        let SyncState::Pending { resends, next_at } = self.state else {
            return FullSyncAction::Idle;
        };
        if now < next_at {
            return FullSyncAction::Idle;
        }
        if resends >= self.config.retry_budget {
            warn!(
                round = self.summary.round,
                sends = self.sends,
                "Full sync unacknowledged, retry budget exhausted"
            );
            self.state = SyncState::Exhausted;
            return FullSyncAction::Exhausted;
        }

        let resends = resends + 1;
        self.sends += 1;
        self.state = SyncState::Pending {
            resends,
            next_at: now + self.config.base_backoff * 2u32.saturating_pow(resends),
        };
        debug!(round = self.summary.round, resends, "Resending full sync");
        FullSyncAction::Resend
    }

    /// Feed the guest's acknowledgement.
    pub fn on_ack(&mut self, summary: &SyncSummary) -> AckOutcome {
        if !matches!(self.state, SyncState::Pending { .. }) {
            return AckOutcome::Stale;
        }
        if *summary != self.summary {
            warn!(
                expected = ?self.summary,
                received = ?summary,
                "Full sync acknowledgement does not match"
            );
            return AckOutcome::Mismatch;
        }
        self.state = SyncState::Completed;
        debug!(round = summary.round, sends = self.sends, "Full sync acknowledged");
        AckOutcome::Completed
    }

    /// Whether a matching ack arrived.
    pub fn is_completed(&self) -> bool {
        self.state == SyncState::Completed
    }

    /// Whether the budget ran out.
    pub fn is_exhausted(&self) -> bool {
        self.state == SyncState::Exhausted
    }

    /// Transmissions so far, first send included.
    pub fn sends(&self) -> u32 {
        self.sends
    }
}
