//! Session phase transition table and round branching.

use crate::SessionError;
use tandem_core::{RoundOutcome, SessionPhase};
use tandem_net::{compute_schema_hash, PROTOCOL_VERSION};
use tracing::{debug, warn};

/// Whether `from → to` is a legal phase transition.
pub fn is_legal(from: SessionPhase, to: SessionPhase) -> bool {
    use SessionPhase::*;
    matches!(
        (from, to),
        (_, Lobby)
            | (Lobby, ModeSelect)
            | (ModeSelect, ModeSelect)
            | (ModeSelect, Briefing)
            | (Briefing, Playing)
            | (Playing, RoundEnd)
            | (RoundEnd, Upgrade)
            | (RoundEnd, Briefing)
            | (Upgrade, Briefing)
    )
}

/// Current phase guarded by the transition table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseMachine {
    phase: SessionPhase,
}

impl PhaseMachine {
    /// Machine in the lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to `to`, or fail with [`SessionError::InvalidTransition`].
    pub fn transition(&mut self, to: SessionPhase) -> Result<SessionPhase, SessionError> {
        let from = self.phase;
        if !is_legal(from, to) {
            return Err(SessionError::InvalidTransition { from, to });
        }
        self.phase = to;
        debug!(from = from.as_str(), to = to.as_str(), "Phase transition");
        Ok(from)
    }

    /// Adopt a phase announced by the peer, logging when it breaks the table.
    pub fn follow(&mut self, to: SessionPhase) -> SessionPhase {
        let from = self.phase;
        if !is_legal(from, to) {
            warn!(from = from.as_str(), to = to.as_str(), "Peer announced an illegal transition");
        }
        self.phase = to;
        from
    }
}

/// What follows a finished round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Spend resources, then brief the next round.
    Upgrade,
    /// Last round won; the campaign is over.
    CampaignComplete,
    /// Round lost; brief the same round again.
    RetryRound,
}

/// Branch on a round outcome.
pub fn after_round(outcome: RoundOutcome, round: u32, campaign_rounds: u32) -> NextStep {
    match outcome {
        RoundOutcome::Failure => NextStep::RetryRound,
        RoundOutcome::Success if round >= campaign_rounds => NextStep::CampaignComplete,
        RoundOutcome::Success => NextStep::Upgrade,
    }
}

/// Validate the peer's `hello`.
pub fn check_hello(version: u16, schema_hash: u64) -> Result<(), SessionError> {
    if version != PROTOCOL_VERSION || schema_hash != compute_schema_hash() {
        return Err(SessionError::IncompatiblePeer {
            version,
            schema_hash,
        });
    }
    Ok(())
}
