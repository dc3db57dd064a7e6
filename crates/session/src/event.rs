//! Events surfaced to the application by host and guest sessions.

use tandem_core::{GameMode, InputKeys, Role, RoundOutcome, ScorePair, SessionPhase, SyncSummary};
use tandem_net::{DisconnectReason, MessageKind};

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Peer passed the version check.
    PeerHello {
        /// Peer protocol version.
        version: u16,
    },
    /// Local phase changed.
    PhaseChanged {
        /// Previous phase.
        from: SessionPhase,
        /// New phase.
        to: SessionPhase,
    },
    /// Host announced a mode.
    ModeSelected(GameMode),
    /// Guest applied a full sync.
    FullSyncApplied(SyncSummary),
    /// Host received a matching sync acknowledgement.
    SyncAcknowledged {
        /// Round the sync described.
        round: u32,
    },
    /// Round started.
    RoundStarted {
        /// Round index.
        round: u32,
    },
    /// Round finished.
    RoundEnded {
        /// Round index.
        round: u32,
        /// Verdict.
        outcome: RoundOutcome,
    },
    /// Guest was offered an upgrade.
    UpgradeOffered {
        /// Round just won.
        round: u32,
        /// Resources to spend.
        resources: u32,
    },
    /// Host received the guest's upgrade pick.
    UpgradeChosen {
        /// Upgrade identifier.
        key: String,
    },
    /// Peer signalled ready.
    PeerReady,
    /// Peer asked for (guest) or forced (host) a rematch.
    RematchRequested,
    /// Campaign finished.
    CampaignComplete {
        /// Final score.
        final_score: ScorePair,
    },
    /// Latest guest input.
    Keys(InputKeys),
    /// Chat line.
    Chat {
        /// Sender role.
        from: Role,
        /// Text.
        text: String,
    },
    /// Peer sent something invalid; the session continues.
    ProtocolViolation {
        /// Offending kind.
        kind: MessageKind,
        /// What was wrong.
        reason: &'static str,
    },
    /// Terminal.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
}

impl SessionEvent {
    /// Log key.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::PeerHello { .. } => "peer_hello",
            SessionEvent::PhaseChanged { .. } => "phase_changed",
            SessionEvent::ModeSelected(_) => "mode_selected",
            SessionEvent::FullSyncApplied(_) => "full_sync_applied",
            SessionEvent::SyncAcknowledged { .. } => "sync_acknowledged",
            SessionEvent::RoundStarted { .. } => "round_started",
            SessionEvent::RoundEnded { .. } => "round_ended",
            SessionEvent::UpgradeOffered { .. } => "upgrade_offered",
            SessionEvent::UpgradeChosen { .. } => "upgrade_chosen",
            SessionEvent::PeerReady => "peer_ready",
            SessionEvent::RematchRequested => "rematch_requested",
            SessionEvent::CampaignComplete { .. } => "campaign_complete",
            SessionEvent::Keys(_) => "keys",
            SessionEvent::Chat { .. } => "chat",
            SessionEvent::ProtocolViolation { .. } => "protocol_violation",
            SessionEvent::Disconnected { .. } => "disconnected",
        }
    }
}
