//! Protocol message definitions for host-guest communication.
//!
//! All messages use postcard serialization for compact binary encoding. Every
//! frame carries one [`Envelope`]; the payload variant determines the
//! [`MessageKind`] and therefore its delivery class and legal direction.

use crate::snapshot_codec::SnapshotWire;
use serde::{Deserialize, Serialize};
use tandem_core::{FullSyncPayload, GameMode, InputKeys, Role, RoundOutcome, ScorePair, SyncSummary};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Preamble written by the dialing side when it opens the data stream.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"TNDM\x00\x01\x00\x00";

/// Maximum length of a chat message (bytes).
pub const MAX_CHAT_LEN: usize = 256;

/// Maximum length of an upgrade key.
pub const MAX_UPGRADE_KEY_LEN: usize = 32;

/// Maximum list entities (NPCs + collectibles + traffic) per snapshot.
pub const MAX_SNAPSHOT_ENTITIES: usize = 512;

/// Maximum static obstacles in a level layout.
pub const MAX_LAYOUT_OBSTACLES: usize = 1024;

/// Wire identifier of a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Version and schema exchange.
    Hello = 0,
    /// Guest input bitmask.
    Keys = 1,
    /// Authoritative state slice.
    Snapshot = 2,
    /// Complete round description.
    FullSync = 3,
    /// Guest acknowledgement of a full sync.
    SyncAck = 4,
    /// Round begins.
    Start = 5,
    /// Pre-round briefing.
    Briefing = 6,
    /// Upgrade phase offer.
    Upgrade = 7,
    /// Guest upgrade pick.
    UpgradeChoice = 8,
    /// Peer is ready to proceed.
    Ready = 9,
    /// Host announces the game mode.
    ModeSelect = 10,
    /// Return to lobby for a new campaign.
    Rematch = 11,
    /// Heartbeat probe.
    Ping = 12,
    /// Heartbeat reply.
    Pong = 13,
    /// Free-form text.
    Chat = 14,
    /// Round finished with an outcome.
    RoundEnd = 15,
    /// Campaign complete, back to lobby.
    Lobby = 16,
}

/// How the connection manager treats a message kind under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryClass {
    /// Always sent; retried once on a transient failure.
    Critical,
    /// Dropped when the outbound buffer is congested.
    BestEffort,
    /// Liveness traffic; never dropped by backpressure.
    Heartbeat,
}

/// Which peer may send a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host sends, guest receives.
    HostToGuest,
    /// Guest sends, host receives.
    GuestToHost,
    /// Either peer.
    Both,
}

impl Direction {
    /// Whether a peer playing `role` may legitimately receive this direction.
    pub fn receivable_by(self, role: Role) -> bool {
        match self {
            Direction::Both => true,
            Direction::HostToGuest => role == Role::Guest,
            Direction::GuestToHost => role == Role::Host,
        }
    }
}

impl MessageKind {
    /// Every kind in tag order.
    pub const ALL: [MessageKind; 17] = [
        MessageKind::Hello,
        MessageKind::Keys,
        MessageKind::Snapshot,
        MessageKind::FullSync,
        MessageKind::SyncAck,
        MessageKind::Start,
        MessageKind::Briefing,
        MessageKind::Upgrade,
        MessageKind::UpgradeChoice,
        MessageKind::Ready,
        MessageKind::ModeSelect,
        MessageKind::Rematch,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Chat,
        MessageKind::RoundEnd,
        MessageKind::Lobby,
    ];

    /// Stable tag byte.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Decode a tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    /// Delivery class for this kind.
    pub const fn delivery(self) -> DeliveryClass {
        match self {
            MessageKind::Snapshot | MessageKind::Keys => DeliveryClass::BestEffort,
            MessageKind::Ping | MessageKind::Pong => DeliveryClass::Heartbeat,
            _ => DeliveryClass::Critical,
        }
    }

    /// Legal sending direction.
    pub const fn direction(self) -> Direction {
        match self {
            MessageKind::Keys | MessageKind::SyncAck | MessageKind::UpgradeChoice => {
                Direction::GuestToHost
            }
            MessageKind::Snapshot
            | MessageKind::FullSync
            | MessageKind::Start
            | MessageKind::Briefing
            | MessageKind::Upgrade
            | MessageKind::ModeSelect
            | MessageKind::RoundEnd
            | MessageKind::Lobby => Direction::HostToGuest,
            MessageKind::Hello
            | MessageKind::Ready
            | MessageKind::Rematch
            | MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::Chat => Direction::Both,
        }
    }

    /// Log key.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "hello",
            MessageKind::Keys => "keys",
            MessageKind::Snapshot => "snapshot",
            MessageKind::FullSync => "fullSync",
            MessageKind::SyncAck => "syncAck",
            MessageKind::Start => "start",
            MessageKind::Briefing => "briefing",
            MessageKind::Upgrade => "upgrade",
            MessageKind::UpgradeChoice => "upgradeChoice",
            MessageKind::Ready => "ready",
            MessageKind::ModeSelect => "modeSelect",
            MessageKind::Rematch => "rematch",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Chat => "chat",
            MessageKind::RoundEnd => "roundEnd",
            MessageKind::Lobby => "lobby",
        }
    }
}

/// Heartbeat body shared by ping and pong; a pong echoes its ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Ping counter of the original sender.
    pub sequence: u32,
    /// Original sender's session clock when the ping left (ms).
    pub timestamp_ms: u64,
}

/// Message payloads, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Version handshake.
    Hello {
        /// Protocol version.
        version: u16,
        /// Schema hash for compatibility.
        schema_hash: u64,
    },
    /// Guest input.
    Keys(InputKeys),
    /// Compact snapshot on the wire.
    Snapshot(SnapshotWire),
    /// Round description.
    FullSync(Box<FullSyncPayload>),
    /// Guest summary of the applied full sync.
    SyncAck(SyncSummary),
    /// Round begins.
    Start {
        /// Round index.
        round: u32,
    },
    /// Briefing for a round.
    Briefing {
        /// Round index.
        round: u32,
    },
    /// Upgrade offer after a successful round.
    Upgrade {
        /// Round just completed.
        round: u32,
        /// Resources available to spend.
        resources: u32,
    },
    /// Guest upgrade pick.
    UpgradeChoice {
        /// Upgrade identifier.
        key: String,
    },
    /// Ready signal.
    Ready,
    /// Game mode announcement.
    ModeSelect {
        /// Selected mode.
        mode: GameMode,
    },
    /// Rematch request or reset.
    Rematch,
    /// Heartbeat probe.
    Ping(Heartbeat),
    /// Heartbeat reply.
    Pong(Heartbeat),
    /// Chat text.
    Chat {
        /// Message text.
        text: String,
    },
    /// Round outcome.
    RoundEnd {
        /// Round index.
        round: u32,
        /// Host simulation's verdict.
        outcome: RoundOutcome,
    },
    /// Campaign complete.
    Lobby {
        /// Score at the end of the campaign.
        final_score: ScorePair,
    },
}

impl Payload {
    /// Kind tag for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Hello { .. } => MessageKind::Hello,
            Payload::Keys(_) => MessageKind::Keys,
            Payload::Snapshot(_) => MessageKind::Snapshot,
            Payload::FullSync(_) => MessageKind::FullSync,
            Payload::SyncAck(_) => MessageKind::SyncAck,
            Payload::Start { .. } => MessageKind::Start,
            Payload::Briefing { .. } => MessageKind::Briefing,
            Payload::Upgrade { .. } => MessageKind::Upgrade,
            Payload::UpgradeChoice { .. } => MessageKind::UpgradeChoice,
            Payload::Ready => MessageKind::Ready,
            Payload::ModeSelect { .. } => MessageKind::ModeSelect,
            Payload::Rematch => MessageKind::Rematch,
            Payload::Ping(_) => MessageKind::Ping,
            Payload::Pong(_) => MessageKind::Pong,
            Payload::Chat { .. } => MessageKind::Chat,
            Payload::RoundEnd { .. } => MessageKind::RoundEnd,
            Payload::Lobby { .. } => MessageKind::Lobby,
        }
    }

    /// Verify message limits and validity.
    ///
    /// Called on every received message; a failure is a protocol violation.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            Payload::Chat { text } => {
                if text.len() > MAX_CHAT_LEN {
                    return Err("Chat message too long");
                }
            }
            Payload::UpgradeChoice { key } => {
                if key.is_empty() {
                    return Err("Empty upgrade key");
                }
                if key.len() > MAX_UPGRADE_KEY_LEN {
                    return Err("Upgrade key too long");
                }
            }
            Payload::Snapshot(wire) => {
                if wire.entity_count() > MAX_SNAPSHOT_ENTITIES {
                    return Err("Too many snapshot entities");
                }
            }
            Payload::FullSync(sync) => {
                if sync.round == 0 {
                    return Err("Full sync for round zero");
                }
                if sync.npcs.len() + sync.collectibles.len() > MAX_SNAPSHOT_ENTITIES
                    || sync.initial.entity_count() > MAX_SNAPSHOT_ENTITIES
                {
                    return Err("Too many full sync entities");
                }
                if sync.layout.obstacles.len() > MAX_LAYOUT_OBSTACLES {
                    return Err("Too many layout obstacles");
                }
            }
            Payload::Start { round } | Payload::Briefing { round } if *round == 0 => {
                return Err("Round index must start at 1");
            }
            _ => {}
        }
        Ok(())
    }
}

/// One framed message: `{kind, sequence, timestamp, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-sender monotonically increasing counter.
    pub sequence: u32,
    /// Milliseconds since the sender's session start.
    pub timestamp_ms: u64,
    /// Message body.
    pub payload: Payload,
}

impl Envelope {
    /// Kind tag derived from the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Verify the payload.
    pub fn verify(&self) -> Result<(), &'static str> {
        self.payload.verify()
    }
}
