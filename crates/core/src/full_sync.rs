//! Complete round description sent reliably at phase boundaries.

use crate::snapshot::{CollectibleKind, NpcKind, ScorePair, Snapshot};
use crate::GameMode;
use serde::{Deserialize, Serialize};

/// Static rectangular obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
}

/// Static level layout for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelLayout {
    /// Arena width.
    pub width: f32,
    /// Arena height.
    pub height: f32,
    /// Seed used by the host to generate decoration.
    pub seed: u64,
    /// Static obstacles.
    pub obstacles: Vec<Obstacle>,
}

/// NPC spawn; its index fixes the NPC's position in every later snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NpcSpawn {
    /// Archetype.
    pub kind: NpcKind,
    /// Spawn X.
    pub x: f32,
    /// Spawn Y.
    pub y: f32,
    /// Spawn heading.
    pub angle: f32,
}

/// Collectible spawn; positional like [`NpcSpawn`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectibleSpawn {
    /// Archetype.
    pub kind: CollectibleKind,
    /// X position.
    pub x: f32,
    /// Y position.
    pub y: f32,
}

/// Everything the guest needs to rebuild a round from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncPayload {
    /// Round index, starting at 1.
    pub round: u32,
    /// Active game mode.
    pub mode: GameMode,
    /// Static layout.
    pub layout: LevelLayout,
    /// NPC spawn list.
    pub npcs: Vec<NpcSpawn>,
    /// Collectible spawn list.
    pub collectibles: Vec<CollectibleSpawn>,
    /// Score carried into the round.
    pub score: ScorePair,
    /// State at the first tick of the round.
    pub initial: Snapshot,
}

/// Content summary the guest returns in `syncAck`.
///
/// The host compares it field by field with its own summary of the payload to
/// catch gross mismatches (wrong round, truncated lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Round the payload described.
    pub round: u32,
    /// NPC spawns applied.
    pub npc_count: u32,
    /// Collectible spawns applied.
    pub collectible_count: u32,
    /// Digest of the encoded payload.
    pub content_hash: u64,
}
