//! Point-in-time slice of host simulation state.
//!
//! A [`Snapshot`] holds everything the guest needs to render one frame. Entity
//! lists are positional: index `i` always refers to the same entity for the
//! lifetime of a round, as established by the round's full sync.

use crate::{SessionPhase, SimTick};
use serde::{Deserialize, Serialize};

wire_tag! {
    /// Role of the optional pursuer/pursued actor.
    pub enum ActorKind {
        /// Chases a vehicle.
        Pursuer = 0 => "pursuer",
        /// Is being chased.
        Pursued = 1 => "pursued",
    }
}

wire_tag! {
    /// Mobile NPC archetype.
    pub enum NpcKind {
        /// Slow, wanders.
        Pedestrian = 0 => "pedestrian",
        /// Patrols a route.
        Guard = 1 => "guard",
        /// Fast, flies over obstacles.
        Drone = 2 => "drone",
    }
}

wire_tag! {
    /// Collectible archetype.
    pub enum CollectibleKind {
        /// Score pickup.
        Coin = 0 => "coin",
        /// Refuels the vehicle.
        Fuel = 1 => "fuel",
        /// Upgrade material.
        Part = 2 => "part",
    }
}

wire_tag! {
    /// Environment event currently affecting the round.
    pub enum EventKind {
        /// Reduced traction.
        Storm = 0 => "storm",
        /// Reduced visibility.
        Blackout = 1 => "blackout",
        /// Dense traffic.
        Rush = 2 => "rush",
    }
}

/// Kinematics of a player vehicle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// World X position.
    pub x: f32,
    /// World Y position.
    pub y: f32,
    /// Heading in radians (not wrapped).
    pub angle: f32,
    /// X velocity.
    pub vx: f32,
    /// Y velocity.
    pub vy: f32,
    /// Remaining health.
    pub health: u8,
}

/// Pursuer/pursued actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    /// World X position.
    pub x: f32,
    /// World Y position.
    pub y: f32,
    /// Heading in radians.
    pub angle: f32,
    /// Actor role.
    pub kind: ActorKind,
    /// Set once the chase has been decided.
    pub caught: bool,
}

/// Mobile NPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NpcState {
    /// World X position.
    pub x: f32,
    /// World Y position.
    pub y: f32,
    /// Heading in radians.
    pub angle: f32,
    /// Archetype.
    pub kind: NpcKind,
    /// Remaining health.
    pub health: u8,
}

/// Collectible pickup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CollectibleState {
    /// World X position.
    pub x: f32,
    /// World Y position.
    pub y: f32,
    /// Archetype.
    pub kind: CollectibleKind,
    /// Whether a player already picked it up.
    pub collected: bool,
}

/// Background traffic car.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficState {
    /// World X position.
    pub x: f32,
    /// World Y position.
    pub y: f32,
    /// Heading in radians.
    pub angle: f32,
}

/// Countdown timers only the host decrements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentTimers {
    /// Seconds left in the round.
    pub round_time_left: f32,
    /// Seconds left in the active event (0 when none).
    pub event_time_left: f32,
}

/// Host and guest scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScorePair {
    /// Host player score.
    pub host: u32,
    /// Guest player score.
    pub guest: u32,
}

/// Descriptor of the active environment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEvent {
    /// Event archetype.
    pub kind: EventKind,
    /// Strength, 0-255.
    pub intensity: u8,
}

/// Authoritative host state at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Host tick this snapshot was captured at.
    pub tick: SimTick,
    /// Screen phase the host is showing.
    pub phase: SessionPhase,
    /// Host player vehicle.
    pub primary: VehicleState,
    /// Guest player vehicle, when the mode has one.
    pub secondary: Option<VehicleState>,
    /// Pursuer or pursued actor, when the mode has one.
    pub actor: Option<ActorState>,
    /// Mobile NPCs, positional.
    pub npcs: Vec<NpcState>,
    /// Collectibles, positional.
    pub collectibles: Vec<CollectibleState>,
    /// Background traffic, positional.
    pub traffic: Vec<TrafficState>,
    /// Environment countdowns.
    pub timers: EnvironmentTimers,
    /// Current score.
    pub score: ScorePair,
    /// Active environment event.
    pub event: Option<ActiveEvent>,
}

impl Snapshot {
    /// Empty snapshot at `tick` with only the primary vehicle.
    pub fn new(tick: SimTick, phase: SessionPhase, primary: VehicleState) -> Self {
        Self {
            tick,
            phase,
            primary,
            secondary: None,
            actor: None,
            npcs: Vec::new(),
            collectibles: Vec::new(),
            traffic: Vec::new(),
            timers: EnvironmentTimers::default(),
            score: ScorePair::default(),
            event: None,
        }
    }

    /// Number of list entities carried (NPCs + collectibles + traffic).
    pub fn entity_count(&self) -> usize {
        self.npcs.len() + self.collectibles.len() + self.traffic.len()
    }
}
