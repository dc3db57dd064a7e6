//! Compact wire form for snapshots.
//!
//! Positional numerics (x, y, velocity, timers) become `i32` tenths, angles
//! become `i32` hundredths of a radian, and every enumerable field becomes its
//! `u8` tag. Lists turn into arrays of fixed-width tuples whose index is the
//! entity identity.

use serde::{Deserialize, Serialize};
use tandem_core::{
    ActiveEvent, ActorKind, ActorState, CollectibleKind, CollectibleState, EnvironmentTimers,
    EventKind, NpcKind, NpcState, ScorePair, SessionPhase, SimTick, Snapshot, TrafficState,
    VehicleState,
};
use thiserror::Error;

/// Scale for positions, velocities and timers.
pub const POSITION_SCALE: f32 = 10.0;

/// Scale for angles in radians.
pub const ANGLE_SCALE: f32 = 100.0;

/// Vehicle: `(x, y, angle, vx, vy, health)`.
pub type CompactVehicle = (i32, i32, i32, i32, i32, u8);
/// Actor: `(x, y, angle, kind, caught)`.
pub type CompactActor = (i32, i32, i32, u8, bool);
/// NPC: `(x, y, angle, kind, health)`.
pub type CompactNpc = (i32, i32, i32, u8, u8);
/// Collectible: `(x, y, kind, collected)`.
pub type CompactCollectible = (i32, i32, u8, bool);
/// Traffic car: `(x, y, angle)`.
pub type CompactTraffic = (i32, i32, i32);

/// Quantized snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactSnapshot {
    /// Host tick.
    pub tick: u64,
    /// Phase tag.
    pub phase: u8,
    /// Host vehicle.
    pub primary: CompactVehicle,
    /// Guest vehicle.
    pub secondary: Option<CompactVehicle>,
    /// Pursuer/pursued actor.
    pub actor: Option<CompactActor>,
    /// NPCs.
    pub npcs: Vec<CompactNpc>,
    /// Collectibles.
    pub collectibles: Vec<CompactCollectible>,
    /// Traffic.
    pub traffic: Vec<CompactTraffic>,
    /// `(round_time_left, event_time_left)`.
    pub timers: (i32, i32),
    /// `(host, guest)`.
    pub score: (u32, u32),
    /// `(kind, intensity)`.
    pub event: Option<(u8, u8)>,
}

/// Snapshot as carried in a `snapshot` message.
///
/// The variant is the format marker; decoders accept both and encoders emit
/// [`SnapshotWire::Compact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotWire {
    /// Uncompressed snapshot.
    Verbose(Snapshot),
    /// Quantized snapshot.
    Compact(CompactSnapshot),
}

impl SnapshotWire {
    /// List entities carried, for limit checks before decoding.
    pub fn entity_count(&self) -> usize {
        match self {
            SnapshotWire::Verbose(snapshot) => snapshot.entity_count(),
            SnapshotWire::Compact(compact) => {
                compact.npcs.len() + compact.collectibles.len() + compact.traffic.len()
            }
        }
    }
}

/// Compact snapshot decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotDecodeError {
    /// An enumerable field carried a tag outside its table.
    #[error("unknown {field} tag {tag}")]
    UnknownTag {
        /// Field being decoded.
        field: &'static str,
        /// Offending tag.
        tag: u8,
    },
}

fn quantize(value: f32, scale: f32) -> i32 {
    // `as` saturates and maps NaN to zero
    (value * scale).round() as i32
}

fn dequantize(value: i32, scale: f32) -> f32 {
    value as f32 / scale
}

fn pos(value: f32) -> i32 {
    quantize(value, POSITION_SCALE)
}

fn unpos(value: i32) -> f32 {
    dequantize(value, POSITION_SCALE)
}

fn ang(value: f32) -> i32 {
    quantize(value, ANGLE_SCALE)
}

fn unang(value: i32) -> f32 {
    dequantize(value, ANGLE_SCALE)
}

fn tag<T>(field: &'static str, tag: u8, decode: fn(u8) -> Option<T>) -> Result<T, SnapshotDecodeError> {
    decode(tag).ok_or(SnapshotDecodeError::UnknownTag { field, tag })
}

fn compact_vehicle(v: &VehicleState) -> CompactVehicle {
    (pos(v.x), pos(v.y), ang(v.angle), pos(v.vx), pos(v.vy), v.health)
}

fn expand_vehicle(v: CompactVehicle) -> VehicleState {
    VehicleState {
        x: unpos(v.0),
        y: unpos(v.1),
        angle: unang(v.2),
        vx: unpos(v.3),
        vy: unpos(v.4),
        health: v.5,
    }
}

/// Quantize a snapshot into its wire form.
pub fn compress(snapshot: &Snapshot) -> CompactSnapshot {
    CompactSnapshot {
        tick: snapshot.tick.0,
        phase: snapshot.phase.as_u8(),
        primary: compact_vehicle(&snapshot.primary),
        secondary: snapshot.secondary.as_ref().map(compact_vehicle),
        actor: snapshot
            .actor
            .map(|a| (pos(a.x), pos(a.y), ang(a.angle), a.kind.as_u8(), a.caught)),
        npcs: snapshot
            .npcs
            .iter()
            .map(|n| (pos(n.x), pos(n.y), ang(n.angle), n.kind.as_u8(), n.health))
            .collect(),
        collectibles: snapshot
            .collectibles
            .iter()
            .map(|c| (pos(c.x), pos(c.y), c.kind.as_u8(), c.collected))
            .collect(),
        traffic: snapshot
            .traffic
            .iter()
            .map(|t| (pos(t.x), pos(t.y), ang(t.angle)))
            .collect(),
        timers: (
            pos(snapshot.timers.round_time_left),
            pos(snapshot.timers.event_time_left),
        ),
        score: (snapshot.score.host, snapshot.score.guest),
        event: snapshot.event.map(|e| (e.kind.as_u8(), e.intensity)),
    }
}

/// Rebuild a snapshot from its quantized form.
pub fn expand(compact: &CompactSnapshot) -> Result<Snapshot, SnapshotDecodeError> {
    let actor = match compact.actor {
        Some((x, y, angle, kind, caught)) => Some(ActorState {
            x: unpos(x),
            y: unpos(y),
            angle: unang(angle),
            kind: tag("actor kind", kind, ActorKind::from_u8)?,
            caught,
        }),
        None => None,
    };

    let npcs = compact
        .npcs
        .iter()
        .map(|&(x, y, angle, kind, health)| {
            Ok(NpcState {
                x: unpos(x),
                y: unpos(y),
                angle: unang(angle),
                kind: tag("npc kind", kind, NpcKind::from_u8)?,
                health,
            })
        })
        .collect::<Result<Vec<_>, SnapshotDecodeError>>()?;

    let collectibles = compact
        .collectibles
        .iter()
        .map(|&(x, y, kind, collected)| {
            Ok(CollectibleState {
                x: unpos(x),
                y: unpos(y),
                kind: tag("collectible kind", kind, CollectibleKind::from_u8)?,
                collected,
            })
        })
        .collect::<Result<Vec<_>, SnapshotDecodeError>>()?;

    let event = match compact.event {
        Some((kind, intensity)) => Some(ActiveEvent {
            kind: tag("event kind", kind, EventKind::from_u8)?,
            intensity,
        }),
        None => None,
    };

    Ok(Snapshot {
        tick: SimTick(compact.tick),
        phase: tag("phase", compact.phase, SessionPhase::from_u8)?,
        primary: expand_vehicle(compact.primary),
        secondary: compact.secondary.map(expand_vehicle),
        actor,
        npcs,
        collectibles,
        traffic: compact
            .traffic
            .iter()
            .map(|&(x, y, angle)| TrafficState {
                x: unpos(x),
                y: unpos(y),
                angle: unang(angle),
            })
            .collect(),
        timers: EnvironmentTimers {
            round_time_left: unpos(compact.timers.0),
            event_time_left: unpos(compact.timers.1),
        },
        score: ScorePair {
            host: compact.score.0,
            guest: compact.score.1,
        },
        event,
    })
}

/// Encode a snapshot for transmission (always compact).
pub fn encode_snapshot(snapshot: &Snapshot) -> SnapshotWire {
    SnapshotWire::Compact(compress(snapshot))
}

/// Decode either wire form.
pub fn decode_snapshot(wire: &SnapshotWire) -> Result<Snapshot, SnapshotDecodeError> {
    match wire {
        SnapshotWire::Verbose(snapshot) => Ok(snapshot.clone()),
        SnapshotWire::Compact(compact) => expand(compact),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 0.1;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new(
            SimTick(901),
            SessionPhase::Playing,
            VehicleState {
                x: 123.456,
                y: -78.91,
                angle: 6.1,
                vx: 3.33,
                vy: -0.04,
                health: 87,
            },
        );
        snapshot.secondary = Some(VehicleState {
            x: 10.0,
            y: 20.05,
            angle: -0.7854,
            vx: 0.0,
            vy: 1.5,
            health: 100,
        });
        snapshot.actor = Some(ActorState {
            x: 55.55,
            y: 44.44,
            angle: 3.14159,
            kind: ActorKind::Pursuer,
            caught: true,
        });
        snapshot.npcs = vec![
            NpcState {
                x: 1.01,
                y: 2.02,
                angle: 0.5,
                kind: NpcKind::Guard,
                health: 3,
            },
            NpcState {
                x: -300.26,
                y: 0.0,
                angle: 12.5,
                kind: NpcKind::Drone,
                health: 0,
            },
        ];
        snapshot.collectibles = vec![CollectibleState {
            x: 9.99,
            y: 8.88,
            kind: CollectibleKind::Part,
            collected: true,
        }];
        snapshot.traffic = vec![TrafficState {
            x: 400.04,
            y: 12.0,
            angle: -2.2,
        }];
        snapshot.timers = EnvironmentTimers {
            round_time_left: 59.97,
            event_time_left: 4.2,
        };
        snapshot.score = ScorePair { host: 1200, guest: 950 };
        snapshot.event = Some(ActiveEvent {
            kind: EventKind::Storm,
            intensity: 200,
        });
        snapshot
    }

    fn close(a: f32, b: f32) {
        assert!((a - b).abs() <= EPSILON, "{a} vs {b}");
    }

    #[test]
    fn compact_preserves_numerics_within_epsilon() {
        let original = sample();
        let decoded = decode_snapshot(&encode_snapshot(&original)).expect("decode");

        close(decoded.primary.x, original.primary.x);
        close(decoded.primary.y, original.primary.y);
        close(decoded.primary.angle, original.primary.angle);
        close(decoded.primary.vx, original.primary.vx);
        close(decoded.primary.vy, original.primary.vy);
        let (a, b) = (decoded.secondary.expect("secondary"), original.secondary.expect("secondary"));
        close(a.y, b.y);
        close(a.angle, b.angle);
        for (a, b) in decoded.npcs.iter().zip(&original.npcs) {
            close(a.x, b.x);
            close(a.y, b.y);
            close(a.angle, b.angle);
        }
        close(decoded.traffic[0].x, original.traffic[0].x);
        close(decoded.timers.round_time_left, original.timers.round_time_left);
        close(decoded.timers.event_time_left, original.timers.event_time_left);
    }

    #[test]
    fn compact_preserves_discrete_fields_exactly() {
        let original = sample();
        let decoded = decode_snapshot(&encode_snapshot(&original)).expect("decode");

        assert_eq!(decoded.tick, original.tick);
        assert_eq!(decoded.phase, original.phase);
        assert_eq!(decoded.primary.health, 87);
        assert_eq!(decoded.npcs.len(), 2);
        assert_eq!(decoded.npcs[1].kind, NpcKind::Drone);
        assert_eq!(decoded.npcs[0].health, 3);
        assert_eq!(decoded.collectibles[0].kind, CollectibleKind::Part);
        assert!(decoded.collectibles[0].collected);
        let actor = decoded.actor.expect("actor");
        assert_eq!(actor.kind, ActorKind::Pursuer);
        assert!(actor.caught);
        assert_eq!(decoded.score, original.score);
        assert_eq!(decoded.event, original.event);
    }

    #[test]
    fn angles_are_not_wrapped() {
        let original = sample();
        let decoded = decode_snapshot(&encode_snapshot(&original)).expect("decode");
        // 12.5 rad stays 12.5 rad, not 12.5 - 2π
        close(decoded.npcs[1].angle, 12.5);
    }

    #[test]
    fn verbose_form_is_accepted() {
        let original = sample();
        let decoded = decode_snapshot(&SnapshotWire::Verbose(original.clone())).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut compact = compress(&sample());
        compact.npcs[0].3 = 42;
        assert_eq!(
            expand(&compact),
            Err(SnapshotDecodeError::UnknownTag {
                field: "npc kind",
                tag: 42
            })
        );

        let mut compact = compress(&sample());
        compact.phase = 9;
        assert!(matches!(
            expand(&compact),
            Err(SnapshotDecodeError::UnknownTag { field: "phase", .. })
        ));
    }

    #[test]
    fn compact_is_smaller_on_the_wire() {
        let original = sample();
        let verbose = postcard::to_allocvec(&SnapshotWire::Verbose(original.clone())).expect("ser");
        let compact = postcard::to_allocvec(&encode_snapshot(&original)).expect("ser");
        assert!(compact.len() < verbose.len());
    }
}
