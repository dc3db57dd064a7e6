//! Guest-side smoothing between the two most recent host snapshots.
//!
//! Only a previous/current pair is kept: a new snapshot demotes current to
//! previous and replaces it. Continuous fields blend, discrete fields snap to
//! the current snapshot.

use std::f32::consts::{PI, TAU};
use std::time::{Duration, Instant};
use tandem_core::{ActorState, NpcState, Snapshot, TrafficState, VehicleState};

/// Default spacing between host snapshots (20 Hz).
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(50);

/// Linear interpolation. `t <= 0` yields `a` and `t >= 1` yields `b` exactly.
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    if t <= 0.0 {
        a
    } else if t >= 1.0 {
        b
    } else {
        a + (b - a) * t
    }
}

/// Signed shortest rotation from `from` to `to`, in `(-π, π]`.
pub fn shortest_angle_delta(from: f32, to: f32) -> f32 {
    let delta = (to - from).rem_euclid(TAU);
    if delta > PI {
        delta - TAU
    } else {
        delta
    }
}

/// Interpolate an angle along the shortest arc.
///
/// Endpoints are returned untouched so unwrapped host angles survive.
pub fn lerp_angle(from: f32, to: f32, t: f32) -> f32 {
    if t <= 0.0 {
        from
    } else if t >= 1.0 {
        to
    } else {
        from + shortest_angle_delta(from, to) * t
    }
}

fn blend_vehicle(a: &VehicleState, b: &VehicleState, t: f32) -> VehicleState {
    VehicleState {
        x: lerp(a.x, b.x, t),
        y: lerp(a.y, b.y, t),
        angle: lerp_angle(a.angle, b.angle, t),
        vx: lerp(a.vx, b.vx, t),
        vy: lerp(a.vy, b.vy, t),
        health: b.health,
    }
}

fn blend_actor(a: &ActorState, b: &ActorState, t: f32) -> ActorState {
    ActorState {
        x: lerp(a.x, b.x, t),
        y: lerp(a.y, b.y, t),
        angle: lerp_angle(a.angle, b.angle, t),
        ..*b
    }
}

fn blend_npc(a: &NpcState, b: &NpcState, t: f32) -> NpcState {
    NpcState {
        x: lerp(a.x, b.x, t),
        y: lerp(a.y, b.y, t),
        angle: lerp_angle(a.angle, b.angle, t),
        ..*b
    }
}

fn blend_traffic(a: &TrafficState, b: &TrafficState, t: f32) -> TrafficState {
    TrafficState {
        x: lerp(a.x, b.x, t),
        y: lerp(a.y, b.y, t),
        angle: lerp_angle(a.angle, b.angle, t),
    }
}

/// Blend list entries by index; entries the previous list lacks render as current.
fn blend_list<T: Copy>(previous: &[T], current: &[T], t: f32, blend: fn(&T, &T, f32) -> T) -> Vec<T> {
    current
        .iter()
        .enumerate()
        .map(|(index, now)| match previous.get(index) {
            Some(before) => blend(before, now, t),
            None => *now,
        })
        .collect()
}

/// Render state between `previous` and `current` at fraction `t`.
pub fn interpolate_snapshot(previous: &Snapshot, current: &Snapshot, t: f32) -> Snapshot {
    let t = t.clamp(0.0, 1.0);
    Snapshot {
        tick: current.tick,
        phase: current.phase,
        primary: blend_vehicle(&previous.primary, &current.primary, t),
        secondary: match (&previous.secondary, &current.secondary) {
            (Some(a), Some(b)) => Some(blend_vehicle(a, b, t)),
            (_, other) => *other,
        },
        actor: match (&previous.actor, &current.actor) {
            (Some(a), Some(b)) if a.kind == b.kind => Some(blend_actor(a, b, t)),
            (_, other) => *other,
        },
        npcs: blend_list(&previous.npcs, &current.npcs, t, blend_npc),
        collectibles: current
            .collectibles
            .iter()
            .enumerate()
            .map(|(index, now)| match previous.collectibles.get(index) {
                Some(before) => tandem_core::CollectibleState {
                    x: lerp(before.x, now.x, t),
                    y: lerp(before.y, now.y, t),
                    ..*now
                },
                None => *now,
            })
            .collect(),
        traffic: blend_list(&previous.traffic, &current.traffic, t, blend_traffic),
        timers: current.timers,
        score: current.score,
        event: current.event,
    }
}

#[derive(Debug, Clone)]
struct Received {
    snapshot: Snapshot,
    at: Instant,
}

/// Previous/current snapshot pair and the blend clock.
#[derive(Debug, Clone)]
pub struct Interpolator {
    expected_interval: Duration,
    previous: Option<Received>,
    current: Option<Received>,
}

impl Interpolator {
    /// Interpolator expecting a snapshot every `expected_interval`.
    pub fn new(expected_interval: Duration) -> Self {
        Self {
            expected_interval,
            previous: None,
            current: None,
        }
    }

    /// Accept a new snapshot received at `now`.
    pub fn push(&mut self, snapshot: Snapshot, now: Instant) {
        self.previous = self.current.take();
        self.current = Some(Received { snapshot, at: now });
    }

    /// Blend fraction at `now`, in `[0, 1]`.
    pub fn fraction(&self, now: Instant) -> f32 {
        let Some(current) = &self.current else {
            return 0.0;
        };
        if self.expected_interval.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(current.at);
        (elapsed.as_secs_f32() / self.expected_interval.as_secs_f32()).clamp(0.0, 1.0)
    }

    /// State to render at `now`.
    pub fn sample(&self, now: Instant) -> Option<Snapshot> {
        match (&self.previous, &self.current) {
            (Some(previous), Some(current)) => Some(interpolate_snapshot(
                &previous.snapshot,
                &current.snapshot,
                self.fraction(now),
            )),
            (None, Some(current)) => Some(current.snapshot.clone()),
            _ => None,
        }
    }

    /// Most recent snapshot.
    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref().map(|r| &r.snapshot)
    }

    /// Snapshots held (0, 1 or 2).
    pub fn len(&self) -> usize {
        usize::from(self.previous.is_some()) + usize::from(self.current.is_some())
    }

    /// Whether nothing has been received since the last reset.
    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Forget both snapshots (new round).
    pub fn reset(&mut self) {
        self.previous = None;
        self.current = None;
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}
