//! Scripted host simulation with analytically known state.
//!
//! Every entity moves in a straight line at a seeded constant velocity, so the
//! state at any tick is a pure function of `(seed, round, tick)`. Tests compare
//! what a guest renders against [`ScriptedSimulation::state_at`].

use rand::Rng;
use std::time::Duration;
use tandem_core::{
    round_rng, CollectibleKind, CollectibleSpawn, CollectibleState, EnvironmentTimers,
    FullSyncPayload, GameMode, LevelLayout, NpcKind, NpcSpawn, NpcState, Obstacle, ScorePair,
    SessionPhase, SimTick, Snapshot, TrafficState, VehicleState,
};

/// Duration of one simulation tick.
pub const TICK: Duration = Duration::from_millis(50);

/// Round length in seconds.
pub const ROUND_SECONDS: f32 = 90.0;

const ARENA: f32 = 400.0;
const MAX_SPEED: f32 = 6.0;

#[derive(Debug, Clone, Copy)]
struct Mover {
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
}

impl Mover {
    fn random<R: Rng>(rng: &mut R) -> Self {
        Self {
            x: rng.gen_range(50.0..ARENA - 50.0),
            y: rng.gen_range(50.0..ARENA - 50.0),
            vx: rng.gen_range(-MAX_SPEED..MAX_SPEED),
            vy: rng.gen_range(-MAX_SPEED..MAX_SPEED),
        }
    }

    fn at(&self, seconds: f32) -> (f32, f32) {
        (self.x + self.vx * seconds, self.y + self.vy * seconds)
    }

    fn heading(&self) -> f32 {
        self.vy.atan2(self.vx)
    }
}

/// Deterministic stand-in for the host's game simulation.
#[derive(Debug, Clone)]
pub struct ScriptedSimulation {
    round: u32,
    layout: LevelLayout,
    primary: Mover,
    secondary: Mover,
    npcs: Vec<(NpcKind, Mover)>,
    collectibles: Vec<CollectibleSpawn>,
    traffic: Vec<Mover>,
}

impl ScriptedSimulation {
    /// Build round `round` of the session seeded by `session_seed`.
    pub fn new(session_seed: u64, round: u32) -> Self {
        let mut rng = round_rng(session_seed, round);

        let obstacles = (0..rng.gen_range(2..6))
            .map(|_| Obstacle {
                x: rng.gen_range(0.0..ARENA - 20.0),
                y: rng.gen_range(0.0..ARENA - 20.0),
                width: rng.gen_range(5.0..20.0),
                height: rng.gen_range(5.0..20.0),
            })
            .collect();
        let layout = LevelLayout {
            width: ARENA,
            height: ARENA,
            seed: rng.gen(),
            obstacles,
        };

        let primary = Mover::random(&mut rng);
        let secondary = Mover::random(&mut rng);
        let npc_kinds = [NpcKind::Pedestrian, NpcKind::Guard, NpcKind::Drone];
        let npcs = (0..rng.gen_range(3..8))
            .map(|i| (npc_kinds[i % npc_kinds.len()], Mover::random(&mut rng)))
            .collect();
        let collectible_kinds = [CollectibleKind::Coin, CollectibleKind::Fuel, CollectibleKind::Part];
        let collectibles = (0..rng.gen_range(2..6))
            .map(|i| CollectibleSpawn {
                kind: collectible_kinds[i % collectible_kinds.len()],
                x: rng.gen_range(0.0..ARENA),
                y: rng.gen_range(0.0..ARENA),
            })
            .collect();
        let traffic = (0..rng.gen_range(1..4))
            .map(|_| Mover::random(&mut rng))
            .collect();

        Self {
            round,
            layout,
            primary,
            secondary,
            npcs,
            collectibles,
            traffic,
        }
    }

    /// Round index.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Static layout.
    pub fn layout(&self) -> &LevelLayout {
        &self.layout
    }

    /// State at `tick`.
    pub fn state_at(&self, tick: SimTick) -> Snapshot {
        let seconds = tick.0 as f32 * TICK.as_secs_f32();
        let vehicle = |mover: &Mover| {
            let (x, y) = mover.at(seconds);
            VehicleState {
                x,
                y,
                angle: mover.heading(),
                vx: mover.vx,
                vy: mover.vy,
                health: 100,
            }
        };

        let mut snapshot = Snapshot::new(tick, SessionPhase::Playing, vehicle(&self.primary));
        snapshot.secondary = Some(vehicle(&self.secondary));
        snapshot.npcs = self
            .npcs
            .iter()
            .map(|(kind, mover)| {
                let (x, y) = mover.at(seconds);
                NpcState {
                    x,
                    y,
                    angle: mover.heading(),
                    kind: *kind,
                    health: 50,
                }
            })
            .collect();
        snapshot.collectibles = self
            .collectibles
            .iter()
            .map(|spawn| CollectibleState {
                x: spawn.x,
                y: spawn.y,
                kind: spawn.kind,
                collected: false,
            })
            .collect();
        snapshot.traffic = self
            .traffic
            .iter()
            .map(|mover| {
                let (x, y) = mover.at(seconds);
                TrafficState {
                    x,
                    y,
                    angle: mover.heading(),
                }
            })
            .collect();
        snapshot.timers = EnvironmentTimers {
            round_time_left: (ROUND_SECONDS - seconds).max(0.0),
            event_time_left: 0.0,
        };
        snapshot.score = ScorePair {
            host: (tick.0 / 20) as u32,
            guest: (tick.0 / 40) as u32,
        };
        snapshot
    }

    /// Round description for the briefing, carrying `score` into the round.
    pub fn full_sync(&self, mode: GameMode, score: ScorePair) -> FullSyncPayload {
        let mut initial = self.state_at(SimTick::ZERO);
        initial.phase = SessionPhase::Briefing;
        initial.score = score;
        FullSyncPayload {
            round: self.round,
            mode,
            layout: self.layout.clone(),
            npcs: self
                .npcs
                .iter()
                .map(|(kind, mover)| NpcSpawn {
                    kind: *kind,
                    x: mover.x,
                    y: mover.y,
                    angle: mover.heading(),
                })
                .collect(),
            collectibles: self.collectibles.clone(),
            score,
            initial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_round() {
        let a = ScriptedSimulation::new(7, 1);
        let b = ScriptedSimulation::new(7, 1);
        assert_eq!(a.state_at(SimTick(33)), b.state_at(SimTick(33)));
        assert_eq!(
            a.full_sync(GameMode::Coop, ScorePair::default()),
            b.full_sync(GameMode::Coop, ScorePair::default())
        );
    }

    #[test]
    fn rounds_differ() {
        let a = ScriptedSimulation::new(7, 1);
        let b = ScriptedSimulation::new(7, 2);
        assert_ne!(a.layout(), b.layout());
    }

    #[test]
    fn motion_is_linear() {
        let sim = ScriptedSimulation::new(11, 1);
        let s0 = sim.state_at(SimTick(0));
        let s1 = sim.state_at(SimTick(10));
        let s2 = sim.state_at(SimTick(20));
        let mid = (s0.primary.x + s2.primary.x) / 2.0;
        assert!((s1.primary.x - mid).abs() < 1e-3);
        assert_eq!(s0.npcs.len(), sim.full_sync(GameMode::Chase, ScorePair::default()).npcs.len());
    }
}
