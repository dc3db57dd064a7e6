//! Host and guest sessions over the in-memory network.

use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{GameMode, RoomCode, RoundOutcome, ScorePair, SessionPhase, SimTick, Snapshot};
use tandem_net::{
    CandidateKind, ConnectionState, DisconnectReason, Established, MemoryChannel, MemoryNetwork,
    Rendezvous, RendezvousError, SignalingService,
};
use tandem_session::{GuestSession, HostSession, RoundAdvance, SessionConfig, SessionEvent};
use tandem_testkit::sim::TICK;
use tandem_testkit::ScriptedSimulation;

const EPSILON: f32 = 0.15;

fn rendezvous(network: &MemoryNetwork, config: &SessionConfig) -> Rendezvous {
    Rendezvous::new(
        Arc::new(network.signaling()),
        Arc::new(network.transport()),
        config.rendezvous(),
    )
}

async fn connect(
    network: &MemoryNetwork,
    config: &SessionConfig,
    seed: u64,
) -> (Established, Established) {
    let host = rendezvous(network, config);
    let guest = rendezvous(network, config);
    let room = host
        .host_room(&mut StdRng::seed_from_u64(seed))
        .await
        .expect("room registered");
    let code = room.code().to_string();
    let (host_side, guest_side) = tokio::join!(host.accept_guest(room), guest.join_room(&code));
    (
        host_side.expect("host connected"),
        guest_side.expect("guest connected"),
    )
}

struct Session {
    host: HostSession,
    guest: GuestSession,
    now: Instant,
    host_events: Vec<SessionEvent>,
    guest_events: Vec<SessionEvent>,
}

impl Session {
    fn new(host: Established, guest: Established, config: &SessionConfig, rounds: u32) -> Self {
        let now = Instant::now();
        Self {
            host: HostSession::new(host.channel, config, rounds, now),
            guest: GuestSession::new(guest.channel, config, now),
            now,
            host_events: Vec::new(),
            guest_events: Vec::new(),
        }
    }

    fn in_memory(config: &SessionConfig, rounds: u32) -> Self {
        let now = Instant::now();
        let (host_end, guest_end) = MemoryChannel::pair();
        Self {
            host: HostSession::new(Box::new(host_end), config, rounds, now),
            guest: GuestSession::new(Box::new(guest_end), config, now),
            now,
            host_events: Vec::new(),
            guest_events: Vec::new(),
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.settle();
    }

    /// Poll both sides until replies have crossed in both directions.
    fn settle(&mut self) {
        for _ in 0..2 {
            self.host_events.extend(self.host.poll(self.now));
            self.guest_events.extend(self.guest.poll(self.now));
        }
    }

    fn take_host(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.host_events)
    }

    fn take_guest(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.guest_events)
    }

    fn play_round(&mut self, sim: &ScriptedSimulation, mode: GameMode, ticks: u64) {
        let score = self.host.score();
        self.host
            .begin_briefing(sim.full_sync(mode, score), self.now)
            .expect("briefing");
        self.settle();
        self.guest.mark_ready(self.now).expect("guest ready");
        self.settle();
        self.host.start_round(self.now).expect("round starts");
        self.settle();
        for tick in 1..=ticks {
            self.now += TICK;
            self.host
                .send_snapshot(&sim.state_at(SimTick(tick)), self.now)
                .expect("snapshot");
            self.settle();
        }
    }
}

fn assert_close(rendered: &Snapshot, expected_x: f32, expected_y: f32) {
    assert!(
        (rendered.primary.x - expected_x).abs() <= EPSILON,
        "x {} vs {}",
        rendered.primary.x,
        expected_x
    );
    assert!(
        (rendered.primary.y - expected_y).abs() <= EPSILON,
        "y {} vs {}",
        rendered.primary.y,
        expected_y
    );
}

#[tokio::test]
async fn joining_unknown_code_fails_fast() {
    let network = MemoryNetwork::new();
    let config = SessionConfig::default();
    let guest = rendezvous(&network, &config);
    let code = RoomCode::generate(&mut StdRng::seed_from_u64(1)).to_string();

    let result = tokio::time::timeout(config.rendezvous().negotiation_timeout, guest.join_room(&code))
        .await
        .expect("answered before the timeout");
    assert!(matches!(result, Err(RendezvousError::NotFound(_))));
    assert_eq!(guest.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silent_host_times_out() {
    let network = MemoryNetwork::new();
    let config = SessionConfig::default();
    let host = rendezvous(&network, &config);
    let guest = rendezvous(&network, &config);
    let room = host
        .host_room(&mut StdRng::seed_from_u64(2))
        .await
        .expect("room registered");
    network.set_silent(true);

    let result = guest.join_room(&room.code().to_string()).await;
    assert!(matches!(result, Err(RendezvousError::Timeout)));
    assert_eq!(guest.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn colliding_code_is_regenerated() {
    let network = MemoryNetwork::new();
    let config = SessionConfig::default();
    let rng = StdRng::seed_from_u64(3);
    let taken = RoomCode::generate(&mut rng.clone());
    let _squatter = network
        .signaling()
        .register(&taken.peer_id())
        .await
        .expect("squatter registered");

    let host = rendezvous(&network, &config);
    let room = host.host_room(&mut rng.clone()).await.expect("fresh code");
    assert_ne!(room.code(), &taken);
    assert!(network.is_registered(&room.code().peer_id()));
    assert_eq!(host.state(), ConnectionState::Offering);
}

#[tokio::test]
async fn blocked_direct_paths_fall_back_to_relay() {
    let network = MemoryNetwork::new();
    network.block_direct_paths(true);
    let config = SessionConfig::default();

    let (host, guest) = connect(&network, &config, 4).await;
    assert_eq!(guest.path, Some(CandidateKind::Relayed));
    assert_eq!(host.room_code, guest.room_code);
    assert!(!network.is_registered(&host.room_code.peer_id()));
}

#[tokio::test]
async fn guest_render_tracks_host_simulation() {
    let network = MemoryNetwork::new();
    let config = SessionConfig::default();
    let (host, guest) = connect(&network, &config, 5).await;
    assert_eq!(guest.path, Some(CandidateKind::Host));

    let mut session = Session::new(host, guest, &config, 3);
    session.settle();
    assert!(session.host.peer_hello());
    assert!(session.guest.peer_hello());

    session
        .host
        .select_mode(GameMode::Coop, session.now)
        .expect("mode");
    let sim = ScriptedSimulation::new(99, 1);
    session.play_round(&sim, GameMode::Coop, 3);

    let guest_events = session.take_guest();
    assert!(guest_events
        .iter()
        .any(|event| matches!(event, SessionEvent::FullSyncApplied(summary) if summary.round == 1)));
    assert!(session
        .take_host()
        .contains(&SessionEvent::SyncAcknowledged { round: 1 }));
    assert_eq!(session.guest.phase(), SessionPhase::Playing);

    // Halfway between the second and third snapshot.
    let mid = session.now + TICK / 2;
    let rendered = session.guest.render(mid).expect("rendered state");
    let before = sim.state_at(SimTick(2));
    let after = sim.state_at(SimTick(3));
    assert_close(
        &rendered,
        (before.primary.x + after.primary.x) / 2.0,
        (before.primary.y + after.primary.y) / 2.0,
    );
    for (npc, (a, b)) in rendered.npcs.iter().zip(before.npcs.iter().zip(&after.npcs)) {
        assert!((npc.x - (a.x + b.x) / 2.0).abs() <= EPSILON);
        assert!((npc.y - (a.y + b.y) / 2.0).abs() <= EPSILON);
    }

    let settled = session.guest.render(session.now + TICK).expect("rendered state");
    assert_close(&settled, after.primary.x, after.primary.y);
    assert_eq!(settled.tick, SimTick(3));
}

#[test]
fn campaign_runs_to_the_lobby() {
    let config = SessionConfig::default();
    let mut session = Session::in_memory(&config, 2);
    session.settle();
    session
        .host
        .select_mode(GameMode::Versus, session.now)
        .expect("mode");

    let round_one = ScriptedSimulation::new(7, 1);
    session.play_round(&round_one, GameMode::Versus, 5);
    session
        .host
        .end_round(RoundOutcome::Failure, session.now)
        .expect("round ends");
    assert_eq!(
        session.host.advance(0, session.now),
        Ok(RoundAdvance::Retry { round: 1 })
    );
    session.settle();
    assert_eq!(session.guest.phase(), SessionPhase::RoundEnd);

    session.play_round(&round_one, GameMode::Versus, 40);
    session
        .host
        .end_round(RoundOutcome::Success, session.now)
        .expect("round ends");
    assert_eq!(
        session.host.advance(25, session.now),
        Ok(RoundAdvance::Upgrade { round: 1 })
    );
    session.settle();
    assert_eq!(session.guest.phase(), SessionPhase::Upgrade);
    assert_eq!(session.guest.resources(), 25);
    session
        .guest
        .choose_upgrade("armor", session.now)
        .expect("upgrade");
    session.settle();
    assert!(session.take_host().contains(&SessionEvent::UpgradeChosen {
        key: "armor".to_string()
    }));

    let round_two = ScriptedSimulation::new(7, 2);
    let brief = round_two.full_sync(GameMode::Versus, session.host.score());
    session
        .host
        .finish_upgrade(brief, session.now)
        .expect("next briefing");
    session.settle();
    assert_eq!(session.guest.round(), 2);
    session.guest.mark_ready(session.now).expect("ready");
    session.settle();
    session.host.start_round(session.now).expect("start");
    session.now += TICK;
    session
        .host
        .send_snapshot(&round_two.state_at(SimTick(60)), session.now)
        .expect("snapshot");
    session.settle();
    session
        .host
        .end_round(RoundOutcome::Success, session.now)
        .expect("round ends");

    let final_score = ScorePair { host: 3, guest: 1 };
    assert_eq!(
        session.host.advance(0, session.now),
        Ok(RoundAdvance::CampaignComplete { final_score })
    );
    session.settle();
    assert_eq!(session.host.phase(), SessionPhase::Lobby);
    assert_eq!(session.guest.phase(), SessionPhase::Lobby);
    assert_eq!(session.guest.final_score(), Some(final_score));
    assert!(session
        .take_guest()
        .contains(&SessionEvent::CampaignComplete { final_score }));
}

#[test]
fn rematch_resets_both_sides() {
    let config = SessionConfig::default();
    let mut session = Session::in_memory(&config, 3);
    session.settle();
    session
        .host
        .select_mode(GameMode::Chase, session.now)
        .expect("mode");
    session.play_round(&ScriptedSimulation::new(8, 1), GameMode::Chase, 2);

    session.guest.request_rematch(session.now).expect("ask");
    session.settle();
    assert!(session.take_host().contains(&SessionEvent::RematchRequested));

    session.host.request_rematch(session.now).expect("rematch");
    session.settle();
    assert_eq!(session.host.phase(), SessionPhase::Lobby);
    assert_eq!(session.guest.phase(), SessionPhase::Lobby);
    assert!(session.guest.render(session.now).is_none());
}

#[test]
fn chat_crosses_both_ways() {
    let config = SessionConfig::default();
    let mut session = Session::in_memory(&config, 1);
    session.host.send_chat("ready?", session.now).expect("chat");
    session.guest.send_chat("go", session.now).expect("chat");
    session.settle();
    assert!(session.take_guest().iter().any(|event| matches!(
        event,
        SessionEvent::Chat { text, .. } if text == "ready?"
    )));
    assert!(session.take_host().iter().any(|event| matches!(
        event,
        SessionEvent::Chat { text, .. } if text == "go"
    )));
}

#[test]
fn silent_guest_times_out() {
    let config = SessionConfig::default();
    let now = Instant::now();
    let (host_end, _guest_end) = MemoryChannel::pair();
    let mut host = HostSession::new(Box::new(host_end), &config, 1, now);

    let mut reason = None;
    for second in 1..=7 {
        for event in host.poll(now + Duration::from_secs(second)) {
            if let SessionEvent::Disconnected { reason: r } = event {
                reason = Some(r);
            }
        }
    }
    assert_eq!(reason, Some(DisconnectReason::HeartbeatTimeout));
    assert!(!host.is_connected());
}

#[test]
fn closing_one_side_disconnects_the_other() {
    let config = SessionConfig::default();
    let mut session = Session::in_memory(&config, 1);
    session.settle();
    session.guest.teardown();
    session.advance(Duration::from_millis(10));

    assert!(session.take_host().contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::ChannelClosed
    }));
    assert!(session.take_guest().contains(&SessionEvent::Disconnected {
        reason: DisconnectReason::Local
    }));
    assert!(session.host.select_mode(GameMode::Coop, session.now).is_err());
}
