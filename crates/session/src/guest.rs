//! Guest session: mirrors the host and sends input upstream.

use crate::coordinator::{check_hello, PhaseMachine};
use crate::{SessionConfig, SessionError, SessionEvent};
use std::time::{Duration, Instant};
use tandem_core::{
    FullSyncPayload, GameMode, InputKeys, Role, ScorePair, SessionPhase, Snapshot, SyncSummary,
};
use tandem_net::{
    compute_schema_hash, decode_snapshot, summarize, ConnectionEvent, ConnectionManager,
    ConnectionStats, DataChannel, DisconnectReason, Interpolator, Payload, SendOutcome,
    SnapshotWire, MAX_CHAT_LEN, MAX_UPGRADE_KEY_LEN, PROTOCOL_VERSION,
};
use tracing::{debug, error, info, trace, warn};

/// Guest side of a session. Its phase only changes on host messages.
pub struct GuestSession {
    conn: ConnectionManager,
    machine: PhaseMachine,
    interpolator: Interpolator,
    mode: Option<GameMode>,
    round: u32,
    applied: Option<SyncSummary>,
    round_data: Option<FullSyncPayload>,
    resources: u32,
    final_score: Option<ScorePair>,
    peer_hello: bool,
    events: Vec<SessionEvent>,
}

impl GuestSession {
    /// Take over an open channel and greet the host.
    pub fn new(channel: Box<dyn DataChannel>, config: &SessionConfig, now: Instant) -> Self {
        let mut conn = ConnectionManager::new(channel, Role::Guest, config.connection(), now);
        conn.send(
            Payload::Hello {
                version: PROTOCOL_VERSION,
                schema_hash: compute_schema_hash(),
            },
            now,
        );
        info!("Guest session started");
        Self {
            conn,
            machine: PhaseMachine::new(),
            interpolator: Interpolator::new(config.snapshot_interval()),
            mode: None,
            round: 0,
            applied: None,
            round_data: None,
            resources: 0,
            final_score: None,
            peer_hello: false,
            events: Vec::new(),
        }
    }

    /// Phase last announced by the host.
    pub fn phase(&self) -> SessionPhase {
        self.machine.phase()
    }

    /// Announced mode.
    pub fn mode(&self) -> Option<GameMode> {
        self.mode
    }

    /// Round last briefed.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Applied round description.
    pub fn round_data(&self) -> Option<&FullSyncPayload> {
        self.round_data.as_ref()
    }

    /// Summary of the applied round description.
    pub fn applied(&self) -> Option<SyncSummary> {
        self.applied
    }

    /// Resources offered in the current upgrade phase.
    pub fn resources(&self) -> u32 {
        self.resources
    }

    /// Score announced at the end of the last campaign.
    pub fn final_score(&self) -> Option<ScorePair> {
        self.final_score
    }

    /// Whether the host's `hello` checked out.
    pub fn peer_hello(&self) -> bool {
        self.peer_hello
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Option<Duration> {
        self.conn.rtt()
    }

    /// Connection counters.
    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    /// Interpolated host state to draw at `now`.
    pub fn render(&self, now: Instant) -> Option<Snapshot> {
        self.interpolator.sample(now)
    }

    /// Send held keys. Best-effort: may come back `Dropped`.
    pub fn send_keys(&mut self, keys: InputKeys, now: Instant) -> Result<SendOutcome, SessionError> {
        self.expect_phase(SessionPhase::Playing)?;
        self.send(Payload::Keys(keys), now)
    }

    /// Tell the host this side finished loading the briefed round.
    pub fn mark_ready(&mut self, now: Instant) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Briefing)?;
        if self.applied.map(|summary| summary.round) != Some(self.round) {
            return Err(SessionError::SyncPending { round: self.round });
        }
        self.send(Payload::Ready, now)?;
        Ok(())
    }

    /// Spend the upgrade resources.
    pub fn choose_upgrade(&mut self, key: &str, now: Instant) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Upgrade)?;
        if key.is_empty() || key.len() > MAX_UPGRADE_KEY_LEN {
            return Err(SessionError::InvalidUpgradeKey);
        }
        self.send(
            Payload::UpgradeChoice {
                key: key.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    /// Ask the host for a rematch. The host decides.
    pub fn request_rematch(&mut self, now: Instant) -> Result<(), SessionError> {
        self.send(Payload::Rematch, now)?;
        Ok(())
    }

    /// Send a chat line.
    pub fn send_chat(&mut self, text: &str, now: Instant) -> Result<(), SessionError> {
        if text.len() > MAX_CHAT_LEN {
            return Err(SessionError::ChatTooLong {
                len: text.len(),
                max: MAX_CHAT_LEN,
            });
        }
        self.send(
            Payload::Chat {
                text: text.to_string(),
            },
            now,
        )?;
        Ok(())
    }

    /// Drive timers and apply host traffic.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        for event in self.conn.poll(now) {
            match event {
                ConnectionEvent::Message(envelope) => self.handle(envelope.payload, now),
                ConnectionEvent::ProtocolViolation { kind, reason } => self
                    .events
                    .push(SessionEvent::ProtocolViolation { kind, reason }),
                ConnectionEvent::Disconnected(reason) => {
                    self.events.push(SessionEvent::Disconnected { reason })
                }
            }
        }
        std::mem::take(&mut self.events)
    }

    /// Close from this side.
    pub fn teardown(&mut self) {
        self.conn.close();
    }

    fn handle(&mut self, payload: Payload, now: Instant) {
        match payload {
            Payload::Hello {
                version,
                schema_hash,
            } => match check_hello(version, schema_hash) {
                Ok(()) => {
                    self.peer_hello = true;
                    self.events.push(SessionEvent::PeerHello { version });
                }
                Err(err) => {
                    error!("{}", err);
                    self.conn.teardown(DisconnectReason::IncompatiblePeer {
                        version,
                        schema_hash,
                    });
                }
            },
            Payload::ModeSelect { mode } => {
                self.follow(SessionPhase::ModeSelect);
                self.mode = Some(mode);
                self.events.push(SessionEvent::ModeSelected(mode));
            }
            Payload::Briefing { round } => {
                self.follow(SessionPhase::Briefing);
                self.round = round;
                self.applied = None;
            }
            Payload::FullSync(payload) => self.apply_full_sync(*payload, now),
            Payload::Start { round } => {
                if round != self.round {
                    warn!(expected = self.round, round, "Start for an unexpected round");
                    self.round = round;
                }
                self.follow(SessionPhase::Playing);
                self.events.push(SessionEvent::RoundStarted { round });
            }
            Payload::Snapshot(wire) => self.apply_snapshot(&wire, now),
            Payload::RoundEnd { round, outcome } => {
                self.follow(SessionPhase::RoundEnd);
                self.events.push(SessionEvent::RoundEnded { round, outcome });
            }
            Payload::Upgrade { round, resources } => {
                self.follow(SessionPhase::Upgrade);
                self.resources = resources;
                self.events
                    .push(SessionEvent::UpgradeOffered { round, resources });
            }
            Payload::Lobby { final_score } => {
                self.follow(SessionPhase::Lobby);
                self.reset();
                self.final_score = Some(final_score);
                self.events
                    .push(SessionEvent::CampaignComplete { final_score });
            }
            Payload::Rematch => {
                self.follow(SessionPhase::Lobby);
                self.reset();
                self.events.push(SessionEvent::RematchRequested);
            }
            Payload::Chat { text } => self.events.push(SessionEvent::Chat {
                from: Role::Host,
                text,
            }),
            other => debug!(kind = other.kind().as_str(), "Ignoring message"),
        }
    }

    fn apply_full_sync(&mut self, payload: FullSyncPayload, now: Instant) {
        let summary = match summarize(&payload) {
            Ok(summary) => summary,
            Err(err) => {
                warn!("Cannot summarize full sync: {}", err);
                return;
            }
        };

        if self.applied == Some(summary) {
            debug!(round = summary.round, "Duplicate full sync, acknowledging again");
        } else {
            self.interpolator.reset();
            self.interpolator.push(payload.initial.clone(), now);
            self.mode = Some(payload.mode);
            self.round = payload.round;
            self.round_data = Some(payload);
            self.applied = Some(summary);
            info!(
                round = summary.round,
                npcs = summary.npc_count,
                collectibles = summary.collectible_count,
                "Full sync applied"
            );
            self.events.push(SessionEvent::FullSyncApplied(summary));
        }
        self.conn.send(Payload::SyncAck(summary), now);
    }

    fn apply_snapshot(&mut self, wire: &SnapshotWire, now: Instant) {
        if self.phase() != SessionPhase::Playing {
            trace!(phase = self.phase().as_str(), "Snapshot outside play");
            return;
        }
        match decode_snapshot(wire) {
            Ok(snapshot) => self.interpolator.push(snapshot, now),
            Err(err) => warn!("Discarding snapshot: {}", err),
        }
    }

    fn follow(&mut self, to: SessionPhase) {
        let from = self.machine.follow(to);
        if from != to {
            self.events.push(SessionEvent::PhaseChanged { from, to });
        }
    }

    fn expect_phase(&self, expected: SessionPhase) -> Result<(), SessionError> {
        let actual = self.phase();
        if actual != expected {
            return Err(SessionError::WrongPhase { expected, actual });
        }
        Ok(())
    }

    fn send(&mut self, payload: Payload, now: Instant) -> Result<SendOutcome, SessionError> {
        match self.conn.send(payload, now) {
            SendOutcome::Closed => Err(SessionError::Disconnected),
            outcome => Ok(outcome),
        }
    }

    fn reset(&mut self) {
        self.mode = None;
        self.round = 0;
        self.applied = None;
        self.round_data = None;
        self.resources = 0;
        self.interpolator.reset();
    }
}
