//! Host session: authoritative phase driver.
//!
//! The host decides every transition. Each local operation checks the phase
//! table, updates local state and sends the matching message; [`HostSession::poll`]
//! then drives the connection timers and the full-sync retry loop and turns
//! guest traffic into [`SessionEvent`]s.

use crate::coordinator::{after_round, check_hello, NextStep, PhaseMachine};
use crate::{SessionConfig, SessionError, SessionEvent};
use std::time::{Duration, Instant};
use tandem_core::{
    FullSyncPayload, GameMode, InputKeys, Role, RoundOutcome, ScorePair, SessionPhase, Snapshot,
};
use tandem_net::{
    compute_schema_hash, encode_snapshot, AckOutcome, ConnectionEvent, ConnectionManager,
    ConnectionStats, DataChannel, DisconnectReason, FullSyncAction, FullSyncConfig,
    FullSyncSender, Payload, SendOutcome, MAX_CHAT_LEN, PROTOCOL_VERSION,
};
use tracing::{debug, error, info, warn};

/// Result of [`HostSession::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    /// Guest was offered an upgrade after `round`.
    Upgrade {
        /// Round just won.
        round: u32,
    },
    /// Last round won; the session is back in the lobby.
    CampaignComplete {
        /// Score at the end of the campaign.
        final_score: ScorePair,
    },
    /// Round lost; call [`HostSession::begin_briefing`] with a fresh payload
    /// for the same round.
    Retry {
        /// Round to replay.
        round: u32,
    },
}

/// Host side of a session.
pub struct HostSession {
    conn: ConnectionManager,
    machine: PhaseMachine,
    full_sync: FullSyncConfig,
    snapshot_interval: Duration,
    campaign_rounds: u32,
    mode: Option<GameMode>,
    round: u32,
    score: ScorePair,
    last_outcome: Option<RoundOutcome>,
    sync: Option<FullSyncSender>,
    peer_hello: bool,
    peer_ready: bool,
    keys: InputKeys,
    last_snapshot: Option<Instant>,
    events: Vec<SessionEvent>,
}

impl HostSession {
    /// Take over an open channel and greet the guest.
    pub fn new(
        channel: Box<dyn DataChannel>,
        config: &SessionConfig,
        campaign_rounds: u32,
        now: Instant,
    ) -> Self {
        let mut conn = ConnectionManager::new(channel, Role::Host, config.connection(), now);
        conn.send(
            Payload::Hello {
                version: PROTOCOL_VERSION,
                schema_hash: compute_schema_hash(),
            },
            now,
        );
        info!(campaign_rounds, "Host session started");
        Self {
            conn,
            machine: PhaseMachine::new(),
            full_sync: config.full_sync(),
            snapshot_interval: config.snapshot_interval(),
            campaign_rounds: campaign_rounds.max(1),
            mode: None,
            round: 0,
            score: ScorePair::default(),
            last_outcome: None,
            sync: None,
            peer_hello: false,
            peer_ready: false,
            keys: InputKeys::empty(),
            last_snapshot: None,
            events: Vec::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.machine.phase()
    }

    /// Announced mode, if any.
    pub fn mode(&self) -> Option<GameMode> {
        self.mode
    }

    /// Current round, 0 before the first briefing.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Rounds in the campaign.
    pub fn campaign_rounds(&self) -> u32 {
        self.campaign_rounds
    }

    /// Score from the latest snapshot sent.
    pub fn score(&self) -> ScorePair {
        self.score
    }

    /// Most recent guest input.
    pub fn keys(&self) -> InputKeys {
        self.keys
    }

    /// Whether the guest's `hello` checked out.
    pub fn peer_hello(&self) -> bool {
        self.peer_hello
    }

    /// Whether the guest signalled ready for the current briefing.
    pub fn peer_ready(&self) -> bool {
        self.peer_ready
    }

    /// Whether the current full sync was acknowledged.
    pub fn sync_acked(&self) -> bool {
        self.sync.as_ref().is_some_and(FullSyncSender::is_completed)
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

    /// Announce (or change) the game mode.
    pub fn select_mode(&mut self, mode: GameMode, now: Instant) -> Result<(), SessionError> {
        self.enter(SessionPhase::ModeSelect)?;
        self.mode = Some(mode);
        self.send(Payload::ModeSelect { mode }, now)?;
        Ok(())
    }

    /// Brief a round and start the full-sync transfer of `payload`.
    ///
    /// Legal after mode selection (round 1), after a lost round (same round)
    /// and after an upgrade (next round).
    pub fn begin_briefing(
        &mut self,
        payload: FullSyncPayload,
        now: Instant,
    ) -> Result<(), SessionError> {
        let phase = self.phase();
        let expected = match phase {
            SessionPhase::ModeSelect => 1,
            SessionPhase::Upgrade => self.round + 1,
            SessionPhase::RoundEnd if self.last_outcome == Some(RoundOutcome::Failure) => {
                self.round
            }
            SessionPhase::RoundEnd => {
                return Err(SessionError::WrongPhase {
                    expected: SessionPhase::Upgrade,
                    actual: phase,
                })
            }
            from => {
                return Err(SessionError::InvalidTransition {
                    from,
                    to: SessionPhase::Briefing,
                })
            }
        };
        if payload.round != expected {
            return Err(SessionError::RoundMismatch {
                expected,
                actual: payload.round,
            });
        }
        if self.mode.is_some_and(|mode| mode != payload.mode) {
            warn!(round = expected, "Full sync mode differs from the announced mode");
        }

        let mut sender = FullSyncSender::new(payload, self.full_sync)
            .map_err(|err| SessionError::Encode(err.to_string()))?;
        self.enter(SessionPhase::Briefing)?;
        self.round = expected;
        self.peer_ready = false;
        self.last_outcome = None;

        self.send(Payload::Briefing { round: expected }, now)?;
        self.send(Payload::FullSync(Box::new(sender.payload().clone())), now)?;
        sender.start(now);
        self.sync = Some(sender);
        info!(round = expected, "Briefing round");
        Ok(())
    }

    /// Start the briefed round once the sync is acknowledged and the guest is ready.
    pub fn start_round(&mut self, now: Instant) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Briefing)?;
        let sync_acked = self.sync_acked();
        if !sync_acked || !self.peer_ready {
            return Err(SessionError::NotReady {
                sync_acked,
                peer_ready: self.peer_ready,
            });
        }
        self.enter(SessionPhase::Playing)?;
        self.last_snapshot = None;
        self.send(Payload::Start { round: self.round }, now)?;
        self.events.push(SessionEvent::RoundStarted { round: self.round });
        Ok(())
    }

    /// Whether a snapshot is due at `now`.
    pub fn snapshot_due(&self, now: Instant) -> bool {
        self.phase() == SessionPhase::Playing
            && self
                .last_snapshot
                .map_or(true, |at| now.saturating_duration_since(at) >= self.snapshot_interval)
    }

    /// Send simulation state. Best-effort: may come back `Dropped`.
    pub fn send_snapshot(
        &mut self,
        snapshot: &Snapshot,
        now: Instant,
    ) -> Result<SendOutcome, SessionError> {
        self.expect_phase(SessionPhase::Playing)?;
        self.score = snapshot.score;
        self.last_snapshot = Some(now);
        self.send(Payload::Snapshot(encode_snapshot(snapshot)), now)
    }

    /// Finish the running round.
    pub fn end_round(&mut self, outcome: RoundOutcome, now: Instant) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Playing)?;
        self.enter(SessionPhase::RoundEnd)?;
        self.last_outcome = Some(outcome);
        self.send(
            Payload::RoundEnd {
                round: self.round,
                outcome,
            },
            now,
        )?;
        info!(round = self.round, outcome = outcome.as_str(), "Round ended");
        self.events.push(SessionEvent::RoundEnded {
            round: self.round,
            outcome,
        });
        Ok(())
    }

    /// Branch after a finished round. `resources` is offered on success.
    pub fn advance(&mut self, resources: u32, now: Instant) -> Result<RoundAdvance, SessionError> {
        self.expect_phase(SessionPhase::RoundEnd)?;
        let outcome = self.last_outcome.unwrap_or(RoundOutcome::Failure);
        match after_round(outcome, self.round, self.campaign_rounds) {
            NextStep::Upgrade => {
                self.enter(SessionPhase::Upgrade)?;
                self.send(
                    Payload::Upgrade {
                        round: self.round,
                        resources,
                    },
                    now,
                )?;
                Ok(RoundAdvance::Upgrade { round: self.round })
            }
            NextStep::CampaignComplete => {
                let final_score = self.score;
                self.enter(SessionPhase::Lobby)?;
                self.send(Payload::Lobby { final_score }, now)?;
                info!(rounds = self.round, ?final_score, "Campaign complete");
                self.reset_campaign();
                self.events
                    .push(SessionEvent::CampaignComplete { final_score });
                Ok(RoundAdvance::CampaignComplete { final_score })
            }
            NextStep::RetryRound => {
                debug!(round = self.round, "Round lost, replaying");
                Ok(RoundAdvance::Retry { round: self.round })
            }
        }
    }

    /// Leave the upgrade phase by briefing the next round.
    pub fn finish_upgrade(
        &mut self,
        payload: FullSyncPayload,
        now: Instant,
    ) -> Result<(), SessionError> {
        self.expect_phase(SessionPhase::Upgrade)?;
        self.begin_briefing(payload, now)
    }

    /// Reset both sides to the lobby.
    pub fn request_rematch(&mut self, now: Instant) -> Result<(), SessionError> {
        self.enter(SessionPhase::Lobby)?;
        self.reset_campaign();
        self.score = ScorePair::default();
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

    /// Drive timers and handle guest traffic.
    pub fn poll(&mut self, now: Instant) -> Vec<SessionEvent> {
        if let Some(sync) = self.sync.as_mut() {
            match sync.poll(now) {
                FullSyncAction::Resend => {
                    let payload = Payload::FullSync(Box::new(sync.payload().clone()));
                    self.conn.send(payload, now);
                }
                FullSyncAction::Exhausted => {
                    error!(round = self.round, "Guest never acknowledged the full sync");
                    self.conn.teardown(DisconnectReason::SyncExhausted);
                }
                FullSyncAction::Idle => {}
            }
        }

        for event in self.conn.poll(now) {
            match event {
                ConnectionEvent::Message(envelope) => self.handle(envelope.payload),
                ConnectionEvent::ProtocolViolation { kind, reason } => self
                    .events
                    .push(SessionEvent::ProtocolViolation { kind, reason }),
                ConnectionEvent::Disconnected(reason) => {
                    self.sync = None;
                    self.events.push(SessionEvent::Disconnected { reason });
                }
            }
        }
        std::mem::take(&mut self.events)
    }

    /// Close from this side.
    pub fn teardown(&mut self) {
        self.sync = None;
        self.conn.close();
    }

    fn handle(&mut self, payload: Payload) {
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
            Payload::Keys(keys) => {
                if self.phase() == SessionPhase::Playing {
                    self.keys = keys;
                    self.events.push(SessionEvent::Keys(keys));
                }
            }
            Payload::SyncAck(summary) => {
                let Some(sync) = self.sync.as_mut() else {
                    debug!(round = summary.round, "Acknowledgement without a transfer");
                    return;
                };
                match sync.on_ack(&summary) {
                    AckOutcome::Completed => self
                        .events
                        .push(SessionEvent::SyncAcknowledged { round: summary.round }),
                    AckOutcome::Mismatch | AckOutcome::Stale => {}
                }
            }
            Payload::UpgradeChoice { key } => {
                if self.phase() == SessionPhase::Upgrade {
                    self.events.push(SessionEvent::UpgradeChosen { key });
                } else {
                    warn!(phase = self.phase().as_str(), %key, "Upgrade choice outside the upgrade phase");
                }
            }
            Payload::Ready => {
                if self.phase() == SessionPhase::Briefing {
                    self.peer_ready = true;
                    self.events.push(SessionEvent::PeerReady);
                } else {
                    debug!(phase = self.phase().as_str(), "Ignoring ready");
                }
            }
            Payload::Rematch => self.events.push(SessionEvent::RematchRequested),
            Payload::Chat { text } => self.events.push(SessionEvent::Chat {
                from: Role::Guest,
                text,
            }),
            other => debug!(kind = other.kind().as_str(), "Ignoring message"),
        }
    }

    fn enter(&mut self, to: SessionPhase) -> Result<(), SessionError> {
        let from = self.machine.transition(to)?;
        self.events.push(SessionEvent::PhaseChanged { from, to });
        Ok(())
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

    fn reset_campaign(&mut self) {
        self.mode = None;
        self.round = 0;
        self.last_outcome = None;
        self.sync = None;
        self.peer_ready = false;
        self.last_snapshot = None;
    }
}
