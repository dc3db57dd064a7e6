//! Connection manager: the single owner of the data channel.
//!
//! Higher layers hand it payloads to send and drain [`ConnectionEvent`]s from
//! [`ConnectionManager::poll`]. It frames and verifies messages, applies the
//! backpressure policy, retries critical sends once, answers pings and runs the
//! liveness monitor. All timers are deadlines checked in `poll`.

use crate::backpressure::{Admission, BackpressurePolicy, DEFAULT_BACKPRESSURE_THRESHOLD};
use crate::channel::{ChannelError, DataChannel};
use crate::codec::{decode_message, encode_message};
use crate::liveness::{LivenessAction, LivenessConfig, LivenessMonitor};
use crate::protocol::{DeliveryClass, Envelope, Heartbeat, MessageKind, Payload};
use crate::rendezvous::ConnectionState;
use std::time::{Duration, Instant};
use tandem_core::Role;
use tracing::{debug, error, info, trace, warn};

/// Default wait before the single retry of a failed critical send.
pub const DEFAULT_CRITICAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Identity of one session in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Random id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Heartbeat timing.
    pub liveness: LivenessConfig,
    /// Buffer level above which best-effort kinds are dropped.
    pub backpressure_threshold: usize,
    /// Wait before retrying a failed critical send.
    pub critical_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            backpressure_threshold: DEFAULT_BACKPRESSURE_THRESHOLD,
            critical_retry_delay: DEFAULT_CRITICAL_RETRY_DELAY,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No pong within the liveness window.
    HeartbeatTimeout,
    /// The channel reported closed.
    ChannelClosed,
    /// A full sync was never acknowledged.
    SyncExhausted,
    /// The peer runs an incompatible protocol.
    IncompatiblePeer {
        /// Peer protocol version.
        version: u16,
        /// Peer schema hash.
        schema_hash: u64,
    },
    /// Closed by this side.
    Local,
}

impl DisconnectReason {
    /// Log key.
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::ChannelClosed => "channel_closed",
            DisconnectReason::SyncExhausted => "sync_exhausted",
            DisconnectReason::IncompatiblePeer { .. } => "incompatible_peer",
            DisconnectReason::Local => "local",
        }
    }
}

/// Result of [`ConnectionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the channel.
    Sent,
    /// Discarded by backpressure or a failed best-effort send.
    Dropped,
    /// Critical or heartbeat send failed; one retry is scheduled.
    Deferred,
    /// Connection is not open.
    Closed,
}

/// Something the session layer must react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Verified message from the peer.
    Message(Envelope),
    /// The peer sent a message that decodes but is invalid here.
    ProtocolViolation {
        /// Offending kind.
        kind: MessageKind,
        /// What was wrong.
        reason: &'static str,
    },
    /// Terminal; reported once.
    Disconnected(DisconnectReason),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames handed to the channel.
    pub frames_sent: u64,
    /// Frames received and decoded.
    pub frames_received: u64,
    /// Best-effort messages dropped by backpressure.
    pub dropped_backpressure: u64,
    /// Best-effort messages lost to a failed send.
    pub dropped_send_failure: u64,
    /// Frames discarded as undecodable.
    pub malformed: u64,
    /// Protocol violations reported.
    pub violations: u64,
    /// Critical retries performed.
    pub retries: u64,
    /// Critical messages lost after their retry.
    pub critical_lost: u64,
}

#[derive(Debug)]
struct PendingRetry {
    due: Instant,
    kind: MessageKind,
    frame: Vec<u8>,
}

/// Exclusive owner of one data channel.
pub struct ConnectionManager {
    session: SessionId,
    role: Role,
    channel: Option<Box<dyn DataChannel>>,
    state: ConnectionState,
    epoch: Instant,
    next_sequence: u32,
    next_ping: u32,
    liveness: LivenessMonitor,
    policy: BackpressurePolicy,
    retry_delay: Duration,
    retries: Vec<PendingRetry>,
    events: Vec<ConnectionEvent>,
    stats: ConnectionStats,
}

impl ConnectionManager {
    /// Take ownership of an open channel at `now`.
    pub fn new(
        channel: Box<dyn DataChannel>,
        role: Role,
        config: ConnectionConfig,
        now: Instant,
    ) -> Self {
        let session = SessionId::random();
        info!(session = session.0, role = role.as_str(), "Connection opened");
        Self {
            session,
            role,
            channel: Some(channel),
            state: ConnectionState::Connected,
            epoch: now,
            next_sequence: 0,
            next_ping: 0,
            liveness: LivenessMonitor::new(config.liveness, now),
            policy: BackpressurePolicy::new(config.backpressure_threshold),
            retry_delay: config.critical_retry_delay,
            retries: Vec::new(),
            events: Vec::new(),
            stats: ConnectionStats::default(),
        }
    }

    /// Session identity.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// `Connected` until teardown, then `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether messages can still be sent.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Smoothed heartbeat round trip.
    pub fn rtt(&self) -> Option<Duration> {
        self.liveness.rtt()
    }

    /// Critical retries currently scheduled.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    fn clock_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Frame and send `payload`.
    pub fn send(&mut self, payload: Payload, now: Instant) -> SendOutcome {
        if !self.is_connected() {
            return SendOutcome::Closed;
        }
        let kind = payload.kind();
        let envelope = Envelope {
            sequence: self.next_sequence,
            timestamp_ms: self.clock_ms(now),
            payload,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let frame = match encode_message(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                error!(kind = kind.as_str(), "Failed to encode message: {}", err);
                return SendOutcome::Dropped;
            }
        };

        let Some(channel) = self.channel.as_mut() else {
            return SendOutcome::Closed;
        };
        if self.policy.admit(kind, channel.buffered_amount()) == Admission::Drop {
            self.stats.dropped_backpressure += 1;
            trace!(kind = kind.as_str(), "Dropped under backpressure");
            return SendOutcome::Dropped;
        }

        match channel.send(&frame) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                trace!(kind = kind.as_str(), sequence = envelope.sequence, "Sent");
                SendOutcome::Sent
            }
            Err(ChannelError::Transient(reason)) => match kind.delivery() {
                DeliveryClass::Critical | DeliveryClass::Heartbeat => {
                    debug!(kind = kind.as_str(), %reason, "Send failed, retrying once");
                    self.retries.push(PendingRetry {
                        due: now + self.retry_delay,
                        kind,
                        frame,
                    });
                    SendOutcome::Deferred
                }
                DeliveryClass::BestEffort => {
                    self.stats.dropped_send_failure += 1;
                    trace!(kind = kind.as_str(), %reason, "Send failed, dropped");
                    SendOutcome::Dropped
                }
            },
            Err(ChannelError::Closed) => {
                self.teardown(DisconnectReason::ChannelClosed);
                SendOutcome::Closed
            }
        }
    }

    /// Run timers and drain inbound frames.
    pub fn poll(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        if self.is_connected() {
            self.run_retries(now);
        }
        if self.is_connected() {
            self.drain_inbound(now);
        }
        if self.is_connected() {
            match self.liveness.poll(now) {
                LivenessAction::SendPing => {
                    let heartbeat = Heartbeat {
                        sequence: self.next_ping,
                        timestamp_ms: self.clock_ms(now),
                    };
                    self.next_ping = self.next_ping.wrapping_add(1);
                    self.send(Payload::Ping(heartbeat), now);
                }
                LivenessAction::TimedOut => {
                    warn!(session = self.session.0, "Peer silent, heartbeat timed out");
                    self.teardown(DisconnectReason::HeartbeatTimeout);
                }
                LivenessAction::Idle => {}
            }
        }
        std::mem::take(&mut self.events)
    }

    fn run_retries(&mut self, now: Instant) {
        if self.retries.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retries)
            .into_iter()
            .partition(|retry| retry.due <= now);
        self.retries = waiting;

        for retry in due {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            match channel.send(&retry.frame) {
                Ok(()) => {
                    self.stats.retries += 1;
                    self.stats.frames_sent += 1;
                    debug!(kind = retry.kind.as_str(), "Critical retry sent");
                }
                Err(ChannelError::Transient(reason)) => {
                    self.stats.critical_lost += 1;
                    warn!(kind = retry.kind.as_str(), %reason, "Critical message lost after retry");
                }
                Err(ChannelError::Closed) => {
                    self.teardown(DisconnectReason::ChannelClosed);
                    return;
                }
            }
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return;
            };
            let frame = match channel.try_recv() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(_) => {
                    self.teardown(DisconnectReason::ChannelClosed);
                    return;
                }
            };

            let envelope = match decode_message(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.stats.malformed += 1;
                    warn!("Discarding malformed frame ({} bytes): {}", frame.len(), err);
                    continue;
                }
            };
            self.stats.frames_received += 1;
            let kind = envelope.kind();
            trace!(kind = kind.as_str(), sequence = envelope.sequence, "Received");

            if let Err(reason) = envelope.verify() {
                self.violation(kind, reason);
                continue;
            }
            if !kind.direction().receivable_by(self.role) {
                self.violation(kind, "message not allowed in this direction");
                continue;
            }

            match envelope.payload {
                Payload::Ping(heartbeat) => {
                    self.send(Payload::Pong(heartbeat), now);
                }
                Payload::Pong(heartbeat) => {
                    let sent_at = self.epoch + Duration::from_millis(heartbeat.timestamp_ms);
                    self.liveness.on_pong(now, sent_at);
                }
                _ => self.events.push(ConnectionEvent::Message(envelope)),
            }
        }
    }

    fn violation(&mut self, kind: MessageKind, reason: &'static str) {
        self.stats.violations += 1;
        error!(kind = kind.as_str(), reason, "Protocol violation from peer");
        self.events
            .push(ConnectionEvent::ProtocolViolation { kind, reason });
    }

    /// Stop everything: clear timers, close the channel and report
    /// [`ConnectionEvent::Disconnected`] on the next poll. Idempotent.
    pub fn teardown(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!(
            session = self.session.0,
            reason = reason.as_str(),
            "Connection closed"
        );
        self.state = ConnectionState::Disconnected;
        self.retries.clear();
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.events.push(ConnectionEvent::Disconnected(reason));
    }

    /// Close from this side.
    pub fn close(&mut self) {
        self.teardown(DisconnectReason::Local);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChannelProbe, MemoryChannel};
    use crate::snapshot_codec::encode_snapshot;
    use tandem_core::{InputKeys, SessionPhase, SimTick, Snapshot, VehicleState};

    fn pair(now: Instant) -> (ConnectionManager, ConnectionManager, ChannelProbe, ChannelProbe) {
        let (a, b) = MemoryChannel::pair();
        let (probe_a, probe_b) = (a.probe(), b.probe());
        (
            ConnectionManager::new(Box::new(a), Role::Host, ConnectionConfig::default(), now),
            ConnectionManager::new(Box::new(b), Role::Guest, ConnectionConfig::default(), now),
            probe_a,
            probe_b,
        )
    }

    fn messages(events: Vec<ConnectionEvent>) -> Vec<Payload> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::Message(envelope) => Some(envelope.payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn delivers_messages_in_order() {
        let now = Instant::now();
        let (mut host, mut guest, _, _) = pair(now);
        assert_eq!(host.send(Payload::Briefing { round: 1 }, now), SendOutcome::Sent);
        assert_eq!(host.send(Payload::Start { round: 1 }, now), SendOutcome::Sent);

        let received = messages(guest.poll(now));
        assert_eq!(
            received,
            vec![Payload::Briefing { round: 1 }, Payload::Start { round: 1 }]
        );
    }

    #[test]
    fn backpressure_drops_snapshots_but_not_critical() {
        let now = Instant::now();
        let (mut host, mut guest, probe, _) = pair(now);
        probe.set_buffered(DEFAULT_BACKPRESSURE_THRESHOLD + 1);

        let snapshot = Snapshot::new(SimTick(1), SessionPhase::Playing, VehicleState::default());
        assert_eq!(
            host.send(Payload::Snapshot(encode_snapshot(&snapshot)), now),
            SendOutcome::Dropped
        );
        assert_eq!(host.send(Payload::Ready, now), SendOutcome::Sent);
        assert_eq!(host.stats().dropped_backpressure, 1);
        assert_eq!(messages(guest.poll(now)), vec![Payload::Ready]);
    }

    #[test]
    fn critical_send_is_retried_once() {
        let now = Instant::now();
        let (mut host, mut guest, probe, _) = pair(now);
        probe.fail_next_sends(1);

        assert_eq!(host.send(Payload::Ready, now), SendOutcome::Deferred);
        assert_eq!(host.pending_retries(), 1);
        host.poll(now + Duration::from_millis(50));
        assert_eq!(host.pending_retries(), 1);
        host.poll(now + DEFAULT_CRITICAL_RETRY_DELAY);
        assert_eq!(host.pending_retries(), 0);
        assert_eq!(host.stats().retries, 1);

        let received = messages(guest.poll(now + DEFAULT_CRITICAL_RETRY_DELAY));
        assert!(received.contains(&Payload::Ready));
    }

    #[test]
    fn failed_best_effort_send_is_not_retried() {
        let now = Instant::now();
        let (_, mut guest, _, probe) = pair(now);
        probe.fail_next_sends(1);
        assert_eq!(guest.send(Payload::Keys(InputKeys::UP), now), SendOutcome::Dropped);
        assert_eq!(guest.pending_retries(), 0);
    }

    #[test]
    fn failed_heartbeat_send_is_retried() {
        let now = Instant::now();
        let (mut host, mut guest, probe, _) = pair(now);
        // exchange the scheduled pings first so the smoothed rtt starts at zero
        host.poll(now);
        guest.poll(now);
        host.poll(now);
        assert_eq!(host.rtt(), Some(Duration::ZERO));

        probe.fail_next_sends(1);
        let ping = Payload::Ping(Heartbeat {
            sequence: 7,
            timestamp_ms: 0,
        });
        assert_eq!(host.send(ping, now), SendOutcome::Deferred);
        assert_eq!(host.stats().dropped_send_failure, 0);

        let later = now + DEFAULT_CRITICAL_RETRY_DELAY;
        host.poll(later);
        assert_eq!(host.stats().retries, 1);
        guest.poll(later);
        host.poll(later);
        assert_eq!(host.rtt(), Some(DEFAULT_CRITICAL_RETRY_DELAY / 8));
    }

    #[test]
    fn pings_are_answered_and_keep_link_alive() {
        let start = Instant::now();
        let (mut host, mut guest, _, _) = pair(start);
        for step in 0..200 {
            let now = start + Duration::from_millis(step * 100);
            let host_events = host.poll(now);
            let guest_events = guest.poll(now);
            assert!(!host_events
                .iter()
                .any(|e| matches!(e, ConnectionEvent::Disconnected(_))));
            assert!(!guest_events
                .iter()
                .any(|e| matches!(e, ConnectionEvent::Disconnected(_))));
        }
        assert!(host.is_connected());
        assert!(host.rtt().is_some());
    }

    #[test]
    fn silent_peer_disconnects_once_and_stops_sending() {
        let start = Instant::now();
        let (mut host, _guest, probe, _) = pair(start);
        let mut disconnects = 0;
        for step in 0..100 {
            let now = start + Duration::from_millis(step * 100);
            for event in host.poll(now) {
                if event == ConnectionEvent::Disconnected(DisconnectReason::HeartbeatTimeout) {
                    disconnects += 1;
                }
            }
        }
        assert_eq!(disconnects, 1);
        assert_eq!(host.state(), ConnectionState::Disconnected);
        let sent = probe.frames_sent();
        assert_eq!(host.send(Payload::Ready, start), SendOutcome::Closed);
        assert_eq!(probe.frames_sent(), sent);
    }

    #[test]
    fn teardown_clears_scheduled_retries() {
        let now = Instant::now();
        let (mut host, _guest, probe, _) = pair(now);
        probe.fail_next_sends(1);
        host.send(Payload::Ready, now);
        host.close();
        assert_eq!(host.pending_retries(), 0);
        let events = host.poll(now + Duration::from_secs(1));
        assert_eq!(events, vec![ConnectionEvent::Disconnected(DisconnectReason::Local)]);
        assert!(host.poll(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn wrong_direction_is_a_violation() {
        let now = Instant::now();
        let (mut host, mut guest, _, _) = pair(now);
        // only the host may send start
        guest.send(Payload::Start { round: 1 }, now);
        let events = host.poll(now);
        assert!(events.contains(&ConnectionEvent::ProtocolViolation {
            kind: MessageKind::Start,
            reason: "message not allowed in this direction",
        }));
        assert!(host.is_connected());
    }

    #[test]
    fn malformed_frames_are_discarded() {
        let now = Instant::now();
        let (a, mut b) = MemoryChannel::pair();
        let mut host = ConnectionManager::new(Box::new(a), Role::Host, ConnectionConfig::default(), now);
        b.send(&[3, 0, 0, 0, 99, 1, 2]).unwrap();
        let events = host.poll(now);
        assert!(events.is_empty());
        assert_eq!(host.stats().malformed, 1);
        assert!(host.is_connected());
    }

    #[test]
    fn peer_close_is_reported() {
        let now = Instant::now();
        let (mut host, mut guest, _, _) = pair(now);
        guest.close();
        let events = host.poll(now);
        assert_eq!(
            events,
            vec![ConnectionEvent::Disconnected(DisconnectReason::ChannelClosed)]
        );
    }
}
