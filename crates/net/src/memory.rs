//! In-process signaling registry and virtual transport.
//!
//! `MemoryNetwork` stands in for both the signaling server and the network
//! between two peers living in one process. Direct candidate paths can be
//! blocked to force relay fallback, and the registry can be told to swallow
//! offers so negotiations run into their timeout.

use crate::channel::{ChannelError, DataChannel};
use crate::rendezvous::{
    Candidate, CandidateKind, Fingerprint, Registration, RendezvousError, SignalingLink,
    SignalingService, Transport,
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct ProbeState {
    buffered: usize,
    fail_next: u32,
    frames_sent: u64,
}

/// Test handle that shapes one side of a [`MemoryChannel`].
#[derive(Debug, Clone, Default)]
pub struct ChannelProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl ChannelProbe {
    fn state(&self) -> MutexGuard<'_, ProbeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report `bytes` as queued from now on.
    pub fn set_buffered(&self, bytes: usize) {
        self.state().buffered = bytes;
    }

    /// Fail the next `count` sends with a transient error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Frames accepted for delivery so far.
    pub fn frames_sent(&self) -> u64 {
        self.state().frames_sent
    }
}

/// One end of an in-process channel pair.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    probe: ChannelProbe,
}

impl MemoryChannel {
    /// Connected pair.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
                probe: ChannelProbe::default(),
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
                probe: ChannelProbe::default(),
            },
        )
    }

    /// Shaping handle for this end.
    pub fn probe(&self) -> ChannelProbe {
        self.probe.clone()
    }
}

impl DataChannel for MemoryChannel {
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        {
            let mut probe = self.probe.state();
            if probe.fail_next > 0 {
                probe.fail_next -= 1;
                return Err(ChannelError::Transient("injected send failure".into()));
            }
            probe.frames_sent += 1;
        }
        trace!("Memory channel send {} bytes", frame.len());
        tx.send(frame.to_vec()).map_err(|_| ChannelError::Closed)
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    fn buffered_amount(&self) -> usize {
        self.probe.state().buffered
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

struct Listener {
    owner: u8,
    tx: mpsc::UnboundedSender<MemoryChannel>,
}

#[derive(Default)]
struct NetworkState {
    rooms: HashMap<String, mpsc::UnboundedSender<SignalingLink>>,
    listeners: HashMap<SocketAddr, Listener>,
    parked: Vec<SignalingLink>,
    next_endpoint: u8,
    direct_blocked: bool,
    silent: bool,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signaling service backed by this network's registry.
    pub fn signaling(&self) -> MemorySignaling {
        MemorySignaling {
            network: self.clone(),
        }
    }

    /// New endpoint with host, reflexive and relayed candidates.
    pub fn transport(&self) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.next_endpoint = state.next_endpoint.wrapping_add(1);
        let id = state.next_endpoint;

        let candidates = vec![
            Candidate::new(
                CandidateKind::Host,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, id)), 40_000),
                3_000,
            ),
            Candidate::new(
                CandidateKind::ServerReflexive,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, id)), 50_000),
                2_000,
            ),
            Candidate::new(
                CandidateKind::Relayed,
                SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
                    3_478 + u16::from(id),
                ),
                1_000,
            ),
        ];
        for candidate in &candidates {
            state.listeners.insert(
                candidate.addr,
                Listener {
                    owner: id,
                    tx: tx.clone(),
                },
            );
        }

        MemoryTransport {
            network: self.clone(),
            id,
            candidates,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }

    /// Make every host and reflexive path unreachable.
    pub fn block_direct_paths(&self, blocked: bool) {
        self.state().direct_blocked = blocked;
    }

    /// Swallow guest offers so the host never answers.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Whether `peer_id` is currently registered.
    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.state().rooms.contains_key(peer_id)
    }
}

/// [`SignalingService`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemorySignaling {
    network: MemoryNetwork,
}

#[async_trait]
impl SignalingService for MemorySignaling {
    async fn register(&self, peer_id: &str) -> Result<Registration, RendezvousError> {
        let mut state = self.network.state();
        if state.rooms.contains_key(peer_id) {
            return Err(RendezvousError::IdUnavailable(peer_id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.rooms.insert(peer_id.to_string(), tx);
        debug!(peer_id, "Registered");
        Ok(Registration::new(peer_id.to_string(), rx))
    }

    async fn connect(&self, peer_id: &str) -> Result<SignalingLink, RendezvousError> {
        let mut state = self.network.state();
        let Some(room) = state.rooms.get(peer_id) else {
            return Err(RendezvousError::NotFound(peer_id.to_string()));
        };
        let (host_side, guest_side) = SignalingLink::pair();

        if state.silent {
            state.parked.push(host_side);
            return Ok(guest_side);
        }
        if room.send(host_side).is_err() {
            state.rooms.remove(peer_id);
            return Err(RendezvousError::NotFound(peer_id.to_string()));
        }
        Ok(guest_side)
    }

    async fn unregister(&self, peer_id: &str) {
        self.network.state().rooms.remove(peer_id);
    }
}

/// Virtual [`Transport`] endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: u8,
    candidates: Vec<Candidate>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryChannel>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn gather(&self) -> anyhow::Result<Vec<Candidate>> {
        Ok(self.candidates.clone())
    }

    async fn accept(&self) -> anyhow::Result<Box<dyn DataChannel>> {
        let mut incoming = self.incoming.lock().await;
        let channel = incoming
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory endpoint {} closed", self.id))?;
        Ok(Box::new(channel))
    }

    async fn dial(
        &self,
        candidate: &Candidate,
        _fingerprint: Option<Fingerprint>,
    ) -> anyhow::Result<Box<dyn DataChannel>> {
        let state = self.network.state();
        if state.direct_blocked && candidate.kind.is_direct() {
            bail!("direct path to {} is blocked", candidate.addr);
        }
        let Some(listener) = state.listeners.get(&candidate.addr) else {
            bail!("nothing listens on {}", candidate.addr);
        };
        if listener.owner == self.id {
            bail!("refusing to dial own candidate {}", candidate.addr);
        }

        let (local, remote) = MemoryChannel::pair();
        listener
            .tx
            .send(remote)
            .map_err(|_| anyhow!("endpoint at {} is gone", candidate.addr))?;
        debug!(addr = %candidate.addr, kind = ?candidate.kind, "Memory dial connected");
        Ok(Box::new(local))
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_in_order() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.try_recv().unwrap(), Some(b"two".to_vec()));
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[test]
    fn close_is_seen_by_peer() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.close();
        assert!(!a.is_open());
        assert_eq!(a.send(b"x"), Err(ChannelError::Closed));
        assert_eq!(b.try_recv(), Err(ChannelError::Closed));
    }

    #[test]
    fn probe_injects_failures_and_backlog() {
        let (mut a, _b) = MemoryChannel::pair();
        let probe = a.probe();
        probe.set_buffered(70_000);
        probe.fail_next_sends(1);
        assert_eq!(a.buffered_amount(), 70_000);
        assert!(matches!(a.send(b"x"), Err(ChannelError::Transient(_))));
        assert!(a.send(b"x").is_ok());
        assert_eq!(probe.frames_sent(), 1);
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_unknown_ids() {
        let network = MemoryNetwork::new();
        let signaling = network.signaling();
        let _room = signaling.register("tandem-ABC234").await.unwrap();
        assert!(matches!(
            signaling.register("tandem-ABC234").await,
            Err(RendezvousError::IdUnavailable(_))
        ));
        assert!(matches!(
            signaling.connect("tandem-ZZZ999").await,
            Err(RendezvousError::NotFound(_))
        ));
        signaling.unregister("tandem-ABC234").await;
        assert!(!network.is_registered("tandem-ABC234"));
    }

    #[tokio::test]
    async fn blocked_network_only_reaches_relay() {
        let network = MemoryNetwork::new();
        let host = network.transport();
        let guest = network.transport();
        network.block_direct_paths(true);

        let candidates = host.gather().await.unwrap();
        for candidate in &candidates {
            let result = guest.dial(candidate, None).await;
            assert_eq!(result.is_ok(), candidate.kind == CandidateKind::Relayed);
        }
        // the relay dial queued one inbound channel
        assert!(host.accept().await.is_ok());
    }
}
