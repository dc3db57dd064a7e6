//! Rendezvous: turning a room code into a connected data channel.
//!
//! The host registers `tandem-<CODE>` with a [`SignalingService`] and waits.
//! The guest connects to the same id, sends an `Offer` with its candidates,
//! receives an `Answer` with the host's candidates and transport fingerprint,
//! and dials the candidates in priority order. The signaling link is dropped as
//! soon as the data channel is open.

use crate::channel::DataChannel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{RoomCode, RoomCodeError, Role};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

/// Default bound on one full negotiation.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound on dialing one candidate.
pub const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of fresh codes tried after a collision.
pub const DEFAULT_MAX_COLLISION_RETRIES: u32 = 5;

/// Lifecycle of the transport between the two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing started.
    Idle,
    /// Host registered its code and awaits a guest.
    Offering,
    /// Guest resolved a code and is sending its offer.
    Answering,
    /// Candidates exchanged, dialing/accepting.
    Connecting,
    /// Data channel open.
    Connected,
    /// Terminal.
    Disconnected,
}

impl ConnectionState {
    /// Log key.
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Offering => "offering",
            ConnectionState::Answering => "answering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Path type of a candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Local interface address.
    Host,
    /// Public address discovered through STUN.
    ServerReflexive,
    /// Address on a relay.
    Relayed,
}

impl CandidateKind {
    /// Dial order: lower goes first.
    pub const fn rank(self) -> u8 {
        match self {
            CandidateKind::Host => 0,
            CandidateKind::ServerReflexive => 1,
            CandidateKind::Relayed => 2,
        }
    }

    /// Whether the candidate goes straight to the peer.
    pub const fn is_direct(self) -> bool {
        !matches!(self, CandidateKind::Relayed)
    }
}

/// One reachable address of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Path type.
    pub kind: CandidateKind,
    /// Address to dial.
    pub addr: SocketAddr,
    /// Tie-break within a kind; higher goes first.
    pub priority: u32,
}

impl Candidate {
    /// Build a candidate.
    pub fn new(kind: CandidateKind, addr: SocketAddr, priority: u32) -> Self {
        Self {
            kind,
            addr,
            priority,
        }
    }
}

/// Order candidates for connectivity checks: host, reflexive, relayed.
pub fn order_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| (c.kind.rank(), Reverse(c.priority)));
}

/// Digest of the host's transport certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint of DER-encoded certificate bytes.
    pub fn of(der: &[u8]) -> Self {
        Self(*blake3::hash(der).as_bytes())
    }
}

/// Messages exchanged over a signaling link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Guest → host.
    Offer {
        /// Guest candidates.
        candidates: Vec<Candidate>,
    },
    /// Host → guest.
    Answer {
        /// Host candidates.
        candidates: Vec<Candidate>,
        /// Certificate pin for transports that use one.
        fingerprint: Option<Fingerprint>,
    },
    /// Either side gives up.
    Reject {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bidirectional signaling pipe between the two peers during negotiation.
#[derive(Debug)]
pub struct SignalingLink {
    tx: mpsc::UnboundedSender<SignalMessage>,
    rx: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalingLink {
    /// Connected pair of links.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self { tx: a_tx, rx: b_rx }, Self { tx: b_tx, rx: a_rx })
    }

    /// Send a message to the peer.
    pub fn send(&self, message: SignalMessage) -> Result<(), RendezvousError> {
        self.tx
            .send(message)
            .map_err(|_| RendezvousError::SignalingClosed)
    }

    /// Next message from the peer.
    pub async fn recv(&mut self) -> Result<SignalMessage, RendezvousError> {
        self.rx.recv().await.ok_or(RendezvousError::SignalingClosed)
    }
}

/// A registered peer id and the links of guests connecting to it.
#[derive(Debug)]
pub struct Registration {
    peer_id: String,
    incoming: mpsc::UnboundedReceiver<SignalingLink>,
}

impl Registration {
    /// Wrap the receiving end of a registry entry.
    pub fn new(peer_id: String, incoming: mpsc::UnboundedReceiver<SignalingLink>) -> Self {
        Self { peer_id, incoming }
    }

    /// Registered id.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Wait for the next guest.
    pub async fn next_link(&mut self) -> Option<SignalingLink> {
        self.incoming.recv().await
    }
}

/// Rendezvous directory that pairs a host id with a connecting guest.
#[async_trait]
pub trait SignalingService: Send + Sync {
    /// Claim `peer_id`; fails with [`RendezvousError::IdUnavailable`] when taken.
    async fn register(&self, peer_id: &str) -> Result<Registration, RendezvousError>;

    /// Reach a registered id; fails with [`RendezvousError::NotFound`].
    async fn connect(&self, peer_id: &str) -> Result<SignalingLink, RendezvousError>;

    /// Release `peer_id`.
    async fn unregister(&self, peer_id: &str);
}

/// Candidate gathering and data channel establishment.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Local candidates to advertise.
    async fn gather(&self) -> anyhow::Result<Vec<Candidate>>;

    /// Open relayed paths to the remote `candidates` before answering.
    async fn permit(&self, _remote: &[Candidate]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Wait for the next inbound data channel.
    async fn accept(&self) -> anyhow::Result<Box<dyn DataChannel>>;

    /// Open a data channel to one remote candidate.
    async fn dial(
        &self,
        candidate: &Candidate,
        fingerprint: Option<Fingerprint>,
    ) -> anyhow::Result<Box<dyn DataChannel>>;

    /// Pin advertised in the host's answer.
    fn fingerprint(&self) -> Option<Fingerprint>;
}

/// Rendezvous failures.
#[derive(Debug, Error)]
pub enum RendezvousError {
    /// Peer id already registered.
    #[error("peer id {0} is already registered")]
    IdUnavailable(String),
    /// No host registered under the code.
    #[error("no room registered as {0}")]
    NotFound(String),
    /// Negotiation took longer than the configured bound.
    #[error("negotiation timed out")]
    Timeout,
    /// Error in the middle of negotiation.
    #[error("channel error: {0}")]
    Channel(String),
    /// Every candidate pair failed.
    #[error("no candidate pair connected")]
    NoRoute,
    /// Every generated code collided.
    #[error("no free room code after {attempts} attempts")]
    CodeSpaceExhausted {
        /// Codes tried.
        attempts: u32,
    },
    /// The guest typed an invalid code.
    #[error("invalid room code: {0}")]
    InvalidCode(#[from] RoomCodeError),
    /// The peer gave up.
    #[error("peer rejected negotiation: {0}")]
    Rejected(String),
    /// Signaling link closed before negotiation finished.
    #[error("signaling link closed")]
    SignalingClosed,
    /// This negotiator already failed; start a fresh one.
    #[error("rendezvous already disconnected")]
    Terminated,
}

/// Timing and retry bounds for rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Bound on a whole negotiation.
    pub negotiation_timeout: Duration,
    /// Bound on each candidate dial.
    pub candidate_timeout: Duration,
    /// Fresh codes tried after a collision.
    pub max_collision_retries: u32,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
            max_collision_retries: DEFAULT_MAX_COLLISION_RETRIES,
        }
    }
}

/// A registered room awaiting its guest.
#[derive(Debug)]
pub struct HostedRoom {
    code: RoomCode,
    registration: Registration,
}

impl HostedRoom {
    /// Code to show the user.
    pub fn code(&self) -> &RoomCode {
        &self.code
    }
}

/// Result of a successful negotiation.
pub struct Established {
    /// Code the peers met under.
    pub room_code: RoomCode,
    /// Local role.
    pub role: Role,
    /// Open data channel.
    pub channel: Box<dyn DataChannel>,
    /// Candidate kind that connected, when known locally.
    pub path: Option<CandidateKind>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("room_code", &self.room_code)
            .field("role", &self.role)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Runs one side of a negotiation and publishes its [`ConnectionState`].
pub struct Rendezvous {
    signaling: Arc<dyn SignalingService>,
    transport: Arc<dyn Transport>,
    config: RendezvousConfig,
    state: watch::Sender<ConnectionState>,
}

impl Rendezvous {
    /// New negotiator in `Idle`.
    pub fn new(
        signaling: Arc<dyn SignalingService>,
        transport: Arc<dyn Transport>,
        config: RendezvousConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            signaling,
            transport,
            config,
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = previous.as_str(), to = next.as_str(), "Rendezvous state changed");
        }
    }

    fn ensure_live(&self) -> Result<(), RendezvousError> {
        if self.state() == ConnectionState::Disconnected {
            Err(RendezvousError::Terminated)
        } else {
            Ok(())
        }
    }

    fn fail(&self, err: RendezvousError) -> RendezvousError {
        warn!("Rendezvous failed: {}", err);
        self.set_state(ConnectionState::Disconnected);
        err
    }

    /// Register a fresh room code, regenerating on collision.
    ///
    /// Every operation fails with [`RendezvousError::Terminated`] once the
    /// negotiator reached `Disconnected`.
    #[instrument(skip(self, rng))]
    pub async fn host_room<R>(&self, rng: &mut R) -> Result<HostedRoom, RendezvousError>
    where
        R: rand::Rng + Send + ?Sized,
    {
        self.ensure_live()?;
        let attempts = self.config.max_collision_retries + 1;
        for attempt in 1..=attempts {
            let code = RoomCode::generate(rng);
            match self.signaling.register(&code.peer_id()).await {
                Ok(registration) => {
                    self.set_state(ConnectionState::Offering);
                    info!(code = %code, attempt, "Room registered");
                    return Ok(HostedRoom { code, registration });
                }
                Err(RendezvousError::IdUnavailable(id)) => {
                    warn!(peer_id = %id, attempt, "Room code collision, regenerating");
                }
                Err(err) => return Err(self.fail(err)),
            }
        }
        Err(self.fail(RendezvousError::CodeSpaceExhausted { attempts }))
    }

    /// Wait for a guest on `room` and complete the negotiation.
    ///
    /// Waiting for the guest to show up is unbounded; the negotiation that
    /// follows is bounded by `negotiation_timeout`.
    #[instrument(skip(self, room), fields(code = %room.code))]
    pub async fn accept_guest(&self, room: HostedRoom) -> Result<Established, RendezvousError> {
        let HostedRoom {
            code,
            mut registration,
        } = room;
        if let Err(err) = self.ensure_live() {
            self.signaling.unregister(registration.peer_id()).await;
            return Err(err);
        }

        let Some(link) = registration.next_link().await else {
            self.signaling.unregister(registration.peer_id()).await;
            return Err(self.fail(RendezvousError::SignalingClosed));
        };
        info!("Guest reached the room");

        let outcome =
            tokio::time::timeout(self.config.negotiation_timeout, self.answer(link)).await;
        self.signaling.unregister(registration.peer_id()).await;

        match outcome {
            Ok(Ok(channel)) => {
                self.set_state(ConnectionState::Connected);
                info!("Data channel open");
                Ok(Established {
                    room_code: code,
                    role: Role::Host,
                    channel,
                    path: None,
                })
            }
            Ok(Err(err)) => Err(self.fail(err)),
            Err(_) => Err(self.fail(RendezvousError::Timeout)),
        }
    }

    async fn answer(&self, mut link: SignalingLink) -> Result<Box<dyn DataChannel>, RendezvousError> {
        let offered = match link.recv().await? {
            SignalMessage::Offer { candidates } => candidates,
            SignalMessage::Reject { reason } => return Err(RendezvousError::Rejected(reason)),
            SignalMessage::Answer { .. } => {
                return Err(RendezvousError::Channel("unexpected answer from guest".into()))
            }
        };
        debug!(count = offered.len(), "Received guest offer");

        self.transport
            .permit(&offered)
            .await
            .map_err(|err| RendezvousError::Channel(format!("{err:#}")))?;
        let candidates = self
            .transport
            .gather()
            .await
            .map_err(|err| RendezvousError::Channel(format!("{err:#}")))?;
        link.send(SignalMessage::Answer {
            candidates,
            fingerprint: self.transport.fingerprint(),
        })?;
        self.set_state(ConnectionState::Connecting);

        let accept = self.transport.accept();
        tokio::pin!(accept);
        let mut link_open = true;
        loop {
            tokio::select! {
                biased;
                accepted = &mut accept => {
                    return accepted.map_err(|err| RendezvousError::Channel(format!("{err:#}")));
                }
                message = link.recv(), if link_open => match message {
                    Ok(SignalMessage::Reject { reason }) => {
                        return Err(RendezvousError::Rejected(reason));
                    }
                    Ok(other) => debug!(?other, "Ignoring signaling message while connecting"),
                    // The guest drops its link once its side is open
                    Err(_) => link_open = false,
                },
            }
        }
    }

    /// Join the room named by user input.
    #[instrument(skip(self))]
    pub async fn join_room(&self, input: &str) -> Result<Established, RendezvousError> {
        self.ensure_live()?;
        let code = RoomCode::parse(input).map_err(|err| self.fail(err.into()))?;
        self.set_state(ConnectionState::Answering);

        let outcome =
            tokio::time::timeout(self.config.negotiation_timeout, self.offer(&code)).await;
        match outcome {
            Ok(Ok((channel, path))) => {
                self.set_state(ConnectionState::Connected);
                info!(path = ?path, "Data channel open");
                Ok(Established {
                    room_code: code,
                    role: Role::Guest,
                    channel,
                    path: Some(path),
                })
            }
            Ok(Err(err)) => Err(self.fail(err)),
            Err(_) => Err(self.fail(RendezvousError::Timeout)),
        }
    }

    async fn offer(
        &self,
        code: &RoomCode,
    ) -> Result<(Box<dyn DataChannel>, CandidateKind), RendezvousError> {
        let mut link = self.signaling.connect(&code.peer_id()).await?;

        let candidates = self
            .transport
            .gather()
            .await
            .map_err(|err| RendezvousError::Channel(format!("{err:#}")))?;
        link.send(SignalMessage::Offer { candidates })?;

        let (mut remote, fingerprint) = match link.recv().await? {
            SignalMessage::Answer {
                candidates,
                fingerprint,
            } => (candidates, fingerprint),
            SignalMessage::Reject { reason } => return Err(RendezvousError::Rejected(reason)),
            SignalMessage::Offer { .. } => {
                return Err(RendezvousError::Channel("unexpected offer from host".into()))
            }
        };
        self.set_state(ConnectionState::Connecting);
        order_candidates(&mut remote);

        for candidate in &remote {
            let dial = self.transport.dial(candidate, fingerprint);
            match tokio::time::timeout(self.config.candidate_timeout, dial).await {
                Ok(Ok(channel)) => {
                    drop(link);
                    return Ok((channel, candidate.kind));
                }
                Ok(Err(err)) => {
                    debug!(addr = %candidate.addr, kind = ?candidate.kind, "Candidate failed: {err:#}")
                }
                Err(_) => debug!(addr = %candidate.addr, kind = ?candidate.kind, "Candidate timed out"),
            }
        }

        let _ = link.send(SignalMessage::Reject {
            reason: "no candidate pair connected".into(),
        });
        Err(RendezvousError::NoRoute)
    }
}
