//! TURN (RFC 5766) relay client sharing the transport's UDP socket.
//!
//! The host allocates a relayed address on each configured server and
//! advertises it as a relayed candidate. Datagrams from a peer arrive from the
//! server as Data indications and replies leave as Send indications.
//! [`RelaySocket`] does the wrapping underneath quinn, so the QUIC connection
//! sees the peer's own address whichever path it took.

use crate::stun::{self, Class, StunError, StunMessage, TransactionId};
use md5::{Digest, Md5};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

const METHOD_ALLOCATE: u16 = 0x003;
const METHOD_REFRESH: u16 = 0x004;
const METHOD_SEND: u16 = 0x006;
const METHOD_DATA: u16 = 0x007;
const METHOD_CREATE_PERMISSION: u16 = 0x008;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000D;
const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
const ATTR_DATA: u16 = 0x0013;
const ATTR_REALM: u16 = 0x0014;
const ATTR_NONCE: u16 = 0x0015;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

const TRANSPORT_UDP: u8 = 17;
const CODE_UNAUTHORIZED: u16 = 401;
const CODE_STALE_NONCE: u16 = 438;

/// Lifetime assumed when the server does not state one.
pub const DEFAULT_ALLOCATION_LIFETIME: Duration = Duration::from_secs(600);

/// Permissions expire after five minutes; renew well before.
pub const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const REQUEST_ATTEMPTS: u32 = 4;
const AUTH_ATTEMPTS: u32 = 3;

/// One TURN server and its long-term credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServer {
    /// `host:port` of the server.
    pub address: String,
    /// Long-term credential user. Empty for open relays.
    pub username: String,
    /// Long-term credential password.
    pub password: String,
}

/// TURN failures.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Malformed server message.
    #[error("TURN message error: {0}")]
    Stun(#[from] StunError),
    /// Socket error.
    #[error("TURN socket error: {0}")]
    Io(#[from] io::Error),
    /// No answer after every retransmission.
    #[error("TURN server did not answer")]
    Timeout,
    /// Server answered with an error code.
    #[error("TURN server rejected the request: {code} {reason}")]
    Rejected {
        /// STUN error code.
        code: u16,
        /// Reason phrase.
        reason: String,
    },
    /// Allocate success without XOR-RELAYED-ADDRESS.
    #[error("TURN allocation carried no relayed address")]
    MissingRelayedAddress,
}

/// MD5 of `username:realm:password`, the long-term credential key.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let digest = Md5::digest(format!("{username}:{realm}:{password}").as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest);
    key
}

fn error_code(message: &StunMessage) -> (u16, String) {
    match message.attribute(ATTR_ERROR_CODE) {
        Some(value) if value.len() >= 4 => (
            u16::from(value[2] & 0x07) * 100 + u16::from(value[3]),
            String::from_utf8_lossy(&value[4..]).into_owned(),
        ),
        _ => (0, String::new()),
    }
}

fn lifetime_of(message: &StunMessage) -> Duration {
    message
        .attribute(ATTR_LIFETIME)
        .and_then(|value| <[u8; 4]>::try_from(value).ok())
        .map(|raw| Duration::from_secs(u64::from(u32::from_be_bytes(raw))))
        .unwrap_or(DEFAULT_ALLOCATION_LIFETIME)
}

/// Send indication carrying `contents` to `peer`.
pub fn send_indication(peer: SocketAddr, contents: &[u8]) -> Vec<u8> {
    let transaction: TransactionId = rand::random();
    StunMessage::new(METHOD_SEND, Class::Indication, transaction)
        .with(ATTR_XOR_PEER_ADDRESS, stun::encode_xor_address(peer, &transaction))
        .with(ATTR_DATA, contents.to_vec())
        .encode()
}

#[derive(Debug, Clone)]
struct Auth {
    username: String,
    realm: String,
    nonce: Vec<u8>,
    key: [u8; 16],
}

#[derive(Debug, Default)]
struct RelayState {
    servers: HashSet<SocketAddr>,
    /// Peers first heard through a relay, and the server that relayed them.
    routes: HashMap<SocketAddr, SocketAddr>,
    pending: HashMap<TransactionId, oneshot::Sender<StunMessage>>,
}

/// UDP socket under the quinn endpoint that also speaks TURN.
///
/// Traffic from a registered TURN server is unwrapped: Data indications are
/// handed to quinn as datagrams from the relayed peer, responses complete the
/// matching [`RelaySocket::transact`]. Everything else passes through.
#[derive(Debug)]
pub struct RelaySocket {
    io: UdpSocket,
    state: Mutex<RelayState>,
}

impl RelaySocket {
    /// Take over a bound socket.
    pub fn new(io: UdpSocket) -> Self {
        Self {
            io,
            state: Mutex::new(RelayState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Peer reached through a relay, and that relay.
    pub fn route(&self, peer: SocketAddr) -> Option<SocketAddr> {
        self.state().routes.get(&peer).copied()
    }

    /// Send a request to `server` and wait for its response, retransmitting
    /// with doubling timeouts. Needs the quinn endpoint to be polling receives.
    pub async fn transact(
        &self,
        server: SocketAddr,
        request: &StunMessage,
        key: Option<&[u8]>,
    ) -> Result<StunMessage, TurnError> {
        let bytes = match key {
            Some(key) => request.encode_with_integrity(key),
            None => request.encode(),
        };
        let (reply_tx, mut reply_rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.servers.insert(server);
            state.pending.insert(request.transaction, reply_tx);
        }

        let mut wait = REQUEST_TIMEOUT;
        let mut outcome = Err(TurnError::Timeout);
        for attempt in 1..=REQUEST_ATTEMPTS {
            if let Err(err) = self.io.send_to(&bytes, server).await {
                outcome = Err(err.into());
                break;
            }
            trace!(%server, method = request.method, attempt, "TURN request sent");
            match tokio::time::timeout(wait, &mut reply_rx).await {
                Ok(Ok(response)) => {
                    outcome = Ok(response);
                    break;
                }
                Ok(Err(_)) => break,
                Err(_) => wait *= 2,
            }
        }
        self.state().pending.remove(&request.transaction);
        outcome
    }

    /// Handle a datagram from a TURN server. Returns the relayed peer and the
    /// payload length when a Data indication was unwrapped into `datagram`.
    fn unwrap_from_server(
        &self,
        server: SocketAddr,
        datagram: &mut [u8],
    ) -> Option<(SocketAddr, usize)> {
        if !stun::looks_like_stun(datagram) {
            trace!(%server, "Dropping non-STUN datagram from relay");
            return None;
        }
        let message = match StunMessage::decode(datagram) {
            Ok(message) => message,
            Err(err) => {
                debug!(%server, "Malformed relay message: {}", err);
                return None;
            }
        };

        if message.method == METHOD_DATA && message.class == Class::Indication {
            let peer = message.xor_address(ATTR_XOR_PEER_ADDRESS)?;
            let data = message.attribute(ATTR_DATA)?;
            let len = data.len();
            datagram[..len].copy_from_slice(data);
            self.state().routes.entry(peer).or_insert_with(|| {
                debug!(%peer, %server, "Peer reached through relay");
                server
            });
            return Some((peer, len));
        }

        let waiter = self.state().pending.remove(&message.transaction);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => trace!(%server, "Unsolicited relay response"),
        }
        None
    }
}

impl AsyncUdpSocket for RelaySocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(WritablePoller {
            socket: self,
            waiting: None,
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        match self.route(transmit.destination) {
            Some(server) => {
                let wrapped = send_indication(transmit.destination, transmit.contents);
                self.io.try_send_to(&wrapped, server)?;
            }
            None => {
                self.io.try_send_to(transmit.contents, transmit.destination)?;
            }
        }
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let (Some(buf), Some(slot)) = (bufs.first_mut(), meta.first_mut()) else {
            return Poll::Ready(Ok(0));
        };
        loop {
            let mut read = ReadBuf::new(&mut buf[..]);
            let from = match ready!(self.io.poll_recv_from(cx, &mut read)) {
                Ok(from) => from,
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(err) => return Poll::Ready(Err(err)),
            };
            let len = read.filled().len();

            let is_server = self.state().servers.contains(&from);
            let (addr, len) = if is_server {
                match self.unwrap_from_server(from, &mut buf[..len]) {
                    Some(relayed) => relayed,
                    None => continue,
                }
            } else {
                (from, len)
            };
            *slot = RecvMeta {
                addr,
                len,
                stride: len,
                ecn: None,
                dst_ip: None,
            };
            return Poll::Ready(Ok(1));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }
}

type Writable = Pin<Box<dyn Future<Output = io::Result<()>> + Send + Sync>>;

struct WritablePoller {
    socket: Arc<RelaySocket>,
    waiting: Option<Writable>,
}

impl std::fmt::Debug for WritablePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritablePoller").finish_non_exhaustive()
    }
}

impl UdpPoller for WritablePoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let waiting = this.waiting.get_or_insert_with(|| {
            let socket = Arc::clone(&this.socket);
            Box::pin(async move { socket.io.writable().await })
        });
        let result = waiting.as_mut().poll(cx);
        if result.is_ready() {
            this.waiting = None;
        }
        result
    }
}

/// A relayed address held on one TURN server.
#[derive(Debug)]
pub struct RelayAllocation {
    socket: Arc<RelaySocket>,
    server: SocketAddr,
    credentials: RelayServer,
    auth: Option<Auth>,
    relayed: SocketAddr,
    lifetime: Duration,
    permitted: Vec<SocketAddr>,
}

impl RelayAllocation {
    /// Allocate a UDP relay on `server`, answering an authentication challenge
    /// when the server sends one.
    pub async fn allocate(
        socket: Arc<RelaySocket>,
        server: SocketAddr,
        credentials: RelayServer,
    ) -> Result<Self, TurnError> {
        let mut allocation = Self {
            socket,
            server,
            credentials,
            auth: None,
            relayed: server,
            lifetime: DEFAULT_ALLOCATION_LIFETIME,
            permitted: Vec::new(),
        };
        let response = allocation
            .request(|transaction| {
                StunMessage::new(METHOD_ALLOCATE, Class::Request, transaction)
                    .with(ATTR_REQUESTED_TRANSPORT, vec![TRANSPORT_UDP, 0, 0, 0])
            })
            .await?;
        allocation.relayed = response
            .xor_address(ATTR_XOR_RELAYED_ADDRESS)
            .ok_or(TurnError::MissingRelayedAddress)?;
        allocation.lifetime = lifetime_of(&response);
        info!(
            server = %server,
            relayed = %allocation.relayed,
            lifetime_secs = allocation.lifetime.as_secs(),
            "Relay allocated"
        );
        Ok(allocation)
    }

    /// Server holding the allocation.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Address peers send to.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed
    }

    /// Granted lifetime.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// How long to wait before the next [`RelayAllocation::refresh`].
    pub fn refresh_interval(&self) -> Duration {
        (self.lifetime / 2).min(PERMISSION_REFRESH)
    }

    /// Let datagrams from `peers` through the relay. Peers of the other
    /// address family are skipped.
    pub async fn permit(&mut self, peers: &[SocketAddr]) -> Result<(), TurnError> {
        let family = self.relayed.is_ipv4();
        for peer in peers.iter().filter(|peer| peer.is_ipv4() == family) {
            if !self.permitted.iter().any(|known| known.ip() == peer.ip()) {
                self.permitted.push(*peer);
            }
        }
        self.renew_permissions().await
    }

    async fn renew_permissions(&mut self) -> Result<(), TurnError> {
        if self.permitted.is_empty() {
            return Ok(());
        }
        let peers = self.permitted.clone();
        self.request(|transaction| {
            let mut message = StunMessage::new(METHOD_CREATE_PERMISSION, Class::Request, transaction);
            for peer in &peers {
                message.push(ATTR_XOR_PEER_ADDRESS, stun::encode_xor_address(*peer, &transaction));
            }
            message
        })
        .await?;
        debug!(server = %self.server, count = peers.len(), "Relay permissions installed");
        Ok(())
    }

    /// Extend the allocation and renew its permissions.
    pub async fn refresh(&mut self) -> Result<(), TurnError> {
        let lifetime = self.lifetime.as_secs() as u32;
        let response = self
            .request(|transaction| {
                StunMessage::new(METHOD_REFRESH, Class::Request, transaction)
                    .with(ATTR_LIFETIME, lifetime.to_be_bytes().to_vec())
            })
            .await?;
        self.lifetime = lifetime_of(&response);
        self.renew_permissions().await
    }

    /// Ask the server to drop the allocation.
    pub async fn release(&mut self) -> Result<(), TurnError> {
        self.request(|transaction| {
            StunMessage::new(METHOD_REFRESH, Class::Request, transaction)
                .with(ATTR_LIFETIME, 0u32.to_be_bytes().to_vec())
        })
        .await?;
        info!(server = %self.server, "Relay released");
        Ok(())
    }

    /// Run one request, adding long-term credentials once the server has
    /// challenged for them.
    async fn request<F>(&mut self, build: F) -> Result<StunMessage, TurnError>
    where
        F: Fn(TransactionId) -> StunMessage,
    {
        for _ in 0..AUTH_ATTEMPTS {
            let mut message = build(rand::random());
            let method = message.method;
            if let Some(auth) = &self.auth {
                message.push(ATTR_USERNAME, auth.username.as_bytes().to_vec());
                message.push(ATTR_REALM, auth.realm.as_bytes().to_vec());
                message.push(ATTR_NONCE, auth.nonce.clone());
            }
            let key = self.auth.as_ref().map(|auth| auth.key);
            let response = self
                .socket
                .transact(self.server, &message, key.as_ref().map(|key| &key[..]))
                .await?;
            if response.method != method {
                return Err(StunError::UnexpectedType(stun::message_type(
                    response.method,
                    response.class,
                ))
                .into());
            }

            match response.class {
                Class::Success => return Ok(response),
                Class::Error => {
                    let (code, reason) = error_code(&response);
                    let challenged = matches!(code, CODE_UNAUTHORIZED | CODE_STALE_NONCE);
                    if !challenged || self.credentials.username.is_empty() {
                        return Err(TurnError::Rejected { code, reason });
                    }
                    self.accept_challenge(&response)
                        .ok_or(TurnError::Rejected { code, reason })?;
                }
                class => {
                    warn!(?class, "Relay answered with a non-response class");
                    return Err(TurnError::Rejected {
                        code: 0,
                        reason: "non-response message".into(),
                    });
                }
            }
        }
        Err(TurnError::Rejected {
            code: CODE_UNAUTHORIZED,
            reason: "credentials refused".into(),
        })
    }

    fn accept_challenge(&mut self, response: &StunMessage) -> Option<()> {
        let nonce = response.attribute(ATTR_NONCE)?.to_vec();
        let realm = match response.attribute(ATTR_REALM) {
            Some(realm) => String::from_utf8_lossy(realm).into_owned(),
            None => self.auth.as_ref()?.realm.clone(),
        };
        let key = long_term_key(&self.credentials.username, &realm, &self.credentials.password);
        debug!(server = %self.server, realm = %realm, "Relay challenged for credentials");
        self.auth = Some(Auth {
            username: self.credentials.username.clone(),
            realm,
            nonce,
            key,
        });
        Some(())
    }
}

/// Keep an allocation and its permissions alive until aborted.
pub fn spawn_keepalive(
    allocation: Arc<tokio::sync::Mutex<RelayAllocation>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = allocation.lock().await.refresh_interval();
            tokio::time::sleep(wait).await;
            let mut allocation = allocation.lock().await;
            if let Err(err) = allocation.refresh().await {
                warn!(server = %allocation.server(), "Relay refresh failed: {}", err);
                break;
            }
        }
    })
}

/// In-process TURN server for loopback tests: one allocation, Send/Data
/// indications only.
#[cfg(test)]
pub(crate) mod test_relay {
    use super::*;
    use std::net::IpAddr;

    pub(crate) const REALM: &str = "tandem.test";
    const NONCE: &[u8] = b"b8f3c1d2";

    pub(crate) struct TestRelay {
        pub addr: SocketAddr,
        pub relayed: SocketAddr,
        pub permitted: Arc<Mutex<Vec<IpAddr>>>,
        pub refreshes: Arc<Mutex<Vec<u32>>>,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestRelay {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    fn response(request: &StunMessage, class: Class) -> StunMessage {
        StunMessage::new(request.method, class, request.transaction)
    }

    fn challenge(request: &StunMessage) -> Vec<u8> {
        let mut code = vec![0, 0, 4, 1];
        code.extend_from_slice(b"Unauthorized");
        response(request, Class::Error)
            .with(ATTR_ERROR_CODE, code)
            .with(ATTR_REALM, REALM.as_bytes().to_vec())
            .with(ATTR_NONCE, NONCE.to_vec())
            .encode()
    }

    /// Start a relay; with `credentials`, every request must carry valid
    /// long-term integrity.
    pub(crate) async fn spawn(credentials: Option<(&str, &str)>) -> TestRelay {
        let control = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = control.local_addr().unwrap();
        let relayed = relay.local_addr().unwrap();
        let key = credentials.map(|(user, pass)| long_term_key(user, REALM, pass));
        let permitted = Arc::new(Mutex::new(Vec::new()));
        let refreshes = Arc::new(Mutex::new(Vec::new()));

        let task_permitted = Arc::clone(&permitted);
        let task_refreshes = Arc::clone(&refreshes);
        let task = tokio::spawn(async move {
            let mut client = None;
            let mut control_buf = vec![0u8; 65_536];
            let mut relay_buf = vec![0u8; 65_536];
            loop {
                tokio::select! {
                    received = control.recv_from(&mut control_buf) => {
                        let Ok((len, from)) = received else { break };
                        let raw = &control_buf[..len];
                        let Ok(request) = StunMessage::decode(raw) else { continue };

                        if request.class == Class::Indication {
                            if request.method != METHOD_SEND {
                                continue;
                            }
                            let (Some(peer), Some(data)) = (
                                request.xor_address(ATTR_XOR_PEER_ADDRESS),
                                request.attribute(ATTR_DATA),
                            ) else {
                                continue;
                            };
                            if task_permitted.lock().unwrap().contains(&peer.ip()) {
                                let _ = relay.send_to(data, peer).await;
                            }
                            continue;
                        }

                        if let Some(key) = &key {
                            if !stun::check_integrity(raw, key) {
                                let _ = control.send_to(&challenge(&request), from).await;
                                continue;
                            }
                        }
                        let reply = match request.method {
                            METHOD_ALLOCATE => {
                                client = Some(from);
                                response(&request, Class::Success)
                                    .with(
                                        ATTR_XOR_RELAYED_ADDRESS,
                                        stun::encode_xor_address(relayed, &request.transaction),
                                    )
                                    .with(ATTR_LIFETIME, 600u32.to_be_bytes().to_vec())
                            }
                            METHOD_CREATE_PERMISSION => {
                                let mut permitted = task_permitted.lock().unwrap();
                                for peer in request.xor_addresses(ATTR_XOR_PEER_ADDRESS) {
                                    if !permitted.contains(&peer.ip()) {
                                        permitted.push(peer.ip());
                                    }
                                }
                                response(&request, Class::Success)
                            }
                            METHOD_REFRESH => {
                                let lifetime = request
                                    .attribute(ATTR_LIFETIME)
                                    .and_then(|value| <[u8; 4]>::try_from(value).ok())
                                    .map_or(600, u32::from_be_bytes);
                                task_refreshes.lock().unwrap().push(lifetime);
                                response(&request, Class::Success)
                                    .with(ATTR_LIFETIME, lifetime.to_be_bytes().to_vec())
                            }
                            _ => continue,
                        };
                        let _ = control.send_to(&reply.encode(), from).await;
                    }
                    received = relay.recv_from(&mut relay_buf) => {
                        let Ok((len, peer)) = received else { break };
                        let Some(client) = client else { continue };
                        if !task_permitted.lock().unwrap().contains(&peer.ip()) {
                            continue;
                        }
                        let transaction: TransactionId = rand::random();
                        let indication = StunMessage::new(METHOD_DATA, Class::Indication, transaction)
                            .with(ATTR_XOR_PEER_ADDRESS, stun::encode_xor_address(peer, &transaction))
                            .with(ATTR_DATA, relay_buf[..len].to_vec())
                            .encode();
                        let _ = control.send_to(&indication, client).await;
                    }
                }
            }
        });

        TestRelay {
            addr,
            relayed,
            permitted,
            refreshes,
            task,
        }
    }
}
