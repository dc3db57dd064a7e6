//! QUIC transport layer using quinn for reliable, encrypted connections.
//!
//! One UDP socket per peer serves every role: it answers STUN before quinn
//! takes it over, then carries QUIC both directly and through TURN relays via
//! [`RelaySocket`]. Each session uses a fresh self-signed certificate; the
//! guest pins it by the fingerprint carried in the signaling answer.

use crate::channel::{ChannelError, DataChannel};
use crate::codec::MAX_FRAME_LEN;
use crate::protocol::PROTOCOL_MAGIC;
use crate::rendezvous::{Candidate, CandidateKind, Fingerprint, Transport};
use crate::stun;
use crate::turn::{spawn_keepalive, RelayAllocation, RelayServer, RelaySocket};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use quinn::{AsyncUdpSocket, ClientConfig, Endpoint, EndpointConfig, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const ALPN: &[u8] = b"tandem";
const SERVER_NAME: &str = "tandem";
const STUN_TIMEOUT: Duration = Duration::from_millis(800);

/// STUN and relay servers used during candidate gathering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// `host:port` STUN servers queried for a reflexive address.
    pub stun_servers: Vec<String>,
    /// TURN servers to allocate relayed candidates on.
    pub relays: Vec<RelayServer>,
}

/// QUIC [`Transport`] on one UDP socket.
pub struct QuicTransport {
    endpoint: Endpoint,
    fingerprint: Fingerprint,
    reflexive: Vec<SocketAddr>,
    relayed: Vec<SocketAddr>,
    allocations: Vec<Arc<AsyncMutex<RelayAllocation>>>,
    keepalive: Vec<JoinHandle<()>>,
}

async fn resolve(server: &str, ipv4: bool) -> Option<SocketAddr> {
    match tokio::net::lookup_host(server).await {
        Ok(mut addrs) => addrs.find(|a| a.is_ipv4() == ipv4),
        Err(err) => {
            warn!("Failed to resolve {}: {}", server, err);
            None
        }
    }
}

impl QuicTransport {
    /// Bind to `addr`, run STUN discovery and start the quinn endpoint.
    pub async fn bind(addr: SocketAddr, ice: &IceConfig) -> Result<Self> {
        info!("Creating transport endpoint on {}", addr);

        // Install default crypto provider if not already installed
        let _ = rustls::crypto::ring::default_provider().install_default();

        let socket = tokio::net::UdpSocket::bind(addr)
            .await
            .context("Failed to bind UDP socket")?;

        let mut reflexive = Vec::new();
        for server in &ice.stun_servers {
            let Some(server_addr) = resolve(server, addr.is_ipv4()).await else {
                continue;
            };
            match stun::query(&socket, server_addr, STUN_TIMEOUT).await {
                Ok(mapped) if !reflexive.contains(&mapped) => reflexive.push(mapped),
                Ok(_) => {}
                Err(err) => warn!("STUN query to {} failed: {}", server, err),
            }
        }

        let (cert, key) = generate_self_signed_cert()?;
        let fingerprint = Fingerprint::of(cert.as_ref());

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .context("Failed to build rustls ServerConfig")?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .context("Failed to create QuicServerConfig")?,
        ));
        server_config.transport_config(Arc::new(transport_config()?));

        let runtime = quinn::default_runtime().ok_or_else(|| anyhow!("No async runtime found"))?;
        let relay_socket = Arc::new(RelaySocket::new(socket));
        let endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            Some(server_config),
            Arc::clone(&relay_socket) as Arc<dyn AsyncUdpSocket>,
            runtime,
        )
        .context("Failed to start QUIC endpoint")?;

        // Allocations need the endpoint driver reading the socket.
        let mut relayed = Vec::new();
        let mut allocations = Vec::new();
        let mut keepalive = Vec::new();
        for relay in &ice.relays {
            let Some(server_addr) = resolve(&relay.address, addr.is_ipv4()).await else {
                continue;
            };
            match RelayAllocation::allocate(Arc::clone(&relay_socket), server_addr, relay.clone())
                .await
            {
                Ok(allocation) => {
                    relayed.push(allocation.relayed_addr());
                    let allocation = Arc::new(AsyncMutex::new(allocation));
                    keepalive.push(spawn_keepalive(Arc::clone(&allocation)));
                    allocations.push(allocation);
                }
                Err(err) => warn!("Relay allocation on {} failed: {}", relay.address, err),
            }
        }

        info!(
            "Transport bound to {} ({} reflexive, {} relayed)",
            endpoint.local_addr()?,
            reflexive.len(),
            relayed.len()
        );

        Ok(Self {
            endpoint,
            fingerprint,
            reflexive,
            relayed,
            allocations,
            keepalive,
        })
    }

    /// Get the local address this endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the endpoint, terminating all connections.
    pub fn close(&self) {
        for task in &self.keepalive {
            task.abort();
        }
        self.endpoint.close(0u32.into(), b"transport closed");
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        for task in &self.keepalive {
            task.abort();
        }
    }
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.keep_alive_interval(Some(Duration::from_secs(2)));
    config.max_idle_timeout(Some(Duration::from_secs(10).try_into()?));
    Ok(config)
}

#[async_trait]
impl Transport for QuicTransport {
    async fn gather(&self) -> Result<Vec<Candidate>> {
        let mut local = self.endpoint.local_addr()?;
        if local.ip().is_unspecified() {
            local.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        let mut candidates = vec![Candidate::new(CandidateKind::Host, local, 3_000)];
        for (index, addr) in self.reflexive.iter().enumerate() {
            candidates.push(Candidate::new(
                CandidateKind::ServerReflexive,
                *addr,
                2_000 - index as u32,
            ));
        }
        for (index, addr) in self.relayed.iter().enumerate() {
            candidates.push(Candidate::new(
                CandidateKind::Relayed,
                *addr,
                1_000 - index as u32,
            ));
        }
        Ok(candidates)
    }

    async fn permit(&self, remote: &[Candidate]) -> Result<()> {
        let peers: Vec<SocketAddr> = remote.iter().map(|candidate| candidate.addr).collect();
        for allocation in &self.allocations {
            let mut allocation = allocation.lock().await;
            if let Err(err) = allocation.permit(&peers).await {
                warn!("Relay {} refused permissions: {}", allocation.server(), err);
            }
        }
        Ok(())
    }

    async fn accept(&self) -> Result<Box<dyn DataChannel>> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("Endpoint closed before a guest arrived"))?;
        let connection = incoming.await.context("Failed to accept connection")?;
        info!("Accepted connection from {}", connection.remote_address());

        let (send, mut recv) = connection
            .accept_bi()
            .await
            .context("Failed to accept data stream")?;
        let mut preamble = [0u8; PROTOCOL_MAGIC.len()];
        recv.read_exact(&mut preamble)
            .await
            .context("Failed to read stream preamble")?;
        if &preamble != PROTOCOL_MAGIC {
            connection.close(1u32.into(), b"bad preamble");
            bail!("Peer sent an unknown preamble");
        }

        Ok(Box::new(QuicChannel::spawn(connection, send, recv)))
    }

    async fn dial(
        &self,
        candidate: &Candidate,
        fingerprint: Option<Fingerprint>,
    ) -> Result<Box<dyn DataChannel>> {
        let fingerprint =
            fingerprint.ok_or_else(|| anyhow!("QUIC dial requires a certificate fingerprint"))?;
        debug!("Dialing {:?} candidate {}", candidate.kind, candidate.addr);

        let mut client_crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(fingerprint)))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .context("Failed to create QuicClientConfig")?,
        ));
        client_config.transport_config(Arc::new(transport_config()?));

        let connection = self
            .endpoint
            .connect_with(client_config, candidate.addr, SERVER_NAME)
            .context("Failed to initiate connection")?
            .await
            .context("Failed to establish connection")?;
        info!("Connected to {}", candidate.addr);

        let (mut send, recv) = connection
            .open_bi()
            .await
            .context("Failed to open data stream")?;
        send.write_all(PROTOCOL_MAGIC)
            .await
            .context("Failed to write stream preamble")?;

        Ok(Box::new(QuicChannel::spawn(connection, send, recv)))
    }

    fn fingerprint(&self) -> Option<Fingerprint> {
        Some(self.fingerprint)
    }
}

/// [`DataChannel`] over one bidirectional QUIC stream.
///
/// A writer task drains outbound frames and a reader task re-frames inbound
/// bytes by their length prefix.
pub struct QuicChannel {
    connection: quinn::Connection,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl QuicChannel {
    fn spawn(connection: quinn::Connection, mut send: quinn::SendStream, mut recv: quinn::RecvStream) -> Self {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let writer_buffered = Arc::clone(&buffered);
        let writer_open = Arc::clone(&open);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = send.write_all(&frame).await;
                writer_buffered.fetch_sub(frame.len(), Ordering::AcqRel);
                if let Err(err) = result {
                    debug!("Data stream write failed: {}", err);
                    writer_open.store(false, Ordering::Release);
                    break;
                }
            }
            let _ = send.finish();
        });

        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            loop {
                let mut header = [0u8; 4];
                if recv.read_exact(&mut header).await.is_err() {
                    break;
                }
                let length = u32::from_le_bytes(header) as usize;
                if length > MAX_FRAME_LEN {
                    warn!("Peer announced a {} byte frame, closing", length);
                    break;
                }
                let mut frame = vec![0u8; 4 + length];
                frame[..4].copy_from_slice(&header);
                if recv.read_exact(&mut frame[4..]).await.is_err() {
                    break;
                }
                trace!("Received {} byte frame", frame.len());
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
            reader_open.store(false, Ordering::Release);
        });

        Self {
            connection,
            outbound,
            inbound,
            buffered,
            open,
        }
    }

    /// Get the remote address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

impl DataChannel for QuicChannel {
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.buffered.fetch_add(frame.len(), Ordering::AcqRel);
        self.outbound.send(frame.to_vec()).map_err(|_| {
            self.buffered.fetch_sub(frame.len(), Ordering::AcqRel);
            ChannelError::Closed
        })
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.inbound.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("Closing connection to {}", self.connection.remote_address());
        }
        self.connection.close(0u32.into(), b"session closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.connection.close_reason().is_none()
    }
}

/// Generate a per-session self-signed certificate.
fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    debug!("Generating self-signed certificate");

    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .context("Failed to generate certificate")?;

    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    let cert_der = CertificateDer::from(cert.cert);

    Ok((cert_der, key))
}

/// Accepts exactly the certificate whose fingerprint came through signaling.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected: Fingerprint,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(expected: Fingerprint) -> Self {
        Self {
            expected,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if Fingerprint::of(end_entity.as_ref()) == self.expected {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "certificate fingerprint mismatch".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_relay;
    use std::time::Instant;

    async fn recv_frame(channel: &mut dyn DataChannel) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = channel.try_recv().expect("channel open") {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame within 5s");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_bind_and_gather() {
        let transport = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .expect("Failed to bind");
        let candidates = transport.gather().await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].kind, CandidateKind::Host);
        assert_eq!(candidates[0].addr, transport.local_addr().unwrap());
        transport.close();
    }

    #[tokio::test]
    async fn test_relay_allocation_becomes_candidate() {
        let relay = test_relay::spawn(None).await;
        let ice = IceConfig {
            stun_servers: Vec::new(),
            relays: vec![RelayServer {
                address: relay.addr.to_string(),
                ..RelayServer::default()
            }],
        };
        let transport = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &ice)
            .await
            .unwrap();
        let candidates = transport.gather().await.unwrap();
        let last = candidates.last().copied().unwrap();
        assert_eq!(last.kind, CandidateKind::Relayed);
        assert_eq!(last.addr, relay.relayed);
        transport.close();
    }

    #[tokio::test]
    async fn test_guest_reaches_host_through_relay() {
        let relay = test_relay::spawn(Some(("host", "pw"))).await;
        let ice = IceConfig {
            stun_servers: Vec::new(),
            relays: vec![RelayServer {
                address: relay.addr.to_string(),
                username: "host".into(),
                password: "pw".into(),
            }],
        };
        let host = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &ice)
            .await
            .unwrap();
        let guest = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .unwrap();

        let guest_candidates = guest.gather().await.unwrap();
        host.permit(&guest_candidates).await.unwrap();
        assert_eq!(
            *relay.permitted.lock().unwrap(),
            vec![guest_candidates[0].addr.ip()]
        );

        let relayed = host
            .gather()
            .await
            .unwrap()
            .into_iter()
            .find(|candidate| candidate.kind == CandidateKind::Relayed)
            .expect("relayed candidate");
        let (accepted, dialed) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(host.accept(), guest.dial(&relayed, host.fingerprint()))
        })
        .await
        .expect("relayed handshake finishes");
        let mut host_channel = accepted.expect("accept");
        let mut guest_channel = dialed.expect("dial");

        guest_channel.send(&[2, 0, 0, 0, 9, 4]).unwrap();
        assert_eq!(recv_frame(host_channel.as_mut()).await, vec![2, 0, 0, 0, 9, 4]);
        host_channel.send(&[1, 0, 0, 0, 7]).unwrap();
        assert_eq!(recv_frame(guest_channel.as_mut()).await, vec![1, 0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_pinned_channel_exchanges_frames() {
        let host = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .unwrap();
        let guest = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .unwrap();
        let candidate = host.gather().await.unwrap()[0];
        let fingerprint = host.fingerprint();

        let (accepted, dialed) = tokio::join!(host.accept(), guest.dial(&candidate, fingerprint));
        let mut host_channel = accepted.expect("accept");
        let mut guest_channel = dialed.expect("dial");

        let frame = [3u8, 0, 0, 0, 9, 1, 2];
        guest_channel.send(&frame).unwrap();
        assert_eq!(recv_frame(host_channel.as_mut()).await, frame.to_vec());

        host_channel.send(&[1, 0, 0, 0, 9]).unwrap();
        assert_eq!(recv_frame(guest_channel.as_mut()).await, vec![1, 0, 0, 0, 9]);
    }

    #[tokio::test]
    async fn test_wrong_fingerprint_is_refused() {
        let host = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .unwrap();
        let guest = QuicTransport::bind("127.0.0.1:0".parse().unwrap(), &IceConfig::default())
            .await
            .unwrap();
        let candidate = host.gather().await.unwrap()[0];

        let (accepted, dialed) = tokio::time::timeout(
            Duration::from_secs(5),
            async {
                tokio::join!(
                    host.accept(),
                    guest.dial(&candidate, Some(Fingerprint([0u8; 32])))
                )
            },
        )
        .await
        .expect("handshake finishes");
        assert!(dialed.is_err());
        assert!(accepted.is_err());
    }
}
