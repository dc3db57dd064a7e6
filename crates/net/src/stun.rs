//! STUN (RFC 5389) message codec and the Binding client used for
//! server-reflexive discovery. The TURN client builds on the same codec.

use ring::hmac;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Fixed cookie in every RFC 5389 header.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

pub(crate) const HEADER_LEN: usize = 20;
const METHOD_BINDING: u16 = 0x001;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const INTEGRITY_LEN: usize = 20;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// 96-bit transaction identifier.
pub type TransactionId = [u8; 12];

/// STUN failures.
#[derive(Debug, Error)]
pub enum StunError {
    /// Datagram shorter than its header claims.
    #[error("STUN message truncated")]
    Truncated,
    /// Not a Binding success response.
    #[error("unexpected STUN message type {0:#06x}")]
    UnexpectedType(u16),
    /// Header cookie was wrong.
    #[error("bad STUN magic cookie")]
    BadCookie,
    /// Response to someone else's request.
    #[error("STUN transaction id mismatch")]
    TransactionMismatch,
    /// No usable address attribute.
    #[error("STUN response carried no mapped address")]
    NoMappedAddress,
    /// Socket error.
    #[error("STUN socket error: {0}")]
    Io(#[from] io::Error),
    /// Server did not answer in time.
    #[error("STUN server did not answer")]
    Timeout,
}

/// Class bits of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Expects a response.
    Request,
    /// Fire and forget.
    Indication,
    /// Success response.
    Success,
    /// Error response.
    Error,
}

impl Class {
    const fn bits(self) -> u16 {
        match self {
            Class::Request => 0x0000,
            Class::Indication => 0x0010,
            Class::Success => 0x0100,
            Class::Error => 0x0110,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits & 0x0110 {
            0x0000 => Class::Request,
            0x0010 => Class::Indication,
            0x0100 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// Interleave a 12-bit method with the class bits.
pub const fn message_type(method: u16, class: Class) -> u16 {
    (method & 0x000F) | ((method & 0x0070) << 1) | ((method & 0x0F80) << 2) | class.bits()
}

const fn split_message_type(message_type: u16) -> (u16, Class) {
    let method = (message_type & 0x000F) | ((message_type & 0x00E0) >> 1) | ((message_type & 0x3E00) >> 2);
    (method, Class::from_bits(message_type))
}

/// Whether `data` starts with a STUN header rather than some other protocol.
pub fn looks_like_stun(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

/// A parsed or outgoing STUN message with its attributes in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// 12-bit method.
    pub method: u16,
    /// Request, indication or response.
    pub class: Class,
    /// Transaction identifier.
    pub transaction: TransactionId,
    /// `(type, value)` pairs without padding.
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl StunMessage {
    /// Message without attributes.
    pub fn new(method: u16, class: Class, transaction: TransactionId) -> Self {
        Self {
            method,
            class,
            transaction,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute.
    pub fn push(&mut self, attr_type: u16, value: Vec<u8>) {
        self.attributes.push((attr_type, value));
    }

    /// Builder form of [`StunMessage::push`].
    pub fn with(mut self, attr_type: u16, value: Vec<u8>) -> Self {
        self.push(attr_type, value);
        self
    }

    /// First attribute of `attr_type`.
    pub fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(kind, _)| *kind == attr_type)
            .map(|(_, value)| value.as_slice())
    }

    /// First XOR-encoded address attribute of `attr_type`.
    pub fn xor_address(&self, attr_type: u16) -> Option<SocketAddr> {
        self.attribute(attr_type)
            .and_then(|value| parse_address(value, Some(&self.transaction)).ok())
    }

    /// Every XOR-encoded address attribute of `attr_type`.
    pub fn xor_addresses(&self, attr_type: u16) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter(|(kind, _)| *kind == attr_type)
            .filter_map(|(_, value)| parse_address(value, Some(&self.transaction)).ok())
            .collect()
    }

    /// Wire bytes without MESSAGE-INTEGRITY.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        out.extend_from_slice(&message_type(self.method, self.class).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&self.transaction);
        for (attr_type, value) in &self.attributes {
            out.extend_from_slice(&attr_type.to_be_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
            out.resize(out.len() + (4 - value.len() % 4) % 4, 0);
        }
        let length = (out.len() - HEADER_LEN) as u16;
        out[2..4].copy_from_slice(&length.to_be_bytes());
        out
    }

    /// Wire bytes with a trailing MESSAGE-INTEGRITY keyed by `key`.
    pub fn encode_with_integrity(&self, key: &[u8]) -> Vec<u8> {
        let mut out = self.encode();
        let length = (out.len() - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
        out[2..4].copy_from_slice(&length.to_be_bytes());
        let tag = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key), &out);
        out.extend_from_slice(&ATTR_MESSAGE_INTEGRITY.to_be_bytes());
        out.extend_from_slice(&(INTEGRITY_LEN as u16).to_be_bytes());
        out.extend_from_slice(tag.as_ref());
        out
    }

    /// Parse header and attributes. Does not check the transaction id.
    pub fn decode(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::Truncated);
        }
        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(StunError::UnexpectedType(raw_type));
        }
        let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
            return Err(StunError::BadCookie);
        }
        let mut transaction = [0u8; 12];
        transaction.copy_from_slice(&data[8..20]);
        let body = data
            .get(HEADER_LEN..HEADER_LEN + length)
            .ok_or(StunError::Truncated)?;

        let (method, class) = split_message_type(raw_type);
        let mut message = Self::new(method, class, transaction);
        let mut offset = 0;
        while offset + 4 <= body.len() {
            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([body[offset + 2], body[offset + 3]]));
            let value = body
                .get(offset + 4..offset + 4 + attr_len)
                .ok_or(StunError::Truncated)?;
            trace!(attr_type, attr_len, "STUN attribute");
            message.push(attr_type, value.to_vec());
            // attributes are padded to 4 bytes
            offset += 4 + attr_len.div_ceil(4) * 4;
        }
        Ok(message)
    }
}

/// Check the MESSAGE-INTEGRITY of raw message bytes against `key`.
pub fn check_integrity(data: &[u8], key: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    let mut offset = HEADER_LEN;
    while offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = usize::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
        if attr_type == ATTR_MESSAGE_INTEGRITY {
            let Some(tag) = data.get(offset + 4..offset + 4 + INTEGRITY_LEN) else {
                return false;
            };
            let mut covered = data[..offset].to_vec();
            let length = (offset - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
            covered[2..4].copy_from_slice(&length.to_be_bytes());
            let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
            return hmac::verify(&key, &covered, tag).is_ok();
        }
        offset += 4 + attr_len.div_ceil(4) * 4;
    }
    false
}

/// Encode a Binding request without attributes.
pub fn encode_binding_request(transaction: &TransactionId) -> Vec<u8> {
    StunMessage::new(METHOD_BINDING, Class::Request, *transaction).encode()
}

/// Extract the reflexive address from a Binding success response.
///
/// Prefers XOR-MAPPED-ADDRESS and falls back to the legacy MAPPED-ADDRESS.
pub fn decode_binding_response(
    data: &[u8],
    transaction: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let message = StunMessage::decode(data)?;
    if message.method != METHOD_BINDING || message.class != Class::Success {
        return Err(StunError::UnexpectedType(message_type(
            message.method,
            message.class,
        )));
    }
    if &message.transaction != transaction {
        return Err(StunError::TransactionMismatch);
    }
    if let Some(value) = message.attribute(ATTR_XOR_MAPPED_ADDRESS) {
        return parse_address(value, Some(transaction));
    }
    match message.attribute(ATTR_MAPPED_ADDRESS) {
        Some(value) => parse_address(value, None),
        None => Err(StunError::NoMappedAddress),
    }
}

/// XOR-encode `addr` the way XOR-MAPPED-ADDRESS does.
pub fn encode_xor_address(addr: SocketAddr, transaction: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut value = vec![0, 0];
    value.extend_from_slice(&port.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => {
            value[1] = FAMILY_IPV4;
            value.extend(ip.octets().iter().zip(cookie).map(|(octet, mask)| octet ^ mask));
        }
        IpAddr::V6(ip) => {
            value[1] = FAMILY_IPV6;
            let mask = cookie.iter().chain(transaction.iter());
            value.extend(ip.octets().iter().zip(mask).map(|(octet, mask)| octet ^ mask));
        }
    }
    value
}

pub(crate) fn parse_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated);
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match value[1] {
        FAMILY_IPV4 => {
            let raw = value.get(4..8).ok_or(StunError::Truncated)?;
            let mut octets = [raw[0], raw[1], raw[2], raw[3]];
            if xor.is_some() {
                for (octet, mask) in octets.iter_mut().zip(cookie) {
                    *octet ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw = value.get(4..20).ok_or(StunError::Truncated)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            if let Some(transaction) = xor {
                let mask = cookie.iter().chain(transaction.iter());
                for (octet, mask) in octets.iter_mut().zip(mask) {
                    *octet ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::NoMappedAddress),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Ask `server` for this socket's reflexive address.
pub async fn query(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, StunError> {
    let transaction: TransactionId = rand::random();
    socket
        .send_to(&encode_binding_request(&transaction), server)
        .await?;

    let mut buf = [0u8; 576];
    let exchange = async {
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != server {
                trace!(%from, "Ignoring datagram from non-STUN peer");
                continue;
            }
            match decode_binding_response(&buf[..len], &transaction) {
                Err(StunError::TransactionMismatch) => continue,
                other => return other,
            }
        }
    };
    let mapped = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| StunError::Timeout)??;
    debug!(%server, %mapped, "STUN reflexive address");
    Ok(mapped)
}
