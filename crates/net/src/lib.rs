#![warn(missing_docs)]
//! Networking for two-peer sessions: wire format, transports and timers.

pub mod backpressure;
pub mod channel;
pub mod codec;
pub mod connection;
pub mod full_sync;
pub mod interpolation;
pub mod liveness;
pub mod memory;
pub mod protocol;
pub mod rendezvous;
pub mod snapshot_codec;
pub mod stun;
pub mod transport;
pub mod turn;

pub use backpressure::{Admission, BackpressurePolicy, DEFAULT_BACKPRESSURE_THRESHOLD};
pub use channel::{ChannelError, DataChannel};
pub use codec::{compute_schema_hash, decode_message, encode_message, CodecError};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionStats, DisconnectReason,
    SendOutcome, SessionId,
};
pub use full_sync::{summarize, AckOutcome, FullSyncAction, FullSyncConfig, FullSyncSender};
pub use interpolation::{interpolate_snapshot, lerp, lerp_angle, shortest_angle_delta, Interpolator};
pub use liveness::{LivenessAction, LivenessConfig, LivenessMonitor};
pub use memory::{ChannelProbe, MemoryChannel, MemoryNetwork, MemorySignaling, MemoryTransport};
pub use protocol::{
    DeliveryClass, Direction, Envelope, Heartbeat, MessageKind, Payload, MAX_CHAT_LEN,
    MAX_SNAPSHOT_ENTITIES, MAX_UPGRADE_KEY_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use rendezvous::{
    Candidate, CandidateKind, ConnectionState, Established, Fingerprint, HostedRoom, Registration,
    Rendezvous, RendezvousConfig, RendezvousError, SignalMessage, SignalingLink,
    SignalingService, Transport,
};
pub use snapshot_codec::{decode_snapshot, encode_snapshot, CompactSnapshot, SnapshotDecodeError, SnapshotWire};
pub use transport::{IceConfig, QuicChannel, QuicTransport};
pub use turn::{RelayAllocation, RelayServer, RelaySocket, TurnError};
