//! Reliable ordered data channel between the two peers.
//!
//! Implementations deliver whole frames as produced by
//! [`encode_message`](crate::codec::encode_message); the length prefix is kept
//! so the codec can validate it.

use thiserror::Error;

/// Data channel failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel is closed for good.
    #[error("channel closed")]
    Closed,
    /// A send failed but the channel is still usable.
    #[error("transient send failure: {0}")]
    Transient(String),
}

/// One reliable, ordered, message-oriented channel.
///
/// All operations are non-blocking; the owner polls [`try_recv`](Self::try_recv).
pub trait DataChannel: Send {
    /// Queue a frame for transmission.
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError>;

    /// Next received frame, if any.
    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError>;

    /// Bytes queued but not yet written to the network.
    fn buffered_amount(&self) -> usize;

    /// Close the channel. Idempotent.
    fn close(&mut self);

    /// Whether the channel can still send.
    fn is_open(&self) -> bool;
}

impl<T: DataChannel + ?Sized> DataChannel for Box<T> {
    fn send(&mut self, frame: &[u8]) -> Result<(), ChannelError> {
        (**self).send(frame)
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        (**self).try_recv()
    }

    fn buffered_amount(&self) -> usize {
        (**self).buffered_amount()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
