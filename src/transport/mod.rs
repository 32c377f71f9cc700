//! Message channel abstraction over the three scalable-protocol patterns.
//!
//! Backends drive endpoints exclusively through [`Channel`] (plus
//! [`Subscription`] for the subscriber side of pub/sub), always in
//! non-blocking mode: an operation that cannot proceed right now returns
//! [`ChannelError::WouldBlock`] and is retried on a later tick. Two
//! realizations exist, [`mem`] for in-process wiring and [`tcp`] for framed
//! TCP sockets.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

pub mod mem;
pub mod tcp;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Transient; retry on the next tick. Covers EAGAIN/EINTR-class
    /// conditions and empty inbound queues.
    #[error("operation would block")]
    WouldBlock,
    /// The peer endpoint is gone.
    #[error("peer disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, ChannelError::WouldBlock)
    }
}

/// One endpoint of a messaging pattern. Message boundaries are preserved;
/// a `try_recv` yields exactly the bytes of one `try_send`.
pub trait Channel {
    /// Hand one message to the channel. Implementations may buffer
    /// internally; `Ok` means the message is owned by the channel and will
    /// be delivered or dropped with the connection, never duplicated.
    fn try_send(&mut self, frame: &[u8]) -> Result<(), ChannelError>;

    /// Receive one message if one is available.
    fn try_recv(&mut self) -> Result<Vec<u8>, ChannelError>;

    /// Housekeeping hook run once per tick before any transfer: accept new
    /// peers, flush partially written output, reap dead connections. Never
    /// consumes inbound messages.
    fn pump(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    /// File descriptors whose readability should wake the driving loop.
    fn read_fds(&self, _out: &mut Vec<RawFd>) {}

    /// File descriptors whose writability should wake the driving loop when
    /// the caller has output queued for this channel.
    fn write_fds(&self, _out: &mut Vec<RawFd>) {}

    /// True when the channel itself still holds unsent bytes (partial
    /// writes), independent of any caller-side queue.
    fn has_buffered_output(&self) -> bool {
        false
    }
}

/// Subscriber side of the broadcast pattern. Filtering is prefix-based on the
/// raw message bytes and happens on the receiving side, mirroring the
/// underlying transport's subscriber-side filter semantics.
pub trait Subscription: Channel {
    fn subscribe(&mut self, prefix: &[u8]);
    fn unsubscribe(&mut self, prefix: &[u8]);
}
