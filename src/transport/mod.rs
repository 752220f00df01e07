//! The message transport consumed by the engine.
//!
//! A transport owns the connection's socket and its protocol state. It never
//! blocks on its own (except in [`Transport::send_with_reply_and_block`]);
//! instead it reports the file descriptors and timers it needs serviced as
//! [`TransportEvent`]s, and the engine calls back into it through
//! [`Transport::handle_watch`] and [`Transport::handle_timeout`] when they
//! fire. Received messages are queued until [`Transport::pop_message`].

mod socket;

use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

pub use socket::{decode_frame, SocketTransport};

use crate::message::Message;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Disconnected,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-assigned identity of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u32);

/// Transport-assigned identity of a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(pub u32);

bitflags::bitflags! {
    /// Readiness a watch is interested in, or that was observed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Changes to the set of watches and timeouts a transport needs serviced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    WatchAdded {
        id: WatchId,
        fd: RawFd,
        flags: WatchFlags,
        enabled: bool,
    },
    WatchToggled {
        id: WatchId,
        enabled: bool,
    },
    WatchRemoved {
        id: WatchId,
    },
    TimeoutAdded {
        id: TimeoutId,
        interval: Duration,
        enabled: bool,
    },
    TimeoutToggled {
        id: TimeoutId,
        enabled: bool,
    },
    TimeoutRemoved {
        id: TimeoutId,
    },
}

/// The bus-library surface the engine drives.
pub trait Transport {
    /// Name peers use to address this end of the connection.
    fn unique_name(&self) -> &str;

    /// Queue a message and return the serial assigned to it.
    fn send(&mut self, message: Message) -> Result<u32, TransportError>;

    /// Send a method call and arm a timeout for its reply. If no reply has
    /// arrived when the timeout fires, a `NoReply` error reply is queued in
    /// its place.
    fn send_with_reply(&mut self, message: Message, timeout: Duration)
        -> Result<u32, TransportError>;

    /// Send a method call and block until its reply arrives or `timeout`
    /// elapses. Other messages received meanwhile stay queued.
    fn send_with_reply_and_block(
        &mut self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    /// Service a watch that became ready.
    fn handle_watch(&mut self, id: WatchId, flags: WatchFlags);

    /// Service a timeout that fired.
    fn handle_timeout(&mut self, id: TimeoutId);

    /// Next fully received message, in arrival order.
    fn pop_message(&mut self) -> Option<Message>;

    fn has_messages(&self) -> bool;

    /// Watch and timeout changes since the last call.
    fn take_events(&mut self) -> Vec<TransportEvent>;

    /// Whether losing the peer terminates the process.
    fn set_exit_on_disconnect(&mut self, exit: bool);

    fn is_connected(&self) -> bool;

    /// Shut the connection down without notifying anyone.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_flags_union() {
        let mut flags = WatchFlags::empty();
        assert!(flags.is_empty());
        flags |= WatchFlags::READABLE;
        assert!(flags.contains(WatchFlags::READABLE));
        assert!(!flags.contains(WatchFlags::WRITABLE));

        let both = flags | WatchFlags::WRITABLE;
        assert!(both.contains(WatchFlags::READABLE | WatchFlags::WRITABLE));
        assert_eq!(both.bits(), 0b11);
    }
}
