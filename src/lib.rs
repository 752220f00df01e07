//! busloop: an asynchronous message-bus RPC engine.
//!
//! Connections exchange method calls, replies and signals over a
//! [`Transport`]. A [`Bus`] routes inbound calls to registered handlers,
//! correlates replies with outstanding calls and drives everything from
//! either its own event loop or an application-supplied one
//! ([`ExternalReactor`]).

pub mod bridge;
pub mod bus;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod message;
pub mod names;
pub mod panic_handler;
pub mod reactor;
pub mod rpc;
pub mod transport;

// Re-export commonly used types for convenience
pub use bridge::{EventSource, ExternalReactor, TimerRef, WatchRef};
pub use bus::{Bus, BusKind, Connection, ConnectionId, Stop};
pub use codec::{Body, Codec, SignatureCodec, Value};
pub use config::Config;
pub use dispatch::{HandlerResult, Invocation, MethodEntry, SignalEntry, SignalEvent};
pub use error::{BusError, RemoteError};
pub use executor::yield_now;
pub use message::Message;
pub use rpc::{CallOptions, CallReply, MethodCall, OutgoingSignal, ReplyFuture};
pub use transport::{SocketTransport, Transport, WatchFlags};
