//! Outgoing method calls and signals.
//!
//! A call can be made three ways on a [`Connection`]:
//!
//! - [`Connection::call_blocking`] sends and blocks the thread until the
//!   reply arrives or the timeout elapses.
//! - [`Connection::call_with_callback`] returns immediately; the callback
//!   runs once when the reply, an error or the timeout arrives.
//! - [`Connection::call`] returns a [`ReplyFuture`] to await from a task.
//!
//! In the last two cases the continuation is kept in the connection's
//! pending-call table from send until it has run. It is taken out before it
//! runs but its entry is only removed afterwards, so code that looks at the
//! table from inside the continuation still sees the call as pending.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{Connection, ConnectionState, Shared};
use crate::codec::{Codec, Value};
use crate::error::{BusError, RemoteError};
use crate::executor::contain;
use crate::message::{error_names, Message, MessageType};
use crate::names;

/// Decoded reply values, or the error the remote side (or a timeout)
/// produced.
pub type CallReply = Result<Vec<Value>, RemoteError>;

type Continuation = Box<dyn FnOnce(CallReply)>;

/// Signature and timeout of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub signature: Option<String>,
    /// `None` uses the configured default.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout in seconds, rounded to milliseconds. Zero, negative and
    /// non-finite values leave the default in place.
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            let millis = (secs * 1000.0).round().max(1.0);
            self.timeout = Some(Duration::from_millis(millis as u64));
        }
        self
    }
}

/// A method call ready to be sent.
#[derive(Debug, Clone)]
pub struct MethodCall {
    destination: String,
    path: String,
    interface: String,
    member: String,
    options: CallOptions,
    args: Vec<Value>,
}

impl MethodCall {
    /// Names are checked here, before anything is built or sent.
    pub fn new(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Self, BusError> {
        names::bus_name(destination)?;
        names::object_path(path)?;
        names::interface(interface)?;
        names::member(member)?;
        Ok(Self {
            destination: destination.to_string(),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            options: CallOptions::default(),
            args: Vec::new(),
        })
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.options.signature = Some(signature.to_string());
        self
    }

    pub fn options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    fn into_message(self, codec: &dyn Codec) -> Result<Message, BusError> {
        let body = codec.encode(self.options.signature.as_deref(), self.args)?;
        Ok(
            Message::method_call(&self.destination, &self.path, &self.interface, &self.member)
                .with_body(body),
        )
    }
}

/// A signal ready to be emitted.
#[derive(Debug, Clone)]
pub struct OutgoingSignal {
    destination: Option<String>,
    path: String,
    interface: String,
    member: String,
    signature: Option<String>,
    args: Vec<Value>,
}

impl OutgoingSignal {
    pub fn new(path: &str, interface: &str, member: &str) -> Result<Self, BusError> {
        names::object_path(path)?;
        names::interface(interface)?;
        names::member(member)?;
        Ok(Self {
            destination: None,
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            signature: None,
            args: Vec::new(),
        })
    }

    /// Address the signal to one listener. `None` broadcasts.
    pub fn destination(mut self, listener: Option<&str>) -> Result<Self, BusError> {
        if let Some(listener) = listener {
            names::bus_name(listener)?;
        }
        self.destination = listener.map(str::to_string);
        Ok(self)
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Calls awaiting their reply, by serial.
#[derive(Default)]
pub(crate) struct PendingCalls {
    entries: HashMap<u32, Option<Continuation>>,
}

impl PendingCalls {
    fn insert(&mut self, serial: u32, continuation: Continuation) {
        self.entries.insert(serial, Some(continuation));
    }

    /// Take the continuation out, leaving the entry in place.
    fn take(&mut self, serial: u32) -> Option<Continuation> {
        self.entries.get_mut(&serial).and_then(Option::take)
    }

    fn remove(&mut self, serial: u32) {
        self.entries.remove(&serial);
    }

    pub fn contains(&self, serial: u32) -> bool {
        self.entries.contains_key(&serial)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Serials whose continuation has not run yet, in send order.
    pub fn waiting(&self) -> Vec<u32> {
        let mut serials: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, continuation)| continuation.is_some())
            .map(|(serial, _)| *serial)
            .collect();
        serials.sort_unstable();
        serials
    }
}

/// Resolves to the reply of a call made with [`Connection::call`].
pub struct ReplyFuture {
    rx: oneshot::Receiver<CallReply>,
    serial: u32,
}

impl ReplyFuture {
    pub fn serial(&self) -> u32 {
        self.serial
    }
}

impl Future for ReplyFuture {
    type Output = CallReply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CallReply> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RemoteError::new(
                error_names::NO_REPLY,
                "The connection was dropped before a reply arrived",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn reply_outcome(codec: &dyn Codec, reply: &Message) -> CallReply {
    match reply.kind {
        MessageType::Error => Err(RemoteError::new(
            reply
                .error_name
                .as_deref()
                .unwrap_or(error_names::FAILED),
            reply.error_text(),
        )),
        _ => codec
            .decode(&reply.body, None)
            .map_err(|e| RemoteError::new(error_names::INVALID_ARGS, e.to_string())),
    }
}

/// Deliver a reply (or synthesized error) to the call waiting for it.
pub(crate) fn complete(shared: &Rc<Shared>, conn: &ConnectionState, reply: Message) {
    let Some(serial) = reply.reply_serial else {
        warn!("Dropping reply without a reply serial");
        return;
    };
    let continuation = conn.pending.borrow_mut().take(serial);
    let Some(continuation) = continuation else {
        warn!("Reply for unknown call {} dropped", serial);
        return;
    };

    let outcome = reply_outcome(shared.codec.as_ref(), &reply);
    match &outcome {
        Ok(values) => debug!("Call {} returned {} value(s)", serial, values.len()),
        Err(e) => debug!("Call {} failed: {}", serial, e),
    }

    if let Err(message) = contain(move || continuation(outcome)) {
        warn!("Task failed: {}", message);
    }
    conn.pending.borrow_mut().remove(serial);
}

impl Connection {
    /// Send a call; `callback` runs once with its outcome. Returns the
    /// call's serial.
    pub fn call_with_callback<F>(&self, call: MethodCall, callback: F) -> Result<u32, BusError>
    where
        F: FnOnce(CallReply) + 'static,
    {
        let (shared, state) = self.state()?;
        let timeout = call.options.timeout.unwrap_or(shared.default_timeout);
        let message = call.into_message(shared.codec.as_ref())?;

        let serial = state
            .transport
            .borrow_mut()
            .send_with_reply(message, timeout)?;
        state.pending.borrow_mut().insert(serial, Box::new(callback));
        debug!("Call {} sent, timeout {:?}", serial, timeout);

        shared.pump(&state)?;
        Ok(serial)
    }

    /// Send a call and get a future for its outcome.
    pub fn call(&self, call: MethodCall) -> Result<ReplyFuture, BusError> {
        let (tx, rx) = oneshot::channel();
        let serial = self.call_with_callback(call, move |reply| {
            let _ = tx.send(reply);
        })?;
        Ok(ReplyFuture { rx, serial })
    }

    /// Send a call and block the thread until its outcome is known.
    ///
    /// Messages that arrive meanwhile stay queued for the next loop turn.
    pub fn call_blocking(&self, call: MethodCall) -> Result<CallReply, BusError> {
        let (shared, state) = self.state()?;
        let timeout = call.options.timeout.unwrap_or(shared.default_timeout);
        let message = call.into_message(shared.codec.as_ref())?;

        let reply = state
            .transport
            .borrow_mut()
            .send_with_reply_and_block(message, timeout);
        shared.pump(&state)?;
        Ok(reply_outcome(shared.codec.as_ref(), &reply?))
    }

    /// Emit a signal.
    pub fn emit(&self, signal: OutgoingSignal) -> Result<(), BusError> {
        let (shared, state) = self.state()?;
        let body = shared
            .codec
            .encode(signal.signature.as_deref(), signal.args)?;
        let mut message = Message::signal(&signal.path, &signal.interface, &signal.member)
            .with_body(body);
        message.destination = signal.destination;

        state.transport.borrow_mut().send(message)?;
        shared.pump(&state)
    }

    pub fn pending_calls(&self) -> usize {
        self.state()
            .map(|(_, state)| state.pending.borrow().len())
            .unwrap_or(0)
    }

    /// True from send until the call's continuation has finished running.
    pub fn is_pending(&self, serial: u32) -> bool {
        self.state()
            .map(|(_, state)| state.pending.borrow().contains(serial))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_validates_names() {
        assert!(MethodCall::new("org.example", "/a", "org.example.I", "M").is_ok());
        for (dest, path, iface, member) in [
            ("bad", "/a", "org.example.I", "M"),
            ("org.example", "a", "org.example.I", "M"),
            ("org.example", "/a", "Iface", "M"),
            ("org.example", "/a", "org.example.I", "not.member"),
        ] {
            let err = MethodCall::new(dest, path, iface, member).unwrap_err();
            assert!(matches!(err, BusError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_timeout_secs_rounding() {
        assert_eq!(
            CallOptions::new().with_timeout_secs(1.2345).timeout,
            Some(Duration::from_millis(1235))
        );
        assert_eq!(
            CallOptions::new().with_timeout_secs(0.0001).timeout,
            Some(Duration::from_millis(1))
        );
        assert_eq!(CallOptions::new().with_timeout_secs(0.0).timeout, None);
        assert_eq!(CallOptions::new().with_timeout_secs(-3.0).timeout, None);
        assert_eq!(CallOptions::new().with_timeout_secs(f64::NAN).timeout, None);
    }

    #[test]
    fn test_signal_destination() {
        let signal = OutgoingSignal::new("/a", "org.example.I", "S").unwrap();
        assert!(signal.clone().destination(Some("not a name")).is_err());
        let addressed = signal.clone().destination(Some(":1.7")).unwrap();
        assert_eq!(addressed.destination.as_deref(), Some(":1.7"));
        let broadcast = signal.destination(None).unwrap();
        assert!(broadcast.destination.is_none());
    }

    #[test]
    fn test_pending_take_leaves_entry() {
        let mut pending = PendingCalls::default();
        pending.insert(3, Box::new(|_| {}));
        pending.insert(1, Box::new(|_| {}));
        assert_eq!(pending.waiting(), vec![1, 3]);

        assert!(pending.take(3).is_some());
        assert!(pending.contains(3));
        assert!(pending.take(3).is_none());
        assert_eq!(pending.waiting(), vec![1]);

        pending.remove(3);
        assert!(!pending.contains(3));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_error_reply_outcome() {
        let reply = Message::error_reply(5, "org.example.Error.Nope", "nope");
        let outcome = reply_outcome(&crate::codec::SignatureCodec, &reply);
        assert_eq!(
            outcome,
            Err(RemoteError::new("org.example.Error.Nope", "nope"))
        );
    }
}
