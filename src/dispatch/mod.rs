//! Routing of inbound method calls and signals to registered handlers.
//!
//! Method handlers live in a three-level table `path -> interface -> member`.
//! A lookup reports the first level that misses as `UnknownObject`,
//! `UnknownInterface` or `UnknownMethod`. Signal handlers are keyed by
//! `"path:interface:member"` and run in registration order.
//!
//! Handlers are async: each invocation runs as its own task on the bus
//! executor and may await calls or [`yield_now`](crate::yield_now) before
//! producing its result. The inbound call is owned by a [`ReplyHandle`]
//! until exactly one reply has been sent for it.

mod introspect;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::{FutureExt, LocalBoxFuture};
use tracing::{debug, warn};

use crate::bus::{Connection, ConnectionState, Shared};
use crate::codec::{Body, Value};
use crate::message::{error_names, Message, INTROSPECTABLE, PEER};

pub use introspect::introspect;

/// `Ok(values)` becomes a method return; `Err(text)` a `Failed` error.
pub type HandlerResult = Result<Vec<Value>, String>;

type MethodHandler = Rc<dyn Fn(Invocation) -> LocalBoxFuture<'static, HandlerResult>>;
type SignalHandler = Rc<dyn Fn(SignalEvent) -> LocalBoxFuture<'static, ()>>;

/// A routing miss, reported to the caller as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    UnknownObject {
        path: String,
    },
    UnknownInterface {
        path: String,
        interface: String,
    },
    UnknownMethod {
        path: String,
        interface: Option<String>,
        member: String,
    },
}

impl DispatchError {
    pub fn error_name(&self) -> &'static str {
        match self {
            DispatchError::UnknownObject { .. } => error_names::UNKNOWN_OBJECT,
            DispatchError::UnknownInterface { .. } => error_names::UNKNOWN_INTERFACE,
            DispatchError::UnknownMethod { .. } => error_names::UNKNOWN_METHOD,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownObject { path } => {
                write!(f, "No such object path '{}'", path)
            }
            DispatchError::UnknownInterface { path, interface } => write!(
                f,
                "No such interface '{}' at object path '{}'",
                interface, path
            ),
            DispatchError::UnknownMethod {
                path,
                interface: Some(interface),
                member,
            } => write!(
                f,
                "No such method '{}' in interface '{}' at object path '{}'",
                member, interface, path
            ),
            DispatchError::UnknownMethod {
                path,
                interface: None,
                member,
            } => write!(f, "No such method '{}' at object path '{}'", member, path),
        }
    }
}

impl std::error::Error for DispatchError {}

/// What a method handler is called with.
pub struct Invocation {
    /// The connection the call arrived on; use it to make calls of your own.
    pub connection: Connection,
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Bound arguments first, then the decoded body.
    pub args: Vec<Value>,
}

/// What a signal handler is called with.
pub struct SignalEvent {
    pub connection: Connection,
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

/// A registered method: signatures, bound arguments and the handler.
pub struct MethodEntry {
    pub(crate) input: Option<String>,
    pub(crate) output: Option<String>,
    pub(crate) bound: Vec<Value>,
    handler: MethodHandler,
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

impl MethodEntry {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        Self {
            input: None,
            output: None,
            bound: Vec::new(),
            handler: Rc::new(move |invocation| handler(invocation).boxed_local()),
        }
    }

    /// Signature the call body must have. Without one any body is accepted.
    pub fn input(mut self, signature: &str) -> Self {
        self.input = Some(signature.to_string());
        self
    }

    /// Signature the reply is encoded with. Without one it is inferred.
    pub fn output(mut self, signature: &str) -> Self {
        self.output = Some(signature.to_string());
        self
    }

    /// Extra arguments passed ahead of the decoded body.
    pub fn bound(mut self, args: Vec<Value>) -> Self {
        self.bound = args;
        self
    }
}

pub struct SignalEntry {
    pub(crate) bound: Vec<Value>,
    handler: SignalHandler,
}

impl SignalEntry {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(SignalEvent) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self {
            bound: Vec::new(),
            handler: Rc::new(move |event| handler(event).boxed_local()),
        }
    }

    pub fn bound(mut self, args: Vec<Value>) -> Self {
        self.bound = args;
        self
    }
}

type InterfaceTable = BTreeMap<String, BTreeMap<String, Rc<MethodEntry>>>;

/// Handler tables of one connection.
#[derive(Default)]
pub struct Router {
    methods: BTreeMap<String, InterfaceTable>,
    signals: HashMap<String, Vec<Rc<SignalEntry>>>,
}

impl Router {
    /// Register (or replace) the handler for `path`/`interface`/`member`.
    pub fn add_method(&mut self, path: &str, interface: &str, member: &str, entry: MethodEntry) {
        self.methods
            .entry(path.to_string())
            .or_default()
            .entry(interface.to_string())
            .or_default()
            .insert(member.to_string(), Rc::new(entry));
    }

    /// Append a handler for the signal key `"path:interface:member"`.
    pub fn add_signal(&mut self, key: String, entry: SignalEntry) {
        self.signals.entry(key).or_default().push(Rc::new(entry));
    }

    /// Find the handler for a call. Without an interface, the first
    /// interface at `path` that has `member` wins.
    pub fn lookup(
        &self,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<(String, Rc<MethodEntry>), DispatchError> {
        let interfaces = self
            .methods
            .get(path)
            .ok_or_else(|| DispatchError::UnknownObject {
                path: path.to_string(),
            })?;

        let unknown_method = || DispatchError::UnknownMethod {
            path: path.to_string(),
            interface: interface.map(str::to_string),
            member: member.to_string(),
        };

        match interface {
            Some(interface) => {
                let members =
                    interfaces
                        .get(interface)
                        .ok_or_else(|| DispatchError::UnknownInterface {
                            path: path.to_string(),
                            interface: interface.to_string(),
                        })?;
                let entry = members.get(member).ok_or_else(unknown_method)?;
                Ok((interface.to_string(), entry.clone()))
            }
            None => interfaces
                .iter()
                .find_map(|(name, members)| {
                    members
                        .get(member)
                        .map(|entry| (name.clone(), entry.clone()))
                })
                .ok_or_else(unknown_method),
        }
    }

    pub fn signal_handlers(&self, key: &str) -> Vec<Rc<SignalEntry>> {
        self.signals.get(key).cloned().unwrap_or_default()
    }

    pub(crate) fn interfaces(&self, path: &str) -> Option<&InterfaceTable> {
        self.methods.get(path)
    }

    /// Names of the registered paths one level below `path`.
    pub fn children(&self, path: &str) -> BTreeSet<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.methods
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Owns an inbound call until its one reply has been sent.
///
/// Dropping it unanswered (the handler panicked, or its task was dropped)
/// replies with `Failed`.
pub struct ReplyHandle {
    connection: Connection,
    call: Option<Rc<Message>>,
    output: Option<String>,
}

impl ReplyHandle {
    pub(crate) fn new(connection: Connection, call: Rc<Message>, output: Option<String>) -> Self {
        connection.inflight_changed(1);
        Self {
            connection,
            call: Some(call),
            output,
        }
    }

    /// Send the handler's result back to the caller.
    pub fn finish(mut self, result: HandlerResult) {
        let Some(call) = self.call.take() else {
            return;
        };
        let reply = match result {
            Ok(values) => match self.connection.encode(self.output.as_deref(), values) {
                Ok(body) => Message::method_return(&call).with_body(body),
                Err(e) => Message::error(
                    &call,
                    error_names::FAILED,
                    &format!("Reply does not match signature: {}", e),
                ),
            },
            Err(text) => Message::error(&call, error_names::FAILED, &text),
        };
        self.send(reply);
    }

    fn send(&self, reply: Message) {
        if let Err(e) = self.connection.send_message(reply) {
            warn!("Failed to send reply: {}", e);
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            self.send(Message::error(
                &call,
                error_names::FAILED,
                "Method handler finished without a reply",
            ));
        }
        self.connection.inflight_changed(-1);
    }
}

fn reply_string(call: &Message, text: String) -> Message {
    Message::method_return(call).with_body(Body {
        signature: "s".to_string(),
        values: vec![Value::Str(text)],
    })
}

fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|id| id.trim().to_string())
        .find(|id| !id.is_empty())
}

/// Answer `Introspectable` and `Peer` calls. Returns `None` for anything else.
fn standard_reply(router: &Router, call: &Message) -> Option<Message> {
    let path = call.path.as_deref().unwrap_or("/");
    let member = call.member.as_deref().unwrap_or_default();

    match (call.interface.as_deref()?, member) {
        (INTROSPECTABLE, "Introspect") => Some(match introspect(router, path) {
            Ok(xml) => reply_string(call, xml),
            Err(e) => Message::error(call, e.error_name(), &e.to_string()),
        }),
        (PEER, "Ping") => Some(Message::method_return(call)),
        (PEER, "GetMachineId") => Some(match machine_id() {
            Some(id) => reply_string(call, id),
            None => Message::error(call, error_names::FAILED, "Machine id is not available"),
        }),
        _ => None,
    }
}

/// Route one inbound method call.
pub(crate) fn dispatch_method_call(shared: &Rc<Shared>, conn: &Rc<ConnectionState>, call: Message) {
    let connection = Connection::new(Rc::downgrade(shared), conn.id);
    let path = call.path.clone().unwrap_or_default();
    let member = call.member.clone().unwrap_or_default();
    debug!(
        "Method call {} {:?}.{} from {:?}",
        path, call.interface, member, call.sender
    );

    let standard = standard_reply(&conn.router.borrow(), &call);
    if let Some(reply) = standard {
        if let Err(e) = connection.send_message(reply) {
            warn!("Failed to answer standard method: {}", e);
        }
        return;
    }

    let found = conn
        .router
        .borrow()
        .lookup(&path, call.interface.as_deref(), &member);
    let (interface, entry) = match found {
        Ok(found) => found,
        Err(e) => {
            debug!("{}", e);
            if let Err(e) = connection.send_message(Message::error(&call, e.error_name(), &e.to_string())) {
                warn!("Failed to send routing error: {}", e);
            }
            return;
        }
    };

    let decoded = match shared.codec.decode(&call.body, entry.input.as_deref()) {
        Ok(values) => values,
        Err(e) => {
            debug!("Rejecting {}.{}: {}", interface, member, e);
            if let Err(e) = connection.send_message(Message::error(
                &call,
                error_names::INVALID_ARGS,
                &e.to_string(),
            )) {
                warn!("Failed to send argument error: {}", e);
            }
            return;
        }
    };

    let mut args = entry.bound.clone();
    args.extend(decoded);
    let invocation = Invocation {
        connection: connection.clone(),
        sender: call.sender.clone(),
        path,
        interface,
        member,
        args,
    };

    let reply = ReplyHandle::new(connection, Rc::new(call), entry.output.clone());
    shared.executor.spawn(async move {
        let result = (entry.handler)(invocation).await;
        reply.finish(result);
    });
}

/// Route one inbound signal to every handler registered for its key.
pub(crate) fn dispatch_signal(shared: &Rc<Shared>, conn: &Rc<ConnectionState>, signal: Message) {
    let key = signal.signal_key();
    let handlers = conn.router.borrow().signal_handlers(&key);
    if handlers.is_empty() {
        debug!("No handler for signal {}", key);
        return;
    }

    let values = match shared.codec.decode(&signal.body, None) {
        Ok(values) => values,
        Err(e) => {
            warn!("Dropping signal {}: {}", key, e);
            return;
        }
    };
    debug!("Signal {} to {} handler(s)", key, handlers.len());

    for entry in handlers {
        let mut args = entry.bound.clone();
        args.extend(values.iter().cloned());
        let event = SignalEvent {
            connection: Connection::new(Rc::downgrade(shared), conn.id),
            sender: signal.sender.clone(),
            path: signal.path.clone().unwrap_or_default(),
            interface: signal.interface.clone().unwrap_or_default(),
            member: signal.member.clone().unwrap_or_default(),
            args,
        };
        shared.executor.spawn(async move { (entry.handler)(event).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> MethodEntry {
        MethodEntry::new(|_| async { Ok(vec![]) })
    }

    fn router() -> Router {
        let mut router = Router::default();
        router.add_method("/org/example", "org.example.A", "Echo", entry().input("s"));
        router.add_method("/org/example", "org.example.B", "Other", entry());
        router
    }

    #[test]
    fn test_lookup_misses_in_order() {
        let router = router();

        let err = router.lookup("/nope", Some("org.example.A"), "Echo").unwrap_err();
        assert_eq!(err.error_name(), error_names::UNKNOWN_OBJECT);
        assert_eq!(err.to_string(), "No such object path '/nope'");

        let err = router.lookup("/org/example", Some("org.example.C"), "Echo").unwrap_err();
        assert_eq!(err.error_name(), error_names::UNKNOWN_INTERFACE);
        assert_eq!(
            err.to_string(),
            "No such interface 'org.example.C' at object path '/org/example'"
        );

        let err = router.lookup("/org/example", Some("org.example.A"), "Nope").unwrap_err();
        assert_eq!(err.error_name(), error_names::UNKNOWN_METHOD);
        assert_eq!(
            err.to_string(),
            "No such method 'Nope' in interface 'org.example.A' at object path '/org/example'"
        );
    }

    #[test]
    fn test_lookup_without_interface() {
        let router = router();
        let (interface, _) = router.lookup("/org/example", None, "Other").unwrap();
        assert_eq!(interface, "org.example.B");
        assert!(router.lookup("/org/example", None, "Missing").is_err());
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut router = router();
        router.add_method("/org/example", "org.example.A", "Echo", entry().input("i"));
        let (_, found) = router.lookup("/org/example", Some("org.example.A"), "Echo").unwrap();
        assert_eq!(found.input.as_deref(), Some("i"));
    }

    #[test]
    fn test_signal_handlers_keep_order() {
        let mut router = Router::default();
        let key = "/a:org.example.A:Changed".to_string();
        router.add_signal(key.clone(), SignalEntry::new(|_| async {}).bound(vec![1u32.into()]));
        router.add_signal(key.clone(), SignalEntry::new(|_| async {}).bound(vec![2u32.into()]));

        let handlers = router.signal_handlers(&key);
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].bound, vec![Value::UInt32(1)]);
        assert_eq!(handlers[1].bound, vec![Value::UInt32(2)]);
        assert!(router.signal_handlers("/b:org.example.A:Changed").is_empty());
    }

    #[test]
    fn test_standard_ping_and_introspect() {
        let router = router();
        let mut call = Message::method_call("org.example", "/org/example", PEER, "Ping");
        call.serial = 4;
        let reply = standard_reply(&router, &call).unwrap();
        assert_eq!(reply.reply_serial, Some(4));
        assert!(reply.error_name.is_none());

        let call = Message::method_call("org.example", "/unregistered", INTROSPECTABLE, "Introspect");
        let reply = standard_reply(&router, &call).unwrap();
        assert_eq!(reply.error_name.as_deref(), Some(error_names::UNKNOWN_OBJECT));

        let call = Message::method_call("org.example", "/org/example", "org.example.A", "Echo");
        assert!(standard_reply(&router, &call).is_none());
    }
}
