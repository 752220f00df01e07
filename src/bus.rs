//! The coordinator: connections, the event loop and the task executor.
//!
//! A [`Bus`] owns every open connection together with the state attached to
//! it (transport, handler tables, watch/timer registry, pending calls). It is
//! single-threaded and cheap to clone; [`Connection`] handles refer back to
//! it weakly and fail with [`BusError::Disconnected`] once it is gone.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info};

use crate::bridge::{Bridge, ExternalReactor, Source, SourceRegistry, TimerHandle, WatchHandle};
use crate::codec::{Body, Codec, SignatureCodec, Value};
use crate::config::Config;
use crate::dispatch::{self, MethodEntry, Router, SignalEntry};
use crate::error::BusError;
use crate::executor::Executor;
use crate::message::{self, Message, MessageType};
use crate::names;
use crate::reactor::Ready;
use crate::rpc::{self, PendingCalls};
use crate::transport::{SocketTransport, Transport, WatchFlags};

/// Which shared bus [`Bus::open`] connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    System,
    Session,
}

/// Identity of a connection within its [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Why a run phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// [`Bus::quit`] was called.
    Quit,
    /// SIGINT arrived.
    Interrupt,
}

pub(crate) struct ConnectionState {
    pub(crate) id: ConnectionId,
    pub(crate) transport: RefCell<Box<dyn Transport>>,
    pub(crate) router: RefCell<Router>,
    pub(crate) sources: RefCell<SourceRegistry>,
    pub(crate) pending: RefCell<PendingCalls>,
    /// Inbound calls whose reply has not been sent yet.
    inflight: Cell<usize>,
}

pub(crate) struct Shared {
    pub(crate) codec: Box<dyn Codec>,
    pub(crate) executor: Executor,
    pub(crate) bridge: Bridge,
    pub(crate) default_timeout: Duration,
    handle_sigint: bool,
    system_socket: PathBuf,
    session_socket: PathBuf,
    connections: RefCell<BTreeMap<ConnectionId, Rc<ConnectionState>>>,
    shared_by_kind: RefCell<HashMap<BusKind, ConnectionId>>,
    next_id: Cell<u64>,
    stop: Cell<Option<Stop>>,
}

impl Shared {
    pub(crate) fn connection(&self, id: ConnectionId) -> Option<Rc<ConnectionState>> {
        self.connections.borrow().get(&id).cloned()
    }

    fn connections(&self) -> Vec<Rc<ConnectionState>> {
        self.connections.borrow().values().cloned().collect()
    }

    /// Feed the transport's watch/timeout changes to the bridge.
    pub(crate) fn pump(self: &Rc<Self>, conn: &ConnectionState) -> Result<(), BusError> {
        let weak = Rc::downgrade(self);
        loop {
            let events = conn.transport.borrow_mut().take_events();
            if events.is_empty() {
                return Ok(());
            }
            for event in events {
                self.bridge.apply(&weak, conn, event)?;
            }
        }
    }

    /// Route every message the transport has buffered, in arrival order.
    fn drain(self: &Rc<Self>, conn: &Rc<ConnectionState>) {
        loop {
            let message = conn.transport.borrow_mut().pop_message();
            let Some(message) = message else {
                return;
            };
            match message.kind {
                MessageType::MethodCall => dispatch::dispatch_method_call(self, conn, message),
                MessageType::Signal => dispatch::dispatch_signal(self, conn, message),
                MessageType::MethodReturn | MessageType::Error => {
                    rpc::complete(self, conn, message)
                }
            }
        }
    }

    fn flush_all(self: &Rc<Self>) -> Result<(), BusError> {
        for conn in self.connections() {
            self.drain(&conn);
            self.pump(&conn)?;
        }
        Ok(())
    }

    pub(crate) fn service_watch(
        self: &Rc<Self>,
        id: ConnectionId,
        handle: WatchHandle,
        flags: WatchFlags,
    ) -> Result<(), BusError> {
        let Some(conn) = self.connection(id) else {
            return Ok(());
        };
        let watch = conn.sources.borrow().watch(handle).map(|w| w.id);
        let Some(watch) = watch else {
            return Ok(());
        };
        conn.transport.borrow_mut().handle_watch(watch, flags);
        self.pump(&conn)?;
        self.drain(&conn);
        self.pump(&conn)
    }

    pub(crate) fn service_timer(
        self: &Rc<Self>,
        id: ConnectionId,
        handle: TimerHandle,
    ) -> Result<(), BusError> {
        let Some(conn) = self.connection(id) else {
            return Ok(());
        };
        let timeout = conn.sources.borrow().timer(handle).map(|t| t.id);
        let Some(timeout) = timeout else {
            return Ok(());
        };
        self.bridge.timer_fired(&conn, handle);
        conn.transport.borrow_mut().handle_timeout(timeout);
        self.pump(&conn)?;
        self.drain(&conn);
        self.pump(&conn)
    }

    /// Run tasks and route messages until nothing is left to do without
    /// waiting.
    pub(crate) fn settle(self: &Rc<Self>) -> Result<(), BusError> {
        loop {
            self.flush_all()?;
            if !self.executor.has_ready() {
                return Ok(());
            }
            self.executor.run_ready();
        }
    }

    fn has_buffered(&self) -> bool {
        self.connections
            .borrow()
            .values()
            .any(|conn| conn.transport.borrow().has_messages())
    }

    /// One loop iteration: dispatch, run tasks, wait, service what fired.
    fn turn(self: &Rc<Self>, timeout: Option<Duration>) -> Result<(), BusError> {
        self.flush_all()?;
        self.executor.run_ready();
        self.flush_all()?;

        let busy = self.stop.get().is_some() || self.executor.has_ready() || self.has_buffered();
        let ready = self
            .bridge
            .wait(if busy { Some(Duration::ZERO) } else { timeout })?;

        for event in ready {
            match event {
                Ready::Io {
                    token: Source::Watch(conn, handle),
                    readable,
                    writable,
                } => {
                    let mut flags = WatchFlags::empty();
                    if readable {
                        flags |= WatchFlags::READABLE;
                    }
                    if writable {
                        flags |= WatchFlags::WRITABLE;
                    }
                    self.service_watch(conn, handle, flags)?;
                }
                Ready::Timer {
                    token: Source::Timer(conn, handle),
                } => self.service_timer(conn, handle)?,
                Ready::Io {
                    token: Source::Interrupt,
                    ..
                } => {
                    if self.bridge.take_interrupt() {
                        info!("Interrupted");
                        self.stop.set(Some(Stop::Interrupt));
                    }
                }
                other => debug!("Ignoring mismatched readiness {:?}", other),
            }
        }

        self.executor.run_ready();
        self.flush_all()
    }
}

/// Ends the run phase when dropped.
struct RunPhase<'a>(&'a Shared);

impl Drop for RunPhase<'_> {
    fn drop(&mut self) {
        self.0.bridge.exit_run(&self.0.connections());
    }
}

/// Event loop, executor and connection table.
#[derive(Clone)]
pub struct Bus {
    shared: Rc<Shared>,
}

impl Bus {
    pub fn new(config: &Config) -> Result<Self, BusError> {
        Self::with_codec(config, SignatureCodec)
    }

    pub fn with_codec(config: &Config, codec: impl Codec + 'static) -> Result<Self, BusError> {
        let capacity = NonZeroUsize::new(config.reactor.event_capacity).ok_or_else(|| {
            BusError::InvalidArgument("reactor.event_capacity must be positive".into())
        })?;
        let bridge = Bridge::new(capacity)?;
        let executor = Executor::new(bridge.notifier());

        Ok(Self {
            shared: Rc::new(Shared {
                codec: Box::new(codec),
                executor,
                bridge,
                default_timeout: Duration::from_millis(config.call.default_timeout_ms),
                handle_sigint: config.reactor.handle_sigint,
                system_socket: config.bus.system_socket.clone(),
                session_socket: config.bus.session_socket.clone(),
                connections: RefCell::new(BTreeMap::new()),
                shared_by_kind: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                stop: Cell::new(None),
            }),
        })
    }

    /// Connect to the shared bus of `kind`. Later calls return the same
    /// connection.
    pub fn open(&self, kind: BusKind) -> Result<Connection, BusError> {
        let existing = self.shared.shared_by_kind.borrow().get(&kind).copied();
        if let Some(id) = existing {
            if self.shared.connection(id).is_some() {
                debug!("Reusing {:?} bus connection", kind);
                return Ok(self.handle(id));
            }
        }

        let path = match kind {
            BusKind::System => &self.shared.system_socket,
            BusKind::Session => &self.shared.session_socket,
        };
        let transport = SocketTransport::connect(path)?;
        info!("Connected to {:?} bus at {}", kind, path.display());

        let connection = self.attach(Box::new(transport))?;
        self.shared
            .shared_by_kind
            .borrow_mut()
            .insert(kind, connection.id);
        Ok(connection)
    }

    /// Open a private connection over an already connected stream.
    pub fn open_stream(&self, stream: UnixStream) -> Result<Connection, BusError> {
        self.attach(Box::new(SocketTransport::new(stream)?))
    }

    /// Open a private connection over any transport.
    pub fn open_transport(&self, transport: impl Transport + 'static) -> Result<Connection, BusError> {
        self.attach(Box::new(transport))
    }

    fn attach(&self, mut transport: Box<dyn Transport>) -> Result<Connection, BusError> {
        transport.set_exit_on_disconnect(false);

        let id = ConnectionId(self.shared.next_id.get());
        self.shared.next_id.set(id.0 + 1);
        debug!("Connection {:?} is {}", id, transport.unique_name());

        let state = Rc::new(ConnectionState {
            id,
            transport: RefCell::new(transport),
            router: RefCell::new(Router::default()),
            sources: RefCell::new(SourceRegistry::default()),
            pending: RefCell::new(PendingCalls::default()),
            inflight: Cell::new(0),
        });
        self.shared.connections.borrow_mut().insert(id, state.clone());
        self.shared.pump(&state)?;
        Ok(self.handle(id))
    }

    fn handle(&self, id: ConnectionId) -> Connection {
        Connection::new(Rc::downgrade(&self.shared), id)
    }

    fn enter(&self, handle_sigint: bool) -> Result<RunPhase<'_>, BusError> {
        self.shared
            .bridge
            .enter_run(&self.shared.connections(), handle_sigint)?;
        Ok(RunPhase(&self.shared))
    }

    /// Run the loop until [`Bus::quit`] is called or SIGINT arrives.
    pub fn run(&self) -> Result<Stop, BusError> {
        let _phase = self.enter(self.shared.handle_sigint)?;
        info!("Event loop running");
        loop {
            self.shared.turn(None)?;
            if let Some(stop) = self.shared.stop.take() {
                info!("Event loop stopped ({:?})", stop);
                return Ok(stop);
            }
        }
    }

    /// Run a single loop iteration, waiting at most `timeout` for something
    /// to happen. Returns the stop request made during it, if any.
    pub fn iterate(&self, timeout: Option<Duration>) -> Result<Option<Stop>, BusError> {
        let _phase = self.enter(false)?;
        self.shared.turn(timeout)?;
        Ok(self.shared.stop.take())
    }

    /// Run the loop until `future` resolves.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, BusError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let _phase = self.enter(self.shared.handle_sigint)?;
        let (tx, mut rx) = oneshot::channel();
        self.shared.executor.spawn(async move {
            let _ = tx.send(future.await);
        });

        loop {
            match rx.try_recv() {
                Ok(output) => return Ok(output),
                Err(TryRecvError::Closed) => {
                    return Err(BusError::TaskFailure(
                        "the task ended without producing a value".into(),
                    ))
                }
                Err(TryRecvError::Empty) => {}
            }
            match self.shared.stop.take() {
                Some(Stop::Interrupt) => return Err(BusError::Interrupted),
                Some(Stop::Quit) => debug!("Quit requested while blocking on a task"),
                None => {}
            }
            self.shared.turn(None)?;
        }
    }

    /// Ask the running loop to return.
    pub fn quit(&self) {
        if self.shared.stop.get().is_none() {
            self.shared.stop.set(Some(Stop::Quit));
        }
    }

    /// Run `future` as a task, starting on the next loop iteration.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.shared.executor.spawn(future);
    }

    /// Hand every watch and timer to an application reactor. Fails while a
    /// run phase is active or another reactor is installed.
    pub fn set_external_reactor(&self, reactor: ExternalReactor) -> Result<(), BusError> {
        self.shared.bridge.activate_external(
            &Rc::downgrade(&self.shared),
            reactor,
            &self.shared.connections(),
        )
    }

    /// Take the watches and timers back. Returns false if no external
    /// reactor was installed.
    pub fn clear_external_reactor(&self) -> bool {
        self.shared
            .bridge
            .deactivate_external(&Rc::downgrade(&self.shared), &self.shared.connections())
    }

    pub fn is_running(&self) -> bool {
        self.shared.bridge.is_running()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.borrow().len()
    }
}

/// Handle to one open connection.
#[derive(Clone)]
pub struct Connection {
    shared: Weak<Shared>,
    pub(crate) id: ConnectionId,
}

impl Connection {
    pub(crate) fn new(shared: Weak<Shared>, id: ConnectionId) -> Self {
        Self { shared, id }
    }

    pub(crate) fn state(&self) -> Result<(Rc<Shared>, Rc<ConnectionState>), BusError> {
        let shared = self.shared.upgrade().ok_or(BusError::Disconnected)?;
        let state = shared.connection(self.id).ok_or(BusError::Disconnected)?;
        Ok((shared, state))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name peers use to address this connection.
    pub fn unique_name(&self) -> Result<String, BusError> {
        let (_, state) = self.state()?;
        let name = state.transport.borrow().unique_name().to_string();
        Ok(name)
    }

    pub fn is_connected(&self) -> bool {
        self.state()
            .map(|(_, state)| state.transport.borrow().is_connected())
            .unwrap_or(false)
    }

    /// Serve `member` of `interface` at `path`. Registering the same key
    /// again replaces the previous handler.
    pub fn register_method(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        entry: MethodEntry,
    ) -> Result<(), BusError> {
        names::object_path(path)?;
        names::interface(interface)?;
        names::member(member)?;
        for signature in [entry.input.as_deref(), entry.output.as_deref()]
            .into_iter()
            .flatten()
        {
            crate::codec::signature::parse(signature)?;
        }

        let (_, state) = self.state()?;
        state
            .router
            .borrow_mut()
            .add_method(path, interface, member, entry);
        debug!("Registered {} {}.{}", path, interface, member);
        Ok(())
    }

    /// Run `entry` for every `member` signal of `interface` from `path`.
    pub fn on_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        entry: SignalEntry,
    ) -> Result<(), BusError> {
        names::object_path(path)?;
        names::interface(interface)?;
        names::member(member)?;

        let (_, state) = self.state()?;
        let key = message::signal_key(path, interface, member);
        debug!("Listening for signal {}", key);
        state.router.borrow_mut().add_signal(key, entry);
        Ok(())
    }

    /// Run `entry` when the peer goes away.
    pub fn on_disconnect(&self, entry: SignalEntry) -> Result<(), BusError> {
        self.on_signal(
            message::LOCAL_PATH,
            message::LOCAL_INTERFACE,
            message::DISCONNECTED,
            entry,
        )
    }

    pub fn watch_count(&self) -> usize {
        self.state()
            .map(|(_, state)| state.sources.borrow().watch_count())
            .unwrap_or(0)
    }

    pub fn timer_count(&self) -> usize {
        self.state()
            .map(|(_, state)| state.sources.borrow().timer_count())
            .unwrap_or(0)
    }

    /// Inbound calls still waiting for their handler's reply.
    pub fn inflight_calls(&self) -> usize {
        self.state()
            .map(|(_, state)| state.inflight.get())
            .unwrap_or(0)
    }

    /// Close the connection. Calls still waiting for a reply complete with
    /// a `NoReply` error.
    pub fn close(&self) -> Result<(), BusError> {
        let (shared, state) = self.state()?;
        info!("Closing connection {}", state.transport.borrow().unique_name());

        state.transport.borrow_mut().close();
        shared.pump(&state)?;
        shared.bridge.detach(&Rc::downgrade(&shared), &state);

        let waiting = state.pending.borrow().waiting();
        for serial in waiting {
            rpc::complete(
                &shared,
                &state,
                Message::error_reply(
                    serial,
                    message::error_names::NO_REPLY,
                    "Connection closed before a reply was received",
                ),
            );
        }

        shared.connections.borrow_mut().remove(&self.id);
        shared
            .shared_by_kind
            .borrow_mut()
            .retain(|_, id| *id != self.id);
        Ok(())
    }

    pub(crate) fn send_message(&self, message: Message) -> Result<u32, BusError> {
        let (shared, state) = self.state()?;
        let serial = state.transport.borrow_mut().send(message)?;
        shared.pump(&state)?;
        Ok(serial)
    }

    pub(crate) fn encode(&self, signature: Option<&str>, values: Vec<Value>) -> Result<Body, BusError> {
        let shared = self.shared.upgrade().ok_or(BusError::Disconnected)?;
        Ok(shared.codec.encode(signature, values)?)
    }

    pub(crate) fn inflight_changed(&self, delta: isize) {
        if let Ok((_, state)) = self.state() {
            state
                .inflight
                .set(state.inflight.get().saturating_add_signed(delta));
        }
    }
}
