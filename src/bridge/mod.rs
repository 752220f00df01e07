//! Maps transport watches and timeouts onto an event loop.
//!
//! Exactly one of three modes is active:
//!
//! - **Idle**: records are kept but nothing is registered anywhere.
//! - **Running**: a run phase of the owned [`Reactor`] is in progress and
//!   every enabled watch and timer is registered on it.
//! - **External**: the application's reactor was installed through
//!   [`ExternalReactor`]; every add/remove/toggle is forwarded to its
//!   callbacks and the application drives the sources through
//!   [`WatchRef::handle`] and [`TimerRef::handle`].

pub mod registry;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::{ConnectionId, ConnectionState, Shared};
use crate::error::BusError;
use crate::reactor::{Interrupt, IoKey, Notifier, Ready, Reactor};
use crate::transport::{TransportEvent, WatchFlags};

pub use registry::{SourceRegistry, TimerHandle, TimerRecord, WatchHandle, WatchRecord};

/// Token attached to owned-reactor registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Watch(ConnectionId, WatchHandle),
    Timer(ConnectionId, TimerHandle),
    Interrupt,
}

enum Mode {
    Idle,
    Running,
    External(Rc<ExternalReactor>),
}

type Callback = Box<dyn Fn(&EventSource)>;

/// Registration callbacks of an application-supplied reactor.
pub struct ExternalReactor {
    add: Callback,
    remove: Callback,
    toggle: Callback,
}

impl ExternalReactor {
    pub fn new<A, R, T>(add: A, remove: R, toggle: T) -> Self
    where
        A: Fn(&EventSource) + 'static,
        R: Fn(&EventSource) + 'static,
        T: Fn(&EventSource) + 'static,
    {
        Self {
            add: Box::new(add),
            remove: Box::new(remove),
            toggle: Box::new(toggle),
        }
    }
}

/// A watch or timer as seen by an external reactor.
#[derive(Clone, PartialEq, Debug)]
pub enum EventSource {
    Watch(WatchRef),
    Timer(TimerRef),
}

/// Handle to one watch. Stays safe to use after the watch is gone.
#[derive(Clone)]
pub struct WatchRef {
    bus: Weak<Shared>,
    conn: ConnectionId,
    handle: WatchHandle,
}

impl WatchRef {
    fn with<R>(&self, f: impl FnOnce(&WatchRecord) -> R) -> Option<R> {
        let shared = self.bus.upgrade()?;
        let conn = shared.connection(self.conn)?;
        let sources = conn.sources.borrow();
        sources.watch(self.handle).map(f)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.with(|w| w.fd)
    }

    pub fn flags(&self) -> Option<WatchFlags> {
        self.with(|w| w.flags)
    }

    pub fn enabled(&self) -> bool {
        self.with(|w| w.enabled).unwrap_or(false)
    }

    /// Report readiness `flags` on the descriptor, then dispatch whatever
    /// it produced.
    pub fn handle(&self, flags: WatchFlags) -> Result<(), BusError> {
        let Some(shared) = self.bus.upgrade() else {
            return Ok(());
        };
        shared.service_watch(self.conn, self.handle, flags)?;
        shared.settle()
    }
}

impl PartialEq for WatchRef {
    fn eq(&self, other: &Self) -> bool {
        self.conn == other.conn && self.handle == other.handle
    }
}

impl fmt::Debug for WatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRef")
            .field("conn", &self.conn)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Handle to one timer.
#[derive(Clone)]
pub struct TimerRef {
    bus: Weak<Shared>,
    conn: ConnectionId,
    handle: TimerHandle,
}

impl TimerRef {
    fn with<R>(&self, f: impl FnOnce(&TimerRecord) -> R) -> Option<R> {
        let shared = self.bus.upgrade()?;
        let conn = shared.connection(self.conn)?;
        let sources = conn.sources.borrow();
        sources.timer(self.handle).map(f)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.with(|t| t.interval)
    }

    pub fn enabled(&self) -> bool {
        self.with(|t| t.enabled).unwrap_or(false)
    }

    /// Report that the interval elapsed, then dispatch whatever it produced.
    pub fn handle(&self) -> Result<(), BusError> {
        let Some(shared) = self.bus.upgrade() else {
            return Ok(());
        };
        shared.service_timer(self.conn, self.handle)?;
        shared.settle()
    }
}

impl PartialEq for TimerRef {
    fn eq(&self, other: &Self) -> bool {
        self.conn == other.conn && self.handle == other.handle
    }
}

impl fmt::Debug for TimerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRef")
            .field("conn", &self.conn)
            .field("handle", &self.handle)
            .finish()
    }
}

fn watch_source(bus: &Weak<Shared>, conn: ConnectionId, handle: WatchHandle) -> EventSource {
    EventSource::Watch(WatchRef {
        bus: bus.clone(),
        conn,
        handle,
    })
}

fn timer_source(bus: &Weak<Shared>, conn: ConnectionId, handle: TimerHandle) -> EventSource {
    EventSource::Timer(TimerRef {
        bus: bus.clone(),
        conn,
        handle,
    })
}

pub(crate) struct Bridge {
    reactor: RefCell<Reactor<Source>>,
    mode: RefCell<Mode>,
    interrupt: RefCell<Option<(Interrupt, IoKey)>>,
}

impl Bridge {
    pub fn new(capacity: NonZeroUsize) -> io::Result<Self> {
        Ok(Self {
            reactor: RefCell::new(Reactor::with_capacity(capacity)?),
            mode: RefCell::new(Mode::Idle),
            interrupt: RefCell::new(None),
        })
    }

    pub fn notifier(&self) -> Notifier {
        self.reactor.borrow().notifier()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Running)
    }

    pub fn is_external(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::External(_))
    }

    fn external(&self) -> Option<Rc<ExternalReactor>> {
        match &*self.mode.borrow() {
            Mode::External(ext) => Some(ext.clone()),
            _ => None,
        }
    }

    /// Apply one watch/timeout change reported by `conn`'s transport.
    pub fn apply(
        &self,
        bus: &Weak<Shared>,
        conn: &ConnectionState,
        event: TransportEvent,
    ) -> Result<(), BusError> {
        let external = self.external();
        let running = self.is_running();

        match event {
            TransportEvent::WatchAdded {
                id,
                fd,
                flags,
                enabled,
            } => {
                debug!(
                    "Watch {:?} added on fd {} ({:?}, enabled: {})",
                    id, fd, flags, enabled
                );
                let handle = conn.sources.borrow_mut().add_watch(WatchRecord {
                    id,
                    fd,
                    flags,
                    enabled,
                    io_key: None,
                });
                if running {
                    self.register_watch(conn, handle)?;
                }
                if let Some(ext) = external {
                    (ext.add)(&watch_source(bus, conn.id, handle));
                }
            }
            TransportEvent::WatchToggled { id, enabled } => {
                let handle = conn.sources.borrow().watch_handle(id);
                let Some(handle) = handle else {
                    debug!("Toggle for unknown watch {:?}", id);
                    return Ok(());
                };
                debug!("Watch {:?} enabled: {}", id, enabled);
                if let Some(record) = conn.sources.borrow_mut().watch_mut(handle) {
                    record.enabled = enabled;
                }
                if running {
                    if enabled {
                        self.register_watch(conn, handle)?;
                    } else {
                        self.unregister_watch(conn, handle)?;
                    }
                }
                if let Some(ext) = external {
                    (ext.toggle)(&watch_source(bus, conn.id, handle));
                }
            }
            TransportEvent::WatchRemoved { id } => {
                let handle = conn.sources.borrow().watch_handle(id);
                let Some(handle) = handle else {
                    debug!("Removal of unknown watch {:?}", id);
                    return Ok(());
                };
                debug!("Watch {:?} removed", id);
                self.unregister_watch(conn, handle)?;
                if let Some(ext) = external {
                    (ext.remove)(&watch_source(bus, conn.id, handle));
                }
                conn.sources.borrow_mut().remove_watch(handle);
            }
            TransportEvent::TimeoutAdded {
                id,
                interval,
                enabled,
            } => {
                debug!(
                    "Timeout {:?} added ({:?}, enabled: {})",
                    id, interval, enabled
                );
                let handle = conn
                    .sources
                    .borrow_mut()
                    .add_timer(TimerRecord::new(id, interval, enabled));
                if running {
                    self.register_timer(conn, handle);
                }
                if let Some(ext) = external {
                    (ext.add)(&timer_source(bus, conn.id, handle));
                }
            }
            TransportEvent::TimeoutToggled { id, enabled } => {
                let handle = conn.sources.borrow().timer_handle(id);
                let Some(handle) = handle else {
                    debug!("Toggle for unknown timeout {:?}", id);
                    return Ok(());
                };
                debug!("Timeout {:?} enabled: {}", id, enabled);
                if let Some(record) = conn.sources.borrow_mut().timer_mut(handle) {
                    record.enabled = enabled;
                    if enabled {
                        record.next_due = Instant::now() + record.interval;
                    }
                }
                if running {
                    self.unregister_timer(conn, handle);
                    self.register_timer(conn, handle);
                }
                if let Some(ext) = external {
                    (ext.toggle)(&timer_source(bus, conn.id, handle));
                }
            }
            TransportEvent::TimeoutRemoved { id } => {
                let handle = conn.sources.borrow().timer_handle(id);
                let Some(handle) = handle else {
                    debug!("Removal of unknown timeout {:?}", id);
                    return Ok(());
                };
                debug!("Timeout {:?} removed", id);
                self.unregister_timer(conn, handle);
                if let Some(ext) = external {
                    (ext.remove)(&timer_source(bus, conn.id, handle));
                }
                conn.sources.borrow_mut().remove_timer(handle);
            }
        }
        Ok(())
    }

    fn register_watch(&self, conn: &ConnectionState, handle: WatchHandle) -> Result<(), BusError> {
        let mut sources = conn.sources.borrow_mut();
        let Some(record) = sources.watch_mut(handle) else {
            return Ok(());
        };
        if !record.enabled || record.io_key.is_some() {
            return Ok(());
        }
        let key = self.reactor.borrow_mut().add_io(
            record.fd,
            record.flags.contains(WatchFlags::READABLE),
            record.flags.contains(WatchFlags::WRITABLE),
            Source::Watch(conn.id, handle),
        )?;
        record.io_key = Some(key);
        Ok(())
    }

    fn unregister_watch(&self, conn: &ConnectionState, handle: WatchHandle) -> Result<(), BusError> {
        let key = conn
            .sources
            .borrow_mut()
            .watch_mut(handle)
            .and_then(|record| record.io_key.take());
        if let Some(key) = key {
            self.reactor.borrow_mut().remove_io(key)?;
        }
        Ok(())
    }

    fn register_timer(&self, conn: &ConnectionState, handle: TimerHandle) {
        let mut sources = conn.sources.borrow_mut();
        let Some(record) = sources.timer_mut(handle) else {
            return;
        };
        if !record.enabled || record.timer_key.is_some() {
            return;
        }
        let due = record.next_due.max(Instant::now());
        let key = self.reactor.borrow_mut().add_timer_at(
            due,
            record.interval,
            Source::Timer(conn.id, handle),
        );
        record.timer_key = Some(key);
    }

    fn unregister_timer(&self, conn: &ConnectionState, handle: TimerHandle) {
        let key = conn
            .sources
            .borrow_mut()
            .timer_mut(handle)
            .and_then(|record| record.timer_key.take());
        if let Some(key) = key {
            self.reactor.borrow_mut().remove_timer(key);
        }
    }

    /// Start a run phase: register every enabled source on the owned reactor.
    pub fn enter_run(
        &self,
        conns: &[Rc<ConnectionState>],
        handle_sigint: bool,
    ) -> Result<(), BusError> {
        if !matches!(*self.mode.borrow(), Mode::Idle) {
            return Err(BusError::AlreadyRunning);
        }
        *self.mode.borrow_mut() = Mode::Running;

        if let Err(e) = self.register_all(conns, handle_sigint) {
            self.exit_run(conns);
            return Err(e);
        }
        debug!("Run phase started");
        Ok(())
    }

    fn register_all(
        &self,
        conns: &[Rc<ConnectionState>],
        handle_sigint: bool,
    ) -> Result<(), BusError> {
        for conn in conns {
            let watches = conn.sources.borrow().watches();
            for handle in watches {
                self.register_watch(conn, handle)?;
            }
            let timers = conn.sources.borrow().timers();
            for handle in timers {
                self.register_timer(conn, handle);
            }
        }

        if handle_sigint {
            match Interrupt::install() {
                Ok(interrupt) => {
                    let key =
                        self.reactor
                            .borrow_mut()
                            .add_io(interrupt.fd(), true, false, Source::Interrupt)?;
                    *self.interrupt.borrow_mut() = Some((interrupt, key));
                }
                Err(e) => warn!("SIGINT will not stop the loop: {}", e),
            }
        }
        Ok(())
    }

    /// End a run phase: drop every owned-reactor registration.
    pub fn exit_run(&self, conns: &[Rc<ConnectionState>]) {
        for conn in conns {
            let watches = conn.sources.borrow().watches();
            for handle in watches {
                if let Err(e) = self.unregister_watch(conn, handle) {
                    debug!("Failed to unregister watch: {}", e);
                }
            }
            let timers = conn.sources.borrow().timers();
            for handle in timers {
                self.unregister_timer(conn, handle);
            }
        }

        if let Some((interrupt, key)) = self.interrupt.borrow_mut().take() {
            if let Err(e) = self.reactor.borrow_mut().remove_io(key) {
                debug!("Failed to unregister SIGINT descriptor: {}", e);
            }
            drop(interrupt);
        }

        let mut mode = self.mode.borrow_mut();
        if matches!(*mode, Mode::Running) {
            *mode = Mode::Idle;
            debug!("Run phase ended");
        }
    }

    /// Hand all sources to an external reactor, replaying an add for each
    /// live watch and timer.
    pub fn activate_external(
        &self,
        bus: &Weak<Shared>,
        ext: ExternalReactor,
        conns: &[Rc<ConnectionState>],
    ) -> Result<(), BusError> {
        if !matches!(*self.mode.borrow(), Mode::Idle) {
            return Err(BusError::AlreadyActive);
        }
        let ext = Rc::new(ext);
        *self.mode.borrow_mut() = Mode::External(ext.clone());
        info!("External reactor installed");

        for conn in conns {
            let watches = conn.sources.borrow().watches();
            for handle in watches {
                (ext.add)(&watch_source(bus, conn.id, handle));
            }
            let timers = conn.sources.borrow().timers();
            for handle in timers {
                (ext.add)(&timer_source(bus, conn.id, handle));
            }
        }
        Ok(())
    }

    /// Take the sources back from the external reactor, replaying a remove
    /// for each. Returns false if no external reactor was installed.
    pub fn deactivate_external(&self, bus: &Weak<Shared>, conns: &[Rc<ConnectionState>]) -> bool {
        let previous = std::mem::replace(&mut *self.mode.borrow_mut(), Mode::Idle);
        let ext = match previous {
            Mode::External(ext) => ext,
            other => {
                *self.mode.borrow_mut() = other;
                return false;
            }
        };

        for conn in conns {
            let watches = conn.sources.borrow().watches();
            for handle in watches {
                (ext.remove)(&watch_source(bus, conn.id, handle));
            }
            let timers = conn.sources.borrow().timers();
            for handle in timers {
                (ext.remove)(&timer_source(bus, conn.id, handle));
            }
        }
        info!("External reactor removed");
        true
    }

    /// Forget every source still recorded for a connection being closed.
    pub fn detach(&self, bus: &Weak<Shared>, conn: &ConnectionState) {
        let external = self.external();

        let watches = conn.sources.borrow().watches();
        for handle in watches {
            if let Err(e) = self.unregister_watch(conn, handle) {
                debug!("Failed to unregister watch: {}", e);
            }
            if let Some(ext) = &external {
                (ext.remove)(&watch_source(bus, conn.id, handle));
            }
            conn.sources.borrow_mut().remove_watch(handle);
        }

        let timers = conn.sources.borrow().timers();
        for handle in timers {
            self.unregister_timer(conn, handle);
            if let Some(ext) = &external {
                (ext.remove)(&timer_source(bus, conn.id, handle));
            }
            conn.sources.borrow_mut().remove_timer(handle);
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Ready<Source>>, BusError> {
        Ok(self.reactor.borrow_mut().wait(timeout)?)
    }

    /// Record that the owned reactor fired a timer.
    pub fn timer_fired(&self, conn: &ConnectionState, handle: TimerHandle) {
        if let Some(record) = conn.sources.borrow_mut().timer_mut(handle) {
            record.next_due = Instant::now() + record.interval;
        }
    }

    /// True if SIGINT arrived since the last check.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt
            .borrow_mut()
            .as_mut()
            .map(|(interrupt, _)| interrupt.take())
            .unwrap_or(false)
    }
}
