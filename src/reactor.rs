//! The owned event loop: a `polling` poller for file descriptors plus an
//! ordered map of periodic timers.
//!
//! Registrations carry a caller-chosen token that is handed back in
//! [`Ready`] when they fire. Several registrations on one descriptor are
//! merged into a single poller interest; the poller runs in oneshot mode and
//! a descriptor is re-armed after each event it delivers.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};
use slab::Slab;
use tracing::debug;

/// Shortest timer period the loop honours.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey(u64);

/// Something that fired during [`Reactor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready<T> {
    Io {
        token: T,
        readable: bool,
        writable: bool,
    },
    Timer {
        token: T,
    },
}

struct IoEntry<T> {
    fd: RawFd,
    token: T,
    readable: bool,
    writable: bool,
}

#[derive(Default)]
struct FdState {
    entries: Vec<usize>,
    registered: bool,
}

struct TimerEntry<T> {
    token: T,
    interval: Duration,
    deadline: Instant,
}

/// Wakes a blocked [`Reactor::wait`] from any thread.
#[derive(Clone)]
pub struct Notifier(Arc<Poller>);

impl Notifier {
    pub fn notify(&self) {
        if let Err(e) = self.0.notify() {
            debug!("Poller notify failed: {}", e);
        }
    }
}

pub struct Reactor<T> {
    poller: Arc<Poller>,
    events: Events,
    io: Slab<IoEntry<T>>,
    fds: HashMap<RawFd, FdState>,
    deadlines: BTreeSet<(Instant, u64)>,
    timers: HashMap<u64, TimerEntry<T>>,
    next_timer: u64,
}

impl<T: Copy> Reactor<T> {
    pub fn new() -> io::Result<Self> {
        Self::build(Events::new())
    }

    /// Deliver at most `capacity` descriptor events per wait.
    pub fn with_capacity(capacity: NonZeroUsize) -> io::Result<Self> {
        Self::build(Events::with_capacity(capacity))
    }

    fn build(events: Events) -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events,
            io: Slab::new(),
            fds: HashMap::new(),
            deadlines: BTreeSet::new(),
            timers: HashMap::new(),
            next_timer: 0,
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier(self.poller.clone())
    }

    // ── IO ──────────────────────────────────────────────────────────

    /// Register interest in `fd`. The descriptor must stay open until the
    /// registration is removed.
    pub fn add_io(
        &mut self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        token: T,
    ) -> io::Result<IoKey> {
        let key = self.io.insert(IoEntry {
            fd,
            token,
            readable,
            writable,
        });
        self.fds.entry(fd).or_default().entries.push(key);
        if let Err(e) = self.sync_fd(fd) {
            self.remove_io(IoKey(key))?;
            return Err(e);
        }
        Ok(IoKey(key))
    }

    pub fn remove_io(&mut self, key: IoKey) -> io::Result<()> {
        if !self.io.contains(key.0) {
            return Ok(());
        }
        let entry = self.io.remove(key.0);
        if let Some(state) = self.fds.get_mut(&entry.fd) {
            state.entries.retain(|&k| k != key.0);
        }
        self.sync_fd(entry.fd)
    }

    pub fn io_count(&self) -> usize {
        self.io.len()
    }

    /// Bring the poller's interest for `fd` in line with its registrations.
    fn sync_fd(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(state) = self.fds.get_mut(&fd) else {
            return Ok(());
        };

        if state.entries.is_empty() {
            if state.registered {
                // SAFETY: the descriptor is still open while registered.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                // The fd may already be shut down by its owner.
                let _ = self.poller.delete(borrowed);
            }
            self.fds.remove(&fd);
            return Ok(());
        }

        let (readable, writable) = state.entries.iter().fold((false, false), |(r, w), &k| {
            let entry = &self.io[k];
            (r || entry.readable, w || entry.writable)
        });
        let interest = Event::new(fd as usize, readable, writable);

        if state.registered {
            // SAFETY: as above.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.poller.modify(borrowed, interest)
        } else {
            // SAFETY: the fd is deleted from the poller in `sync_fd` once its
            // last registration is removed, before the owner closes it.
            unsafe { self.poller.add(fd, interest)? };
            state.registered = true;
            Ok(())
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Add a periodic timer firing every `interval`.
    pub fn add_timer(&mut self, interval: Duration, token: T) -> TimerKey {
        let interval = interval.max(MIN_INTERVAL);
        self.add_timer_at(Instant::now() + interval, interval, token)
    }

    /// Add a periodic timer whose first expiry is `deadline`.
    pub fn add_timer_at(&mut self, deadline: Instant, interval: Duration, token: T) -> TimerKey {
        let id = self.next_timer;
        self.next_timer += 1;
        let interval = interval.max(MIN_INTERVAL);
        self.deadlines.insert((deadline, id));
        self.timers.insert(
            id,
            TimerEntry {
                token,
                interval,
                deadline,
            },
        );
        TimerKey(id)
    }

    pub fn remove_timer(&mut self, key: TimerKey) {
        if let Some(entry) = self.timers.remove(&key.0) {
            self.deadlines.remove(&(entry.deadline, key.0));
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // ── Wait ────────────────────────────────────────────────────────

    /// Wait up to `timeout` (forever when `None`) for IO readiness or a
    /// timer expiry and report what fired.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready<T>>> {
        let now = Instant::now();
        let next_timer = self
            .deadlines
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(now));
        let effective = match (timeout, next_timer) {
            (None, None) => None,
            (Some(t), None) | (None, Some(t)) => Some(t),
            (Some(a), Some(b)) => Some(a.min(b)),
        };

        self.events.clear();
        match self.poller.wait(&mut self.events, effective) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let fired: Vec<Event> = self.events.iter().collect();
        let mut ready = Vec::new();
        for event in fired {
            let fd = event.key as RawFd;
            let Some(state) = self.fds.get(&fd) else {
                continue;
            };
            for &k in &state.entries {
                let entry = &self.io[k];
                let readable = event.readable && entry.readable;
                let writable = event.writable && entry.writable;
                if readable || writable {
                    ready.push(Ready::Io {
                        token: entry.token,
                        readable,
                        writable,
                    });
                }
            }
            // Oneshot mode: re-arm.
            self.sync_fd(fd)?;
        }

        let now = Instant::now();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, id));
            if let Some(entry) = self.timers.get_mut(&id) {
                ready.push(Ready::Timer { token: entry.token });
                entry.deadline = (deadline + entry.interval).max(now);
                self.deadlines.insert((entry.deadline, id));
            }
        }

        Ok(ready)
    }
}

/// SIGINT delivered as a readable descriptor for the duration of a run
/// phase. The signal stays blocked for the calling thread until dropped.
#[cfg(target_os = "linux")]
pub struct Interrupt {
    fd: nix::sys::signalfd::SignalFd,
    previous: nix::sys::signal::SigSet,
}

#[cfg(target_os = "linux")]
impl Interrupt {
    pub fn install() -> io::Result<Self> {
        use nix::sys::signal::{SigSet, SigmaskHow, Signal};
        use nix::sys::signalfd::{SfdFlags, SignalFd};

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        let previous = mask.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;
        match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
            Ok(fd) => Ok(Self { fd, previous }),
            Err(e) => {
                let _ = previous.thread_set_mask();
                Err(e.into())
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }

    /// Consume pending signals. Returns true if SIGINT was received.
    pub fn take(&mut self) -> bool {
        let mut received = false;
        while let Ok(Some(_)) = self.fd.read_signal() {
            received = true;
        }
        received
    }
}

#[cfg(target_os = "linux")]
impl Drop for Interrupt {
    fn drop(&mut self) {
        let _ = self.previous.thread_set_mask();
    }
}

/// Elsewhere SIGINT keeps its default disposition.
#[cfg(not(target_os = "linux"))]
pub struct Interrupt;

#[cfg(not(target_os = "linux"))]
impl Interrupt {
    pub fn install() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SIGINT capture is only available on Linux",
        ))
    }

    pub fn fd(&self) -> RawFd {
        -1
    }

    pub fn take(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_timer_fires_and_repeats() {
        let mut reactor = Reactor::new().unwrap();
        let key = reactor.add_timer(Duration::from_millis(5), 7u32);

        let mut fired = 0;
        let start = Instant::now();
        while fired < 2 && start.elapsed() < Duration::from_secs(2) {
            for ready in reactor.wait(Some(Duration::from_millis(50))).unwrap() {
                assert_eq!(ready, Ready::Timer { token: 7 });
                fired += 1;
            }
        }
        assert_eq!(fired, 2);

        reactor.remove_timer(key);
        assert_eq!(reactor.timer_count(), 0);
        assert!(reactor.wait(Some(Duration::from_millis(10))).unwrap().is_empty());
    }

    #[test]
    fn test_io_readiness_is_rearmed() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.add_io(a.as_raw_fd(), true, false, 1u8).unwrap();

        assert!(reactor.wait(Some(Duration::ZERO)).unwrap().is_empty());

        b.write_all(b"x").unwrap();
        let ready = reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            ready,
            vec![Ready::Io {
                token: 1,
                readable: true,
                writable: false
            }]
        );

        // Still readable (nothing consumed), so the re-armed fd fires again.
        let again = reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_merged_registrations_on_one_fd() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        let read = reactor.add_io(a.as_raw_fd(), true, false, 'r').unwrap();
        reactor.add_io(a.as_raw_fd(), false, true, 'w').unwrap();

        // An idle socket is writable but not readable.
        let ready = reactor.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(
            ready,
            vec![Ready::Io {
                token: 'w',
                readable: false,
                writable: true
            }]
        );

        reactor.remove_io(read).unwrap();
        assert_eq!(reactor.io_count(), 1);
    }

    #[test]
    fn test_notify_wakes_wait() {
        let mut reactor: Reactor<()> = Reactor::new().unwrap();
        let notifier = reactor.notifier();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });
        let start = Instant::now();
        reactor.wait(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
