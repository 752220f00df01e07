//! Live watches and timers of each connection.
//!
//! Records live in a generational arena: a handle stays valid until its
//! record is removed, and a stale handle (say, one held by an external
//! reactor after the transport dropped the watch) simply finds nothing.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::reactor::{IoKey, TimerKey};
use crate::transport::{TimeoutId, WatchFlags, WatchId};

/// Slot index plus the generation it was allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    entry: Option<(u64, T)>,
}

/// Slot storage with O(1) insert/remove that remembers insertion order.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    order: BTreeMap<u64, Handle>,
    next_seq: u64,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Handle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some((seq, value));
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some((seq, value)),
                });
                Handle {
                    index,
                    generation: 0,
                }
            }
        };
        self.order.insert(seq, handle);
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut().map(|(_, value)| value)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let (seq, value) = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.order.remove(&seq);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live handles, oldest first.
    pub fn handles(&self) -> Vec<Handle> {
        self.order.values().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub(crate) Handle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) Handle);

#[derive(Debug)]
pub struct WatchRecord {
    pub id: WatchId,
    pub fd: RawFd,
    pub flags: WatchFlags,
    pub enabled: bool,
    /// Registration on the owned reactor, present only during a run phase.
    pub io_key: Option<IoKey>,
}

#[derive(Debug)]
pub struct TimerRecord {
    pub id: TimeoutId,
    pub interval: Duration,
    pub enabled: bool,
    /// When the owned reactor should next fire it.
    pub next_due: Instant,
    pub timer_key: Option<TimerKey>,
}

impl TimerRecord {
    pub fn new(id: TimeoutId, interval: Duration, enabled: bool) -> Self {
        Self {
            id,
            interval,
            enabled,
            next_due: Instant::now() + interval,
            timer_key: None,
        }
    }
}

/// One connection's watches and timers.
#[derive(Default)]
pub struct SourceRegistry {
    watches: Arena<WatchRecord>,
    timers: Arena<TimerRecord>,
    watch_ids: HashMap<WatchId, WatchHandle>,
    timer_ids: HashMap<TimeoutId, TimerHandle>,
}

impl SourceRegistry {
    pub fn add_watch(&mut self, record: WatchRecord) -> WatchHandle {
        let id = record.id;
        let handle = WatchHandle(self.watches.insert(record));
        self.watch_ids.insert(id, handle);
        handle
    }

    pub fn watch(&self, handle: WatchHandle) -> Option<&WatchRecord> {
        self.watches.get(handle.0)
    }

    pub fn watch_mut(&mut self, handle: WatchHandle) -> Option<&mut WatchRecord> {
        self.watches.get_mut(handle.0)
    }

    pub fn watch_handle(&self, id: WatchId) -> Option<WatchHandle> {
        self.watch_ids.get(&id).copied()
    }

    pub fn remove_watch(&mut self, handle: WatchHandle) -> Option<WatchRecord> {
        let record = self.watches.remove(handle.0)?;
        if self.watch_ids.get(&record.id) == Some(&handle) {
            self.watch_ids.remove(&record.id);
        }
        Some(record)
    }

    pub fn watches(&self) -> Vec<WatchHandle> {
        self.watches.handles().into_iter().map(WatchHandle).collect()
    }

    pub fn add_timer(&mut self, record: TimerRecord) -> TimerHandle {
        let id = record.id;
        let handle = TimerHandle(self.timers.insert(record));
        self.timer_ids.insert(id, handle);
        handle
    }

    pub fn timer(&self, handle: TimerHandle) -> Option<&TimerRecord> {
        self.timers.get(handle.0)
    }

    pub fn timer_mut(&mut self, handle: TimerHandle) -> Option<&mut TimerRecord> {
        self.timers.get_mut(handle.0)
    }

    pub fn timer_handle(&self, id: TimeoutId) -> Option<TimerHandle> {
        self.timer_ids.get(&id).copied()
    }

    pub fn remove_timer(&mut self, handle: TimerHandle) -> Option<TimerRecord> {
        let record = self.timers.remove(handle.0)?;
        if self.timer_ids.get(&record.id) == Some(&handle) {
            self.timer_ids.remove(&record.id);
        }
        Some(record)
    }

    pub fn timers(&self) -> Vec<TimerHandle> {
        self.timers.handles().into_iter().map(TimerHandle).collect()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_finds_nothing() {
        let mut arena = Arena::default();
        let a = arena.insert("a");
        assert_eq!(arena.remove(a), Some("a"));

        // The slot is reused under a new generation.
        let b = arena.insert("b");
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn test_handles_in_insertion_order() {
        let mut arena = Arena::default();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        arena.remove(a);
        let d = arena.insert(4);
        assert_eq!(arena.handles(), vec![b, c, d]);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_registry_maps_ids() {
        let mut registry = SourceRegistry::default();
        let w = registry.add_watch(WatchRecord {
            id: WatchId(1),
            fd: 3,
            flags: WatchFlags::READABLE,
            enabled: true,
            io_key: None,
        });
        let t = registry.add_timer(TimerRecord::new(
            TimeoutId(9),
            Duration::from_secs(1),
            true,
        ));

        assert_eq!(registry.watch_handle(WatchId(1)), Some(w));
        assert_eq!(registry.timer_handle(TimeoutId(9)), Some(t));
        assert!(registry.remove_watch(w).is_some());
        assert_eq!(registry.watch_handle(WatchId(1)), None);
        assert_eq!(registry.watch_count(), 0);
        assert_eq!(registry.timer_count(), 1);
    }
}
