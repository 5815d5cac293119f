// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::rc::Weak;

use bytes::Bytes;
use slab::Slab;

use crate::error::OsError;
use crate::error::OsResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
  Tcp,
  Timer,
  File,
  TlsEngine,
}

impl fmt::Display for HandleKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      HandleKind::Tcp => "tcp",
      HandleKind::Timer => "timer",
      HandleKind::File => "file",
      HandleKind::TlsEngine => "tls engine",
    })
  }
}

pub trait Closable {
  /// Closing twice is the same as closing once.
  fn close(&self);
  fn is_closed(&self) -> bool;
}

pub trait Refable {
  /// `false` exempts the handle from keeping the loop alive.
  fn set_ref(&self, referenced: bool);
  fn has_ref(&self) -> bool;
}

/// Outcome of a read, delivered once per chunk. `Eof` and `Error` end the
/// read side and are delivered at most once.
#[derive(Debug, Clone)]
pub enum ReadEvent {
  Data(Bytes),
  Eof,
  Error(OsError),
}

pub type ReadCallback = Box<dyn FnMut(ReadEvent) + 'static>;
pub type WriteCallback = Box<dyn FnOnce(OsResult<()>) + 'static>;

pub trait Readable {
  fn read_start(&self, on_read: ReadCallback) -> OsResult<()>;
  fn read_stop(&self) -> OsResult<()>;
}

pub trait Writable {
  fn write(&self, data: Bytes, on_complete: WriteCallback) -> OsResult<()>;
  /// Half-close once every previously queued write has drained.
  fn shutdown(&self, on_complete: WriteCallback) -> OsResult<()>;
}

/// Slot plus generation, so a key kept past its handle's removal never
/// matches the handle that reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleKey {
  slot: usize,
  generation: u64,
}

struct Entry {
  kind: HandleKind,
  generation: u64,
  handle: Weak<dyn Closable>,
}

/// Live handles of one loop, closed at shutdown if the owner leaked them.
/// Handles unregister when closed or dropped.
#[derive(Default)]
pub(crate) struct HandleRegistry {
  handles: RefCell<Slab<Entry>>,
  next_generation: Cell<u64>,
}

impl HandleRegistry {
  pub fn register(
    &self,
    kind: HandleKind,
    handle: Weak<dyn Closable>,
  ) -> HandleKey {
    let generation = self.next_generation.get();
    self.next_generation.set(generation + 1);
    let slot = self.handles.borrow_mut().insert(Entry {
      kind,
      generation,
      handle,
    });
    HandleKey { slot, generation }
  }

  pub fn unregister(&self, key: HandleKey) {
    let mut handles = self.handles.borrow_mut();
    let current = handles
      .get(key.slot)
      .is_some_and(|entry| entry.generation == key.generation);
    if current {
      handles.remove(key.slot);
    }
  }

  pub fn len(&self) -> usize {
    self.handles.borrow().len()
  }

  pub fn close_all(&self) -> usize {
    let handles: Vec<_> = self.handles.borrow_mut().drain().collect();
    let mut closed = 0;
    for entry in handles {
      let Some(handle) = entry.handle.upgrade() else {
        continue;
      };
      if !handle.is_closed() {
        log::warn!("closing leaked {} handle", entry.kind);
        handle.close();
        closed += 1;
      }
    }
    closed
  }
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use super::*;

  #[derive(Default)]
  struct Dummy {
    closes: Cell<usize>,
  }

  impl Closable for Dummy {
    fn close(&self) {
      self.closes.set(self.closes.get() + 1);
    }

    fn is_closed(&self) -> bool {
      self.closes.get() > 0
    }
  }

  #[test]
  fn close_all_skips_closed_and_dropped() {
    let registry = HandleRegistry::default();
    let open = Rc::new(Dummy::default());
    let closed = Rc::new(Dummy::default());
    closed.close();
    let dropped = Rc::new(Dummy::default());
    let open_weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&open);
    let closed_weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&closed);
    let dropped_weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&dropped);
    registry.register(HandleKind::Tcp, open_weak);
    registry.register(HandleKind::Timer, closed_weak);
    registry.register(HandleKind::File, dropped_weak);
    drop(dropped);

    assert_eq!(registry.close_all(), 1);
    assert_eq!(open.closes.get(), 1);
    assert_eq!(closed.closes.get(), 1);
    assert_eq!(registry.len(), 0);
  }

  #[test]
  fn unregister_twice_is_harmless() {
    let registry = HandleRegistry::default();
    let handle = Rc::new(Dummy::default());
    let weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&handle);
    let key = registry.register(HandleKind::Tcp, weak);
    registry.unregister(key);
    registry.unregister(key);
    assert_eq!(registry.len(), 0);
  }

  #[test]
  fn stale_key_leaves_reused_slot_alone() {
    let registry = HandleRegistry::default();
    let first = Rc::new(Dummy::default());
    let second = Rc::new(Dummy::default());
    let weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&first);
    let stale = registry.register(HandleKind::Tcp, weak);
    registry.unregister(stale);
    let weak: Weak<dyn Closable> = Rc::<Dummy>::downgrade(&second);
    let current = registry.register(HandleKind::Tcp, weak);
    assert_ne!(stale, current);

    registry.unregister(stale);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.close_all(), 1);
    assert_eq!(second.closes.get(), 1);
  }
}
