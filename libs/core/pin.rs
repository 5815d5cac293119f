// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Counts outstanding obligations that keep the event loop alive. One
/// counter is shared by every component of a runtime instance.
#[derive(Debug, Clone, Default)]
pub struct PinCounter(Arc<AtomicUsize>);

impl PinCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn pin(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }

  /// Releases one pin. Never fails: an unpin at zero is logged and
  /// the count stays at zero.
  pub fn unpin(&self) {
    let result =
      self
        .0
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
          count.checked_sub(1)
        });
    if result.is_err() {
      log::warn!("unpin called with a pin count of zero");
    }
  }

  pub fn count(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }

  pub fn is_pinned(&self) -> bool {
    self.count() > 0
  }
}

/// Per-handle pin bookkeeping. A handle holds exactly one pin while it has
/// requested one (it is active) and it is referenced. Every transition is
/// idempotent, so a double `clear_pin` or `set_ref(false)` releases at
/// most once.
#[derive(Debug)]
pub struct PinState {
  counter: PinCounter,
  requested: Cell<bool>,
  referenced: Cell<bool>,
  held: Cell<bool>,
}

impl PinState {
  pub fn new(counter: PinCounter) -> Self {
    Self {
      counter,
      requested: Cell::new(false),
      referenced: Cell::new(true),
      held: Cell::new(false),
    }
  }

  pub fn request_pin(&self) {
    self.requested.set(true);
    self.sync();
  }

  pub fn clear_pin(&self) {
    self.requested.set(false);
    self.sync();
  }

  pub fn set_ref(&self, referenced: bool) {
    self.referenced.set(referenced);
    self.sync();
  }

  pub fn has_ref(&self) -> bool {
    self.referenced.get()
  }

  pub fn is_pinned(&self) -> bool {
    self.held.get()
  }

  fn sync(&self) {
    let want = self.requested.get() && self.referenced.get();
    if want == self.held.get() {
      return;
    }
    self.held.set(want);
    if want {
      self.counter.pin();
    } else {
      self.counter.unpin();
    }
  }
}

impl Drop for PinState {
  fn drop(&mut self) {
    if self.held.get() {
      self.counter.unpin();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn count_tracks_pins_minus_unpins() {
    let counter = PinCounter::new();
    let ops = [true, true, false, true, false, false, true, false];
    let mut expected = 0usize;
    for pin in ops {
      if pin {
        counter.pin();
        expected += 1;
      } else {
        counter.unpin();
        expected -= 1;
      }
      assert_eq!(counter.count(), expected);
    }
  }

  #[test]
  fn unpin_at_zero_stays_at_zero() {
    let counter = PinCounter::new();
    counter.unpin();
    counter.unpin();
    assert_eq!(counter.count(), 0);
    counter.pin();
    assert_eq!(counter.count(), 1);
  }

  #[test]
  fn pin_state_holds_one_pin() {
    let counter = PinCounter::new();
    let state = PinState::new(counter.clone());
    state.request_pin();
    state.request_pin();
    assert_eq!(counter.count(), 1);

    state.set_ref(false);
    state.set_ref(false);
    assert_eq!(counter.count(), 0);

    state.set_ref(true);
    assert_eq!(counter.count(), 1);

    state.clear_pin();
    state.clear_pin();
    assert_eq!(counter.count(), 0);
  }

  #[test]
  fn unreferenced_request_does_not_pin() {
    let counter = PinCounter::new();
    let state = PinState::new(counter.clone());
    state.set_ref(false);
    state.request_pin();
    assert_eq!(counter.count(), 0);
    assert!(!state.is_pinned());
  }

  #[test]
  fn drop_releases_held_pin() {
    let counter = PinCounter::new();
    {
      let state = PinState::new(counter.clone());
      state.request_pin();
      assert_eq!(counter.count(), 1);
    }
    assert_eq!(counter.count(), 0);
  }
}
