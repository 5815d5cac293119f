// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;
use std::time::Duration;
use std::time::Instant;

use crate::error::OsError;
use crate::error::OsResult;
use crate::event_loop::LoopHandle;
use crate::handle::Closable;
use crate::handle::HandleKey;
use crate::handle::HandleKind;
use crate::handle::Refable;
use crate::pin::PinState;

/// Source of loop time, measured from an arbitrary origin.
pub trait Clock {
  fn now(&self) -> Duration;
}

pub struct MonotonicClock {
  origin: Instant,
}

impl MonotonicClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
    }
  }
}

impl Default for MonotonicClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for MonotonicClock {
  fn now(&self) -> Duration {
    self.origin.elapsed()
  }
}

/// A clock that only moves when told to.
#[derive(Clone, Default)]
pub struct VirtualClock {
  now: Rc<Cell<Duration>>,
}

impl VirtualClock {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn advance(&self, by: Duration) {
    self.now.set(self.now.get() + by);
  }
}

impl Clock for VirtualClock {
  fn now(&self) -> Duration {
    self.now.get()
  }
}

/// Ordered by (deadline, id) so iteration yields the earliest timer first
/// and timers with equal deadlines fire in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
  deadline: Duration,
  id: u64,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
  keys: RefCell<BTreeSet<TimerKey>>,
  // Armed timers are owned here so they keep running without an outside
  // reference, like a script timer nobody holds on to.
  armed: RefCell<HashMap<u64, Rc<TimerInner>>>,
  next_id: Cell<u64>,
}

impl TimerQueue {
  fn alloc_id(&self) -> u64 {
    let id = self.next_id.get() + 1;
    self.next_id.set(id);
    id
  }

  fn insert(&self, key: TimerKey, timer: Rc<TimerInner>) {
    self.keys.borrow_mut().insert(key);
    self.armed.borrow_mut().insert(key.id, timer);
  }

  fn remove(&self, key: TimerKey) {
    self.keys.borrow_mut().remove(&key);
    self.armed.borrow_mut().remove(&key.id);
  }

  /// Time until the earliest deadline, or None without armed timers.
  pub fn next_delay(&self, now: Duration) -> Option<Duration> {
    self
      .keys
      .borrow()
      .first()
      .map(|key| key.deadline.saturating_sub(now))
  }

  /// Enqueue a fire task for every timer whose deadline has passed.
  pub fn run_expired(&self, loop_handle: &LoopHandle) {
    let now = loop_handle.now();
    loop {
      let key = {
        let keys = self.keys.borrow();
        match keys.first() {
          Some(key) if key.deadline <= now => *key,
          _ => break,
        }
      };
      self.keys.borrow_mut().remove(&key);
      let Some(timer) = self.armed.borrow_mut().remove(&key.id) else {
        continue;
      };
      let Some(arming) = timer.arming.borrow().clone() else {
        continue;
      };
      if arming.key != key || arming.cancelled.get() {
        continue;
      }
      loop_handle.enqueue("timer", move || timer.fire(&arming));
    }
  }
}

#[derive(Clone)]
struct Arming {
  key: TimerKey,
  repeat: Option<Duration>,
  cancelled: Rc<Cell<bool>>,
}

struct TimerInner {
  id: u64,
  loop_handle: LoopHandle,
  pin: PinState,
  callback: RefCell<Box<dyn FnMut()>>,
  arming: RefCell<Option<Arming>>,
  closed: Cell<bool>,
  registration: Cell<Option<HandleKey>>,
}

impl TimerInner {
  fn arm(self: &Rc<Self>, delay: Duration, repeat: Option<Duration>) {
    let key = TimerKey {
      deadline: self.loop_handle.now() + delay,
      id: self.id,
    };
    self.arming.replace(Some(Arming {
      key,
      repeat,
      cancelled: Rc::new(Cell::new(false)),
    }));
    self.loop_handle.state().timers.insert(key, self.clone());
    self.pin.request_pin();
  }

  fn disarm(&self) {
    if let Some(arming) = self.arming.take() {
      arming.cancelled.set(true);
      self.loop_handle.state().timers.remove(arming.key);
    }
    self.pin.clear_pin();
  }

  fn fire(self: &Rc<Self>, arming: &Arming) {
    // stop() or a restart after the deadline passed
    if arming.cancelled.get() {
      return;
    }
    if arming.repeat.is_none() {
      self.arming.replace(None);
      self.pin.clear_pin();
    }

    (self.callback.borrow_mut())();

    if let Some(interval) = arming.repeat {
      let still_current =
        self.arming.borrow().as_ref().is_some_and(|current| {
          Rc::ptr_eq(&current.cancelled, &arming.cancelled)
        });
      if still_current && !arming.cancelled.get() {
        // fixed delay: measured from the end of this callback
        self.arm(interval, Some(interval));
      }
    }
  }
}

impl Closable for TimerInner {
  fn close(&self) {
    if self.closed.replace(true) {
      return;
    }
    self.disarm();
    if let Some(key) = self.registration.take() {
      self.loop_handle.unregister_handle(key);
    }
  }

  fn is_closed(&self) -> bool {
    self.closed.get()
  }
}

impl Drop for TimerInner {
  fn drop(&mut self) {
    if let Some(key) = self.registration.take() {
      self.loop_handle.unregister_handle(key);
    }
  }
}

/// A one-shot or repeating timer. While armed and referenced it holds one
/// pin on the loop.
#[derive(Clone)]
pub struct TimerHandle {
  inner: Rc<TimerInner>,
}

impl TimerHandle {
  pub fn new(
    loop_handle: &LoopHandle,
    callback: impl FnMut() + 'static,
  ) -> Self {
    let inner = Rc::new(TimerInner {
      id: loop_handle.state().timers.alloc_id(),
      loop_handle: loop_handle.clone(),
      pin: PinState::new(loop_handle.pins().clone()),
      callback: RefCell::new(Box::new(callback)),
      arming: RefCell::new(None),
      closed: Cell::new(false),
      registration: Cell::new(None),
    });
    let weak: Weak<dyn Closable> = Rc::<TimerInner>::downgrade(&inner);
    inner
      .registration
      .set(Some(loop_handle.register_handle(HandleKind::Timer, weak)));
    Self { inner }
  }

  /// Arm the timer to fire after `delay`, then every `repeat` measured from
  /// the end of the previous callback. Restarting an armed timer replaces
  /// its deadline.
  pub fn start(
    &self,
    delay: Duration,
    repeat: Option<Duration>,
  ) -> OsResult<()> {
    if self.inner.closed.get() {
      return Err(
        OsError::invalid_argument("timer is closed").syscall("timer_start"),
      );
    }
    self.inner.disarm();
    let repeat = repeat.filter(|interval| !interval.is_zero());
    self.inner.arm(delay, repeat);
    Ok(())
  }

  /// Cancel the timer. A fire already queued will not run the callback.
  pub fn stop(&self) {
    self.inner.disarm();
  }

  pub fn is_active(&self) -> bool {
    self.inner.arming.borrow().is_some()
  }

  /// Remaining time before the next fire, if armed.
  pub fn due_in(&self) -> Option<Duration> {
    let now = self.inner.loop_handle.now();
    self
      .inner
      .arming
      .borrow()
      .as_ref()
      .map(|arming| arming.key.deadline.saturating_sub(now))
  }
}

impl Closable for TimerHandle {
  fn close(&self) {
    self.inner.close();
  }

  fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

impl Refable for TimerHandle {
  fn set_ref(&self, referenced: bool) {
    self.inner.pin.set_ref(referenced);
  }

  fn has_ref(&self) -> bool {
    self.inner.pin.has_ref()
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::rc::Rc;

  use pretty_assertions::assert_eq;

  use super::*;
  use crate::event_loop::EventLoop;
  use crate::event_loop::LoopOptions;
  use crate::event_loop::RunMode;

  fn virtual_loop() -> (EventLoop, VirtualClock) {
    let clock = VirtualClock::new();
    let event_loop = EventLoop::new(LoopOptions {
      clock: Some(Rc::new(clock.clone())),
      ..Default::default()
    })
    .unwrap();
    (event_loop, clock)
  }

  fn counting_timer(
    event_loop: &EventLoop,
  ) -> (TimerHandle, Rc<Cell<usize>>) {
    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    let timer = TimerHandle::new(event_loop.handle(), move || {
      counter.set(counter.get() + 1)
    });
    (timer, fired)
  }

  #[test]
  fn one_shot_fires_once_and_restores_pins() {
    let (event_loop, clock) = virtual_loop();
    let before = event_loop.pins().count();
    let (timer, fired) = counting_timer(&event_loop);
    timer.start(Duration::from_millis(50), None).unwrap();
    assert_eq!(event_loop.pins().count(), before + 1);

    clock.advance(Duration::from_millis(49));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 0);

    clock.advance(Duration::from_millis(1));
    let alive = event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
    assert_eq!(event_loop.pins().count(), before);
    assert!(!alive);
    assert!(!timer.is_active());

    clock.advance(Duration::from_secs(1));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
  }

  #[test]
  fn repeating_timer_rearms_from_completion() {
    let (event_loop, clock) = virtual_loop();
    let fired = Rc::new(Cell::new(0));
    let timer = {
      let fired = fired.clone();
      let clock = clock.clone();
      TimerHandle::new(event_loop.handle(), move || {
        fired.set(fired.get() + 1);
        // a slow callback
        clock.advance(Duration::from_millis(30));
      })
    };
    timer
      .start(Duration::from_millis(10), Some(Duration::from_millis(100)))
      .unwrap();

    clock.advance(Duration::from_millis(10));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
    // next fire is 100ms after the callback finished at t=40
    assert_eq!(timer.due_in(), Some(Duration::from_millis(100)));

    clock.advance(Duration::from_millis(99));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
    clock.advance(Duration::from_millis(1));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 2);

    timer.stop();
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn stop_after_fire_is_queued_suppresses_callback() {
    let (event_loop, clock) = virtual_loop();
    let (timer, fired) = counting_timer(&event_loop);
    timer.start(Duration::from_millis(5), None).unwrap();
    {
      let timer = timer.clone();
      let handle = event_loop.handle().clone();
      // runs before the timer's fire task once both are queued
      handle.enqueue("stopper", move || timer.stop());
    }
    clock.advance(Duration::from_millis(5));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 0);
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn restart_replaces_deadline() {
    let (event_loop, clock) = virtual_loop();
    let (timer, fired) = counting_timer(&event_loop);
    timer.start(Duration::from_millis(10), None).unwrap();
    timer.start(Duration::from_millis(20), None).unwrap();
    assert_eq!(event_loop.pins().count(), 1);

    clock.advance(Duration::from_millis(10));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 0);
    clock.advance(Duration::from_millis(10));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
  }

  #[test]
  fn unref_timer_does_not_keep_loop_alive() {
    let (event_loop, _clock) = virtual_loop();
    let (timer, fired) = counting_timer(&event_loop);
    timer.start(Duration::from_millis(10), None).unwrap();
    timer.set_ref(false);
    timer.set_ref(false);
    assert_eq!(event_loop.pins().count(), 0);
    event_loop.run().unwrap();
    assert_eq!(fired.get(), 0);
    timer.set_ref(true);
    assert_eq!(event_loop.pins().count(), 1);
    timer.close();
    timer.close();
    assert_eq!(event_loop.pins().count(), 0);
    assert!(timer.start(Duration::ZERO, None).is_err());
  }

  #[test]
  fn equal_deadlines_fire_in_creation_order() {
    let (event_loop, clock) = virtual_loop();
    let order = Rc::new(RefCell::new(Vec::new()));
    let timers: Vec<_> = (0..3)
      .map(|i| {
        let order = order.clone();
        let timer = TimerHandle::new(event_loop.handle(), move || {
          order.borrow_mut().push(i)
        });
        timer.start(Duration::from_millis(1), None).unwrap();
        timer
      })
      .collect();
    clock.advance(Duration::from_millis(1));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
    drop(timers);
  }

  #[test]
  fn real_clock_timer_ends_run() {
    let event_loop = EventLoop::new(LoopOptions::default()).unwrap();
    let (timer, fired) = counting_timer(&event_loop);
    timer.start(Duration::from_millis(10), None).unwrap();
    event_loop.run().unwrap();
    assert_eq!(fired.get(), 1);
  }

  #[test]
  fn shutdown_closes_armed_timer() {
    let (event_loop, _clock) = virtual_loop();
    let (timer, _fired) = counting_timer(&event_loop);
    timer.start(Duration::from_secs(60), None).unwrap();
    assert_eq!(event_loop.shutdown(), 1);
    assert!(timer.is_closed());
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn dropped_timers_leave_the_registry() {
    let (event_loop, clock) = virtual_loop();
    for _ in 0..1000 {
      let (timer, _) = counting_timer(&event_loop);
      timer.start(Duration::from_millis(1), None).unwrap();
    }
    assert_eq!(event_loop.handle().live_handles(), 1000);
    clock.advance(Duration::from_millis(1));
    event_loop.run_once(RunMode::NoWait).unwrap();
    assert_eq!(event_loop.handle().live_handles(), 0);

    for _ in 0..1000 {
      drop(counting_timer(&event_loop));
    }
    assert_eq!(event_loop.handle().live_handles(), 0);
  }
}
