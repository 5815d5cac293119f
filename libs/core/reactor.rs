// Copyright 2018-2026 the Deno authors. MIT license.

//! Reactor abstraction for the blocking phase of the event loop.
//!
//! The loop thread sleeps inside [`Reactor::poll`] whenever it has no
//! runnable tasks. Socket crates plug in a readiness selector; the default
//! [`ParkReactor`] only parks the thread until it is woken or the next
//! timer is due.

use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Wakes a loop blocked in [`Reactor::poll`]. May be called from any thread.
pub trait LoopWaker: Send + Sync + 'static {
  fn wake(&self);
}

/// The only seam between the event loop and the OS wait primitive.
pub trait Reactor: 'static {
  /// Wait for I/O readiness or a wakeup, dispatching readiness to the
  /// registered handles. `timeout` = None means block indefinitely,
  /// Some(Duration::ZERO) means non-blocking.
  fn poll(&self, timeout: Option<Duration>) -> io::Result<()>;

  fn waker(&self) -> Arc<dyn LoopWaker>;
}

impl<R: Reactor> Reactor for Rc<R> {
  fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
    R::poll(self, timeout)
  }

  fn waker(&self) -> Arc<dyn LoopWaker> {
    R::waker(self)
  }
}

#[derive(Default)]
struct Signal {
  woken: Mutex<bool>,
  cvar: Condvar,
}

impl LoopWaker for Signal {
  fn wake(&self) {
    *self.woken.lock() = true;
    self.cvar.notify_one();
  }
}

/// Reactor without any I/O sources.
#[derive(Default)]
pub struct ParkReactor {
  signal: Arc<Signal>,
}

impl ParkReactor {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Reactor for ParkReactor {
  fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
    let mut woken = self.signal.woken.lock();
    if !*woken {
      match timeout {
        Some(timeout) if timeout.is_zero() => {}
        Some(timeout) => {
          self.signal.cvar.wait_for(&mut woken, timeout);
        }
        None => self.signal.cvar.wait(&mut woken),
      }
    }
    *woken = false;
    Ok(())
  }

  fn waker(&self) -> Arc<dyn LoopWaker> {
    self.signal.clone()
  }
}
