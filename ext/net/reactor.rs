// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;

use mio::Events;
use mio::Interest;
use mio::Poll;
use mio::Registry;
use mio::Token;
use mio::event::Source;
use skiff_core::LoopWaker;
use skiff_core::Reactor;
use slab::Slab;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// Readiness reported for one registered source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Ready {
  pub readable: bool,
  pub writable: bool,
  pub error: bool,
  pub read_closed: bool,
  pub write_closed: bool,
}

impl From<&mio::event::Event> for Ready {
  fn from(event: &mio::event::Event) -> Self {
    Self {
      readable: event.is_readable(),
      writable: event.is_writable(),
      error: event.is_error(),
      read_closed: event.is_read_closed(),
      write_closed: event.is_write_closed(),
    }
  }
}

pub(crate) trait ReadyHandler {
  fn ready(&self, ready: Ready);
}

struct MioWaker(mio::Waker);

impl LoopWaker for MioWaker {
  fn wake(&self) {
    if let Err(err) = self.0.wake() {
      log::warn!("failed to wake the event loop: {err}");
    }
  }
}

/// Readiness selector for socket handles. The event loop blocks in
/// [`Reactor::poll`], which dispatches events to the handles registered
/// here; handles then do their I/O as loop tasks.
pub struct NetReactor {
  poll: RefCell<Poll>,
  events: RefCell<Events>,
  registry: Registry,
  waker: Arc<MioWaker>,
  handlers: RefCell<Slab<Weak<dyn ReadyHandler>>>,
}

impl NetReactor {
  pub fn new() -> io::Result<Self> {
    let poll = Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
    Ok(Self {
      poll: RefCell::new(poll),
      events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
      registry,
      waker: Arc::new(MioWaker(waker)),
      handlers: RefCell::new(Slab::new()),
    })
  }

  /// Number of sources currently registered.
  pub fn registered(&self) -> usize {
    self.handlers.borrow().len()
  }

  pub(crate) fn register(
    &self,
    source: &mut impl Source,
    interest: Interest,
    handler: Weak<dyn ReadyHandler>,
  ) -> io::Result<Token> {
    let token = Token(self.handlers.borrow_mut().insert(handler));
    if let Err(err) = self.registry.register(source, token, interest) {
      self.handlers.borrow_mut().remove(token.0);
      return Err(err);
    }
    Ok(token)
  }

  pub(crate) fn deregister(&self, token: Token, source: &mut impl Source) {
    if self.handlers.borrow_mut().try_remove(token.0).is_none() {
      return;
    }
    if let Err(err) = self.registry.deregister(source) {
      log::debug!("deregister: {err}");
    }
  }
}

impl Reactor for NetReactor {
  fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
    let ready: Vec<(Rc<dyn ReadyHandler>, Ready)> = {
      let mut poll = self.poll.borrow_mut();
      let mut events = self.events.borrow_mut();
      match poll.poll(&mut events, timeout) {
        Err(ref err) if is_interrupted(err) => return Ok(()),
        Err(err) => return Err(err),
        Ok(()) => {}
      }
      let handlers = self.handlers.borrow();
      events
        .iter()
        .filter(|event| event.token() != WAKE_TOKEN)
        .filter_map(|event| {
          let handler = handlers.get(event.token().0)?.upgrade()?;
          Some((handler, Ready::from(event)))
        })
        .collect()
    };
    // handlers may register new sources, so no borrow is held here
    for (handler, ready) in ready {
      handler.ready(ready);
    }
    Ok(())
  }

  fn waker(&self) -> Arc<dyn LoopWaker> {
    self.waker.clone()
  }
}

pub(crate) fn is_interrupted(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::Interrupted
}

pub(crate) fn is_wouldblock(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::thread;

  use super::*;

  struct Flag(Cell<Option<Ready>>);

  impl ReadyHandler for Flag {
    fn ready(&self, ready: Ready) {
      self.0.set(Some(ready));
    }
  }

  #[test]
  fn waker_interrupts_poll() {
    let reactor = NetReactor::new().unwrap();
    let waker = reactor.waker();
    let t = thread::spawn(move || waker.wake());
    reactor.poll(Some(Duration::from_secs(10))).unwrap();
    t.join().unwrap();
  }

  #[test]
  fn dispatches_readiness() {
    let reactor = NetReactor::new().unwrap();
    let mut listener =
      mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let flag = Rc::new(Flag(Cell::new(None)));
    let handler: Weak<dyn ReadyHandler> = Rc::<Flag>::downgrade(&flag);
    let token = reactor
      .register(&mut listener, Interest::READABLE, handler)
      .unwrap();
    assert_eq!(reactor.registered(), 1);

    let _client = std::net::TcpStream::connect(addr).unwrap();
    while flag.0.get().is_none() {
      reactor.poll(Some(Duration::from_secs(10))).unwrap();
    }
    assert!(flag.0.get().unwrap().readable);

    reactor.deregister(token, &mut listener);
    assert_eq!(reactor.registered(), 0);
  }
}
