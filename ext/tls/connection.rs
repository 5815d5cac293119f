// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Bytes;
use skiff_core::Closable;
use skiff_core::ErrorCode;
use skiff_core::HandleKey;
use skiff_core::HandleKind;
use skiff_core::LoopHandle;
use skiff_core::OsError;
use skiff_core::OsResult;
use skiff_core::ReadCallback;
use skiff_core::ReadEvent;
use skiff_core::Readable;
use skiff_core::Refable;
use skiff_core::Writable;
use skiff_core::WriteCallback;
use skiff_net::TcpHandle;

use crate::engine::EngineResult;
use crate::engine::EngineStatus;
use crate::engine::TlsEngine;

pub type HandshakeCallback = Box<dyn FnOnce(OsResult<()>) + 'static>;

enum PendingOp {
  Write(Bytes, WriteCallback),
  Shutdown(WriteCallback),
}

#[derive(Default)]
struct ConnState {
  on_handshake: Option<HandshakeCallback>,
  on_read: Option<ReadCallback>,
  reading: bool,
  unread: VecDeque<ReadEvent>,
  /// Writes issued before the handshake completed.
  pending: VecDeque<PendingOp>,
  established: bool,
  task_running: bool,
  read_ended: bool,
  write_ended: bool,
  closed: bool,
}

struct ConnInner {
  engine: TlsEngine,
  tcp: TcpHandle,
  loop_handle: LoopHandle,
  this: Weak<ConnInner>,
  registration: Cell<Option<HandleKey>>,
  state: RefCell<ConnState>,
}

/// TLS over a connected [`TcpHandle`]. Ciphertext moves between the socket
/// and the engine; readers see plaintext, EOF or one terminal error.
///
/// Once the handshake starts, the connection stays alive for as long as
/// its socket is open.
#[derive(Clone)]
pub struct TlsConnection {
  inner: Rc<ConnInner>,
}

impl fmt::Debug for TlsConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TlsConnection")
      .field("engine", &self.inner.engine)
      .field("established", &self.is_established())
      .finish()
  }
}

fn engine_error(result: &EngineResult) -> OsError {
  let message = result
    .error
    .clone()
    .unwrap_or_else(|| "tls engine failed".to_string());
  OsError::with_message(ErrorCode::Io, message)
}

fn ignore_completion() -> WriteCallback {
  Box::new(|result| {
    if let Err(err) = result {
      log::debug!("tls record write failed: {err}");
    }
  })
}

impl TlsConnection {
  pub fn new(tcp: TcpHandle, engine: TlsEngine) -> Self {
    let loop_handle = engine.loop_handle().clone();
    let inner = Rc::new_cyclic(|this| ConnInner {
      engine,
      tcp,
      loop_handle: loop_handle.clone(),
      this: this.clone(),
      registration: Cell::new(None),
      state: RefCell::new(ConnState::default()),
    });
    let weak: Weak<dyn Closable> = Rc::<ConnInner>::downgrade(&inner);
    inner.registration.set(Some(
      loop_handle.register_handle(HandleKind::TlsEngine, weak),
    ));
    Self { inner }
  }

  pub fn engine(&self) -> &TlsEngine {
    &self.inner.engine
  }

  pub fn tcp(&self) -> &TcpHandle {
    &self.inner.tcp
  }

  pub fn is_established(&self) -> bool {
    self.inner.state.borrow().established
  }

  /// Start reading from the socket and drive the handshake.
  /// `on_handshake` fires once, with the root cause if the handshake fails.
  pub fn handshake(
    &self,
    on_handshake: impl FnOnce(OsResult<()>) + 'static,
  ) -> OsResult<()> {
    if self.inner.state.borrow().closed {
      return Err(OsError::new(ErrorCode::BadDescriptor).syscall("handshake"));
    }
    self.inner.engine.begin_handshake()?;
    self.inner.state.borrow_mut().on_handshake = Some(Box::new(on_handshake));
    let inner = self.inner.clone();
    self
      .inner
      .tcp
      .read_start(Box::new(move |event| inner.on_transport(event)))?;
    self.inner.drive(None);
    Ok(())
  }
}

impl ConnInner {
  fn on_transport(&self, event: ReadEvent) {
    match event {
      ReadEvent::Data(data) => self.drive(Some(data)),
      ReadEvent::Eof if self.state.borrow().established => {
        self.end(ReadEvent::Eof);
      }
      ReadEvent::Eof => self.fail(OsError::with_message(
        ErrorCode::Io,
        "socket closed before the TLS handshake completed",
      )),
      ReadEvent::Error(err) => self.fail(err),
    }
  }

  /// Step the engine until it stops making progress.
  fn drive(&self, mut input: Option<Bytes>) {
    {
      let state = self.state.borrow();
      if state.closed {
        return;
      }
      if state.task_running {
        drop(state);
        // buffered until the task finishes
        if let Some(input) = input {
          self.engine.unwrap(Some(&input));
        }
        return;
      }
    }
    loop {
      let unwrapped = self.engine.unwrap(input.take().as_deref());
      let progressed = unwrapped.consumed > 0 || unwrapped.data.is_some();
      if !self.apply_unwrap(unwrapped) {
        return;
      }
      let wrapped = self.engine.wrap(None);
      let produced = wrapped.data.is_some();
      if !self.apply_wrap(wrapped) {
        return;
      }
      if !progressed && !produced {
        return;
      }
    }
  }

  /// Returns false when driving must stop.
  fn apply_unwrap(&self, result: EngineResult) -> bool {
    if result.just_handshaked {
      self.established();
    }
    if let Some(data) = result.data.clone() {
      self.deliver(ReadEvent::Data(data));
    }
    match result.status {
      EngineStatus::Error => {
        self.fail(engine_error(&result));
        false
      }
      EngineStatus::NeedTask => {
        self.run_task();
        false
      }
      EngineStatus::Closed => {
        self.end(ReadEvent::Eof);
        !self.state.borrow().closed
      }
      _ => !self.state.borrow().closed,
    }
  }

  fn apply_wrap(&self, result: EngineResult) -> bool {
    if let Some(data) = result.data.clone() {
      self.send(data, ignore_completion());
    }
    if result.just_handshaked {
      self.established();
    }
    if result.status == EngineStatus::Error {
      self.fail(engine_error(&result));
      return false;
    }
    !self.state.borrow().closed
  }

  fn run_task(&self) {
    self.state.borrow_mut().task_running = true;
    let this = self.this.clone();
    self.engine.run_task(move || {
      let Some(this) = this.upgrade() else {
        return;
      };
      this.state.borrow_mut().task_running = false;
      this.drive(None);
    });
  }

  fn established(&self) {
    let (on_handshake, pending) = {
      let mut state = self.state.borrow_mut();
      if state.established {
        return;
      }
      state.established = true;
      (state.on_handshake.take(), mem::take(&mut state.pending))
    };
    log::debug!(
      "tls handshake completed: {} {}",
      self.engine.protocol().unwrap_or("unknown"),
      self.engine.cipher_suite().unwrap_or_default()
    );
    if let Some(on_handshake) = on_handshake {
      on_handshake(Ok(()));
    }
    for op in pending {
      match op {
        PendingOp::Write(data, on_complete) => {
          self.write_now(data, on_complete)
        }
        PendingOp::Shutdown(on_complete) => self.shutdown_now(on_complete),
      }
    }
  }

  /// Hand ciphertext to the socket. Errors always reach `on_complete`.
  fn send(&self, data: Bytes, on_complete: WriteCallback) {
    self.guarded(on_complete, |callback| self.tcp.write(data, callback));
  }

  fn guarded(
    &self,
    on_complete: WriteCallback,
    submit: impl FnOnce(WriteCallback) -> OsResult<()>,
  ) {
    let slot = Rc::new(Cell::new(Some(on_complete)));
    let callback: WriteCallback = {
      let slot = slot.clone();
      Box::new(move |result| {
        if let Some(on_complete) = slot.take() {
          on_complete(result);
        }
      })
    };
    if let Err(err) = submit(callback) {
      if let Some(on_complete) = slot.take() {
        self
          .loop_handle
          .enqueue("tls.write", move || on_complete(Err(err)));
      }
    }
  }

  fn write_now(&self, data: Bytes, on_complete: WriteCallback) {
    let result = self.engine.wrap(Some(&data));
    if result.status == EngineStatus::Error {
      let err = engine_error(&result);
      self.fail(err.clone());
      self
        .loop_handle
        .enqueue("tls.write", move || on_complete(Err(err)));
      return;
    }
    match result.data {
      Some(ciphertext) => self.send(ciphertext, on_complete),
      None => self
        .loop_handle
        .enqueue("tls.write", move || on_complete(Ok(()))),
    }
  }

  fn shutdown_now(&self, on_complete: WriteCallback) {
    self.engine.close_outbound();
    let result = self.engine.wrap(None);
    if let Some(data) = result.data {
      self.send(data, ignore_completion());
    }
    self.guarded(on_complete, |callback| self.tcp.shutdown(callback));
  }

  /// Report a terminal error to whoever is waiting: the handshake callback
  /// if the handshake is in flight, otherwise the reader.
  fn fail(&self, err: OsError) {
    // the engine may have queued an alert
    let alert = self.engine.wrap(None);
    if let Some(data) = alert.data {
      self.send(data, ignore_completion());
    }
    let (on_handshake, pending) = {
      let mut state = self.state.borrow_mut();
      (state.on_handshake.take(), mem::take(&mut state.pending))
    };
    for op in pending {
      let on_complete = match op {
        PendingOp::Write(_, on_complete) => on_complete,
        PendingOp::Shutdown(on_complete) => on_complete,
      };
      let err = err.clone();
      self
        .loop_handle
        .enqueue("tls.write", move || on_complete(Err(err)));
    }
    match on_handshake {
      Some(on_handshake) => {
        self.state.borrow_mut().read_ended = true;
        on_handshake(Err(err));
      }
      None => self.end(ReadEvent::Error(err)),
    }
  }

  /// Deliver the final read event once.
  fn end(&self, event: ReadEvent) {
    {
      let mut state = self.state.borrow_mut();
      if state.read_ended {
        return;
      }
      state.read_ended = true;
    }
    self.deliver(event);
  }

  fn deliver(&self, event: ReadEvent) {
    let on_read = {
      let mut state = self.state.borrow_mut();
      if state.closed {
        return;
      }
      let on_read = if state.reading && state.unread.is_empty() {
        state.on_read.take()
      } else {
        None
      };
      match on_read {
        Some(on_read) => on_read,
        None => {
          state.unread.push_back(event);
          return;
        }
      }
    };
    let mut on_read = on_read;
    on_read(event);
    let backlog = {
      let mut state = self.state.borrow_mut();
      if state.reading && state.on_read.is_none() && !state.closed {
        state.on_read = Some(on_read);
      }
      !state.unread.is_empty()
    };
    if backlog {
      self.flush_unread();
    }
  }

  fn flush_unread(&self) {
    loop {
      let event = {
        let mut state = self.state.borrow_mut();
        if !state.reading || state.closed || state.on_read.is_none() {
          return;
        }
        match state.unread.pop_front() {
          Some(event) => event,
          None => return,
        }
      };
      let Some(mut on_read) = self.state.borrow_mut().on_read.take() else {
        return;
      };
      on_read(event);
      let mut state = self.state.borrow_mut();
      if state.reading && state.on_read.is_none() && !state.closed {
        state.on_read = Some(on_read);
      }
    }
  }
}

impl Drop for ConnInner {
  fn drop(&mut self) {
    if let Some(key) = self.registration.take() {
      self.loop_handle.unregister_handle(key);
    }
  }
}

impl Closable for ConnInner {
  fn close(&self) {
    let dropped = {
      let mut state = self.state.borrow_mut();
      if state.closed {
        return;
      }
      state.closed = true;
      state.reading = false;
      (
        state.on_read.take(),
        state.on_handshake.take(),
        mem::take(&mut state.pending),
        mem::take(&mut state.unread),
      )
    };
    self.engine.close_outbound();
    self.tcp.close();
    if let Some(key) = self.registration.take() {
      self.loop_handle.unregister_handle(key);
    }
    log::debug!("closed tls connection");
    drop(dropped);
  }

  fn is_closed(&self) -> bool {
    self.state.borrow().closed
  }
}

impl Closable for TlsConnection {
  fn close(&self) {
    self.inner.close();
  }

  fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

impl Refable for TlsConnection {
  fn set_ref(&self, referenced: bool) {
    self.inner.tcp.set_ref(referenced);
  }

  fn has_ref(&self) -> bool {
    self.inner.tcp.has_ref()
  }
}

impl Readable for TlsConnection {
  fn read_start(&self, on_read: ReadCallback) -> OsResult<()> {
    let buffered = {
      let mut state = self.inner.state.borrow_mut();
      if state.closed {
        return Err(OsError::new(ErrorCode::BadDescriptor).syscall("read"));
      }
      state.on_read = Some(on_read);
      state.reading = true;
      !state.unread.is_empty()
    };
    if buffered {
      let this = self.inner.this.clone();
      self.inner.loop_handle.enqueue("tls.read", move || {
        if let Some(this) = this.upgrade() {
          this.flush_unread();
        }
      });
    }
    Ok(())
  }

  fn read_stop(&self) -> OsResult<()> {
    let on_read = {
      let mut state = self.inner.state.borrow_mut();
      if state.closed {
        return Err(OsError::new(ErrorCode::BadDescriptor).syscall("read"));
      }
      state.reading = false;
      state.on_read.take()
    };
    drop(on_read);
    Ok(())
  }
}

impl Writable for TlsConnection {
  /// Writes issued during the handshake are sent once it completes.
  fn write(&self, data: Bytes, on_complete: WriteCallback) -> OsResult<()> {
    {
      let mut state = self.inner.state.borrow_mut();
      if state.closed {
        return Err(OsError::new(ErrorCode::BadDescriptor).syscall("write"));
      }
      if state.write_ended {
        return Err(
          OsError::with_message(ErrorCode::Io, "write after end")
            .syscall("write"),
        );
      }
      if !state.established {
        state.pending.push_back(PendingOp::Write(data, on_complete));
        return Ok(());
      }
    }
    self.inner.write_now(data, on_complete);
    Ok(())
  }

  /// Send close_notify after queued writes, then half-close the socket.
  fn shutdown(&self, on_complete: WriteCallback) -> OsResult<()> {
    {
      let mut state = self.inner.state.borrow_mut();
      if state.closed {
        return Err(
          OsError::new(ErrorCode::BadDescriptor).syscall("shutdown"),
        );
      }
      if state.write_ended {
        return Err(
          OsError::with_message(ErrorCode::Io, "write after end")
            .syscall("shutdown"),
        );
      }
      state.write_ended = true;
      if !state.established {
        state.pending.push_back(PendingOp::Shutdown(on_complete));
        return Ok(());
      }
    }
    self.inner.shutdown_now(on_complete);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use skiff_core::EventLoop;
  use skiff_core::LoopOptions;
  use skiff_net::Net;
  use skiff_net::NetReactor;

  use super::*;
  use crate::EngineMode;
  use crate::TlsContext;
  use crate::TlsOptions;
  use crate::engine::tests::contexts;
  use crate::engine::tests::test_pki;

  fn setup() -> (EventLoop<Rc<NetReactor>>, Net) {
    let reactor = Rc::new(NetReactor::new().unwrap());
    let event_loop =
      EventLoop::with_reactor(reactor.clone(), LoopOptions::default())
        .unwrap();
    let net = Net::new(reactor, event_loop.handle());
    (event_loop, net)
  }

  #[test]
  fn round_trip_over_tcp() {
    let (event_loop, net) = setup();
    let pki = test_pki();
    let (server_context, client_context) = contexts(&pki);
    let payload: Bytes = (0..200_000u32)
      .map(|i| (i % 253) as u8)
      .collect::<Vec<_>>()
      .into();
    let received = Rc::new(RefCell::new(Vec::new()));
    let events = Rc::new(RefCell::new(Vec::new()));

    let listener = net.tcp();
    listener.bind("127.0.0.1", 0).unwrap();
    {
      let received = received.clone();
      let events = events.clone();
      let listener2 = listener.clone();
      let loop_handle = event_loop.handle().clone();
      listener
        .listen(16, move |conn| {
          let engine = server_context
            .create_engine(&loop_handle, EngineMode::Server)
            .unwrap();
          let tls = TlsConnection::new(conn.unwrap(), engine);
          {
            let events = events.clone();
            tls
              .handshake(move |result| {
                result.unwrap();
                events.borrow_mut().push("server handshake");
              })
              .unwrap();
          }
          let received = received.clone();
          let events = events.clone();
          let tls2 = tls.clone();
          let listener3 = listener2.clone();
          tls
            .read_start(Box::new(move |event| match event {
              ReadEvent::Data(data) => {
                received.borrow_mut().extend_from_slice(&data)
              }
              ReadEvent::Eof => {
                events.borrow_mut().push("server eof");
                tls2.close();
                listener3.close();
              }
              ReadEvent::Error(err) => panic!("server read failed: {err}"),
            }))
            .unwrap();
        })
        .unwrap();
    }
    let port = listener.sockname().unwrap().port();

    let client = net.tcp();
    {
      let client2 = client.clone();
      let events = events.clone();
      let payload = payload.clone();
      let loop_handle = event_loop.handle().clone();
      client
        .connect("127.0.0.1", port, move |result| {
          result.unwrap();
          let engine = client_context
            .create_engine(&loop_handle, EngineMode::Client {
              server_name: "localhost",
            })
            .unwrap();
          let tls = TlsConnection::new(client2, engine);
          {
            let events = events.clone();
            tls
              .handshake(move |result| {
                result.unwrap();
                events.borrow_mut().push("client handshake");
              })
              .unwrap();
          }
          {
            let events = events.clone();
            tls
              .write(
                payload,
                Box::new(move |result| {
                  result.unwrap();
                  events.borrow_mut().push("client write");
                }),
              )
              .unwrap();
          }
          let tls2 = tls.clone();
          tls
            .shutdown(Box::new(move |result| {
              result.unwrap();
              events.borrow_mut().push("client shutdown");
              tls2.close();
            }))
            .unwrap();
          assert!(!tls.is_established());
        })
        .unwrap();
    }

    event_loop.run().unwrap();
    assert_eq!(received.borrow().len(), payload.len());
    assert!(received.borrow()[..] == payload[..]);
    let events = events.borrow();
    for expected in [
      "client handshake",
      "server handshake",
      "client write",
      "client shutdown",
      "server eof",
    ] {
      assert!(events.contains(&expected), "{expected} missing: {events:?}");
    }
    assert_eq!(event_loop.pins().count(), 0);
    assert_eq!(event_loop.handle().live_handles(), 0);
  }

  #[test]
  fn handshake_failure_reaches_both_sides() {
    let (event_loop, net) = setup();
    let pki = test_pki();
    let (server_context, _) = contexts(&pki);
    let client_context = TlsContext::client(&TlsOptions::default()).unwrap();
    let failures = Rc::new(RefCell::new(Vec::new()));

    let listener = net.tcp();
    listener.bind("127.0.0.1", 0).unwrap();
    {
      let failures = failures.clone();
      let listener2 = listener.clone();
      let loop_handle = event_loop.handle().clone();
      listener
        .listen(16, move |conn| {
          let engine = server_context
            .create_engine(&loop_handle, EngineMode::Server)
            .unwrap();
          let tls = TlsConnection::new(conn.unwrap(), engine);
          let tls2 = tls.clone();
          let failures = failures.clone();
          let listener3 = listener2.clone();
          tls
            .handshake(move |result| {
              failures.borrow_mut().push(("server", result.unwrap_err()));
              tls2.close();
              listener3.close();
            })
            .unwrap();
        })
        .unwrap();
    }
    let port = listener.sockname().unwrap().port();

    let client = net.tcp();
    {
      let client2 = client.clone();
      let failures = failures.clone();
      let loop_handle = event_loop.handle().clone();
      client
        .connect("127.0.0.1", port, move |result| {
          result.unwrap();
          let engine = client_context
            .create_engine(&loop_handle, EngineMode::Client {
              server_name: "localhost",
            })
            .unwrap();
          let tls = TlsConnection::new(client2, engine);
          let tls2 = tls.clone();
          tls
            .handshake(move |result| {
              failures.borrow_mut().push(("client", result.unwrap_err()));
              tls2.close();
            })
            .unwrap();
        })
        .unwrap();
    }

    event_loop.run().unwrap();
    let failures = failures.borrow();
    assert_eq!(failures.len(), 2);
    let (_, client_err) =
      failures.iter().find(|(side, _)| *side == "client").unwrap();
    assert!(
      client_err.message().contains("invalid peer certificate"),
      "{client_err}"
    );
    assert_eq!(client_err.code(), ErrorCode::Io);
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn writes_after_close_fail() {
    let (event_loop, net) = setup();
    let pki = test_pki();
    let (_, client_context) = contexts(&pki);
    let engine = client_context
      .create_engine(event_loop.handle(), EngineMode::Client {
        server_name: "localhost",
      })
      .unwrap();
    let tls = TlsConnection::new(net.tcp(), engine);
    tls.close();
    tls.close();
    assert!(tls.is_closed());
    let err = tls
      .write(Bytes::from_static(b"x"), Box::new(|_| {}))
      .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadDescriptor);
    assert!(tls.handshake(|_| {}).is_err());
    event_loop.run().unwrap();
  }
}
