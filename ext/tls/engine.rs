// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use parking_lot::Mutex;
use rustls::Connection;
use rustls::HandshakeKind;
use rustls::ProtocolVersion;
use skiff_core::LoopHandle;

use crate::TlsError;
use crate::cert::PeerCertificate;

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of one `wrap` or `unwrap` step. The numeric values are part of
/// the guest-visible interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EngineStatus {
  Ok = 0,
  NeedWrap = 1,
  NeedUnwrap = 2,
  NeedTask = 3,
  Underflow = 4,
  /// Output buffers grow on demand, so no step reports this.
  Overflow = 5,
  Closed = 6,
  Error = 7,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResult {
  pub status: EngineStatus,
  /// Bytes produced by the step: ciphertext for `wrap`, plaintext for
  /// `unwrap`.
  pub data: Option<Bytes>,
  /// Input bytes taken from the engine's buffer in this step.
  pub consumed: usize,
  /// Input bytes still buffered in the engine.
  pub remaining: usize,
  /// Set on the first result after the handshake completes.
  pub just_handshaked: bool,
  pub error: Option<String>,
}

#[derive(Clone, Copy)]
enum Step {
  Wrap,
  Unwrap,
}

struct EngineState {
  /// Owned by the worker pool while a delegated task runs.
  conn: Option<Connection>,
  to_wrap: BytesMut,
  to_unwrap: BytesMut,
  delegate: bool,
  task_pending: bool,
  was_handshaking: bool,
  close_notify_received: bool,
  close_notify_queued: bool,
  inbound_closed: bool,
  outbound_closed: bool,
  error: Option<String>,
}

impl EngineState {
  fn fail(&mut self, message: String) {
    if self.error.is_none() {
      log::debug!("tls engine failed: {message}");
      self.error = Some(message);
    }
  }

  fn handshaking(&self) -> bool {
    self.conn.as_ref().is_none_or(|conn| conn.is_handshaking())
  }

  fn wants_write(&self) -> bool {
    self.conn.as_ref().is_some_and(|conn| conn.wants_write())
  }

  /// Queue close_notify once outbound is closed and the connection is
  /// back from the worker.
  fn queue_close_notify(&mut self) {
    if !self.outbound_closed || self.close_notify_queued {
      return;
    }
    if let Some(conn) = self.conn.as_mut() {
      conn.send_close_notify();
      self.close_notify_queued = true;
    }
  }

  /// Move pending records from the connection into `out`.
  fn drain_tls(&mut self, out: &mut Vec<u8>) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    let mut failed = None;
    while conn.wants_write() {
      if let Err(err) = conn.write_tls(out) {
        failed = Some(err.to_string());
        break;
      }
    }
    if let Some(message) = failed {
      self.fail(message);
    }
  }

  /// Feed at most one read's worth of buffered ciphertext.
  fn feed(&mut self) -> usize {
    let Some(conn) = self.conn.as_mut() else {
      return 0;
    };
    if self.to_unwrap.is_empty() || !conn.wants_read() {
      return 0;
    }
    let mut reader = &self.to_unwrap[..];
    match conn.read_tls(&mut reader) {
      Ok(n) => {
        self.to_unwrap.advance(n);
        n
      }
      Err(err) => {
        self.fail(err.to_string());
        0
      }
    }
  }

  fn read_plaintext(&mut self, out: &mut Vec<u8>) {
    let Some(conn) = self.conn.as_mut() else {
      return;
    };
    let failed = loop {
      let start = out.len();
      out.resize(start + READ_CHUNK, 0);
      let result = conn.reader().read(&mut out[start..]);
      match result {
        Ok(0) => {
          out.truncate(start);
          self.close_notify_received = true;
          break None;
        }
        Ok(n) => out.truncate(start + n),
        Err(err) => {
          out.truncate(start);
          break (err.kind() != io::ErrorKind::WouldBlock)
            .then(|| err.to_string());
        }
      }
    };
    if let Some(message) = failed {
      self.fail(message);
    }
  }

  fn wrap(&mut self) -> EngineResult {
    let mut out = Vec::new();
    let mut consumed = 0;
    if self.error.is_some() {
      // flush a pending alert
      self.drain_tls(&mut out);
    } else if !self.task_pending {
      loop {
        self.drain_tls(&mut out);
        let Some(conn) = self.conn.as_mut() else {
          break;
        };
        if self.to_wrap.is_empty()
          || self.outbound_closed
          || conn.is_handshaking()
          || self.error.is_some()
        {
          break;
        }
        let written = conn.writer().write(&self.to_wrap);
        match written {
          Ok(0) => break,
          Ok(n) => {
            self.to_wrap.advance(n);
            consumed += n;
          }
          Err(err) => self.fail(err.to_string()),
        }
      }
    }
    let remaining = self.to_wrap.len();
    self.result(Step::Wrap, out, consumed, remaining)
  }

  fn unwrap(&mut self) -> EngineResult {
    let mut out = Vec::new();
    let mut consumed = 0;
    if self.error.is_none() && !self.task_pending {
      loop {
        let fed = self.feed();
        consumed += fed;
        if fed > 0 {
          let Some(conn) = self.conn.as_mut() else {
            break;
          };
          if self.delegate && conn.is_handshaking() {
            self.task_pending = true;
            break;
          }
          if let Err(err) = conn.process_new_packets() {
            self.fail(err.to_string());
            break;
          }
        }
        self.read_plaintext(&mut out);
        if fed == 0 || self.error.is_some() {
          break;
        }
      }
    }
    let remaining = self.to_unwrap.len();
    self.result(Step::Unwrap, out, consumed, remaining)
  }

  fn result(
    &mut self,
    step: Step,
    out: Vec<u8>,
    consumed: usize,
    remaining: usize,
  ) -> EngineResult {
    let handshaking = self.handshaking();
    let wants_write = self.wants_write();
    let just_handshaked =
      self.error.is_none() && self.was_handshaking && !handshaking;
    if just_handshaked {
      self.was_handshaking = false;
    }
    let closed = match step {
      Step::Wrap => self.close_notify_queued && !wants_write,
      Step::Unwrap => self.close_notify_received || self.inbound_closed,
    };
    // a handshake waiting on inbound records is an underflow when
    // unwrapping and a request to unwrap when wrapping
    let status = if self.error.is_some() {
      EngineStatus::Error
    } else if closed {
      EngineStatus::Closed
    } else if self.task_pending {
      EngineStatus::NeedTask
    } else if wants_write {
      EngineStatus::NeedWrap
    } else if handshaking && matches!(step, Step::Wrap) {
      EngineStatus::NeedUnwrap
    } else if matches!(step, Step::Unwrap) && out.is_empty() {
      EngineStatus::Underflow
    } else {
      EngineStatus::Ok
    };
    EngineResult {
      status,
      data: (!out.is_empty()).then(|| Bytes::from(out)),
      consumed,
      remaining,
      just_handshaked,
      error: self.error.clone(),
    }
  }
}

type TaskWaiter = Box<dyn FnOnce() + 'static>;

/// TLS record-layer engine with four buffers: plaintext to wrap,
/// ciphertext produced, ciphertext to unwrap and plaintext produced. The
/// engine does no I/O; callers move ciphertext between it and a transport.
/// Clones share the same engine.
///
/// A delegated task takes the connection to the worker pool. Until it
/// returns, `wrap` and `unwrap` only buffer and report `NeedTask`, and the
/// introspection methods answer as if the handshake were still running.
#[derive(Clone)]
pub struct TlsEngine {
  state: Arc<Mutex<EngineState>>,
  waiters: Rc<RefCell<Vec<TaskWaiter>>>,
  loop_handle: LoopHandle,
  is_client: bool,
}

impl fmt::Debug for TlsEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("TlsEngine")
      .field("client", &self.is_client)
      .field("handshaking", &state.handshaking())
      .field("task_running", &state.conn.is_none())
      .field("error", &state.error)
      .finish()
  }
}

impl TlsEngine {
  pub(crate) fn new(
    loop_handle: &LoopHandle,
    conn: Connection,
    delegate: bool,
  ) -> Self {
    let is_client = matches!(conn, Connection::Client(_));
    Self {
      state: Arc::new(Mutex::new(EngineState {
        conn: Some(conn),
        to_wrap: BytesMut::new(),
        to_unwrap: BytesMut::new(),
        delegate,
        task_pending: false,
        was_handshaking: true,
        close_notify_received: false,
        close_notify_queued: false,
        inbound_closed: false,
        outbound_closed: false,
        error: None,
      })),
      waiters: Rc::new(RefCell::new(Vec::new())),
      loop_handle: loop_handle.clone(),
      is_client,
    }
  }

  pub fn is_client(&self) -> bool {
    self.is_client
  }

  pub(crate) fn loop_handle(&self) -> &LoopHandle {
    &self.loop_handle
  }

  /// With delegation off, handshake processing happens inside `unwrap`.
  pub fn set_delegated_tasks(&self, enabled: bool) {
    self.state.lock().delegate = enabled;
  }

  /// Queue `plaintext` for encryption and produce whatever ciphertext the
  /// engine has ready, handshake records included.
  pub fn wrap(&self, plaintext: Option<&[u8]>) -> EngineResult {
    let mut state = self.state.lock();
    if let Some(plaintext) = plaintext {
      state.to_wrap.extend_from_slice(plaintext);
    }
    state.wrap()
  }

  /// Queue `ciphertext` for decryption and produce whatever plaintext the
  /// buffered records yield.
  pub fn unwrap(&self, ciphertext: Option<&[u8]>) -> EngineResult {
    let mut state = self.state.lock();
    if let Some(ciphertext) = ciphertext {
      state.to_unwrap.extend_from_slice(ciphertext);
    }
    state.unwrap()
  }

  /// Run the delegated handshake step on the worker pool, then enqueue
  /// `callback`. Without a pending step `callback` is enqueued directly;
  /// while a step is already running it fires when that step completes.
  pub fn run_task(&self, callback: impl FnOnce() + 'static) {
    let conn = {
      let mut state = self.state.lock();
      if !state.task_pending {
        drop(state);
        self.loop_handle.enqueue("tls.task", callback);
        return;
      }
      state.conn.take()
    };
    let Some(mut conn) = conn else {
      self.waiters.borrow_mut().push(Box::new(callback));
      return;
    };

    let state = self.state.clone();
    let waiters = self.waiters.clone();
    self.loop_handle.spawn_blocking(
      "tls.task",
      move || {
        let processed = conn
          .process_new_packets()
          .map(|_| ())
          .map_err(|err| err.to_string());
        (conn, processed)
      },
      move |result| {
        {
          let mut state = state.lock();
          state.task_pending = false;
          match result {
            Ok((conn, processed)) => {
              state.conn = Some(conn);
              state.queue_close_notify();
              if let Err(message) = processed {
                state.fail(message);
              }
            }
            Err(err) => state.fail(err.to_string()),
          }
        }
        callback();
        let waiting = mem::take(&mut *waiters.borrow_mut());
        for waiter in waiting {
          waiter();
        }
      },
    );
  }

  pub fn begin_handshake(&self) -> Result<(), TlsError> {
    let state = self.state.lock();
    if let Some(err) = &state.error {
      return Err(TlsError::Engine(err.clone()));
    }
    if state.outbound_closed {
      return Err(TlsError::Closed);
    }
    log::debug!(
      "tls handshake started as {}",
      if self.is_client { "client" } else { "server" }
    );
    Ok(())
  }

  /// Mark the inbound side finished. Fails when the peer never sent
  /// close_notify, since the stream may have been truncated.
  pub fn close_inbound(&self) -> Result<(), TlsError> {
    let mut state = self.state.lock();
    let clean = state.close_notify_received || state.inbound_closed;
    state.inbound_closed = true;
    if clean || state.error.is_some() {
      Ok(())
    } else {
      Err(TlsError::Truncated)
    }
  }

  /// Queue close_notify. Plaintext not yet wrapped is discarded.
  pub fn close_outbound(&self) {
    let mut state = self.state.lock();
    if !state.outbound_closed {
      state.outbound_closed = true;
      state.to_wrap.clear();
      state.queue_close_notify();
    }
  }

  pub fn is_inbound_done(&self) -> bool {
    let state = self.state.lock();
    state.close_notify_received || state.inbound_closed
  }

  /// True once close_notify has been queued and wrapped out.
  pub fn is_outbound_done(&self) -> bool {
    let state = self.state.lock();
    state.close_notify_queued && !state.wants_write()
  }

  pub fn is_handshaking(&self) -> bool {
    self.state.lock().handshaking()
  }

  pub fn cipher_suite(&self) -> Option<String> {
    let state = self.state.lock();
    let suite = state.conn.as_ref()?.negotiated_cipher_suite()?;
    Some(format!("{:?}", suite.suite()))
  }

  pub fn protocol(&self) -> Option<&'static str> {
    let state = self.state.lock();
    Some(match state.conn.as_ref()?.protocol_version()? {
      ProtocolVersion::TLSv1_3 => "TLSv1.3",
      ProtocolVersion::TLSv1_2 => "TLSv1.2",
      ProtocolVersion::TLSv1_1 => "TLSv1.1",
      ProtocolVersion::TLSv1_0 => "TLSv1",
      _ => "unknown",
    })
  }

  pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
    let state = self.state.lock();
    state.conn.as_ref()?.alpn_protocol().map(|p| p.to_vec())
  }

  /// Whether the handshake resumed an earlier session.
  pub fn is_session_reused(&self) -> bool {
    let state = self.state.lock();
    let kind = state.conn.as_ref().and_then(|conn| conn.handshake_kind());
    matches!(kind, Some(HandshakeKind::Resumed))
  }

  /// The peer's certificate chain, leaf first. Empty before the handshake
  /// and for clients that sent no certificate.
  pub fn peer_certificates(&self) -> Result<Vec<PeerCertificate>, TlsError> {
    let state = self.state.lock();
    let Some(conn) = state.conn.as_ref() else {
      return Ok(Vec::new());
    };
    conn
      .peer_certificates()
      .unwrap_or_default()
      .iter()
      .map(|der| PeerCertificate::from_der(der))
      .collect()
  }
}
