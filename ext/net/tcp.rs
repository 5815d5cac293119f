// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use std::mem;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Buf;
use bytes::Bytes;
use mio::Interest;
use mio::Token;
use skiff_core::Closable;
use skiff_core::ErrorCode;
use skiff_core::HandleKey;
use skiff_core::HandleKind;
use skiff_core::OsError;
use skiff_core::OsResult;
use skiff_core::PinState;
use skiff_core::ReadCallback;
use skiff_core::ReadEvent;
use skiff_core::Readable;
use skiff_core::Refable;
use skiff_core::Writable;
use skiff_core::WriteCallback;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockRef;
use socket2::Type;

use crate::Net;
use crate::reactor::Ready;
use crate::reactor::ReadyHandler;
use crate::reactor::is_interrupted;
use crate::reactor::is_wouldblock;

/// Largest chunk handed to a read callback.
pub const READ_BUFFER_SIZE: usize = 32767;

pub type ConnectionCallback = Box<dyn FnMut(OsResult<TcpHandle>) + 'static>;
pub type ConnectCallback = Box<dyn FnOnce(OsResult<()>) + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
  Unbound,
  Bound,
  Connecting,
  Connected,
  Listening,
  Failed,
  Closed,
}

enum Socket {
  Unbound,
  Bound(socket2::Socket),
  /// Waiting for the host name lookup. Keeps the socket of a prior bind.
  Resolving(Option<socket2::Socket>),
  Connecting(mio::net::TcpStream, SocketAddr),
  Connected(mio::net::TcpStream),
  Listening(mio::net::TcpListener),
  Failed,
  Closed,
}

impl Socket {
  fn state(&self) -> TcpState {
    match self {
      Socket::Unbound => TcpState::Unbound,
      Socket::Bound(_) => TcpState::Bound,
      Socket::Resolving(_) | Socket::Connecting(..) => TcpState::Connecting,
      Socket::Connected(_) => TcpState::Connected,
      Socket::Listening(_) => TcpState::Listening,
      Socket::Failed => TcpState::Failed,
      Socket::Closed => TcpState::Closed,
    }
  }
}

enum WriteOp {
  Data(Bytes),
  Shutdown,
}

struct QueuedWrite {
  op: WriteOp,
  on_complete: WriteCallback,
}

struct TcpIo {
  socket: Socket,
  token: Option<Token>,
  // Tri-state: yes, no, unknown
  readable: Option<bool>,
  writable: Option<bool>,
  scheduled: bool,
  reading: bool,
  read_ended: bool,
  on_read: Option<ReadCallback>,
  write_queue: VecDeque<QueuedWrite>,
  queued_bytes: usize,
  write_ended: bool,
  on_connect: Option<ConnectCallback>,
  on_connection: Option<ConnectionCallback>,
}

impl TcpIo {
  fn new(socket: Socket) -> Self {
    Self {
      socket,
      token: None,
      readable: None,
      writable: None,
      scheduled: false,
      reading: false,
      read_ended: false,
      on_read: None,
      write_queue: VecDeque::new(),
      queued_bytes: 0,
      write_ended: false,
      on_connect: None,
      on_connection: None,
    }
  }
}

struct TcpInner {
  net: Net,
  this: Weak<TcpInner>,
  pin: PinState,
  registration: Cell<Option<HandleKey>>,
  io: RefCell<TcpIo>,
}

/// Non-blocking TCP socket driven by the loop's [`crate::NetReactor`].
/// While open and referenced it holds one pin on the loop.
#[derive(Clone)]
pub struct TcpHandle {
  inner: Rc<TcpInner>,
}

impl fmt::Debug for TcpHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TcpHandle")
      .field("state", &self.state())
      .finish()
  }
}

fn closed_error(syscall: &'static str) -> OsError {
  OsError::new(ErrorCode::BadDescriptor).syscall(syscall)
}

fn not_connected(syscall: &'static str) -> OsError {
  OsError::invalid_argument("socket is not connected").syscall(syscall)
}

fn new_socket(addr: &SocketAddr) -> io::Result<socket2::Socket> {
  let socket = socket2::Socket::new(
    Domain::for_address(*addr),
    Type::STREAM,
    Some(Protocol::TCP),
  )?;
  socket.set_nonblocking(true)?;
  Ok(socket)
}

/// Take back a listener the reactor refused.
fn unregistered_socket(listener: mio::net::TcpListener) -> socket2::Socket {
  #[cfg(unix)]
  let owned = std::os::fd::OwnedFd::from(listener);
  #[cfg(windows)]
  let owned = std::os::windows::io::OwnedSocket::from(listener);
  socket2::Socket::from(owned)
}

fn resolve(host: &str, port: u16) -> OsResult<SocketAddr> {
  let not_found = || OsError::new(ErrorCode::HostNotFound).host(host);
  let mut addrs = (host, port)
    .to_socket_addrs()
    .map_err(|_| not_found().syscall("getaddrinfo"))?;
  addrs.next().ok_or_else(|| not_found().syscall("getaddrinfo"))
}

fn connect_in_progress(err: &io::Error) -> bool {
  #[cfg(unix)]
  if err.raw_os_error() == Some(libc::EINPROGRESS) {
    return true;
  }
  is_wouldblock(err)
}

/// Write as much of `data` as the socket takes. Returns true once it is all
/// written, false when the socket would block.
fn write_some(
  stream: &mut mio::net::TcpStream,
  data: &mut Bytes,
  queued_bytes: &mut usize,
) -> io::Result<bool> {
  while !data.is_empty() {
    match stream.write(&data[..]) {
      Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
      Ok(n) => {
        data.advance(n);
        *queued_bytes -= n;
      }
      Err(ref err) if is_interrupted(err) => {}
      Err(ref err) if is_wouldblock(err) => return Ok(false),
      Err(err) => return Err(err),
    }
  }
  Ok(true)
}

/// Completed connect: None while the handshake is still in flight.
fn check_connect(stream: &mio::net::TcpStream) -> Option<io::Result<()>> {
  match stream.take_error() {
    Ok(Some(err)) | Err(err) => return Some(Err(err)),
    Ok(None) => {}
  }
  match stream.peer_addr() {
    Ok(_) => Some(Ok(())),
    Err(err) if err.kind() == io::ErrorKind::NotConnected => None,
    Err(err) => Some(Err(err)),
  }
}

impl TcpHandle {
  pub(crate) fn new(net: &Net) -> Self {
    let inner = Rc::new_cyclic(|this| TcpInner {
      net: net.clone(),
      this: this.clone(),
      pin: PinState::new(net.loop_handle().pins().clone()),
      registration: Cell::new(None),
      io: RefCell::new(TcpIo::new(Socket::Unbound)),
    });
    let weak: Weak<dyn Closable> = Rc::<TcpInner>::downgrade(&inner);
    inner
      .registration
      .set(Some(net.loop_handle().register_handle(HandleKind::Tcp, weak)));
    Self { inner }
  }

  fn from_accepted(
    net: &Net,
    mut stream: mio::net::TcpStream,
  ) -> OsResult<Self> {
    let handle = Self::new(net);
    if let Err(err) = stream.set_nodelay(true) {
      log::debug!("set_nodelay on accepted socket: {err}");
    }
    let token = net.reactor().register(
      &mut stream,
      Interest::READABLE | Interest::WRITABLE,
      handle.inner.handler(),
    )?;
    {
      let mut io = handle.inner.io.borrow_mut();
      io.token = Some(token);
      io.socket = Socket::Connected(stream);
    }
    handle.inner.pin.request_pin();
    Ok(handle)
  }

  pub fn state(&self) -> TcpState {
    self.inner.io.borrow().socket.state()
  }

  /// Bind to `addr:port`. Port 0 picks an ephemeral port.
  pub fn bind(&self, addr: &str, port: u16) -> OsResult<()> {
    let mut io = self.inner.io.borrow_mut();
    match io.socket {
      Socket::Unbound => {}
      Socket::Closed => return Err(closed_error("bind")),
      _ => {
        return Err(
          OsError::invalid_argument("socket is already bound").syscall("bind"),
        );
      }
    }
    let addr = (addr, port)
      .to_socket_addrs()
      .ok()
      .and_then(|mut addrs| addrs.next())
      .ok_or_else(|| OsError::not_found().syscall("bind").host(addr))?;
    let socket = new_socket(&addr)
      .and_then(|socket| {
        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        Ok(socket)
      })
      .map_err(|err| {
        OsError::from(err).syscall("bind").host(addr.to_string())
      })?;
    log::debug!("bound to {addr}");
    io.socket = Socket::Bound(socket);
    Ok(())
  }

  /// Start accepting connections. Without a prior `bind` the socket is
  /// bound to an ephemeral port on all interfaces.
  pub fn listen(
    &self,
    backlog: i32,
    on_connection: impl FnMut(OsResult<TcpHandle>) + 'static,
  ) -> OsResult<()> {
    if self.state() == TcpState::Unbound {
      self.bind("0.0.0.0", 0)?;
    }
    let mut io = self.inner.io.borrow_mut();
    let socket = match mem::replace(&mut io.socket, Socket::Failed) {
      Socket::Bound(socket) => socket,
      other => {
        let err = match other {
          Socket::Closed => closed_error("listen"),
          _ => OsError::invalid_argument("socket cannot listen")
            .syscall("listen"),
        };
        io.socket = other;
        return Err(err);
      }
    };
    if let Err(err) = socket.listen(backlog) {
      io.socket = Socket::Bound(socket);
      return Err(OsError::from(err).syscall("listen"));
    }
    let mut listener = mio::net::TcpListener::from_std(socket.into());
    let token = match self.inner.net.reactor().register(
      &mut listener,
      Interest::READABLE,
      self.inner.handler(),
    ) {
      Ok(token) => token,
      Err(err) => {
        // still bound, so a later listen may retry
        io.socket = Socket::Bound(unregistered_socket(listener));
        return Err(OsError::from(err).syscall("listen"));
      }
    };
    if let Ok(addr) = listener.local_addr() {
      log::debug!("listening on {addr} with backlog {backlog}");
    }
    io.token = Some(token);
    io.socket = Socket::Listening(listener);
    io.on_connection = Some(Box::new(on_connection));
    drop(io);
    self.inner.pin.request_pin();
    Ok(())
  }

  /// Connect to `host:port`. The host is resolved on the worker pool and
  /// `on_connect` runs exactly once, as a task.
  pub fn connect(
    &self,
    host: &str,
    port: u16,
    on_connect: impl FnOnce(OsResult<()>) + 'static,
  ) -> OsResult<()> {
    {
      let mut io = self.inner.io.borrow_mut();
      let bound = match mem::replace(&mut io.socket, Socket::Failed) {
        Socket::Unbound => None,
        Socket::Bound(socket) => Some(socket),
        other => {
          let err = match other {
            Socket::Closed => closed_error("connect"),
            _ => OsError::invalid_argument("socket is already in use")
              .syscall("connect"),
          };
          io.socket = other;
          return Err(err);
        }
      };
      io.socket = Socket::Resolving(bound);
      io.on_connect = Some(Box::new(on_connect));
    }
    self.inner.pin.request_pin();
    log::debug!("connecting to {host}:{port}");

    let this = self.inner.this.clone();
    let host = host.to_string();
    self.inner.net.loop_handle().spawn_blocking(
      "tcp.resolve",
      move || resolve(&host, port),
      move |result| {
        if let Some(inner) = this.upgrade() {
          inner.start_connect(result.and_then(|addr| addr));
        }
      },
    );
    Ok(())
  }

  pub fn sockname(&self) -> OsResult<SocketAddr> {
    let io = self.inner.io.borrow();
    let result = match &io.socket {
      Socket::Bound(socket) | Socket::Resolving(Some(socket)) => {
        socket.local_addr().and_then(|addr| {
          addr
            .as_socket()
            .ok_or_else(|| io::Error::other("not an inet address"))
        })
      }
      Socket::Listening(listener) => listener.local_addr(),
      Socket::Connecting(stream, _) | Socket::Connected(stream) => {
        stream.local_addr()
      }
      _ => return Err(OsError::invalid_argument("socket is not bound")),
    };
    result.map_err(|err| OsError::from(err).syscall("getsockname"))
  }

  pub fn peername(&self) -> OsResult<SocketAddr> {
    let io = self.inner.io.borrow();
    match &io.socket {
      Socket::Connected(stream) => stream
        .peer_addr()
        .map_err(|err| OsError::from(err).syscall("getpeername")),
      _ => Err(not_connected("getpeername")),
    }
  }

  /// No-op until the socket has a connection.
  pub fn set_no_delay(&self, enable: bool) -> OsResult<()> {
    let io = self.inner.io.borrow();
    match &io.socket {
      Socket::Connecting(stream, _) | Socket::Connected(stream) => stream
        .set_nodelay(enable)
        .map_err(|err| OsError::from(err).syscall("setsockopt")),
      _ => Ok(()),
    }
  }

  /// No-op until the socket has a connection.
  pub fn set_keep_alive(&self, enable: bool) -> OsResult<()> {
    let io = self.inner.io.borrow();
    match &io.socket {
      Socket::Connecting(stream, _) | Socket::Connected(stream) => {
        SockRef::from(stream)
          .set_keepalive(enable)
          .map_err(|err| OsError::from(err).syscall("setsockopt"))
      }
      _ => Ok(()),
    }
  }

  /// Bytes queued but not yet handed to the kernel.
  pub fn write_queue_size(&self) -> usize {
    self.inner.io.borrow().queued_bytes
  }

  fn enqueue_write(
    &self,
    op: WriteOp,
    on_complete: WriteCallback,
  ) -> OsResult<()> {
    let syscall = match op {
      WriteOp::Data(_) => "write",
      WriteOp::Shutdown => "shutdown",
    };
    let mut io = self.inner.io.borrow_mut();
    let connected = match io.socket {
      Socket::Connected(_) => true,
      Socket::Resolving(_) | Socket::Connecting(..) => false,
      Socket::Closed => return Err(closed_error(syscall)),
      _ => return Err(not_connected(syscall)),
    };
    if io.write_ended {
      return Err(
        OsError::with_message(ErrorCode::Io, "write after end")
          .syscall(syscall),
      );
    }
    match &op {
      WriteOp::Data(data) => io.queued_bytes += data.len(),
      WriteOp::Shutdown => io.write_ended = true,
    }
    io.write_queue.push_back(QueuedWrite { op, on_complete });
    let flush = connected
      && io.write_queue.len() == 1
      && io.writable != Some(false);
    drop(io);
    if flush {
      self.inner.flush_writes();
    }
    Ok(())
  }
}

impl TcpInner {
  fn handler(&self) -> Weak<dyn ReadyHandler> {
    self.this.clone()
  }

  fn schedule(&self) {
    {
      let mut io = self.io.borrow_mut();
      if io.scheduled || matches!(io.socket, Socket::Closed) {
        return;
      }
      io.scheduled = true;
    }
    let this = self.this.clone();
    self.net.loop_handle().enqueue("tcp.io", move || {
      if let Some(inner) = this.upgrade() {
        inner.process();
      }
    });
  }

  fn process(&self) {
    let state = {
      let mut io = self.io.borrow_mut();
      io.scheduled = false;
      io.socket.state()
    };
    match state {
      TcpState::Listening => self.accept_pending(),
      TcpState::Connecting => {
        if self.finish_connect() {
          self.flush_writes();
          self.read_pending();
        }
      }
      TcpState::Connected => {
        self.flush_writes();
        self.read_pending();
      }
      _ => {}
    }
  }

  fn start_connect(&self, addr: OsResult<SocketAddr>) {
    let mut io = self.io.borrow_mut();
    let bound = match mem::replace(&mut io.socket, Socket::Failed) {
      Socket::Resolving(bound) => bound,
      other => {
        // closed while resolving
        io.socket = other;
        return;
      }
    };
    let attempt = addr.and_then(|addr| {
      let socket = match bound {
        Some(socket) => socket,
        None => new_socket(&addr)
          .map_err(|err| OsError::from(err).syscall("socket"))?,
      };
      match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref err) if connect_in_progress(err) => {}
        Err(err) => {
          return Err(
            OsError::from(err).syscall("connect").host(addr.to_string()),
          );
        }
      }
      let mut stream = mio::net::TcpStream::from_std(socket.into());
      let token = self
        .net
        .reactor()
        .register(
          &mut stream,
          Interest::READABLE | Interest::WRITABLE,
          self.handler(),
        )
        .map_err(|err| OsError::from(err).syscall("connect"))?;
      Ok((stream, addr, token))
    });
    match attempt {
      Ok((stream, addr, token)) => {
        io.token = Some(token);
        io.socket = Socket::Connecting(stream, addr);
      }
      Err(err) => {
        drop(io);
        self.fail_connect(err);
      }
    }
  }

  /// Returns true when the socket is now connected.
  fn finish_connect(&self) -> bool {
    let outcome = {
      let mut io = self.io.borrow_mut();
      let Socket::Connecting(stream, addr) = &io.socket else {
        return false;
      };
      let addr = *addr;
      match check_connect(stream) {
        None => {
          io.writable = Some(false);
          return false;
        }
        Some(Ok(())) => {
          let Socket::Connecting(stream, _) =
            mem::replace(&mut io.socket, Socket::Failed)
          else {
            return false;
          };
          if let Err(err) = stream.set_nodelay(true) {
            log::debug!("set_nodelay: {err}");
          }
          log::debug!("connected to {addr}");
          io.socket = Socket::Connected(stream);
          Ok(())
        }
        Some(Err(err)) => {
          log::debug!("error completing connect to {addr}: {err}");
          Err(OsError::from(err).syscall("connect").host(addr.to_string()))
        }
      }
    };
    match outcome {
      Ok(()) => {
        let on_connect = self.io.borrow_mut().on_connect.take();
        if let Some(on_connect) = on_connect {
          on_connect(Ok(()));
        }
        true
      }
      Err(err) => {
        self.release_socket(Socket::Failed);
        self.fail_connect(err);
        false
      }
    }
  }

  fn fail_connect(&self, err: OsError) {
    let (on_connect, queued) = {
      let mut io = self.io.borrow_mut();
      if !matches!(io.socket, Socket::Closed) {
        io.socket = Socket::Failed;
      }
      io.queued_bytes = 0;
      (
        io.on_connect.take(),
        mem::take(&mut io.write_queue),
      )
    };
    self.pin.clear_pin();
    if let Some(on_connect) = on_connect {
      on_connect(Err(err.clone()));
    }
    for write in queued {
      (write.on_complete)(Err(err.clone()));
    }
  }

  /// Swap out the socket, deregistering it from the reactor.
  fn release_socket(&self, replacement: Socket) {
    let (socket, token) = {
      let mut io = self.io.borrow_mut();
      (mem::replace(&mut io.socket, replacement), io.token.take())
    };
    let Some(token) = token else {
      return;
    };
    let reactor = self.net.reactor();
    match socket {
      Socket::Listening(mut listener) => {
        reactor.deregister(token, &mut listener);
      }
      Socket::Connecting(mut stream, _) | Socket::Connected(mut stream) => {
        reactor.deregister(token, &mut stream);
      }
      _ => {}
    }
  }

  fn accept_pending(&self) {
    loop {
      let accepted = {
        let mut io = self.io.borrow_mut();
        let Socket::Listening(listener) = &io.socket else {
          return;
        };
        match listener.accept() {
          Ok(accepted) => Ok(accepted),
          Err(ref err) if is_interrupted(err) => continue,
          Err(ref err) if is_wouldblock(err) => {
            io.readable = Some(false);
            return;
          }
          Err(err) => Err(err),
        }
      };
      match accepted {
        Ok((stream, peer)) => {
          log::debug!("accepted new socket from {peer}");
          let result = TcpHandle::from_accepted(&self.net, stream);
          self.notify_connection(result);
        }
        Err(err) => {
          log::error!("error accepting a new socket: {err}");
          self.notify_connection(Err(OsError::from(err).syscall("accept")));
          return;
        }
      }
    }
  }

  fn notify_connection(&self, result: OsResult<TcpHandle>) {
    let Some(mut on_connection) = self.io.borrow_mut().on_connection.take()
    else {
      return;
    };
    on_connection(result);
    let mut io = self.io.borrow_mut();
    if io.on_connection.is_none() && matches!(io.socket, Socket::Listening(_))
    {
      io.on_connection = Some(on_connection);
    }
  }

  fn read_pending(&self) {
    let mut buf = vec![0; READ_BUFFER_SIZE];
    loop {
      let event = {
        let mut io = self.io.borrow_mut();
        if !io.reading || io.read_ended || io.readable == Some(false) {
          return;
        }
        let Socket::Connected(stream) = &mut io.socket else {
          return;
        };
        match stream.read(&mut buf) {
          Ok(0) => {
            io.read_ended = true;
            ReadEvent::Eof
          }
          Ok(n) => ReadEvent::Data(Bytes::copy_from_slice(&buf[..n])),
          Err(ref err) if is_interrupted(err) => continue,
          Err(ref err) if is_wouldblock(err) => {
            io.readable = Some(false);
            return;
          }
          Err(err) => {
            io.read_ended = true;
            ReadEvent::Error(OsError::from(err).syscall("read"))
          }
        }
      };
      self.deliver_read(event);
    }
  }

  fn deliver_read(&self, event: ReadEvent) {
    let Some(mut on_read) = self.io.borrow_mut().on_read.take() else {
      return;
    };
    on_read(event);
    let mut io = self.io.borrow_mut();
    if io.reading && io.on_read.is_none() {
      io.on_read = Some(on_read);
    }
  }

  fn flush_writes(&self) {
    let completed = {
      let mut io = self.io.borrow_mut();
      let io = &mut *io;
      let Socket::Connected(stream) = &mut io.socket else {
        return;
      };
      let mut completed = Vec::new();
      while let Some(head) = io.write_queue.front_mut() {
        let result = match &mut head.op {
          WriteOp::Data(data) => {
            write_some(stream, data, &mut io.queued_bytes)
          }
          WriteOp::Shutdown => stream.shutdown(Shutdown::Write).map(|()| true),
        };
        match result {
          Ok(true) => {
            if let Some(write) = io.write_queue.pop_front() {
              completed.push((write.on_complete, Ok(())));
            }
          }
          Ok(false) => {
            io.writable = Some(false);
            break;
          }
          Err(err) => {
            log::debug!("write error: {err}");
            let err = OsError::from(err).syscall("write");
            for write in io.write_queue.drain(..) {
              completed.push((write.on_complete, Err(err.clone())));
            }
            io.queued_bytes = 0;
            io.write_ended = true;
            break;
          }
        }
      }
      completed
    };
    let loop_handle = self.net.loop_handle();
    for (on_complete, result) in completed {
      loop_handle.enqueue("tcp.write", move || on_complete(result));
    }
  }
}

impl ReadyHandler for TcpInner {
  fn ready(&self, ready: Ready) {
    {
      let mut io = self.io.borrow_mut();
      if ready.readable || ready.read_closed || ready.error {
        io.readable = Some(true);
      }
      if ready.writable || ready.write_closed || ready.error {
        io.writable = Some(true);
      }
    }
    self.schedule();
  }
}

impl Closable for TcpInner {
  fn close(&self) {
    let dropped = {
      let mut io = self.io.borrow_mut();
      if matches!(io.socket, Socket::Closed) {
        return;
      }
      io.reading = false;
      io.queued_bytes = 0;
      // pending completions are dropped without being called
      (
        io.on_read.take(),
        io.on_connect.take(),
        io.on_connection.take(),
        mem::take(&mut io.write_queue),
      )
    };
    self.release_socket(Socket::Closed);
    self.pin.clear_pin();
    if let Some(key) = self.registration.take() {
      self.net.loop_handle().unregister_handle(key);
    }
    log::debug!("closed tcp handle");
    drop(dropped);
  }

  fn is_closed(&self) -> bool {
    matches!(self.io.borrow().socket, Socket::Closed)
  }
}

impl Drop for TcpInner {
  fn drop(&mut self) {
    self.close();
  }
}

impl Closable for TcpHandle {
  fn close(&self) {
    self.inner.close();
  }

  fn is_closed(&self) -> bool {
    self.inner.is_closed()
  }
}

impl Refable for TcpHandle {
  fn set_ref(&self, referenced: bool) {
    self.inner.pin.set_ref(referenced);
  }

  fn has_ref(&self) -> bool {
    self.inner.pin.has_ref()
  }
}

impl Readable for TcpHandle {
  fn read_start(&self, on_read: ReadCallback) -> OsResult<()> {
    let ready = {
      let mut io = self.inner.io.borrow_mut();
      let connected = match io.socket {
        Socket::Connected(_) => true,
        Socket::Resolving(_) | Socket::Connecting(..) => false,
        Socket::Closed => return Err(closed_error("read")),
        _ => return Err(not_connected("read")),
      };
      io.on_read = Some(on_read);
      io.reading = true;
      connected && !io.read_ended && io.readable != Some(false)
    };
    // data may have arrived before reading started
    if ready {
      self.inner.schedule();
    }
    Ok(())
  }

  fn read_stop(&self) -> OsResult<()> {
    let mut io = self.inner.io.borrow_mut();
    if matches!(io.socket, Socket::Closed) {
      return Err(closed_error("read"));
    }
    io.reading = false;
    let on_read = io.on_read.take();
    drop(io);
    drop(on_read);
    Ok(())
  }
}

impl Writable for TcpHandle {
  fn write(&self, data: Bytes, on_complete: WriteCallback) -> OsResult<()> {
    self.enqueue_write(WriteOp::Data(data), on_complete)
  }

  fn shutdown(&self, on_complete: WriteCallback) -> OsResult<()> {
    self.enqueue_write(WriteOp::Shutdown, on_complete)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use skiff_core::EventLoop;
  use skiff_core::LoopOptions;

  use super::*;
  use crate::NetReactor;

  fn setup() -> (EventLoop<Rc<NetReactor>>, Net) {
    let reactor = Rc::new(NetReactor::new().unwrap());
    let event_loop =
      EventLoop::with_reactor(reactor.clone(), LoopOptions::default())
        .unwrap();
    let net = Net::new(reactor, event_loop.handle());
    (event_loop, net)
  }

  #[test]
  fn refused_listener_keeps_its_address() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let socket = new_socket(&addr).unwrap();
    socket.bind(&addr.into()).unwrap();
    socket.listen(8).unwrap();
    let bound = socket.local_addr().unwrap().as_socket().unwrap();

    let listener = mio::net::TcpListener::from_std(socket.into());
    let socket = unregistered_socket(listener);
    assert_eq!(socket.local_addr().unwrap().as_socket(), Some(bound));
    socket.listen(8).unwrap();
    let client = std::net::TcpStream::connect(bound).unwrap();
    drop(client);
  }

  #[test]
  fn listen_and_connect_once() {
    let (event_loop, net) = setup();
    let accepted = Rc::new(Cell::new(0));
    let connected = Rc::new(Cell::new(0));

    let server = net.tcp();
    server.bind("127.0.0.1", 0).unwrap();
    {
      let accepted = accepted.clone();
      let server2 = server.clone();
      server
        .listen(16, move |conn| {
          let conn = conn.unwrap();
          assert_eq!(conn.state(), TcpState::Connected);
          accepted.set(accepted.get() + 1);
          conn.close();
          server2.close();
        })
        .unwrap();
    }
    assert_eq!(server.state(), TcpState::Listening);
    let port = server.sockname().unwrap().port();

    let client = net.tcp();
    {
      let connected = connected.clone();
      let client2 = client.clone();
      client
        .connect("127.0.0.1", port, move |result| {
          result.unwrap();
          assert_eq!(client2.peername().unwrap().port(), port);
          connected.set(connected.get() + 1);
          client2.close();
        })
        .unwrap();
    }

    event_loop.run().unwrap();
    assert_eq!(accepted.get(), 1);
    assert_eq!(connected.get(), 1);
    assert_eq!(event_loop.pins().count(), 0);
    assert_eq!(net.reactor().registered(), 0);
  }

  #[test]
  fn writes_complete_in_order_across_partial_drains() {
    let (event_loop, net) = setup();
    const CHUNKS: usize = 64;
    const CHUNK_SIZE: usize = 64 * 1024;

    let received = Rc::new(RefCell::new(Vec::new()));
    let eof = Rc::new(Cell::new(0));
    let server = net.tcp();
    {
      let received = received.clone();
      let eof = eof.clone();
      let server2 = server.clone();
      server
        .listen(16, move |conn| {
          let conn = conn.unwrap();
          let received = received.clone();
          let eof = eof.clone();
          let conn2 = conn.clone();
          conn
            .read_start(Box::new(move |event| match event {
              ReadEvent::Data(data) => {
                assert!(data.len() <= READ_BUFFER_SIZE);
                received.borrow_mut().extend_from_slice(&data);
              }
              ReadEvent::Eof => {
                eof.set(eof.get() + 1);
                conn2.close();
              }
              ReadEvent::Error(err) => panic!("{err}"),
            }))
            .unwrap();
          server2.close();
        })
        .unwrap();
    }
    let port = server.sockname().unwrap().port();

    let completions = Rc::new(RefCell::new(Vec::new()));
    let client = net.tcp();
    client.connect("127.0.0.1", port, |result| result.unwrap()).unwrap();
    let mut expected = Vec::with_capacity(CHUNKS * CHUNK_SIZE);
    for i in 0..CHUNKS {
      let chunk = vec![i as u8; CHUNK_SIZE];
      expected.extend_from_slice(&chunk);
      let completions = completions.clone();
      client
        .write(
          Bytes::from(chunk),
          Box::new(move |result| {
            result.unwrap();
            completions.borrow_mut().push(i);
          }),
        )
        .unwrap();
    }
    assert_eq!(client.write_queue_size(), CHUNKS * CHUNK_SIZE);
    {
      let client2 = client.clone();
      let completions = completions.clone();
      client
        .shutdown(Box::new(move |result| {
          result.unwrap();
          assert_eq!(completions.borrow().len(), CHUNKS);
          client2.close();
        }))
        .unwrap();
    }

    event_loop.run().unwrap();
    assert_eq!(*completions.borrow(), (0..CHUNKS).collect::<Vec<_>>());
    assert_eq!(received.borrow().len(), expected.len());
    assert!(*received.borrow() == expected);
    assert_eq!(eof.get(), 1);
    assert_eq!(client.write_queue_size(), 0);
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn close_and_unref_are_idempotent() {
    let (event_loop, net) = setup();
    let server = net.tcp();
    server.listen(16, |_| {}).unwrap();
    assert_eq!(event_loop.pins().count(), 1);

    server.set_ref(false);
    server.set_ref(false);
    assert!(!server.has_ref());
    assert_eq!(event_loop.pins().count(), 0);
    event_loop.run().unwrap();

    server.set_ref(true);
    assert_eq!(event_loop.pins().count(), 1);
    server.close();
    server.close();
    assert!(server.is_closed());
    assert_eq!(server.state(), TcpState::Closed);
    assert_eq!(event_loop.pins().count(), 0);
    assert_eq!(event_loop.handle().live_handles(), 0);

    let err = server.write(Bytes::new(), Box::new(|_| {})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadDescriptor);
  }

  #[test]
  fn close_suppresses_pending_writes() {
    let (event_loop, net) = setup();
    let server = net.tcp();
    server.listen(16, |_| {}).unwrap();
    let port = server.sockname().unwrap().port();

    let called = Rc::new(Cell::new(false));
    let client = net.tcp();
    client.connect("127.0.0.1", port, |_| {}).unwrap();
    {
      let called = called.clone();
      client
        .write(
          Bytes::from_static(b"never sent"),
          Box::new(move |_| called.set(true)),
        )
        .unwrap();
    }
    client.close();
    server.close();
    event_loop.run().unwrap();
    assert!(!called.get());
  }

  #[test]
  fn connection_refused() {
    let (event_loop, net) = setup();
    let port = {
      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };
    let result = Rc::new(RefCell::new(None));
    let client = net.tcp();
    {
      let result = result.clone();
      client
        .connect("127.0.0.1", port, move |r| {
          *result.borrow_mut() = Some(r);
        })
        .unwrap();
    }
    event_loop.run().unwrap();
    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionRefused);
    assert_eq!(client.state(), TcpState::Failed);
    assert_eq!(event_loop.pins().count(), 0);
    client.close();
  }

  #[test]
  fn unresolvable_host() {
    let (event_loop, net) = setup();
    let result = Rc::new(RefCell::new(None));
    let client = net.tcp();
    {
      let result = result.clone();
      client
        .connect("no-such-host.invalid", 80, move |r| {
          *result.borrow_mut() = Some(r);
        })
        .unwrap();
    }
    event_loop.run().unwrap();
    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::HostNotFound);
    assert_eq!(err.errno(), -3008);
  }

  #[test]
  fn bind_address_in_use() {
    let (_event_loop, net) = setup();
    let first = net.tcp();
    first.bind("127.0.0.1", 0).unwrap();
    first.listen(16, |_| {}).unwrap();
    let port = first.sockname().unwrap().port();

    let second = net.tcp();
    let err = second.bind("127.0.0.1", port).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AddressInUse);
    first.close();
    second.close();
  }

  #[test]
  fn operations_need_a_connection() {
    let (_event_loop, net) = setup();
    let socket = net.tcp();
    let err = socket.read_start(Box::new(|_| {})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(socket.peername().is_err());
    socket.set_no_delay(true).unwrap();
    socket.close();
  }
}
