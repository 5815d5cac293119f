// Copyright 2018-2026 the Deno authors. MIT license.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;

/// The closed set of error codes surfaced to guest code. Synchronous calls
/// return them as `Err`, asynchronous calls pass the same value to their
/// completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  NotFound,
  AlreadyExists,
  BadDescriptor,
  IsADirectory,
  NotADirectory,
  Interrupted,
  Io,
  InvalidArgument,
  ConnectionRefused,
  AddressInUse,
  HostNotFound,
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorCode::NotFound => "ENOENT",
      ErrorCode::AlreadyExists => "EEXIST",
      ErrorCode::BadDescriptor => "EBADF",
      ErrorCode::IsADirectory => "EISDIR",
      ErrorCode::NotADirectory => "ENOTDIR",
      ErrorCode::Interrupted => "EINTR",
      ErrorCode::Io => "EIO",
      ErrorCode::InvalidArgument => "EINVAL",
      ErrorCode::ConnectionRefused => "ECONNREFUSED",
      ErrorCode::AddressInUse => "EADDRINUSE",
      ErrorCode::HostNotFound => "ENOTFOUND",
    }
  }

  /// Negative errno as reported to scripts.
  pub fn errno(&self) -> i32 {
    match self {
      ErrorCode::NotFound => -2,
      ErrorCode::AlreadyExists => -17,
      ErrorCode::BadDescriptor => -9,
      ErrorCode::IsADirectory => -21,
      ErrorCode::NotADirectory => -20,
      ErrorCode::Interrupted => -4,
      ErrorCode::Io => -5,
      ErrorCode::InvalidArgument => -22,
      ErrorCode::ConnectionRefused => -61,
      ErrorCode::AddressInUse => -48,
      // getaddrinfo failures have no errno, use the uv code
      ErrorCode::HostNotFound => -3008,
    }
  }

  fn default_message(&self) -> &'static str {
    match self {
      ErrorCode::NotFound => "no such file or directory",
      ErrorCode::AlreadyExists => "file already exists",
      ErrorCode::BadDescriptor => "bad file descriptor",
      ErrorCode::IsADirectory => "illegal operation on a directory",
      ErrorCode::NotADirectory => "not a directory",
      ErrorCode::Interrupted => "interrupted system call",
      ErrorCode::Io => "i/o error",
      ErrorCode::InvalidArgument => "invalid argument",
      ErrorCode::ConnectionRefused => "connection refused",
      ErrorCode::AddressInUse => "address already in use",
      ErrorCode::HostNotFound => "host not found",
    }
  }

  #[cfg(unix)]
  fn from_raw_os_error(errno: i32) -> Option<Self> {
    let code = match errno {
      libc::ENOENT => ErrorCode::NotFound,
      libc::EEXIST => ErrorCode::AlreadyExists,
      libc::EBADF => ErrorCode::BadDescriptor,
      libc::EISDIR => ErrorCode::IsADirectory,
      libc::ENOTDIR => ErrorCode::NotADirectory,
      libc::EINTR => ErrorCode::Interrupted,
      libc::EINVAL => ErrorCode::InvalidArgument,
      libc::ECONNREFUSED => ErrorCode::ConnectionRefused,
      libc::EADDRINUSE => ErrorCode::AddressInUse,
      _ => return None,
    };
    Some(code)
  }

  #[cfg(not(unix))]
  fn from_raw_os_error(_errno: i32) -> Option<Self> {
    None
  }

  fn from_io_kind(kind: io::ErrorKind) -> Self {
    match kind {
      io::ErrorKind::NotFound => ErrorCode::NotFound,
      io::ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
      io::ErrorKind::IsADirectory => ErrorCode::IsADirectory,
      io::ErrorKind::NotADirectory => ErrorCode::NotADirectory,
      io::ErrorKind::Interrupted => ErrorCode::Interrupted,
      io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
      io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
      io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
      _ => ErrorCode::Io,
    }
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The resource an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
  Path(PathBuf),
  Fd(u32),
  Host(String),
}

impl fmt::Display for ErrorContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorContext::Path(path) => write!(f, "'{}'", path.display()),
      ErrorContext::Fd(fd) => write!(f, "fd {fd}"),
      ErrorContext::Host(host) => f.write_str(host),
    }
  }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}{}", format_suffix(.syscall, .context))]
pub struct OsError {
  code: ErrorCode,
  message: Cow<'static, str>,
  syscall: Option<&'static str>,
  context: Option<ErrorContext>,
}

fn format_suffix(
  syscall: &Option<&'static str>,
  context: &Option<ErrorContext>,
) -> String {
  match (syscall, context) {
    (Some(syscall), Some(context)) => format!(", {syscall} {context}"),
    (Some(syscall), None) => format!(", {syscall}"),
    (None, Some(context)) => format!(", {context}"),
    (None, None) => String::new(),
  }
}

impl OsError {
  pub fn new(code: ErrorCode) -> Self {
    Self {
      code,
      message: Cow::Borrowed(code.default_message()),
      syscall: None,
      context: None,
    }
  }

  pub fn with_message(
    code: ErrorCode,
    message: impl Into<Cow<'static, str>>,
  ) -> Self {
    Self {
      code,
      message: message.into(),
      syscall: None,
      context: None,
    }
  }

  pub fn not_found() -> Self {
    Self::new(ErrorCode::NotFound)
  }

  pub fn bad_descriptor(fd: u32) -> Self {
    Self::new(ErrorCode::BadDescriptor).fd(fd)
  }

  pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
    Self::with_message(ErrorCode::InvalidArgument, message)
  }

  pub fn syscall(mut self, syscall: &'static str) -> Self {
    self.syscall = Some(syscall);
    self
  }

  pub fn path(mut self, path: impl AsRef<Path>) -> Self {
    self.context = Some(ErrorContext::Path(path.as_ref().to_path_buf()));
    self
  }

  pub fn fd(mut self, fd: u32) -> Self {
    self.context = Some(ErrorContext::Fd(fd));
    self
  }

  pub fn host(mut self, host: impl Into<String>) -> Self {
    self.context = Some(ErrorContext::Host(host.into()));
    self
  }

  pub fn code(&self) -> ErrorCode {
    self.code
  }

  pub fn errno(&self) -> i32 {
    self.code.errno()
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn context(&self) -> Option<&ErrorContext> {
    self.context.as_ref()
  }

  pub fn syscall_name(&self) -> Option<&'static str> {
    self.syscall
  }
}

impl From<io::Error> for OsError {
  fn from(err: io::Error) -> Self {
    let code = err
      .raw_os_error()
      .and_then(ErrorCode::from_raw_os_error)
      .unwrap_or_else(|| ErrorCode::from_io_kind(err.kind()));
    match code {
      // keep the OS wording for anything we fold into EIO
      ErrorCode::Io => Self::with_message(code, err.to_string()),
      _ => Self::new(code),
    }
  }
}

impl From<ErrorCode> for OsError {
  fn from(code: ErrorCode) -> Self {
    Self::new(code)
  }
}

pub type OsResult<T> = Result<T, OsError>;
