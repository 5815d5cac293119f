// Copyright 2018-2026 the Deno authors. MIT license.

use std::ffi::CStr;
use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use libc::c_ulong;
use libz_sys::*;
use parking_lot::Mutex;
use skiff_core::ErrorCode;
use skiff_core::LoopHandle;
use skiff_core::OsError;

mod alloc;
pub mod mode;
mod stream;

pub use mode::Flush;
pub use mode::Mode;
pub use mode::ModeError;

use self::stream::StreamWrapper;

#[derive(Debug, thiserror::Error)]
pub enum ZlibError {
  #[error("zlib not initialized")]
  NotInitialized,
  #[error(transparent)]
  Mode(#[from] ModeError),
  #[error("{0}")]
  InvalidArgument(&'static str),
  #[error("{message}")]
  Stream { code: i32, message: String },
}

impl From<ZlibError> for OsError {
  fn from(err: ZlibError) -> Self {
    let code = match err {
      ZlibError::Stream { .. } => ErrorCode::Io,
      _ => ErrorCode::InvalidArgument,
    };
    OsError::with_message(code, err.to_string())
  }
}

#[inline]
fn check(condition: bool, msg: &'static str) -> Result<(), ZlibError> {
  if condition {
    Ok(())
  } else {
    Err(ZlibError::InvalidArgument(msg))
  }
}

/// Space left over after one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
  /// Input bytes not consumed.
  pub avail_in: u32,
  /// Output space not filled.
  pub avail_out: u32,
  /// The end of the compressed stream was reached.
  pub stream_end: bool,
}

struct ZlibInner {
  dictionary: Option<Vec<u8>>,
  err: i32,
  flush: Flush,
  init_done: bool,
  level: i32,
  mem_level: i32,
  mode: Mode,
  strategy: i32,
  window_bits: i32,
  write_in_progress: bool,
  pending_close: bool,
  gzip_id_bytes_read: u32,
  strm: StreamWrapper,
}

const GZIP_HEADER_ID1: u8 = 0x1f;
const GZIP_HEADER_ID2: u8 = 0x8b;

impl ZlibInner {
  fn new(mode: Mode) -> Self {
    Self {
      dictionary: None,
      err: Z_OK,
      flush: Flush::None,
      init_done: false,
      level: 0,
      mem_level: 0,
      mode,
      strategy: 0,
      window_bits: 0,
      write_in_progress: false,
      pending_close: false,
      gzip_id_bytes_read: 0,
      strm: StreamWrapper::default(),
    }
  }

  fn begin_write(&mut self) -> Result<(), ZlibError> {
    check(self.init_done, "write before init")?;
    check(!self.write_in_progress, "write already in progress")?;
    check(!self.pending_close, "close already in progress")?;
    self.write_in_progress = true;
    Ok(())
  }

  fn set_buffers(
    &mut self,
    input: &[u8],
    in_off: u32,
    in_len: u32,
    out: &mut [u8],
    out_off: u32,
    out_len: u32,
  ) -> Result<(), ZlibError> {
    let in_end = (in_off as usize).checked_add(in_len as usize);
    let next_in = in_end
      .and_then(|end| input.get(in_off as usize..end))
      .ok_or(ZlibError::InvalidArgument("invalid input range"))?
      .as_ptr() as *mut _;
    let out_end = (out_off as usize).checked_add(out_len as usize);
    let next_out = out_end
      .and_then(|end| out.get_mut(out_off as usize..end))
      .ok_or(ZlibError::InvalidArgument("invalid output range"))?
      .as_mut_ptr();

    self.strm.avail_in = in_len;
    self.strm.next_in = next_in;
    self.strm.avail_out = out_len;
    self.strm.next_out = next_out;
    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  fn start_write(
    &mut self,
    input: &[u8],
    in_off: u32,
    in_len: u32,
    out: &mut [u8],
    out_off: u32,
    out_len: u32,
    flush: Flush,
  ) -> Result<(), ZlibError> {
    self.begin_write()?;
    if let Err(err) =
      self.set_buffers(input, in_off, in_len, out, out_off, out_len)
    {
      self.write_in_progress = false;
      return Err(err);
    }
    self.flush = flush;
    Ok(())
  }

  /// Runs the codec over the buffers installed by `set_buffers`. The
  /// buffers are forgotten before returning.
  fn do_write(&mut self, flush: Flush) -> Result<WriteResult, ZlibError> {
    self.flush = flush;
    let sniffed = self.sniff_gzip();
    if let Err(err) = sniffed {
      self.strm.clear_buffers();
      return Err(err);
    }

    match self.mode {
      Mode::Deflate | Mode::Gzip | Mode::DeflateRaw => {
        self.err = self.strm.deflate(flush);
      }
      // Unzip is still reading the gzip magic bytes.
      Mode::Inflate | Mode::Gunzip | Mode::InflateRaw | Mode::Unzip => {
        self.err = self.strm.inflate(flush);
        if let (Z_NEED_DICT, Some(dictionary)) = (self.err, &self.dictionary)
        {
          self.err = self.strm.inflate_set_dictionary(dictionary);
          if self.err == Z_OK {
            self.err = self.strm.inflate(flush);
          } else if self.err == Z_DATA_ERROR {
            self.err = Z_NEED_DICT;
          }
        }

        // Concatenated gzip members.
        while self.strm.avail_in > 0
          && self.mode == Mode::Gunzip
          && self.err == Z_STREAM_END
          // SAFETY: `next_in` points at `avail_in` readable bytes.
          && unsafe { *self.strm.next_in } != 0x00
        {
          self.err = self.strm.reset(self.mode);
          self.err = self.strm.inflate(flush);
        }
      }
      Mode::None => {}
    }

    let done = self.strm.avail_out != 0 && self.flush == Flush::Finish;
    // Output space ran out before the stream did.
    if self.err == Z_BUF_ERROR && !done {
      self.err = Z_OK;
    }

    let result = WriteResult {
      avail_in: self.strm.avail_in,
      avail_out: self.strm.avail_out,
      stream_end: self.err == Z_STREAM_END,
    };
    let checked = self.check_error();
    self.strm.clear_buffers();
    checked.map(|_| result)
  }

  /// Decides between gzip and zlib framing for `Mode::Unzip` from the
  /// first two input bytes, which may arrive in separate writes.
  fn sniff_gzip(&mut self) -> Result<(), ZlibError> {
    if self.mode != Mode::Unzip || self.strm.avail_in == 0 {
      return Ok(());
    }
    // SAFETY: `next_in` points at `avail_in` readable bytes installed by
    // `set_buffers`.
    let input = unsafe {
      let len = self.strm.avail_in as usize;
      std::slice::from_raw_parts(self.strm.next_in, len)
    };

    let mut next_expected_header_byte = Some(0);
    if self.gzip_id_bytes_read == 0 {
      if input[0] == GZIP_HEADER_ID1 {
        self.gzip_id_bytes_read = 1;
        next_expected_header_byte = Some(1);
        if input.len() == 1 {
          return Ok(());
        }
      } else {
        self.mode = Mode::Inflate;
        return Ok(());
      }
    }

    if self.gzip_id_bytes_read == 1 {
      let Some(byte) = next_expected_header_byte.and_then(|i| input.get(i))
      else {
        return Ok(());
      };
      if *byte == GZIP_HEADER_ID2 {
        self.gzip_id_bytes_read = 2;
        self.mode = Mode::Gunzip;
      } else {
        self.mode = Mode::Inflate;
      }
      Ok(())
    } else {
      Err(ZlibError::InvalidArgument(
        "invalid number of gzip magic number bytes read",
      ))
    }
  }

  fn check_error(&self) -> Result<(), ZlibError> {
    let message = match self.err {
      Z_OK | Z_STREAM_END => return Ok(()),
      Z_BUF_ERROR => "unexpected end of file".to_string(),
      Z_NEED_DICT if self.dictionary.is_none() => {
        "Missing dictionary".to_string()
      }
      Z_NEED_DICT => "Bad dictionary".to_string(),
      _ => self.message().unwrap_or_else(|| "Zlib error".to_string()),
    };
    Err(ZlibError::Stream {
      code: self.err,
      message,
    })
  }

  fn message(&self) -> Option<String> {
    let msg = self.strm.msg;
    if msg.is_null() {
      return None;
    }
    // SAFETY: zlib only stores static, nul-terminated messages in `msg`.
    let msg = unsafe { CStr::from_ptr(msg) };
    Some(msg.to_string_lossy().into_owned())
  }

  fn init_stream(&mut self) -> Result<(), ZlibError> {
    match self.mode {
      Mode::Gzip | Mode::Gunzip => self.window_bits += 16,
      Mode::Unzip => self.window_bits += 32,
      Mode::DeflateRaw | Mode::InflateRaw => self.window_bits *= -1,
      _ => {}
    }

    self.err = match self.mode {
      Mode::Deflate | Mode::Gzip | Mode::DeflateRaw => self.strm.deflate_init(
        self.level,
        self.window_bits,
        self.mem_level,
        self.strategy,
      ),
      Mode::Inflate | Mode::Gunzip | Mode::InflateRaw | Mode::Unzip => {
        self.strm.inflate_init(self.window_bits)
      }
      Mode::None => return Err(ZlibError::InvalidArgument("Unknown mode")),
    };
    if self.err != Z_OK {
      self.mode = Mode::None;
      return Err(ZlibError::Stream {
        code: self.err,
        message: "Init error".to_string(),
      });
    }

    self.write_in_progress = false;
    self.init_done = true;
    self.set_dictionary()
  }

  /// Deflate and raw inflate take the dictionary up front. zlib inflate
  /// asks for it with `Z_NEED_DICT` instead.
  fn set_dictionary(&mut self) -> Result<(), ZlibError> {
    let Some(dictionary) = &self.dictionary else {
      return Ok(());
    };
    self.err = match self.mode {
      Mode::Deflate | Mode::DeflateRaw => {
        self.strm.deflate_set_dictionary(dictionary)
      }
      Mode::InflateRaw => self.strm.inflate_set_dictionary(dictionary),
      _ => Z_OK,
    };
    if self.err != Z_OK {
      return Err(ZlibError::Stream {
        code: self.err,
        message: "Failed to set dictionary".to_string(),
      });
    }
    Ok(())
  }

  fn close(&mut self) -> Result<bool, ZlibError> {
    if self.write_in_progress {
      self.pending_close = true;
      return Ok(false);
    }

    self.pending_close = false;
    check(self.init_done, "close before init")?;

    self.strm.end(self.mode);
    self.mode = Mode::None;
    Ok(true)
  }

  fn reset_stream(&mut self) -> Result<(), ZlibError> {
    check(self.init_done, "reset before init")?;
    check(!self.write_in_progress, "write already in progress")?;
    self.err = self.strm.reset(self.mode);
    self.gzip_id_bytes_read = 0;
    if self.err != Z_OK {
      return Err(ZlibError::Stream {
        code: self.err,
        message: "Failed to reset stream".to_string(),
      });
    }
    self.set_dictionary()
  }

  fn params(&mut self, level: i32, strategy: i32) -> Result<(), ZlibError> {
    check(self.init_done, "params before init")?;
    check(!self.write_in_progress, "write already in progress")?;
    self.err = match self.mode {
      Mode::Deflate | Mode::DeflateRaw => {
        self.strm.deflate_params(level, strategy)
      }
      _ => Z_OK,
    };
    if self.err != Z_OK && self.err != Z_BUF_ERROR {
      return Err(ZlibError::Stream {
        code: self.err,
        message: "Failed to set parameters".to_string(),
      });
    }
    self.level = level;
    self.strategy = strategy;
    Ok(())
  }
}

impl Drop for ZlibInner {
  fn drop(&mut self) {
    if self.init_done && self.mode != Mode::None {
      self.strm.end(self.mode);
    }
  }
}

fn check_level(level: i32) -> Result<(), ZlibError> {
  check((-1..=9).contains(&level), "invalid level")
}

fn check_strategy(strategy: i32) -> Result<(), ZlibError> {
  check(
    strategy == Z_DEFAULT_STRATEGY
      || strategy == Z_FILTERED
      || strategy == Z_HUFFMAN_ONLY
      || strategy == Z_RLE
      || strategy == Z_FIXED,
    "invalid strategy",
  )
}

/// Where the stream lives. While a [`Zlib::write_async`] runs, the
/// stream is owned by the worker and only the close request stays here.
enum Slot {
  Idle(ZlibInner),
  Busy { pending_close: bool },
  Closed,
}

/// An incremental zlib, gzip or raw deflate transform.
///
/// Writes are synchronous and bounded by the buffers handed in; callers
/// chunk large payloads or use [`Zlib::write_async`] to move one chunk
/// onto the worker pool.
#[derive(Clone)]
pub struct Zlib {
  slot: Arc<Mutex<Slot>>,
}

impl std::fmt::Debug for Zlib {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let (mode, busy) = match &*self.slot.lock() {
      Slot::Idle(zlib) => (Some(zlib.mode), false),
      Slot::Busy { .. } => (None, true),
      Slot::Closed => (None, false),
    };
    f.debug_struct("Zlib")
      .field("mode", &mode)
      .field("busy", &busy)
      .finish()
  }
}

/// Outcome of [`Zlib::write_async`]. `output` holds only the bytes
/// produced.
#[derive(Debug)]
pub struct AsyncWrite {
  pub result: WriteResult,
  pub output: BytesMut,
}

impl Zlib {
  pub fn new(mode: Mode) -> Self {
    Self {
      slot: Arc::new(Mutex::new(Slot::Idle(ZlibInner::new(mode)))),
    }
  }

  pub fn from_raw_mode(mode: i32) -> Result<Self, ZlibError> {
    Ok(Self::new(Mode::try_from(mode)?))
  }

  fn with_stream<T>(
    &self,
    f: impl FnOnce(&mut ZlibInner) -> Result<T, ZlibError>,
  ) -> Result<T, ZlibError> {
    match &mut *self.slot.lock() {
      Slot::Idle(zlib) => f(zlib),
      Slot::Busy { .. } => {
        Err(ZlibError::InvalidArgument("write already in progress"))
      }
      Slot::Closed => Err(ZlibError::NotInitialized),
    }
  }

  pub fn init(
    &self,
    window_bits: i32,
    level: i32,
    mem_level: i32,
    strategy: i32,
    dictionary: Option<&[u8]>,
  ) -> Result<(), ZlibError> {
    self.with_stream(|zlib| {
      check(!zlib.init_done, "already initialized")?;
      check((8..=15).contains(&window_bits), "invalid windowBits")?;
      check_level(level)?;
      check((1..=9).contains(&mem_level), "invalid memLevel")?;
      check_strategy(strategy)?;

      zlib.level = level;
      zlib.window_bits = window_bits;
      zlib.mem_level = mem_level;
      zlib.strategy = strategy;
      zlib.flush = Flush::None;
      zlib.err = Z_OK;
      zlib.dictionary = dictionary
        .filter(|dictionary| !dictionary.is_empty())
        .map(|dictionary| dictionary.to_vec());

      log::debug!(
        "zlib init mode={:?} window_bits={} level={}",
        zlib.mode,
        window_bits,
        level
      );
      zlib.init_stream()
    })
  }

  /// Feeds `input[in_off..in_off + in_len]` and fills at most
  /// `out[out_off..out_off + out_len]`.
  #[allow(clippy::too_many_arguments)]
  pub fn write(
    &self,
    flush: Flush,
    input: &[u8],
    in_off: u32,
    in_len: u32,
    out: &mut [u8],
    out_off: u32,
    out_len: u32,
  ) -> Result<WriteResult, ZlibError> {
    self.with_stream(|zlib| {
      zlib.start_write(input, in_off, in_len, out, out_off, out_len, flush)?;
      let result = zlib.do_write(flush);
      zlib.write_in_progress = false;
      result
    })
  }

  /// Runs one write on the worker pool, which owns the stream until the
  /// write completes. A `close` made meanwhile is applied before `cb`
  /// runs; other operations fail with "write already in progress".
  pub fn write_async(
    &self,
    loop_handle: &LoopHandle,
    flush: Flush,
    input: bytes::Bytes,
    mut out: BytesMut,
    cb: impl FnOnce(Result<AsyncWrite, ZlibError>) + 'static,
  ) {
    let taken = {
      let mut slot = self.slot.lock();
      match mem::replace(&mut *slot, Slot::Busy {
        pending_close: false,
      }) {
        Slot::Idle(mut zlib) => match zlib.begin_write() {
          Ok(()) => Ok(zlib),
          Err(err) => {
            *slot = Slot::Idle(zlib);
            Err(err)
          }
        },
        other => {
          let err = match other {
            Slot::Closed => ZlibError::NotInitialized,
            _ => ZlibError::InvalidArgument("write already in progress"),
          };
          *slot = other;
          Err(err)
        }
      }
    };
    let mut zlib = match taken {
      Ok(zlib) => zlib,
      Err(err) => {
        loop_handle.enqueue("zlib.write", move || cb(Err(err)));
        return;
      }
    };

    let this = self.clone();
    loop_handle.spawn_blocking(
      "zlib.write",
      move || {
        let out_len = out.len() as u32;
        let in_len = input.len() as u32;
        let result = zlib
          .set_buffers(&input, 0, in_len, &mut out, 0, out_len)
          .and_then(|()| zlib.do_write(flush));
        zlib.write_in_progress = false;
        let written = result.map(|result| {
          out.truncate((out_len - result.avail_out) as usize);
          AsyncWrite {
            result,
            output: out,
          }
        });
        (zlib, written)
      },
      move |result| match result {
        Ok((zlib, written)) => {
          this.finish_async(Some(zlib));
          cb(written)
        }
        Err(err) => {
          this.finish_async(None);
          cb(Err(ZlibError::Stream {
            code: Z_ERRNO,
            message: err.message().to_string(),
          }))
        }
      },
    );
  }

  /// Puts the stream back after an async write, closing it if `close` was
  /// called meanwhile. `None` means the worker lost the stream.
  fn finish_async(&self, zlib: Option<ZlibInner>) {
    let mut slot = self.slot.lock();
    let pending_close = matches!(*slot, Slot::Busy {
      pending_close: true
    });
    *slot = match zlib {
      Some(mut zlib) if pending_close => {
        let _ = zlib.close();
        log::debug!("zlib closed after the pending write");
        Slot::Closed
      }
      Some(zlib) => Slot::Idle(zlib),
      None => {
        log::error!("zlib stream lost by a failed worker job");
        Slot::Closed
      }
    };
  }

  pub fn reset(&self) -> Result<(), ZlibError> {
    self.with_stream(|zlib| zlib.reset_stream())
  }

  pub fn params(&self, level: i32, strategy: i32) -> Result<(), ZlibError> {
    check_level(level)?;
    check_strategy(strategy)?;
    self.with_stream(|zlib| zlib.params(level, strategy))
  }

  /// Returns `false` when an async write is in progress; the stream is
  /// then closed as soon as that write completes.
  pub fn close(&self) -> Result<bool, ZlibError> {
    let mut slot = self.slot.lock();
    match &mut *slot {
      Slot::Idle(zlib) => {
        if !zlib.close()? {
          return Ok(false);
        }
      }
      Slot::Busy { pending_close } => {
        *pending_close = true;
        log::debug!("zlib close deferred until the write completes");
        return Ok(false);
      }
      Slot::Closed => return Err(ZlibError::NotInitialized),
    }
    *slot = Slot::Closed;
    Ok(true)
  }

  /// The message zlib attached to the last failure, if any.
  pub fn error_message(&self) -> Result<Option<String>, ZlibError> {
    self.with_stream(|zlib| Ok(zlib.message()))
  }
}

pub fn crc32(data: &[u8], value: u32) -> u32 {
  // SAFETY: `data` is a valid buffer of `data.len()` bytes.
  unsafe {
    libz_sys::crc32(value as c_ulong, data.as_ptr(), data.len() as u32) as u32
  }
}
