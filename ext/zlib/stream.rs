// Copyright 2018-2026 the Deno authors. MIT license.

use std::ffi::c_int;
use std::mem;
use std::ops::Deref;
use std::ops::DerefMut;
use std::ptr;

use libz_sys as zlib;
use libz_sys::z_stream;

use crate::alloc::zalloc;
use crate::alloc::zfree;
use crate::mode::Flush;
use crate::mode::Mode;

/// Owns one zlib stream. zlib keeps a pointer back to the `z_stream`, so it
/// is boxed and never moves after init.
pub struct StreamWrapper {
  strm: Box<z_stream>,
}

// SAFETY: the zlib state is owned by this wrapper alone. `next_in` and
// `next_out` only point at caller buffers for the duration of one write.
unsafe impl Send for StreamWrapper {}

impl Default for StreamWrapper {
  fn default() -> Self {
    Self {
      strm: Box::new(z_stream {
        next_in: ptr::null_mut(),
        avail_in: 0,
        total_in: 0,
        next_out: ptr::null_mut(),
        avail_out: 0,
        total_out: 0,
        msg: ptr::null_mut(),
        state: ptr::null_mut(),
        zalloc,
        zfree,
        opaque: ptr::null_mut(),
        data_type: 0,
        adler: 0,
        reserved: 0,
      }),
    }
  }
}

impl Deref for StreamWrapper {
  type Target = z_stream;

  fn deref(&self) -> &Self::Target {
    &self.strm
  }
}

impl DerefMut for StreamWrapper {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.strm
  }
}

const STREAM_SIZE: c_int = mem::size_of::<z_stream>() as c_int;

impl StreamWrapper {
  pub fn deflate_init(
    &mut self,
    level: c_int,
    window_bits: c_int,
    mem_level: c_int,
    strategy: c_int,
  ) -> c_int {
    // SAFETY: `self.strm` is a valid, pinned z_stream.
    unsafe {
      zlib::deflateInit2_(
        &mut *self.strm,
        level,
        zlib::Z_DEFLATED,
        window_bits,
        mem_level,
        strategy,
        zlib::zlibVersion(),
        STREAM_SIZE,
      )
    }
  }

  pub fn inflate_init(&mut self, window_bits: c_int) -> c_int {
    // SAFETY: `self.strm` is a valid, pinned z_stream.
    unsafe {
      zlib::inflateInit2_(
        &mut *self.strm,
        window_bits,
        zlib::zlibVersion(),
        STREAM_SIZE,
      )
    }
  }

  pub fn deflate(&mut self, flush: Flush) -> c_int {
    // SAFETY: `self.strm` is initialized and its buffers are set.
    unsafe { zlib::deflate(&mut *self.strm, flush as _) }
  }

  pub fn inflate(&mut self, flush: Flush) -> c_int {
    // SAFETY: `self.strm` is initialized and its buffers are set.
    unsafe { zlib::inflate(&mut *self.strm, flush as _) }
  }

  pub fn end(&mut self, mode: Mode) {
    // SAFETY: `self.strm` was initialized for `mode`.
    unsafe {
      if mode.is_deflate() {
        zlib::deflateEnd(&mut *self.strm);
      } else if mode.is_inflate() {
        zlib::inflateEnd(&mut *self.strm);
      }
    }
  }

  pub fn reset(&mut self, mode: Mode) -> c_int {
    // SAFETY: `self.strm` was initialized for `mode`.
    unsafe {
      if mode.is_deflate() {
        zlib::deflateReset(&mut *self.strm)
      } else if mode.is_inflate() {
        zlib::inflateReset(&mut *self.strm)
      } else {
        zlib::Z_OK
      }
    }
  }

  pub fn deflate_set_dictionary(&mut self, dictionary: &[u8]) -> c_int {
    // SAFETY: `dictionary` outlives the call; zlib copies it.
    unsafe {
      zlib::deflateSetDictionary(
        &mut *self.strm,
        dictionary.as_ptr(),
        dictionary.len() as _,
      )
    }
  }

  pub fn inflate_set_dictionary(&mut self, dictionary: &[u8]) -> c_int {
    // SAFETY: `dictionary` outlives the call; zlib copies it.
    unsafe {
      zlib::inflateSetDictionary(
        &mut *self.strm,
        dictionary.as_ptr(),
        dictionary.len() as _,
      )
    }
  }

  pub fn deflate_params(&mut self, level: c_int, strategy: c_int) -> c_int {
    // SAFETY: `self.strm` is an initialized deflate stream.
    unsafe { zlib::deflateParams(&mut *self.strm, level, strategy) }
  }

  /// Forget the caller buffers of the last write.
  pub fn clear_buffers(&mut self) {
    self.strm.next_in = ptr::null_mut();
    self.strm.avail_in = 0;
    self.strm.next_out = ptr::null_mut();
    self.strm.avail_out = 0;
  }
}
