// Copyright 2018-2026 the Deno authors. MIT license.

use libz_sys::uInt;
use libz_sys::voidpf;

/// zlib allocator. A null return is reported by zlib as `Z_MEM_ERROR`.
pub unsafe extern "C" fn zalloc(
  _opaque: voidpf,
  items: uInt,
  size: uInt,
) -> voidpf {
  // SAFETY: calloc checks `items * size` for overflow.
  unsafe { libc::calloc(items as libc::size_t, size as libc::size_t) }
}

pub unsafe extern "C" fn zfree(_opaque: voidpf, address: voidpf) {
  // SAFETY: zlib only frees pointers obtained from `zalloc`.
  unsafe { libc::free(address) }
}
