// Copyright 2018-2026 the Deno authors. MIT license.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// Caller-visible descriptor.
pub type Fd = u32;

// POSIX open(2) flags as scripts pass them.
#[cfg(unix)]
pub mod flags {
  pub const O_RDONLY: i32 = libc::O_RDONLY;
  pub const O_WRONLY: i32 = libc::O_WRONLY;
  pub const O_RDWR: i32 = libc::O_RDWR;
  pub const O_ACCMODE: i32 = libc::O_ACCMODE;
  pub const O_CREAT: i32 = libc::O_CREAT;
  pub const O_EXCL: i32 = libc::O_EXCL;
  pub const O_TRUNC: i32 = libc::O_TRUNC;
  pub const O_APPEND: i32 = libc::O_APPEND;
  pub const O_SYNC: i32 = libc::O_SYNC;
  pub const O_DSYNC: i32 = libc::O_DSYNC;
}

#[cfg(not(unix))]
pub mod flags {
  pub const O_RDONLY: i32 = 0;
  pub const O_WRONLY: i32 = 1;
  pub const O_RDWR: i32 = 2;
  pub const O_ACCMODE: i32 = 3;
  pub const O_CREAT: i32 = 0o100;
  pub const O_EXCL: i32 = 0o200;
  pub const O_TRUNC: i32 = 0o1000;
  pub const O_APPEND: i32 = 0o2000;
  pub const O_SYNC: i32 = 0o4010000;
  pub const O_DSYNC: i32 = 0o10000;
}

#[derive(Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct OpenOptions {
  pub read: bool,
  pub write: bool,
  pub create: bool,
  pub truncate: bool,
  pub append: bool,
  pub create_new: bool,
  pub sync: bool,
  pub mode: Option<u32>,
}

impl OpenOptions {
  /// Decode open(2) style flags.
  pub fn from_flags(open_flags: i32, mode: u32) -> Self {
    use flags::*;
    let (read, write) = match open_flags & O_ACCMODE {
      O_WRONLY => (false, true),
      O_RDWR => (true, true),
      _ => (true, false),
    };
    let create = open_flags & O_CREAT != 0;
    Self {
      read,
      write,
      create,
      create_new: create && open_flags & O_EXCL != 0,
      truncate: open_flags & O_TRUNC != 0,
      append: open_flags & O_APPEND != 0,
      sync: open_flags & (O_SYNC | O_DSYNC) != 0,
      mode: Some(mode),
    }
  }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FsStat {
  pub is_file: bool,
  pub is_directory: bool,
  pub is_symlink: bool,
  pub size: u64,

  pub mtime: Option<u64>,
  pub atime: Option<u64>,
  pub ctime: Option<u64>,
  pub birthtime: Option<u64>,

  pub dev: u64,
  pub ino: u64,
  pub mode: u32,
  pub nlink: u64,
  pub uid: u32,
  pub gid: u32,
}

impl FsStat {
  pub fn from_std(metadata: std::fs::Metadata) -> Self {
    macro_rules! unix_or_zero {
      ($member:ident) => {{
        #[cfg(unix)]
        {
          use std::os::unix::fs::MetadataExt;
          metadata.$member()
        }
        #[cfg(not(unix))]
        {
          0
        }
      }};
    }

    #[inline(always)]
    fn to_msec(maybe_time: Result<SystemTime, std::io::Error>) -> Option<u64> {
      match maybe_time {
        Ok(time) => Some(
          time
            .duration_since(UNIX_EPOCH)
            .map(|t| t.as_millis() as u64)
            .unwrap_or_else(|err| err.duration().as_millis() as u64),
        ),
        Err(_) => None,
      }
    }

    #[cfg(unix)]
    let ctime = {
      use std::os::unix::fs::MetadataExt;
      let secs = metadata.ctime();
      let nsecs = metadata.ctime_nsec();
      u64::try_from(secs)
        .ok()
        .map(|secs| secs * 1000 + (nsecs as u64) / 1_000_000)
    };
    #[cfg(not(unix))]
    let ctime = to_msec(metadata.modified());

    Self {
      is_file: metadata.is_file(),
      is_directory: metadata.is_dir(),
      is_symlink: metadata.file_type().is_symlink(),
      size: metadata.len(),

      mtime: to_msec(metadata.modified()),
      atime: to_msec(metadata.accessed()),
      ctime,
      birthtime: to_msec(metadata.created()),

      dev: unix_or_zero!(dev),
      ino: unix_or_zero!(ino),
      mode: unix_or_zero!(mode),
      nlink: unix_or_zero!(nlink),
      uid: unix_or_zero!(uid),
      gid: unix_or_zero!(gid),
    }
  }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FsDirEntry {
  pub name: String,
  pub is_file: bool,
  pub is_directory: bool,
  pub is_symlink: bool,
}

#[cfg(test)]
mod tests {
  use super::flags::*;
  use super::*;

  #[test]
  fn decodes_flags() {
    let options =
      OpenOptions::from_flags(O_WRONLY | O_CREAT | O_EXCL, 0o600);
    assert!(options.write);
    assert!(!options.read);
    assert!(options.create_new);
    assert_eq!(options.mode, Some(0o600));

    let options = OpenOptions::from_flags(O_RDWR | O_APPEND, 0o666);
    assert!(options.read && options.write && options.append);
    assert!(!options.create);

    let options = OpenOptions::from_flags(O_RDONLY, 0);
    assert_eq!(options.read, true);
    assert_eq!(options.write, false);
  }

  #[test]
  fn excl_without_creat_is_ignored() {
    let options = OpenOptions::from_flags(O_RDONLY | O_EXCL, 0);
    assert!(!options.create_new);
  }
}
