// Copyright 2018-2026 the Deno authors. MIT license.

#![allow(clippy::disallowed_methods)]

use std::fs;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;

use crate::interface::FsDirEntry;
use crate::interface::OpenOptions;

pub fn open_options(options: OpenOptions) -> fs::OpenOptions {
  let mut open_options = fs::OpenOptions::new();
  // mode only applies when the file is created, 0o666 before umask otherwise
  #[cfg(unix)]
  {
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(mode) = options.mode {
      open_options.mode(mode & 0o777);
    }
    if options.sync {
      open_options.custom_flags(libc::O_SYNC);
    }
  }
  open_options.read(options.read);
  open_options.create(options.create);
  open_options.write(options.write);
  open_options.truncate(options.truncate);
  open_options.append(options.append);
  open_options.create_new(options.create_new);
  open_options
}

pub fn mkdir(path: &Path, recursive: bool, mode: u32) -> io::Result<()> {
  let mut builder = fs::DirBuilder::new();
  builder.recursive(recursive);
  #[cfg(unix)]
  {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(mode);
  }
  #[cfg(not(unix))]
  {
    _ = mode;
  }
  builder.create(path)
}

#[cfg(unix)]
fn permissions(mode: u32, _current: fs::Permissions) -> fs::Permissions {
  use std::os::unix::fs::PermissionsExt;
  fs::Permissions::from_mode(mode)
}

#[cfg(not(unix))]
fn permissions(mode: u32, mut current: fs::Permissions) -> fs::Permissions {
  current.set_readonly(mode & 0o222 == 0);
  current
}

pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
  let current = fs::metadata(path)?.permissions();
  fs::set_permissions(path, permissions(mode, current))
}

pub fn fchmod(file: &File, mode: u32) -> io::Result<()> {
  let current = file.metadata()?.permissions();
  file.set_permissions(permissions(mode, current))
}

#[cfg(unix)]
pub fn chown(
  path: &Path,
  uid: Option<u32>,
  gid: Option<u32>,
) -> io::Result<()> {
  use nix::unistd::Gid;
  use nix::unistd::Uid;
  let owner = uid.map(Uid::from_raw);
  let group = gid.map(Gid::from_raw);
  nix::unistd::chown(path, owner, group)
    .map_err(|err| io::Error::from_raw_os_error(err as i32))
}

#[cfg(not(unix))]
pub fn chown(
  _path: &Path,
  _uid: Option<u32>,
  _gid: Option<u32>,
) -> io::Result<()> {
  Err(io::ErrorKind::Unsupported.into())
}

#[cfg(unix)]
pub fn fchown(
  file: &File,
  uid: Option<u32>,
  gid: Option<u32>,
) -> io::Result<()> {
  std::os::unix::fs::fchown(file, uid, gid)
}

#[cfg(not(unix))]
pub fn fchown(
  _file: &File,
  _uid: Option<u32>,
  _gid: Option<u32>,
) -> io::Result<()> {
  Err(io::ErrorKind::Unsupported.into())
}

/// Milliseconds since the epoch, negative before it.
fn file_time(msec: i64) -> filetime::FileTime {
  let secs = msec.div_euclid(1000);
  let nanos = (msec.rem_euclid(1000) * 1_000_000) as u32;
  filetime::FileTime::from_unix_time(secs, nanos)
}

pub fn utimes(path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
  filetime::set_file_times(path, file_time(atime), file_time(mtime))
}

pub fn futimes(file: &File, atime: i64, mtime: i64) -> io::Result<()> {
  filetime::set_file_handle_times(
    file,
    Some(file_time(atime)),
    Some(file_time(mtime)),
  )
}

pub fn read_dir(path: &Path) -> io::Result<Vec<FsDirEntry>> {
  let entries = fs::read_dir(path)?
    .filter_map(|entry| {
      let entry = entry.ok()?;
      let name = entry.file_name().into_string().ok()?;
      let file_type = entry.file_type();
      macro_rules! method_or_false {
        ($method:ident) => {
          if let Ok(file_type) = &file_type {
            file_type.$method()
          } else {
            false
          }
        };
      }
      Some(FsDirEntry {
        name,
        is_file: method_or_false!(is_file),
        is_directory: method_or_false!(is_dir),
        is_symlink: method_or_false!(is_symlink),
      })
    })
    .collect();

  Ok(entries)
}

#[cfg(not(windows))]
pub fn symlink(target: &Path, path: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
pub fn symlink(target: &Path, path: &Path) -> io::Result<()> {
  let is_dir = path
    .parent()
    .map(|parent| parent.join(target))
    .and_then(|target| fs::metadata(target).ok())
    .map(|metadata| metadata.is_dir())
    .unwrap_or(false);
  if is_dir {
    std::os::windows::fs::symlink_dir(target, path)
  } else {
    std::os::windows::fs::symlink_file(target, path)
  }
}

/// Read at `offset` without touching the OS file cursor.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
  loop {
    #[cfg(unix)]
    let result = {
      use std::os::unix::fs::FileExt;
      file.read_at(buf, offset)
    };
    #[cfg(windows)]
    let result = {
      use std::os::windows::fs::FileExt;
      file.seek_read(buf, offset)
    };
    match result {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      result => return result,
    }
  }
}

pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
  #[cfg(unix)]
  {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
  }
  #[cfg(windows)]
  {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
      match file.seek_write(&buf[written..], offset + written as u64) {
        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => written += n,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
        Err(err) => return Err(err),
      }
    }
    Ok(())
  }
}

/// The kernel places O_APPEND writes at end of file.
pub fn append_all(mut file: &File, buf: &[u8]) -> io::Result<()> {
  file.write_all(buf)
}
