// Copyright 2018-2026 the Deno authors. MIT license.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use skiff_core::OsError;

use crate::FsResult;
use crate::interface::Fd;

/// 0-2 are stdio and 3 is reserved for the runtime.
pub const FIRST_FD: Fd = 4;

#[derive(Debug)]
pub struct FileEntry {
  /// Logical path the descriptor was opened with.
  path: PathBuf,
  file: File,
  position: Mutex<u64>,
  append: bool,
}

impl FileEntry {
  pub fn new(path: PathBuf, file: File, append: bool) -> Self {
    Self {
      path,
      file,
      position: Mutex::new(0),
      append,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn file(&self) -> &File {
    &self.file
  }

  pub fn is_append(&self) -> bool {
    self.append
  }

  pub fn position(&self) -> &Mutex<u64> {
    &self.position
  }
}

/// Descriptor table of one runtime. Ids grow monotonically and are never
/// handed out twice.
#[derive(Debug)]
pub struct FdTable {
  entries: DashMap<Fd, Arc<FileEntry>>,
  next_fd: AtomicU32,
}

impl Default for FdTable {
  fn default() -> Self {
    Self {
      entries: DashMap::new(),
      next_fd: AtomicU32::new(FIRST_FD),
    }
  }
}

impl FdTable {
  pub fn insert(&self, entry: FileEntry) -> Fd {
    let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
    self.entries.insert(fd, Arc::new(entry));
    fd
  }

  pub fn get(&self, fd: Fd) -> FsResult<Arc<FileEntry>> {
    self
      .entries
      .get(&fd)
      .map(|entry| entry.value().clone())
      .ok_or_else(|| OsError::bad_descriptor(fd))
  }

  pub fn remove(&self, fd: Fd) -> FsResult<Arc<FileEntry>> {
    self
      .entries
      .remove(&fd)
      .map(|(_, entry)| entry)
      .ok_or_else(|| OsError::bad_descriptor(fd))
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Drop every open descriptor. Returns how many were still open.
  pub fn cleanup(&self) -> usize {
    let fds: Vec<Fd> = self.entries.iter().map(|entry| *entry.key()).collect();
    let mut closed = 0;
    for fd in fds {
      if let Some((fd, entry)) = self.entries.remove(&fd) {
        log::warn!(
          "closing leaked file descriptor {fd} ({})",
          entry.path().display()
        );
        closed += 1;
      }
    }
    closed
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use skiff_core::ErrorCode;

  fn entry(dir: &tempfile::TempDir, name: &str) -> FileEntry {
    let path = dir.path().join(name);
    let file = File::create(&path).unwrap();
    FileEntry::new(path, file, false)
  }

  #[test]
  fn ids_start_after_reserved_and_are_not_reused() {
    let dir = tempfile::tempdir().unwrap();
    let table = FdTable::default();
    let a = table.insert(entry(&dir, "a"));
    assert_eq!(a, FIRST_FD);
    table.remove(a).unwrap();
    let b = table.insert(entry(&dir, "b"));
    assert_eq!(b, FIRST_FD + 1);
    assert_eq!(table.get(a).unwrap_err().code(), ErrorCode::BadDescriptor);
    assert_eq!(table.remove(a).unwrap_err().code(), ErrorCode::BadDescriptor);
  }

  #[test]
  fn cleanup_reports_leaks() {
    let dir = tempfile::tempdir().unwrap();
    let table = FdTable::default();
    table.insert(entry(&dir, "a"));
    table.insert(entry(&dir, "b"));
    assert_eq!(table.cleanup(), 2);
    assert!(table.is_empty());
    assert_eq!(table.cleanup(), 0);
  }
}
