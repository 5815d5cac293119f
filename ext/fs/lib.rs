// Copyright 2018-2026 the Deno authors. MIT license.

mod interface;
mod path;
mod std_fs;
mod table;

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use skiff_core::LoopHandle;
use skiff_core::OsError;
use skiff_core::OsResult;

pub use crate::interface::Fd;
pub use crate::interface::FsDirEntry;
pub use crate::interface::FsStat;
pub use crate::interface::OpenOptions;
pub use crate::interface::flags;
pub use crate::path::IdentityTranslator;
pub use crate::path::PathTranslator;
pub use crate::path::RootedTranslator;
pub use crate::table::FIRST_FD;
pub use crate::table::FdTable;
pub use crate::table::FileEntry;

pub type FsResult<T> = OsResult<T>;

const DEFAULT_DIR_MODE: u32 = 0o777;

fn at_path<'a>(
  syscall: &'static str,
  path: &'a Path,
) -> impl FnOnce(io::Error) -> OsError + 'a {
  move |err| OsError::from(err).syscall(syscall).path(path)
}

fn at_fd(syscall: &'static str, fd: Fd) -> impl FnOnce(io::Error) -> OsError {
  move |err| OsError::from(err).syscall(syscall).fd(fd)
}

/// Thread-safe half of the bridge. Every method blocks the calling thread,
/// so the loop only calls these directly for `*_sync` operations and hands
/// them to the worker pool otherwise.
#[derive(Debug)]
pub struct FsCore {
  translator: Arc<dyn PathTranslator>,
  table: FdTable,
}

impl FsCore {
  pub fn new(translator: Arc<dyn PathTranslator>) -> Self {
    Self {
      translator,
      table: FdTable::default(),
    }
  }

  pub fn table(&self) -> &FdTable {
    &self.table
  }

  fn resolve(&self, syscall: &'static str, path: &Path) -> FsResult<PathBuf> {
    self
      .translator
      .resolve(path)
      .map_err(|err| err.syscall(syscall))
  }

  pub fn open(&self, path: &Path, options: OpenOptions) -> FsResult<Fd> {
    let real = self.resolve("open", path)?;
    let file = std_fs::open_options(options)
      .open(&real)
      .map_err(at_path("open", path))?;
    let fd = self.table.insert(FileEntry::new(
      path.to_path_buf(),
      file,
      options.append,
    ));
    log::debug!("open {} -> fd {fd}", path.display());
    Ok(fd)
  }

  pub fn close(&self, fd: Fd) -> FsResult<()> {
    self.table.remove(fd).map_err(|err| err.syscall("close"))?;
    Ok(())
  }

  /// Read into `buf`. Returns 0 at end of file.
  pub fn read_into(
    &self,
    fd: Fd,
    buf: &mut [u8],
    position: Option<u64>,
  ) -> FsResult<usize> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("read"))?;
    let n = match position {
      Some(position) => std_fs::read_at(entry.file(), buf, position),
      None => {
        let mut current = entry.position().lock();
        let result = std_fs::read_at(entry.file(), buf, *current);
        if let Ok(n) = result {
          *current += n as u64;
        }
        result
      }
    };
    n.map_err(at_fd("read", fd))
  }

  pub fn read(
    &self,
    fd: Fd,
    len: usize,
    position: Option<u64>,
  ) -> FsResult<Bytes> {
    let mut buf = vec![0; len];
    let n = self.read_into(fd, &mut buf, position)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
  }

  pub fn write(
    &self,
    fd: Fd,
    data: &[u8],
    position: Option<u64>,
  ) -> FsResult<usize> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("write"))?;
    let result = if entry.is_append() {
      let mut current = entry.position().lock();
      std_fs::append_all(entry.file(), data).and_then(|()| {
        *current = entry.file().metadata()?.len();
        Ok(())
      })
    } else {
      match position {
        Some(position) => std_fs::write_all_at(entry.file(), data, position),
        None => {
          let mut current = entry.position().lock();
          std_fs::write_all_at(entry.file(), data, *current)
            .map(|()| *current += data.len() as u64)
        }
      }
    };
    result.map_err(at_fd("write", fd))?;
    Ok(data.len())
  }

  pub fn fsync(&self, fd: Fd) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("fsync"))?;
    entry.file().sync_all().map_err(at_fd("fsync", fd))
  }

  pub fn fdatasync(&self, fd: Fd) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("fdatasync"))?;
    entry.file().sync_data().map_err(at_fd("fdatasync", fd))
  }

  pub fn ftruncate(&self, fd: Fd, len: u64) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("ftruncate"))?;
    entry.file().set_len(len).map_err(at_fd("ftruncate", fd))
  }

  pub fn fstat(&self, fd: Fd) -> FsResult<FsStat> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("fstat"))?;
    let metadata = entry.file().metadata().map_err(at_fd("fstat", fd))?;
    Ok(FsStat::from_std(metadata))
  }

  pub fn fchmod(&self, fd: Fd, mode: u32) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("fchmod"))?;
    std_fs::fchmod(entry.file(), mode).map_err(at_fd("fchmod", fd))
  }

  pub fn fchown(
    &self,
    fd: Fd,
    uid: Option<u32>,
    gid: Option<u32>,
  ) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("fchown"))?;
    std_fs::fchown(entry.file(), uid, gid).map_err(at_fd("fchown", fd))
  }

  /// Times are milliseconds since the epoch.
  pub fn futimes(&self, fd: Fd, atime: i64, mtime: i64) -> FsResult<()> {
    let entry = self.table.get(fd).map_err(|err| err.syscall("futime"))?;
    std_fs::futimes(entry.file(), atime, mtime).map_err(at_fd("futime", fd))
  }

  pub fn stat(&self, path: &Path) -> FsResult<FsStat> {
    let real = self.resolve("stat", path)?;
    let metadata = fs::metadata(real).map_err(at_path("stat", path))?;
    Ok(FsStat::from_std(metadata))
  }

  pub fn lstat(&self, path: &Path) -> FsResult<FsStat> {
    let real = self.resolve("lstat", path)?;
    let metadata = fs::symlink_metadata(real).map_err(at_path("lstat", path))?;
    Ok(FsStat::from_std(metadata))
  }

  pub fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
    let real_from = self.resolve("rename", from)?;
    let real_to = self.resolve("rename", to)?;
    fs::rename(real_from, real_to).map_err(at_path("rename", from))
  }

  pub fn unlink(&self, path: &Path) -> FsResult<()> {
    let real = self.resolve("unlink", path)?;
    fs::remove_file(real).map_err(at_path("unlink", path))
  }

  pub fn mkdir(
    &self,
    path: &Path,
    recursive: bool,
    mode: Option<u32>,
  ) -> FsResult<()> {
    let real = self.resolve("mkdir", path)?;
    std_fs::mkdir(&real, recursive, mode.unwrap_or(DEFAULT_DIR_MODE))
      .map_err(at_path("mkdir", path))
  }

  pub fn rmdir(&self, path: &Path) -> FsResult<()> {
    let real = self.resolve("rmdir", path)?;
    fs::remove_dir(real).map_err(at_path("rmdir", path))
  }

  pub fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
    let real_existing = self.resolve("link", existing)?;
    let real_new = self.resolve("link", new)?;
    fs::hard_link(real_existing, real_new).map_err(at_path("link", new))
  }

  /// Relative targets are stored as given and resolve against the link's
  /// directory; absolute targets are translated.
  pub fn symlink(&self, target: &Path, path: &Path) -> FsResult<()> {
    let real_target = if target.has_root() {
      self.resolve("symlink", target)?
    } else {
      target.to_path_buf()
    };
    let real = self.resolve("symlink", path)?;
    std_fs::symlink(&real_target, &real).map_err(at_path("symlink", path))
  }

  pub fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
    let real = self.resolve("readlink", path)?;
    let target = fs::read_link(real).map_err(at_path("readlink", path))?;
    if target.is_relative() {
      return Ok(target);
    }
    self
      .translator
      .reverse(&target)
      .ok_or_else(|| OsError::not_found().syscall("readlink").path(path))
  }

  pub fn readdir(&self, path: &Path) -> FsResult<Vec<FsDirEntry>> {
    let real = self.resolve("scandir", path)?;
    std_fs::read_dir(&real).map_err(at_path("scandir", path))
  }

  pub fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
    let real = self.resolve("chmod", path)?;
    std_fs::chmod(&real, mode).map_err(at_path("chmod", path))
  }

  pub fn chown(
    &self,
    path: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
  ) -> FsResult<()> {
    let real = self.resolve("chown", path)?;
    std_fs::chown(&real, uid, gid).map_err(at_path("chown", path))
  }

  pub fn utimes(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
    let real = self.resolve("utime", path)?;
    std_fs::utimes(&real, atime, mtime).map_err(at_path("utime", path))
  }

  pub fn realpath(&self, path: &Path) -> FsResult<PathBuf> {
    let real = self.resolve("realpath", path)?;
    let canonical =
      fs::canonicalize(real).map_err(at_path("realpath", path))?;
    self
      .translator
      .reverse(&canonical)
      .ok_or_else(|| OsError::not_found().syscall("realpath").path(path))
  }

  pub fn exists(&self, path: &Path) -> bool {
    match self.translator.translate(path) {
      Some(real) => real.exists(),
      None => false,
    }
  }
}

/// Filesystem bound to one event loop. `*_sync` methods run on the calling
/// thread; `*_async` methods run on the worker pool and call back as a task.
#[derive(Debug, Clone)]
pub struct Filesystem {
  core: Arc<FsCore>,
  loop_handle: LoopHandle,
}

impl Filesystem {
  pub fn new(
    loop_handle: &LoopHandle,
    translator: Arc<dyn PathTranslator>,
  ) -> Self {
    let core = Arc::new(FsCore::new(translator));
    let shutdown_core = core.clone();
    loop_handle.on_shutdown(move || {
      let leaked = shutdown_core.table().cleanup();
      if leaked > 0 {
        log::debug!("closed {leaked} leaked file descriptors");
      }
    });
    Self {
      core,
      loop_handle: loop_handle.clone(),
    }
  }

  pub fn core(&self) -> &Arc<FsCore> {
    &self.core
  }

  /// Number of descriptors currently open.
  pub fn open_count(&self) -> usize {
    self.core.table().len()
  }

  fn submit<T, F, C>(&self, name: &'static str, op: F, cb: C)
  where
    T: Send + 'static,
    F: FnOnce(&FsCore) -> FsResult<T> + Send + 'static,
    C: FnOnce(FsResult<T>) + 'static,
  {
    let core = self.core.clone();
    self.loop_handle.spawn_blocking(
      name,
      move || op(&core),
      move |result| cb(result.and_then(|result| result)),
    );
  }

  pub fn open_sync(
    &self,
    path: impl AsRef<Path>,
    open_flags: i32,
    mode: u32,
  ) -> FsResult<Fd> {
    let options = OpenOptions::from_flags(open_flags, mode);
    self.core.open(path.as_ref(), options)
  }

  pub fn open_async(
    &self,
    path: PathBuf,
    open_flags: i32,
    mode: u32,
    cb: impl FnOnce(FsResult<Fd>) + 'static,
  ) {
    let options = OpenOptions::from_flags(open_flags, mode);
    self.submit("fs.open", move |core| core.open(&path, options), cb);
  }

  pub fn close_sync(&self, fd: Fd) -> FsResult<()> {
    self.core.close(fd)
  }

  pub fn close_async(&self, fd: Fd, cb: impl FnOnce(FsResult<()>) + 'static) {
    self.submit("fs.close", move |core| core.close(fd), cb);
  }

  pub fn read_sync(
    &self,
    fd: Fd,
    buf: &mut [u8],
    position: Option<u64>,
  ) -> FsResult<usize> {
    self.core.read_into(fd, buf, position)
  }

  /// Reads up to `len` bytes; an empty buffer means end of file.
  pub fn read_async(
    &self,
    fd: Fd,
    len: usize,
    position: Option<u64>,
    cb: impl FnOnce(FsResult<Bytes>) + 'static,
  ) {
    self.submit("fs.read", move |core| core.read(fd, len, position), cb);
  }

  pub fn write_sync(
    &self,
    fd: Fd,
    data: &[u8],
    position: Option<u64>,
  ) -> FsResult<usize> {
    self.core.write(fd, data, position)
  }

  pub fn write_async(
    &self,
    fd: Fd,
    data: Bytes,
    position: Option<u64>,
    cb: impl FnOnce(FsResult<usize>) + 'static,
  ) {
    self.submit("fs.write", move |core| core.write(fd, &data, position), cb);
  }

  pub fn fsync_sync(&self, fd: Fd) -> FsResult<()> {
    self.core.fsync(fd)
  }

  pub fn fsync_async(&self, fd: Fd, cb: impl FnOnce(FsResult<()>) + 'static) {
    self.submit("fs.fsync", move |core| core.fsync(fd), cb);
  }

  pub fn fdatasync_sync(&self, fd: Fd) -> FsResult<()> {
    self.core.fdatasync(fd)
  }

  pub fn fdatasync_async(
    &self,
    fd: Fd,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.fdatasync", move |core| core.fdatasync(fd), cb);
  }

  pub fn ftruncate_sync(&self, fd: Fd, len: u64) -> FsResult<()> {
    self.core.ftruncate(fd, len)
  }

  pub fn ftruncate_async(
    &self,
    fd: Fd,
    len: u64,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.ftruncate", move |core| core.ftruncate(fd, len), cb);
  }

  pub fn fstat_sync(&self, fd: Fd) -> FsResult<FsStat> {
    self.core.fstat(fd)
  }

  pub fn fstat_async(
    &self,
    fd: Fd,
    cb: impl FnOnce(FsResult<FsStat>) + 'static,
  ) {
    self.submit("fs.fstat", move |core| core.fstat(fd), cb);
  }

  pub fn fchmod_sync(&self, fd: Fd, mode: u32) -> FsResult<()> {
    self.core.fchmod(fd, mode)
  }

  pub fn fchmod_async(
    &self,
    fd: Fd,
    mode: u32,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.fchmod", move |core| core.fchmod(fd, mode), cb);
  }

  pub fn fchown_sync(
    &self,
    fd: Fd,
    uid: Option<u32>,
    gid: Option<u32>,
  ) -> FsResult<()> {
    self.core.fchown(fd, uid, gid)
  }

  pub fn fchown_async(
    &self,
    fd: Fd,
    uid: Option<u32>,
    gid: Option<u32>,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.fchown", move |core| core.fchown(fd, uid, gid), cb);
  }

  pub fn futimes_sync(&self, fd: Fd, atime: i64, mtime: i64) -> FsResult<()> {
    self.core.futimes(fd, atime, mtime)
  }

  pub fn futimes_async(
    &self,
    fd: Fd,
    atime: i64,
    mtime: i64,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.futimes", move |core| core.futimes(fd, atime, mtime), cb);
  }

  pub fn stat_sync(&self, path: impl AsRef<Path>) -> FsResult<FsStat> {
    self.core.stat(path.as_ref())
  }

  pub fn stat_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<FsStat>) + 'static,
  ) {
    self.submit("fs.stat", move |core| core.stat(&path), cb);
  }

  pub fn lstat_sync(&self, path: impl AsRef<Path>) -> FsResult<FsStat> {
    self.core.lstat(path.as_ref())
  }

  pub fn lstat_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<FsStat>) + 'static,
  ) {
    self.submit("fs.lstat", move |core| core.lstat(&path), cb);
  }

  pub fn rename_sync(
    &self,
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
  ) -> FsResult<()> {
    self.core.rename(from.as_ref(), to.as_ref())
  }

  pub fn rename_async(
    &self,
    from: PathBuf,
    to: PathBuf,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.rename", move |core| core.rename(&from, &to), cb);
  }

  pub fn unlink_sync(&self, path: impl AsRef<Path>) -> FsResult<()> {
    self.core.unlink(path.as_ref())
  }

  pub fn unlink_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.unlink", move |core| core.unlink(&path), cb);
  }

  pub fn mkdir_sync(
    &self,
    path: impl AsRef<Path>,
    recursive: bool,
    mode: Option<u32>,
  ) -> FsResult<()> {
    self.core.mkdir(path.as_ref(), recursive, mode)
  }

  pub fn mkdir_async(
    &self,
    path: PathBuf,
    recursive: bool,
    mode: Option<u32>,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit(
      "fs.mkdir",
      move |core| core.mkdir(&path, recursive, mode),
      cb,
    );
  }

  pub fn rmdir_sync(&self, path: impl AsRef<Path>) -> FsResult<()> {
    self.core.rmdir(path.as_ref())
  }

  pub fn rmdir_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.rmdir", move |core| core.rmdir(&path), cb);
  }

  pub fn link_sync(
    &self,
    existing: impl AsRef<Path>,
    new: impl AsRef<Path>,
  ) -> FsResult<()> {
    self.core.link(existing.as_ref(), new.as_ref())
  }

  pub fn link_async(
    &self,
    existing: PathBuf,
    new: PathBuf,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.link", move |core| core.link(&existing, &new), cb);
  }

  pub fn symlink_sync(
    &self,
    target: impl AsRef<Path>,
    path: impl AsRef<Path>,
  ) -> FsResult<()> {
    self.core.symlink(target.as_ref(), path.as_ref())
  }

  pub fn symlink_async(
    &self,
    target: PathBuf,
    path: PathBuf,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.symlink", move |core| core.symlink(&target, &path), cb);
  }

  pub fn readlink_sync(&self, path: impl AsRef<Path>) -> FsResult<PathBuf> {
    self.core.readlink(path.as_ref())
  }

  pub fn readlink_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<PathBuf>) + 'static,
  ) {
    self.submit("fs.readlink", move |core| core.readlink(&path), cb);
  }

  pub fn readdir_sync(
    &self,
    path: impl AsRef<Path>,
  ) -> FsResult<Vec<FsDirEntry>> {
    self.core.readdir(path.as_ref())
  }

  pub fn readdir_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<Vec<FsDirEntry>>) + 'static,
  ) {
    self.submit("fs.readdir", move |core| core.readdir(&path), cb);
  }

  pub fn chmod_sync(&self, path: impl AsRef<Path>, mode: u32) -> FsResult<()> {
    self.core.chmod(path.as_ref(), mode)
  }

  pub fn chmod_async(
    &self,
    path: PathBuf,
    mode: u32,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.chmod", move |core| core.chmod(&path, mode), cb);
  }

  pub fn chown_sync(
    &self,
    path: impl AsRef<Path>,
    uid: Option<u32>,
    gid: Option<u32>,
  ) -> FsResult<()> {
    self.core.chown(path.as_ref(), uid, gid)
  }

  pub fn chown_async(
    &self,
    path: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.chown", move |core| core.chown(&path, uid, gid), cb);
  }

  pub fn utimes_sync(
    &self,
    path: impl AsRef<Path>,
    atime: i64,
    mtime: i64,
  ) -> FsResult<()> {
    self.core.utimes(path.as_ref(), atime, mtime)
  }

  pub fn utimes_async(
    &self,
    path: PathBuf,
    atime: i64,
    mtime: i64,
    cb: impl FnOnce(FsResult<()>) + 'static,
  ) {
    self.submit("fs.utimes", move |core| core.utimes(&path, atime, mtime), cb);
  }

  pub fn realpath_sync(&self, path: impl AsRef<Path>) -> FsResult<PathBuf> {
    self.core.realpath(path.as_ref())
  }

  pub fn realpath_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<PathBuf>) + 'static,
  ) {
    self.submit("fs.realpath", move |core| core.realpath(&path), cb);
  }

  pub fn exists_sync(&self, path: impl AsRef<Path>) -> bool {
    self.core.exists(path.as_ref())
  }

  pub fn exists_async(
    &self,
    path: PathBuf,
    cb: impl FnOnce(FsResult<bool>) + 'static,
  ) {
    self.submit("fs.exists", move |core| Ok(core.exists(&path)), cb);
  }
}
