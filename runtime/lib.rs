// Copyright 2018-2026 the Deno authors. MIT license.

#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

pub mod logger;
mod options;

use std::io;
use std::rc::Rc;
use std::sync::Arc;

use skiff_core::Clock;
use skiff_core::EventLoop;
use skiff_core::LoopError;
use skiff_core::LoopHandle;
use skiff_core::LoopOptions;
use skiff_core::PinCounter;
use skiff_core::RunMode;
use skiff_core::TimerHandle;
use skiff_fs::Filesystem;
use skiff_fs::IdentityTranslator;
use skiff_fs::PathTranslator;
use skiff_fs::RootedTranslator;
use skiff_net::Net;
use skiff_net::NetReactor;
use skiff_tls::TlsContext;
use skiff_tls::TlsError;
use skiff_tls::TlsOptions;
use skiff_zlib::Mode;
use skiff_zlib::Zlib;

pub use skiff_core;
pub use skiff_fs;
pub use skiff_net;
pub use skiff_tls;
pub use skiff_zlib;

pub use crate::options::Mount;
pub use crate::options::RuntimeOptions;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
  #[error("failed to create the event loop: {0}")]
  Io(#[from] io::Error),
  #[error(transparent)]
  Loop(#[from] LoopError),
}

/// One instance of the host: an event loop polling the socket reactor,
/// plus the filesystem, network, TLS and compression services bound to it.
/// Everything here lives on the thread that created it.
pub struct Runtime {
  event_loop: EventLoop<Rc<NetReactor>>,
  fs: Filesystem,
  net: Net,
  options: RuntimeOptions,
}

impl Runtime {
  pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
    Self::create(options, None)
  }

  /// Like [`Runtime::new`] but timers read `clock`, e.g. a
  /// [`skiff_core::VirtualClock`].
  pub fn with_clock(
    options: RuntimeOptions,
    clock: Rc<dyn Clock>,
  ) -> Result<Self, RuntimeError> {
    Self::create(options, Some(clock))
  }

  fn create(
    options: RuntimeOptions,
    clock: Option<Rc<dyn Clock>>,
  ) -> Result<Self, RuntimeError> {
    let reactor = Rc::new(NetReactor::new()?);
    let event_loop = EventLoop::with_reactor(
      reactor.clone(),
      LoopOptions {
        max_tick_depth: options.max_tick_depth,
        max_blocking_threads: options.max_blocking_threads,
        clock,
      },
    )?;
    let fs = Filesystem::new(event_loop.handle(), translator(&options));
    let net = Net::new(reactor, event_loop.handle());
    log::debug!(
      "runtime created: max_tick_depth={} max_blocking_threads={}",
      options.max_tick_depth,
      options.max_blocking_threads
    );
    Ok(Self {
      event_loop,
      fs,
      net,
      options,
    })
  }

  pub fn options(&self) -> &RuntimeOptions {
    &self.options
  }

  pub fn handle(&self) -> &LoopHandle {
    self.event_loop.handle()
  }

  pub fn pins(&self) -> &PinCounter {
    self.event_loop.pins()
  }

  pub fn fs(&self) -> &Filesystem {
    &self.fs
  }

  pub fn net(&self) -> &Net {
    &self.net
  }

  pub fn enqueue(&self, name: &'static str, task: impl FnOnce() + 'static) {
    self.handle().enqueue(name, task);
  }

  pub fn timer(&self, callback: impl FnMut() + 'static) -> TimerHandle {
    TimerHandle::new(self.handle(), callback)
  }

  pub fn tls_server(
    &self,
    options: &TlsOptions,
  ) -> Result<TlsContext, TlsError> {
    TlsContext::server(&self.tls_options(options))
  }

  pub fn tls_client(
    &self,
    options: &TlsOptions,
  ) -> Result<TlsContext, TlsError> {
    TlsContext::client(&self.tls_options(options))
  }

  fn tls_options(&self, options: &TlsOptions) -> TlsOptions {
    TlsOptions {
      delegated_tasks: options.delegated_tasks
        && self.options.tls_delegated_tasks,
      ..options.clone()
    }
  }

  pub fn zlib(&self, mode: Mode) -> Zlib {
    Zlib::new(mode)
  }

  pub fn is_alive(&self) -> bool {
    self.event_loop.is_alive()
  }

  /// Run until nothing is pinned and no task is queued, or until
  /// [`LoopHandle::stop`].
  pub fn run(&self) -> Result<(), RuntimeError> {
    Ok(self.event_loop.run()?)
  }

  pub fn run_once(&self, mode: RunMode) -> Result<bool, RuntimeError> {
    Ok(self.event_loop.run_once(mode)?)
  }

  /// Force-close leaked handles and descriptors and run shutdown hooks.
  /// Returns how many handles were still open.
  pub fn shutdown(self) -> usize {
    let closed = self.event_loop.shutdown();
    if closed > 0 {
      log::warn!("closed {closed} leaked handles at shutdown");
    }
    log::debug!(
      "runtime shut down, dropping {} queued tasks",
      self.handle().pending_tasks()
    );
    closed
  }
}

fn translator(options: &RuntimeOptions) -> Arc<dyn PathTranslator> {
  let Some(root) = &options.fs_root else {
    return Arc::new(IdentityTranslator);
  };
  let mut translator = RootedTranslator::new(root)
    .with_working_dir(&options.working_directory);
  for mount in &options.mounts {
    translator = translator.mount(&mount.prefix, &mount.target);
  }
  Arc::new(translator)
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::path::Path;

  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn rooted_translator_follows_options() {
    let options = RuntimeOptions {
      fs_root: Some("/srv/root".into()),
      working_directory: "/app".into(),
      mounts: vec![Mount {
        prefix: "/data".into(),
        target: "/mnt/data".into(),
      }],
      ..Default::default()
    };
    let translator = translator(&options);
    assert_eq!(
      translator.translate(Path::new("main.js")).unwrap(),
      Path::new("/srv/root/app/main.js")
    );
    assert_eq!(
      translator.translate(Path::new("/data/x")).unwrap(),
      Path::new("/mnt/data/x")
    );
    assert!(translator.translate(Path::new("/../etc")).is_none());
  }

  #[test]
  fn tasks_run_and_loop_drains() {
    let runtime = Runtime::new(RuntimeOptions::default()).unwrap();
    let ran = Rc::new(Cell::new(0));
    {
      let ran = ran.clone();
      runtime.enqueue("test", move || ran.set(ran.get() + 1));
    }
    runtime.run().unwrap();
    assert_eq!(ran.get(), 1);
    assert!(!runtime.is_alive());
    assert_eq!(runtime.shutdown(), 0);
  }

  #[test]
  fn delegation_can_be_disabled_runtime_wide() {
    let runtime = Runtime::new(RuntimeOptions {
      tls_delegated_tasks: false,
      ..Default::default()
    })
    .unwrap();
    let merged = runtime.tls_options(&TlsOptions::default());
    assert!(!merged.delegated_tasks);
    assert!(merged.reject_unauthorized);
  }
}
