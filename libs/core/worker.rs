// Copyright 2018-2026 the Deno authors. MIT license.

use std::io;

use tokio::task::JoinError;

use crate::error::ErrorCode;
use crate::error::OsError;

/// Bounded pool for blocking work (file I/O, delegated TLS tasks, large
/// compression buffers). Jobs never touch script-visible state: they hand
/// their result to `done`, which posts it back to the loop.
pub struct WorkerPool {
  runtime: Option<tokio::runtime::Runtime>,
}

impl WorkerPool {
  pub fn new(max_blocking_threads: usize) -> io::Result<Self> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(1)
      // This is the real bound on concurrent blocking jobs; anything above
      // it queues inside tokio.
      .max_blocking_threads(max_blocking_threads.max(1))
      .thread_name("skiff-worker")
      .build()?;
    Ok(Self {
      runtime: Some(runtime),
    })
  }

  pub(crate) fn spawn<T, W, D>(&self, work: W, done: D)
  where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(Result<T, OsError>) + Send + 'static,
  {
    let Some(runtime) = &self.runtime else {
      done(Err(OsError::with_message(
        ErrorCode::Io,
        "worker pool is shut down",
      )));
      return;
    };
    runtime.spawn(async move {
      let result = tokio::task::spawn_blocking(work)
        .await
        .map_err(OsError::from);
      done(result);
    });
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}

impl From<JoinError> for OsError {
  fn from(err: JoinError) -> Self {
    if err.is_panic() {
      log::error!("worker job panicked: {err}");
      OsError::with_message(ErrorCode::Io, "worker job panicked")
    } else {
      OsError::with_message(ErrorCode::Interrupted, "worker job cancelled")
    }
  }
}
