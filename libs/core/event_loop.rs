// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;

use crate::error::OsResult;
use crate::handle::Closable;
use crate::handle::HandleKey;
use crate::handle::HandleKind;
use crate::handle::HandleRegistry;
use crate::pin::PinCounter;
use crate::reactor::ParkReactor;
use crate::reactor::Reactor;
use crate::task_queue::ContextToken;
use crate::task_queue::Inbox;
use crate::task_queue::RemoteMessage;
use crate::task_queue::RemoteSender;
use crate::task_queue::Task;
use crate::task_queue::TaskQueue;
use crate::timers::Clock;
use crate::timers::MonotonicClock;
use crate::timers::TimerQueue;
use crate::worker::WorkerPool;

pub const DEFAULT_MAX_TICK_DEPTH: usize = 1000;
pub const DEFAULT_MAX_BLOCKING_THREADS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// Run until the loop is no longer alive or `stop` is called.
  Default,
  /// Run one turn, blocking for I/O if there is nothing to do.
  Once,
  /// Run one turn without blocking.
  NoWait,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
  #[error(
    "maximum tick depth of {max} exceeded by \"{name}\" (depth {depth})"
  )]
  TickDepthExceeded {
    name: &'static str,
    depth: usize,
    max: usize,
  },
  #[error("reactor poll failed: {0}")]
  Poll(#[from] io::Error),
}

pub struct LoopOptions {
  pub max_tick_depth: usize,
  pub max_blocking_threads: usize,
  pub clock: Option<Rc<dyn Clock>>,
}

impl Default for LoopOptions {
  fn default() -> Self {
    Self {
      max_tick_depth: DEFAULT_MAX_TICK_DEPTH,
      max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
      clock: None,
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Running {
  depth: usize,
  context: Option<ContextToken>,
}

struct Completion {
  name: &'static str,
  callback: Box<dyn FnOnce()>,
}

pub(crate) struct LoopState {
  pins: PinCounter,
  tasks: TaskQueue,
  inbox: Arc<Inbox>,
  completions: RefCell<Slab<Completion>>,
  pub(crate) timers: TimerQueue,
  clock: Rc<dyn Clock>,
  workers: WorkerPool,
  handles: HandleRegistry,
  shutdown_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
  running: Cell<Option<Running>>,
  max_tick_depth: usize,
  stop_requested: Cell<bool>,
}

/// Cheap, clonable access to a loop from the loop thread. Handles keep one
/// to enqueue tasks, pin the loop and reach the worker pool.
#[derive(Clone)]
pub struct LoopHandle {
  state: Rc<LoopState>,
}

impl fmt::Debug for LoopHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoopHandle")
      .field("pins", &self.state.pins.count())
      .field("tasks", &self.state.tasks.len())
      .finish()
  }
}

impl LoopHandle {
  pub(crate) fn state(&self) -> &LoopState {
    &self.state
  }

  pub fn pins(&self) -> &PinCounter {
    &self.state.pins
  }

  pub fn now(&self) -> Duration {
    self.state.clock.now()
  }

  pub fn clock(&self) -> Rc<dyn Clock> {
    self.state.clock.clone()
  }

  pub fn remote(&self) -> RemoteSender {
    RemoteSender::new(self.state.inbox.clone())
  }

  /// Context of the task currently running, if any.
  pub fn current_context(&self) -> Option<ContextToken> {
    self.state.running.get().and_then(|running| running.context)
  }

  pub fn pending_tasks(&self) -> usize {
    self.state.tasks.len()
  }

  /// Append a task. It inherits the context of the running task, and is one
  /// tick deeper than it.
  pub fn enqueue(
    &self,
    name: &'static str,
    callback: impl FnOnce() + 'static,
  ) {
    self.push_task(name, self.current_context(), Box::new(callback));
  }

  pub fn enqueue_in(
    &self,
    context: ContextToken,
    name: &'static str,
    callback: impl FnOnce() + 'static,
  ) {
    self.push_task(name, Some(context), Box::new(callback));
  }

  fn push_task(
    &self,
    name: &'static str,
    context: Option<ContextToken>,
    callback: Box<dyn FnOnce()>,
  ) {
    let depth = match self.state.running.get() {
      Some(running) => running.depth + 1,
      None => 0,
    };
    self.state.tasks.push(Task {
      name,
      context,
      depth,
      callback,
    });
  }

  /// Run `work` on the worker pool and deliver its result to `done` as a
  /// task. The loop stays pinned until `done` has been dequeued, and a
  /// panicking job is reported as an error instead of tearing down the
  /// worker.
  pub fn spawn_blocking<T, W, D>(&self, name: &'static str, work: W, done: D)
  where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(OsResult<T>) + 'static,
  {
    let slot: Arc<Mutex<Option<OsResult<T>>>> = Arc::new(Mutex::new(None));
    let pins = self.state.pins.clone();
    pins.pin();
    let key = {
      let slot = slot.clone();
      self.state.completions.borrow_mut().insert(Completion {
        name,
        callback: Box::new(move || {
          pins.unpin();
          let result = slot.lock().take();
          match result {
            Some(result) => done(result),
            None => log::error!("completion for \"{name}\" has no result"),
          }
        }),
      })
    };
    let remote = self.remote();
    self.state.workers.spawn(work, move |result| {
      *slot.lock() = Some(result);
      remote.complete(key);
    });
  }

  pub fn register_handle(
    &self,
    kind: HandleKind,
    handle: Weak<dyn Closable>,
  ) -> HandleKey {
    self.state.handles.register(kind, handle)
  }

  pub fn unregister_handle(&self, key: HandleKey) {
    self.state.handles.unregister(key);
  }

  /// Number of handles registered for cleanup at shutdown.
  pub fn live_handles(&self) -> usize {
    self.state.handles.len()
  }

  /// Run `hook` when the loop shuts down, after leaked handles are closed.
  pub fn on_shutdown(&self, hook: impl FnOnce() + 'static) {
    self.state.shutdown_hooks.borrow_mut().push(Box::new(hook));
  }

  pub fn stop(&self) {
    self.state.stop_requested.set(true);
  }

  fn drain_inbox(&self) {
    for message in self.state.inbox.take_all() {
      match message {
        RemoteMessage::Complete(key) => {
          let completion = {
            let mut completions = self.state.completions.borrow_mut();
            completions.try_remove(key)
          };
          match completion {
            Some(completion) => {
              self.push_task(completion.name, None, completion.callback)
            }
            None => log::warn!("unknown completion key {key}"),
          }
        }
        RemoteMessage::Run(name, callback) => {
          self.push_task(name, None, callback);
        }
      }
    }
  }

  fn run_tasks(&self) -> Result<(), LoopError> {
    while let Some(task) = self.state.tasks.pop() {
      if task.depth > self.state.max_tick_depth {
        log::error!(
          "task \"{}\" exceeded maximum tick depth {}",
          task.name,
          self.state.max_tick_depth
        );
        return Err(LoopError::TickDepthExceeded {
          name: task.name,
          depth: task.depth,
          max: self.state.max_tick_depth,
        });
      }
      let previous = self.state.running.replace(Some(Running {
        depth: task.depth,
        context: task.context,
      }));
      (task.callback)();
      self.state.running.set(previous);
    }
    Ok(())
  }

  fn has_pending_work(&self) -> bool {
    !self.state.tasks.is_empty() || self.state.inbox.has_pending()
  }

  fn is_alive(&self) -> bool {
    self.state.pins.is_pinned() || self.has_pending_work()
  }
}

/// Single-threaded event loop: drains tasks, fires timers and blocks in the
/// reactor while pinned work is outstanding.
pub struct EventLoop<R: Reactor = ParkReactor> {
  handle: LoopHandle,
  reactor: R,
}

impl EventLoop<ParkReactor> {
  pub fn new(options: LoopOptions) -> io::Result<Self> {
    Self::with_reactor(ParkReactor::new(), options)
  }
}

impl<R: Reactor> EventLoop<R> {
  pub fn with_reactor(reactor: R, options: LoopOptions) -> io::Result<Self> {
    let inbox = Arc::new(Inbox::new(reactor.waker()));
    let clock = options
      .clock
      .unwrap_or_else(|| Rc::new(MonotonicClock::new()));
    let state = LoopState {
      pins: PinCounter::new(),
      tasks: TaskQueue::default(),
      inbox,
      completions: RefCell::new(Slab::new()),
      timers: TimerQueue::default(),
      clock,
      workers: WorkerPool::new(options.max_blocking_threads)?,
      handles: HandleRegistry::default(),
      shutdown_hooks: RefCell::new(Vec::new()),
      running: Cell::new(None),
      max_tick_depth: options.max_tick_depth,
      stop_requested: Cell::new(false),
    };
    Ok(Self {
      handle: LoopHandle {
        state: Rc::new(state),
      },
      reactor,
    })
  }

  pub fn handle(&self) -> &LoopHandle {
    &self.handle
  }

  pub fn reactor(&self) -> &R {
    &self.reactor
  }

  pub fn pins(&self) -> &PinCounter {
    self.handle.pins()
  }

  /// True while pins are held or tasks are waiting to run.
  pub fn is_alive(&self) -> bool {
    self.handle.is_alive()
  }

  pub fn run(&self) -> Result<(), LoopError> {
    self.handle.state.stop_requested.set(false);
    while self.run_once(RunMode::Default)? {
      if self.handle.state.stop_requested.get() {
        break;
      }
    }
    Ok(())
  }

  /// Run one turn: fire due timers, run queued tasks, poll the reactor,
  /// then run whatever the poll produced. Returns whether the loop is still
  /// alive.
  pub fn run_once(&self, mode: RunMode) -> Result<bool, LoopError> {
    self.process_ready()?;

    let timeout = if mode == RunMode::NoWait
      || !self.is_alive()
      || self.handle.has_pending_work()
      || self.handle.state.stop_requested.get()
    {
      Some(Duration::ZERO)
    } else {
      self.handle.state.timers.next_delay(self.handle.now())
    };
    self.reactor.poll(timeout)?;

    self.process_ready()?;
    Ok(self.is_alive())
  }

  fn process_ready(&self) -> Result<(), LoopError> {
    self.handle.drain_inbox();
    self.handle.state.timers.run_expired(&self.handle);
    self.handle.run_tasks()
  }

  pub fn stop(&self) {
    self.handle.stop();
  }

  /// Close leaked handles and run shutdown hooks. Returns how many handles
  /// had to be force-closed.
  pub fn shutdown(&self) -> usize {
    let closed = self.handle.state.handles.close_all();
    let hooks =
      std::mem::take(&mut *self.handle.state.shutdown_hooks.borrow_mut());
    for hook in hooks {
      hook();
    }
    closed
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;
  use std::rc::Rc;

  use pretty_assertions::assert_eq;

  use super::*;
  use crate::error::ErrorCode;

  fn new_loop() -> EventLoop {
    EventLoop::new(LoopOptions::default()).unwrap()
  }

  #[test]
  fn tasks_run_in_enqueue_order() {
    let event_loop = new_loop();
    let handle = event_loop.handle();
    let log = Rc::new(RefCell::new(Vec::new()));
    for i in 0..5 {
      let log = log.clone();
      handle.enqueue("push", move || log.borrow_mut().push(i));
    }
    event_loop.run().unwrap();
    assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    assert!(!event_loop.is_alive());
  }

  #[test]
  fn nested_tasks_run_after_queued_ones() {
    let event_loop = new_loop();
    let handle = event_loop.handle().clone();
    let log = Rc::new(RefCell::new(Vec::new()));
    {
      let log = log.clone();
      let inner_handle = handle.clone();
      handle.enqueue("outer", move || {
        log.borrow_mut().push("outer");
        let log = log.clone();
        inner_handle
          .enqueue("inner", move || log.borrow_mut().push("inner"));
      });
    }
    {
      let log = log.clone();
      handle.enqueue("second", move || log.borrow_mut().push("second"));
    }
    event_loop.run().unwrap();
    assert_eq!(*log.borrow(), vec!["outer", "second", "inner"]);
  }

  fn reschedule(handle: LoopHandle, count: Rc<Cell<usize>>) {
    count.set(count.get() + 1);
    let next = handle.clone();
    handle.enqueue("reschedule", move || reschedule(next, count));
  }

  #[test]
  fn unbounded_self_scheduling_is_fatal() {
    let event_loop = EventLoop::new(LoopOptions {
      max_tick_depth: 10,
      ..Default::default()
    })
    .unwrap();
    let count = Rc::new(Cell::new(0));
    let handle = event_loop.handle().clone();
    {
      let count = count.clone();
      let next = handle.clone();
      handle.enqueue("start", move || reschedule(next, count));
    }
    let err = event_loop.run().unwrap_err();
    match err {
      LoopError::TickDepthExceeded { name, depth, max } => {
        assert_eq!(name, "reschedule");
        assert_eq!(depth, 11);
        assert_eq!(max, 10);
      }
      other => panic!("unexpected error {other}"),
    }
    // the task at depth 11 never ran
    assert_eq!(count.get(), 11);
  }

  #[test]
  fn context_is_inherited() {
    let event_loop = new_loop();
    let handle = event_loop.handle().clone();
    let seen = Rc::new(Cell::new(None));
    {
      let seen = seen.clone();
      let inner_handle = handle.clone();
      handle.enqueue_in(ContextToken(7), "outer", move || {
        let observer = inner_handle.clone();
        inner_handle
          .enqueue("inner", move || seen.set(observer.current_context()));
      });
    }
    event_loop.run().unwrap();
    assert_eq!(seen.get(), Some(ContextToken(7)));
    assert_eq!(handle.current_context(), None);
  }

  #[test]
  fn blocking_work_completes_on_loop_thread() {
    let event_loop = new_loop();
    let handle = event_loop.handle();
    let loop_thread = std::thread::current().id();
    let result = Rc::new(RefCell::new(None));
    {
      let result = result.clone();
      handle.spawn_blocking(
        "compute",
        move || (std::thread::current().id(), 6 * 7),
        move |value| {
          assert_eq!(std::thread::current().id(), loop_thread);
          *result.borrow_mut() = Some(value);
        },
      );
    }
    assert_eq!(event_loop.pins().count(), 1);
    event_loop.run().unwrap();
    let (worker_thread, value) = result.borrow_mut().take().unwrap().unwrap();
    assert_ne!(worker_thread, loop_thread);
    assert_eq!(value, 42);
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn panicking_job_reports_error_and_unpins() {
    let event_loop = new_loop();
    let result = Rc::new(RefCell::new(None));
    {
      let result = result.clone();
      event_loop.handle().spawn_blocking(
        "explode",
        || -> u8 { panic!("worker exploded") },
        move |value| *result.borrow_mut() = Some(value),
      );
    }
    event_loop.run().unwrap();
    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Io);
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn remote_tasks_wake_the_loop() {
    let event_loop = new_loop();
    let remote = event_loop.handle().remote();
    event_loop.pins().pin();
    let pins = event_loop.pins().clone();
    let thread = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      remote.enqueue("release", move || pins.unpin());
    });
    event_loop.run().unwrap();
    thread.join().unwrap();
    assert_eq!(event_loop.pins().count(), 0);
  }

  #[test]
  fn stop_ends_run_while_pinned() {
    let event_loop = new_loop();
    event_loop.pins().pin();
    let handle = event_loop.handle().clone();
    event_loop.handle().enqueue("stop", move || handle.stop());
    event_loop.run().unwrap();
    assert!(event_loop.is_alive());
  }

  struct Leaky {
    closed: Cell<bool>,
  }

  impl Closable for Leaky {
    fn close(&self) {
      self.closed.set(true);
    }

    fn is_closed(&self) -> bool {
      self.closed.get()
    }
  }

  #[test]
  fn shutdown_closes_leaked_handles_then_runs_hooks() {
    let event_loop = new_loop();
    let leaky = Rc::new(Leaky {
      closed: Cell::new(false),
    });
    let weak: Weak<dyn Closable> = Rc::<Leaky>::downgrade(&leaky);
    event_loop.handle().register_handle(HandleKind::Tcp, weak);
    let order = Rc::new(RefCell::new(Vec::new()));
    {
      let order = order.clone();
      let leaky = leaky.clone();
      event_loop
        .handle()
        .on_shutdown(move || order.borrow_mut().push(leaky.closed.get()));
    }
    assert_eq!(event_loop.shutdown(), 1);
    assert_eq!(*order.borrow(), vec![true]);
    assert_eq!(event_loop.shutdown(), 0);
  }
}
