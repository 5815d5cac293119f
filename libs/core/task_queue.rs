// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::reactor::LoopWaker;

/// Identifies the script context that owns a task, so errors raised while
/// running it can be routed back to that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(pub u64);

pub type TaskCallback = Box<dyn FnOnce() + 'static>;

/// A unit of script-visible work, run exactly once on the loop thread.
pub struct Task {
  pub(crate) name: &'static str,
  pub(crate) context: Option<ContextToken>,
  pub(crate) depth: usize,
  pub(crate) callback: TaskCallback,
}

impl Task {
  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn context(&self) -> Option<ContextToken> {
    self.context
  }

  pub fn depth(&self) -> usize {
    self.depth
  }
}

impl fmt::Debug for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("name", &self.name)
      .field("context", &self.context)
      .field("depth", &self.depth)
      .finish()
  }
}

/// FIFO of tasks owned by the loop thread.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
  tasks: RefCell<VecDeque<Task>>,
}

impl TaskQueue {
  pub fn push(&self, task: Task) {
    self.tasks.borrow_mut().push_back(task);
  }

  pub fn pop(&self) -> Option<Task> {
    self.tasks.borrow_mut().pop_front()
  }

  pub fn len(&self) -> usize {
    self.tasks.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.borrow().is_empty()
  }
}

pub(crate) enum RemoteMessage {
  /// A worker finished the job stored under this completion key.
  Complete(usize),
  Run(&'static str, Box<dyn FnOnce() + Send + 'static>),
}

/// Messages posted from other threads, turned into tasks by the loop.
pub(crate) struct Inbox {
  messages: Mutex<VecDeque<RemoteMessage>>,
  waker: Arc<dyn LoopWaker>,
}

impl Inbox {
  pub fn new(waker: Arc<dyn LoopWaker>) -> Self {
    Self {
      messages: Mutex::new(VecDeque::new()),
      waker,
    }
  }

  pub fn post(&self, message: RemoteMessage) {
    self.messages.lock().push_back(message);
    self.waker.wake();
  }

  pub fn take_all(&self) -> VecDeque<RemoteMessage> {
    std::mem::take(&mut *self.messages.lock())
  }

  pub fn has_pending(&self) -> bool {
    !self.messages.lock().is_empty()
  }
}

/// Enqueues tasks onto a loop from any thread. Tasks sent through one
/// sender run in the order they were sent.
#[derive(Clone)]
pub struct RemoteSender {
  inbox: Arc<Inbox>,
}

impl RemoteSender {
  pub(crate) fn new(inbox: Arc<Inbox>) -> Self {
    Self { inbox }
  }

  pub fn enqueue(
    &self,
    name: &'static str,
    callback: impl FnOnce() + Send + 'static,
  ) {
    self
      .inbox
      .post(RemoteMessage::Run(name, Box::new(callback)));
  }

  pub(crate) fn complete(&self, key: usize) {
    self.inbox.post(RemoteMessage::Complete(key));
  }
}

impl fmt::Debug for RemoteSender {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RemoteSender").finish_non_exhaustive()
  }
}
