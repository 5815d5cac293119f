// Copyright 2018-2026 the Deno authors. MIT license.

#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![deny(clippy::unused_async)]
#![deny(clippy::unnecessary_wraps)]

pub mod error;
pub mod event_loop;
pub mod handle;
pub mod pin;
pub mod reactor;
mod task_queue;
pub mod timers;
mod worker;

// Re-exports
pub use bytes;
pub use parking_lot;
pub use thiserror;

pub use crate::error::ErrorCode;
pub use crate::error::ErrorContext;
pub use crate::error::OsError;
pub use crate::error::OsResult;
pub use crate::event_loop::EventLoop;
pub use crate::event_loop::LoopError;
pub use crate::event_loop::LoopHandle;
pub use crate::event_loop::LoopOptions;
pub use crate::event_loop::RunMode;
pub use crate::handle::Closable;
pub use crate::handle::HandleKey;
pub use crate::handle::HandleKind;
pub use crate::handle::ReadCallback;
pub use crate::handle::ReadEvent;
pub use crate::handle::Readable;
pub use crate::handle::Refable;
pub use crate::handle::Writable;
pub use crate::handle::WriteCallback;
pub use crate::pin::PinCounter;
pub use crate::pin::PinState;
pub use crate::reactor::LoopWaker;
pub use crate::reactor::ParkReactor;
pub use crate::reactor::Reactor;
pub use crate::task_queue::ContextToken;
pub use crate::task_queue::RemoteSender;
pub use crate::task_queue::Task;
pub use crate::timers::Clock;
pub use crate::timers::MonotonicClock;
pub use crate::timers::TimerHandle;
pub use crate::timers::VirtualClock;
