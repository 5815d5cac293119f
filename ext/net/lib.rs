// Copyright 2018-2026 the Deno authors. MIT license.

mod reactor;
pub mod tcp;

use std::rc::Rc;

use skiff_core::LoopHandle;

pub use crate::reactor::NetReactor;
pub use crate::tcp::ConnectCallback;
pub use crate::tcp::ConnectionCallback;
pub use crate::tcp::READ_BUFFER_SIZE;
pub use crate::tcp::TcpHandle;
pub use crate::tcp::TcpState;

/// Socket factory for one event loop. The loop must poll the same
/// [`NetReactor`] for handles created here to make progress.
#[derive(Clone)]
pub struct Net {
  reactor: Rc<NetReactor>,
  loop_handle: LoopHandle,
}

impl Net {
  pub fn new(reactor: Rc<NetReactor>, loop_handle: &LoopHandle) -> Self {
    Self {
      reactor,
      loop_handle: loop_handle.clone(),
    }
  }

  pub fn reactor(&self) -> &Rc<NetReactor> {
    &self.reactor
  }

  pub fn loop_handle(&self) -> &LoopHandle {
    &self.loop_handle
  }

  pub fn tcp(&self) -> TcpHandle {
    TcpHandle::new(self)
  }
}
