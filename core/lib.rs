// Copyright 2026 the Cinder authors. MIT license.

//! A cooperative single-threaded event loop with completion-based futures,
//! cancellable tasks and callback-driven transports. One loop owns one OS
//! thread; other threads talk to it through [`LoopProxy`].

mod error;
mod event_loop;
mod executor;
mod future;
mod future_ops;
mod sync;
mod task;
mod tcp;
mod time;
mod transport;

pub use crate::error::CancelKind;
pub use crate::error::CoreError;
pub use crate::event_loop::EventLoop;
pub use crate::event_loop::LoopProxy;
pub use crate::event_loop::TimerHandle;
pub use crate::event_loop::TimerWeakHandle;
pub use crate::future::CrossPromise;
pub use crate::future::Promise;
pub use crate::future_ops::as_completed;
pub use crate::future_ops::async_wrap;
pub use crate::future_ops::gather;
pub use crate::future_ops::shield;
pub use crate::future_ops::sleep;
pub use crate::future_ops::wait;
pub use crate::future_ops::ReturnWhen;
pub use crate::sync::AsyncEvent;
pub use crate::sync::AsyncLock;
pub use crate::sync::AsyncQueue;
pub use crate::sync::LockGuard;
pub use crate::task::TaskHandle;
pub use crate::tcp::TcpServer;
pub use crate::tcp::TcpTransport;
pub use crate::time::loop_time;
pub use crate::transport::ExtraInfo;
pub use crate::transport::Protocol;
pub use crate::transport::Transport;
