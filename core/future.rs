// Copyright 2026 the Cinder authors. MIT license.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use parking_lot::Mutex;

use crate::error::CancelKind;
use crate::event_loop::EventLoop;
use crate::task::current_cancel_requested;

enum PromiseValue<T, E> {
  Pending,
  Done(Result<T, E>),
  Taken,
}

struct PromiseInner<T, E> {
  value: PromiseValue<T, E>,
  cancelled: bool,
  callbacks: Vec<Box<dyn FnOnce(&EventLoop)>>,
  waker: Option<Waker>,
  done_wakers: Vec<Waker>,
}

/// A completion-based future pinned to one event loop.
///
/// Becomes terminal exactly once; done-callbacks run on the owning loop in
/// registration order. Awaiting moves the completion value out, so a promise
/// has at most one awaiter; observers that only need the completion event
/// use [`Promise::wait_done`]. Completing from a foreign thread is forbidden
/// — route through [`crate::LoopProxy::call_soon_threadsafe`] instead.
pub struct Promise<T, E> {
  inner: Rc<RefCell<PromiseInner<T, E>>>,
  event_loop: EventLoop,
}

impl<T, E> Clone for Promise<T, E> {
  fn clone(&self) -> Self {
    Promise {
      inner: self.inner.clone(),
      event_loop: self.event_loop.clone(),
    }
  }
}

impl<T: 'static, E: 'static> Promise<T, E> {
  pub fn new(event_loop: &EventLoop) -> Self {
    Promise {
      inner: Rc::new(RefCell::new(PromiseInner {
        value: PromiseValue::Pending,
        cancelled: false,
        callbacks: Vec::new(),
        waker: None,
        done_wakers: Vec::new(),
      })),
      event_loop: event_loop.clone(),
    }
  }

  pub fn event_loop(&self) -> &EventLoop {
    &self.event_loop
  }

  pub fn is_done(&self) -> bool {
    !matches!(self.inner.borrow().value, PromiseValue::Pending)
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.borrow().cancelled
  }

  /// Whether the promise completed with an error. `None` while pending or
  /// after the value was moved out.
  pub fn is_err(&self) -> Option<bool> {
    match &self.inner.borrow().value {
      PromiseValue::Done(result) => Some(result.is_err()),
      _ => None,
    }
  }

  /// Completes with a result. Panics when already terminal; use
  /// [`Promise::set_result_if_pending`] for racy completions.
  pub fn set_result(&self, value: T) {
    assert!(
      self.set_result_if_pending(value),
      "promise completed more than once"
    );
  }

  pub fn set_result_if_pending(&self, value: T) -> bool {
    self.complete(Ok(value), false)
  }

  pub fn set_error(&self, error: E) {
    assert!(
      self.set_error_if_pending(error),
      "promise completed more than once"
    );
  }

  pub fn set_error_if_pending(&self, error: E) -> bool {
    self.complete(Err(error), false)
  }

  pub fn complete_if_pending(&self, result: Result<T, E>) -> bool {
    self.complete(result, false)
  }

  fn complete(&self, result: Result<T, E>, cancelled: bool) -> bool {
    let mut inner = self.inner.borrow_mut();
    if !matches!(inner.value, PromiseValue::Pending) {
      return false;
    }
    inner.value = PromiseValue::Done(result);
    inner.cancelled = cancelled;
    let callbacks = std::mem::take(&mut inner.callbacks);
    let waker = inner.waker.take();
    let done_wakers = std::mem::take(&mut inner.done_wakers);
    drop(inner);

    for callback in callbacks {
      self.event_loop.call_soon(callback);
    }
    if let Some(waker) = waker {
      waker.wake();
    }
    for waker in done_wakers {
      waker.wake();
    }
    true
  }

  /// Registers a completion callback; it runs on the owning loop, on the
  /// tick after completion. Registering on a done promise schedules the
  /// callback for the next tick.
  pub fn add_done_callback(&self, callback: impl FnOnce(&EventLoop) + 'static) {
    let mut inner = self.inner.borrow_mut();
    if matches!(inner.value, PromiseValue::Pending) {
      inner.callbacks.push(Box::new(callback));
    } else {
      drop(inner);
      self.event_loop.call_soon(callback);
    }
  }

  /// Moves the completion value out, if terminal and not yet consumed.
  pub fn take_result(&self) -> Option<Result<T, E>> {
    let mut inner = self.inner.borrow_mut();
    match &inner.value {
      PromiseValue::Done(_) => {
        match std::mem::replace(&mut inner.value, PromiseValue::Taken) {
          PromiseValue::Done(result) => Some(result),
          _ => unreachable!(),
        }
      }
      _ => None,
    }
  }

  /// Resolves when the promise completes, without consuming the value.
  pub fn wait_done<E2: From<CancelKind>>(&self) -> WaitDone<T, E, E2> {
    WaitDone {
      inner: self.inner.clone(),
      _marker: std::marker::PhantomData,
    }
  }
}

impl<T: 'static, E: From<CancelKind> + 'static> Promise<T, E> {
  /// Cancels the promise if still pending; returns whether it was
  /// effective.
  pub fn cancel(&self) -> bool {
    self.cancel_with(CancelKind::Cancelled)
  }

  pub fn cancel_with(&self, kind: CancelKind) -> bool {
    self.complete(Err(E::from(kind)), true)
  }
}

impl<T: 'static, E: From<CancelKind> + 'static> Future for Promise<T, E> {
  type Output = Result<T, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.borrow_mut();
    match &inner.value {
      PromiseValue::Done(_) => {
        match std::mem::replace(&mut inner.value, PromiseValue::Taken) {
          PromiseValue::Done(result) => Poll::Ready(result),
          _ => unreachable!(),
        }
      }
      PromiseValue::Taken => panic!("promise awaited after completion"),
      PromiseValue::Pending => {
        if let Some(kind) = current_cancel_requested() {
          return Poll::Ready(Err(E::from(kind)));
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

/// Future returned by [`Promise::wait_done`]: completion notification that
/// leaves the value in place for the real consumer.
pub struct WaitDone<T, E, E2> {
  inner: Rc<RefCell<PromiseInner<T, E>>>,
  _marker: std::marker::PhantomData<fn() -> E2>,
}

impl<T, E, E2: From<CancelKind>> Future for WaitDone<T, E, E2> {
  type Output = Result<(), E2>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.borrow_mut();
    if !matches!(inner.value, PromiseValue::Pending) {
      return Poll::Ready(Ok(()));
    }
    if let Some(kind) = current_cancel_requested() {
      return Poll::Ready(Err(E2::from(kind)));
    }
    inner.done_wakers.push(cx.waker().clone());
    Poll::Pending
  }
}

struct CrossInner<T, E> {
  value: Option<Result<T, E>>,
  waker: Option<Waker>,
}

/// A one-shot completion cell that crosses threads: completed anywhere,
/// awaited on whichever loop created the awaiting task. The bridge half of
/// [`crate::async_wrap`].
pub struct CrossPromise<T, E> {
  inner: Arc<Mutex<CrossInner<T, E>>>,
}

impl<T, E> Clone for CrossPromise<T, E> {
  fn clone(&self) -> Self {
    CrossPromise {
      inner: self.inner.clone(),
    }
  }
}

impl<T, E> Default for CrossPromise<T, E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T, E> CrossPromise<T, E> {
  pub fn new() -> Self {
    CrossPromise {
      inner: Arc::new(Mutex::new(CrossInner {
        value: None,
        waker: None,
      })),
    }
  }

  pub fn complete(&self, result: Result<T, E>) -> bool {
    let mut inner = self.inner.lock();
    if inner.value.is_some() {
      return false;
    }
    inner.value = Some(result);
    if let Some(waker) = inner.waker.take() {
      waker.wake();
    }
    true
  }
}

impl<T, E: From<CancelKind>> Future for CrossPromise<T, E> {
  type Output = Result<T, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.inner.lock();
    if let Some(result) = inner.value.take() {
      return Poll::Ready(result);
    }
    if let Some(kind) = current_cancel_requested() {
      return Poll::Ready(Err(E::from(kind)));
    }
    inner.waker = Some(cx.waker().clone());
    Poll::Pending
  }
}

impl EventLoop {
  /// Creates a pending [`Promise`] bound to this loop.
  pub fn promise<T: 'static, E: 'static>(&self) -> Promise<T, E> {
    Promise::new(self)
  }
}
