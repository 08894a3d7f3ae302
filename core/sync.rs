// Copyright 2026 the Cinder authors. MIT license.

//! Futures-based synchronization: an async mutex with an RAII guard, an
//! unbounded queue with a terminal error, and a one-shot event.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;

use crate::error::CancelKind;
use crate::task::current_cancel_requested;

struct LockInner {
  locked: bool,
  waiters: VecDeque<Waker>,
}

/// An asynchronous mutex. The guard releases on drop, so a task cancelled
/// while holding the lock still releases it.
#[derive(Clone)]
pub struct AsyncLock {
  inner: Rc<RefCell<LockInner>>,
}

impl Default for AsyncLock {
  fn default() -> Self {
    Self::new()
  }
}

impl AsyncLock {
  pub fn new() -> Self {
    AsyncLock {
      inner: Rc::new(RefCell::new(LockInner {
        locked: false,
        waiters: VecDeque::new(),
      })),
    }
  }

  pub fn is_locked(&self) -> bool {
    self.inner.borrow().locked
  }

  pub fn acquire<E: From<CancelKind>>(&self) -> LockAcquire<E> {
    LockAcquire {
      lock: self.clone(),
      _marker: PhantomData,
    }
  }
}

pub struct LockAcquire<E> {
  lock: AsyncLock,
  _marker: PhantomData<fn() -> E>,
}

impl<E: From<CancelKind>> Future for LockAcquire<E> {
  type Output = Result<LockGuard, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if let Some(kind) = current_cancel_requested() {
      return Poll::Ready(Err(E::from(kind)));
    }
    let mut inner = self.lock.inner.borrow_mut();
    if !inner.locked {
      inner.locked = true;
      return Poll::Ready(Ok(LockGuard {
        lock: self.lock.clone(),
      }));
    }
    inner.waiters.push_back(cx.waker().clone());
    Poll::Pending
  }
}

pub struct LockGuard {
  lock: AsyncLock,
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    let mut inner = self.lock.inner.borrow_mut();
    inner.locked = false;
    if let Some(waker) = inner.waiters.pop_front() {
      waker.wake();
    }
  }
}

struct QueueInner<T, E> {
  items: VecDeque<T>,
  error: Option<E>,
  max_length: Option<usize>,
  waiters: Vec<Waker>,
}

/// An asynchronous FIFO queue. Once a terminal error is set, every
/// subsequent receive returns a clone of it; an optional length cap evicts
/// the oldest element on overflow.
pub struct AsyncQueue<T, E> {
  inner: Rc<RefCell<QueueInner<T, E>>>,
}

impl<T, E> Clone for AsyncQueue<T, E> {
  fn clone(&self) -> Self {
    AsyncQueue {
      inner: self.inner.clone(),
    }
  }
}

impl<T, E: Clone + From<CancelKind>> AsyncQueue<T, E> {
  pub fn new(max_length: Option<usize>) -> Self {
    AsyncQueue {
      inner: Rc::new(RefCell::new(QueueInner {
        items: VecDeque::new(),
        error: None,
        max_length,
        waiters: Vec::new(),
      })),
    }
  }

  pub fn push(&self, item: T) {
    let mut inner = self.inner.borrow_mut();
    if let Some(max_length) = inner.max_length {
      while inner.items.len() >= max_length {
        inner.items.pop_front();
      }
    }
    inner.items.push_back(item);
    for waker in inner.waiters.drain(..) {
      waker.wake();
    }
  }

  /// Sets the terminal error; queued items are still delivered first.
  pub fn set_error(&self, error: E) {
    let mut inner = self.inner.borrow_mut();
    if inner.error.is_none() {
      inner.error = Some(error);
    }
    for waker in inner.waiters.drain(..) {
      waker.wake();
    }
  }

  pub fn len(&self) -> usize {
    self.inner.borrow().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.borrow().items.is_empty()
  }

  /// Non-blocking receive: `Ok(None)` when nothing is queued yet.
  pub fn try_get(&self) -> Result<Option<T>, E> {
    let mut inner = self.inner.borrow_mut();
    if let Some(item) = inner.items.pop_front() {
      return Ok(Some(item));
    }
    match &inner.error {
      Some(error) => Err(error.clone()),
      None => Ok(None),
    }
  }

  pub fn get(&self) -> QueueGet<T, E> {
    QueueGet {
      queue: self.clone(),
    }
  }
}

pub struct QueueGet<T, E> {
  queue: AsyncQueue<T, E>,
}

impl<T, E: Clone + From<CancelKind>> Future for QueueGet<T, E> {
  type Output = Result<T, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.queue.inner.borrow_mut();
    if let Some(item) = inner.items.pop_front() {
      return Poll::Ready(Ok(item));
    }
    if let Some(error) = &inner.error {
      return Poll::Ready(Err(error.clone()));
    }
    if let Some(kind) = current_cancel_requested() {
      return Poll::Ready(Err(E::from(kind)));
    }
    inner.waiters.push(cx.waker().clone());
    Poll::Pending
  }
}

struct EventInner {
  set: bool,
  waiters: Vec<Waker>,
}

/// A one-shot event: many waiters, set once.
#[derive(Clone)]
pub struct AsyncEvent {
  inner: Rc<RefCell<EventInner>>,
}

impl Default for AsyncEvent {
  fn default() -> Self {
    Self::new()
  }
}

impl AsyncEvent {
  pub fn new() -> Self {
    AsyncEvent {
      inner: Rc::new(RefCell::new(EventInner {
        set: false,
        waiters: Vec::new(),
      })),
    }
  }

  pub fn is_set(&self) -> bool {
    self.inner.borrow().set
  }

  pub fn set(&self) {
    let mut inner = self.inner.borrow_mut();
    inner.set = true;
    for waker in inner.waiters.drain(..) {
      waker.wake();
    }
  }

  pub fn wait<E: From<CancelKind>>(&self) -> EventWait<E> {
    EventWait {
      event: self.clone(),
      _marker: PhantomData,
    }
  }
}

pub struct EventWait<E> {
  event: AsyncEvent,
  _marker: PhantomData<fn() -> E>,
}

impl<E: From<CancelKind>> Future for EventWait<E> {
  type Output = Result<(), E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.event.inner.borrow_mut();
    if inner.set {
      return Poll::Ready(Ok(()));
    }
    if let Some(kind) = current_cancel_requested() {
      return Poll::Ready(Err(E::from(kind)));
    }
    inner.waiters.push(cx.waker().clone());
    Poll::Pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CoreError;
  use crate::event_loop::EventLoop;

  #[test]
  fn lock_serializes_critical_sections() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let result: Result<(), CoreError> = event_loop.run_until(async move {
      let lock = AsyncLock::new();
      let trace = Rc::new(RefCell::new(Vec::new()));
      let mut handles = Vec::new();
      for index in 0..3 {
        let lock = lock.clone();
        let trace = trace.clone();
        let inner_lp = lp.clone();
        handles.push(lp.spawn(async move {
          let _guard = lock.acquire::<CoreError>().await?;
          trace.borrow_mut().push((index, 'a'));
          crate::future_ops::sleep::<CoreError>(&inner_lp, 0.001).await?;
          trace.borrow_mut().push((index, 'b'));
          Ok::<(), CoreError>(())
        }));
      }
      for handle in handles {
        handle.await?;
      }
      let trace = trace.borrow();
      // Sections never interleave.
      for pair in trace.chunks(2) {
        assert_eq!(pair[0].0, pair[1].0);
        assert_eq!(pair[0].1, 'a');
        assert_eq!(pair[1].1, 'b');
      }
      Ok(())
    });
    result.unwrap();
  }

  #[test]
  fn queue_replays_terminal_error() {
    let event_loop = EventLoop::new().unwrap();
    let result: Result<(), CoreError> = event_loop.run_until(async move {
      let queue: AsyncQueue<u32, CoreError> = AsyncQueue::new(None);
      queue.push(1);
      queue.set_error(CoreError::ConnectionReset("done".into()));
      assert_eq!(queue.get().await.unwrap(), 1);
      assert!(matches!(
        queue.get().await,
        Err(CoreError::ConnectionReset(_))
      ));
      assert!(matches!(
        queue.get().await,
        Err(CoreError::ConnectionReset(_))
      ));
      Ok(())
    });
    result.unwrap();
  }

  #[test]
  fn queue_caps_length() {
    let queue: AsyncQueue<u32, CoreError> = AsyncQueue::new(Some(2));
    queue.push(1);
    queue.push(2);
    queue.push(3);
    assert_eq!(queue.try_get().unwrap(), Some(2));
    assert_eq!(queue.try_get().unwrap(), Some(3));
    assert_eq!(queue.try_get().unwrap(), None);
  }
}
