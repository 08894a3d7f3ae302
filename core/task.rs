// Copyright 2026 the Cinder authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Wake;
use std::task::Waker;

use crate::error::CancelKind;
use crate::event_loop::EventLoop;
use crate::event_loop::Msg;
use crate::event_loop::Shared;
use crate::event_loop::TaskEntry;
use crate::future::Promise;

/// Cancellation state of one task. `pending` is consumed when the
/// cancellation is delivered at a suspension point — a task that catches it
/// keeps running and is not re-cancelled. `requested` records that a
/// cancellation was ever asked for.
pub(crate) struct CancelState {
  pending: Cell<Option<CancelKind>>,
  requested: Cell<Option<CancelKind>>,
}

impl CancelState {
  pub(crate) fn new() -> Rc<CancelState> {
    Rc::new(CancelState {
      pending: Cell::new(None),
      requested: Cell::new(None),
    })
  }

  pub(crate) fn request(&self, kind: CancelKind) {
    if self.requested.get().is_none() {
      self.requested.set(Some(kind));
    }
    if self.pending.get().is_none() {
      self.pending.set(Some(kind));
    }
  }

  pub(crate) fn take_pending(&self) -> Option<CancelKind> {
    self.pending.take()
  }

  pub(crate) fn requested(&self) -> Option<CancelKind> {
    self.requested.get()
  }
}

thread_local! {
  static CURRENT_CANCEL: RefCell<Option<Rc<CancelState>>> =
    const { RefCell::new(None) };
}

pub(crate) fn enter_task(state: Rc<CancelState>) -> Option<Rc<CancelState>> {
  CURRENT_CANCEL.with(|current| current.replace(Some(state)))
}

pub(crate) fn leave_task(previous: Option<Rc<CancelState>>) {
  CURRENT_CANCEL.with(|current| {
    *current.borrow_mut() = previous;
  });
}

/// Consumes a pending cancellation request of the running task, if any.
/// Called by every suspension-point future; this is how a `cancel()` turns
/// into a typed error at the awaiter.
pub(crate) fn current_cancel_requested() -> Option<CancelKind> {
  CURRENT_CANCEL.with(|current| {
    current.borrow().as_ref().and_then(|state| state.take_pending())
  })
}

struct TaskWaker {
  key: usize,
  generation: u64,
  shared: Arc<Shared>,
}

impl Wake for TaskWaker {
  fn wake(self: Arc<Self>) {
    self.shared.schedule(Msg::WakeTask(self.key, self.generation));
  }

  fn wake_by_ref(self: &Arc<Self>) {
    self.shared.schedule(Msg::WakeTask(self.key, self.generation));
  }
}

/// Handle of a spawned task. The handle is itself a completion future: it
/// can be awaited, given done-callbacks, cancelled and chained like any
/// other [`Promise`].
pub struct TaskHandle<T, E> {
  promise: Promise<T, E>,
  cancel: Rc<CancelState>,
  key: usize,
  generation: u64,
}

impl<T, E> Clone for TaskHandle<T, E> {
  fn clone(&self) -> Self {
    TaskHandle {
      promise: self.promise.clone(),
      cancel: self.cancel.clone(),
      key: self.key,
      generation: self.generation,
    }
  }
}

impl<T: 'static, E: From<CancelKind> + 'static> TaskHandle<T, E> {
  pub fn is_done(&self) -> bool {
    self.promise.is_done()
  }

  pub fn promise(&self) -> &Promise<T, E> {
    &self.promise
  }

  pub fn add_done_callback(
    &self,
    callback: impl FnOnce(&EventLoop) + 'static,
  ) {
    self.promise.add_done_callback(callback);
  }

  pub fn take_result(&self) -> Option<Result<T, E>> {
    self.promise.take_result()
  }

  /// Requests cancellation: the task observes it at its next suspension
  /// point as `E::from(CancelKind::Cancelled)`. Returns whether the request
  /// was effective (the task had not finished yet).
  pub fn cancel(&self) -> bool {
    self.cancel_with(CancelKind::Cancelled)
  }

  pub fn cancel_with(&self, kind: CancelKind) -> bool {
    if self.promise.is_done() {
      return false;
    }
    self.cancel.request(kind);
    self.promise.event_loop().schedule_task(self.key, self.generation);
    true
  }

  /// Whether a cancellation was ever requested, and of which kind.
  pub fn cancel_requested(&self) -> Option<CancelKind> {
    self.cancel.requested()
  }

  pub(crate) fn id(&self) -> (usize, u64) {
    (self.key, self.generation)
  }

  pub(crate) fn same_loop(&self, event_loop: &EventLoop) -> bool {
    Rc::ptr_eq(&self.promise.event_loop().inner, &event_loop.inner)
  }

  /// Arms a timer that cancels the task with `TimedOut` after `seconds`.
  /// The timer is dropped when the task completes first.
  pub fn apply_timeout(&self, seconds: f64) {
    let this = self.clone();
    let timer = self.promise.event_loop().call_later(seconds, move |_| {
      this.cancel_with(CancelKind::TimedOut);
    });
    self.promise.add_done_callback(move |_| timer.cancel());
  }
}

impl<T: 'static, E: From<CancelKind> + 'static> Future for TaskHandle<T, E> {
  type Output = Result<T, E>;

  fn poll(
    mut self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Self::Output> {
    std::pin::Pin::new(&mut self.promise).poll(cx)
  }
}

impl EventLoop {
  /// Spawns a cooperative task on this loop and returns its handle. The
  /// task starts on the next loop iteration.
  pub fn spawn<T, E, F>(&self, future: F) -> TaskHandle<T, E>
  where
    T: 'static,
    E: From<CancelKind> + 'static,
    F: Future<Output = Result<T, E>> + 'static,
  {
    let promise: Promise<T, E> = self.promise();
    let completion = promise.clone();
    let wrapped = async move {
      let result = future.await;
      completion.complete_if_pending(result);
    };

    let cancel = CancelState::new();
    let generation = self.next_task_gen();
    let key = {
      let mut tasks = self.inner.tasks.borrow_mut();
      let entry = tasks.vacant_entry();
      let key = entry.key();
      let waker = Waker::from(Arc::new(TaskWaker {
        key,
        generation,
        shared: self.inner.shared.clone(),
      }));
      entry.insert(TaskEntry {
        generation,
        future: Some(Box::pin(wrapped)),
        cancel: cancel.clone(),
        waker,
        scheduled: false,
      });
      key
    };
    self.schedule_task(key, generation);

    TaskHandle {
      promise,
      cancel,
      key,
      generation,
    }
  }

  /// Drives the loop until `future` completes and returns its output.
  pub fn run_until<T, E, F>(&self, future: F) -> Result<T, E>
  where
    T: 'static,
    E: From<CancelKind> + 'static,
    F: Future<Output = Result<T, E>> + 'static,
  {
    let handle = self.spawn(future);
    while !handle.is_done() {
      self.run_once(None);
    }
    match handle.take_result() {
      Some(result) => result,
      None => unreachable!("task completed without a result"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CoreError;
  use crate::future_ops::sleep;

  #[test]
  fn spawn_and_run_until() {
    let event_loop = EventLoop::new().unwrap();
    let result: Result<u32, CoreError> =
      event_loop.run_until(async move { Ok(7) });
    assert_eq!(result.unwrap(), 7);
  }

  #[test]
  fn task_cancellation_is_typed() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let result: Result<(), CoreError> = event_loop.run_until(async move {
      let inner: TaskHandle<(), CoreError> = lp.spawn({
        let lp = lp.clone();
        async move {
          sleep::<CoreError>(&lp, 30.0).await?;
          Ok(())
        }
      });
      let cancel_target = inner.clone();
      lp.call_soon(move |_| {
        assert!(cancel_target.cancel());
      });
      match inner.await {
        Err(CoreError::Cancelled) => Ok(()),
        other => panic!("expected cancellation, got {other:?}"),
      }
    });
    result.unwrap();
  }

  #[test]
  fn timeout_is_distinguishable() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let result: Result<(), CoreError> = event_loop.run_until(async move {
      let inner: TaskHandle<(), CoreError> = lp.spawn({
        let lp = lp.clone();
        async move {
          sleep::<CoreError>(&lp, 30.0).await?;
          Ok(())
        }
      });
      inner.apply_timeout(0.01);
      match inner.await {
        Err(CoreError::TimedOut) => Ok(()),
        other => panic!("expected timeout, got {other:?}"),
      }
    });
    result.unwrap();
  }

  #[test]
  fn call_soon_runs_in_submission_order() {
    let event_loop = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    for index in 0..4 {
      let order = order.clone();
      event_loop.call_soon(move |_| order.borrow_mut().push(index));
    }
    event_loop.run_once(Some(std::time::Duration::ZERO));
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
  }
}
