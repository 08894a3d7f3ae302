// Copyright 2026 the Cinder authors. MIT license.

//! Combinators over promises and task handles: `sleep`, `gather`, `shield`,
//! `wait`, `as_completed` and the cross-loop bridge `async_wrap`.

use std::cell::Cell;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use crate::error::CancelKind;
use crate::event_loop::EventLoop;
use crate::future::CrossPromise;
use crate::future::Promise;
use crate::task::TaskHandle;

/// Resolves after `seconds` of loop time.
pub fn sleep<E: From<CancelKind> + 'static>(
  event_loop: &EventLoop,
  seconds: f64,
) -> Promise<(), E> {
  let promise: Promise<(), E> = event_loop.promise();
  let completion = promise.clone();
  event_loop.call_later(seconds, move |_| {
    completion.set_result_if_pending(());
  });
  promise
}

/// Runs `future` as its own task so that cancelling the *awaiting* task
/// does not cancel the inner work: the cancellation stops at the handle.
pub fn shield<T, E, F>(event_loop: &EventLoop, future: F) -> TaskHandle<T, E>
where
  T: 'static,
  E: From<CancelKind> + 'static,
  F: Future<Output = Result<T, E>> + 'static,
{
  event_loop.spawn(future)
}

struct GatherState<T, E> {
  slots: Vec<Option<Result<T, E>>>,
  remaining: usize,
}

/// Completes when every input completes. Without `return_exceptions`, the
/// first error from a child that was *not* cancelled resolves the gather
/// with that error and cancels the remaining children; otherwise every slot
/// holds its child's result or error, in input order.
///
/// Panics when the handles belong to a different loop.
pub fn gather<T, E>(
  event_loop: &EventLoop,
  handles: Vec<TaskHandle<T, E>>,
  return_exceptions: bool,
) -> Promise<Vec<Result<T, E>>, E>
where
  T: 'static,
  E: From<CancelKind> + 'static,
{
  let result_promise: Promise<Vec<Result<T, E>>, E> = event_loop.promise();
  if handles.is_empty() {
    result_promise.set_result(Vec::new());
    return result_promise;
  }

  let state = Rc::new(RefCell::new(GatherState {
    slots: (0..handles.len()).map(|_| None).collect(),
    remaining: handles.len(),
  }));

  let all: Rc<Vec<TaskHandle<T, E>>> = Rc::new(handles);
  for (index, handle) in all.iter().enumerate() {
    assert!(
      handle.same_loop(event_loop),
      "gather over futures of another event loop"
    );
    let state = state.clone();
    let result_promise = result_promise.clone();
    let handle = handle.clone();
    let all = all.clone();
    handle.clone().add_done_callback(move |_| {
      if result_promise.is_done() {
        return;
      }
      let result = match handle.take_result() {
        Some(result) => result,
        None => Err(E::from(CancelKind::Cancelled)),
      };
      if !return_exceptions {
        if result.is_err() && handle.cancel_requested().is_none() {
          if let Err(error) = result {
            result_promise.set_error_if_pending(error);
            for other in all.iter() {
              other.cancel();
            }
          }
          return;
        }
      }
      let mut state = state.borrow_mut();
      state.slots[index] = Some(result);
      state.remaining -= 1;
      if state.remaining == 0 {
        let slots = std::mem::take(&mut state.slots);
        drop(state);
        let results = slots.into_iter().flatten().collect();
        result_promise.set_result_if_pending(results);
      }
    });
  }
  result_promise
}

/// When `wait` resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnWhen {
  FirstCompleted,
  FirstException,
  AllCompleted,
}

/// Waits for the given tasks and resolves to `(done, pending)` handles.
/// Results stay inside the handles for the caller to take. A timeout
/// resolves early with whatever partition holds at that moment.
///
/// Panics on empty input.
pub fn wait<T, E>(
  event_loop: &EventLoop,
  handles: Vec<TaskHandle<T, E>>,
  timeout: Option<f64>,
  return_when: ReturnWhen,
) -> Promise<(Vec<TaskHandle<T, E>>, Vec<TaskHandle<T, E>>), E>
where
  T: 'static,
  E: From<CancelKind> + 'static,
{
  assert!(!handles.is_empty(), "wait() requires at least one task");
  let result_promise = event_loop.promise();
  let all: Rc<Vec<TaskHandle<T, E>>> = Rc::new(handles);

  let resolve = {
    let result_promise = result_promise.clone();
    let all = all.clone();
    Rc::new(move || {
      let mut done = Vec::new();
      let mut pending = Vec::new();
      for handle in all.iter() {
        if handle.is_done() {
          done.push(handle.clone());
        } else {
          pending.push(handle.clone());
        }
      }
      result_promise.set_result_if_pending((done, pending));
    })
  };

  if let Some(timeout) = timeout {
    let resolve = resolve.clone();
    let timer = event_loop.call_later(timeout, move |_| resolve());
    result_promise.add_done_callback(move |_| timer.cancel());
  }

  let remaining = Rc::new(Cell::new(all.len()));
  for handle in all.iter() {
    assert!(
      handle.same_loop(event_loop),
      "wait over futures of another event loop"
    );
    let resolve = resolve.clone();
    let remaining = remaining.clone();
    let observed = handle.clone();
    handle.clone().add_done_callback(move |_| {
      remaining.set(remaining.get() - 1);
      let finished = remaining.get() == 0;
      match return_when {
        ReturnWhen::FirstCompleted => resolve(),
        ReturnWhen::FirstException => {
          if observed.promise().is_err() == Some(true) || finished {
            resolve();
          }
        }
        ReturnWhen::AllCompleted => {
          if finished {
            resolve();
          }
        }
      }
    });
  }
  result_promise
}

/// Returns one output promise per distinct input; the k-th output resolves
/// with the k-th input to finish. On timeout every unresolved output fails
/// with `TimedOut`. Duplicate handles count once.
pub fn as_completed<T, E>(
  event_loop: &EventLoop,
  handles: Vec<TaskHandle<T, E>>,
  timeout: Option<f64>,
) -> Vec<Promise<T, E>>
where
  T: 'static,
  E: From<CancelKind> + 'static,
{
  let mut seen = Vec::new();
  let mut unique = Vec::new();
  for handle in handles {
    if seen.contains(&handle.id()) {
      continue;
    }
    seen.push(handle.id());
    unique.push(handle);
  }

  let outputs: Vec<Promise<T, E>> =
    (0..unique.len()).map(|_| event_loop.promise()).collect();
  let outputs_shared = Rc::new(outputs.clone());
  let next = Rc::new(Cell::new(0usize));

  for handle in &unique {
    assert!(
      handle.same_loop(event_loop),
      "as_completed over futures of another event loop"
    );
    let outputs = outputs_shared.clone();
    let next = next.clone();
    let handle = handle.clone();
    handle.clone().add_done_callback(move |_| {
      let index = next.get();
      if index >= outputs.len() {
        return;
      }
      next.set(index + 1);
      if let Some(result) = handle.take_result() {
        outputs[index].complete_if_pending(result);
      }
    });
  }

  if let Some(timeout) = timeout {
    let outputs = outputs_shared;
    event_loop.call_later(timeout, move |_| {
      for output in outputs.iter() {
        output.cancel_with(CancelKind::TimedOut);
      }
    });
  }
  outputs
}

/// Bridges a loop-pinned promise to a `Send` future that any other loop or
/// thread may await. Must be called on the promise's owning loop thread.
pub fn async_wrap<T, E>(promise: &Promise<T, E>) -> CrossPromise<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  let cross = CrossPromise::new();
  let completion = cross.clone();
  let source = promise.clone();
  promise.add_done_callback(move |_| {
    if let Some(result) = source.take_result() {
      completion.complete(result);
    }
  });
  cross
}
