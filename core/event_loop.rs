// Copyright 2026 the Cinder authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use mio::Interest;
use mio::Token;
use parking_lot::Mutex;
use slab::Slab;

use crate::error::CancelKind;
use crate::executor::ThreadPool;
use crate::time::loop_time;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

pub(crate) type LoopCallback = Box<dyn FnOnce(&EventLoop)>;
pub(crate) type IoCallback = Rc<dyn Fn(&EventLoop)>;

/// A callback scheduled onto the loop. Cancelling it flips a flag; the loop
/// silently skips cancelled handles when it pops them.
pub(crate) struct TimerInner {
  cancelled: Cell<bool>,
  callback: RefCell<Option<LoopCallback>>,
}

impl TimerInner {
  fn new(callback: LoopCallback) -> Rc<Self> {
    Rc::new(TimerInner {
      cancelled: Cell::new(false),
      callback: RefCell::new(Some(callback)),
    })
  }

  fn run(&self, event_loop: &EventLoop) {
    if self.cancelled.get() {
      return;
    }
    if let Some(callback) = self.callback.borrow_mut().take() {
      callback(event_loop);
    }
  }
}

/// Cancellation handle for a callback scheduled with `call_later` /
/// `call_at`.
#[derive(Clone)]
pub struct TimerHandle {
  inner: Rc<TimerInner>,
}

impl TimerHandle {
  pub fn cancel(&self) {
    self.inner.cancelled.set(true);
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.get()
  }
}

/// Timer handle bound to a weakly referenced receiver; if the receiver is
/// dropped before the deadline, firing is a no-op, as if the handle had
/// cancelled itself.
#[derive(Clone)]
pub struct TimerWeakHandle {
  inner: Rc<TimerInner>,
}

impl TimerWeakHandle {
  pub fn cancel(&self) {
    self.inner.cancelled.set(true);
  }
}

struct TimerEntry {
  when: f64,
  seq: u64,
  inner: Rc<TimerInner>,
}

impl PartialEq for TimerEntry {
  fn eq(&self, other: &Self) -> bool {
    self.when == other.when && self.seq == other.seq
  }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for TimerEntry {
  // Inverted so the `BinaryHeap` pops the earliest deadline first; `seq`
  // keeps submission order for equal deadlines.
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .when
      .total_cmp(&self.when)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

pub(crate) enum ReadyItem {
  Callback(Rc<TimerInner>),
  Io(IoCallback),
  Task(usize, u64),
}

pub(crate) enum Msg {
  Callback(Box<dyn FnOnce(&EventLoop) + Send>),
  WakeTask(usize, u64),
}

/// The `Send + Sync` half of the loop: the cross-thread queue, the selector
/// waker and the park flag used to avoid lost wakeups.
pub(crate) struct Shared {
  queue: Mutex<Vec<Msg>>,
  waker: mio::Waker,
  parked: AtomicBool,
  thread: std::thread::ThreadId,
}

impl Shared {
  pub(crate) fn schedule(&self, msg: Msg) {
    self.queue.lock().push(msg);
    // The wakeup fd only needs a write when the loop may be parked in the
    // selector, or when the caller is on a foreign thread. The flag is set
    // before the queue is drained, so a racing push always sees it.
    if std::thread::current().id() != self.thread
      || self.parked.load(AtomicOrdering::SeqCst)
    {
      let _ = self.waker.wake();
    }
  }
}

/// Thread-safe scheduling handle of a loop. The only legal way to touch a
/// loop from another thread.
#[derive(Clone)]
pub struct LoopProxy {
  shared: Arc<Shared>,
}

impl LoopProxy {
  pub fn call_soon_threadsafe(
    &self,
    callback: impl FnOnce(&EventLoop) + Send + 'static,
  ) {
    self.shared.schedule(Msg::Callback(Box::new(callback)));
  }
}

pub(crate) struct TaskEntry {
  pub(crate) generation: u64,
  pub(crate) future: Option<Pin<Box<dyn Future<Output = ()>>>>,
  pub(crate) cancel: Rc<crate::task::CancelState>,
  pub(crate) waker: Waker,
  pub(crate) scheduled: bool,
}

pub(crate) struct LoopInner {
  pub(crate) shared: Arc<Shared>,
  registry: mio::Registry,
  poll: RefCell<mio::Poll>,
  events: RefCell<mio::Events>,
  ready: RefCell<VecDeque<ReadyItem>>,
  timers: RefCell<BinaryHeap<TimerEntry>>,
  timer_seq: Cell<u64>,
  task_gen: Cell<u64>,
  pub(crate) tasks: RefCell<Slab<TaskEntry>>,
  io: RefCell<Slab<IoEntry>>,
  stopping: Cell<bool>,
  running: Cell<bool>,
  pub(crate) pool: ThreadPool,
  exception_handler: RefCell<Option<Rc<dyn Fn(&EventLoop, &str)>>>,
  cross: RefCell<std::collections::HashMap<u64, Box<dyn std::any::Any>>>,
  cross_seq: Cell<u64>,
}

#[derive(Default)]
struct IoEntry {
  reader: Option<IoCallback>,
  writer: Option<IoCallback>,
}

/// A cooperative single-threaded event loop: FIFO ready queue, timer heap,
/// mio selector and a thread-safe wakeup queue. All state mutation happens
/// on the owning thread; other threads go through [`LoopProxy`].
#[derive(Clone)]
pub struct EventLoop {
  pub(crate) inner: Rc<LoopInner>,
}

impl EventLoop {
  pub fn new() -> io::Result<EventLoop> {
    let poll = mio::Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
    let shared = Arc::new(Shared {
      queue: Mutex::new(Vec::new()),
      waker,
      parked: AtomicBool::new(false),
      thread: std::thread::current().id(),
    });
    Ok(EventLoop {
      inner: Rc::new(LoopInner {
        shared,
        registry,
        poll: RefCell::new(poll),
        events: RefCell::new(mio::Events::with_capacity(EVENTS_CAPACITY)),
        ready: RefCell::new(VecDeque::new()),
        timers: RefCell::new(BinaryHeap::new()),
        timer_seq: Cell::new(0),
        task_gen: Cell::new(0),
        tasks: RefCell::new(Slab::new()),
        io: RefCell::new(Slab::new()),
        stopping: Cell::new(false),
        running: Cell::new(false),
        pool: ThreadPool::new(),
        exception_handler: RefCell::new(None),
        cross: RefCell::new(std::collections::HashMap::new()),
        cross_seq: Cell::new(0),
      }),
    })
  }

  /// Parks a loop-pinned value so a `Send` closure can retrieve it once it
  /// is marshalled back onto the owning thread.
  pub(crate) fn store_cross(&self, value: Box<dyn std::any::Any>) -> u64 {
    let key = self.inner.cross_seq.get().wrapping_add(1);
    self.inner.cross_seq.set(key);
    self.inner.cross.borrow_mut().insert(key, value);
    key
  }

  pub(crate) fn take_cross(&self, key: u64) -> Option<Box<dyn std::any::Any>> {
    self.inner.cross.borrow_mut().remove(&key)
  }

  /// Thread-safe handle used for `call_soon_threadsafe` and for waking
  /// tasks from foreign threads.
  pub fn proxy(&self) -> LoopProxy {
    LoopProxy {
      shared: self.inner.shared.clone(),
    }
  }

  pub fn is_running(&self) -> bool {
    self.inner.running.get()
  }

  /// Schedules `callback` to run on the next loop iteration. FIFO with
  /// respect to other `call_soon` submissions from the owning thread.
  pub fn call_soon(
    &self,
    callback: impl FnOnce(&EventLoop) + 'static,
  ) -> TimerHandle {
    let inner = TimerInner::new(Box::new(callback));
    self
      .inner
      .ready
      .borrow_mut()
      .push_back(ReadyItem::Callback(inner.clone()));
    TimerHandle { inner }
  }

  /// Schedules `callback` after `delay` seconds of loop time.
  pub fn call_later(
    &self,
    delay: f64,
    callback: impl FnOnce(&EventLoop) + 'static,
  ) -> TimerHandle {
    self.call_at(loop_time() + delay.max(0.0), callback)
  }

  /// Schedules `callback` at an absolute loop-time deadline.
  pub fn call_at(
    &self,
    when: f64,
    callback: impl FnOnce(&EventLoop) + 'static,
  ) -> TimerHandle {
    let inner = TimerInner::new(Box::new(callback));
    self.push_timer(when, inner.clone());
    TimerHandle { inner }
  }

  /// Schedules `callback` after `delay` seconds, holding the receiver only
  /// weakly. If nothing else keeps the receiver alive by the deadline, the
  /// handle fires as a no-op.
  pub fn call_later_weak<T: 'static>(
    &self,
    delay: f64,
    target: &Rc<T>,
    callback: impl FnOnce(&EventLoop, &Rc<T>) + 'static,
  ) -> TimerWeakHandle {
    let weak: Weak<T> = Rc::downgrade(target);
    let inner = TimerInner::new(Box::new(move |event_loop| {
      if let Some(target) = weak.upgrade() {
        callback(event_loop, &target);
      }
    }));
    self.push_timer(loop_time() + delay.max(0.0), inner.clone());
    TimerWeakHandle { inner }
  }

  fn push_timer(&self, when: f64, inner: Rc<TimerInner>) {
    let seq = self.inner.timer_seq.get();
    self.inner.timer_seq.set(seq.wrapping_add(1));
    self.inner.timers.borrow_mut().push(TimerEntry { when, seq, inner });
  }

  /// Hook receiving errors that would otherwise vanish, e.g. a task whose
  /// failure nobody awaits. Defaults to `log::error!`.
  pub fn set_exception_handler(
    &self,
    handler: impl Fn(&EventLoop, &str) + 'static,
  ) {
    *self.inner.exception_handler.borrow_mut() = Some(Rc::new(handler));
  }

  /// Routes an otherwise-unobserved failure through the exception hook.
  pub fn report_exception(&self, message: &str) {
    let handler = self.inner.exception_handler.borrow().clone();
    match handler {
      Some(handler) => handler(self, message),
      None => log::error!("{message}"),
    }
  }

  // I/O registration used by transports. Token 0 belongs to the wakeup fd;
  // everything else is `slab key + 1`.

  pub(crate) fn register_io(
    &self,
    source: &mut impl mio::event::Source,
    interest: Interest,
  ) -> io::Result<usize> {
    let key = self.inner.io.borrow_mut().insert(IoEntry::default());
    match self.inner.registry.register(source, Token(key + 1), interest) {
      Ok(()) => Ok(key),
      Err(error) => {
        self.inner.io.borrow_mut().remove(key);
        Err(error)
      }
    }
  }

  pub(crate) fn reregister_io(
    &self,
    source: &mut impl mio::event::Source,
    key: usize,
    interest: Interest,
  ) -> io::Result<()> {
    self.inner.registry.reregister(source, Token(key + 1), interest)
  }

  pub(crate) fn deregister_io(
    &self,
    source: &mut impl mio::event::Source,
    key: usize,
  ) {
    let _ = self.inner.registry.deregister(source);
    let mut io = self.inner.io.borrow_mut();
    if io.contains(key) {
      io.remove(key);
    }
  }

  pub(crate) fn set_io_callbacks(
    &self,
    key: usize,
    reader: Option<IoCallback>,
    writer: Option<IoCallback>,
  ) {
    let mut io = self.inner.io.borrow_mut();
    if let Some(entry) = io.get_mut(key) {
      entry.reader = reader;
      entry.writer = writer;
    }
  }

  // Task plumbing shared with `task.rs`.

  pub(crate) fn next_task_gen(&self) -> u64 {
    let generation = self.inner.task_gen.get().wrapping_add(1);
    self.inner.task_gen.set(generation);
    generation
  }

  pub(crate) fn schedule_task(&self, key: usize, generation: u64) {
    let mut tasks = self.inner.tasks.borrow_mut();
    let Some(entry) = tasks.get_mut(key) else {
      return;
    };
    if entry.generation != generation || entry.scheduled {
      return;
    }
    entry.scheduled = true;
    drop(tasks);
    self.inner.ready.borrow_mut().push_back(ReadyItem::Task(key, generation));
  }

  fn poll_task(&self, key: usize, generation: u64) {
    let (mut future, cancel, waker) = {
      let mut tasks = self.inner.tasks.borrow_mut();
      let Some(entry) = tasks.get_mut(key) else {
        return;
      };
      if entry.generation != generation {
        return;
      }
      entry.scheduled = false;
      let Some(future) = entry.future.take() else {
        return;
      };
      (future, entry.cancel.clone(), entry.waker.clone())
    };

    let previous = crate::task::enter_task(cancel);
    let mut context = std::task::Context::from_waker(&waker);
    let result = future.as_mut().poll(&mut context);
    crate::task::leave_task(previous);

    match result {
      std::task::Poll::Pending => {
        let mut tasks = self.inner.tasks.borrow_mut();
        if let Some(entry) = tasks.get_mut(key) {
          if entry.generation == generation {
            entry.future = Some(future);
          }
        }
      }
      std::task::Poll::Ready(()) => {
        let mut tasks = self.inner.tasks.borrow_mut();
        if tasks.get(key).map(|entry| entry.generation) == Some(generation) {
          tasks.remove(key);
        }
      }
    }
  }

  /// One loop iteration: drain the cross-thread queue, dispatch due timers,
  /// poll the selector, then run every handle that was ready at the start
  /// of the dispatch phase exactly once. Handles scheduled while running
  /// wait for the next iteration.
  pub(crate) fn run_once(&self, default_timeout: Option<Duration>) {
    let inner = &self.inner;
    inner.shared.parked.store(true, AtomicOrdering::SeqCst);

    // 1. cross-thread queue into the ready queue.
    let messages = std::mem::take(&mut *inner.shared.queue.lock());
    for message in messages {
      match message {
        Msg::Callback(callback) => {
          let handle = TimerInner::new(Box::new(callback));
          inner.ready.borrow_mut().push_back(ReadyItem::Callback(handle));
        }
        Msg::WakeTask(key, generation) => {
          self.schedule_task(key, generation);
        }
      }
    }

    // 2. due timers into the ready queue.
    let now = loop_time();
    {
      let mut timers = inner.timers.borrow_mut();
      loop {
        match timers.peek() {
          Some(entry) if entry.when <= now => {
            let Some(entry) = timers.pop() else {
              break;
            };
            if !entry.inner.cancelled.get() {
              inner
                .ready
                .borrow_mut()
                .push_back(ReadyItem::Callback(entry.inner));
            }
          }
          _ => break,
        }
      }
    }

    // 3. poll timeout.
    let timeout = if !inner.ready.borrow().is_empty() {
      Some(Duration::ZERO)
    } else {
      let next_timer = inner.timers.borrow().peek().map(|entry| entry.when);
      match next_timer {
        Some(when) => Some(Duration::from_secs_f64((when - now).max(0.0))),
        None => default_timeout,
      }
    };

    // 4. poll the selector and enqueue reader/writer callbacks.
    {
      let mut events = inner.events.borrow_mut();
      let mut poll = inner.poll.borrow_mut();
      if let Err(error) = poll.poll(&mut events, timeout) {
        if error.kind() != io::ErrorKind::Interrupted {
          log::error!("selector poll failed: {error}");
        }
      }
      inner.shared.parked.store(false, AtomicOrdering::SeqCst);

      let io = inner.io.borrow();
      let mut ready = inner.ready.borrow_mut();
      for event in events.iter() {
        if event.token() == WAKER_TOKEN {
          continue;
        }
        let key = event.token().0 - 1;
        let Some(entry) = io.get(key) else {
          continue;
        };
        if event.is_readable() || event.is_read_closed() {
          if let Some(reader) = &entry.reader {
            ready.push_back(ReadyItem::Io(reader.clone()));
          }
        }
        if event.is_writable() || event.is_write_closed() {
          if let Some(writer) = &entry.writer {
            ready.push_back(ReadyItem::Io(writer.clone()));
          }
        }
      }
    }

    // 5. run the handles that are ready right now, exactly once each.
    let count = inner.ready.borrow().len();
    for _ in 0..count {
      let item = inner.ready.borrow_mut().pop_front();
      match item {
        Some(ReadyItem::Callback(handle)) => handle.run(self),
        Some(ReadyItem::Io(callback)) => callback(self),
        Some(ReadyItem::Task(key, generation)) => self.poll_task(key, generation),
        None => break,
      }
    }
  }

  /// Runs the loop until `stop` is called.
  pub fn run(&self) {
    assert!(!self.inner.running.get(), "event loop already running");
    self.inner.running.set(true);
    self.inner.stopping.set(false);
    while !self.inner.stopping.get() {
      self.run_once(None);
    }
    self.inner.running.set(false);
  }

  pub fn stop(&self) {
    self.inner.stopping.set(true);
    // A no-op callback guarantees the current `poll` returns.
    self.proxy().call_soon_threadsafe(|_| {});
  }

  /// Cancels every live task and lets them unwind. In-flight tasks observe
  /// the cancellation at their next resume point.
  pub fn close(&self) {
    let keys: Vec<(usize, u64)> = self
      .inner
      .tasks
      .borrow()
      .iter()
      .map(|(key, entry)| (key, entry.generation))
      .collect();
    for (key, generation) in &keys {
      if let Some(entry) = self.inner.tasks.borrow_mut().get_mut(*key) {
        entry.cancel.request(CancelKind::Cancelled);
      }
      self.schedule_task(*key, *generation);
    }
    for _ in 0..8 {
      if self.inner.tasks.borrow().is_empty() {
        break;
      }
      self.run_once(Some(Duration::ZERO));
    }
  }
}
