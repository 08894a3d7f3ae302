// Copyright 2026 the Cinder authors. MIT license.

//! A small fixed pool of worker threads for blocking calls, most notably
//! `getaddrinfo`. Results are marshalled back onto the owning loop through
//! its thread-safe queue.

use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CancelKind;
use crate::error::CoreError;
use crate::event_loop::EventLoop;
use crate::future::Promise;

const WORKER_COUNT: usize = 4;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct ThreadPool {
  sender: Mutex<Option<mpsc::Sender<Job>>>,
  receiver: Arc<Mutex<Option<mpsc::Receiver<Job>>>>,
  started: Mutex<bool>,
}

impl ThreadPool {
  pub(crate) fn new() -> ThreadPool {
    let (sender, receiver) = mpsc::channel();
    ThreadPool {
      sender: Mutex::new(Some(sender)),
      receiver: Arc::new(Mutex::new(Some(receiver))),
      started: Mutex::new(false),
    }
  }

  fn ensure_started(&self) {
    let mut started = self.started.lock();
    if *started {
      return;
    }
    *started = true;
    // A single shared receiver would need a sync channel per worker;
    // instead the workers pull from one guarded receiver.
    let receiver = self.receiver.clone();
    for index in 0..WORKER_COUNT {
      let receiver = receiver.clone();
      std::thread::Builder::new()
        .name(format!("cinder-worker-{index}"))
        .spawn(move || loop {
          let job = {
            let guard = receiver.lock();
            match guard.as_ref() {
              Some(receiver) => receiver.recv(),
              None => return,
            }
          };
          match job {
            Ok(job) => job(),
            Err(_) => return,
          }
        })
        .expect("failed to spawn worker thread");
    }
  }

  pub(crate) fn execute(&self, job: Job) {
    self.ensure_started();
    if let Some(sender) = self.sender.lock().as_ref() {
      let _ = sender.send(job);
    }
  }
}

impl EventLoop {
  /// Runs a blocking closure on the worker pool; the returned promise
  /// completes on this loop.
  pub fn spawn_blocking<T, E, F>(&self, job: F) -> Promise<T, E>
  where
    T: Send + 'static,
    E: Send + From<CancelKind> + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
  {
    let promise: Promise<T, E> = self.promise();
    let key = self.store_cross(Box::new(promise.clone()));
    let proxy = self.proxy();
    self.inner.pool.execute(Box::new(move || {
      let result = job();
      proxy.call_soon_threadsafe(move |event_loop| {
        if let Some(parked) = event_loop.take_cross(key) {
          if let Ok(parked) = parked.downcast::<Promise<T, E>>() {
            parked.complete_if_pending(result);
          }
        }
      });
    }));
    promise
  }

  /// Resolves `host:port` on a worker thread, like `getaddrinfo`.
  pub fn get_address_info(
    &self,
    host: &str,
    port: u16,
  ) -> Promise<Vec<SocketAddr>, CoreError> {
    let target = (host.to_string(), port);
    self.spawn_blocking(move || {
      let addresses: Vec<SocketAddr> =
        target.to_socket_addrs().map_err(CoreError::from)?.collect();
      if addresses.is_empty() {
        return Err(CoreError::Io(std::sync::Arc::new(
          std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {}:{}", target.0, target.1),
          ),
        )));
      }
      Ok(addresses)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn spawn_blocking_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let result: Result<u64, CoreError> = event_loop.run_until(async move {
      let promise = lp.spawn_blocking(|| Ok::<u64, CoreError>(40 + 2));
      promise.await
    });
    assert_eq!(result.unwrap(), 42);
  }

  #[test]
  fn resolves_localhost() {
    let event_loop = EventLoop::new().unwrap();
    let lp = event_loop.clone();
    let result: Result<Vec<SocketAddr>, CoreError> =
      event_loop.run_until(async move {
        lp.get_address_info("localhost", 80).await
      });
    let addresses = result.unwrap();
    assert!(!addresses.is_empty());
    assert!(addresses.iter().all(|address| address.port() == 80));
  }
}
