// Copyright 2026 the Cinder authors. MIT license.

use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic clock in seconds. All scheduling in the loop is expressed on
/// this timeline; wall-clock time never enters the picture.
pub fn loop_time() -> f64 {
  EPOCH.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn monotonic() {
    let a = loop_time();
    let b = loop_time();
    assert!(b >= a);
  }
}
