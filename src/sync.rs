// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Wavefront dependency tracking: one completion flag per CTU raster
//! position, written exactly once by the worker that finishes that CTU and
//! polled by the worker that depends on it.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;

const SPINS_BEFORE_YIELD: u32 = 64;

/// The per-CTU completion flags for one picture. A completion signal uses a
/// release store; the dependency wait uses acquire loads, so everything the
/// signaling worker wrote is visible once the wait returns.
pub struct CtbSync {
  flags: Vec<AtomicBool>,
}

impl CtbSync {
  pub fn new(f_lcu: usize) -> Self {
    let mut flags = Vec::with_capacity(f_lcu);
    flags.resize_with(f_lcu, || AtomicBool::new(false));
    CtbSync { flags }
  }

  pub fn len(&self) -> usize {
    self.flags.len()
  }

  pub fn is_empty(&self) -> bool {
    self.flags.is_empty()
  }

  #[inline]
  pub fn signal(&self, lcu_num: usize) {
    self.flags[lcu_num].store(true, Ordering::Release);
  }

  #[inline]
  pub fn is_done(&self, lcu_num: usize) -> bool {
    self.flags[lcu_num].load(Ordering::Acquire)
  }

  /// Spins until the CTU at `lcu_num` has been signaled complete. Returns
  /// immediately if the dependency was satisfied before the wait began.
  pub fn wait(&self, lcu_num: usize) {
    let mut spins = 0u32;
    while !self.is_done(lcu_num) {
      if spins < SPINS_BEFORE_YIELD {
        hint::spin_loop();
        spins += 1;
      } else {
        thread::yield_now();
      }
    }
  }

  /// Clears every flag between pictures.
  pub fn reset(&mut self) {
    for f in &mut self.flags {
      *f.get_mut() = false;
    }
  }
}

/// Count of CTUs still unfinished in one tile. Reaches zero exactly once per
/// tile per picture.
pub struct RemainingCtbs(AtomicI32);

impl RemainingCtbs {
  pub fn new(f_ctb: usize) -> Self {
    RemainingCtbs(AtomicI32::new(f_ctb as i32))
  }

  /// Marks one CTU finalized; returns how many remain. The decrement is
  /// ordered after the caller's completion signal becomes visible.
  pub fn finish_one(&self) -> i32 {
    self.0.fetch_sub(1, Ordering::AcqRel) - 1
  }

  pub fn remaining(&self) -> i32 {
    self.0.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn wait_returns_for_presignaled_flag() {
    let sync = CtbSync::new(4);
    sync.signal(2);
    sync.wait(2);
    assert!(sync.is_done(2));
    assert!(!sync.is_done(3));
  }

  #[test]
  fn wait_observes_cross_thread_signal() {
    let sync = Arc::new(CtbSync::new(8));
    let signaler = {
      let sync = Arc::clone(&sync);
      thread::spawn(move || {
        // Deterministic delay so the waiter really spins first.
        thread::sleep(Duration::from_millis(20));
        sync.signal(5);
      })
    };
    sync.wait(5);
    assert!(sync.is_done(5));
    signaler.join().unwrap();
  }

  #[test]
  fn chained_waits_preserve_order() {
    let sync = Arc::new(CtbSync::new(16));
    let remaining = Arc::new(RemainingCtbs::new(16));
    let mut handles = Vec::new();
    for lcu in (0..16).rev() {
      let sync = Arc::clone(&sync);
      let remaining = Arc::clone(&remaining);
      handles.push(thread::spawn(move || {
        if lcu > 0 {
          sync.wait(lcu - 1);
        }
        sync.signal(lcu);
        remaining.finish_one()
      }));
    }
    let mut seen: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..16).collect::<Vec<_>>());
    assert_eq!(remaining.remaining(), 0);
  }

  #[test]
  fn reset_clears_flags() {
    let mut sync = CtbSync::new(3);
    sync.signal(0);
    sync.signal(2);
    sync.reset();
    assert!(!sync.is_done(0) && !sync.is_done(2));
  }
}
