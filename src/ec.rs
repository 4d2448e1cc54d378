// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Binary arithmetic coder with per-context adaptive probability models.
//!
//! One `Sbac` instance is exclusively owned by one worker at a time. The
//! whole coder state is `Clone`, which is how the "best state" protocol
//! works: mode decision snapshots the committed coder, costs candidates
//! against the copy in bit-counting mode, and the committed stream is never
//! touched.

use crate::api::SliceType;
use crate::util::clamp;

pub const PROB_BITS: u32 = 15;
pub const PROB_ONE: u16 = 1 << PROB_BITS;
const ADAPT_SHIFT: u16 = 5;
const RENORM_TOP: u32 = 1 << 24;

pub const SPLIT_CU_CTX: usize = 3;
pub const BTT_SPLIT_FLAG_CTX: usize = 5;
pub const PRED_MODE_CTX: usize = 3;
pub const INTRA_DIR_CTX: usize = 2;
pub const CBF_CTX: usize = 3;
pub const DQP_CTX: usize = 2;

/// Probability of the next bin being 0, in Q15, plus implicit adaptation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbacModel(u16);

impl Default for SbacModel {
  fn default() -> Self {
    SbacModel(PROB_ONE >> 1)
  }
}

impl SbacModel {
  /// Builds a model from a packed (slope, offset) init value and the slice
  /// QP. Deterministic: workers replay it identically per tile.
  fn from_init(init: i16, qp: u8) -> Self {
    let slope = (init >> 8) as i32;
    let offset = ((init & 0xff) as i32) << 7;
    let p0 = clamp(offset + slope * qp as i32 * 16, 1024, 31744);
    SbacModel(p0 as u16)
  }

  #[inline]
  fn prob0(self) -> u16 {
    self.0
  }

  #[inline]
  fn update(&mut self, bin: bool) {
    if bin {
      self.0 -= self.0 >> ADAPT_SHIFT;
    } else {
      self.0 += (PROB_ONE - self.0) >> ADAPT_SHIFT;
    }
  }
}

/// Identifies one adaptive model; the payload selects among the sub-contexts
/// of that syntax element.
#[derive(Clone, Copy, Debug)]
pub enum BinCtx {
  SplitCu(usize),
  BttSplitFlag(usize),
  BttSplitDir(usize),
  BttSplitType(usize),
  PredMode(usize),
  IntraDir(usize),
  Cbf(usize),
  DqpAbs(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SbacModels {
  pub split_cu: [SbacModel; SPLIT_CU_CTX],
  pub btt_split_flag: [SbacModel; BTT_SPLIT_FLAG_CTX],
  pub btt_split_dir: [SbacModel; 2],
  pub btt_split_type: [SbacModel; 2],
  pub pred_mode: [SbacModel; PRED_MODE_CTX],
  pub intra_dir: [SbacModel; INTRA_DIR_CTX],
  pub cbf: [SbacModel; CBF_CTX],
  pub dqp_abs: [SbacModel; DQP_CTX],
}

struct SbacModelInits {
  split_cu: [i16; SPLIT_CU_CTX],
  btt_split_flag: [i16; BTT_SPLIT_FLAG_CTX],
  btt_split_dir: [i16; 2],
  btt_split_type: [i16; 2],
  pred_mode: [i16; PRED_MODE_CTX],
  intra_dir: [i16; INTRA_DIR_CTX],
  cbf: [i16; CBF_CTX],
  dqp_abs: [i16; DQP_CTX],
}

static INIT_I: SbacModelInits = SbacModelInits {
  split_cu: [0x01a8, -0x0170, 0x0092],
  btt_split_flag: [0x00b0, 0x0184, -0x0138, 0x0066, 0x00f2],
  btt_split_dir: [0x0080, -0x00c4],
  btt_split_type: [0x0120, 0x005a],
  pred_mode: [0x01f0, 0x01f0, 0x01f0],
  intra_dir: [0x0144, -0x0096],
  cbf: [0x00d8, 0x00b6, 0x00b6],
  dqp_abs: [0x0160, 0x00a0],
};

static INIT_P: SbacModelInits = SbacModelInits {
  split_cu: [0x0154, -0x01b2, 0x0060],
  btt_split_flag: [0x0072, 0x0130, -0x00fa, 0x0048, 0x00c8],
  btt_split_dir: [0x006a, -0x00e0],
  btt_split_type: [0x00fc, 0x0032],
  pred_mode: [0x00c0, 0x0110, 0x0168],
  intra_dir: [0x0100, -0x0060],
  cbf: [0x00aa, 0x0090, 0x0090],
  dqp_abs: [0x0130, 0x0088],
};

impl SbacModels {
  fn flat() -> Self {
    SbacModels {
      split_cu: [SbacModel::default(); SPLIT_CU_CTX],
      btt_split_flag: [SbacModel::default(); BTT_SPLIT_FLAG_CTX],
      btt_split_dir: [SbacModel::default(); 2],
      btt_split_type: [SbacModel::default(); 2],
      pred_mode: [SbacModel::default(); PRED_MODE_CTX],
      intra_dir: [SbacModel::default(); INTRA_DIR_CTX],
      cbf: [SbacModel::default(); CBF_CTX],
      dqp_abs: [SbacModel::default(); DQP_CTX],
    }
  }

  fn from_inits(inits: &SbacModelInits, qp: u8) -> Self {
    fn build<const N: usize>(init: &[i16; N], qp: u8) -> [SbacModel; N] {
      let mut out = [SbacModel::default(); N];
      for (o, i) in out.iter_mut().zip(init.iter()) {
        *o = SbacModel::from_init(*i, qp);
      }
      out
    }
    SbacModels {
      split_cu: build(&inits.split_cu, qp),
      btt_split_flag: build(&inits.btt_split_flag, qp),
      btt_split_dir: build(&inits.btt_split_dir, qp),
      btt_split_type: build(&inits.btt_split_type, qp),
      pred_mode: build(&inits.pred_mode, qp),
      intra_dir: build(&inits.intra_dir, qp),
      cbf: build(&inits.cbf, qp),
      dqp_abs: build(&inits.dqp_abs, qp),
    }
  }
}

// -log2(p) in Q16 for p in the middle of each of 32 probability buckets.
#[rustfmt::skip]
static FRAC_BITS: [u64; 32] = [
  393216, 289344, 241050, 209235, 185472, 166499, 150704, 137174,
  125340, 114824, 105361,  96762,  88877,  81601,  74845,  68538,
   62626,  57063,  51809,  46832,  42104,  37600,  33302,  29190,
   25250,  21468,  17831,  14329,  10952,   7691,   4539,   1489,
];

/// The binary arithmetic coder. Writes into a private byte buffer, or, in
/// counting mode, accumulates a fractional bit estimate instead of bytes.
#[derive(Clone, Debug)]
pub struct Sbac {
  low: u64,
  range: u32,
  cache: u8,
  cache_size: u64,
  out: Vec<u8>,
  counting: bool,
  frac_bits: u64,
  bin_count: u64,
  pub models: SbacModels,
}

impl Sbac {
  pub fn new() -> Self {
    Sbac {
      low: 0,
      range: 0xffff_ffff,
      cache: 0,
      cache_size: 0,
      out: Vec::new(),
      counting: false,
      frac_bits: 0,
      bin_count: 0,
      models: SbacModels::flat(),
    }
  }

  /// Re-initializes probability models and arithmetic state for a tile.
  ///
  /// Must be deterministic given the same inputs: every worker replays the
  /// identical reset at its tile entry point.
  pub fn reset(&mut self, slice_type: SliceType, qp: u8, cm_init: bool) {
    self.low = 0;
    self.range = 0xffff_ffff;
    self.cache = 0;
    self.cache_size = 0;
    self.out.clear();
    self.frac_bits = 0;
    self.bin_count = 0;
    self.models = if cm_init {
      let inits = match slice_type {
        SliceType::I => &INIT_I,
        SliceType::P => &INIT_P,
      };
      SbacModels::from_inits(inits, qp)
    } else {
      SbacModels::flat()
    };
  }

  /// Snapshot used to seed mode decision: same model state, bit-counting
  /// only, no byte output.
  pub fn checkpoint(&self) -> Sbac {
    let mut c = self.clone();
    c.counting = true;
    c.out = Vec::new();
    c.frac_bits = 0;
    c
  }

  #[inline]
  fn model_mut(&mut self, ctx: BinCtx) -> &mut SbacModel {
    let m = &mut self.models;
    match ctx {
      BinCtx::SplitCu(i) => &mut m.split_cu[i],
      BinCtx::BttSplitFlag(i) => &mut m.btt_split_flag[i],
      BinCtx::BttSplitDir(i) => &mut m.btt_split_dir[i],
      BinCtx::BttSplitType(i) => &mut m.btt_split_type[i],
      BinCtx::PredMode(i) => &mut m.pred_mode[i],
      BinCtx::IntraDir(i) => &mut m.intra_dir[i],
      BinCtx::Cbf(i) => &mut m.cbf[i],
      BinCtx::DqpAbs(i) => &mut m.dqp_abs[i],
    }
  }

  pub fn encode_bin(&mut self, bin: bool, ctx: BinCtx) {
    let p0 = self.model_mut(ctx).prob0();
    self.bin_count += 1;
    if self.counting {
      let p = if bin { PROB_ONE - p0 } else { p0 };
      self.frac_bits += FRAC_BITS[(p >> 10).min(31) as usize];
    } else {
      let bound = (self.range >> PROB_BITS) * p0 as u32;
      if !bin {
        self.range = bound;
      } else {
        self.low += bound as u64;
        self.range -= bound;
      }
      self.renorm();
    }
    self.model_mut(ctx).update(bin);
  }

  /// Equiprobable (bypass) bin.
  pub fn encode_bin_ep(&mut self, bin: bool) {
    self.bin_count += 1;
    if self.counting {
      self.frac_bits += 1 << 16;
      return;
    }
    let bound = self.range >> 1;
    if !bin {
      self.range = bound;
    } else {
      self.low += bound as u64;
      self.range -= bound;
    }
    self.renorm();
  }

  /// Terminate bin; `true` closes out a tile (the tile end flag).
  pub fn encode_bin_trm(&mut self, bin: bool) {
    self.bin_count += 1;
    if self.counting {
      self.frac_bits += if bin { 7 << 16 } else { 1 << 10 };
      return;
    }
    self.range -= 2;
    if bin {
      self.low += self.range as u64;
      self.range = 2;
    }
    self.renorm();
  }

  #[inline]
  fn renorm(&mut self) {
    while self.range < RENORM_TOP {
      self.shift_low();
      self.range <<= 8;
    }
  }

  fn shift_low(&mut self) {
    let low = self.low;
    if low < 0xff00_0000 || low > 0xffff_ffff {
      let carry = (low >> 32) as u8;
      if self.cache_size > 0 {
        self.out.push(self.cache.wrapping_add(carry));
        for _ in 1..self.cache_size {
          self.out.push(0xff_u8.wrapping_add(carry));
        }
      }
      self.cache = (low >> 24) as u8;
      self.cache_size = 0;
    }
    self.cache_size += 1;
    self.low = (low << 8) & 0xffff_ffff;
  }

  /// Flushes the arithmetic state and returns the byte-aligned payload
  /// together with the number of bins it coded.
  pub fn finish(mut self) -> (Vec<u8>, u64) {
    for _ in 0..5 {
      self.shift_low();
    }
    (self.out, self.bin_count)
  }

  pub fn bin_count(&self) -> u64 {
    self.bin_count
  }

  /// Whole bits of the counting-mode estimate.
  pub fn bit_estimate(&self) -> u64 {
    debug_assert!(self.counting);
    self.frac_bits >> 16
  }

  pub fn byte_count(&self) -> usize {
    self.out.len()
  }
}

impl Default for Sbac {
  fn default() -> Self {
    Sbac::new()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use pretty_assertions::assert_eq;

  fn drive(sbac: &mut Sbac, pattern: &[bool]) {
    for &b in pattern {
      sbac.encode_bin(b, BinCtx::SplitCu(0));
    }
  }

  #[test]
  fn reset_is_deterministic() {
    let mut a = Sbac::new();
    let mut b = Sbac::new();
    a.reset(SliceType::P, 27, true);
    b.reset(SliceType::P, 27, true);
    assert_eq!(a.models, b.models);

    b.reset(SliceType::I, 27, true);
    assert_ne!(a.models, b.models);
  }

  #[test]
  fn reset_without_cm_init_is_flat() {
    let mut a = Sbac::new();
    a.reset(SliceType::I, 10, false);
    let mut b = Sbac::new();
    b.reset(SliceType::P, 40, false);
    assert_eq!(a.models, b.models);
  }

  #[test]
  fn identical_input_identical_output() {
    let pattern: Vec<bool> = (0..4096).map(|i| i % 5 == 0).collect();
    let mut a = Sbac::new();
    a.reset(SliceType::I, 32, true);
    drive(&mut a, &pattern);
    let mut b = Sbac::new();
    b.reset(SliceType::I, 32, true);
    drive(&mut b, &pattern);
    let (bytes_a, bins_a) = a.finish();
    let (bytes_b, bins_b) = b.finish();
    assert_eq!(bytes_a, bytes_b);
    assert_eq!(bins_a, bins_b);
    assert_eq!(bins_a, 4096);
  }

  #[test]
  fn skewed_input_compresses() {
    let mut skewed = Sbac::new();
    skewed.reset(SliceType::I, 32, false);
    let mut mixed = Sbac::new();
    mixed.reset(SliceType::I, 32, false);
    for i in 0..8192 {
      skewed.encode_bin(i % 64 == 0, BinCtx::Cbf(0));
      mixed.encode_bin(i % 2 == 0, BinCtx::Cbf(0));
    }
    let (s, _) = skewed.finish();
    let (m, _) = mixed.finish();
    assert!(s.len() < m.len() / 4, "{} vs {}", s.len(), m.len());
  }

  #[test]
  fn checkpoint_does_not_touch_committed_stream() {
    let mut committed = Sbac::new();
    committed.reset(SliceType::I, 30, true);
    drive(&mut committed, &[true, false, true]);

    let before = committed.clone();
    let mut probe = committed.checkpoint();
    drive(&mut probe, &[true; 128]);
    assert!(probe.bit_estimate() > 0);
    assert_eq!(probe.byte_count(), 0);

    drive(&mut committed, &[false, false]);
    let mut replay = before;
    drive(&mut replay, &[false, false]);
    assert_eq!(committed.finish(), replay.finish());
  }

  #[test]
  fn counting_mode_tracks_probability() {
    let mut c = Sbac::new();
    c.reset(SliceType::I, 30, false);
    let mut likely = c.checkpoint();
    // Train the model towards 0, then cost one more 0 against a 1.
    for _ in 0..64 {
      likely.encode_bin(false, BinCtx::IntraDir(0));
    }
    let mut unlikely = likely.clone();
    let base = likely.bit_estimate();
    likely.encode_bin(false, BinCtx::IntraDir(0));
    unlikely.encode_bin(true, BinCtx::IntraDir(0));
    assert!(likely.bit_estimate() - base < unlikely.bit_estimate() - base);
  }

  #[test]
  fn terminate_flushes_cleanly() {
    let mut s = Sbac::new();
    s.reset(SliceType::P, 22, true);
    for i in 0..257 {
      s.encode_bin(i % 3 == 0, BinCtx::PredMode(0));
      s.encode_bin_ep(i % 7 == 0);
      s.encode_bin_trm(false);
    }
    s.encode_bin_trm(true);
    let (bytes, bins) = s.finish();
    assert!(!bytes.is_empty());
    assert_eq!(bins, 257 * 3 + 1);
  }
}
