// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use crate::api::{Context, ContextInner, EncoderError, Rational};
use crate::partition::{MAX_QUANT, MIN_QUANT};

use v_frame::pixel::{ChromaSampling, Pixel};

use std::fmt;

/// Encoder settings which impact the produced bitstream.
#[derive(Clone, Copy, Debug)]
pub struct EncoderConfig {
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Video time base.
  pub time_base: Rational,
  /// Bit depth.
  pub bit_depth: usize,
  /// Chroma subsampling.
  pub chroma_sampling: ChromaSampling,

  /// The base quantizer to use.
  pub quantizer: u8,
  /// Lower bound the slice quantizer is clamped to.
  pub qp_min: u8,
  /// Upper bound the slice quantizer is clamped to.
  pub qp_max: u8,
  /// The target bitrate, informational for now.
  pub bitrate: i32,
  /// Interval between forced key pictures; 0 keys only the first picture.
  pub key_frame_interval: u64,
  /// Key pictures restart the GOP with an IDR.
  pub closed_gop: bool,

  /// Number of slices each picture is divided into.
  pub num_slices: usize,
  /// Number of tile columns.
  pub tile_cols: usize,
  /// Number of tile rows.
  pub tile_rows: usize,
  /// Worker threads per tile; 0 picks the pool's own parallelism.
  pub threads: usize,
  /// Reference pictures kept for inter slices.
  pub max_ref_pics: usize,

  /// Signal binary/ternary splits in addition to quad splits.
  pub enable_btt: bool,
  /// Initialize probability models from slice type and QP.
  pub enable_cm_init: bool,
  /// Code per-CU QP deltas.
  pub enable_cu_qp_delta: bool,
  /// Run the in-loop deblocking stage.
  pub enable_deblock: bool,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    EncoderConfig {
      width: 640,
      height: 480,
      time_base: Rational { num: 1, den: 30 },
      bit_depth: 8,
      chroma_sampling: ChromaSampling::Cs420,
      quantizer: 30,
      qp_min: MIN_QUANT,
      qp_max: MAX_QUANT,
      bitrate: 0,
      key_frame_interval: 0,
      closed_gop: true,
      num_slices: 1,
      tile_cols: 1,
      tile_rows: 1,
      threads: 0,
      max_ref_pics: 2,
      enable_btt: true,
      enable_cm_init: true,
      enable_cu_qp_delta: true,
      enable_deblock: true,
    }
  }
}

impl EncoderConfig {
  /// Returns the video frame rate computed from [`time_base`].
  ///
  /// [`time_base`]: #structfield.time_base
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }

  pub(crate) fn validate(&self) -> Result<(), EncoderError> {
    if self.width == 0 || self.height == 0 || self.width > 8192 || self.height > 8192 {
      return Err(EncoderError::InvalidArgument(format!(
        "picture size {}x{}",
        self.width, self.height
      )));
    }
    if !(MIN_QUANT..=MAX_QUANT).contains(&self.quantizer) {
      return Err(EncoderError::InvalidArgument(format!(
        "quantizer {}",
        self.quantizer
      )));
    }
    if self.qp_min > self.qp_max || self.qp_max > MAX_QUANT {
      return Err(EncoderError::InvalidArgument(format!(
        "quantizer bounds {}..{}",
        self.qp_min, self.qp_max
      )));
    }
    if self.num_slices == 0 {
      return Err(EncoderError::InvalidArgument("zero slices".into()));
    }
    if self.threads > 256 {
      return Err(EncoderError::InvalidArgument(format!(
        "{} threads",
        self.threads
      )));
    }
    match self.bit_depth {
      8 | 10 => {}
      d => {
        return Err(EncoderError::Unsupported(format!("bit depth {}", d)));
      }
    }
    if self.chroma_sampling != ChromaSampling::Cs420 {
      return Err(EncoderError::Unsupported(format!(
        "chroma sampling {:?}",
        self.chroma_sampling
      )));
    }
    Ok(())
  }
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}x{} qp={} keyint={} tiles={}x{} slices={} threads={}",
      self.width,
      self.height,
      self.quantizer,
      self.key_frame_interval,
      self.tile_cols,
      self.tile_rows,
      self.num_slices,
      self.threads
    )
  }
}

/// The set of options that controls frame encoding delay, quality and so on.
#[derive(Clone, Debug, Default)]
pub struct Config {
  /// Settings which impact the produced bitstream.
  pub enc: EncoderConfig,
}

impl Config {
  pub fn new() -> Self {
    Config::default()
  }

  pub fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Creates a [`Context`] with this configuration, or fails without
  /// leaving any partially initialized state behind.
  ///
  /// [`Context`]: struct.Context.html
  pub fn new_context<T: Pixel>(&self) -> Result<Context<T>, EncoderError> {
    self.enc.validate()?;
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(self.enc.threads)
      .build()
      .map_err(|e| EncoderError::Unexpected(e.to_string()))?;
    log::info!("encoder context: {}", self.enc);
    Ok(Context {
      inner: ContextInner::new(),
      config: self.enc,
      pool,
      is_flushing: false,
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_config_validates() {
    assert!(EncoderConfig::default().validate().is_ok());
  }

  #[test]
  fn rejects_out_of_range_quantizer() {
    let cfg = EncoderConfig { quantizer: MAX_QUANT + 1, ..Default::default() };
    assert!(matches!(
      cfg.validate(),
      Err(EncoderError::InvalidArgument(_))
    ));
  }

  #[test]
  fn rejects_inverted_qp_bounds() {
    let cfg = EncoderConfig { qp_min: 40, qp_max: 20, ..Default::default() };
    assert!(cfg.validate().is_err());
  }

  #[test]
  fn rejects_unsupported_formats() {
    let cfg = EncoderConfig { bit_depth: 12, ..Default::default() };
    assert!(matches!(cfg.validate(), Err(EncoderError::Unsupported(_))));
    let cfg = EncoderConfig {
      chroma_sampling: ChromaSampling::Cs444,
      ..Default::default()
    };
    assert!(matches!(cfg.validate(), Err(EncoderError::Unsupported(_))));
  }

  #[test]
  fn frame_rate_from_time_base() {
    let cfg = EncoderConfig {
      time_base: Rational { num: 1, den: 25 },
      ..Default::default()
    };
    assert!((cfg.frame_rate() - 25.0).abs() < 1e-9);
  }
}
