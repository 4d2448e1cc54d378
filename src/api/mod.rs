// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! The public encoder API: configuration, context lifecycle and the frame
//! push / packet pull loop.

/// Encoder configuration.
pub mod config;
/// Internal implementation.
pub(crate) mod internal;


pub use config::*;
pub(crate) use internal::*;

use crate::encoder::EncoderStats;
use crate::frame::Picture;
use crate::partition::{MAX_QUANT, MIN_QUANT};

use num_traits::FromPrimitive;
use thiserror::Error;
use v_frame::pixel::Pixel;

use std::fmt;
use std::io;
use std::sync::Arc;

/// A rational number.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

/// Possible types of a picture.
#[allow(non_camel_case_types)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[repr(C)]
pub enum FrameType {
  /// Key picture.
  KEY,
  /// Inter picture.
  INTER,
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FrameType::KEY => write!(f, "Key frame"),
      FrameType::INTER => write!(f, "Inter frame"),
    }
  }
}

/// Slice coding type.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum SliceType {
  I,
  P,
}

impl SliceType {
  pub(crate) fn to_idx(self) -> u32 {
    match self {
      SliceType::P => 1,
      SliceType::I => 2,
    }
  }
}

/// Hard errors: a bad argument, an unsupported request, a broken invariant
/// or a failed encode. No automatic retry happens anywhere; retries, if
/// desired, are the caller's business at the picture level.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncoderError {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
  #[error("unsupported: {0}")]
  Unsupported(String),
  #[error("unexpected: {0}")]
  Unexpected(String),
  #[error("encode failure: {0}")]
  EncodeFailure(String),
}

impl From<io::Error> for EncoderError {
  fn from(e: io::Error) -> Self {
    EncoderError::EncodeFailure(e.to_string())
  }
}

/// Status that can be returned by [`Context`] functions.
///
/// [`Context`]: struct.Context.html
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncoderStatus {
  /// The encoder needs more data to produce an output packet.
  #[error("need more data")]
  NeedMoreData,
  /// A frame was sent after the encoder had been flushed.
  #[error("enough data")]
  EnoughData,
  /// All queued input pictures have been encoded.
  #[error("limit reached")]
  LimitReached,
  /// A hard error.
  #[error("{0}")]
  Failure(#[from] EncoderError),
}

/// Represents a packet: one encoded picture as a sequence of NALU-delimited
/// slice payloads, each preceded by a four-byte network-order size field.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
  /// The packet data.
  pub data: Vec<u8>,
  /// The number of the input frame corresponding to this packet.
  pub input_frameno: u64,
  /// Type of the encoded picture.
  pub frame_type: FrameType,
  /// QP selected for the picture.
  pub qp: u8,
  /// Per-picture encoding stats.
  pub enc_stats: EncoderStats,
}

impl fmt::Display for Packet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Frame {} - {} - {} bytes",
      self.input_frameno,
      self.frame_type,
      self.data.len()
    )
  }
}

/// Keys for the runtime configuration interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum ConfigKey {
  Qp = 0,
  QpMin,
  QpMax,
  Fps,
  Bitrate,
  KeyFrameInterval,
  ForceOutput,
  UseDeblock,
  ClosedGop,
  Width,
  Height,
  SupportedProfile,
}

/// The only profile this core encodes.
pub const PROFILE_BASELINE: i32 = 0;

/// The encoder context.
///
/// Contains the encoding state.
pub struct Context<T: Pixel> {
  pub(crate) inner: ContextInner<T>,
  pub(crate) config: EncoderConfig,
  pub(crate) pool: rayon::ThreadPool,
  pub(crate) is_flushing: bool,
}

impl<T: Pixel> Context<T> {
  /// Sends the frame for encoding; `None` begins a flush.
  ///
  /// # Errors
  ///
  /// Returns [`EncoderStatus::EnoughData`] when a frame arrives after the
  /// flush began, or a wrapped [`EncoderError`] for a malformed picture.
  pub fn send_frame(
    &mut self, frame: Option<Arc<Picture<T>>>,
  ) -> Result<(), EncoderStatus> {
    if frame.is_none() {
      if self.is_flushing {
        return Ok(());
      }
      self.is_flushing = true;
    } else if self.is_flushing {
      return Err(EncoderStatus::EnoughData);
    }
    self.inner.push(&self.config, frame)?;
    Ok(())
  }

  /// Flushes the encoder: no more frames will be accepted, and queued ones
  /// can be drained with [`receive_packet`].
  ///
  /// [`receive_packet`]: #method.receive_packet
  pub fn flush(&mut self) {
    let _ = self.send_frame(None);
  }

  /// Encodes the next queued picture into a packet.
  pub fn receive_packet(&mut self) -> Result<Packet, EncoderStatus> {
    self.inner.receive_packet(&self.pool, &self.config, self.is_flushing)
  }

  /// Number of input pictures queued and not yet encoded.
  pub fn frames_queued(&self) -> usize {
    self.inner.frames_queued()
  }

  /// Updates one runtime-settable parameter. Rejected values leave the
  /// prior state unchanged.
  pub fn set_config(
    &mut self, key: ConfigKey, value: i32,
  ) -> Result<(), EncoderError> {
    match key {
      ConfigKey::Qp => {
        if !(MIN_QUANT as i32..=MAX_QUANT as i32).contains(&value) {
          return Err(EncoderError::InvalidArgument(format!("qp {}", value)));
        }
        self.config.quantizer = value as u8;
      }
      ConfigKey::QpMin => {
        if value < MIN_QUANT as i32 || value > self.config.qp_max as i32 {
          return Err(EncoderError::InvalidArgument(format!(
            "qp_min {}",
            value
          )));
        }
        self.config.qp_min = value as u8;
      }
      ConfigKey::QpMax => {
        if value > MAX_QUANT as i32 || value < self.config.qp_min as i32 {
          return Err(EncoderError::InvalidArgument(format!(
            "qp_max {}",
            value
          )));
        }
        self.config.qp_max = value as u8;
      }
      ConfigKey::Fps => {
        if value <= 0 {
          return Err(EncoderError::InvalidArgument(format!("fps {}", value)));
        }
        self.config.time_base = Rational::new(1, value as u64);
      }
      ConfigKey::Bitrate => {
        if value <= 0 {
          return Err(EncoderError::InvalidArgument(format!(
            "bitrate {}",
            value
          )));
        }
        self.config.bitrate = value;
      }
      ConfigKey::KeyFrameInterval => {
        if value < 0 {
          return Err(EncoderError::InvalidArgument(format!(
            "key interval {}",
            value
          )));
        }
        self.config.key_frame_interval = value as u64;
      }
      ConfigKey::ForceOutput => {
        self.inner.set_force_output(value != 0);
      }
      ConfigKey::UseDeblock => {
        self.config.enable_deblock = value != 0;
      }
      ConfigKey::ClosedGop => {
        self.config.closed_gop = value != 0;
      }
      _ => {
        return Err(EncoderError::Unsupported(format!(
          "config key {:?} is read-only",
          key
        )));
      }
    }
    Ok(())
  }

  /// Reads one configuration value.
  pub fn get_config(&self, key: ConfigKey) -> Result<i32, EncoderError> {
    Ok(match key {
      ConfigKey::Qp => self.config.quantizer as i32,
      ConfigKey::QpMin => self.config.qp_min as i32,
      ConfigKey::QpMax => self.config.qp_max as i32,
      ConfigKey::Fps => self.config.frame_rate().round() as i32,
      ConfigKey::Bitrate => self.config.bitrate,
      ConfigKey::KeyFrameInterval => self.config.key_frame_interval as i32,
      ConfigKey::ForceOutput => i32::from(self.inner.force_output),
      ConfigKey::UseDeblock => i32::from(self.config.enable_deblock),
      ConfigKey::ClosedGop => i32::from(self.config.closed_gop),
      ConfigKey::Width => self.config.width as i32,
      ConfigKey::Height => self.config.height as i32,
      ConfigKey::SupportedProfile => PROFILE_BASELINE,
    })
  }

  /// Resolves a raw key id as used by foreign-function callers.
  pub fn config_key_from_raw(raw: i32) -> Result<ConfigKey, EncoderError> {
    ConfigKey::from_i32(raw)
      .ok_or_else(|| EncoderError::Unsupported(format!("config key {}", raw)))
  }
}
