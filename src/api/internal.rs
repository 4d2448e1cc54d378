// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use crate::api::{
  EncoderConfig, EncoderError, EncoderStatus, FrameType, Packet, SliceType,
};
use crate::encoder::{encode_picture, PicParams};
use crate::frame::Picture;
use crate::mode::{
  BaselineAnalyzer, BaselineUnitCoder, LoopFilter, ModeDecision,
  PassthroughLoopFilter, UnitCoder,
};

use std::collections::VecDeque;
use std::sync::Arc;

use v_frame::pixel::Pixel;

/// The encoding state behind a [`Context`]: the input picture queue, the
/// picture counters and the collaborator seams.
///
/// [`Context`]: crate::api::Context
pub(crate) struct ContextInner<T: Pixel> {
  frame_q: VecDeque<Option<Arc<Picture<T>>>>,
  /// Input pictures pushed so far.
  pub(crate) pic_icnt: u64,
  /// `pic_icnt` at the moment forced output was requested.
  pub(crate) pic_ticnt: u64,
  pub(crate) force_output: bool,
  /// Pictures encoded so far; doubles as the picture order count.
  frames_out: u64,
  /// POCs of recent reconstructions usable as references.
  dpb: Vec<u64>,
  drained: bool,
  md: Box<dyn ModeDecision<T>>,
  uc: Box<dyn UnitCoder>,
  lf: Box<dyn LoopFilter<T>>,
}

impl<T: Pixel> ContextInner<T> {
  pub(crate) fn new() -> Self {
    ContextInner {
      frame_q: VecDeque::new(),
      pic_icnt: 0,
      pic_ticnt: 0,
      force_output: false,
      frames_out: 0,
      dpb: Vec::new(),
      drained: false,
      md: Box::new(BaselineAnalyzer::default()),
      uc: Box::new(BaselineUnitCoder),
      lf: Box::new(PassthroughLoopFilter),
    }
  }

  pub(crate) fn push(
    &mut self, cfg: &EncoderConfig, frame: Option<Arc<Picture<T>>>,
  ) -> Result<(), EncoderError> {
    if let Some(pic) = &frame {
      if pic.width != cfg.width || pic.height != cfg.height {
        return Err(EncoderError::InvalidArgument(format!(
          "picture is {}x{}, configured for {}x{}",
          pic.width, pic.height, cfg.width, cfg.height
        )));
      }
      if pic.chroma_sampling != cfg.chroma_sampling {
        return Err(EncoderError::InvalidArgument(
          "picture chroma sampling differs from configuration".into(),
        ));
      }
      self.pic_icnt += 1;
    }
    self.frame_q.push_back(frame);
    Ok(())
  }

  pub(crate) fn set_force_output(&mut self, on: bool) {
    self.force_output = on;
    // Remember how many inputs existed at this point; pictures beyond it
    // are not waited for.
    self.pic_ticnt = self.pic_icnt;
  }

  fn no_more_frames(&self) -> bool {
    self.drained || (self.force_output && self.frames_out >= self.pic_ticnt)
  }

  pub(crate) fn receive_packet(
    &mut self, pool: &rayon::ThreadPool, cfg: &EncoderConfig,
    is_flushing: bool,
  ) -> Result<Packet, EncoderStatus> {
    if self.no_more_frames() {
      return Err(EncoderStatus::LimitReached);
    }
    let pic = match self.frame_q.pop_front() {
      Some(Some(pic)) => pic,
      Some(None) => {
        self.drained = true;
        return Err(EncoderStatus::LimitReached);
      }
      None => {
        return Err(if is_flushing {
          EncoderStatus::LimitReached
        } else {
          EncoderStatus::NeedMoreData
        });
      }
    };

    let idx = self.frames_out;
    let keyint = cfg.key_frame_interval;
    let is_key = idx == 0 || (keyint > 0 && idx % keyint == 0);
    let slice_type = if is_key { SliceType::I } else { SliceType::P };
    let idr = is_key && (idx == 0 || cfg.closed_gop);

    let mut fi = PicParams::from_config(cfg, slice_type, idx, idr);
    if cfg.threads == 0 {
      fi.threads = pool.current_num_threads().max(1);
    }

    let (data, enc_stats) = encode_picture(
      pool,
      &fi,
      &pic,
      self.md.as_ref(),
      self.uc.as_ref(),
      self.lf.as_ref(),
      &self.dpb,
    )?;

    self.dpb.push(fi.poc);
    let keep = fi.sps.max_num_ref_pics.max(1);
    if self.dpb.len() > keep {
      let cut = self.dpb.len() - keep;
      self.dpb.drain(..cut);
    }
    self.frames_out += 1;

    Ok(Packet {
      data,
      input_frameno: idx,
      frame_type: if is_key { FrameType::KEY } else { FrameType::INTER },
      qp: fi.slice_qp,
      enc_stats,
    })
  }

  pub(crate) fn frames_queued(&self) -> usize {
    self.frame_q.iter().filter(|f| f.is_some()).count()
  }
}
