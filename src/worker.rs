// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! The per-thread unit of parallel work: one worker drives a row-striped set
//! of CTUs through mode decision and provisional entropy coding, observing
//! the wavefront dependency on its up-right neighbor.

use crate::api::EncoderError;
use crate::context::{CoreCtx, CtuData};
use crate::encoder::PicParams;
use crate::frame::Picture;
use crate::header::SliceHeader;
use crate::mode::{ModeDecision, UnitCoder};
use crate::partition::{CuRegion, TreeCons};
use crate::sync::{CtbSync, RemainingCtbs};
use crate::tiling::Tile;
use crate::tree::encode_tree;

use std::sync::OnceLock;

use v_frame::pixel::Pixel;

/// Everything one tile's worker set shares. The synchronization vector and
/// the remaining-CTU counter are the only cross-thread-mutated state;
/// everything else is read-only here.
pub(crate) struct TileJob<'a, T: Pixel> {
  pub fi: &'a PicParams,
  pub sh: &'a SliceHeader,
  pub src: &'a Picture<T>,
  pub tile: &'a Tile,
  pub sync: &'a CtbSync,
  pub remaining: &'a RemainingCtbs,
  pub cu_map: &'a [OnceLock<CtuData>],
  pub md: &'a dyn ModeDecision<T>,
  pub uc: &'a dyn UnitCoder,
  pub parallel_rows: usize,
}

/// Runs one worker over its striped rows of the tile. Always runs its loop
/// to completion or first error; errors are returned, never raised
/// asynchronously.
pub(crate) fn ctu_worker<T: Pixel>(
  job: &TileJob<'_, T>, thread_idx: usize,
) -> Result<(), EncoderError> {
  let fi = job.fi;
  let tile = job.tile;
  let w_lcu = fi.w_lcu;
  let sp_x_lcu = tile.sp_x_lcu(w_lcu);
  let sp_y_lcu = tile.sp_y_lcu(w_lcu);

  let mut core = CoreCtx::new(thread_idx, tile.idx, job.sh.qp);
  core.x_lcu = sp_x_lcu;
  core.y_lcu = sp_y_lcu + thread_idx;
  core.update_loc(w_lcu);

  // CABAC initialize for each tile, identically on every worker.
  core.sbac.reset(job.sh.slice_type, job.sh.qp, fi.sps.tool_cm_init);
  core.best_sbac = core.sbac.checkpoint();

  // This worker's previous-QP slot; saved and restored around each CTU's
  // entropy pass so the next CTU's prediction is unaffected by candidate
  // work inside this one.
  let mut bef_cu_qp = job.sh.qp;

  let result = loop {
    if core.y_lcu != sp_y_lcu && core.x_lcu < sp_x_lcu + tile.w_ctb - 1 {
      // up-right CTU
      job.sync.wait(core.lcu_num - w_lcu + 1);
    }

    if let Err(e) = encode_one_ctu(job, &mut core, &mut bef_cu_qp) {
      break Err(e);
    }

    job.sync.signal(core.lcu_num);
    job.remaining.finish_one();

    if !advance(&mut core, tile, sp_x_lcu, sp_y_lcu, job.parallel_rows, w_lcu)
    {
      break Ok(());
    }
  };

  if result.is_err() {
    // Dependents of this worker's rows must not spin forever; mark the
    // remainder of its stripe complete before handing the error back.
    release_stripe(job, thread_idx, sp_x_lcu, sp_y_lcu);
  }
  result
}

fn encode_one_ctu<T: Pixel>(
  job: &TileJob<'_, T>, core: &mut CoreCtx, bef_cu_qp: &mut u8,
) -> Result<(), EncoderError> {
  let fi = job.fi;

  job.md.init_ctu(fi, core)?;

  // Seed the "best" snapshot for mode decision; candidates are costed
  // against the copy, never against the committed coder.
  core.best_sbac = core.sbac.checkpoint();
  let mut ctu = job.md.analyze_ctu(fi, job.src, core)?;
  job.md.post_ctu(fi, core, &mut ctu)?;

  core.dqp.prev_qp = *bef_cu_qp;
  let dqp_code = u8::from(fi.pps.cu_qp_delta_enabled_flag);
  encode_tree(
    fi,
    &ctu,
    job.uc,
    &mut core.sbac,
    &mut core.dqp,
    CuRegion::ctu_root(core.x_pel, core.y_pel),
    (core.x_pel, core.y_pel),
    job.sh.slice_type,
    dqp_code,
    TreeCons::default_cons(),
  )?;
  *bef_cu_qp = core.dqp.prev_qp;

  job.cu_map[core.lcu_num].set(ctu).map_err(|_| {
    EncoderError::Unexpected(format!("CTU {} analyzed twice", core.lcu_num))
  })
}

/// Moves to this worker's next CTU; `false` when its stripe is exhausted.
fn advance(
  core: &mut CoreCtx, tile: &Tile, sp_x_lcu: usize, sp_y_lcu: usize,
  parallel_rows: usize, w_lcu: usize,
) -> bool {
  core.x_lcu += 1;
  if core.x_lcu >= sp_x_lcu + tile.w_ctb {
    core.x_lcu = sp_x_lcu;
    core.y_lcu += parallel_rows;
  }
  if core.y_lcu >= sp_y_lcu + tile.h_ctb {
    return false;
  }
  core.update_loc(w_lcu);
  true
}

fn release_stripe<T: Pixel>(
  job: &TileJob<'_, T>, thread_idx: usize, sp_x_lcu: usize, sp_y_lcu: usize,
) {
  let mut y = sp_y_lcu + thread_idx;
  while y < sp_y_lcu + job.tile.h_ctb {
    for x in sp_x_lcu..sp_x_lcu + job.tile.w_ctb {
      job.sync.signal(y * job.fi.w_lcu + x);
    }
    y += job.parallel_rows;
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::SliceType;
  use crate::mode::{BaselineAnalyzer, BaselineUnitCoder};
  use crate::tiling::TilingInfo;

  use std::sync::Mutex;
  use std::thread;
  use std::time::Duration;

  use v_frame::pixel::ChromaSampling;

  /// Wraps the baseline analyzer, logging for every CTU whether its up-right
  /// dependency was already complete, and optionally stalling one worker so
  /// the others would race ahead if the wait were broken.
  struct ProbedDecision<'s> {
    inner: BaselineAnalyzer,
    sync: &'s CtbSync,
    w_lcu: usize,
    delay_on_row: Option<usize>,
    observed: Mutex<Vec<(usize, bool)>>,
  }

  impl ModeDecision<u8> for ProbedDecision<'_> {
    fn init_frame(
      &self, fi: &PicParams, src: &Picture<u8>,
    ) -> Result<(), EncoderError> {
      ModeDecision::<u8>::init_frame(&self.inner, fi, src)
    }
    fn init_ctu(
      &self, fi: &PicParams, core: &mut CoreCtx,
    ) -> Result<(), EncoderError> {
      ModeDecision::<u8>::init_ctu(&self.inner, fi, core)
    }
    fn analyze_ctu(
      &self, fi: &PicParams, src: &Picture<u8>, core: &mut CoreCtx,
    ) -> Result<CtuData, EncoderError> {
      if self.delay_on_row == Some(core.y_lcu) {
        thread::sleep(Duration::from_millis(10));
      }
      let up_right_done = if core.y_lcu == 0 {
        true
      } else {
        let dep = core.lcu_num - self.w_lcu + 1;
        core.x_lcu + 1 >= self.w_lcu || self.sync.is_done(dep)
      };
      self.observed.lock().unwrap().push((core.lcu_num, up_right_done));
      ModeDecision::<u8>::analyze_ctu(&self.inner, fi, src, core)
    }
    fn post_ctu(
      &self, fi: &PicParams, core: &mut CoreCtx, ctu: &mut CtuData,
    ) -> Result<(), EncoderError> {
      ModeDecision::<u8>::post_ctu(&self.inner, fi, core, ctu)
    }
  }

  #[test]
  fn wavefront_dependency_is_respected_under_forced_delay() {
    // 4x4 CTUs, single tile, 4 workers; worker 0 (row 0) is stalled so rows
    // below would overtake it without the dependency wait.
    let (w, h) = (256, 256);
    let fi = PicParams::new_test(w, h, SliceType::I, 30);
    let pic = Picture::from_luma_fn(w, h, ChromaSampling::Cs420, |x, y| {
      (x * 3 + y) as u8
    });
    let tiling = TilingInfo::new(fi.w_lcu, fi.h_lcu, 1, 1).unwrap();
    let tiles = tiling.tiles();
    let tile = &tiles[0];
    let sync = CtbSync::new(fi.f_lcu);
    let remaining = RemainingCtbs::new(tile.f_ctb());
    let cu_map: Vec<OnceLock<CtuData>> =
      (0..fi.f_lcu).map(|_| OnceLock::new()).collect();
    let sh = fi.build_slice_header(0, 1, tile.f_ctb() as u32);
    let md = ProbedDecision {
      inner: BaselineAnalyzer::default(),
      sync: &sync,
      w_lcu: fi.w_lcu,
      delay_on_row: Some(0),
      observed: Mutex::new(Vec::new()),
    };
    let uc = BaselineUnitCoder;
    let parallel = tile.h_ctb;
    let job = TileJob {
      fi: &fi,
      sh: &sh,
      src: &pic,
      tile,
      sync: &sync,
      remaining: &remaining,
      cu_map: &cu_map,
      md: &md,
      uc: &uc,
      parallel_rows: parallel,
    };

    thread::scope(|s| {
      let mut handles = Vec::new();
      for t in 1..parallel {
        let job = &job;
        handles.push(s.spawn(move || ctu_worker(job, t)));
      }
      ctu_worker(&job, 0).unwrap();
      for h in handles {
        h.join().unwrap().unwrap();
      }
    });

    assert_eq!(remaining.remaining(), 0);
    let observed = md.observed.lock().unwrap();
    assert_eq!(observed.len(), tile.f_ctb());
    for &(lcu, ok) in observed.iter() {
      assert!(ok, "CTU {} began before its up-right dependency", lcu);
    }
    for lcu in 0..fi.f_lcu {
      assert!(cu_map[lcu].get().is_some(), "CTU {} never published", lcu);
    }
  }

  #[test]
  fn single_worker_covers_whole_tile() {
    let fi = PicParams::new_test(128, 128, SliceType::I, 30);
    let pic =
      Picture::from_luma_fn(128, 128, ChromaSampling::Cs420, |_, _| 42u8);
    let tiling = TilingInfo::new(fi.w_lcu, fi.h_lcu, 1, 1).unwrap();
    let tiles = tiling.tiles();
    let sync = CtbSync::new(fi.f_lcu);
    let remaining = RemainingCtbs::new(tiles[0].f_ctb());
    let cu_map: Vec<OnceLock<CtuData>> =
      (0..fi.f_lcu).map(|_| OnceLock::new()).collect();
    let sh = fi.build_slice_header(0, 1, fi.f_lcu as u32);
    let md = BaselineAnalyzer::default();
    let uc = BaselineUnitCoder;
    let job = TileJob {
      fi: &fi,
      sh: &sh,
      src: &pic,
      tile: &tiles[0],
      sync: &sync,
      remaining: &remaining,
      cu_map: &cu_map,
      md: &md,
      uc: &uc,
      parallel_rows: 1,
    };
    ctu_worker(&job, 0).unwrap();
    assert_eq!(remaining.remaining(), 0);
    assert!(cu_map.iter().all(|c| c.get().is_some()));
  }
}
