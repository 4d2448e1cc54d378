// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Picture orchestration: wavefront dispatch of CTU workers per tile, the
//! sequential emission passes, and two-pass slice finalization with entry
//! points, anti-starvation padding and the network-order size field.

use crate::api::{EncoderConfig, EncoderError, SliceType};
use crate::context::{CtuData, DqpState};
use crate::ec::Sbac;
use crate::frame::{raw_picture_bits, Picture};
use crate::header::{
  patch_size_field, Nalu, NaluType, Pps, SliceHeader, Sps, UncompressedHeader,
  NALU_SIZE_FIELD_BYTES,
};
use crate::mode::{init_ref_pic_lists, LoopFilter, ModeDecision, UnitCoder};
use crate::partition::{
  CuRegion, TreeCons, MAX_CU_LOG2, MAX_CU_SIZE, MIN_CU_LOG2, MIN_CU_SIZE,
};
use crate::sync::{CtbSync, RemainingCtbs};
use crate::tiling::{col_bd, Tile, TilingInfo};
use crate::tree::encode_tree;
use crate::util::{clamp, Fixed};
use crate::worker::{ctu_worker, TileJob};

use bitstream_io::{BigEndian, BitWriter};

use std::ops::Range;
use std::sync::OnceLock;

use v_frame::pixel::{ChromaSampling, Pixel};

/// Limits how fast the arithmetic coder may consume bins relative to the
/// bytes it produces; see the padding step at the end of each slice.
pub const CABAC_ZERO_PARAM: u64 = 32;

/// Everything about one picture that stays constant while it is encoded.
#[derive(Clone, Debug)]
pub struct PicParams {
  /// Coded width, padded to whole minimum coding units.
  pub w: usize,
  /// Coded height, padded to whole minimum coding units.
  pub h: usize,
  pub w_lcu: usize,
  pub h_lcu: usize,
  pub f_lcu: usize,
  pub max_cuwh: usize,
  pub log2_max_cuwh: usize,
  pub min_cuwh: usize,
  pub sps: Sps,
  pub pps: Pps,
  pub slice_type: SliceType,
  pub poc: u64,
  pub slice_qp: u8,
  pub num_slices: usize,
  pub threads: usize,
  pub nalu_type: NaluType,
  pub temporal_id: u8,
  pub use_deblock: bool,
}

impl PicParams {
  pub(crate) fn from_config(
    cfg: &EncoderConfig, slice_type: SliceType, poc: u64, idr: bool,
  ) -> PicParams {
    let w = cfg.width.align_power_of_two(MIN_CU_LOG2);
    let h = cfg.height.align_power_of_two(MIN_CU_LOG2);
    let w_lcu = w.align_power_of_two_and_shift(MAX_CU_LOG2);
    let h_lcu = h.align_power_of_two_and_shift(MAX_CU_LOG2);
    PicParams {
      w,
      h,
      w_lcu,
      h_lcu,
      f_lcu: w_lcu * h_lcu,
      max_cuwh: MAX_CU_SIZE,
      log2_max_cuwh: MAX_CU_LOG2,
      min_cuwh: MIN_CU_SIZE,
      sps: Sps {
        bit_depth_luma_minus8: (cfg.bit_depth - 8) as u8,
        bit_depth_chroma_minus8: (cfg.bit_depth - 8) as u8,
        chroma_format_idc: match cfg.chroma_sampling {
          ChromaSampling::Cs400 => 0,
          _ => 1,
        },
        log2_max_cuwh: MAX_CU_LOG2,
        sps_btt_flag: cfg.enable_btt,
        tool_cm_init: cfg.enable_cm_init,
        max_num_ref_pics: cfg.max_ref_pics,
        dquant_flag: cfg.enable_cu_qp_delta,
      },
      pps: Pps {
        pps_id: 0,
        cu_qp_delta_enabled_flag: cfg.enable_cu_qp_delta,
        tile_columns: cfg.tile_cols.max(1),
        tile_rows: cfg.tile_rows.max(1),
      },
      slice_type,
      poc,
      slice_qp: clamp(cfg.quantizer, cfg.qp_min, cfg.qp_max),
      num_slices: cfg.num_slices.max(1),
      threads: cfg.threads.max(1),
      nalu_type: if idr { NaluType::Idr } else { NaluType::NonIdr },
      temporal_id: 0,
      use_deblock: cfg.enable_deblock,
    }
  }

  pub(crate) fn build_slice_header(
    &self, first_tile_id: u16, num_tiles_in_slice: u16, num_ctb: u32,
  ) -> SliceHeader {
    SliceHeader {
      pps_id: self.pps.pps_id,
      slice_type: self.slice_type,
      qp: self.slice_qp,
      qp_u: chroma_qp(self.slice_qp),
      qp_v: chroma_qp(self.slice_qp),
      num_ctb,
      first_tile_id,
      num_tiles_in_slice,
      entry_point_offsets: Vec::new(),
      deblocking_filter_on: self.use_deblock,
    }
  }

  #[cfg(test)]
  pub(crate) fn new_test(
    width: usize, height: usize, slice_type: SliceType, qp: u8,
  ) -> PicParams {
    let mut cfg = EncoderConfig::default();
    cfg.width = width;
    cfg.height = height;
    cfg.quantizer = qp;
    cfg.threads = 1;
    PicParams::from_config(&cfg, slice_type, 0, true)
  }
}

/// Chroma QP mapped from the luma QP.
fn chroma_qp(qp: u8) -> u8 {
  const TBL: [u8; 14] = [29, 30, 31, 32, 33, 33, 34, 34, 35, 35, 36, 36, 37, 37];
  match qp {
    0..=29 => qp,
    30..=43 => TBL[(qp - 30) as usize],
    _ => qp - 6,
  }
}

/// Per-picture encoding statistics reported with each packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderStats {
  /// Total emitted bytes, size fields included.
  pub bytes: usize,
  /// Entropy-coder bins across all tiles of all slices.
  pub bins: u64,
  pub tiles: usize,
  pub slices: usize,
  /// NALU plus slice-header bytes.
  pub header_bytes: usize,
  /// Tile payload bytes.
  pub payload_bytes: usize,
  /// Appended anti-starvation zero words.
  pub padding_words: u64,
}

/// Zero words needed to keep the coder's bin consumption decodable.
///
/// `num_bytes_in_units` counts everything after the size field: NALU
/// header, slice header and tile payloads.
pub(crate) fn cabac_zero_words(
  bins: u64, num_bytes_in_units: u64, raw_bits: u64,
) -> u64 {
  let threshold = (CABAC_ZERO_PARAM / 3) * num_bytes_in_units + raw_bits / 32;
  if bins >= threshold {
    let target =
      ((bins - raw_bits / 32) * 3 + (CABAC_ZERO_PARAM - 1)) / CABAC_ZERO_PARAM;
    if target > num_bytes_in_units {
      return (target - num_bytes_in_units + 2) / 3;
    }
  }
  0
}

fn assign_tiles_to_slices(
  tile_count: usize, num_slices: usize,
) -> Vec<Range<usize>> {
  (0..num_slices)
    .map(|s| s * tile_count / num_slices..(s + 1) * tile_count / num_slices)
    .collect()
}

/// Final, order-dependent bit emission for one tile in raster order. The
/// parallel phase exists for mode-decision concurrency; this pass is where
/// the bytes that reach the stream are produced.
fn encode_tile_sequential(
  fi: &PicParams, sh: &SliceHeader, tiles: &[Tile], idx: usize,
  cu_map: &[OnceLock<CtuData>], uc: &dyn UnitCoder,
) -> Result<(Vec<u8>, u64), EncoderError> {
  let tile = &tiles[idx];
  let w_lcu = fi.w_lcu;
  let col_bd = col_bd(tiles, idx, fi.pps.tile_columns);

  let mut sbac = Sbac::new();
  sbac.reset(sh.slice_type, sh.qp, fi.sps.tool_cm_init);
  let mut dqp = DqpState::new(sh.qp);
  let dqp_code = u8::from(fi.pps.cu_qp_delta_enabled_flag);

  let mut x_lcu = tile.sp_x_lcu(w_lcu);
  let mut y_lcu = tile.sp_y_lcu(w_lcu);
  let mut ctb_cnt_in_tile = tile.f_ctb();
  loop {
    let lcu_num = y_lcu * w_lcu + x_lcu;
    let ctu = cu_map[lcu_num].get().ok_or_else(|| {
      EncoderError::Unexpected(format!("CTU {} was never analyzed", lcu_num))
    })?;
    let x_pel = x_lcu << fi.log2_max_cuwh;
    let y_pel = y_lcu << fi.log2_max_cuwh;
    encode_tree(
      fi,
      ctu,
      uc,
      &mut sbac,
      &mut dqp,
      CuRegion::ctu_root(x_pel, y_pel),
      (x_pel, y_pel),
      sh.slice_type,
      dqp_code,
      TreeCons::default_cons(),
    )?;

    x_lcu += 1;
    if x_lcu >= tile.w_ctb + col_bd {
      x_lcu = tile.ctba_rs_first % w_lcu;
      y_lcu += 1;
    }
    ctb_cnt_in_tile -= 1;
    if ctb_cnt_in_tile == 0 {
      // tile end flag, then flush
      sbac.encode_bin_trm(true);
      return Ok(sbac.finish());
    }
  }
}

/// Encodes one picture into a sequence of NALU-delimited slice payloads.
pub(crate) fn encode_picture<T: Pixel>(
  pool: &rayon::ThreadPool, fi: &PicParams, src: &Picture<T>,
  md: &dyn ModeDecision<T>, uc: &dyn UnitCoder, lf: &dyn LoopFilter<T>,
  dpb: &[u64],
) -> Result<(Vec<u8>, EncoderStats), EncoderError> {
  let tiling =
    TilingInfo::new(fi.w_lcu, fi.h_lcu, fi.pps.tile_columns, fi.pps.tile_rows)?;
  let tiles = tiling.tiles();
  if fi.num_slices > tiles.len() {
    return Err(EncoderError::InvalidArgument(format!(
      "{} slices over {} tiles",
      fi.num_slices,
      tiles.len()
    )));
  }
  let slice_ranges = assign_tiles_to_slices(tiles.len(), fi.num_slices);

  let cu_map: Vec<OnceLock<CtuData>> =
    (0..fi.f_lcu).map(|_| OnceLock::new()).collect();
  let sync = CtbSync::new(fi.f_lcu);

  md.init_frame(fi, src)?;

  // Parallel phase plus the provisional sequential pass, slice by slice.
  let mut slice_headers = Vec::with_capacity(slice_ranges.len());
  let mut trial_payload_bytes = 0usize;
  for (slice_idx, range) in slice_ranges.iter().enumerate() {
    let sh = fi.build_slice_header(
      range.start as u16,
      range.len() as u16,
      fi.f_lcu as u32,
    );
    let refs =
      init_ref_pic_lists(fi.slice_type, fi.poc, dpb, fi.sps.max_num_ref_pics);
    log::debug!(
      "slice {} poc={} type={:?} refs={}",
      slice_idx,
      fi.poc,
      fi.slice_type,
      refs.l0.len()
    );

    for idx in range.clone() {
      let tile = &tiles[idx];
      let remaining = RemainingCtbs::new(tile.f_ctb());
      // Never over-subscribe rows that don't exist.
      let parallel = fi.threads.min(tile.h_ctb).max(1);
      let job = TileJob {
        fi,
        sh: &sh,
        src,
        tile,
        sync: &sync,
        remaining: &remaining,
        cu_map: &cu_map,
        md,
        uc,
        parallel_rows: parallel,
      };

      let mut results: Vec<Result<(), EncoderError>> = vec![Ok(()); parallel];
      pool.scope(|scope| {
        if let Some((r0, rest)) = results.split_first_mut() {
          for (i, slot) in rest.iter_mut().enumerate() {
            let job = &job;
            scope.spawn(move |_| {
              *slot = ctu_worker(job, i + 1);
            });
          }
          // Worker 0 does useful work on the dispatching thread instead of
          // occupying an extra pool slot.
          *r0 = ctu_worker(&job, 0);
        }
      });
      // All workers are joined by now; the first failure becomes the
      // tile's result.
      for r in results {
        r?;
      }
      if remaining.remaining() != 0 {
        return Err(EncoderError::Unexpected(format!(
          "tile {} finished with {} CTUs outstanding",
          idx,
          remaining.remaining()
        )));
      }

      let (payload, _bins) =
        encode_tile_sequential(fi, &sh, &tiles, idx, &cu_map, uc)?;
      trial_payload_bytes += payload.len();
    }
    slice_headers.push(sh);
  }

  // In-loop filtering once per picture, ahead of final emission.
  let mut rec = src.planes.clone();
  lf.filter(fi, &mut rec)?;

  // Final emission: re-encode each tile in raster order, then write the
  // slice header once its size-dependent fields are known.
  let mut out = Vec::new();
  let mut stats = EncoderStats::default();
  for (slice_idx, range) in slice_ranges.iter().enumerate() {
    let sh = &mut slice_headers[slice_idx];
    let mut payloads = Vec::with_capacity(range.len());
    let mut bins_in_units = 0u64;
    sh.entry_point_offsets.clear();
    for idx in range.clone() {
      let (payload, bins) =
        encode_tile_sequential(fi, sh, &tiles, idx, &cu_map, uc)?;
      sh.entry_point_offsets.push(payload.len() as u32 - 1);
      bins_in_units += bins;
      payloads.push(payload);
    }

    let slice_start = out.len();
    out.extend_from_slice(&[0u8; NALU_SIZE_FIELD_BYTES]);

    let mut bw = BitWriter::endian(Vec::new(), BigEndian);
    bw.write_nalu_header(&Nalu {
      nal_unit_type: fi.nalu_type,
      temporal_id: fi.temporal_id,
    })?;
    bw.write_slice_header(sh)?;
    let header = bw.into_writer();
    stats.header_bytes += header.len();
    out.extend_from_slice(&header);
    for p in &payloads {
      stats.payload_bytes += p.len();
      out.extend_from_slice(p);
    }

    let num_bytes_in_units =
      (out.len() - slice_start - NALU_SIZE_FIELD_BYTES) as u64;
    let raw_bits = raw_picture_bits(
      fi.w,
      fi.h,
      fi.min_cuwh,
      fi.sps.bit_depth_luma_minus8 + 8,
      fi.sps.bit_depth_chroma_minus8 + 8,
      fi.sps.chroma_format_idc,
    );
    let words = cabac_zero_words(bins_in_units, num_bytes_in_units, raw_bits);
    for _ in 0..words {
      // Each zero word is written as one 16-bit zero unit.
      out.extend_from_slice(&[0u8, 0u8]);
    }
    stats.padding_words += words;

    let total = (out.len() - slice_start - NALU_SIZE_FIELD_BYTES) as u32;
    patch_size_field(&mut out, slice_start, total);

    stats.bins += bins_in_units;
    stats.tiles += range.len();
    stats.slices += 1;
  }
  stats.bytes = out.len();

  log::debug!(
    "picture poc={} emitted {} bytes over {} slices ({} provisional payload bytes)",
    fi.poc,
    stats.bytes,
    stats.slices,
    trial_payload_bytes
  );
  Ok((out, stats))
}
