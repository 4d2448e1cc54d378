// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Coding-unit geometry: split modes and the fixed decomposition table that
//! turns a parent region into its sub-parts.

use crate::api::EncoderError;

use arrayvec::ArrayVec;

pub const MAX_CU_LOG2: usize = 6;
pub const MAX_CU_SIZE: usize = 1 << MAX_CU_LOG2;
pub const MIN_CU_LOG2: usize = 2;
pub const MIN_CU_SIZE: usize = 1 << MIN_CU_LOG2;
/// Smallest-coding-unit columns (or rows) spanning one CTU.
pub const SCU_PER_CTU_LINE: usize = MAX_CU_SIZE >> MIN_CU_LOG2;
pub const MAX_CU_CNT_IN_CTU: usize = SCU_PER_CTU_LINE * SCU_PER_CTU_LINE;
pub const MAX_CU_DEPTH: usize = 10;

pub const MIN_QUANT: u8 = 0;
pub const MAX_QUANT: u8 = 51;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SplitMode {
  #[default]
  NoSplit,
  BiVer,
  BiHor,
  TriVer,
  TriHor,
  Quad,
}

impl SplitMode {
  pub fn part_count(self) -> usize {
    match self {
      SplitMode::NoSplit => 1,
      SplitMode::BiVer | SplitMode::BiHor => 2,
      SplitMode::TriVer | SplitMode::TriHor => 3,
      SplitMode::Quad => 4,
    }
  }

  pub fn is_btt(self) -> bool {
    matches!(
      self,
      SplitMode::BiVer | SplitMode::BiHor | SplitMode::TriVer | SplitMode::TriHor
    )
  }

  pub fn is_vertical(self) -> bool {
    matches!(self, SplitMode::BiVer | SplitMode::TriVer)
  }

  pub fn is_ternary(self) -> bool {
    matches!(self, SplitMode::TriVer | SplitMode::TriHor)
  }

  /// Whether this split is geometrically representable for the region, under
  /// the profile's split-signaling flag.
  pub fn allowed(self, w: usize, h: usize, sps_btt: bool) -> bool {
    match self {
      SplitMode::NoSplit => true,
      SplitMode::Quad => w >= 2 * MIN_CU_SIZE && h >= 2 * MIN_CU_SIZE && w == h,
      SplitMode::BiVer => sps_btt && w >= 2 * MIN_CU_SIZE,
      SplitMode::BiHor => sps_btt && h >= 2 * MIN_CU_SIZE,
      SplitMode::TriVer => sps_btt && w >= 4 * MIN_CU_SIZE,
      SplitMode::TriHor => sps_btt && h >= 4 * MIN_CU_SIZE,
    }
  }
}

/// Which coding trees a region is restricted to, inherited down the
/// quadtree. Once a region is forced into a single-tree regime, descendants
/// stay in it; fresh sub-parts of an explicit split revert to the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeType {
  All,
  LumaOnly,
  ChromaOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeCons {
  All,
  OnlyIntra,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeCons {
  pub tree_type: TreeType,
  pub mode_cons: ModeCons,
}

impl TreeCons {
  pub const fn default_cons() -> Self {
    TreeCons { tree_type: TreeType::All, mode_cons: ModeCons::All }
  }
}

impl Default for TreeCons {
  fn default() -> Self {
    Self::default_cons()
  }
}

/// A region of the coding tree: position and size in pixels, plus the
/// quadtree depth `cud` and the index `cup` of its top-left smallest coding
/// unit within the CTU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CuRegion {
  pub x0: usize,
  pub y0: usize,
  pub w: usize,
  pub h: usize,
  pub cup: u16,
  pub cud: u8,
}

impl CuRegion {
  pub fn ctu_root(x0: usize, y0: usize) -> Self {
    CuRegion { x0, y0, w: MAX_CU_SIZE, h: MAX_CU_SIZE, cup: 0, cud: 0 }
  }
}

/// Index of the smallest coding unit at pixel `(x, y)` within the CTU whose
/// origin is `ctu_org`.
pub fn cup_of(
  ctu_org: (usize, usize), x: usize, y: usize,
) -> Result<u16, EncoderError> {
  let dx = x.checked_sub(ctu_org.0);
  let dy = y.checked_sub(ctu_org.1);
  match (dx, dy) {
    (Some(dx), Some(dy)) if dx < MAX_CU_SIZE && dy < MAX_CU_SIZE => {
      Ok(((dy >> MIN_CU_LOG2) * SCU_PER_CTU_LINE + (dx >> MIN_CU_LOG2)) as u16)
    }
    _ => Err(EncoderError::EncodeFailure(format!(
      "coding unit at ({}, {}) escapes its CTU at ({}, {})",
      x, y, ctu_org.0, ctu_org.1
    ))),
  }
}

#[derive(Clone, Copy, Debug)]
pub struct SplitPart {
  pub x: usize,
  pub y: usize,
  pub w: usize,
  pub h: usize,
  pub cup: u16,
  pub cud: u8,
}

/// The geometric decomposition of a parent region for one split type. The
/// sub-part count, sizes, positions, depths and indices are all derived
/// deterministically from the split type and parent geometry.
#[derive(Clone, Debug)]
pub struct SplitStruct {
  pub parts: ArrayVec<SplitPart, 4>,
  pub tree_cons: TreeCons,
}

impl SplitStruct {
  pub fn for_split(
    mode: SplitMode, region: CuRegion, ctu_org: (usize, usize),
  ) -> Result<SplitStruct, EncoderError> {
    let CuRegion { x0, y0, w, h, cud, .. } = region;
    let malformed = || {
      EncoderError::EncodeFailure(format!(
        "{:?} split of a {}x{} region at ({}, {})",
        mode, w, h, x0, y0
      ))
    };

    let mut geom: ArrayVec<(usize, usize, usize, usize, u8), 4> = ArrayVec::new();
    match mode {
      SplitMode::NoSplit => return Err(malformed()),
      SplitMode::Quad => {
        if w < 2 * MIN_CU_SIZE || h < 2 * MIN_CU_SIZE {
          return Err(malformed());
        }
        let (hw, hh) = (w / 2, h / 2);
        geom.push((x0, y0, hw, hh, cud + 1));
        geom.push((x0 + hw, y0, hw, hh, cud + 1));
        geom.push((x0, y0 + hh, hw, hh, cud + 1));
        geom.push((x0 + hw, y0 + hh, hw, hh, cud + 1));
      }
      SplitMode::BiVer => {
        if w < 2 * MIN_CU_SIZE {
          return Err(malformed());
        }
        let hw = w / 2;
        geom.push((x0, y0, hw, h, cud + 1));
        geom.push((x0 + hw, y0, hw, h, cud + 1));
      }
      SplitMode::BiHor => {
        if h < 2 * MIN_CU_SIZE {
          return Err(malformed());
        }
        let hh = h / 2;
        geom.push((x0, y0, w, hh, cud + 1));
        geom.push((x0, y0 + hh, w, hh, cud + 1));
      }
      SplitMode::TriVer => {
        if w < 4 * MIN_CU_SIZE {
          return Err(malformed());
        }
        let qw = w / 4;
        geom.push((x0, y0, qw, h, cud + 2));
        geom.push((x0 + qw, y0, w / 2, h, cud + 1));
        geom.push((x0 + qw + w / 2, y0, qw, h, cud + 2));
      }
      SplitMode::TriHor => {
        if h < 4 * MIN_CU_SIZE {
          return Err(malformed());
        }
        let qh = h / 4;
        geom.push((x0, y0, w, qh, cud + 2));
        geom.push((x0, y0 + qh, w, h / 2, cud + 1));
        geom.push((x0, y0 + qh + h / 2, w, qh, cud + 2));
      }
    }

    let mut parts = ArrayVec::new();
    for &(x, y, pw, ph, pcud) in &geom {
      if pcud as usize >= MAX_CU_DEPTH {
        return Err(malformed());
      }
      parts.push(SplitPart {
        x,
        y,
        w: pw,
        h: ph,
        cup: cup_of(ctu_org, x, y)?,
        cud: pcud,
      });
    }
    Ok(SplitStruct { parts, tree_cons: TreeCons::default_cons() })
  }
}

/// Context index for the quad split flag, by size class.
pub fn split_cu_ctx(w: usize, h: usize) -> usize {
  let min = w.min(h);
  if min >= MAX_CU_SIZE {
    0
  } else if min >= 16 {
    1
  } else {
    2
  }
}

/// Context index for the binary/ternary split flag.
pub fn btt_split_ctx(w: usize, h: usize) -> usize {
  use crate::util::ILog;
  let sz = (w.bit_width() + h.bit_width()) / 2;
  sz.saturating_sub(4).min(crate::ec::BTT_SPLIT_FLAG_CTX - 1)
}

#[cfg(test)]
mod test {
  use super::*;
  use rand::rngs::StdRng;
  use rand::{Rng, SeedableRng};

  fn area_cells(parts: &[SplitPart]) -> Vec<(usize, usize)> {
    let mut cells = Vec::new();
    for p in parts {
      for y in (p.y..p.y + p.h).step_by(MIN_CU_SIZE) {
        for x in (p.x..p.x + p.w).step_by(MIN_CU_SIZE) {
          cells.push((x, y));
        }
      }
    }
    cells.sort_unstable();
    cells
  }

  fn parent_cells(r: CuRegion) -> Vec<(usize, usize)> {
    let mut cells = Vec::new();
    for y in (r.y0..r.y0 + r.h).step_by(MIN_CU_SIZE) {
      for x in (r.x0..r.x0 + r.w).step_by(MIN_CU_SIZE) {
        cells.push((x, y));
      }
    }
    cells.sort_unstable();
    cells
  }

  #[test]
  fn sub_parts_exactly_tile_parent() {
    let modes = [
      SplitMode::Quad,
      SplitMode::BiVer,
      SplitMode::BiHor,
      SplitMode::TriVer,
      SplitMode::TriHor,
    ];
    let root = CuRegion::ctu_root(64, 128);
    for mode in modes {
      let ss = SplitStruct::for_split(mode, root, (64, 128)).unwrap();
      assert_eq!(ss.parts.len(), mode.part_count());
      assert_eq!(area_cells(&ss.parts), parent_cells(root));
    }
  }

  #[test]
  fn random_descent_never_leaks_area() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let modes = [
      SplitMode::Quad,
      SplitMode::BiVer,
      SplitMode::BiHor,
      SplitMode::TriVer,
      SplitMode::TriHor,
    ];
    for _ in 0..200 {
      let mut region = CuRegion::ctu_root(0, 0);
      for _ in 0..4 {
        let mode = modes[rng.gen_range(0..modes.len())];
        if !mode.allowed(region.w, region.h, true) {
          break;
        }
        let ss = SplitStruct::for_split(mode, region, (0, 0)).unwrap();
        assert_eq!(area_cells(&ss.parts), parent_cells(region));
        for p in &ss.parts {
          assert!(p.x + p.w <= MAX_CU_SIZE && p.y + p.h <= MAX_CU_SIZE);
          assert!(p.w >= MIN_CU_SIZE && p.h >= MIN_CU_SIZE);
          assert!(p.cud > region.cud);
        }
        let pick = rng.gen_range(0..ss.parts.len());
        let p = ss.parts[pick];
        region =
          CuRegion { x0: p.x, y0: p.y, w: p.w, h: p.h, cup: p.cup, cud: p.cud };
      }
    }
  }

  #[test]
  fn cup_matches_scu_raster() {
    assert_eq!(cup_of((0, 0), 0, 0).unwrap(), 0);
    assert_eq!(cup_of((0, 0), 4, 0).unwrap(), 1);
    assert_eq!(cup_of((0, 0), 0, 4).unwrap(), SCU_PER_CTU_LINE as u16);
    assert_eq!(cup_of((64, 64), 92, 72).unwrap(), 2 * SCU_PER_CTU_LINE as u16 + 7);
    assert!(cup_of((64, 0), 0, 0).is_err());
    assert!(cup_of((0, 0), 64, 0).is_err());
  }

  #[test]
  fn undersized_regions_are_malformed() {
    let tiny = CuRegion { x0: 0, y0: 0, w: 8, h: 8, cup: 0, cud: 3 };
    assert!(SplitStruct::for_split(SplitMode::TriVer, tiny, (0, 0)).is_err());
    assert!(SplitStruct::for_split(SplitMode::NoSplit, tiny, (0, 0)).is_err());
    let minimal = CuRegion { x0: 0, y0: 0, w: 4, h: 4, cup: 0, cud: 4 };
    assert!(SplitStruct::for_split(SplitMode::Quad, minimal, (0, 0)).is_err());
  }

  #[test]
  fn ternary_depth_increments() {
    let root = CuRegion::ctu_root(0, 0);
    let ss = SplitStruct::for_split(SplitMode::TriHor, root, (0, 0)).unwrap();
    assert_eq!(ss.parts[0].cud, 2);
    assert_eq!(ss.parts[1].cud, 1);
    assert_eq!(ss.parts[2].cud, 2);
    assert_eq!(ss.tree_cons, TreeCons::default_cons());
  }
}
