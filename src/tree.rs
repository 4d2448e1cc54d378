// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Recursive descent over a CTU's coding-unit tree, serializing split
//! decisions and handing leaves off to the unit coder.

use crate::api::{EncoderError, SliceType};
use crate::context::{CtuData, DqpState};
use crate::ec::Sbac;
use crate::encoder::PicParams;
use crate::mode::{signal_split_mode, UnitCoder};
use crate::partition::{CuRegion, SplitMode, SplitStruct, TreeCons, MIN_CU_SIZE};

/// Encodes the coding tree rooted at `region`.
///
/// Split symbols are only signaled for regions that lie fully inside the
/// picture; boundary-truncated regions carry an inferred split the decoder
/// derives from the picture size alone. Any failure unwinds the whole
/// recursion: a CTU either serializes completely or not at all.
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_tree(
  fi: &PicParams, ctu: &CtuData, uc: &dyn UnitCoder, sbac: &mut Sbac,
  dqp: &mut DqpState, region: CuRegion, ctu_org: (usize, usize),
  slice_type: SliceType, cu_qp_delta_code: u8, tree_cons: TreeCons,
) -> Result<(), EncoderError> {
  let split = ctu.split_mode(region.cud, region.cup);
  let fits = region.x0 + region.w <= fi.w && region.y0 + region.h <= fi.h;

  if split != SplitMode::NoSplit {
    if fits {
      signal_split_mode(sbac, split, &region, fi);
    }

    let ss = SplitStruct::for_split(split, region, ctu_org)?;
    for part in &ss.parts {
      // Sub-parts starting outside the picture contribute no bits and no
      // state.
      if part.x < fi.w && part.y < fi.h {
        let sub = CuRegion {
          x0: part.x,
          y0: part.y,
          w: part.w,
          h: part.h,
          cup: part.cup,
          cud: part.cud,
        };
        encode_tree(
          fi,
          ctu,
          uc,
          sbac,
          dqp,
          sub,
          ctu_org,
          slice_type,
          cu_qp_delta_code,
          ss.tree_cons,
        )?;
      }
    }
  } else {
    if !fits {
      return Err(EncoderError::EncodeFailure(format!(
        "leaf of {}x{} at ({}, {}) crosses the picture boundary",
        region.w, region.h, region.x0, region.y0
      )));
    }
    // Leaves at the minimum size never carry a split symbol; the size is
    // fixed by configuration and implied.
    if region.w > MIN_CU_SIZE || region.h > MIN_CU_SIZE {
      signal_split_mode(sbac, SplitMode::NoSplit, &region, fi);
    }
    dqp.cu_qp_delta_code = cu_qp_delta_code;
    let leaf = ctu.leaf(region.cup).ok_or_else(|| {
      EncoderError::EncodeFailure(format!(
        "no mode decision for the leaf at ({}, {})",
        region.x0, region.y0
      ))
    })?;
    uc.encode_unit(
      sbac,
      region,
      leaf,
      slice_type,
      tree_cons,
      fi.pps.cu_qp_delta_enabled_flag,
      dqp,
    )?;
  }
  Ok(())
}
