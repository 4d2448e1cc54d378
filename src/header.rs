// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Uncompressed header serialization: NALU headers and slice headers.
//!
//! Slice headers carry the fields that are only known after the slice
//! payload has been encoded (CTU count, per-tile entry points), which is
//! why the orchestrator writes them in a second pass.

use crate::api::SliceType;
use crate::util::ILog;

use bitstream_io::{BigEndian, BitWrite, BitWriter};

use std::io;

/// Bytes of the network-byte-order size field preceding each slice payload.
pub const NALU_SIZE_FIELD_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NaluType {
  NonIdr = 0,
  Idr = 1,
}

#[derive(Clone, Copy, Debug)]
pub struct Nalu {
  pub nal_unit_type: NaluType,
  pub temporal_id: u8,
}

/// Sequence-level tool set consumed by the core. Construction of standalone
/// parameter-set NALUs happens outside this crate.
#[derive(Clone, Copy, Debug)]
pub struct Sps {
  pub bit_depth_luma_minus8: u8,
  pub bit_depth_chroma_minus8: u8,
  /// 0 = monochrome, 1 = 4:2:0.
  pub chroma_format_idc: u8,
  pub log2_max_cuwh: usize,
  /// Signals binary/ternary splits; off restricts the tree to quad splits.
  pub sps_btt_flag: bool,
  /// Probability-model initialization from slice type and QP.
  pub tool_cm_init: bool,
  pub max_num_ref_pics: usize,
  pub dquant_flag: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Pps {
  pub pps_id: u8,
  pub cu_qp_delta_enabled_flag: bool,
  pub tile_columns: usize,
  pub tile_rows: usize,
}

#[derive(Clone, Debug)]
pub struct SliceHeader {
  pub pps_id: u8,
  pub slice_type: SliceType,
  pub qp: u8,
  pub qp_u: u8,
  pub qp_v: u8,
  pub num_ctb: u32,
  pub first_tile_id: u16,
  pub num_tiles_in_slice: u16,
  /// Byte length minus one of each tile's payload, in tile order.
  pub entry_point_offsets: Vec<u32>,
  pub deblocking_filter_on: bool,
}

pub trait UncompressedHeader {
  fn write_ue(&mut self, v: u32) -> io::Result<()>;
  fn write_se(&mut self, v: i32) -> io::Result<()>;
  fn write_nalu_header(&mut self, nalu: &Nalu) -> io::Result<()>;
  fn write_slice_header(&mut self, sh: &SliceHeader) -> io::Result<()>;
}

impl<W: io::Write> UncompressedHeader for BitWriter<W, BigEndian> {
  fn write_ue(&mut self, v: u32) -> io::Result<()> {
    let x = v as u64 + 1;
    let bits = x.bit_width() as u32;
    if bits > 1 {
      self.write(bits - 1, 0u32)?;
    }
    self.write(bits, x as u32)
  }

  fn write_se(&mut self, v: i32) -> io::Result<()> {
    let mapped = if v <= 0 { (-v as u32) << 1 } else { ((v as u32) << 1) - 1 };
    self.write_ue(mapped)
  }

  fn write_nalu_header(&mut self, nalu: &Nalu) -> io::Result<()> {
    self.write_bit(false)?; // forbidden_zero_bit
    self.write(6, nalu.nal_unit_type as u8)?;
    self.write(3, nalu.temporal_id)?;
    self.write(5, 0u8)?; // reserved
    self.write_bit(false) // extension_flag
  }

  fn write_slice_header(&mut self, sh: &SliceHeader) -> io::Result<()> {
    self.write_ue(sh.pps_id as u32)?;
    let single_tile = sh.num_tiles_in_slice == 1;
    self.write_bit(single_tile)?;
    if !single_tile {
      self.write_ue(sh.first_tile_id as u32)?;
      self.write_ue(sh.num_tiles_in_slice as u32 - 1)?;
    }
    self.write_ue(sh.slice_type.to_idx())?;
    self.write_ue(sh.num_ctb)?;
    self.write(6, sh.qp)?;
    self.write(6, sh.qp_u)?;
    self.write(6, sh.qp_v)?;
    self.write_bit(sh.deblocking_filter_on)?;

    if !sh.entry_point_offsets.is_empty() {
      let max = sh.entry_point_offsets.iter().copied().max().unwrap_or(0);
      let offset_len = (max.bit_width() as u32).max(1);
      self.write_ue(offset_len - 1)?;
      for &off in &sh.entry_point_offsets {
        self.write(offset_len, off)?;
      }
    }
    self.byte_align()
  }
}

/// Writes `size` into the four size-field bytes at `at`, most significant
/// byte first.
pub fn patch_size_field(buf: &mut [u8], at: usize, size: u32) {
  buf[at..at + NALU_SIZE_FIELD_BYTES].copy_from_slice(&size.to_be_bytes());
}

#[cfg(test)]
mod test {
  use super::*;
  use pretty_assertions::assert_eq;

  fn bits_of(f: impl FnOnce(&mut BitWriter<Vec<u8>, BigEndian>)) -> Vec<u8> {
    let mut w = BitWriter::endian(Vec::new(), BigEndian);
    f(&mut w);
    w.byte_align().unwrap();
    w.into_writer()
  }

  #[test]
  fn exp_golomb_patterns() {
    // ue(0) = "1", ue(1) = "010", ue(2) = "011" -> 1 010 011 0 = 0xA6
    let bytes = bits_of(|w| {
      for v in 0..3 {
        w.write_ue(v).unwrap();
      }
    });
    assert_eq!(bytes, vec![0xa6]);
  }

  #[test]
  fn signed_exp_golomb_mapping() {
    // se(1) -> ue(1), se(-1) -> ue(2), se(2) -> ue(3)
    let a = bits_of(|w| w.write_se(1).unwrap());
    let b = bits_of(|w| w.write_ue(1).unwrap());
    assert_eq!(a, b);
    let c = bits_of(|w| w.write_se(-1).unwrap());
    let d = bits_of(|w| w.write_ue(2).unwrap());
    assert_eq!(c, d);
  }

  #[test]
  fn nalu_header_is_two_bytes() {
    let bytes = bits_of(|w| {
      w.write_nalu_header(&Nalu { nal_unit_type: NaluType::Idr, temporal_id: 0 })
        .unwrap()
    });
    assert_eq!(bytes.len(), 2);
    assert_eq!(bytes[0] >> 7, 0); // forbidden bit
    assert_eq!((bytes[0] >> 1) & 0x3f, NaluType::Idr as u8);
  }

  #[test]
  fn slice_header_round_numbers() {
    let sh = SliceHeader {
      pps_id: 0,
      slice_type: SliceType::I,
      qp: 30,
      qp_u: 30,
      qp_v: 30,
      num_ctb: 4,
      first_tile_id: 0,
      num_tiles_in_slice: 2,
      entry_point_offsets: vec![199, 255],
      deblocking_filter_on: true,
    };
    let bytes = bits_of(|w| w.write_slice_header(&sh).unwrap());
    // Byte aligned and non-trivial.
    assert!(bytes.len() > 4);

    // A larger entry point must grow or keep the header size.
    let mut big = sh.clone();
    big.entry_point_offsets = vec![199, 70000];
    let bytes_big = bits_of(|w| w.write_slice_header(&big).unwrap());
    assert!(bytes_big.len() >= bytes.len());
  }

  #[test]
  fn size_field_network_order() {
    let mut buf = vec![0u8; 8];
    patch_size_field(&mut buf, 2, 0x0102_0304);
    assert_eq!(&buf[2..6], &[1, 2, 3, 4]);
  }
}
