// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use crate::partition::MAX_CU_SIZE;

use v_frame::pixel::{ChromaSampling, Pixel};
use v_frame::plane::Plane;

/// One source picture handed to the encoder. Planes are padded out to the
/// CTU size so boundary CTUs can be analyzed without bounds checks.
#[derive(Clone, Debug)]
pub struct Picture<T: Pixel> {
  pub planes: [Plane<T>; 3],
  pub width: usize,
  pub height: usize,
  pub chroma_sampling: ChromaSampling,
}

impl<T: Pixel> Picture<T> {
  pub fn new(width: usize, height: usize, cs: ChromaSampling) -> Self {
    let (xdec, ydec) = chroma_decimation(cs);
    let pad = MAX_CU_SIZE;
    Picture {
      planes: [
        Plane::new(width, height, 0, 0, pad, pad),
        Plane::new(width >> xdec, height >> ydec, xdec, ydec, pad, pad),
        Plane::new(width >> xdec, height >> ydec, xdec, ydec, pad, pad),
      ],
      width,
      height,
      chroma_sampling: cs,
    }
  }

  /// Builds a picture whose luma plane is `f(x, y)`; chroma stays at the
  /// allocation default. Handy for tests and synthetic inputs.
  pub fn from_luma_fn(
    width: usize, height: usize, cs: ChromaSampling,
    f: impl Fn(usize, usize) -> T,
  ) -> Self {
    let mut pic = Self::new(width, height, cs);
    let stride = pic.planes[0].cfg.stride;
    let data = pic.planes[0].data_origin_mut();
    for y in 0..height {
      for x in 0..width {
        data[y * stride + x] = f(x, y);
      }
    }
    pic
  }

  #[inline]
  pub fn luma(&self) -> &Plane<T> {
    &self.planes[0]
  }
}

pub fn chroma_decimation(cs: ChromaSampling) -> (usize, usize) {
  match cs {
    ChromaSampling::Cs420 => (1, 1),
    ChromaSampling::Cs422 => (1, 0),
    ChromaSampling::Cs444 => (0, 0),
    ChromaSampling::Cs400 => (1, 1),
  }
}

/// Theoretical raw bit cost of the picture padded out to whole minimum
/// coding units, used by the anti-starvation bound on the arithmetic coder.
pub fn raw_picture_bits(
  width: usize, height: usize, min_cu: usize, bit_depth_luma: u8,
  bit_depth_chroma: u8, chroma_format_idc: u8,
) -> u64 {
  let log2_sub_wh_c = 2;
  let padded_w = (width + min_cu - 1) / min_cu * min_cu;
  let padded_h = (height + min_cu - 1) / min_cu * min_cu;
  let mut bits_per_px = bit_depth_luma as u64;
  if chroma_format_idc != 0 {
    bits_per_px += 2 * ((bit_depth_chroma as u64) >> log2_sub_wh_c);
  }
  padded_w as u64 * padded_h as u64 * bits_per_px
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn raw_bits_420_8bit() {
    // 8 bpp luma + 2 * (8 >> 2) chroma = 12 bpp on padded dimensions.
    assert_eq!(raw_picture_bits(64, 64, 4, 8, 8, 1), 64 * 64 * 12);
    assert_eq!(raw_picture_bits(65, 63, 4, 8, 8, 1), 68 * 64 * 12);
  }

  #[test]
  fn raw_bits_monochrome() {
    assert_eq!(raw_picture_bits(64, 64, 4, 8, 8, 0), 64 * 64 * 8);
  }

  #[test]
  fn luma_fn_fills_pixels() {
    let pic: Picture<u8> =
      Picture::from_luma_fn(16, 8, ChromaSampling::Cs420, |x, y| {
        (x + 2 * y) as u8
      });
    assert_eq!(pic.luma().p(0, 0), 0);
    assert_eq!(pic.luma().p(3, 2), 7);
    assert_eq!(pic.width, 16);
  }
}
