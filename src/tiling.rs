// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! Tile grid derivation over the CTU grid.
//!
//! Tiles split the picture into independently entropy-initialized
//! rectangles. Column widths and row heights use the uniform distribution
//! rule, so grids that do not divide the CTU grid evenly put the remainder
//! on the later columns/rows.

use crate::api::EncoderError;

#[derive(Clone, Debug)]
pub struct TilingInfo {
  pub cols: usize,
  pub rows: usize,
  pub w_lcu: usize,
  pub h_lcu: usize,
  pub col_widths: Vec<usize>,
  pub row_heights: Vec<usize>,
}

impl TilingInfo {
  pub fn new(
    w_lcu: usize, h_lcu: usize, cols: usize, rows: usize,
  ) -> Result<Self, EncoderError> {
    if cols == 0 || rows == 0 || cols > w_lcu || rows > h_lcu {
      return Err(EncoderError::InvalidArgument(format!(
        "{}x{} tile grid over a {}x{} CTU grid",
        cols, rows, w_lcu, h_lcu
      )));
    }
    let col_widths =
      (0..cols).map(|i| (i + 1) * w_lcu / cols - i * w_lcu / cols).collect();
    let row_heights =
      (0..rows).map(|i| (i + 1) * h_lcu / rows - i * h_lcu / rows).collect();
    Ok(TilingInfo { cols, rows, w_lcu, h_lcu, col_widths, row_heights })
  }

  pub fn tile_count(&self) -> usize {
    self.cols * self.rows
  }

  /// Materializes the tiles in raster order.
  pub fn tiles(&self) -> Vec<Tile> {
    let mut tiles = Vec::with_capacity(self.tile_count());
    let mut y0 = 0;
    for r in 0..self.rows {
      let mut x0 = 0;
      for c in 0..self.cols {
        tiles.push(Tile {
          idx: r * self.cols + c,
          ctba_rs_first: y0 * self.w_lcu + x0,
          w_ctb: self.col_widths[c],
          h_ctb: self.row_heights[r],
        });
        x0 += self.col_widths[c];
      }
      y0 += self.row_heights[r];
    }
    tiles
  }
}

/// One rectangular region of CTUs within a slice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tile {
  pub idx: usize,
  /// Raster index of the tile's first CTU within the picture.
  pub ctba_rs_first: usize,
  pub w_ctb: usize,
  pub h_ctb: usize,
}

impl Tile {
  pub fn f_ctb(&self) -> usize {
    self.w_ctb * self.h_ctb
  }

  /// CTU-grid column of the tile's first CTU.
  pub fn sp_x_lcu(&self, w_lcu: usize) -> usize {
    self.ctba_rs_first % w_lcu
  }

  /// CTU-grid row of the tile's first CTU.
  pub fn sp_y_lcu(&self, w_lcu: usize) -> usize {
    self.ctba_rs_first / w_lcu
  }
}

/// Column boundary of tile `idx`: the sum of the widths of the tiles to its
/// left in the same tile row, found by a backward scan that stops at the
/// previous multiple of the column count.
// TODO: verify against tile grids whose columns change width between rows;
// the scan assumes every row shares one set of column widths.
pub fn col_bd(tiles: &[Tile], idx: usize, tile_cols: usize) -> usize {
  let mut col_bd = 0;
  if idx % tile_cols != 0 {
    let mut temp = idx as isize - 1;
    while temp >= 0 {
      col_bd += tiles[temp as usize].w_ctb;
      if temp as usize % tile_cols == 0 {
        break;
      }
      temp -= 1;
    }
  }
  col_bd
}
