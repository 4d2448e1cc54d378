// Copyright (c) 2022-2024, The reve contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

//! A block-based video picture encoder core in the MPEG-5 essential video
//! coding family: recursive coding-tree partitioning serialized through a
//! context-adaptive binary arithmetic coder, wavefront-parallel CTU
//! scheduling per tile, and two-pass slice finalization.
//!
//! ```
//! use reve::{Config, Context, EncoderConfig, Picture};
//! use std::sync::Arc;
//! use v_frame::pixel::ChromaSampling;
//!
//! let enc = EncoderConfig { width: 64, height: 64, ..Default::default() };
//! let mut ctx: Context<u8> =
//!   Config::new().with_encoder_config(enc).new_context().unwrap();
//! let pic = Picture::from_luma_fn(64, 64, ChromaSampling::Cs420, |x, y| {
//!   (x ^ y) as u8
//! });
//! ctx.send_frame(Some(Arc::new(pic))).unwrap();
//! ctx.flush();
//! let packet = ctx.receive_packet().unwrap();
//! assert!(!packet.data.is_empty());
//! ```

pub mod context;
pub mod ec;
pub mod encoder;
pub mod frame;
pub mod header;
pub mod mode;
pub mod partition;
pub mod sync;
pub mod tiling;
pub(crate) mod tree;
pub mod util;
pub(crate) mod worker;

mod api;

pub use api::*;
pub use encoder::EncoderStats;
pub use frame::Picture;
