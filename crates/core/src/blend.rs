//! Seam blending: a per-tile confidence mask and the online weighted-average
//! canvas that tiles are folded into.
//!
//! Each tile contributes its trimmed `filter_size x filter_size` region to
//! the canvas. Pixels near a tile edge get low weight, so where two tiles
//! overlap the interior of each dominates and the seam fades across
//! [`BLEND_SIZE`] output pixels.

use ndarray::{s, Array3, ArrayView3, Zip};

use crate::error::{UpscaleError, UpscaleResult};
use crate::params::{RenderingParams, BLEND_SIZE};

/// Weight sums at or below this are treated as empty.
const WEIGHT_EPSILON: f32 = 1e-8;

/// Immutable `(3, size, size)` weight mask for one tile's trimmed output.
#[derive(Debug, Clone)]
pub struct BlendFilter {
    weights: Array3<f32>,
}

impl BlendFilter {
    /// Builds the mask for tiles of `tile_size` input pixels magnified by
    /// `scale` and trimmed by `offset` output pixels on every side.
    pub fn new(scale: usize, offset: usize, tile_size: usize) -> UpscaleResult<Self> {
        let full = tile_size.checked_mul(scale).unwrap_or(0);
        let size = full
            .checked_sub(2 * offset)
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                UpscaleError::InvalidConfig(format!(
                    "blend filter is empty for tile_size {tile_size}, scale {scale}, offset {offset}"
                ))
            })?;

        let weights = Array3::from_shape_fn((3, size, size), |(_, i, j)| {
            let min_dist = i.min(j).min(size - 1 - i).min(size - 1 - j);
            edge_weight(min_dist)
        });

        Ok(Self { weights })
    }

    pub fn size(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn weights(&self) -> ArrayView3<'_, f32> {
        self.weights.view()
    }
}

/// Weight for a pixel `min_dist` pixels away from the nearest tile edge.
///
/// Ramps linearly from `1 / (BLEND_SIZE + 1)` at the edge to 1 and never
/// reaches zero, so every covered pixel receives some contribution.
pub fn edge_weight(min_dist: usize) -> f32 {
    if min_dist >= BLEND_SIZE {
        1.0
    } else {
        (min_dist + 1) as f32 / (BLEND_SIZE + 1) as f32
    }
}

/// Whole-canvas running weighted average.
///
/// Owned by exactly one upscale operation; [`update`](Self::update) folds a
/// tile in, [`into_result`](Self::into_result) hands back the pixel buffer.
#[derive(Debug)]
pub struct SeamBlendingAccumulator {
    pixels: Array3<f32>,
    weights: Array3<f32>,
    filter: BlendFilter,
    offset: usize,
    output_tile_step: usize,
    h_blocks: usize,
    w_blocks: usize,
}

impl SeamBlendingAccumulator {
    pub fn new(params: &RenderingParams, filter: BlendFilter) -> UpscaleResult<Self> {
        if filter.size() != params.filter_size {
            return Err(UpscaleError::InvalidConfig(format!(
                "blend filter size {} does not match tile output size {}",
                filter.size(),
                params.filter_size
            )));
        }

        let shape = (3, params.y_buffer_h, params.y_buffer_w);
        Ok(Self {
            pixels: Array3::zeros(shape),
            weights: Array3::zeros(shape),
            filter,
            offset: params.offset,
            output_tile_step: params.output_tile_step,
            h_blocks: params.h_blocks,
            w_blocks: params.w_blocks,
        })
    }

    /// Folds one tile's trimmed `(3, filter, filter)` output into the canvas.
    pub fn update(
        &mut self,
        tile: ArrayView3<'_, f32>,
        tile_row: usize,
        tile_col: usize,
    ) -> UpscaleResult<()> {
        if tile_row >= self.h_blocks || tile_col >= self.w_blocks {
            return Err(UpscaleError::OutOfBounds(format!(
                "tile ({tile_row}, {tile_col}) outside {}x{} grid",
                self.h_blocks, self.w_blocks
            )));
        }
        if tile.shape() != self.filter.weights.shape() {
            return Err(UpscaleError::InferenceFailed(format!(
                "tile output shape {:?} does not match blend filter shape {:?}",
                tile.shape(),
                self.filter.weights.shape()
            )));
        }

        let size = self.filter.size();
        let top = tile_row * self.output_tile_step + self.offset;
        let left = tile_col * self.output_tile_step + self.offset;

        let pixels = self
            .pixels
            .slice_mut(s![.., top..top + size, left..left + size]);
        let weights = self
            .weights
            .slice_mut(s![.., top..top + size, left..left + size]);

        Zip::from(pixels)
            .and(weights)
            .and(&tile)
            .and(&self.filter.weights)
            .for_each(|pixel, weight, &value, &blend| {
                let old = *weight;
                let new = old + blend;
                if new > WEIGHT_EPSILON {
                    *pixel = *pixel * (old / new) + value * (blend / new);
                } else {
                    *pixel = value;
                }
                *weight = new;
            });

        Ok(())
    }

    /// Current `(3, y_buffer_h, y_buffer_w)` canvas; valid after any number of updates.
    pub fn result(&self) -> ArrayView3<'_, f32> {
        self.pixels.view()
    }

    pub fn into_result(self) -> Array3<f32> {
        self.pixels
    }
}
