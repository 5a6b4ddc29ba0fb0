//! Tile-by-tile upscale of one image with a loaded session.
//!
//! Runs on whatever thread calls it; [`crate::engine`] puts it on a
//! dedicated worker. Every guard from [`crate::params`] runs before the
//! padded input or the canvas is allocated, and any failure discards all
//! intermediate buffers.

use std::time::Instant;

use ndarray::{s, ArrayView3};
use serde::Serialize;
use tracing::{debug, info};

use crate::blend::{BlendFilter, SeamBlendingAccumulator};
use crate::codec::{to_raster, to_tensor, RasterImage};
use crate::error::{UpscaleError, UpscaleResult};
use crate::params::{
    calc_rendering_params, check_image_dimensions, GuardLimits, RenderingParams, UpscaleConfig,
};
use crate::session::TileInference;
use crate::tensor::{chw_view, crop, reflection_pad, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpscaleProgress {
    pub current: usize,
    pub total: usize,
    pub percentage: u32,
}

impl UpscaleProgress {
    pub fn new(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            (current as f64 / total as f64 * 100.0).round() as u32
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// Receives progress and is polled for cancellation before every tile.
pub trait UpscaleObserver {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn on_progress(&mut self, progress: UpscaleProgress);
}

impl<F> UpscaleObserver for F
where
    F: FnMut(UpscaleProgress),
{
    fn on_progress(&mut self, progress: UpscaleProgress) {
        self(progress)
    }
}

/// Reduces a model output to the `(3, filter, filter)` region the
/// accumulator consumes.
///
/// Accepts batched or unbatched output that is either the full
/// `tile_size * scale` square (trimmed by `offset` here) or already trimmed.
fn trimmed_tile_view<'a>(
    output: &'a Tensor,
    params: &RenderingParams,
) -> UpscaleResult<ArrayView3<'a, f32>> {
    let chw = chw_view(output).map_err(|e| UpscaleError::InferenceFailed(e.to_string()))?;
    let (channels, h, w) = chw.dim();
    let full = params.tile_size * params.scale;
    let filter = params.filter_size;
    let offset = params.offset;

    match (channels, h, w) {
        (3, h, w) if h == filter && w == filter => Ok(chw),
        (3, h, w) if h == full && w == full => {
            Ok(chw.slice_move(s![.., offset..full - offset, offset..full - offset]))
        }
        _ => Err(UpscaleError::InferenceFailed(format!(
            "model output shape {:?} matches neither 3x{full}x{full} nor 3x{filter}x{filter}",
            output.shape()
        ))),
    }
}

/// Upscales a `(1, 3, H, W)` tensor and returns the `(3, H * scale, W * scale)` result.
pub fn upscale_tensor(
    input: &Tensor,
    params: &RenderingParams,
    session: &mut dyn TileInference,
    observer: &mut dyn UpscaleObserver,
) -> UpscaleResult<Tensor> {
    let pad = params.pad;
    let padded = reflection_pad(input, pad.left, pad.right, pad.top, pad.bottom)?;
    let expected = [1, 3, params.input_h, params.input_w];
    if padded.shape() != expected.as_slice() {
        return Err(UpscaleError::InvalidTensor(format!(
            "padded input {:?} does not match tiling grid {expected:?}",
            padded.shape()
        )));
    }

    let filter = BlendFilter::new(params.scale, params.offset, params.tile_size)?;
    let mut accumulator = SeamBlendingAccumulator::new(params, filter)?;

    let total = params.total_tiles();
    let step = params.input_tile_step;
    let started = Instant::now();
    let mut current = 0;

    for tile_row in 0..params.h_blocks {
        for tile_col in 0..params.w_blocks {
            if observer.is_cancelled() {
                debug!(completed = current, total, "Upscale cancelled");
                return Err(UpscaleError::Cancelled);
            }

            let tile = crop(
                &padded,
                tile_col * step,
                tile_row * step,
                params.tile_size,
                params.tile_size,
            )?;

            let tile_started = Instant::now();
            let output = session
                .run(&tile)
                .map_err(|e| UpscaleError::inference(&e))?;
            let trimmed = trimmed_tile_view(&output, params)?;
            accumulator.update(trimmed, tile_row, tile_col)?;

            current += 1;
            debug!(
                tile_row,
                tile_col,
                current,
                total,
                elapsed_ms = tile_started.elapsed().as_secs_f64() * 1000.0,
                "Tile blended"
            );
            observer.on_progress(UpscaleProgress::new(current, total));
        }
    }

    let origin = params.output_crop_origin();
    let canvas = accumulator.into_result().into_dyn();
    let result = crop(&canvas, origin, origin, params.y_w, params.y_h)?;

    info!(
        tiles = total,
        output_w = params.y_w,
        output_h = params.y_h,
        backend = %session.backend(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Upscale finished"
    );

    Ok(result)
}

/// Full raster-to-raster upscale: guards, tiling, blending, reconstruction.
pub fn upscale_raster(
    image: &RasterImage,
    config: &UpscaleConfig,
    limits: &GuardLimits,
    session: &mut dyn TileInference,
    observer: &mut dyn UpscaleObserver,
) -> UpscaleResult<RasterImage> {
    check_image_dimensions(image.width(), image.height(), limits)?;
    let params = calc_rendering_params(image.width(), image.height(), config, limits)?;
    debug!(
        width = image.width(),
        height = image.height(),
        h_blocks = params.h_blocks,
        w_blocks = params.w_blocks,
        scale = params.scale,
        "Starting tiled upscale"
    );

    let input = to_tensor(image);
    let output = upscale_tensor(&input, &params, session, observer)?;
    to_raster(&output, params.y_w, params.y_h)
}
