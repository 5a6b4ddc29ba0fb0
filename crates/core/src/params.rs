//! Tiling geometry for one upscale operation.
//!
//! [`calc_rendering_params`] is pure: it turns an image size and an
//! [`UpscaleConfig`] into the tile grid, padding, and output canvas sizes,
//! and rejects configurations that would tile forever or allocate more than
//! the [`GuardLimits`] allow. Nothing is allocated before every check passes.

use serde::{Deserialize, Serialize};

use crate::error::{Axis, UpscaleError, UpscaleResult};

/// Width of the cross-fade band between neighbouring tiles, in output pixels.
pub const BLEND_SIZE: usize = 16;

pub const DEFAULT_SCALE: usize = 2;
pub const DEFAULT_OFFSET: usize = 16;
pub const DEFAULT_TILE_SIZE: usize = 256;

pub const DEFAULT_MAX_DIMENSION: usize = 4096;
pub const DEFAULT_MAX_BLOCKS: usize = 1000;
/// Largest float buffer a single operation may hold, in elements.
pub const DEFAULT_MAX_OUTPUT_ELEMENTS: usize = (1 << 30) / 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleConfig {
    /// Integer magnification the model applies.
    pub scale: usize,
    /// Output pixels trimmed from each side of a tile's result.
    pub offset: usize,
    /// Input tile edge length fed to the model.
    pub tile_size: usize,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            offset: DEFAULT_OFFSET,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLimits {
    pub max_dimension: usize,
    pub max_blocks: usize,
    pub max_output_elements: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            max_blocks: DEFAULT_MAX_BLOCKS,
            max_output_elements: DEFAULT_MAX_OUTPUT_ELEMENTS,
        }
    }
}

/// Padding amounts applied to the input before tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Padding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderingParams {
    pub scale: usize,
    pub offset: usize,
    pub tile_size: usize,
    /// Final output height (`image_height * scale`).
    pub y_h: usize,
    /// Final output width (`image_width * scale`).
    pub y_w: usize,
    pub input_offset: usize,
    pub input_blend_size: usize,
    pub input_tile_step: usize,
    pub output_tile_step: usize,
    pub h_blocks: usize,
    pub w_blocks: usize,
    /// Padded input height covered by the tile grid.
    pub input_h: usize,
    pub input_w: usize,
    pub y_buffer_h: usize,
    pub y_buffer_w: usize,
    /// Edge length of the usable (trimmed) region of one tile's output.
    pub filter_size: usize,
    pub pad: Padding,
}

impl RenderingParams {
    pub fn total_tiles(&self) -> usize {
        self.h_blocks * self.w_blocks
    }

    /// Top-left corner of the final image inside the accumulation canvas.
    pub fn output_crop_origin(&self) -> usize {
        self.input_offset * self.scale
    }
}

/// Rejects images larger than `limits.max_dimension` on either side.
pub fn check_image_dimensions(
    width: usize,
    height: usize,
    limits: &GuardLimits,
) -> UpscaleResult<()> {
    if width > limits.max_dimension || height > limits.max_dimension {
        return Err(UpscaleError::ImageTooLarge {
            width,
            height,
            max: limits.max_dimension,
        });
    }
    Ok(())
}

/// Input-side step between tile origins, after validating `config`.
///
/// Fails with [`UpscaleError::InvalidConfig`] when the step is not positive.
pub fn input_tile_step(config: &UpscaleConfig) -> UpscaleResult<usize> {
    if config.scale == 0 {
        return Err(UpscaleError::InvalidConfig("scale must be at least 1".into()));
    }
    if config.tile_size == 0 {
        return Err(UpscaleError::InvalidConfig(
            "tile_size must be positive".into(),
        ));
    }

    let input_offset = config.offset.div_ceil(config.scale);
    let input_blend = BLEND_SIZE.div_ceil(config.scale);
    let overhead = input_offset
        .checked_mul(2)
        .and_then(|v| v.checked_add(input_blend))
        .ok_or_else(|| UpscaleError::InvalidConfig("offset is too large".into()))?;

    if config.tile_size <= overhead {
        return Err(UpscaleError::InvalidConfig(format!(
            "tile_size {} leaves no room for a tile step (needs more than {overhead} for offset {} at scale {})",
            config.tile_size, config.offset, config.scale
        )));
    }

    Ok(config.tile_size - overhead)
}

/// Returns `(blocks, covered_len)`: the tile count along one axis and the
/// padded length the grid spans.
fn blocks_for_axis(
    axis: Axis,
    dimension: usize,
    input_offset: usize,
    step: usize,
    tile_size: usize,
    max_blocks: usize,
) -> UpscaleResult<(usize, usize)> {
    let target = dimension as u128 + 2 * input_offset as u128;
    let tile = tile_size as u128;
    let step = step as u128;

    // Smallest k with k * step + tile >= target; the grid holds k + 1 tiles.
    let k = if tile >= target {
        0
    } else {
        (target - tile).div_ceil(step)
    };
    let blocks = k + 1;

    if blocks > max_blocks as u128 {
        return Err(UpscaleError::TooManyTiles {
            axis,
            blocks: usize::try_from(blocks).unwrap_or(usize::MAX),
            max: max_blocks,
        });
    }

    Ok((blocks as usize, (k * step + tile) as usize))
}

pub fn calc_rendering_params(
    image_width: usize,
    image_height: usize,
    config: &UpscaleConfig,
    limits: &GuardLimits,
) -> UpscaleResult<RenderingParams> {
    if image_width == 0 || image_height == 0 {
        return Err(UpscaleError::InvalidConfig(format!(
            "image dimensions must be positive, got {image_width}x{image_height}"
        )));
    }

    let step = input_tile_step(config)?;
    let scale = config.scale;
    let input_offset = config.offset.div_ceil(scale);
    let input_blend_size = BLEND_SIZE.div_ceil(scale);

    let (h_blocks, input_h) = blocks_for_axis(
        Axis::Height,
        image_height,
        input_offset,
        step,
        config.tile_size,
        limits.max_blocks,
    )?;
    let (w_blocks, input_w) = blocks_for_axis(
        Axis::Width,
        image_width,
        input_offset,
        step,
        config.tile_size,
        limits.max_blocks,
    )?;

    let buffer_elements =
        3u128 * (input_h as u128 * scale as u128) * (input_w as u128 * scale as u128);
    if buffer_elements > limits.max_output_elements as u128 {
        return Err(UpscaleError::OutputTooLarge {
            elements: buffer_elements,
            max: limits.max_output_elements,
        });
    }

    Ok(RenderingParams {
        scale,
        offset: config.offset,
        tile_size: config.tile_size,
        y_h: image_height * scale,
        y_w: image_width * scale,
        input_offset,
        input_blend_size,
        input_tile_step: step,
        output_tile_step: step * scale,
        h_blocks,
        w_blocks,
        input_h,
        input_w,
        y_buffer_h: input_h * scale,
        y_buffer_w: input_w * scale,
        filter_size: config.tile_size * scale - 2 * config.offset,
        pad: Padding {
            left: input_offset,
            right: input_w - (image_width + input_offset),
            top: input_offset,
            bottom: input_h - (image_height + input_offset),
        },
    })
}
