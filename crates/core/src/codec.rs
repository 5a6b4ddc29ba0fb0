//! Conversion between 8-bit RGBA rasters and planar `[0, 1]` float tensors.

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayView3};

use crate::error::{UpscaleError, UpscaleResult};
use crate::tensor::{chw_view, Tensor};

/// Decoded 8-bit interleaved RGBA image.
///
/// Fields are private so `data.len() == width * height * 4` always holds.
#[derive(Clone, PartialEq, Eq)]
pub struct RasterImage {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl RasterImage {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width * height * 4;
        if data.len() != expected {
            bail!(
                "RGBA data length mismatch: expected {} ({}x{}x4), got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Expands tightly packed RGB bytes to RGBA with an opaque alpha channel.
    pub fn from_rgb(width: usize, height: usize, rgb: &[u8]) -> Result<Self> {
        if rgb.len() != width * height * 3 {
            bail!(
                "RGB data length mismatch: expected {}, got {}",
                width * height * 3,
                rgb.len()
            );
        }
        let mut data = Vec::with_capacity(width * height * 4);
        for px in rgb.chunks_exact(3) {
            data.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Interleaved RGBA bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let i = (y * self.width + x) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }
}

impl std::fmt::Debug for RasterImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// RGBA8 → `(1, 3, H, W)` in `[0, 1]`. Alpha is dropped.
pub fn to_tensor(image: &RasterImage) -> Tensor {
    let (h, w) = (image.height, image.width);
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for (i, px) in image.data.chunks_exact(4).enumerate() {
        let (y, x) = (i / w, i % w);
        nchw[[0, 0, y, x]] = px[0] as f32 / 255.0;
        nchw[[0, 1, y, x]] = px[1] as f32 / 255.0;
        nchw[[0, 2, y, x]] = px[2] as f32 / 255.0;
    }
    nchw.into_dyn()
}

/// Rounds half up and clamps into `0..=255`; NaN maps to 0.
fn quantize(value: f32) -> u8 {
    let scaled = (value * 255.0 + 0.5).floor();
    if scaled.is_nan() {
        0
    } else {
        scaled.clamp(0.0, 255.0) as u8
    }
}

/// `(3, H, W)` view → RGBA8 with opaque alpha.
pub fn chw_to_raster(
    chw: ArrayView3<'_, f32>,
    width: usize,
    height: usize,
) -> UpscaleResult<RasterImage> {
    if chw.shape() != &[3, height, width] {
        return Err(UpscaleError::InvalidTensor(format!(
            "to_raster: tensor shape {:?} does not match 3x{height}x{width}",
            chw.shape()
        )));
    }

    let mut data = vec![255u8; width * height * 4];
    for y in 0..height {
        for x in 0..width {
            let dst = (y * width + x) * 4;
            data[dst] = quantize(chw[[0, y, x]]);
            data[dst + 1] = quantize(chw[[1, y, x]]);
            data[dst + 2] = quantize(chw[[2, y, x]]);
        }
    }

    Ok(RasterImage {
        width,
        height,
        data,
    })
}

/// `(3, H, W)` or `(1, 3, H, W)` → RGBA8 with opaque alpha.
pub fn to_raster(tensor: &Tensor, width: usize, height: usize) -> UpscaleResult<RasterImage> {
    chw_to_raster(chw_view(tensor)?, width, height)
}
