//! Planar float tensors and the spatial operations the tiler needs.
//!
//! Tensors are `(C, H, W)` or `(1, C, H, W)`; every operation here returns
//! a freshly owned buffer and never aliases its source.

use ndarray::{Array3, ArrayD, ArrayView3, Ix3, IxDyn, Slice};

use crate::error::{UpscaleError, UpscaleResult};

pub type Tensor = ArrayD<f32>;

/// Returns `(height_axis, width_axis)` for a 3D or 4D tensor.
fn spatial_axes(tensor: &Tensor, op: &str) -> UpscaleResult<(usize, usize)> {
    match tensor.ndim() {
        3 | 4 => Ok((tensor.ndim() - 2, tensor.ndim() - 1)),
        n => Err(UpscaleError::InvalidTensor(format!(
            "{op}: expected a 3D or 4D tensor, got {n}D {:?}",
            tensor.shape()
        ))),
    }
}

/// Copies the `w x h` region whose top-left corner is `(x, y)`.
pub fn crop(tensor: &Tensor, x: usize, y: usize, w: usize, h: usize) -> UpscaleResult<Tensor> {
    let (h_axis, w_axis) = spatial_axes(tensor, "crop")?;
    let src_h = tensor.shape()[h_axis];
    let src_w = tensor.shape()[w_axis];

    let fits = x.checked_add(w).is_some_and(|end| end <= src_w)
        && y.checked_add(h).is_some_and(|end| end <= src_h);
    if !fits {
        return Err(UpscaleError::OutOfBounds(format!(
            "crop {w}x{h} at ({x}, {y}) exceeds source {src_w}x{src_h}"
        )));
    }

    let view = tensor.slice_each_axis(|desc| {
        let index = desc.axis.index();
        if index == h_axis {
            Slice::from(y..y + h)
        } else if index == w_axis {
            Slice::from(x..x + w)
        } else {
            Slice::from(..)
        }
    });
    Ok(view.to_owned())
}

/// Mirror index for destination `dst` on an axis of `size` elements padded by `before`.
///
/// The edge pixel is repeated (`..., 1, 0 | 0, 1, ...`), and indices that still
/// fall outside after one reflection are clamped.
pub fn reflect_index(dst: usize, before: usize, size: usize) -> usize {
    let n = size as i64;
    let mut s = dst as i64 - before as i64;
    if s < 0 {
        s = -s - 1;
    }
    if s >= n {
        s = 2 * n - s - 1;
    }
    s.clamp(0, n - 1) as usize
}

/// Mirror-pads the two spatial axes of a 3D or 4D tensor.
pub fn reflection_pad(
    tensor: &Tensor,
    left: usize,
    right: usize,
    top: usize,
    bottom: usize,
) -> UpscaleResult<Tensor> {
    let (h_axis, w_axis) = spatial_axes(tensor, "reflection_pad")?;
    let shape = tensor.shape().to_vec();
    let (src_h, src_w) = (shape[h_axis], shape[w_axis]);

    if src_h == 0 || src_w == 0 {
        return Err(UpscaleError::InvalidTensor(format!(
            "reflection_pad: cannot pad an empty tensor {shape:?}"
        )));
    }

    let out_h = src_h + top + bottom;
    let out_w = src_w + left + right;
    let rows: Vec<usize> = (0..out_h).map(|d| reflect_index(d, top, src_h)).collect();
    let cols: Vec<usize> = (0..out_w).map(|d| reflect_index(d, left, src_w)).collect();

    let lead: usize = shape[..h_axis].iter().product();
    let standard = tensor.as_standard_layout();
    let src = standard.view().into_shape_with_order((lead, src_h, src_w))?;

    let padded = Array3::from_shape_fn((lead, out_h, out_w), |(c, i, j)| {
        src[[c, rows[i], cols[j]]]
    });

    let mut out_shape = shape;
    out_shape[h_axis] = out_h;
    out_shape[w_axis] = out_w;
    Ok(padded.into_shape_with_order(IxDyn(&out_shape))?)
}

/// Views a `(C, H, W)` or `(1, C, H, W)` tensor as `(C, H, W)`.
pub fn chw_view(tensor: &Tensor) -> UpscaleResult<ArrayView3<'_, f32>> {
    match tensor.shape() {
        [_, _, _] => Ok(tensor.view().into_dimensionality::<Ix3>()?),
        [1, _, _, _] => Ok(tensor
            .view()
            .index_axis_move(ndarray::Axis(0), 0)
            .into_dimensionality::<Ix3>()?),
        other => Err(UpscaleError::InvalidTensor(format!(
            "expected (C, H, W) or (1, C, H, W), got {other:?}"
        ))),
    }
}
