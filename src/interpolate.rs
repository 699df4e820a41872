//! Bilinear sampling of dense feature maps at keypoint locations.
//!
//! Tap positions and weights depend only on the keypoints and are computed on the host; the
//! features are then gathered on the backend so gradients reach the feature maps.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use itertools::iproduct;
use ndarray::{Array3, ArrayView3, Axis};

use crate::error::{ensure_dim, GiftError, Result};
use crate::tensor::{to_int_tensor, to_tensor};

const TAPS: usize = 4;

/// Maps a pixel coordinate on an axis of length `dim` to the `[-1, 1]` convention where `-1` and
/// `1` are the centres of the first and last samples.
///
/// Computed in f64 so that integer coordinates survive the round trip through
/// [`unnormalize_coordinate`] exactly once cast back to f32.
pub fn normalize_coordinate(coord: f32, dim: usize) -> f64 {
    if dim <= 1 {
        return 0.;
    }
    2. * f64::from(coord) / (dim - 1) as f64 - 1.
}

/// Inverse of [`normalize_coordinate`].
fn unnormalize_coordinate(norm: f64, dim: usize) -> f32 {
    if dim <= 1 {
        return 0.;
    }
    ((norm + 1.) * 0.5 * (dim - 1) as f64) as f32
}

/// Integer downsampling factor between an image of width `image_width` and its feature map.
pub fn pooling_factor(image_width: usize, feature_width: usize) -> Result<usize> {
    if feature_width == 0 || image_width < feature_width {
        return Err(GiftError::shape_mismatch(
            "feature map width",
            &[image_width],
            &[feature_width],
        ));
    }
    Ok(image_width / feature_width)
}

/// Flat `y * w + x` indices and weights of the four bilinear taps of every keypoint,
/// `[b, n, 4]` each, ordered top-left, top-right, bottom-left, bottom-right.
#[derive(Debug, Clone, PartialEq)]
pub struct BilinearTaps {
    pub index: Array3<i64>,
    pub weight: Array3<f32>,
}

/// Bilinear taps of `[b, n, 2]` pixel keypoints of an image of width `image_width` on an
/// `height` x `width` feature map. Points outside the map clamp to its edge.
pub fn bilinear_taps(
    image_width: usize,
    points: &ArrayView3<f32>,
    height: usize,
    width: usize,
) -> Result<BilinearTaps> {
    ensure_dim("keypoint coordinates", 2, points.shape()[2])?;
    if height == 0 {
        return Err(GiftError::shape_mismatch("feature map height", &[1], &[0]));
    }
    let pool = pooling_factor(image_width, width)? as f32;
    let (batch, n) = (points.shape()[0], points.shape()[1]);

    let mut index = Array3::zeros((batch, n, TAPS));
    let mut weight = Array3::zeros((batch, n, TAPS));
    for (b, i) in iproduct!(0..batch, 0..n) {
        // Shift to pixel centres before dividing so the sample lands on the pooled cell centre.
        let x = (points[(b, i, 0)] + 0.5) / pool - 0.5;
        let y = (points[(b, i, 1)] + 0.5) / pool - 0.5;
        let x = unnormalize_coordinate(normalize_coordinate(x, width), width)
            .clamp(0., (width - 1) as f32);
        let y = unnormalize_coordinate(normalize_coordinate(y, height), height)
            .clamp(0., (height - 1) as f32);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(width - 1);
        let y1 = (y0 + 1).min(height - 1);
        let wx = x - x0 as f32;
        let wy = y - y0 as f32;

        let taps = [
            (y0, x0, (1. - wx) * (1. - wy)),
            (y0, x1, wx * (1. - wy)),
            (y1, x0, (1. - wx) * wy),
            (y1, x1, wx * wy),
        ];
        for (t, (ty, tx, w)) in taps.into_iter().enumerate() {
            index[(b, i, t)] = (ty * width + tx) as i64;
            weight[(b, i, t)] = w;
        }
    }
    Ok(BilinearTaps { index, weight })
}

/// Samples `[b, f, h', w']` feature maps at `[b, n, 2]` keypoints given in pixel coordinates of
/// the image of width `image_width` the maps were computed from. Returns `[b, n, f]`.
///
/// Dense grids are sampled by flattening them to `[b, gh*gw, 2]` first.
pub fn interpolate_feats<B: Backend>(
    image_width: usize,
    points: &ArrayView3<f32>,
    feats: Tensor<B, 4>,
) -> Result<Tensor<B, 3>> {
    let [batch, channels, height, width] = feats.dims();
    ensure_dim("keypoint batch", batch, points.shape()[0])?;
    let n = points.shape()[1];
    let taps = bilinear_taps(image_width, points, height, width)?;
    let device = feats.device();

    // Tap-major along the last axis: entry `t * n + i` is tap `t` of keypoint `i`.
    let mut index = Vec::with_capacity(batch * TAPS * n);
    let mut weight = Vec::with_capacity(batch * TAPS * n);
    for (b, t, i) in iproduct!(0..batch, 0..TAPS, 0..n) {
        index.push(taps.index[(b, i, t)]);
        weight.push(taps.weight[(b, i, t)]);
    }
    let index = to_int_tensor::<B, 3>(index, [batch, 1, TAPS * n], &device)
        .repeat_dim(1, channels);
    let weight = to_tensor::<B, 4, _, _>(
        &Array3::from_shape_vec((batch, TAPS, n), weight)?.insert_axis(Axis(1)),
        &device,
    )?;

    let sampled = feats
        .reshape([batch, channels, height * width])
        .gather(2, index)
        .reshape([batch, channels, TAPS, n]);
    Ok((sampled * weight)
        .sum_dim(2)
        .reshape([batch, channels, n])
        .swap_dims(1, 2))
}
