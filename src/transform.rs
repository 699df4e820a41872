//! Synthetic scale/rotation copies of one image for the transform group.

use image::buffer::ConvertBuffer;
use image::{Rgb, Rgb32FImage, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use itertools::iproduct;
use ndarray::{Array2, Array3, Array4, ArrayView2, Axis};
use nshare::IntoNdarray3;

use crate::config::GiftConfig;
use crate::error::{ensure_dim, GiftError, Result};
use crate::group::TransformGroup;

/// Produces the `sn*rn` image/keypoint variants consumed by
/// [`ExtractorWrapper`](crate::extractor::ExtractorWrapper).
pub trait TransformGenerator {
    type Transformed;

    /// `points`: `[n, 2]` pixel coordinates in `image`.
    fn transform(&self, image: &RgbImage, points: &ArrayView2<f32>) -> Result<Self::Transformed>;

    /// `sn*rn` images `[1, 3, h, w]` and keypoints `[1, n, 2]`, scale-major.
    fn postprocess(
        &self,
        transformed: Self::Transformed,
    ) -> Result<(Vec<Array4<f32>>, Vec<Array3<f32>>)>;
}

/// Row-major 3x3 homogeneous matrix.
type Matrix = [f32; 9];

fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut out = [0.; 9];
    for (row, col) in iproduct!(0..3, 0..3) {
        out[row * 3 + col] = (0..3).map(|k| a[row * 3 + k] * b[k * 3 + col]).sum();
    }
    out
}

fn translation(tx: f32, ty: f32) -> Matrix {
    [1., 0., tx, 0., 1., ty, 0., 0., 1.]
}

/// Scales by `scale` and rotates by `degrees` about `(cx, cy)`.
fn scale_rotate_about(cx: f32, cy: f32, scale: f32, degrees: f32) -> Matrix {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let linear = [scale * cos, -scale * sin, 0., scale * sin, scale * cos, 0., 0., 0., 1.];
    matmul(&translation(cx, cy), &matmul(&linear, &translation(-cx, -cy)))
}

fn apply(matrix: &Matrix, x: f32, y: f32) -> (f32, f32) {
    let w = matrix[6] * x + matrix[7] * y + matrix[8];
    (
        (matrix[0] * x + matrix[1] * y + matrix[2]) / w,
        (matrix[3] * x + matrix[4] * y + matrix[5]) / w,
    )
}

/// Maps 8-bit RGB pixels to `(v - 127) / 128` in a `[1, 3, h, w]` array.
pub fn normalize_image(image: &RgbImage) -> Array4<f32> {
    let float: Rgb32FImage = image.convert();
    let mut array = float.into_ndarray3();
    array.mapv_inplace(|v| (v * 255. - 127.) / 128.);
    array.insert_axis(Axis(0))
}

/// Warped copies of one image, scale-major.
#[derive(Debug, Clone)]
pub struct TransformedSet {
    pub images: Vec<RgbImage>,
    /// `[n, 2]` keypoints per image.
    pub points: Vec<Array2<f32>>,
}

/// Warps about the image centre, member `(i, j)` scaled by `2^(scale_begin + i*scale_inter)`
/// and rotated by `rotate_begin + j*rotate_inter` degrees. Output images keep the input size;
/// uncovered pixels are black.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScaleRotateTransformer {
    pub group: TransformGroup,
    pub scale_begin: f32,
    pub scale_inter: f32,
    pub rotate_begin: f32,
    pub rotate_inter: f32,
}

impl ScaleRotateTransformer {
    pub fn from_config(config: &GiftConfig) -> Result<Self> {
        Ok(Self {
            group: config.group()?,
            scale_begin: config.sample_scale_begin,
            scale_inter: config.sample_scale_inter,
            rotate_begin: config.sample_rotate_begin,
            rotate_inter: config.sample_rotate_inter,
        })
    }

    pub fn scale(&self, index: usize) -> f32 {
        (self.scale_begin + index as f32 * self.scale_inter).exp2()
    }

    /// Degrees.
    pub fn rotation(&self, index: usize) -> f32 {
        self.rotate_begin + index as f32 * self.rotate_inter
    }
}

impl TransformGenerator for ScaleRotateTransformer {
    type Transformed = TransformedSet;

    fn transform(&self, image: &RgbImage, points: &ArrayView2<f32>) -> Result<TransformedSet> {
        ensure_dim("keypoint coordinates", 2, points.ncols())?;
        let (w, h) = image.dimensions();
        let (cx, cy) = ((w as f32 - 1.) / 2., (h as f32 - 1.) / 2.);

        let mut images = Vec::with_capacity(self.group.len());
        let mut warped_points = Vec::with_capacity(self.group.len());
        for (s, r) in self.group.members() {
            let matrix = scale_rotate_about(cx, cy, self.scale(s), self.rotation(r));
            let projection = Projection::from_matrix(matrix).ok_or_else(|| {
                GiftError::invalid_config(format!(
                    "degenerate transform for scale {} and rotation {}",
                    self.scale(s),
                    self.rotation(r)
                ))
            })?;
            images.push(warp(image, &projection, Interpolation::Bilinear, Rgb([0, 0, 0])));

            let mut mapped = Array2::zeros(points.raw_dim());
            for (src, mut dst) in points.outer_iter().zip(mapped.outer_iter_mut()) {
                let (x, y) = apply(&matrix, src[0], src[1]);
                dst[0] = x;
                dst[1] = y;
            }
            warped_points.push(mapped);
        }
        Ok(TransformedSet {
            images,
            points: warped_points,
        })
    }

    fn postprocess(
        &self,
        transformed: TransformedSet,
    ) -> Result<(Vec<Array4<f32>>, Vec<Array3<f32>>)> {
        self.group.check_len("transformed images", transformed.images.len())?;
        self.group.check_len("transformed keypoints", transformed.points.len())?;
        let images = transformed.images.iter().map(normalize_image).collect();
        let points = transformed
            .points
            .into_iter()
            .map(|pts| pts.insert_axis(Axis(0)))
            .collect();
        Ok((images, points))
    }
}
