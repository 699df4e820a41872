//! Triplet margin objective and cross-observation positive distances.

use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array2, ArrayView2};

use crate::config::OffsetReduction;
use crate::error::{ensure_shape, Result};
use crate::group::GroupFeatures;
use crate::tensor::{safe_sqrt, to_int_tensor, to_tensor, to_vec};

/// Row-wise Euclidean distance between `[B, n, f]` descriptor sets, `[B, n]`.
pub fn descriptor_distance<B: Backend>(
    a: Tensor<B, 3>,
    b: Tensor<B, 3>,
    squared: bool,
) -> Result<Tensor<B, 2>> {
    let [batch, n, _] = a.dims();
    ensure_shape("descriptor distance operands", &a.dims(), &b.dims())?;
    let sq = (a - b).powf_scalar(2.).sum_dim(2).reshape([batch, n]);
    Ok(if squared { sq } else { safe_sqrt(sq) })
}

#[derive(Debug, Clone)]
pub struct TripletLoss<B: Backend> {
    /// Mean of `max(d_pos - d_neg + margin, 0)`, shape `[1]`.
    pub loss: Tensor<B, 1>,
    /// Fraction of anchors that violate the margin.
    pub active_rate: f32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TripletObjective {
    pub margin: f32,
}

impl TripletObjective {
    pub fn new(margin: f32) -> Self {
        Self { margin }
    }

    /// Per-anchor hinge values, `[B, n]`.
    pub fn hinge<B: Backend>(&self, dis_pos: Tensor<B, 2>, dis_neg: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        ensure_shape("negative distances", &dis_pos.dims(), &dis_neg.dims())?;
        Ok(relu(dis_pos - dis_neg + self.margin))
    }

    pub fn evaluate<B: Backend>(
        &self,
        dis_pos: Tensor<B, 2>,
        dis_neg: Tensor<B, 2>,
    ) -> Result<TripletLoss<B>> {
        let hinge = self.hinge(dis_pos, dis_neg)?;
        let count = hinge.dims().iter().product::<usize>();
        if count == 0 {
            return Ok(TripletLoss {
                loss: Tensor::zeros([1], &hinge.device()),
                active_rate: 0.,
            });
        }
        let active = to_vec(hinge.clone())?.iter().filter(|&&v| v > 0.).count();
        Ok(TripletLoss {
            loss: hinge.mean(),
            active_rate: active as f32 / count as f32,
        })
    }
}

/// Positive distance between two observations of the same keypoints given the known
/// transform-group offset between them.
pub trait PositiveDistance<B: Backend>: Send + Sync {
    /// `first`, `second`: `[b, n, f, sn, rn]`, offsets `[b, n]`. Returns `[b, n]`.
    fn distance(
        &self,
        first: &GroupFeatures<B>,
        second: &GroupFeatures<B>,
        scale_offset: &ArrayView2<i32>,
        rotate_offset: &ArrayView2<i32>,
    ) -> Result<Tensor<B, 2>>;
}

/// Distances of every first-observation member to its aligned partner, `[b, n, sn*rn]`, and
/// whether each pair exists.
struct AlignedPairs<B: Backend> {
    distance: Tensor<B, 3>,
    valid: Array2<Vec<bool>>,
}

/// Member `(s, r)` of the first observation pairs with `(s + ds, (r + dr) mod rn)` of the
/// second. Scale offsets are clamped to `±(sn - 1)` and pairs that leave the scale range are
/// invalid, so every keypoint keeps at least one pair.
fn aligned_pairs<B: Backend>(
    first: &GroupFeatures<B>,
    second: &GroupFeatures<B>,
    scale_offset: &ArrayView2<i32>,
    rotate_offset: &ArrayView2<i32>,
) -> Result<AlignedPairs<B>> {
    ensure_shape("second observation", &first.tensor().dims(), &second.tensor().dims())?;
    let (b, n, f) = first.dims();
    ensure_shape("scale offsets", &[b, n], scale_offset.shape())?;
    ensure_shape("rotation offsets", &[b, n], rotate_offset.shape())?;

    let group = first.group();
    let k = group.len();
    let (sn, rn) = (group.scales as i32, group.rotations as i32);
    let mut partners = Vec::with_capacity(b * n * k);
    let valid = Array2::from_shape_fn((b, n), |(bi, i)| {
        let ds = scale_offset[(bi, i)].clamp(-(sn - 1), sn - 1);
        let dr = rotate_offset[(bi, i)];
        group
            .members()
            .enumerate()
            .map(|(index, (s, r))| {
                let s2 = s as i32 + ds;
                let r2 = (r as i32 + dr).rem_euclid(rn);
                let paired = (0..sn).contains(&s2);
                // Unpaired members gather themselves and are masked out afterwards.
                let partner = if paired { group.index(s2 as usize, r2 as usize) } else { index };
                partners.push(partner as i64);
                paired
            })
            .collect()
    });

    let device = first.tensor().device();
    let index = to_int_tensor::<B, 4>(partners, [b, n, 1, k], &device).repeat_dim(2, f);
    let aligned = second.flat_members().gather(3, index);
    let sq = (first.flat_members() - aligned)
        .powf_scalar(2.)
        .sum_dim(2)
        .reshape([b, n, k]);
    Ok(AlignedPairs {
        distance: safe_sqrt(sq),
        valid,
    })
}

/// Average distance over aligned member pairs.
#[derive(Debug, Copy, Clone, Default)]
pub struct AlignedMean;

impl<B: Backend> PositiveDistance<B> for AlignedMean {
    fn distance(
        &self,
        first: &GroupFeatures<B>,
        second: &GroupFeatures<B>,
        scale_offset: &ArrayView2<i32>,
        rotate_offset: &ArrayView2<i32>,
    ) -> Result<Tensor<B, 2>> {
        let pairs = aligned_pairs(first, second, scale_offset, rotate_offset)?;
        let [b, n, k] = pairs.distance.dims();
        let device = pairs.distance.device();
        let weights = ndarray::Array3::from_shape_fn((b, n, k), |(bi, i, j)| {
            let valid = &pairs.valid[(bi, i)];
            if valid[j] {
                1. / valid.iter().filter(|v| **v).count() as f32
            } else {
                0.
            }
        });
        let weights = to_tensor::<B, 3, _, _>(&weights, &device)?;
        Ok((pairs.distance * weights).sum_dim(2).reshape([b, n]))
    }
}

/// Smallest distance over aligned member pairs.
#[derive(Debug, Copy, Clone, Default)]
pub struct AlignedNearest;

/// Added to unpaired members so they never win the minimum.
const UNPAIRED: f32 = 1e6;

impl<B: Backend> PositiveDistance<B> for AlignedNearest {
    fn distance(
        &self,
        first: &GroupFeatures<B>,
        second: &GroupFeatures<B>,
        scale_offset: &ArrayView2<i32>,
        rotate_offset: &ArrayView2<i32>,
    ) -> Result<Tensor<B, 2>> {
        let pairs = aligned_pairs(first, second, scale_offset, rotate_offset)?;
        let [b, n, k] = pairs.distance.dims();
        let device = pairs.distance.device();
        let penalty = ndarray::Array3::from_shape_fn((b, n, k), |(bi, i, j)| {
            if pairs.valid[(bi, i)][j] {
                0.
            } else {
                UNPAIRED
            }
        });
        let penalty = to_tensor::<B, 3, _, _>(&penalty, &device)?;
        Ok((pairs.distance + penalty).min_dim(2).reshape([b, n]))
    }
}

pub fn positive_distance<B: Backend>(reduction: OffsetReduction) -> Box<dyn PositiveDistance<B>> {
    match reduction {
        OffsetReduction::Mean => Box::new(AlignedMean),
        OffsetReduction::Nearest => Box::new(AlignedNearest),
    }
}
