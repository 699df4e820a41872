//! Named transform-group axes.
//!
//! Every per-image quantity produced by the extractor carries a trailing `(sn, rn)` pair. The
//! members of a group are always enumerated scale-major: rotation varies fastest, so member
//! `k` is `(k / rn, k % rn)`. The wrappers in this module check that invariant at every
//! boundary instead of trusting reshapes.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array, ArrayView, Axis, Dimension, Ix5, RemoveAxis};

use crate::error::{ensure_shape, GiftError, Result};
use crate::tensor::to_array;

/// Scale and rotation counts of the synthetic transform group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransformGroup {
    pub scales: usize,
    pub rotations: usize,
}

impl TransformGroup {
    pub fn new(scales: usize, rotations: usize) -> Result<Self> {
        if scales == 0 || rotations == 0 {
            return Err(GiftError::invalid_config(format!(
                "transform group must be non-empty, got {scales}x{rotations}"
            )));
        }
        Ok(Self { scales, rotations })
    }

    /// Number of members, `sn * rn`.
    pub fn len(&self) -> usize {
        self.scales * self.rotations
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of member `(scale, rotation)` in the scale-major member list.
    pub fn index(&self, scale: usize, rotation: usize) -> usize {
        debug_assert!(scale < self.scales && rotation < self.rotations);
        scale * self.rotations + rotation
    }

    /// Inverse of [`TransformGroup::index`].
    pub fn split(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.len());
        (index / self.rotations, index % self.rotations)
    }

    /// All `(scale, rotation)` pairs in scale-major order.
    pub fn members(&self) -> impl Iterator<Item = (usize, usize)> {
        let rotations = self.rotations;
        (0..self.scales).flat_map(move |s| (0..rotations).map(move |r| (s, r)))
    }

    /// Fails unless `count` matches the number of group members.
    pub fn check_len(&self, what: &'static str, count: usize) -> Result<()> {
        ensure_shape(what, &[self.len()], &[count])
    }
}

/// Stacks equally shaped `[b, m, f]` member tensors along a new trailing group axis,
/// `[b, m, f, sn*rn]`.
fn stack_members<B: Backend>(
    what: &'static str,
    members: Vec<Tensor<B, 3>>,
    group: TransformGroup,
) -> Result<Tensor<B, 4>> {
    group.check_len(what, members.len())?;
    let first = members[0].dims();
    for member in &members {
        ensure_shape(what, &first, &member.dims())?;
    }
    Ok(Tensor::stack(members, 3))
}

/// Group-indexed keypoint descriptors, `[b, n, f, sn, rn]`.
#[derive(Debug, Clone)]
pub struct GroupFeatures<B: Backend> {
    data: Tensor<B, 5>,
    group: TransformGroup,
}

impl<B: Backend> GroupFeatures<B> {
    pub fn new(data: Tensor<B, 5>, group: TransformGroup) -> Result<Self> {
        let [b, n, f, sn, rn] = data.dims();
        ensure_shape(
            "group features",
            &[b, n, f, group.scales, group.rotations],
            &[b, n, f, sn, rn],
        )?;
        Ok(Self { data, group })
    }

    /// Assembles `[b, n, f]` member slices given in scale-major order.
    pub fn from_members(members: Vec<Tensor<B, 3>>, group: TransformGroup) -> Result<Self> {
        let stacked = stack_members("group member", members, group)?;
        let [b, n, f, _] = stacked.dims();
        Ok(Self {
            data: stacked.reshape([b, n, f, group.scales, group.rotations]),
            group,
        })
    }

    pub fn group(&self) -> TransformGroup {
        self.group
    }

    /// `(b, n, f)`
    pub fn dims(&self) -> (usize, usize, usize) {
        let [b, n, f, _, _] = self.data.dims();
        (b, n, f)
    }

    pub fn batch(&self) -> usize {
        self.dims().0
    }

    pub fn keypoints(&self) -> usize {
        self.dims().1
    }

    pub fn channels(&self) -> usize {
        self.dims().2
    }

    /// `[b, n, f]` descriptors of one group member.
    pub fn member(&self, scale: usize, rotation: usize) -> Tensor<B, 3> {
        let (b, n, f) = self.dims();
        self.data
            .clone()
            .narrow(3, scale, 1)
            .narrow(4, rotation, 1)
            .reshape([b, n, f])
    }

    pub fn tensor(&self) -> &Tensor<B, 5> {
        &self.data
    }

    pub fn into_inner(self) -> Tensor<B, 5> {
        self.data
    }

    /// Members flattened scale-major onto one axis, `[b, n, f, sn*rn]`.
    pub fn flat_members(&self) -> Tensor<B, 4> {
        let (b, n, f) = self.dims();
        self.data.clone().reshape([b, n, f, self.group.len()])
    }

    /// Per-instance anchors `[b*sn*rn, n, f]`, rows ordered `(batch, scale, rotation)`.
    pub fn to_instances(&self) -> Tensor<B, 3> {
        let (b, n, f) = self.dims();
        self.data
            .clone()
            .permute([0, 3, 4, 1, 2])
            .reshape([b * self.group.len(), n, f])
    }

    /// Host copy, `[b, n, f, sn, rn]`.
    pub fn to_array(&self) -> Result<Array<f32, Ix5>> {
        to_array(self.data.clone())
    }
}

/// Group-indexed descriptors sampled on a dense grid, `[b, gh, gw, f, sn, rn]`.
#[derive(Debug, Clone)]
pub struct GroupGridFeatures<B: Backend> {
    data: Tensor<B, 6>,
    group: TransformGroup,
}

impl<B: Backend> GroupGridFeatures<B> {
    /// Folds flattened `[b, gh*gw, f]` member samples back onto the grid.
    pub fn from_members(
        members: Vec<Tensor<B, 3>>,
        grid_height: usize,
        grid_width: usize,
        group: TransformGroup,
    ) -> Result<Self> {
        let stacked = stack_members("grid member", members, group)?;
        let [b, cells, f, _] = stacked.dims();
        ensure_shape("grid member cells", &[grid_height * grid_width], &[cells])?;
        Ok(Self {
            data: stacked.reshape([b, grid_height, grid_width, f, group.scales, group.rotations]),
            group,
        })
    }

    pub fn group(&self) -> TransformGroup {
        self.group
    }

    /// `(b, gh, gw, f)`
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        let [b, gh, gw, f, _, _] = self.data.dims();
        (b, gh, gw, f)
    }

    /// `[b, gh, gw, f]` grid descriptors of one group member.
    pub fn member(&self, scale: usize, rotation: usize) -> Tensor<B, 4> {
        let (b, gh, gw, f) = self.dims();
        self.data
            .clone()
            .narrow(4, scale, 1)
            .narrow(5, rotation, 1)
            .reshape([b, gh, gw, f])
    }

    /// Candidate maps `[b*sn*rn, f, gh, gw]`, one per group instance, ordered like
    /// [`GroupFeatures::to_instances`].
    pub fn to_candidate_maps(&self) -> Tensor<B, 4> {
        let (b, gh, gw, f) = self.dims();
        self.data
            .clone()
            .permute([0, 4, 5, 3, 1, 2])
            .reshape([b * self.group.len(), f, gh, gw])
    }

    /// Treats every grid cell as a keypoint: `[b, gh*gw, f, sn, rn]`.
    pub fn to_point_features(&self) -> GroupFeatures<B> {
        let (b, gh, gw, f) = self.dims();
        GroupFeatures {
            data: self
                .data
                .clone()
                .reshape([b, gh * gw, f, self.group.scales, self.group.rotations]),
            group: self.group,
        }
    }
}

/// Repeats a per-anchor `[b, n]` tensor for every group instance, producing `[b*sn*rn, n]`
/// rows ordered `(batch, scale, rotation)`.
pub fn repeat_over_group<B: Backend>(values: Tensor<B, 2>, group: TransformGroup) -> Tensor<B, 2> {
    let [b, n] = values.dims();
    values
        .unsqueeze_dim::<3>(1)
        .repeat_dim(1, group.len())
        .reshape([b * group.len(), n])
}

/// Host counterpart of [`repeat_over_group`] for any `[b, ..]` array.
pub fn repeat_array_over_group<D>(
    values: ArrayView<'_, f32, D>,
    group: TransformGroup,
) -> Array<f32, D>
where
    D: Dimension + RemoveAxis,
{
    let mut out_shape = values.raw_dim();
    out_shape[0] = values.len_of(Axis(0)) * group.len();
    let mut out = Array::zeros(out_shape);
    for (b, row) in values.outer_iter().enumerate() {
        for k in 0..group.len() {
            out.index_axis_mut(Axis(0), b * group.len() + k).assign(&row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{to_tensor, to_vec};
    use burn::backend::NdArray;
    use ndarray::{Array2, Array3};

    type TestBackend = NdArray;

    fn constant_members(group: TransformGroup, shape: (usize, usize, usize)) -> Vec<Tensor<TestBackend, 3>> {
        let device = Default::default();
        (0..group.len())
            .map(|k| to_tensor(&Array3::from_elem(shape, k as f32), &device).unwrap())
            .collect()
    }

    #[test]
    fn members_are_scale_major() {
        let group = TransformGroup::new(2, 3).unwrap();
        let members: Vec<_> = group.members().collect();
        assert_eq!(members, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        for (k, (s, r)) in members.into_iter().enumerate() {
            assert_eq!(group.index(s, r), k);
            assert_eq!(group.split(k), (s, r));
        }
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(TransformGroup::new(0, 4).is_err());
        assert!(TransformGroup::new(4, 0).is_err());
    }

    #[test]
    fn trailing_axes_are_checked() {
        let group = TransformGroup::new(2, 2).unwrap();
        let wrong = Tensor::<TestBackend, 5>::zeros([1, 3, 8, 2, 3], &Default::default());
        assert!(matches!(
            GroupFeatures::new(wrong, group),
            Err(GiftError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn members_round_trip_through_assembly() {
        let group = TransformGroup::new(2, 2).unwrap();
        let feats = GroupFeatures::from_members(constant_members(group, (1, 3, 2)), group).unwrap();
        for (k, (s, r)) in group.members().enumerate() {
            assert!(to_vec(feats.member(s, r)).unwrap().iter().all(|v| *v == k as f32));
        }
        let instances = feats.to_instances();
        assert_eq!(instances.dims(), [4, 3, 2]);
        let instances: Array3<f32> = to_array(instances).unwrap();
        for k in 0..4 {
            assert!(instances.index_axis(Axis(0), k).iter().all(|v| *v == k as f32));
        }
    }

    #[test]
    fn unequal_members_are_rejected() {
        let group = TransformGroup::new(1, 2).unwrap();
        let mut members = constant_members(group, (1, 3, 2));
        members[1] = Tensor::zeros([1, 3, 4], &Default::default());
        assert!(matches!(
            GroupFeatures::from_members(members, group),
            Err(GiftError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn grid_members_fold_row_major() {
        let device = Default::default();
        let group = TransformGroup::new(1, 2).unwrap();
        let members = (0..2)
            .map(|k| {
                let member = Array::from_shape_fn((1, 6, 1), |(_, p, _)| (k * 100 + p) as f32);
                to_tensor(&member, &device).unwrap()
            })
            .collect();
        let grid = GroupGridFeatures::<TestBackend>::from_members(members, 2, 3, group).unwrap();
        assert_eq!(grid.dims(), (1, 2, 3, 1));
        let member: ndarray::Array4<f32> = to_array(grid.member(0, 1)).unwrap();
        assert_eq!(member[(0, 1, 2, 0)], 105.);
        let maps = grid.to_candidate_maps();
        assert_eq!(maps.dims(), [2, 1, 2, 3]);
        let maps: ndarray::Array4<f32> = to_array(maps).unwrap();
        assert_eq!(maps[(1, 0, 1, 0)], 103.);
        let points = grid.to_point_features();
        assert_eq!(points.keypoints(), 6);
        let first: Array3<f32> = to_array(points.member(0, 0)).unwrap();
        assert_eq!(first[(0, 4, 0)], 4.);
    }

    #[test]
    fn repeat_keeps_batch_blocks() {
        let group = TransformGroup::new(2, 1).unwrap();
        let values = Array2::from_shape_vec((2, 2), vec![1., 2., 3., 4.]).unwrap();
        let expected = vec![1., 2., 1., 2., 3., 4., 3., 4.];

        let repeated = repeat_array_over_group(values.view(), group);
        assert_eq!(repeated.shape(), &[4, 2]);
        assert_eq!(repeated.iter().copied().collect::<Vec<_>>(), expected);

        let tensor = to_tensor::<TestBackend, 2, _, _>(&values, &Default::default()).unwrap();
        let repeated = repeat_over_group(tensor, group);
        assert_eq!(repeated.dims(), [4, 2]);
        assert_eq!(to_vec(repeated).unwrap(), expected);
    }
}
