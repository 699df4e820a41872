//! Aggregation of group-indexed descriptors into one descriptor per keypoint.

use burn::module::{Ignored, Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::IxDyn;

use crate::config::GiftConfig;
use crate::error::{ensure_shape, GiftError, Result};
use crate::group::{GroupFeatures, TransformGroup};
use crate::params::{kaiming_uniform, seeded_rng, take_param, ParamMap};
use crate::registry::build_embedder;
use crate::tensor::{l2_normalize, to_array};

/// Group-indexed descriptors `[b, n, fg, sn, rn]` to aggregated descriptors `[b, n, fe]`.
pub trait Embedder<B: Backend>: Module<B> {
    fn forward(&self, gfeats: &GroupFeatures<B>) -> Result<Tensor<B, 3>>;

    /// `fe` for inputs with `channels` feature channels.
    fn output_dim(&self, channels: usize, group: TransformGroup) -> usize;

    fn state_dict(&self) -> Result<ParamMap> {
        Ok(ParamMap::new())
    }

    fn load_state_dict(&mut self, _params: &ParamMap) -> Result<()> {
        Ok(())
    }
}

/// How the members of a group are combined.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupPooling {
    /// Scale-major concatenation, `fe = f * sn * rn`.
    Flatten,
    /// Average over the group, `fe = f`.
    Mean,
}

/// Pools the transform group and L2-normalizes the result.
///
/// With a projection every member is first mapped linearly from `fg` to `fe` channels, so the
/// pooled descriptor has `fe` channels regardless of the extractor.
#[derive(Module, Debug)]
pub struct GroupEmbedder<B: Backend> {
    pooling: Ignored<GroupPooling>,
    /// `[fg, fe]`
    projection: Option<Param<Tensor<B, 2>>>,
}

impl<B: Backend> GroupEmbedder<B> {
    pub const PROJECTION: &'static str = "projection.weight";

    pub fn flatten() -> Self {
        Self {
            pooling: Ignored(GroupPooling::Flatten),
            projection: None,
        }
    }

    pub fn mean() -> Self {
        Self {
            pooling: Ignored(GroupPooling::Mean),
            projection: None,
        }
    }

    /// Shared `channels -> embed_dim` projection followed by a group average.
    pub fn projection(channels: usize, embed_dim: usize, seed: u64, device: &B::Device) -> Self {
        let mut rng = seeded_rng(seed);
        // Stored input-major, so the fan-in is the leading axis here.
        let weight = kaiming_uniform([channels, embed_dim], channels, &mut rng, device);
        Self {
            pooling: Ignored(GroupPooling::Mean),
            projection: Some(Param::from_tensor(weight)),
        }
    }

    pub fn pooling(&self) -> GroupPooling {
        *self.pooling
    }

    fn project(&self, gfeats: &GroupFeatures<B>) -> Result<Tensor<B, 4>> {
        let members = gfeats.flat_members();
        let Some(projection) = &self.projection else {
            return Ok(members);
        };
        let (b, n, f) = gfeats.dims();
        let k = gfeats.group().len();
        let weight = projection.val();
        let [fg, fe] = weight.dims();
        ensure_shape("projection input channels", &[fg], &[f])?;
        Ok(members
            .swap_dims(2, 3)
            .reshape([b * n * k, f])
            .matmul(weight)
            .reshape([b, n, k, fe])
            .swap_dims(2, 3))
    }
}

impl<B: Backend> Embedder<B> for GroupEmbedder<B> {
    fn forward(&self, gfeats: &GroupFeatures<B>) -> Result<Tensor<B, 3>> {
        // [b, n, f', sn*rn]
        let members = self.project(gfeats)?;
        let [b, n, f, k] = members.dims();
        let pooled = match *self.pooling {
            GroupPooling::Flatten => members.swap_dims(2, 3).reshape([b, n, k * f]),
            GroupPooling::Mean => members.mean_dim(3).reshape([b, n, f]),
        };
        Ok(l2_normalize(pooled, 2))
    }

    fn output_dim(&self, channels: usize, group: TransformGroup) -> usize {
        let channels = match &self.projection {
            Some(projection) => projection.val().dims()[1],
            None => channels,
        };
        match *self.pooling {
            GroupPooling::Flatten => channels * group.len(),
            GroupPooling::Mean => channels,
        }
    }

    fn state_dict(&self) -> Result<ParamMap> {
        let mut params = ParamMap::new();
        if let Some(projection) = &self.projection {
            params.insert(
                Self::PROJECTION.to_string(),
                to_array::<B, 2, IxDyn>(projection.val())?,
            );
        }
        Ok(params)
    }

    fn load_state_dict(&mut self, params: &ParamMap) -> Result<()> {
        if let Some(projection) = &self.projection {
            let weight = projection.val();
            let loaded = take_param::<B, 2>(params, Self::PROJECTION, weight.dims(), &weight.device())?;
            self.projection = Some(Param::from_tensor(loaded));
        }
        Ok(())
    }
}

/// Checks the transform-group axes and delegates to the configured embedder.
#[derive(Debug)]
pub struct EmbedderWrapper<B: Backend, M = GroupEmbedder<B>> {
    embedder: Option<M>,
    group: TransformGroup,
    _backend: std::marker::PhantomData<B>,
}

impl<B: Backend> EmbedderWrapper<B> {
    pub fn new(config: &GiftConfig, device: &B::Device) -> Result<Self> {
        let embedder = build_embedder(&config.embedder, config, device)?;
        Ok(Self::with_embedder(embedder, config.group()?))
    }
}

impl<B: Backend, M: Embedder<B>> EmbedderWrapper<B, M> {
    pub fn with_embedder(embedder: Option<M>, group: TransformGroup) -> Self {
        Self {
            embedder,
            group,
            _backend: std::marker::PhantomData,
        }
    }

    pub fn group(&self) -> TransformGroup {
        self.group
    }

    pub fn embedder(&self) -> Option<&M> {
        self.embedder.as_ref()
    }

    /// True when the embedder exists and owns trainable parameters.
    pub fn has_parameters(&self) -> bool {
        self.embedder.as_ref().is_some_and(|e| e.num_params() > 0)
    }

    /// Replaces the embedder with `f(embedder)`, e.g. an optimizer step.
    pub fn update(&mut self, f: impl FnOnce(M) -> M) {
        self.embedder = self.embedder.take().map(f);
    }

    pub fn state_dict(&self) -> Result<ParamMap> {
        match &self.embedder {
            Some(embedder) => embedder.state_dict(),
            None => Ok(ParamMap::new()),
        }
    }

    pub fn load_state_dict(&mut self, params: &ParamMap) -> Result<()> {
        match self.embedder.as_mut() {
            Some(embedder) => embedder.load_state_dict(params),
            None => Ok(()),
        }
    }

    /// `[b, n, fg, sn, rn]` to `[b, n, fe]`.
    pub fn forward(&self, gfeats: &GroupFeatures<B>) -> Result<Tensor<B, 3>> {
        let group = gfeats.group();
        ensure_shape(
            "embedder group axes",
            &[self.group.scales, self.group.rotations],
            &[group.scales, group.rotations],
        )?;
        let embedder = self.embedder.as_ref().ok_or(GiftError::MissingEmbedder)?;
        let out = embedder.forward(gfeats)?;
        ensure_shape(
            "embedder output",
            &[
                gfeats.batch(),
                gfeats.keypoints(),
                embedder.output_dim(gfeats.channels(), group),
            ],
            &out.dims(),
        )?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{to_tensor, to_vec};
    use burn::backend::NdArray;
    use ndarray::{Array, Array3, Array5};

    type TestBackend = NdArray;

    fn features(group: TransformGroup) -> GroupFeatures<TestBackend> {
        let data: Array5<f32> = Array::from_shape_fn(
            (1, 2, 2, group.scales, group.rotations),
            |(_, i, c, s, r)| (1 + i + c + group.index(s, r)) as f32,
        );
        GroupFeatures::new(to_tensor(&data, &Default::default()).unwrap(), group).unwrap()
    }

    #[test]
    fn flatten_concatenates_scale_major() {
        let group = TransformGroup::new(2, 2).unwrap();
        let out: Array3<f32> = to_array(GroupEmbedder::flatten().forward(&features(group)).unwrap()).unwrap();
        assert_eq!(out.shape(), &[1, 2, 8]);
        let raw: Vec<f32> = vec![1., 2., 2., 3., 3., 4., 4., 5.];
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        for (got, want) in out.slice(ndarray::s![0, 0, ..]).iter().zip(&raw) {
            assert!((got - want / norm).abs() < 1e-6);
        }
    }

    #[test]
    fn mean_averages_over_group() {
        let group = TransformGroup::new(1, 3).unwrap();
        let out: Array3<f32> = to_array(GroupEmbedder::mean().forward(&features(group)).unwrap()).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2]);
        // keypoint 0: channel means 2 and 3
        assert!((out[(0, 0, 0)] - 2. / 13f32.sqrt()).abs() < 1e-6);
        assert!((out[(0, 0, 1)] - 3. / 13f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn projection_maps_members_before_pooling() {
        let device = Default::default();
        let group = TransformGroup::new(1, 2).unwrap();
        let mut embedder = GroupEmbedder::<TestBackend>::projection(2, 3, 0, &device);
        // Identity on the two input channels, zero third output.
        let mut params = ParamMap::new();
        params.insert(
            GroupEmbedder::<TestBackend>::PROJECTION.into(),
            ndarray::array![[1f32, 0., 0.], [0., 1., 0.]].into_dyn(),
        );
        embedder.load_state_dict(&params).unwrap();
        assert_eq!(embedder.state_dict().unwrap(), params);
        assert_eq!(embedder.output_dim(2, group), 3);

        let out = to_vec(embedder.forward(&features(group)).unwrap()).unwrap();
        // keypoint 0: members (1, 2) and (2, 3) average to (1.5, 2.5, 0)
        let norm = (1.5f32 * 1.5 + 2.5 * 2.5).sqrt();
        assert!((out[0] - 1.5 / norm).abs() < 1e-6);
        assert!((out[1] - 2.5 / norm).abs() < 1e-6);
        assert_eq!(out[2], 0.);
    }

    #[test]
    fn projection_rejects_other_channel_counts() {
        let group = TransformGroup::new(1, 2).unwrap();
        let embedder = GroupEmbedder::<TestBackend>::projection(5, 3, 0, &Default::default());
        assert!(matches!(
            embedder.forward(&features(group)),
            Err(GiftError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn wrapper_rejects_other_groups() {
        let wrapper = EmbedderWrapper::with_embedder(
            Some(GroupEmbedder::flatten()),
            TransformGroup::new(2, 2).unwrap(),
        );
        let gfeats = features(TransformGroup::new(1, 4).unwrap());
        assert!(matches!(
            wrapper.forward(&gfeats),
            Err(GiftError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn absent_embedder_reports_missing() {
        let group = TransformGroup::new(1, 2).unwrap();
        let wrapper = EmbedderWrapper::<TestBackend>::with_embedder(None, group);
        assert!(!wrapper.has_parameters());
        assert!(matches!(
            wrapper.forward(&features(group)),
            Err(GiftError::MissingEmbedder)
        ));
    }

    #[test]
    fn only_projection_has_parameters() {
        let group = TransformGroup::new(1, 2).unwrap();
        let wrap = |embedder| EmbedderWrapper::<TestBackend>::with_embedder(Some(embedder), group);
        assert!(!wrap(GroupEmbedder::flatten()).has_parameters());
        assert!(!wrap(GroupEmbedder::mean()).has_parameters());
        assert!(wrap(GroupEmbedder::projection(4, 8, 0, &Default::default())).has_parameters());
    }
}
