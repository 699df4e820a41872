//! Dense feature extraction and per-transform keypoint sampling.

use burn::module::{Module, Param};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Tensor;
use ndarray::{Array3, Array4, IxDyn};

use crate::config::GiftConfig;
use crate::error::{ensure_dim, ensure_shape, GiftError, Result};
use crate::group::{GroupFeatures, GroupGridFeatures, TransformGroup};
use crate::interpolate::interpolate_feats;
use crate::params::{kaiming_uniform, seeded_rng, take_param, GradMode, ParamMap};
use crate::registry::build_extractor;
use crate::tensor::{l2_normalize, to_array, to_tensor};

/// Image to dense feature map.
///
/// Input is `[b, 3, h, w]`, output `[b, fg, h / p, w / p]` for an integer pooling factor `p`,
/// L2-normalized along the channel axis. `fg` must not depend on the input.
pub trait FeatureMapExtractor<B: Backend>: Module<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>>;

    /// Parameters under their checkpoint names.
    fn state_dict(&self) -> Result<ParamMap> {
        Ok(ParamMap::new())
    }

    fn load_state_dict(&mut self, _params: &ParamMap) -> Result<()> {
        Ok(())
    }
}

const KERNEL: usize = 5;
const PADDING: usize = KERNEL / 2;

/// Channels of [`VanillaLightCnn`] feature maps.
pub const LIGHT_CNN_CHANNELS: usize = 32;

/// Light four-layer CNN: two 5x5 conv blocks with instance norm separated by a 2x2 average
/// pool, 32 output channels at half resolution.
#[derive(Module, Debug)]
pub struct VanillaLightCnn<B: Backend> {
    conv0_0: Param<Tensor<B, 4>>,
    norm0_1: InstanceNorm<B>,
    conv0_3: Param<Tensor<B, 4>>,
    norm0_4: InstanceNorm<B>,
    pool0_6: AvgPool2d,
    conv1_0: Param<Tensor<B, 4>>,
    norm1_1: InstanceNorm<B>,
    conv1_3: Param<Tensor<B, 4>>,
    norm1_4: InstanceNorm<B>,
}

impl<B: Backend> VanillaLightCnn<B> {
    pub const OUT_CHANNELS: usize = LIGHT_CNN_CHANNELS;
    pub const POOLING: usize = 2;

    const LAYERS: [(&'static str, [usize; 4]); 4] = [
        ("conv0.0.weight", [16, 3, KERNEL, KERNEL]),
        ("conv0.3.weight", [32, 16, KERNEL, KERNEL]),
        ("conv1.0.weight", [32, 32, KERNEL, KERNEL]),
        ("conv1.3.weight", [32, 32, KERNEL, KERNEL]),
    ];

    pub fn new(seed: u64, device: &B::Device) -> Self {
        let mut rng = seeded_rng(seed);
        let [w0, w1, w2, w3] = Self::LAYERS.map(|(_, shape)| {
            let fan_in = shape[1] * shape[2] * shape[3];
            Param::from_tensor(kaiming_uniform(shape, fan_in, &mut rng, device))
        });
        let norm = |channels| {
            InstanceNormConfig::new(channels)
                .with_affine(false)
                .init(device)
        };
        Self {
            conv0_0: w0,
            norm0_1: norm(16),
            conv0_3: w1,
            norm0_4: norm(32),
            pool0_6: AvgPool2dConfig::new([Self::POOLING, Self::POOLING])
                .with_strides([Self::POOLING, Self::POOLING])
                .init(),
            conv1_0: w2,
            norm1_1: norm(32),
            conv1_3: w3,
            norm1_4: norm(32),
        }
    }

    fn conv(x: Tensor<B, 4>, weight: &Param<Tensor<B, 4>>, norm: &InstanceNorm<B>) -> Tensor<B, 4> {
        let options = ConvOptions::new([1, 1], [PADDING, PADDING], [1, 1], 1);
        norm.forward(conv2d(x, weight.val(), None, options))
    }

    fn weights(&self) -> [&Param<Tensor<B, 4>>; 4] {
        [&self.conv0_0, &self.conv0_3, &self.conv1_0, &self.conv1_3]
    }
}

impl<B: Backend> FeatureMapExtractor<B> for VanillaLightCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let [_, channels, height, width] = images.dims();
        ensure_dim("extractor input channels", 3, channels)?;
        if height < Self::POOLING || width < Self::POOLING {
            return Err(GiftError::shape_mismatch(
                "extractor input size",
                &[Self::POOLING, Self::POOLING],
                &[height, width],
            ));
        }
        let x = relu(Self::conv(images, &self.conv0_0, &self.norm0_1));
        let x = relu(Self::conv(x, &self.conv0_3, &self.norm0_4));
        let x = self.pool0_6.forward(x);
        let x = relu(Self::conv(x, &self.conv1_0, &self.norm1_1));
        let x = Self::conv(x, &self.conv1_3, &self.norm1_4);
        Ok(l2_normalize(x, 1))
    }

    fn state_dict(&self) -> Result<ParamMap> {
        Self::LAYERS
            .iter()
            .zip(self.weights())
            .map(|((name, _), weight)| Ok((name.to_string(), to_array::<B, 4, IxDyn>(weight.val())?)))
            .collect()
    }

    fn load_state_dict(&mut self, params: &ParamMap) -> Result<()> {
        let device = self.conv0_0.val().device();
        let [w0, w1, w2, w3] = Self::LAYERS;
        let load = |(name, shape): (&str, [usize; 4])| {
            take_param::<B, 4>(params, name, shape, &device).map(Param::from_tensor)
        };
        // All four are read before any is replaced, so a bad state dict leaves the module intact.
        let loaded = [load(w0)?, load(w1)?, load(w2)?, load(w3)?];
        let [w0, w1, w2, w3] = loaded;
        self.conv0_0 = w0;
        self.conv0_3 = w1;
        self.conv1_0 = w2;
        self.conv1_3 = w3;
        Ok(())
    }
}

/// Output of [`ExtractorWrapper::forward`].
#[derive(Debug, Clone)]
pub struct Extracted<B: Backend> {
    /// `[b, n, fg, sn, rn]`
    pub gfeats: GroupFeatures<B>,
    /// `[b, gh, gw, fg, sn, rn]`, present when grids were supplied.
    pub gfeats_neg: Option<GroupGridFeatures<B>>,
}

/// Runs the extractor once per transform-group member and samples the resulting feature maps
/// at the member's keypoints and, optionally, at a dense negative grid.
///
/// Without an extractor the images themselves are sampled as 3-channel feature maps.
#[derive(Debug)]
pub struct ExtractorWrapper<B: Backend, E = VanillaLightCnn<B>> {
    extractor: Option<E>,
    group: TransformGroup,
    device: B::Device,
}

impl<B: Backend> ExtractorWrapper<B> {
    pub fn new(config: &GiftConfig, device: &B::Device) -> Result<Self> {
        let extractor = build_extractor(&config.extractor, config, device)?;
        Ok(Self::with_extractor(extractor, config.group()?, device.clone()))
    }
}

impl<B: Backend, E: FeatureMapExtractor<B>> ExtractorWrapper<B, E> {
    pub fn with_extractor(extractor: Option<E>, group: TransformGroup, device: B::Device) -> Self {
        Self {
            extractor,
            group,
            device,
        }
    }

    pub fn group(&self) -> TransformGroup {
        self.group
    }

    pub fn has_extractor(&self) -> bool {
        self.extractor.is_some()
    }

    pub fn extractor(&self) -> Option<&E> {
        self.extractor.as_ref()
    }

    /// Replaces the extractor with `f(extractor)`, e.g. an optimizer step.
    pub fn update(&mut self, f: impl FnOnce(E) -> E) {
        self.extractor = self.extractor.take().map(f);
    }

    pub fn state_dict(&self) -> Result<ParamMap> {
        match &self.extractor {
            Some(extractor) => extractor.state_dict(),
            None => Ok(ParamMap::new()),
        }
    }

    pub fn load_state_dict(&mut self, params: &ParamMap) -> Result<()> {
        match self.extractor.as_mut() {
            Some(extractor) => extractor.load_state_dict(params),
            None => Ok(()),
        }
    }

    /// `images`: `sn*rn` arrays `[b, c, h_k, w_k]` in scale-major order, `points`: matching
    /// `[b, n, 2]` keypoints in each image's pixel frame, `grids`: matching `[b, gh, gw, 2]`
    /// negative candidate locations.
    ///
    /// Members may differ in image size; batch, channel and keypoint counts must agree.
    /// Under [`GradMode::Frozen`] the feature maps are detached before sampling.
    pub fn forward(
        &self,
        images: &[Array4<f32>],
        points: &[Array3<f32>],
        grids: Option<&[Array4<f32>]>,
        mode: GradMode,
    ) -> Result<Extracted<B>> {
        self.group.check_len("image list", images.len())?;
        self.group.check_len("keypoint list", points.len())?;
        let (batch, channels) = (images[0].shape()[0], images[0].shape()[1]);
        for image in images {
            ensure_shape("image batch and channels", &[batch, channels], &image.shape()[..2])?;
        }
        let point_shape = points[0].shape();
        ensure_shape("keypoint list", &[batch, point_shape[1], 2], point_shape)?;
        for pts in points {
            ensure_shape("keypoint list", point_shape, pts.shape())?;
        }
        let grid_dims = match grids {
            Some(grids) => {
                self.group.check_len("grid list", grids.len())?;
                let grid_shape = grids[0].shape();
                ensure_shape(
                    "grid list",
                    &[batch, grid_shape[1], grid_shape[2], 2],
                    grid_shape,
                )?;
                for grid in grids {
                    ensure_shape("grid list", grid_shape, grid.shape())?;
                }
                Some((grid_shape[1], grid_shape[2]))
            }
            None => None,
        };

        let mut point_feats = Vec::with_capacity(self.group.len());
        let mut grid_feats = Vec::with_capacity(self.group.len());
        for k in 0..self.group.len() {
            let (point, grid) =
                self.extract_member(&images[k], &points[k], grids.map(|grids| &grids[k]), mode)?;
            point_feats.push(point);
            grid_feats.extend(grid);
        }

        let gfeats = GroupFeatures::from_members(point_feats, self.group)?;
        let gfeats_neg = match grid_dims {
            Some((gh, gw)) => Some(GroupGridFeatures::from_members(grid_feats, gh, gw, self.group)?),
            None => None,
        };
        Ok(Extracted { gfeats, gfeats_neg })
    }

    fn extract_member(
        &self,
        image: &Array4<f32>,
        points: &Array3<f32>,
        grid: Option<&Array4<f32>>,
        mode: GradMode,
    ) -> Result<(Tensor<B, 3>, Option<Tensor<B, 3>>)> {
        let input = to_tensor::<B, 4, _, _>(image, &self.device)?;
        let feats = match &self.extractor {
            Some(extractor) => mode.apply(extractor.forward(input)?),
            None => input,
        };
        ensure_dim("feature map batch", image.shape()[0], feats.dims()[0])?;
        let image_width = image.shape()[3];
        let point_feats = interpolate_feats(image_width, &points.view(), feats.clone())?;
        let grid_feats = match grid {
            Some(grid) => {
                let (b, gh, gw, _) = grid.dim();
                let flat = grid.to_shape((b, gh * gw, 2))?;
                Some(interpolate_feats(image_width, &flat.view(), feats)?)
            }
            None => None,
        };
        Ok((point_feats, grid_feats))
    }
}
