//! Inference entry point: one image and one keypoint set in, aggregated descriptors out.

use std::path::Path;

use burn::tensor::backend::Backend;
use image::RgbImage;
use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::checkpoint::{restore, LoadOutcome};
use crate::config::GiftConfig;
use crate::context::ExecutionContext;
use crate::embedder::{EmbedderWrapper, GroupEmbedder};
use crate::error::Result;
use crate::extractor::{ExtractorWrapper, VanillaLightCnn};
use crate::params::GradMode;
use crate::tensor::to_array;
use crate::transform::{ScaleRotateTransformer, TransformGenerator};

/// Trained extractor and embedder behind a transform generator.
///
/// Construction loads `config.step` from `config.model_dir`. A directory without checkpoints
/// is not an error: [`GiftDescriptor::load_outcome`] then reports
/// [`LoadOutcome::Untrained`] and the modules keep their initial parameters.
pub struct GiftDescriptor<B: Backend, T = ScaleRotateTransformer> {
    extractor: ExtractorWrapper<B, VanillaLightCnn<B>>,
    embedder: EmbedderWrapper<B, GroupEmbedder<B>>,
    transformer: T,
    outcome: LoadOutcome,
}

impl<B: Backend> GiftDescriptor<B, ScaleRotateTransformer> {
    pub fn new(config: &GiftConfig, context: ExecutionContext<B>) -> Result<Self> {
        let transformer = ScaleRotateTransformer::from_config(config)?;
        Self::with_transformer(config, context, transformer)
    }
}

impl<B: Backend, T: TransformGenerator> GiftDescriptor<B, T> {
    pub fn with_transformer(
        config: &GiftConfig,
        context: ExecutionContext<B>,
        transformer: T,
    ) -> Result<Self> {
        config.validate()?;
        let mut extractor = ExtractorWrapper::new(config, &context.device)?;
        let mut embedder = EmbedderWrapper::new(config, &context.device)?;
        let outcome = restore(&config.model_dir, config.step, |checkpoint| {
            extractor.load_state_dict(&checkpoint.extractor)?;
            embedder.load_state_dict(&checkpoint.embedder)
        })?;
        Ok(Self {
            extractor,
            embedder,
            transformer,
            outcome,
        })
    }

    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.outcome
    }

    /// Loaded checkpoint step, `0` when untrained.
    pub fn step(&self) -> i64 {
        self.outcome.step()
    }

    /// `points`: `[n, 2]` pixel coordinates in `image`. Returns `[n, fe]`.
    pub fn describe(&self, image: &RgbImage, points: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let transformed = self.transformer.transform(image, points)?;
        let (images, keypoints) = self.transformer.postprocess(transformed)?;
        let extracted = self
            .extractor
            .forward(&images, &keypoints, None, GradMode::Frozen)?;
        let efeats = GradMode::Frozen.apply(self.embedder.forward(&extracted.gfeats)?);
        let efeats: Array3<f32> = to_array(efeats)?;
        Ok(efeats.index_axis_move(Axis(0), 0))
    }

    /// Reads the image at `path` as 8-bit RGB and describes `points` in it.
    pub fn describe_path(&self, path: &Path, points: &ArrayView2<f32>) -> Result<Array2<f32>> {
        let image = image::open(path)?.to_rgb8();
        self.describe(&image, points)
    }
}
