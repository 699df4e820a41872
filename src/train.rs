//! Triplet training over two observations of the same keypoints.
//!
//! The first observation provides the anchors, the second the positives and the dense grid
//! that negatives are mined from. The positive distance is computed once per keypoint and
//! shared by all of its transform-group instances.
//!
//! Negatives are selected on the host and gathered back out of the candidate tensors, so the
//! loss returned by [`TrainWrapper::forward`] stays differentiable through both observations.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use log::debug;
use ndarray::{Array2, Array3, Array4, Ix2, Ix3, Ix4};

use crate::checkpoint::{restore, Checkpoint, LoadOutcome};
use crate::config::GiftConfig;
use crate::context::ExecutionContext;
use crate::embedder::{Embedder, EmbedderWrapper, GroupEmbedder};
use crate::error::{ensure_shape, GiftError, Result};
use crate::extractor::{Extracted, ExtractorWrapper, FeatureMapExtractor, VanillaLightCnn};
use crate::group::{repeat_array_over_group, repeat_over_group, GroupGridFeatures};
use crate::loss::{descriptor_distance, positive_distance, PositiveDistance, TripletObjective};
use crate::miner::{MiningParams, MiningStats, SemiHardNegativeMiner};
use crate::params::GradMode;
use crate::tensor::{to_array, to_vec};

/// One geometric observation of a batch of keypoints.
#[derive(Debug, Clone)]
pub struct Observation {
    /// `sn*rn` images `[b, 3, h, w]`, scale-major.
    pub images: Vec<Array4<f32>>,
    /// `[b, n, 2]` keypoints in the untransformed frame, pixels.
    pub keypoints: Array3<f32>,
    /// `sn*rn` keypoint sets `[b, n, 2]` in each transformed image's frame.
    pub points: Vec<Array3<f32>>,
    /// `sn*rn` negative grids `[b, gh, gw, 2]`, cells spaced `hem_interval` pixels apart.
    pub grids: Option<Vec<Array4<f32>>>,
}

#[derive(Debug, Clone)]
pub struct TrainBatch {
    pub first: Observation,
    pub second: Observation,
    /// `[b, n]` scale index offset from the first to the second observation.
    pub scale_offset: Array2<i32>,
    /// `[b, n]` rotation index offset from the first to the second observation.
    pub rotate_offset: Array2<i32>,
    /// Exclusion radius around the true match, pixels.
    pub hem_thresh: f32,
}

/// Where the triplet loss is applied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LossLevel {
    /// Group-indexed descriptors, one triplet per transform-group instance (`"gfeats"`).
    GroupFeatures,
    /// Aggregated embeddings (`"gefeats"`).
    Embeddings,
}

#[derive(Debug, Clone)]
pub struct TrainOutput<B: Backend> {
    /// Scalar loss, shape `[1]`. Call `backward` on it under an autodiff backend.
    pub triplet_loss: Tensor<B, 1>,
    pub triplet_neg_rate: f32,
    /// `[B, n]`, `B = b*sn*rn` for [`LossLevel::GroupFeatures`] and `b` otherwise. Squared
    /// when `loss_square` is set, like `dis_neg`.
    pub dis_pos: Tensor<B, 2>,
    pub dis_neg: Tensor<B, 2>,
    /// `[B, n]` grid cell `y * gw + x` each negative was taken from.
    pub negative_cells: Array2<usize>,
    pub mining: MiningStats,
}

impl<B: Backend> TrainOutput<B> {
    pub fn loss_value(&self) -> Result<f32> {
        to_vec(self.triplet_loss.clone())?
            .into_iter()
            .next()
            .ok_or_else(|| GiftError::TensorData("empty loss tensor".into()))
    }
}

pub struct TrainWrapper<B: Backend, E = VanillaLightCnn<B>, M = GroupEmbedder<B>> {
    extractor: ExtractorWrapper<B, E>,
    embedder: EmbedderWrapper<B, M>,
    positive: Box<dyn PositiveDistance<B>>,
    objective: TripletObjective,
    context: ExecutionContext<B>,
    config: GiftConfig,
}

impl<B: Backend> TrainWrapper<B> {
    pub fn new(config: &GiftConfig, context: ExecutionContext<B>) -> Result<Self> {
        let extractor = ExtractorWrapper::new(config, &context.device)?;
        let embedder = EmbedderWrapper::new(config, &context.device)?;
        Self::with_modules(config, extractor, embedder, context)
    }
}

impl<B, E, M> TrainWrapper<B, E, M>
where
    B: Backend,
    E: FeatureMapExtractor<B>,
    M: Embedder<B>,
{
    pub fn with_modules(
        config: &GiftConfig,
        extractor: ExtractorWrapper<B, E>,
        embedder: EmbedderWrapper<B, M>,
        context: ExecutionContext<B>,
    ) -> Result<Self> {
        config.validate()?;
        let group = config.group()?;
        ensure_shape(
            "extractor group",
            &[group.scales, group.rotations],
            &[extractor.group().scales, extractor.group().rotations],
        )?;
        ensure_shape(
            "embedder group",
            &[group.scales, group.rotations],
            &[embedder.group().scales, embedder.group().rotations],
        )?;
        Ok(Self {
            extractor,
            embedder,
            positive: positive_distance(config.offset_reduction),
            objective: TripletObjective::new(config.loss_margin),
            context,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &GiftConfig {
        &self.config
    }

    pub fn extractor(&self) -> &ExtractorWrapper<B, E> {
        &self.extractor
    }

    pub fn embedder(&self) -> &EmbedderWrapper<B, M> {
        &self.embedder
    }

    fn extractor_mode(&self) -> GradMode {
        GradMode::from_flag(self.config.train_extractor)
    }

    /// A parameter-free embedder has nothing to freeze, gradients pass through to the
    /// extractor.
    fn embedder_mode(&self) -> GradMode {
        GradMode::from_flag(self.config.train_embedder || !self.embedder.has_parameters())
    }

    /// Loads `config.step` from `config.model_dir` into both modules.
    pub fn restore(&mut self) -> Result<LoadOutcome> {
        let (dir, step) = (self.config.model_dir.clone(), self.config.step);
        self.restore_from(&dir, step)
    }

    pub fn restore_from(&mut self, dir: &Path, step: i64) -> Result<LoadOutcome> {
        let Self {
            extractor,
            embedder,
            ..
        } = self;
        restore(dir, step, |checkpoint| {
            extractor.load_state_dict(&checkpoint.extractor)?;
            embedder.load_state_dict(&checkpoint.embedder)
        })
    }

    pub fn checkpoint(&self, step: i64) -> Result<Checkpoint> {
        Ok(Checkpoint {
            extractor: self.extractor.state_dict()?,
            embedder: self.embedder.state_dict()?,
            step,
        })
    }

    fn mining_params(&self, hem_thresh: f32) -> MiningParams {
        MiningParams {
            exclusion_radius: hem_thresh / self.config.hem_interval,
            window: self.config.loss_margin,
            squared: self.config.loss_square,
        }
    }

    pub fn forward(&self, batch: &TrainBatch, level: LossLevel) -> Result<TrainOutput<B>> {
        let grids = batch.second.grids.as_deref().ok_or(GiftError::MissingGrid)?;
        let mode = self.extractor_mode();
        let first = self
            .extractor
            .forward(&batch.first.images, &batch.first.points, None, mode)?;
        let second = self
            .extractor
            .forward(&batch.second.images, &batch.second.points, Some(grids), mode)?;
        let grid = second.gfeats_neg.as_ref().ok_or(GiftError::MissingGrid)?;

        let (b, n) = (first.gfeats.batch(), first.gfeats.keypoints());
        ensure_shape("second observation keypoints", &[b, n, 2], batch.second.keypoints.shape())?;
        let matches = batch.second.keypoints.mapv(|v| v / self.config.hem_interval);
        let params = self.mining_params(batch.hem_thresh);
        let miner = SemiHardNegativeMiner::new(params, self.context.host);
        debug!(
            "train forward at {level:?}: b={b} n={n} group={:?} grid={:?}",
            first.gfeats.group(),
            grid.dims()
        );

        let triplets = match level {
            LossLevel::GroupFeatures => {
                self.group_level(batch, &first, &second, grid, &matches, &miner)?
            }
            LossLevel::Embeddings => {
                self.embedding_level(&first, &second, grid, &matches, &miner)?
            }
        };
        let loss = self
            .objective
            .evaluate(triplets.dis_pos.clone(), triplets.dis_neg.clone())?;
        debug!(
            "{:.1}% of {} triplets active",
            loss.active_rate * 100.,
            triplets.negative_cells.len()
        );
        Ok(TrainOutput {
            triplet_loss: loss.loss,
            triplet_neg_rate: loss.active_rate,
            dis_pos: triplets.dis_pos,
            dis_neg: triplets.dis_neg,
            negative_cells: triplets.negative_cells,
            mining: triplets.mining,
        })
    }

    fn group_level(
        &self,
        batch: &TrainBatch,
        first: &Extracted<B>,
        second: &Extracted<B>,
        grid: &GroupGridFeatures<B>,
        matches: &Array3<f32>,
        miner: &SemiHardNegativeMiner,
    ) -> Result<Triplets<B>> {
        let group = first.gfeats.group();
        let dis_pos = self.positive.distance(
            &first.gfeats,
            &second.gfeats,
            &batch.scale_offset.view(),
            &batch.rotate_offset.view(),
        )?;
        let mut dis_pos = repeat_over_group(dis_pos, group);
        if self.config.loss_square {
            dis_pos = dis_pos.powf_scalar(2.);
        }
        let matches = repeat_array_over_group(matches.view(), group);
        mine_triplets(
            miner,
            first.gfeats.to_instances(),
            grid.to_candidate_maps(),
            dis_pos,
            &matches,
            self.config.loss_square,
        )
    }

    fn embedding_level(
        &self,
        first: &Extracted<B>,
        second: &Extracted<B>,
        grid: &GroupGridFeatures<B>,
        matches: &Array3<f32>,
        miner: &SemiHardNegativeMiner,
    ) -> Result<Triplets<B>> {
        let mode = self.embedder_mode();
        let squared = self.config.loss_square;
        let anchors = mode.apply(self.embedder.forward(&first.gfeats)?);
        let positives = mode.apply(self.embedder.forward(&second.gfeats)?);
        let dis_pos = descriptor_distance(anchors.clone(), positives, squared)?;

        let (b, gh, gw, _) = grid.dims();
        let cells = mode.apply(self.embedder.forward(&grid.to_point_features())?);
        let fe = cells.dims()[2];
        let candidates = cells.reshape([b, gh, gw, fe]).permute([0, 3, 1, 2]);
        mine_triplets(miner, anchors, candidates, dis_pos, matches, squared)
    }
}

impl<B, E, M> TrainWrapper<B, E, M>
where
    B: AutodiffBackend,
    E: FeatureMapExtractor<B> + AutodiffModule<B>,
    M: Embedder<B> + AutodiffModule<B>,
{
    /// Backpropagates `loss` and steps every module that is configured as trainable.
    ///
    /// Frozen modules keep their parameters even when the loss depends on them.
    pub fn apply_gradients<OE, OM>(
        &mut self,
        loss: Tensor<B, 1>,
        lr: f64,
        extractor_optim: &mut OE,
        embedder_optim: &mut OM,
    ) where
        OE: Optimizer<E, B>,
        OM: Optimizer<M, B>,
    {
        let mut grads = loss.backward();
        if self.config.train_extractor {
            let params = self
                .extractor
                .extractor()
                .map(|extractor| GradientsParams::from_module(&mut grads, extractor));
            if let Some(params) = params {
                debug!("stepping extractor, {} gradients", params.len());
                self.extractor
                    .update(|extractor| extractor_optim.step(lr, extractor, params));
            }
        }
        if self.config.train_embedder && self.embedder.has_parameters() {
            let params = self
                .embedder
                .embedder()
                .map(|embedder| GradientsParams::from_module(&mut grads, embedder));
            if let Some(params) = params {
                debug!("stepping embedder, {} gradients", params.len());
                self.embedder
                    .update(|embedder| embedder_optim.step(lr, embedder, params));
            }
        }
    }
}

struct Triplets<B: Backend> {
    dis_pos: Tensor<B, 2>,
    dis_neg: Tensor<B, 2>,
    negative_cells: Array2<usize>,
    mining: MiningStats,
}

/// Selects one negative per anchor from `candidates` `[B, f, gh, gw]` and measures it against
/// `anchors` `[B, n, f]`.
fn mine_triplets<B: Backend>(
    miner: &SemiHardNegativeMiner,
    anchors: Tensor<B, 3>,
    candidates: Tensor<B, 4>,
    dis_pos: Tensor<B, 2>,
    matches: &Array3<f32>,
    squared: bool,
) -> Result<Triplets<B>> {
    let host_candidates = to_array::<B, 4, Ix4>(candidates.clone())?;
    let host_anchors = to_array::<B, 3, Ix3>(anchors.clone())?;
    let host_dis_pos = to_array::<B, 2, Ix2>(dis_pos.clone())?;
    let mined = miner.mine(
        &host_candidates.view(),
        &host_dis_pos.view(),
        &host_anchors.view(),
        &matches.view(),
    )?;
    let negatives = mined.gather(candidates)?;
    let dis_neg = descriptor_distance(anchors, negatives, squared)?;
    Ok(Triplets {
        dis_pos,
        dis_neg,
        negative_cells: mined.cells,
        mining: mined.stats,
    })
}
