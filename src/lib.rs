// This implementation of GIFT follows the method described by Liu et al. (NeurIPS 2019).
// It is made available under the terms of the MIT license.

//! This crate computes GIFT (group invariant feature transform) local descriptors and provides
//! the forward pass used to train them.
//!
//! An image is warped into a fixed group of `sn` scales times `rn` rotations. A dense
//! feature extractor runs on every copy, and features are bilinearly sampled at the keypoints
//! and kept separately per group member. An embedder then aggregates them into one
//! descriptor per keypoint.
//! Training pairs two observations of the same keypoints and applies a triplet margin loss.
//! Negatives are mined from a dense grid over the second observation, choosing semi-hard
//! negatives that are far from the true match.
//!
//! Group members are always ordered scale-major: member `(s, r)` has index `s * rn + r`.
//!
//! Useful resources:
//! - [1]: [Liu 2019, GIFT: Learning Transformation-Invariant Dense Visual Descriptors via Group CNNs](https://arxiv.org/abs/1911.05932)
//! - [2]: [Schroff 2015, FaceNet](https://arxiv.org/abs/1503.03832) for semi-hard negative mining

mod checkpoint;
mod config;
mod context;
mod descriptor;
mod embedder;
mod error;
mod extractor;
mod group;
mod interpolate;
mod loss;
mod miner;
mod params;
mod registry;
mod tensor;
mod train;
mod transform;

pub use checkpoint::{
    checkpoint_steps, load_checkpoint, resolve_checkpoint, restore, save_checkpoint, Checkpoint,
    LoadOutcome, LATEST,
};
pub use config::{load_config, GiftConfig, OffsetReduction};
pub use context::{ExecutionContext, HostParallelism};
pub use descriptor::GiftDescriptor;
pub use embedder::{Embedder, EmbedderWrapper, GroupEmbedder, GroupPooling};
pub use error::{GiftError, Result};
pub use extractor::{
    Extracted, ExtractorWrapper, FeatureMapExtractor, VanillaLightCnn, LIGHT_CNN_CHANNELS,
};
pub use group::{
    repeat_array_over_group, repeat_over_group, GroupFeatures, GroupGridFeatures, TransformGroup,
};
pub use interpolate::{
    bilinear_taps, interpolate_feats, normalize_coordinate, pooling_factor, BilinearTaps,
};
pub use loss::{
    descriptor_distance, positive_distance, AlignedMean, AlignedNearest, PositiveDistance,
    TripletLoss, TripletObjective,
};
pub use miner::{cost_volume, MinedNegatives, MiningParams, MiningStats, Selection, SemiHardNegativeMiner};
pub use params::{GradMode, ParamMap};
pub use registry::{
    build_embedder, build_extractor, embedder_kind, extractor_kind, EmbedderKind, ExtractorKind,
    EMBEDDERS, EXTRACTORS, NONE,
};
pub use tensor::{to_array, to_tensor, to_vec};
pub use train::{LossLevel, Observation, TrainBatch, TrainOutput, TrainWrapper};
pub use transform::{
    normalize_image, ScaleRotateTransformer, TransformGenerator, TransformedSet,
};
