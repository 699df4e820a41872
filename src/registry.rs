//! Name → module tables for the pluggable extractor and embedder.
//!
//! `"None"` is registered in both tables and resolves to an absent module.

use burn::tensor::backend::Backend;

use crate::config::GiftConfig;
use crate::embedder::GroupEmbedder;
use crate::error::{GiftError, Result};
use crate::extractor::{VanillaLightCnn, LIGHT_CNN_CHANNELS};

pub const NONE: &str = "None";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExtractorKind {
    VanillaLightCnn,
    None,
}

impl ExtractorKind {
    /// Channels of the feature maps the extractor emits. Without an extractor the RGB image
    /// itself is sampled.
    pub fn channels(self) -> usize {
        match self {
            ExtractorKind::VanillaLightCnn => LIGHT_CNN_CHANNELS,
            ExtractorKind::None => 3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EmbedderKind {
    Flatten,
    Mean,
    Projection,
    None,
}

pub const EXTRACTORS: &[(&str, ExtractorKind)] = &[
    ("VanillaLightCNN", ExtractorKind::VanillaLightCnn),
    (NONE, ExtractorKind::None),
];

pub const EMBEDDERS: &[(&str, EmbedderKind)] = &[
    ("GRENone", EmbedderKind::Flatten),
    ("GroupMean", EmbedderKind::Mean),
    ("GroupProjection", EmbedderKind::Projection),
    (NONE, EmbedderKind::None),
];

fn lookup<K: Copy>(table: &[(&str, K)], what: &str, name: &str) -> Result<K> {
    table
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| {
            let known: Vec<&str> = table.iter().map(|(registered, _)| *registered).collect();
            GiftError::invalid_config(format!("unknown {what} {name:?}, expected one of {known:?}"))
        })
}

pub fn extractor_kind(name: &str) -> Result<ExtractorKind> {
    lookup(EXTRACTORS, "extractor", name)
}

pub fn embedder_kind(name: &str) -> Result<EmbedderKind> {
    lookup(EMBEDDERS, "embedder", name)
}

pub fn build_extractor<B: Backend>(
    name: &str,
    config: &GiftConfig,
    device: &B::Device,
) -> Result<Option<VanillaLightCnn<B>>> {
    Ok(match extractor_kind(name)? {
        ExtractorKind::VanillaLightCnn => Some(VanillaLightCnn::new(config.seed, device)),
        ExtractorKind::None => None,
    })
}

/// Builds the embedder `name`. A projection takes its input width from the configured
/// extractor.
pub fn build_embedder<B: Backend>(
    name: &str,
    config: &GiftConfig,
    device: &B::Device,
) -> Result<Option<GroupEmbedder<B>>> {
    Ok(match embedder_kind(name)? {
        EmbedderKind::Flatten => Some(GroupEmbedder::flatten()),
        EmbedderKind::Mean => Some(GroupEmbedder::mean()),
        EmbedderKind::Projection => {
            let channels = extractor_kind(&config.extractor)?.channels();
            Some(GroupEmbedder::projection(
                channels,
                config.embed_dim,
                config.seed.wrapping_add(1),
                device,
            ))
        }
        EmbedderKind::None => None,
    })
}
