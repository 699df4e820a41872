use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GiftError, Result};
use crate::group::TransformGroup;

/// How the positive distance is reduced over aligned transform-group pairs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReduction {
    #[default]
    Mean,
    Nearest,
}

/// Options recognised by the extractor, embedder, training and inference wrappers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GiftConfig {
    /// Registered extractor name, `"None"` for the absent extractor.
    pub extractor: String,
    /// Registered embedder name, `"None"` for the absent embedder.
    pub embedder: String,
    pub sample_scale_num: usize,
    pub sample_rotate_num: usize,
    /// log2 of the scale factor applied to the first scale member.
    pub sample_scale_begin: f32,
    /// log2 step between consecutive scale members.
    pub sample_scale_inter: f32,
    /// Rotation of the first rotation member, degrees.
    pub sample_rotate_begin: f32,
    /// Step between consecutive rotation members, degrees.
    pub sample_rotate_inter: f32,
    pub loss_margin: f32,
    /// Pixels per negative-grid cell.
    pub hem_interval: f32,
    pub train_embedder: bool,
    pub train_extractor: bool,
    pub loss_square: bool,
    pub offset_reduction: OffsetReduction,
    /// Output width of the `"GroupProjection"` embedder.
    pub embed_dim: usize,
    pub model_dir: PathBuf,
    /// Checkpoint step to load, `-1` for the latest one.
    pub step: i64,
    /// Seed for parameter initialisation.
    pub seed: u64,
}

impl Default for GiftConfig {
    fn default() -> Self {
        Self {
            extractor: "VanillaLightCNN".into(),
            embedder: "GRENone".into(),
            sample_scale_num: 5,
            sample_rotate_num: 5,
            sample_scale_begin: 0.,
            sample_scale_inter: -0.5,
            sample_rotate_begin: -90.,
            sample_rotate_inter: 45.,
            loss_margin: 0.5,
            hem_interval: 8.,
            train_embedder: true,
            train_extractor: true,
            loss_square: false,
            offset_reduction: OffsetReduction::Mean,
            embed_dim: 128,
            model_dir: PathBuf::from("data/model"),
            step: -1,
            seed: 0,
        }
    }
}

impl GiftConfig {
    pub fn group(&self) -> Result<TransformGroup> {
        TransformGroup::new(self.sample_scale_num, self.sample_rotate_num)
    }

    /// Checks the numeric options. Module names are checked by the registry when the
    /// wrappers are built.
    pub fn validate(&self) -> Result<()> {
        self.group()?;
        if !(self.hem_interval > 0.) {
            return Err(GiftError::invalid_config(format!(
                "hem_interval must be positive, got {}",
                self.hem_interval
            )));
        }
        if !(self.loss_margin >= 0.) {
            return Err(GiftError::invalid_config(format!(
                "loss_margin must be non-negative, got {}",
                self.loss_margin
            )));
        }
        if self.embed_dim == 0 {
            return Err(GiftError::invalid_config("embed_dim must be positive"));
        }
        if self.step < -1 {
            return Err(GiftError::invalid_config(format!(
                "step must be -1 or a checkpoint step, got {}",
                self.step
            )));
        }
        Ok(())
    }
}

/// Reads, parses and validates a JSON configuration file.
pub fn load_config(path: &Path) -> Result<GiftConfig> {
    let data = fs::read_to_string(path)?;
    let config: GiftConfig = serde_json::from_str(&data)?;
    config.validate()?;
    log::debug!("loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: GiftConfig = serde_json::from_str(
            r#"{"sample_scale_num": 2, "sample_rotate_num": 3, "loss_square": true,
                "offset_reduction": "nearest"}"#,
        )
        .unwrap();
        assert_eq!(config.group().unwrap(), TransformGroup::new(2, 3).unwrap());
        assert!(config.loss_square);
        assert_eq!(config.offset_reduction, OffsetReduction::Nearest);
        assert_eq!(config.extractor, "VanillaLightCNN");
        assert_eq!(config.step, -1);
        assert_eq!(config.embed_dim, 128);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut config = GiftConfig::default();
        assert!(config.validate().is_ok());
        config.hem_interval = 0.;
        assert!(matches!(config.validate(), Err(GiftError::InvalidConfig(_))));
        config.hem_interval = 4.;
        config.sample_rotate_num = 0;
        assert!(matches!(config.validate(), Err(GiftError::InvalidConfig(_))));
        config.sample_rotate_num = 4;
        config.embed_dim = 0;
        assert!(matches!(config.validate(), Err(GiftError::InvalidConfig(_))));
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gift.json");
        fs::write(&path, r#"{"embedder": "GroupMean", "loss_margin": 0.25}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.embedder, "GroupMean");
        assert_eq!(config.loss_margin, 0.25);
    }
}
