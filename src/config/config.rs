use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DynamicsError, DynamicsResult};

/// Architecture of the encoder, world model and IDM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Side length of the square input image in pixels
    pub image_size: usize,
    /// Side length of one square patch in pixels
    pub patch_size: usize,
    pub in_channels: usize,
    /// Per-patch embedding width of the vision encoder
    pub embed_dim: usize,
    /// Number of encoder blocks, i.e. the depth of the layerwise latent state
    pub encoder_depth: usize,
    pub encoder_heads: usize,
    /// Width of one latent action token
    pub action_dim: usize,
    /// Cross-attention layers in the forward dynamics decoder
    pub wm_depth: usize,
    pub idm_decoder_layers: usize,
    pub idm_dropout: f32,
    /// Fraction of "after" patches kept during IDM training
    pub top_pct: f64,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub num_eval_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 64,
            patch_size: 8,
            in_channels: 3,
            embed_dim: 128,
            encoder_depth: 3,
            encoder_heads: 4,
            action_dim: 128,
            wm_depth: 1,
            idm_decoder_layers: 1,
            idm_dropout: 0.1,
            top_pct: 0.1,
            min_tokens: 2,
            max_tokens: 10,
            num_eval_tokens: 10,
        }
    }
}

impl ModelConfig {
    /// Tiny configuration for unit tests.
    pub fn test() -> Self {
        Self {
            image_size: 16,
            patch_size: 4,
            in_channels: 3,
            embed_dim: 16,
            encoder_depth: 2,
            encoder_heads: 2,
            action_dim: 8,
            wm_depth: 1,
            idm_decoder_layers: 1,
            idm_dropout: 0.0,
            top_pct: 0.25,
            min_tokens: 1,
            max_tokens: 3,
            num_eval_tokens: 3,
        }
    }

    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// Width of the flattened layerwise state the world model decodes: depth * embed_dim.
    pub fn wm_model_dim(&self) -> usize {
        self.encoder_depth * self.embed_dim
    }

    /// Width of the interleaved before/after context the IDM decodes: 2 * depth * embed_dim.
    pub fn idm_context_dim(&self) -> usize {
        2 * self.encoder_depth * self.embed_dim
    }

    /// Number of "after" patches retained per sample during training.
    pub fn keep_count(&self) -> usize {
        ((self.num_patches() as f64 * self.top_pct).floor() as usize).max(1)
    }

    /// Reject configurations that would fail deep inside a forward pass.
    pub fn validate(&self) -> DynamicsResult<()> {
        if self.patch_size == 0 || self.image_size == 0 {
            return Err(DynamicsError::invalid_config(
                "image_size and patch_size must be positive",
            ));
        }
        if self.image_size % self.patch_size != 0 {
            return Err(DynamicsError::invalid_config(format!(
                "image_size {} is not divisible by patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.embed_dim == 0 || self.embed_dim % 2 != 0 {
            return Err(DynamicsError::invalid_config(format!(
                "embed_dim {} must be even for sine/cosine position encoding",
                self.embed_dim
            )));
        }
        // Row and column halves each split again into sin and cos.
        if self.embed_dim % 4 != 0 {
            return Err(DynamicsError::invalid_config(format!(
                "embed_dim {} must be divisible by 4 so each grid axis gets an even sin/cos half",
                self.embed_dim
            )));
        }
        if self.encoder_heads == 0 || self.embed_dim % self.encoder_heads != 0 {
            return Err(DynamicsError::invalid_config(format!(
                "embed_dim {} is not divisible by encoder_heads {}",
                self.embed_dim, self.encoder_heads
            )));
        }
        if self.encoder_depth == 0 {
            return Err(DynamicsError::invalid_config("encoder_depth must be at least 1"));
        }
        if self.in_channels == 0 || self.action_dim == 0 {
            return Err(DynamicsError::invalid_config(
                "in_channels and action_dim must be positive",
            ));
        }
        if self.wm_depth == 0 || self.idm_decoder_layers == 0 {
            return Err(DynamicsError::invalid_config(
                "wm_depth and idm_decoder_layers must be at least 1",
            ));
        }
        if !(self.top_pct > 0.0 && self.top_pct <= 1.0) {
            return Err(DynamicsError::invalid_config(format!(
                "top_pct {} must be in (0, 1]",
                self.top_pct
            )));
        }
        if !(0.0..1.0).contains(&self.idm_dropout) {
            return Err(DynamicsError::invalid_config(format!(
                "idm_dropout {} must be in [0, 1)",
                self.idm_dropout
            )));
        }
        if self.min_tokens == 0 || self.min_tokens > self.max_tokens {
            return Err(DynamicsError::invalid_config(format!(
                "token bounds [{}, {}] must satisfy 1 <= min_tokens <= max_tokens",
                self.min_tokens, self.max_tokens
            )));
        }
        if self.num_eval_tokens == 0 {
            return Err(DynamicsError::invalid_config("num_eval_tokens must be at least 1"));
        }
        Ok(())
    }
}

/// Optimizer, schedule and bookkeeping for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub steps: usize,
    pub batch_size: usize,
    pub initial_lr: f64,
    pub peak_lr: f64,
    pub final_lr: f64,
    pub weight_decay: f64,
    pub ema_momentum: f64,
    pub log_every: usize,
    /// Save a checkpoint every N steps; 0 saves only at the end
    pub save_every: usize,
    pub seed: Option<u64>,
    pub out_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            steps: 10_000,
            batch_size: 32,
            initial_lr: 1e-7,
            peak_lr: 1e-4,
            final_lr: 3e-5,
            weight_decay: 0.0,
            ema_momentum: 0.99,
            log_every: 250,
            save_every: 0,
            seed: None,
            out_dir: PathBuf::from("runs/latest"),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> DynamicsResult<()> {
        if self.batch_size == 0 {
            return Err(DynamicsError::invalid_config("batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.ema_momentum) {
            return Err(DynamicsError::invalid_config(format!(
                "ema_momentum {} must be in [0, 1]",
                self.ema_momentum
            )));
        }
        if self.initial_lr <= 0.0 || self.peak_lr <= 0.0 || self.final_lr < 0.0 {
            return Err(DynamicsError::invalid_config(format!(
                "initial_lr ({}) and peak_lr ({}) must be positive and final_lr ({}) non-negative",
                self.initial_lr, self.peak_lr, self.final_lr
            )));
        }
        Ok(())
    }
}

/// Where training transitions come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DataSource {
    /// Procedurally rendered moving squares
    Synthetic,
    /// Safetensors file holding an `obs` tensor of shape [N, T, C, H, W]
    Safetensors { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub source: DataSource,
    /// Frames per synthetic sample; the last two form the transition
    pub frames_per_sample: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSource::Synthetic,
            frames_per_sample: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> DynamicsResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> DynamicsResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> DynamicsResult<()> {
        self.model.validate()?;
        self.train.validate()?;
        if self.data.frames_per_sample < 2 {
            return Err(DynamicsError::invalid_config(
                "frames_per_sample must be at least 2 (before and after)",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.model.num_patches(), 64);
        assert_eq!(config.model.wm_model_dim(), 384);
        assert_eq!(config.model.idm_context_dim(), 768);
        assert_eq!(config.model.keep_count(), 6);
    }

    #[test]
    fn test_keep_count_has_floor_of_one() {
        let mut config = ModelConfig::test();
        config.top_pct = 0.01;
        assert_eq!(config.keep_count(), 1);

        let config = ModelConfig {
            image_size: 100,
            patch_size: 10,
            top_pct: 0.1,
            ..ModelConfig::default()
        };
        assert_eq!(config.num_patches(), 100);
        assert_eq!(config.keep_count(), 10);
    }

    #[test]
    fn test_invalid_dimensions_rejected() {
        let odd = ModelConfig {
            embed_dim: 127,
            ..ModelConfig::default()
        };
        assert!(matches!(odd.validate(), Err(DynamicsError::InvalidConfig(_))));

        let not_quad = ModelConfig {
            embed_dim: 130,
            encoder_heads: 2,
            ..ModelConfig::default()
        };
        assert!(not_quad.validate().is_err());

        let heads = ModelConfig {
            embed_dim: 128,
            encoder_heads: 3,
            ..ModelConfig::default()
        };
        assert!(heads.validate().is_err());

        let patches = ModelConfig {
            image_size: 60,
            patch_size: 8,
            ..ModelConfig::default()
        };
        assert!(patches.validate().is_err());
    }

    #[test]
    fn test_invalid_token_bounds_rejected() {
        let config = ModelConfig {
            min_tokens: 5,
            max_tokens: 2,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ModelConfig {
            top_pct: 0.0,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_learning_rate_bounds() {
        let zero_floor = TrainConfig {
            final_lr: 0.0,
            ..TrainConfig::default()
        };
        zero_floor.validate().unwrap();

        let negative_floor = TrainConfig {
            final_lr: -1e-5,
            ..TrainConfig::default()
        };
        let err = negative_floor.validate().unwrap_err().to_string();
        assert!(err.contains("final_lr") && err.contains("non-negative"));

        let zero_peak = TrainConfig {
            peak_lr: 0.0,
            ..TrainConfig::default()
        };
        let err = zero_peak.validate().unwrap_err().to_string();
        assert!(err.contains("peak_lr") && err.contains("must be positive"));
    }

    #[test]
    fn test_json_roundtrip_with_partial_file() {
        let text = r#"{ "model": { "embed_dim": 64 }, "train": { "steps": 5, "seed": 7 } }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert_eq!(config.model.embed_dim, 64);
        assert_eq!(config.model.patch_size, 8);
        assert_eq!(config.train.steps, 5);
        assert_eq!(config.train.seed, Some(7));
        assert_eq!(config.data.source, DataSource::Synthetic);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }
}
