// projeto: finoexport
// file: src/neural/config.rs
// Model architecture table, export policies and TOML configuration

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::neural::utils::{require_file, ExportError, Result};

/// Numeric slots of one input frame.
pub const INPUT_FEATURES: usize = 14;
/// Numeric slots of one target frame (amount, category, merchant, time index).
pub const TARGET_FEATURES: usize = 4;
/// Input slots holding continuous features; 2 and 3 are the category/merchant ids.
pub const NUMERIC_SLOTS: [usize; 12] = [0, 1, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
pub const CONTINUOUS_FEATURES: usize = NUMERIC_SLOTS.len();
pub const CATEGORY_SLOT: usize = 2;
pub const MERCHANT_SLOT: usize = 3;

pub const TARGET_AMOUNT_SLOT: usize = 0;
pub const TARGET_CATEGORY_SLOT: usize = 1;
pub const TARGET_MERCHANT_SLOT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Small,
    Large,
}

impl ModelSize {
    pub fn tag(&self) -> &'static str {
        match self {
            ModelSize::Small => "small",
            ModelSize::Large => "large",
        }
    }

    /// `fin-o-<tag>.onnx`
    pub fn graph_file_name(&self) -> String {
        format!("fin-o-{}.onnx", self.tag())
    }

    pub fn sidecar_file_name(&self) -> String {
        format!("fin-o-{}.config.json", self.tag())
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How the decoder picks its next input frame.
///
/// `ScheduledSampling` reproduces training-time behavior: a uniform draw below
/// `ratio` feeds the true target frame, otherwise the model's own greedy
/// prediction. It branches on data, so it cannot be captured as a static
/// graph; every export uses `TeacherForced`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodingPolicy {
    TeacherForced,
    ScheduledSampling { ratio: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingFilePolicy {
    /// Missing checkpoint, scaler or vocabulary aborts the run.
    Strict,
    /// Missing files are logged; defaults are substituted or the file skipped.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitectureSource {
    /// Hidden width, depth and embedding width are read from tensor shapes.
    Checkpoint,
    /// The size table is authoritative; any difference is a mismatch.
    Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabSizes {
    pub categories: usize,
    pub merchants: usize,
}

/// One fully resolved architecture, shared by the model, the loader and the
/// graph exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub category_vocab_size: usize,
    pub merchant_vocab_size: usize,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub dropout: f64,
    pub sequence_length: usize,
    pub forecast_horizon: usize,
}

impl ModelConfig {
    pub fn vocab_sizes(&self) -> VocabSizes {
        VocabSizes {
            categories: self.category_vocab_size,
            merchants: self.merchant_vocab_size,
        }
    }

    pub fn encoder_input_dim(&self) -> usize {
        CONTINUOUS_FEATURES + 2 * self.embedding_dim
    }

    pub fn decoder_input_dim(&self) -> usize {
        1 + 2 * self.embedding_dim
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("category_vocab_size", self.category_vocab_size),
            ("merchant_vocab_size", self.merchant_vocab_size),
            ("embedding_dim", self.embedding_dim),
            ("hidden_dim", self.hidden_dim),
            ("num_layers", self.num_layers),
            ("sequence_length", self.sequence_length),
            ("forecast_horizon", self.forecast_horizon),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(ExportError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ExportError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeProfile {
    pub hidden_dim: usize,
    pub num_layers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTable {
    pub embedding_dim: usize,
    pub dropout: f64,
    pub sequence_length: usize,
    pub forecast_horizon: usize,
    pub small: SizeProfile,
    pub large: SizeProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub missing_files: MissingFilePolicy,
    pub architecture: ArchitectureSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphExportConfig {
    pub opset_version: i64,
    pub verify: bool,
    pub tolerance: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub model: ModelTable,
    pub policy: PolicyConfig,
    pub export: GraphExportConfig,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model: ModelTable {
                embedding_dim: 128,
                dropout: 0.2,
                sequence_length: 50,
                forecast_horizon: 10,
                small: SizeProfile {
                    hidden_dim: 256,
                    num_layers: 2,
                },
                large: SizeProfile {
                    hidden_dim: 512,
                    num_layers: 4,
                },
            },
            policy: PolicyConfig {
                missing_files: MissingFilePolicy::Strict,
                architecture: ArchitectureSource::Checkpoint,
            },
            export: GraphExportConfig {
                opset_version: 11,
                verify: true,
                tolerance: 1e-4,
                seed: 42,
            },
        }
    }
}

impl ExportConfig {
    /// Reads the TOML file when given; no path means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        require_file("Config", path)?;
        let content = fs::read_to_string(path)?;
        let config: ExportConfig = toml::from_str(&content)?;
        info!("⚙️ [Config] Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("💾 [Config] Configuration written to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.export.opset_version < 7 {
            return Err(ExportError::Config(format!(
                "opset_version {} has no LSTM operator (need >= 7)",
                self.export.opset_version
            )));
        }
        if !(self.export.tolerance > 0.0) {
            return Err(ExportError::Config("tolerance must be positive".to_string()));
        }
        self.model_config(ModelSize::Small, VocabSizes { categories: 1, merchants: 1 })
            .validate()?;
        self.model_config(ModelSize::Large, VocabSizes { categories: 1, merchants: 1 })
            .validate()
    }

    pub fn profile(&self, size: ModelSize) -> SizeProfile {
        match size {
            ModelSize::Small => self.model.small,
            ModelSize::Large => self.model.large,
        }
    }

    /// Architecture from the size table with the given vocabulary sizes.
    pub fn model_config(&self, size: ModelSize, vocab: VocabSizes) -> ModelConfig {
        let profile = self.profile(size);
        ModelConfig {
            category_vocab_size: vocab.categories,
            merchant_vocab_size: vocab.merchants,
            embedding_dim: self.model.embedding_dim,
            hidden_dim: profile.hidden_dim,
            num_layers: profile.num_layers,
            dropout: self.model.dropout,
            sequence_length: self.model.sequence_length,
            forecast_horizon: self.model.forecast_horizon,
        }
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> ModelConfig {
    ModelConfig {
        category_vocab_size: 5,
        merchant_vocab_size: 7,
        embedding_dim: 4,
        hidden_dim: 6,
        num_layers: 2,
        dropout: 0.2,
        sequence_length: 8,
        forecast_horizon: 3,
    }
}
