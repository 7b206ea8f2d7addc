// projeto: finoexport
// file: src/neural/metrics.rs
// Export fidelity figures and the end-of-run summary

use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::neural::config::{ModelConfig, ModelSize};
use crate::neural::storage::CheckpointLayout;
use crate::neural::utils::{write_atomic, Result};

/// Largest absolute difference between one graph output and the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDiff {
    pub name: String,
    pub shape: Vec<usize>,
    pub max_abs_diff: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelityReport {
    pub batch_size: usize,
    pub diffs: Vec<OutputDiff>,
}

impl FidelityReport {
    pub fn max_abs_diff(&self) -> f32 {
        self.diffs
            .iter()
            .map(|d| d.max_abs_diff)
            .fold(0.0, f32::max)
    }

    /// NaN never counts as within tolerance.
    pub fn within(&self, tolerance: f32) -> bool {
        self.diffs.iter().all(|d| d.max_abs_diff <= tolerance)
    }
}

/// Browser-side model description written next to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserModelConfig {
    pub sequence_length: usize,
    pub forecast_horizon: usize,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub vocab_sizes: BrowserVocabSizes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserVocabSizes {
    pub categories: usize,
    pub merchants: usize,
}

impl From<&ModelConfig> for BrowserModelConfig {
    fn from(config: &ModelConfig) -> Self {
        Self {
            sequence_length: config.sequence_length,
            forecast_horizon: config.forecast_horizon,
            embedding_dim: config.embedding_dim,
            hidden_dim: config.hidden_dim,
            num_layers: config.num_layers,
            vocab_sizes: BrowserVocabSizes {
                categories: config.category_vocab_size,
                merchants: config.merchant_vocab_size,
            },
        }
    }
}

/// Writes `<output_dir>/fin-o-<size>.config.json` describing the exported graph.
pub fn write_browser_config(config: &ModelConfig, size: ModelSize, output_dir: &Path) -> Result<PathBuf> {
    let path = output_dir.join(size.sidecar_file_name());
    let bytes = serde_json::to_vec_pretty(&BrowserModelConfig::from(config))?;
    write_atomic(&path, &bytes)?;
    info!("💾 [Export] Model config written to {}", path.display());
    Ok(path)
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub model_size: ModelSize,
    pub config: ModelConfig,
    pub weights: CheckpointLayout,
    pub num_parameters: usize,
    pub artifacts: Vec<PathBuf>,
    pub fidelity: Vec<FidelityReport>,
    pub elapsed_secs: f64,
}

impl ExportSummary {
    pub fn print(&self) {
        println!("📈 [Export] Summary:");
        println!("   ├── Model: {}", self.model_size);
        println!("   ├── Weights: {:?}", self.weights);
        println!(
            "   ├── Architecture: hidden {} | layers {} | embedding {}",
            self.config.hidden_dim, self.config.num_layers, self.config.embedding_dim
        );
        println!(
            "   ├── Vocabulary: {} categories | {} merchants",
            self.config.category_vocab_size, self.config.merchant_vocab_size
        );
        println!("   ├── Parameters: {}", self.num_parameters);
        if self.fidelity.is_empty() {
            println!("   ├── Fidelity: not verified");
        }
        for report in &self.fidelity {
            println!(
                "   ├── Fidelity (batch {}): max abs diff {:.3e}",
                report.batch_size,
                report.max_abs_diff()
            );
        }
        for artifact in &self.artifacts {
            println!("   ├── Wrote: {}", artifact.display());
        }
        println!("   └── Elapsed: {:.2}s", self.elapsed_secs);
    }
}
