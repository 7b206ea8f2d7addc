// projeto: finoexport
// file: src/neural/data.rs
// Vocabulary and scaler artifacts, plus synthetic export inputs

use candle_core::{DType, Device, Tensor};
use log::{debug, info, warn};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::neural::config::{
    MissingFilePolicy, ModelConfig, VocabSizes, CATEGORY_SLOT, CONTINUOUS_FEATURES,
    INPUT_FEATURES, MERCHANT_SLOT, TARGET_CATEGORY_SLOT, TARGET_FEATURES, TARGET_MERCHANT_SLOT,
};
use crate::neural::utils::{require_file, write_atomic, ExportError, Result};

pub const SCALER_FILE_NAME: &str = "scaler.json";
pub const VOCAB_FILE_NAME: &str = "vocab.json";

/// Samples the lenient default scaler claims to have seen.
pub const DEFAULT_SAMPLES_SEEN: u64 = 1000;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// A validated vocabulary file, kept as the exact bytes it was read from.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    sizes: VocabSizes,
    raw: Vec<u8>,
}

fn entry_size(doc: &Value, key: &str) -> Result<usize> {
    match doc.get(key) {
        Some(Value::Array(items)) => Ok(items.len()),
        Some(Value::Object(map)) => {
            let mut seen = HashSet::with_capacity(map.len());
            for (label, index) in map {
                let index = index
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| {
                        ExportError::Vocabulary(format!(
                            "{}['{}'] is not a non-negative integer index",
                            key, label
                        ))
                    })?;
                if index >= map.len() {
                    return Err(ExportError::Vocabulary(format!(
                        "{}['{}'] = {} is out of range for {} entries",
                        key,
                        label,
                        index,
                        map.len()
                    )));
                }
                if !seen.insert(index) {
                    return Err(ExportError::Vocabulary(format!(
                        "{} index {} is assigned to more than one label",
                        key, index
                    )));
                }
            }
            Ok(map.len())
        }
        Some(_) => Err(ExportError::Vocabulary(format!(
            "'{}' must be an array or a label-to-index object",
            key
        ))),
        None => Err(ExportError::Vocabulary(format!("missing '{}' entry", key))),
    }
}

impl Vocabulary {
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let doc: Value = serde_json::from_slice(&raw)?;
        if !doc.is_object() {
            return Err(ExportError::Vocabulary(
                "expected a JSON object with 'categories' and 'merchants'".to_string(),
            ));
        }
        let sizes = VocabSizes {
            categories: entry_size(&doc, "categories")?,
            merchants: entry_size(&doc, "merchants")?,
        };
        if sizes.categories == 0 || sizes.merchants == 0 {
            return Err(ExportError::Vocabulary(format!(
                "empty vocabulary ({} categories, {} merchants)",
                sizes.categories, sizes.merchants
            )));
        }
        Ok(Self { sizes, raw })
    }

    pub fn read(path: &Path) -> Result<Self> {
        require_file("Vocabulary", path)?;
        let vocab = Self::parse(fs::read(path)?)?;
        debug!(
            "🔍 [Vocab] {} categories, {} merchants in {}",
            vocab.sizes.categories,
            vocab.sizes.merchants,
            path.display()
        );
        Ok(vocab)
    }

    pub fn sizes(&self) -> VocabSizes {
        self.sizes
    }

    /// Counts must equal the embedding table row counts.
    pub fn check_against(&self, expected: VocabSizes) -> Result<()> {
        if self.sizes != expected {
            return Err(ExportError::Vocabulary(format!(
                "vocabulary has {} categories / {} merchants but the model embeds {} / {}",
                self.sizes.categories, self.sizes.merchants, expected.categories, expected.merchants
            )));
        }
        Ok(())
    }

    /// Copies the original bytes to `<output_dir>/vocab.json`.
    pub fn write_to(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(VOCAB_FILE_NAME);
        write_atomic(&path, &self.raw)?;
        info!("💾 [Vocab] Vocabulary copied to {}", path.display());
        Ok(path)
    }
}

/// Reads the vocabulary; when absent, `Strict` fails and `Lenient` yields `None`.
pub fn read_vocabulary(path: &Path, policy: MissingFilePolicy) -> Result<Option<Vocabulary>> {
    match Vocabulary::read(path) {
        Ok(vocab) => Ok(Some(vocab)),
        Err(e) if e.is_missing_file() && policy == MissingFilePolicy::Lenient => {
            warn!(
                "⚠️ [Vocab] Vocabulary file not found at {}, it will not be exported",
                path.display()
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

/// Fitted standardization parameters in the browser-facing JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalerParams {
    #[serde(rename = "scale_")]
    pub scale: Vec<f64>,
    #[serde(rename = "mean_")]
    pub mean: Vec<f64>,
    #[serde(rename = "var_")]
    pub var: Vec<f64>,
    #[serde(rename = "n_samples_seen_")]
    pub n_samples_seen: u64,
}

/// Attribute dump of a fitted scaler. The sample count may be a scalar or
/// one entry per feature.
#[derive(Debug, Deserialize)]
struct ScalerSource {
    #[serde(rename = "scale_")]
    scale: Vec<f64>,
    #[serde(rename = "mean_")]
    mean: Vec<f64>,
    #[serde(rename = "var_")]
    var: Vec<f64>,
    #[serde(rename = "n_samples_seen_")]
    n_samples_seen: Value,
}

fn sample_count(values: &[f64]) -> Result<u64> {
    let first = *values
        .first()
        .ok_or_else(|| ExportError::Scaler("n_samples_seen_ is empty".to_string()))?;
    if values.iter().any(|&v| v != first) {
        return Err(ExportError::Scaler(
            "n_samples_seen_ differs between features".to_string(),
        ));
    }
    if !first.is_finite() || first < 0.0 || first.fract() != 0.0 {
        return Err(ExportError::Scaler(format!(
            "n_samples_seen_ must be a non-negative integer, got {}",
            first
        )));
    }
    Ok(first as u64)
}

impl ScalerParams {
    /// Neutral scaler: identity transform over every continuous feature.
    pub fn neutral() -> Self {
        Self {
            scale: vec![1.0; CONTINUOUS_FEATURES],
            mean: vec![0.0; CONTINUOUS_FEATURES],
            var: vec![1.0; CONTINUOUS_FEATURES],
            n_samples_seen: DEFAULT_SAMPLES_SEEN,
        }
    }

    fn from_json(bytes: &[u8]) -> Result<Self> {
        let source: ScalerSource = serde_json::from_slice(bytes)?;
        let counts: Vec<f64> = match &source.n_samples_seen {
            Value::Number(n) => n.as_f64().into_iter().collect(),
            Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
            other => {
                return Err(ExportError::Scaler(format!(
                    "n_samples_seen_ must be a number, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            scale: source.scale,
            mean: source.mean,
            var: source.var,
            n_samples_seen: sample_count(&counts)?,
        })
    }

    fn from_safetensors(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let vector = |name: &str| -> Result<Vec<f64>> {
            let t = tensors
                .get(name)
                .ok_or_else(|| ExportError::Scaler(format!("tensor '{}' not found", name)))?;
            Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
        };
        Ok(Self {
            scale: vector("scale_")?,
            mean: vector("mean_")?,
            var: vector("var_")?,
            n_samples_seen: sample_count(&vector("n_samples_seen_")?)?,
        })
    }

    /// Reads a JSON or safetensors dump of a fitted scaler.
    pub fn read(path: &Path) -> Result<Self> {
        require_file("Scaler", path)?;
        let is_safetensors = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        let params = if is_safetensors {
            Self::from_safetensors(path)?
        } else {
            Self::from_json(&fs::read(path)?)?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, values) in [("scale_", &self.scale), ("mean_", &self.mean), ("var_", &self.var)] {
            if values.len() != CONTINUOUS_FEATURES {
                return Err(ExportError::Scaler(format!(
                    "{} has {} entries, expected {}",
                    name,
                    values.len(),
                    CONTINUOUS_FEATURES
                )));
            }
            if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                return Err(ExportError::Scaler(format!(
                    "{}[{}] is not a finite number",
                    name, pos
                )));
            }
        }
        if self.var.iter().any(|&v| v < 0.0) {
            return Err(ExportError::Scaler("var_ has a negative entry".to_string()));
        }
        Ok(())
    }

    pub fn write_to(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(SCALER_FILE_NAME);
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &bytes)?;
        info!(
            "💾 [Scaler] Scaler ({} features, {} samples) written to {}",
            self.scale.len(),
            self.n_samples_seen,
            path.display()
        );
        Ok(path)
    }
}

/// Reads the scaler at `path`. A missing source fails under `Strict`; under
/// `Lenient` the neutral scaler is returned instead.
pub fn load_scaler(path: &Path, policy: MissingFilePolicy) -> Result<ScalerParams> {
    match ScalerParams::read(path) {
        Ok(params) => Ok(params),
        Err(e) if e.is_missing_file() && policy == MissingFilePolicy::Lenient => {
            warn!(
                "⚠️ [Scaler] Scaler not found at {}, using neutral defaults",
                path.display()
            );
            Ok(ScalerParams::neutral())
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Synthetic inputs
// ---------------------------------------------------------------------------

/// One input window and its target horizon.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// `[batch, sequence_length, 14]`
    pub input: Tensor,
    /// `[batch, forecast_horizon, 4]`
    pub target: Tensor,
}

impl SampleBatch {
    pub fn batch_size(&self) -> usize {
        self.input.dims().first().copied().unwrap_or(0)
    }
}

fn frame_value<R: Rng + ?Sized>(slot: usize, id_slots: (usize, usize), vocab: VocabSizes, rng: &mut R) -> f32 {
    if slot == id_slots.0 {
        rng.random_range(0..vocab.categories) as f32
    } else if slot == id_slots.1 {
        rng.random_range(0..vocab.merchants) as f32
    } else {
        rng.sample(StandardNormal)
    }
}

/// Continuous slots are standard normal; id slots are uniform within the
/// vocabulary bounds.
pub fn synthetic_batch<R: Rng + ?Sized>(
    config: &ModelConfig,
    batch: usize,
    rng: &mut R,
    device: &Device,
) -> Result<SampleBatch> {
    if batch == 0 {
        return Err(ExportError::Config("batch size must be at least 1".to_string()));
    }
    let vocab = config.vocab_sizes();

    let input: Vec<f32> = (0..batch * config.sequence_length * INPUT_FEATURES)
        .map(|i| frame_value(i % INPUT_FEATURES, (CATEGORY_SLOT, MERCHANT_SLOT), vocab, rng))
        .collect();
    let target: Vec<f32> = (0..batch * config.forecast_horizon * TARGET_FEATURES)
        .map(|i| {
            frame_value(
                i % TARGET_FEATURES,
                (TARGET_CATEGORY_SLOT, TARGET_MERCHANT_SLOT),
                vocab,
                rng,
            )
        })
        .collect();

    Ok(SampleBatch {
        input: Tensor::from_vec(input, (batch, config.sequence_length, INPUT_FEATURES), device)?,
        target: Tensor::from_vec(
            target,
            (batch, config.forecast_horizon, TARGET_FEATURES),
            device,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::config::tiny_config;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn fitted_scaler_json() -> String {
        serde_json::json!({
            "scale_": vec![2.0; 12],
            "mean_": vec![1.0; 12],
            "var_": vec![4.0; 12],
            "n_samples_seen_": 500
        })
        .to_string()
    }

    #[test]
    fn test_scaler_export_reproduces_fitted_values() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("scaler_src.json");
        fs::write(&src, fitted_scaler_json()).unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let params = load_scaler(&src, MissingFilePolicy::Strict).unwrap();
        let path = params.write_to(&out).unwrap();
        let doc: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(doc["scale_"], serde_json::json!(vec![2.0; 12]));
        assert_eq!(doc["mean_"], serde_json::json!(vec![1.0; 12]));
        assert_eq!(doc["var_"], serde_json::json!(vec![4.0; 12]));
        assert_eq!(doc["n_samples_seen_"], serde_json::json!(500));
    }

    #[test]
    fn test_scaler_from_safetensors() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("scaler.safetensors");
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("scale_", Tensor::full(2f64, 12, &device).unwrap());
        tensors.insert("mean_", Tensor::full(1f64, 12, &device).unwrap());
        tensors.insert("var_", Tensor::full(4f64, 12, &device).unwrap());
        tensors.insert("n_samples_seen_", Tensor::new(&[500i64], &device).unwrap());
        candle_core::safetensors::save(&tensors, &src).unwrap();

        let params = ScalerParams::read(&src).unwrap();
        assert_eq!(params.scale, vec![2.0; 12]);
        assert_eq!(params.var, vec![4.0; 12]);
        assert_eq!(params.n_samples_seen, 500);
    }

    #[test]
    fn test_missing_scaler_strict_fails_without_output() {
        let dir = tempdir().unwrap();
        let err = load_scaler(&dir.path().join("absent.json"), MissingFilePolicy::Strict)
            .unwrap_err();
        assert!(err.is_missing_file());
        assert!(!dir.path().join(SCALER_FILE_NAME).exists());
    }

    #[test]
    fn test_missing_scaler_lenient_writes_neutral_default() {
        let dir = tempdir().unwrap();
        let params =
            load_scaler(&dir.path().join("absent.json"), MissingFilePolicy::Lenient).unwrap();
        let path = params.write_to(dir.path()).unwrap();
        let doc: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        for (key, value) in [("scale_", 1.0), ("mean_", 0.0), ("var_", 1.0)] {
            let values = doc[key].as_array().unwrap();
            assert_eq!(values.len(), 12);
            assert!(values.iter().all(|v| v.as_f64() == Some(value)));
        }
        assert_eq!(doc["n_samples_seen_"], serde_json::json!(1000));
    }

    #[test]
    fn test_scaler_wrong_length_rejected() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("scaler.json");
        let doc = serde_json::json!({
            "scale_": vec![1.0; 11],
            "mean_": vec![0.0; 11],
            "var_": vec![1.0; 11],
            "n_samples_seen_": [10, 10]
        });
        fs::write(&src, doc.to_string()).unwrap();
        let err = ScalerParams::read(&src).unwrap_err();
        assert!(matches!(err, ExportError::Scaler(_)));
    }

    #[test]
    fn test_per_feature_sample_counts() {
        assert_eq!(sample_count(&[7.0, 7.0]).unwrap(), 7);
        assert!(sample_count(&[7.0, 8.0]).is_err());
        assert!(sample_count(&[2.5]).is_err());
    }

    #[test]
    fn test_vocab_copy_is_byte_identical() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("vocab_src.json");
        // Unusual formatting must survive the copy
        let text = "{\"categories\": [\"food\",\"rent\"],\n  \"merchants\":{\"acme\":1, \"shop\":0, \"cafe\":2}}";
        fs::write(&src, text).unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let expected = VocabSizes { categories: 2, merchants: 3 };
        let vocab = read_vocabulary(&src, MissingFilePolicy::Strict).unwrap().unwrap();
        vocab.check_against(expected).unwrap();
        let path = vocab.write_to(&out).unwrap();
        assert_eq!(fs::read(path).unwrap(), text.as_bytes());
    }

    #[test]
    fn test_missing_vocab_strict_fails_without_output() {
        let dir = tempdir().unwrap();
        let err = read_vocabulary(&dir.path().join("absent.json"), MissingFilePolicy::Strict)
            .unwrap_err();
        assert!(err.is_missing_file());
        assert!(!dir.path().join(VOCAB_FILE_NAME).exists());

        let skipped =
            read_vocabulary(&dir.path().join("absent.json"), MissingFilePolicy::Lenient).unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn test_vocab_validation() {
        assert!(Vocabulary::parse(b"[1, 2]".to_vec()).is_err());
        assert!(Vocabulary::parse(b"{\"categories\": [\"a\"]}".to_vec()).is_err());
        assert!(Vocabulary::parse(b"{\"categories\": [], \"merchants\": [\"m\"]}".to_vec()).is_err());
        // Duplicate and out-of-range indices
        assert!(Vocabulary::parse(
            b"{\"categories\": {\"a\": 0, \"b\": 0}, \"merchants\": [\"m\"]}".to_vec()
        )
        .is_err());
        assert!(Vocabulary::parse(
            b"{\"categories\": {\"a\": 0, \"b\": 2}, \"merchants\": [\"m\"]}".to_vec()
        )
        .is_err());

        let vocab = Vocabulary::parse(
            b"{\"categories\": [\"a\", \"b\", \"c\"], \"merchants\": [\"m\"]}".to_vec(),
        )
        .unwrap();
        assert_eq!(vocab.sizes(), VocabSizes { categories: 3, merchants: 1 });
        assert!(vocab.check_against(VocabSizes { categories: 3, merchants: 2 }).is_err());
    }

    #[test]
    fn test_synthetic_batch_bounds() {
        let config = tiny_config();
        let mut rng = StdRng::seed_from_u64(42);
        let batch = synthetic_batch(&config, 3, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(batch.input.dims(), &[3, 8, 14]);
        assert_eq!(batch.target.dims(), &[3, 3, 4]);
        assert_eq!(batch.batch_size(), 3);

        let input = batch.input.to_vec3::<f32>().unwrap();
        for frame in input.iter().flatten() {
            let cat = frame[CATEGORY_SLOT];
            let merchant = frame[MERCHANT_SLOT];
            assert!(cat >= 0.0 && cat < 5.0 && cat.fract() == 0.0);
            assert!(merchant >= 0.0 && merchant < 7.0 && merchant.fract() == 0.0);
        }
        let target = batch.target.to_vec3::<f32>().unwrap();
        for frame in target.iter().flatten() {
            assert!(frame[TARGET_CATEGORY_SLOT] < 5.0);
            assert!(frame[TARGET_MERCHANT_SLOT] < 7.0);
        }
    }

    #[test]
    fn test_synthetic_batch_is_seeded() {
        let config = tiny_config();
        let a = synthetic_batch(&config, 1, &mut StdRng::seed_from_u64(5), &Device::Cpu).unwrap();
        let b = synthetic_batch(&config, 1, &mut StdRng::seed_from_u64(5), &Device::Cpu).unwrap();
        assert_eq!(a.input.to_vec3::<f32>().unwrap(), b.input.to_vec3::<f32>().unwrap());
    }
}
