// projeto: finoexport
// file: src/neural/storage.rs
// Checkpoint loading, architecture inference and parameter validation

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::neural::config::{
    ArchitectureSource, DecodingPolicy, ModelConfig, VocabSizes, CONTINUOUS_FEATURES,
};
use crate::neural::model::Seq2Seq;
use crate::neural::utils::{require_file, ExportError, Result};

/// Key under which wrapped checkpoints nest their parameter mapping.
pub const STATE_DICT_KEY: &str = "state_dict";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLayout {
    /// The file is the parameter mapping itself.
    Bare,
    /// Parameters sit under `state_dict` next to other training state.
    Wrapped,
    /// Freshly initialized, never read from disk.
    Random,
}

/// Named parameter tensors in the torch state-dict naming.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    tensors: HashMap<String, Tensor>,
    layout: CheckpointLayout,
}

impl ParameterStore {
    /// Accepts a flat mapping; names prefixed with `state_dict.` are taken as
    /// the nested form and everything else is dropped.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        let prefix = format!("{}.", STATE_DICT_KEY);
        if tensors.keys().any(|name| name.starts_with(&prefix)) {
            let tensors = tensors
                .into_iter()
                .filter_map(|(name, t)| name.strip_prefix(&prefix).map(|n| (n.to_string(), t)))
                .collect();
            Self {
                tensors,
                layout: CheckpointLayout::Wrapped,
            }
        } else {
            Self {
                tensors,
                layout: CheckpointLayout::Bare,
            }
        }
    }

    /// Store with no parameters, to be filled by `load_model_weights`.
    pub fn empty() -> Self {
        Self {
            tensors: HashMap::new(),
            layout: CheckpointLayout::Random,
        }
    }

    /// Declares a model of the given shape with torch-style random init.
    pub fn random(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Seq2Seq::new(config, DecodingPolicy::TeacherForced, vb)?;
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| ExportError::Checkpoint("parameter map lock poisoned".to_string()))?;
        let tensors = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        Ok(Self {
            tensors,
            layout: CheckpointLayout::Random,
        })
    }

    pub fn layout(&self) -> CheckpointLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| ExportError::Checkpoint(format!("parameter '{}' not found", name)))
    }

    pub fn dims(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.get(name)?.dims().to_vec())
    }

    pub fn num_parameters(&self) -> usize {
        self.tensors.values().map(|t| t.elem_count()).sum()
    }

    pub fn var_builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), DType::F32, device)
    }

    pub fn build_model(
        &self,
        config: &ModelConfig,
        policy: DecodingPolicy,
        device: &Device,
    ) -> Result<Seq2Seq> {
        Ok(Seq2Seq::new(config, policy, self.var_builder(device))?)
    }

    /// Writes the bare mapping as safetensors.
    #[cfg(test)]
    pub(crate) fn save_safetensors(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }
}

fn to_store(pairs: Vec<(String, Tensor)>, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::with_capacity(pairs.len());
    for (name, tensor) in pairs {
        let tensor = tensor.to_dtype(DType::F32)?.to_device(device)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

fn read_pth(path: &Path, device: &Device) -> Result<ParameterStore> {
    // The wrapped form is tried first; a bare mapping has no `state_dict` key.
    match candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY)) {
        Ok(pairs) if !pairs.is_empty() => {
            debug!("🔍 [Loader] Found nested '{}' mapping", STATE_DICT_KEY);
            return Ok(ParameterStore {
                tensors: to_store(pairs, device)?,
                layout: CheckpointLayout::Wrapped,
            });
        }
        Ok(_) => debug!("🔍 [Loader] Nested '{}' mapping is empty", STATE_DICT_KEY),
        Err(e) => debug!("🔍 [Loader] No nested '{}' mapping: {}", STATE_DICT_KEY, e),
    }
    let pairs = candle_core::pickle::read_all_with_key(path, None)?;
    Ok(ParameterStore {
        tensors: to_store(pairs, device)?,
        layout: CheckpointLayout::Bare,
    })
}

/// Reads a `.pth`/`.pt` (torch zip pickle) or `.safetensors` checkpoint.
pub fn read_checkpoint(path: &Path, device: &Device) -> Result<ParameterStore> {
    require_file("Checkpoint", path)?;
    let is_safetensors = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));

    let store = if is_safetensors {
        let tensors = candle_core::safetensors::load(path, device)?;
        let pairs = tensors.into_iter().collect();
        ParameterStore::from_tensors(to_store(pairs, device)?)
    } else {
        read_pth(path, device)?
    };

    if store.is_empty() {
        return Err(ExportError::Checkpoint(format!(
            "no parameter tensors found in {}",
            path.display()
        )));
    }
    Ok(store)
}

/// Replaces `store` with the checkpoint at `path` and reports success.
///
/// Never fails: a missing or unreadable checkpoint is logged and `false`
/// returned, leaving `store` untouched. The caller decides whether exporting
/// the untouched parameters is acceptable.
pub fn load_model_weights(path: &Path, store: &mut ParameterStore, device: &Device) -> bool {
    match read_checkpoint(path, device) {
        Ok(loaded) => {
            info!(
                "✅ [Loader] Loaded {} tensors ({:?} layout) from {}",
                loaded.len(),
                loaded.layout(),
                path.display()
            );
            *store = loaded;
            true
        }
        Err(e) if e.is_missing_file() => {
            error!("❌ [Loader] Model file not found: {}", path.display());
            false
        }
        Err(e) => {
            error!("❌ [Loader] Error loading model: {}", e);
            false
        }
    }
}

/// Architecture as recorded by the checkpoint's tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointArchitecture {
    pub vocab: VocabSizes,
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
}

fn matrix_dims(store: &ParameterStore, name: &str) -> Result<(usize, usize)> {
    match store.dims(name)?.as_slice() {
        &[rows, cols] => Ok((rows, cols)),
        other => Err(ExportError::ArchitectureMismatch(format!(
            "{}: expected a matrix, found shape {:?}",
            name, other
        ))),
    }
}

pub fn infer_architecture(store: &ParameterStore) -> Result<CheckpointArchitecture> {
    let (categories, embedding_dim) = matrix_dims(store, "encoder.category_embedding.weight")?;
    let (merchants, merchant_width) = matrix_dims(store, "encoder.merchant_embedding.weight")?;
    if merchant_width != embedding_dim {
        return Err(ExportError::ArchitectureMismatch(format!(
            "category embeddings are {} wide but merchant embeddings are {} wide",
            embedding_dim, merchant_width
        )));
    }
    let (gates, hidden_dim) = matrix_dims(store, "encoder.lstm.weight_hh_l0")?;
    if gates != 4 * hidden_dim {
        return Err(ExportError::ArchitectureMismatch(format!(
            "encoder.lstm.weight_hh_l0 has {} rows, expected 4 x {}",
            gates, hidden_dim
        )));
    }
    let num_layers = (0..)
        .take_while(|l| store.contains(&format!("encoder.lstm.weight_ih_l{}", l)))
        .count();

    let (_, encoder_in) = matrix_dims(store, "encoder.lstm.weight_ih_l0")?;
    if encoder_in != CONTINUOUS_FEATURES + 2 * embedding_dim {
        return Err(ExportError::ArchitectureMismatch(format!(
            "encoder input width is {}, expected {} continuous features + 2 x {} embedding",
            encoder_in, CONTINUOUS_FEATURES, embedding_dim
        )));
    }

    Ok(CheckpointArchitecture {
        vocab: VocabSizes { categories, merchants },
        embedding_dim,
        hidden_dim,
        num_layers,
    })
}

/// Every parameter the declared model owns, with its expected shape.
pub fn expected_parameters(config: &ModelConfig) -> BTreeMap<String, Vec<usize>> {
    let mut expected = BTreeMap::new();
    let h = config.hidden_dim;
    let e = config.embedding_dim;
    let (vc, vm) = (config.category_vocab_size, config.merchant_vocab_size);

    for (module, input_dim) in [
        ("encoder", config.encoder_input_dim()),
        ("decoder", config.decoder_input_dim()),
    ] {
        expected.insert(format!("{}.category_embedding.weight", module), vec![vc, e]);
        expected.insert(format!("{}.merchant_embedding.weight", module), vec![vm, e]);
        for l in 0..config.num_layers {
            let in_dim = if l == 0 { input_dim } else { h };
            expected.insert(format!("{}.lstm.weight_ih_l{}", module, l), vec![4 * h, in_dim]);
            expected.insert(format!("{}.lstm.weight_hh_l{}", module, l), vec![4 * h, h]);
            expected.insert(format!("{}.lstm.bias_ih_l{}", module, l), vec![4 * h]);
            expected.insert(format!("{}.lstm.bias_hh_l{}", module, l), vec![4 * h]);
        }
    }
    for (head, width) in [("fc_amount", 1), ("fc_category", vc), ("fc_merchant", vm)] {
        expected.insert(format!("decoder.{}.weight", head), vec![width, h]);
        expected.insert(format!("decoder.{}.bias", head), vec![width]);
    }
    expected
}

/// Compares every tensor with the declared architecture and reports all
/// differences at once.
pub fn validate_parameters(config: &ModelConfig, store: &ParameterStore) -> Result<()> {
    let expected = expected_parameters(config);
    let mut problems = Vec::new();

    for (name, shape) in &expected {
        match store.tensors.get(name) {
            None => problems.push(format!("  missing {} (expected {:?})", name, shape)),
            Some(t) if t.dims() != shape.as_slice() => problems.push(format!(
                "  {}: expected {:?}, found {:?}",
                name,
                shape,
                t.dims()
            )),
            Some(_) => {}
        }
    }
    let mut unexpected: Vec<&String> = store
        .tensors
        .keys()
        .filter(|name| !expected.contains_key(*name))
        .collect();
    unexpected.sort();
    for name in unexpected {
        problems.push(format!("  unexpected {}", name));
    }

    if problems.is_empty() {
        debug!("🔍 [Loader] All {} parameter shapes match", expected.len());
        Ok(())
    } else {
        Err(ExportError::ArchitectureMismatch(problems.join("\n")))
    }
}

/// Picks the architecture to export. Vocabulary sizes always come from
/// `declared`; with `ArchitectureSource::Checkpoint` the widths and depth
/// follow the checkpoint.
pub fn resolve_architecture(
    declared: &ModelConfig,
    store: &ParameterStore,
    source: ArchitectureSource,
) -> Result<ModelConfig> {
    let mut config = declared.clone();
    if source == ArchitectureSource::Checkpoint && store.layout() != CheckpointLayout::Random {
        let found = infer_architecture(store)?;
        if (found.hidden_dim, found.num_layers, found.embedding_dim)
            != (declared.hidden_dim, declared.num_layers, declared.embedding_dim)
        {
            warn!(
                "⚠️ [Loader] Checkpoint architecture (hidden {}, layers {}, embedding {}) differs from the size table (hidden {}, layers {}, embedding {}); using the checkpoint",
                found.hidden_dim,
                found.num_layers,
                found.embedding_dim,
                declared.hidden_dim,
                declared.num_layers,
                declared.embedding_dim
            );
        }
        config.hidden_dim = found.hidden_dim;
        config.num_layers = found.num_layers;
        config.embedding_dim = found.embedding_dim;
    }
    config.validate()?;
    validate_parameters(&config, store)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::config::tiny_config;
    use tempfile::tempdir;

    fn same_tensors(a: &ParameterStore, b: &ParameterStore) -> bool {
        a.len() == b.len()
            && a.tensors.iter().all(|(name, t)| {
                let other = match b.tensors.get(name) {
                    Some(o) => o,
                    None => return false,
                };
                t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                    == other.flatten_all().unwrap().to_vec1::<f32>().unwrap()
            })
    }

    #[test]
    fn test_random_store_matches_expected_layout() {
        let config = tiny_config();
        let store = ParameterStore::random(&config, &Device::Cpu).unwrap();
        assert_eq!(store.layout(), CheckpointLayout::Random);
        assert_eq!(store.len(), expected_parameters(&config).len());
        validate_parameters(&config, &store).unwrap();
    }

    #[test]
    fn test_bare_and_wrapped_checkpoints_load_identically() {
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let original = ParameterStore::random(&config, &Device::Cpu).unwrap();

        let bare = dir.path().join("bare.safetensors");
        original.save_safetensors(&bare).unwrap();

        let wrapped_path = dir.path().join("wrapped.safetensors");
        let mut wrapped: HashMap<String, Tensor> = original
            .tensors
            .iter()
            .map(|(k, v)| (format!("state_dict.{}", k), v.clone()))
            .collect();
        wrapped.insert("epoch".to_string(), Tensor::new(&[12f32], &Device::Cpu).unwrap());
        candle_core::safetensors::save(&wrapped, &wrapped_path).unwrap();

        let a = read_checkpoint(&bare, &Device::Cpu).unwrap();
        let b = read_checkpoint(&wrapped_path, &Device::Cpu).unwrap();
        assert_eq!(a.layout(), CheckpointLayout::Bare);
        assert_eq!(b.layout(), CheckpointLayout::Wrapped);
        assert!(same_tensors(&a, &b));
        assert!(same_tensors(&a, &original));
        validate_parameters(&config, &b).unwrap();
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[test]
    fn test_bare_and_wrapped_pth_load_identically() {
        // Written by tests/fixtures/make_checkpoints.py in the torch.save zip layout
        let config = tiny_config();
        let bare = read_checkpoint(&fixture("tiny_bare.pt"), &Device::Cpu).unwrap();
        let wrapped = read_checkpoint(&fixture("tiny_wrapped.pt"), &Device::Cpu).unwrap();

        assert_eq!(bare.layout(), CheckpointLayout::Bare);
        assert_eq!(wrapped.layout(), CheckpointLayout::Wrapped);
        assert!(!wrapped.contains("epoch"));
        assert!(same_tensors(&bare, &wrapped));
        validate_parameters(&config, &bare).unwrap();
        validate_parameters(&config, &wrapped).unwrap();

        let found = infer_architecture(&wrapped).unwrap();
        assert_eq!(found.hidden_dim, 6);
        assert_eq!(found.num_layers, 2);
    }

    #[test]
    fn test_pth_values_are_row_major() {
        let store = read_checkpoint(&fixture("tiny_bare.pt"), &Device::Cpu).unwrap();
        let weight = store.get("encoder.lstm.weight_ih_l0").unwrap();
        assert_eq!(weight.dims(), &[24, 20]);
        let values = weight.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (j, v) in values.iter().enumerate() {
            assert_eq!(*v, ((j % 13) as f32 - 6.0) / 64.0, "element {}", j);
        }
        let bias = store.get("decoder.fc_amount.bias").unwrap();
        assert_eq!(bias.to_vec1::<f32>().unwrap(), vec![-6.0 / 64.0]);
    }

    #[test]
    fn test_load_model_weights_reports_missing_file() {
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let mut store = ParameterStore::random(&config, &Device::Cpu).unwrap();
        let ok = load_model_weights(&dir.path().join("absent.pth"), &mut store, &Device::Cpu);
        assert!(!ok);
        assert_eq!(store.layout(), CheckpointLayout::Random);
    }

    #[test]
    fn test_load_model_weights_replaces_store() {
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let trained = ParameterStore::random(&config, &Device::Cpu).unwrap();
        let path = dir.path().join("model.safetensors");
        trained.save_safetensors(&path).unwrap();

        let mut store = ParameterStore::random(&config, &Device::Cpu).unwrap();
        assert!(load_model_weights(&path, &mut store, &Device::Cpu));
        assert_eq!(store.layout(), CheckpointLayout::Bare);
        assert!(same_tensors(&store, &trained));
    }

    #[test]
    fn test_unreadable_checkpoint_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pth");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let mut store = ParameterStore::random(&tiny_config(), &Device::Cpu).unwrap();
        assert!(!load_model_weights(&path, &mut store, &Device::Cpu));
        assert!(read_checkpoint(&path, &Device::Cpu).is_err());
    }

    #[test]
    fn test_infer_architecture() {
        let config = tiny_config();
        let store = ParameterStore::random(&config, &Device::Cpu).unwrap();
        let found = infer_architecture(&store).unwrap();
        assert_eq!(found.vocab, VocabSizes { categories: 5, merchants: 7 });
        assert_eq!(found.embedding_dim, 4);
        assert_eq!(found.hidden_dim, 6);
        assert_eq!(found.num_layers, 2);
    }

    #[test]
    fn test_vocab_mismatch_is_reported() {
        let config = tiny_config();
        let store = ParameterStore::random(&config, &Device::Cpu).unwrap();
        let mut declared = config.clone();
        declared.category_vocab_size = 6;

        let err = validate_parameters(&declared, &store).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("encoder.category_embedding.weight: expected [6, 4], found [5, 4]"));
        assert!(msg.contains("decoder.fc_category.bias"));
    }

    #[test]
    fn test_depth_mismatch_lists_missing_and_unexpected() {
        let config = tiny_config();
        let store = ParameterStore::random(&config, &Device::Cpu).unwrap();

        let mut deeper = config.clone();
        deeper.num_layers = 3;
        let msg = validate_parameters(&deeper, &store).unwrap_err().to_string();
        assert!(msg.contains("missing encoder.lstm.weight_ih_l2"));

        let mut shallower = config.clone();
        shallower.num_layers = 1;
        let msg = validate_parameters(&shallower, &store).unwrap_err().to_string();
        assert!(msg.contains("unexpected decoder.lstm.bias_hh_l1"));
    }

    #[test]
    fn test_resolve_architecture_prefers_checkpoint() {
        let dir = tempdir().unwrap();
        let trained = tiny_config();
        let path = dir.path().join("model.safetensors");
        ParameterStore::random(&trained, &Device::Cpu)
            .unwrap()
            .save_safetensors(&path)
            .unwrap();
        let store = read_checkpoint(&path, &Device::Cpu).unwrap();

        let mut table = trained.clone();
        table.hidden_dim = 16;
        table.num_layers = 4;

        let resolved = resolve_architecture(&table, &store, ArchitectureSource::Checkpoint).unwrap();
        assert_eq!(resolved, trained);

        let err = resolve_architecture(&table, &store, ArchitectureSource::Table).unwrap_err();
        assert!(matches!(err, ExportError::ArchitectureMismatch(_)));
    }
}
