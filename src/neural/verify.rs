// projeto: finoexport
// file: src/neural/verify.rs
// Re-reads an exported graph, evaluates it and compares with the in-memory model

use candle_core::{DType, Device, Tensor, D};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::neural::graph::{AMOUNT_OUTPUT, CATEGORY_OUTPUT, INPUT_NAME, MERCHANT_OUTPUT, TARGET_NAME};
use crate::neural::metrics::{FidelityReport, OutputDiff};
use crate::neural::model::Seq2Seq;
use crate::neural::data::SampleBatch;
use crate::neural::onnx::{DataType, Dim, GraphProto, ModelProto, NodeProto};
use crate::neural::utils::{ExportError, Result};

fn graph_err(node: &NodeProto, msg: impl std::fmt::Display) -> ExportError {
    ExportError::Graph(format!("{} '{}': {}", node.op_type, node.name, msg))
}

fn normalize_axis(node: &NodeProto, axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    usize::try_from(resolved)
        .ok()
        .filter(|&a| a < rank)
        .ok_or_else(|| graph_err(node, format!("axis {} out of range for rank {}", axis, rank)))
}

/// Evaluates graphs built from Gather, Cast, Concat, Transpose, Squeeze,
/// Unsqueeze, LSTM and Gemm.
pub struct Interpreter {
    graph: GraphProto,
    opset_version: i64,
    initializers: HashMap<String, Tensor>,
}

impl Interpreter {
    pub fn new(model: ModelProto, device: &Device) -> Result<Self> {
        let opset_version = model
            .opset_version()
            .ok_or_else(|| ExportError::Graph("model declares no default-domain opset".to_string()))?;
        let graph = model
            .graph
            .ok_or_else(|| ExportError::Graph("model has no graph".to_string()))?;
        let mut initializers = HashMap::with_capacity(graph.initializer.len());
        for t in &graph.initializer {
            initializers.insert(t.name.clone(), t.to_tensor(device)?);
        }
        Ok(Self {
            graph,
            opset_version,
            initializers,
        })
    }

    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::new(ModelProto::from_bytes(&bytes)?, device)
    }

    pub fn graph(&self) -> &GraphProto {
        &self.graph
    }

    /// Checks every declared input against the fed tensors: fixed dims must
    /// match, symbolic dims accept any size.
    fn check_inputs(&self, feeds: &HashMap<&str, Tensor>) -> Result<()> {
        for info in &self.graph.input {
            if self.initializers.contains_key(&info.name) {
                continue;
            }
            let fed = feeds
                .get(info.name.as_str())
                .ok_or_else(|| ExportError::Graph(format!("missing graph input '{}'", info.name)))?;
            if info.elem_type() == Some(DataType::Float as i32) && fed.dtype() != DType::F32 {
                return Err(ExportError::Graph(format!(
                    "input '{}' expects float32, got {:?}",
                    info.name,
                    fed.dtype()
                )));
            }
            let declared = info
                .dims()
                .ok_or_else(|| ExportError::Graph(format!("input '{}' has no shape", info.name)))?;
            let actual = fed.dims();
            let matches = declared.len() == actual.len()
                && declared.iter().zip(actual).all(|(d, &a)| match d {
                    Dim::Fixed(v) => *v == a,
                    Dim::Symbolic(_) => a >= 1,
                });
            if !matches {
                return Err(ExportError::Graph(format!(
                    "input '{}' has shape {:?}, declared {:?}",
                    info.name, actual, declared
                )));
            }
        }
        Ok(())
    }

    /// Runs the graph and returns its declared outputs by name.
    pub fn run(&self, feeds: HashMap<&str, Tensor>) -> Result<HashMap<String, Tensor>> {
        self.check_inputs(&feeds)?;
        let mut env: HashMap<String, Tensor> = self.initializers.clone();
        for (name, tensor) in feeds {
            env.insert(name.to_string(), tensor);
        }

        for node in &self.graph.node {
            let inputs = node
                .input
                .iter()
                .map(|name| {
                    if name.is_empty() {
                        Ok(None)
                    } else {
                        env.get(name)
                            .cloned()
                            .map(Some)
                            .ok_or_else(|| graph_err(node, format!("undefined input '{}'", name)))
                    }
                })
                .collect::<Result<Vec<Option<Tensor>>>>()?;
            let outputs = self.eval(node, &inputs)?;
            for (name, value) in node.output.iter().zip(outputs) {
                if !name.is_empty() {
                    env.insert(name.clone(), value);
                }
            }
        }

        self.graph
            .output
            .iter()
            .map(|info| {
                env.remove(&info.name)
                    .map(|t| (info.name.clone(), t))
                    .ok_or_else(|| ExportError::Graph(format!("output '{}' was never produced", info.name)))
            })
            .collect()
    }

    fn eval(&self, node: &NodeProto, inputs: &[Option<Tensor>]) -> Result<Vec<Tensor>> {
        let input = |i: usize| -> Result<&Tensor> {
            inputs
                .get(i)
                .and_then(Option::as_ref)
                .ok_or_else(|| graph_err(node, format!("missing input {}", i)))
        };

        match node.op_type.as_str() {
            "Gather" => {
                let data = input(0)?;
                let indices = input(1)?;
                let axis = normalize_axis(node, node.attr_int("axis").unwrap_or(0), data.rank())?;
                Ok(vec![gather(data, indices, axis)?])
            }
            "Cast" => {
                let dtype = match node.attr_int("to").and_then(|t| DataType::try_from(t as i32).ok()) {
                    Some(DataType::Float) => DType::F32,
                    Some(DataType::Int64) => DType::I64,
                    other => return Err(graph_err(node, format!("unsupported cast target {:?}", other))),
                };
                Ok(vec![input(0)?.to_dtype(dtype)?])
            }
            "Concat" => {
                let parts: Vec<&Tensor> = inputs.iter().flatten().collect();
                let rank = parts.first().map(|t| t.rank()).unwrap_or(0);
                let axis = normalize_axis(node, node.attr_int("axis").unwrap_or(0), rank)?;
                Ok(vec![Tensor::cat(&parts, axis)?])
            }
            "Transpose" => {
                let x = input(0)?;
                let perm: Vec<usize> = match node.attr_ints("perm") {
                    Some(perm) if !perm.is_empty() => perm
                        .iter()
                        .map(|&p| normalize_axis(node, p, x.rank()))
                        .collect::<Result<_>>()?,
                    _ => (0..x.rank()).rev().collect(),
                };
                Ok(vec![x.permute(perm)?.contiguous()?])
            }
            "Squeeze" | "Unsqueeze" => {
                let x = input(0)?;
                let axes = self.axes(node, inputs)?;
                let out = if node.op_type == "Squeeze" {
                    let mut axes = axes
                        .iter()
                        .map(|&a| normalize_axis(node, a, x.rank()))
                        .collect::<Result<Vec<_>>>()?;
                    axes.sort_unstable_by(|a, b| b.cmp(a));
                    let mut out = x.clone();
                    for axis in axes {
                        if out.dim(axis)? != 1 {
                            return Err(graph_err(node, format!("cannot squeeze axis {} of {:?}", axis, out.dims())));
                        }
                        out = out.squeeze(axis)?;
                    }
                    out
                } else {
                    let out_rank = x.rank() + axes.len();
                    let mut axes = axes
                        .iter()
                        .map(|&a| normalize_axis(node, a, out_rank))
                        .collect::<Result<Vec<_>>>()?;
                    axes.sort_unstable();
                    let mut out = x.clone();
                    for axis in axes {
                        out = out.unsqueeze(axis)?;
                    }
                    out
                };
                Ok(vec![out])
            }
            "Gemm" => {
                let mut a = input(0)?.clone();
                let mut b = input(1)?.clone();
                if node.attr_int("transA").unwrap_or(0) != 0 {
                    a = a.t()?;
                }
                if node.attr_int("transB").unwrap_or(0) != 0 {
                    b = b.t()?;
                }
                let alpha = node.get_attribute("alpha").and_then(|a| a.f).unwrap_or(1.0) as f64;
                let beta = node.get_attribute("beta").and_then(|a| a.f).unwrap_or(1.0) as f64;
                let mut y = a.contiguous()?.matmul(&b.contiguous()?)?.affine(alpha, 0.0)?;
                if let Some(Some(c)) = inputs.get(2) {
                    y = y.broadcast_add(&c.affine(beta, 0.0)?)?;
                }
                Ok(vec![y])
            }
            "LSTM" => self.lstm(node, inputs),
            other => Err(graph_err(node, format!("unsupported operator {}", other))),
        }
    }

    fn axes(&self, node: &NodeProto, inputs: &[Option<Tensor>]) -> Result<Vec<i64>> {
        if self.opset_version >= 13 {
            match inputs.get(1) {
                Some(Some(axes)) => Ok(axes.flatten_all()?.to_vec1::<i64>()?),
                _ => Err(graph_err(node, "axes input is required from opset 13")),
            }
        } else {
            node.attr_ints("axes")
                .map(|a| a.to_vec())
                .ok_or_else(|| graph_err(node, "missing axes attribute"))
        }
    }

    /// Forward, batch-second ONNX LSTM with gate order `(i, o, f, c)`.
    fn lstm(&self, node: &NodeProto, inputs: &[Option<Tensor>]) -> Result<Vec<Tensor>> {
        if let Some(direction) = node.get_attribute("direction").and_then(|a| a.s.as_deref()) {
            if direction != b"forward" {
                return Err(graph_err(node, "only forward direction is supported"));
            }
        }
        if node.attr_int("layout").unwrap_or(0) != 0 {
            return Err(graph_err(node, "only layout 0 is supported"));
        }
        if inputs.get(4).is_some_and(Option::is_some) {
            return Err(graph_err(node, "sequence_lens is not supported"));
        }
        let hidden = node
            .attr_int("hidden_size")
            .and_then(|h| usize::try_from(h).ok())
            .ok_or_else(|| graph_err(node, "missing hidden_size"))?;

        let get = |i: usize| inputs.get(i).and_then(Option::as_ref);
        let x = get(0).ok_or_else(|| graph_err(node, "missing X"))?;
        let w = get(1).ok_or_else(|| graph_err(node, "missing W"))?.squeeze(0)?;
        let r = get(2).ok_or_else(|| graph_err(node, "missing R"))?.squeeze(0)?;
        let (seq_len, batch, _) = x.dims3()?;
        if w.dim(0)? != 4 * hidden || r.dims() != [4 * hidden, hidden] {
            return Err(graph_err(node, format!("W {:?} / R {:?} do not fit hidden {}", w.dims(), r.dims(), hidden)));
        }
        let bias = match get(3) {
            Some(b) => {
                let b = b.squeeze(0)?;
                Some((b.narrow(0, 0, 4 * hidden)? + b.narrow(0, 4 * hidden, 4 * hidden)?)?)
            }
            None => None,
        };
        let zeros = || Tensor::zeros((batch, hidden), DType::F32, x.device());
        let mut h = match get(5) {
            Some(h0) => h0.squeeze(0)?,
            None => zeros()?,
        };
        let mut c = match get(6) {
            Some(c0) => c0.squeeze(0)?,
            None => zeros()?,
        };

        let w_t = w.t()?.contiguous()?;
        let r_t = r.t()?.contiguous()?;
        let mut ys = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x_t = x.get(t)?.contiguous()?;
            let mut gates = (x_t.matmul(&w_t)? + h.matmul(&r_t)?)?;
            if let Some(b) = &bias {
                gates = gates.broadcast_add(b)?;
            }
            let gate = |k: usize| gates.narrow(D::Minus1, k * hidden, hidden);
            let i_gate = candle_nn::ops::sigmoid(&gate(0)?)?;
            let o_gate = candle_nn::ops::sigmoid(&gate(1)?)?;
            let f_gate = candle_nn::ops::sigmoid(&gate(2)?)?;
            let candidate = gate(3)?.tanh()?;
            c = ((f_gate * &c)? + (i_gate * candidate)?)?;
            h = (o_gate * c.tanh()?)?;
            ys.push(h.clone());
        }

        let y = Tensor::stack(&ys, 0)?.unsqueeze(1)?;
        Ok(vec![y, h.unsqueeze(0)?, c.unsqueeze(0)?])
    }
}

/// ONNX Gather: `indices` of any rank replace axis `axis` of `data`.
fn gather(data: &Tensor, indices: &Tensor, axis: usize) -> Result<Tensor> {
    let indices = indices.to_dtype(DType::I64)?;
    let mut shape: Vec<usize> = data.dims()[..axis].to_vec();
    shape.extend_from_slice(indices.dims());
    shape.extend_from_slice(&data.dims()[axis + 1..]);

    let flat = indices.flatten_all()?.contiguous()?;
    let bound = data.dim(axis)? as i64;
    if flat.to_vec1::<i64>()?.iter().any(|&i| i < 0 || i >= bound) {
        return Err(ExportError::Graph(format!(
            "Gather index out of range for axis {} of size {}",
            axis, bound
        )));
    }
    let picked = data.contiguous()?.index_select(&flat, axis)?;
    Ok(picked.reshape(shape)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    if a.dims() != b.dims() {
        return Err(ExportError::Graph(format!(
            "shape mismatch {:?} vs {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

/// Feeds `sample` to the graph and to the teacher-forced model and measures
/// the largest difference per output.
pub fn compare(interpreter: &Interpreter, model: &Seq2Seq, sample: &SampleBatch) -> Result<FidelityReport> {
    let mut feeds = HashMap::new();
    feeds.insert(INPUT_NAME, sample.input.clone());
    feeds.insert(TARGET_NAME, sample.target.clone());
    let outputs = interpreter.run(feeds)?;

    // The rng is never drawn under teacher forcing
    let expected = model.forward(&sample.input, &sample.target, &mut StdRng::seed_from_u64(0))?;
    let mut diffs = Vec::with_capacity(3);
    for (name, reference) in [
        (AMOUNT_OUTPUT, &expected.amount),
        (CATEGORY_OUTPUT, &expected.category),
        (MERCHANT_OUTPUT, &expected.merchant),
    ] {
        let produced = outputs
            .get(name)
            .ok_or_else(|| ExportError::Graph(format!("graph has no output '{}'", name)))?;
        diffs.push(OutputDiff {
            name: name.to_string(),
            shape: produced.dims().to_vec(),
            max_abs_diff: max_abs_diff(produced, reference)?,
        });
    }
    Ok(FidelityReport {
        batch_size: sample.batch_size(),
        diffs,
    })
}

/// Re-reads the serialized graph at `path` and checks every sample against the model.
pub fn verify_export(
    path: &Path,
    model: &Seq2Seq,
    samples: &[SampleBatch],
    tolerance: f32,
) -> Result<Vec<FidelityReport>> {
    let interpreter = Interpreter::from_file(path, model.device())?;
    debug!(
        "🔍 [Verify] Loaded {} nodes from {}",
        interpreter.graph().node.len(),
        path.display()
    );

    let mut reports = Vec::with_capacity(samples.len());
    for sample in samples {
        let report = compare(&interpreter, model, sample)?;
        if !report.within(tolerance) {
            return Err(ExportError::Graph(format!(
                "exported graph diverges from the model at batch {}: max abs diff {:.3e} > {:.1e}",
                report.batch_size,
                report.max_abs_diff(),
                tolerance
            )));
        }
        info!(
            "✅ [Verify] Batch {}: max abs diff {:.3e} (tolerance {:.1e})",
            report.batch_size,
            report.max_abs_diff(),
            tolerance
        );
        reports.push(report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::config::{tiny_config, DecodingPolicy, ModelConfig, ModelSize};
    use crate::neural::data::synthetic_batch;
    use crate::neural::graph::{build_graph, stage_graph, GraphOptions};
    use crate::neural::onnx::{AttributeProto, TensorProto};
    use crate::neural::storage::ParameterStore;
    use tempfile::tempdir;

    fn options(opset_version: i64) -> GraphOptions {
        GraphOptions {
            model_size: ModelSize::Small,
            opset_version,
        }
    }

    fn setup(config: &ModelConfig) -> (ParameterStore, Seq2Seq) {
        let store = ParameterStore::random(config, &Device::Cpu).unwrap();
        let model = store
            .build_model(config, DecodingPolicy::TeacherForced, &Device::Cpu)
            .unwrap();
        (store, model)
    }

    fn sample(config: &ModelConfig, batch: usize, seed: u64) -> SampleBatch {
        synthetic_batch(config, batch, &mut StdRng::seed_from_u64(seed), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_exported_graph_matches_model() {
        let dir = tempdir().unwrap();
        let config = tiny_config();
        let (store, model) = setup(&config);
        let one = sample(&config, 1, 42);
        let staged = stage_graph(&store, &config, &options(11), &one, dir.path(), &Device::Cpu).unwrap();

        let reports = verify_export(staged.path(), &model, &[one, sample(&config, 3, 7)], 1e-4).unwrap();
        assert!(!staged.target().exists());
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].batch_size, 3);
        assert_eq!(reports[1].diffs[1].shape, vec![3, 3, 5]);
        assert!(reports.iter().all(|r| r.max_abs_diff() <= 1e-4));
    }

    #[test]
    fn test_opset_13_graph_matches_model() {
        let config = tiny_config();
        let (store, model) = setup(&config);
        let proto = build_graph(&store, &config, &options(13)).unwrap();
        let interpreter = Interpreter::new(proto, &Device::Cpu).unwrap();
        let report = compare(&interpreter, &model, &sample(&config, 2, 3)).unwrap();
        assert!(report.within(1e-4));
    }

    #[test]
    fn test_perturbed_weights_are_detected() {
        let config = tiny_config();
        let (store, model) = setup(&config);
        let mut proto = build_graph(&store, &config, &options(11)).unwrap();
        let graph = proto.graph.as_mut().unwrap();
        let bias = graph
            .initializer
            .iter_mut()
            .find(|t| t.name == "decoder.fc_amount.bias")
            .unwrap();
        let shifted = bias.to_tensor(&Device::Cpu).unwrap().affine(1.0, 0.5).unwrap();
        *bias = TensorProto::from_tensor("decoder.fc_amount.bias", &shifted).unwrap();

        let interpreter = Interpreter::new(proto, &Device::Cpu).unwrap();
        let report = compare(&interpreter, &model, &sample(&config, 1, 1)).unwrap();
        assert!(!report.within(1e-4));
        assert!((report.diffs[0].max_abs_diff - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_wrong_static_dim_rejected() {
        let config = tiny_config();
        let (store, _) = setup(&config);
        let proto = build_graph(&store, &config, &options(11)).unwrap();
        let interpreter = Interpreter::new(proto, &Device::Cpu).unwrap();

        let mut longer = config.clone();
        longer.sequence_length += 1;
        let bad = sample(&longer, 2, 0);
        let mut feeds = HashMap::new();
        feeds.insert(INPUT_NAME, bad.input);
        feeds.insert(TARGET_NAME, bad.target);
        let err = interpreter.run(feeds).unwrap_err();
        assert!(err.to_string().contains("input 'input'"));
    }

    #[test]
    fn test_lstm_matches_candle_cell() {
        // Single step, gate blocks reordered the same way the exporter does
        use crate::neural::graph::onnx_lstm_weights;
        let config = tiny_config();
        let (store, _) = setup(&config);
        let (w, r, b) = onnx_lstm_weights(&store, "decoder.lstm", 1, 6).unwrap();

        let vb = store.var_builder(&Device::Cpu);
        let cell = candle_nn::rnn::lstm(
            6,
            6,
            candle_nn::rnn::LSTMConfig {
                layer_idx: 1,
                ..Default::default()
            },
            vb.pp("decoder.lstm"),
        )
        .unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 6), &Device::Cpu).unwrap();
        let h0 = Tensor::randn(0f32, 1.0, (2, 6), &Device::Cpu).unwrap();
        let c0 = Tensor::randn(0f32, 1.0, (2, 6), &Device::Cpu).unwrap();
        let state = candle_nn::rnn::LSTMState::new(h0.clone(), c0.clone());
        let expected = candle_nn::RNN::step(&cell, &x, &state).unwrap();

        let node = NodeProto::new("LSTM", "l", &["x", "w", "r", "b", "", "h", "c"], &["y", "yh", "yc"])
            .with_attribute(AttributeProto::int("hidden_size", 6));
        let interpreter = Interpreter {
            graph: GraphProto::default(),
            opset_version: 11,
            initializers: HashMap::new(),
        };
        let inputs = vec![
            Some(x.unsqueeze(0).unwrap()),
            Some(w),
            Some(r),
            Some(b),
            None,
            Some(h0.unsqueeze(0).unwrap()),
            Some(c0.unsqueeze(0).unwrap()),
        ];
        let out = interpreter.eval(&node, &inputs).unwrap();
        assert_eq!(out[0].dims(), &[1, 1, 2, 6]);
        let diff = max_abs_diff(&out[1].squeeze(0).unwrap(), &expected.h).unwrap();
        assert!(diff < 1e-5);
        let diff = max_abs_diff(&out[2].squeeze(0).unwrap(), &expected.c).unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_gather_scalar_and_matrix_indices() {
        let device = Device::Cpu;
        let data = Tensor::arange(0f32, 24., &device).unwrap().reshape((2, 3, 4)).unwrap();
        let scalar = Tensor::new(2i64, &device).unwrap();
        let picked = gather(&data, &scalar, 2).unwrap();
        assert_eq!(picked.to_vec2::<f32>().unwrap(), vec![vec![2., 6., 10.], vec![14., 18., 22.]]);

        let table = Tensor::arange(0f32, 6., &device).unwrap().reshape((3, 2)).unwrap();
        let ids = Tensor::new(&[[2i64, 0], [1, 1]], &device).unwrap();
        let rows = gather(&table, &ids, 0).unwrap();
        assert_eq!(rows.dims(), &[2, 2, 2]);
        assert_eq!(rows.to_vec3::<f32>().unwrap()[0], vec![vec![4., 5.], vec![0., 1.]]);

        assert!(gather(&table, &Tensor::new(&[3i64], &device).unwrap(), 0).is_err());
    }
}
