// projeto: finoexport
// file: src/neural/graph.rs
// Unrolled ONNX graph for the teacher-forced seq2seq forecaster

use candle_core::{Device, Tensor};
use chrono::Utc;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::Path;

use crate::neural::config::{
    DecodingPolicy, ModelConfig, ModelSize, CATEGORY_SLOT, INPUT_FEATURES, MERCHANT_SLOT,
    NUMERIC_SLOTS, TARGET_AMOUNT_SLOT, TARGET_CATEGORY_SLOT, TARGET_FEATURES,
    TARGET_MERCHANT_SLOT,
};
use crate::neural::data::SampleBatch;
use crate::neural::onnx::{
    AttributeProto, DataType, Dim, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, ValueInfoProto, DEFAULT_DOMAIN, IR_VERSION,
};
use crate::neural::storage::{validate_parameters, ParameterStore};
use crate::neural::utils::{ExportError, Result, StagedFile};

pub const INPUT_NAME: &str = "input";
pub const TARGET_NAME: &str = "target";
pub const AMOUNT_OUTPUT: &str = "amount_output";
pub const CATEGORY_OUTPUT: &str = "category_output";
pub const MERCHANT_OUTPUT: &str = "merchant_output";
pub const BATCH_AXIS: &str = "batch_size";
pub const PRODUCER_NAME: &str = "finoexport";

/// Opset from which Squeeze/Unsqueeze take `axes` as an input.
const AXES_AS_INPUT_OPSET: i64 = 13;

#[derive(Debug, Clone, Copy)]
pub struct GraphOptions {
    pub model_size: ModelSize,
    pub opset_version: i64,
}

/// Rearranges torch LSTM gate blocks `(i, f, g, o)` along dim 0 into the
/// ONNX order `(i, o, f, c)`.
pub fn reorder_gates(t: &Tensor, hidden: usize) -> Result<Tensor> {
    if t.dims().first() != Some(&(4 * hidden)) {
        return Err(ExportError::Graph(format!(
            "gate tensor of shape {:?} does not stack 4 x {} rows",
            t.dims(),
            hidden
        )));
    }
    let block = |k: usize| t.narrow(0, k * hidden, hidden);
    Ok(Tensor::cat(&[block(0)?, block(3)?, block(1)?, block(2)?], 0)?)
}

/// `W`, `R` and `B` of one ONNX LSTM layer from the torch parameters.
pub fn onnx_lstm_weights(
    store: &ParameterStore,
    prefix: &str,
    layer: usize,
    hidden: usize,
) -> Result<(Tensor, Tensor, Tensor)> {
    let param = |kind: &str| store.get(&format!("{}.{}_l{}", prefix, kind, layer));
    let w = reorder_gates(param("weight_ih")?, hidden)?.unsqueeze(0)?;
    let r = reorder_gates(param("weight_hh")?, hidden)?.unsqueeze(0)?;
    let b = Tensor::cat(
        &[
            reorder_gates(param("bias_ih")?, hidden)?,
            reorder_gates(param("bias_hh")?, hidden)?,
        ],
        0,
    )?
    .unsqueeze(0)?;
    Ok((w, r, b))
}

struct GraphBuilder<'a> {
    store: &'a ParameterStore,
    config: &'a ModelConfig,
    opset_version: i64,
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    constants: HashMap<String, String>,
}

impl<'a> GraphBuilder<'a> {
    fn new(store: &'a ParameterStore, config: &'a ModelConfig, opset_version: i64) -> Self {
        Self {
            store,
            config,
            opset_version,
            nodes: Vec::new(),
            initializers: Vec::new(),
            constants: HashMap::new(),
        }
    }

    fn push(&mut self, node: NodeProto) {
        self.nodes.push(node);
    }

    fn initializer(&mut self, name: &str, tensor: &Tensor) -> Result<String> {
        self.initializers.push(TensorProto::from_tensor(name, tensor)?);
        Ok(name.to_string())
    }

    fn parameter(&mut self, name: &str) -> Result<String> {
        let tensor = self.store.get(name)?.clone();
        self.initializer(name, &tensor)
    }

    /// Shared int64 constant; scalar when `dims` is empty.
    fn int_constant(&mut self, dims: &[usize], values: &[i64]) -> String {
        let key = format!("{:?}{:?}", dims, values);
        if let Some(name) = self.constants.get(&key) {
            return name.clone();
        }
        let name = match dims {
            [] => format!("const_{}", values.first().copied().unwrap_or_default()),
            _ => format!(
                "const_{}",
                values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("_")
            ) + "_vec",
        };
        self.initializers
            .push(TensorProto::from_i64(&name, dims, values.to_vec()));
        self.constants.insert(key, name.clone());
        name
    }

    fn gather(&mut self, name: &str, data: &str, indices: &str, axis: i64) -> String {
        self.push(
            NodeProto::new("Gather", name, &[data, indices], &[name])
                .with_attribute(AttributeProto::int("axis", axis)),
        );
        name.to_string()
    }

    fn cast_to_int64(&mut self, name: &str, input: &str) -> String {
        self.push(
            NodeProto::new("Cast", name, &[input], &[name])
                .with_attribute(AttributeProto::int("to", DataType::Int64 as i64)),
        );
        name.to_string()
    }

    fn concat(&mut self, name: &str, inputs: &[&str], axis: i64) -> String {
        self.push(
            NodeProto::new("Concat", name, inputs, &[name])
                .with_attribute(AttributeProto::int("axis", axis)),
        );
        name.to_string()
    }

    fn axes_op(&mut self, op: &str, name: &str, input: &str, axes: &[i64]) -> String {
        let node = if self.opset_version >= AXES_AS_INPUT_OPSET {
            let axes_name = self.int_constant(&[axes.len()], axes);
            NodeProto::new(op, name, &[input, &axes_name], &[name])
        } else {
            NodeProto::new(op, name, &[input], &[name]).with_attribute(AttributeProto::ints("axes", axes))
        };
        self.push(node);
        name.to_string()
    }

    fn squeeze(&mut self, name: &str, input: &str, axes: &[i64]) -> String {
        self.axes_op("Squeeze", name, input, axes)
    }

    fn unsqueeze(&mut self, name: &str, input: &str, axes: &[i64]) -> String {
        self.axes_op("Unsqueeze", name, input, axes)
    }

    /// Looks up embedding rows for the float-encoded ids at `slot` of `frames`.
    fn embed_slot(&mut self, name: &str, frames: &str, slot: usize, axis: i64, table: &str) -> String {
        let slot_idx = self.int_constant(&[], &[slot as i64]);
        let raw = self.gather(&format!("{}_raw", name), frames, &slot_idx, axis);
        let ids = self.cast_to_int64(&format!("{}_ids", name), &raw);
        self.gather(name, table, &ids, 0)
    }

    /// One ONNX LSTM layer; returns `(Y, Y_h, Y_c)`.
    fn lstm_layer(
        &mut self,
        module: &str,
        layer: usize,
        name: &str,
        input: &str,
        initial: Option<(&str, &str)>,
    ) -> Result<(String, String, String)> {
        let hidden = self.config.hidden_dim;
        let w_name = format!("{}.lstm.W_l{}", module, layer);
        let r_name = format!("{}.lstm.R_l{}", module, layer);
        let b_name = format!("{}.lstm.B_l{}", module, layer);
        if !self.initializers.iter().any(|t| t.name == w_name) {
            let (w, r, b) = onnx_lstm_weights(self.store, &format!("{}.lstm", module), layer, hidden)?;
            self.initializer(&w_name, &w)?;
            self.initializer(&r_name, &r)?;
            self.initializer(&b_name, &b)?;
        }

        let y = format!("{}_Y", name);
        let y_h = format!("{}_Y_h", name);
        let y_c = format!("{}_Y_c", name);
        let mut inputs = vec![input, w_name.as_str(), r_name.as_str(), b_name.as_str()];
        if let Some((h, c)) = initial {
            // Empty name skips the optional sequence_lens input
            inputs.extend(["", h, c]);
        }
        self.push(
            NodeProto::new("LSTM", name, &inputs, &[&y, &y_h, &y_c])
                .with_attribute(AttributeProto::int("hidden_size", hidden as i64)),
        );
        Ok((y, y_h, y_c))
    }

    /// Encoder pass; returns the final `(Y_h, Y_c)` per layer.
    fn encoder(&mut self) -> Result<Vec<(String, String)>> {
        let numeric_slots: Vec<i64> = NUMERIC_SLOTS.iter().map(|&s| s as i64).collect();
        let slots = self.int_constant(&[numeric_slots.len()], &numeric_slots);
        let numeric = self.gather("enc_numeric", INPUT_NAME, &slots, 2);

        let category_table = self.parameter("encoder.category_embedding.weight")?;
        let merchant_table = self.parameter("encoder.merchant_embedding.weight")?;
        let category = self.embed_slot("enc_category", INPUT_NAME, CATEGORY_SLOT, 2, &category_table);
        let merchant = self.embed_slot("enc_merchant", INPUT_NAME, MERCHANT_SLOT, 2, &merchant_table);

        let features = self.concat("enc_features", &[&numeric, &category, &merchant], 2);
        self.push(
            NodeProto::new("Transpose", "enc_time_major", &[&features], &["enc_time_major"])
                .with_attribute(AttributeProto::ints("perm", &[1, 0, 2])),
        );

        let mut x = "enc_time_major".to_string();
        let mut states = Vec::with_capacity(self.config.num_layers);
        for layer in 0..self.config.num_layers {
            let name = format!("enc_lstm_l{}", layer);
            let (y, y_h, y_c) = self.lstm_layer("encoder", layer, &name, &x, None)?;
            // Y is [seq, num_directions, batch, hidden]
            x = self.squeeze(&format!("{}_out", name), &y, &[1]);
            states.push((y_h, y_c));
        }
        Ok(states)
    }

    /// Unrolled decoder over the forecast horizon; returns the three heads
    /// per step, each `[batch, 1, width]`.
    fn decoder(&mut self, mut states: Vec<(String, String)>) -> Result<Vec<[String; 3]>> {
        let category_table = self.parameter("decoder.category_embedding.weight")?;
        let merchant_table = self.parameter("decoder.merchant_embedding.weight")?;
        let heads = ["fc_amount", "fc_category", "fc_merchant"]
            .iter()
            .map(|head| {
                let weight = self.parameter(&format!("decoder.{}.weight", head))?;
                let bias = self.parameter(&format!("decoder.{}.bias", head))?;
                Ok((head.to_string(), weight, bias))
            })
            .collect::<Result<Vec<_>>>()?;

        let amount_idx = self.int_constant(&[1], &[TARGET_AMOUNT_SLOT as i64]);
        let mut frames: HashMap<usize, String> = HashMap::new();
        let mut outputs = Vec::with_capacity(self.config.forecast_horizon);

        for t in 0..self.config.forecast_horizon {
            // Step 0 consumes frame 0; step t consumes the frame fed after step t - 1
            let frame_idx = t.saturating_sub(1);
            let frame = match frames.get(&frame_idx) {
                Some(name) => name.clone(),
                None => {
                    let idx = self.int_constant(&[], &[frame_idx as i64]);
                    let name = self.gather(&format!("target_frame_{}", frame_idx), TARGET_NAME, &idx, 1);
                    frames.insert(frame_idx, name.clone());
                    name
                }
            };

            let step = format!("dec_t{}", t);
            let amount = self.gather(&format!("{}_amount", step), &frame, &amount_idx, 1);
            let category = self.embed_slot(
                &format!("{}_category", step),
                &frame,
                TARGET_CATEGORY_SLOT,
                1,
                &category_table,
            );
            let merchant = self.embed_slot(
                &format!("{}_merchant", step),
                &frame,
                TARGET_MERCHANT_SLOT,
                1,
                &merchant_table,
            );
            let features = self.concat(&format!("{}_features", step), &[&amount, &category, &merchant], 1);
            let mut x = self.unsqueeze(&format!("{}_x", step), &features, &[0]);

            let mut next_states = Vec::with_capacity(states.len());
            for (layer, (h, c)) in states.iter().enumerate() {
                let name = format!("{}_lstm_l{}", step, layer);
                let (_, y_h, y_c) = self.lstm_layer("decoder", layer, &name, &x, Some((h.as_str(), c.as_str())))?;
                // With one time step Y_h equals Y without the direction axis
                x = y_h.clone();
                next_states.push((y_h, y_c));
            }
            states = next_states;

            let top = self.squeeze(&format!("{}_top", step), &x, &[0]);
            let mut step_outputs = Vec::with_capacity(3);
            for (head, weight, bias) in &heads {
                let gemm = format!("{}_{}", step, head);
                self.push(
                    NodeProto::new("Gemm", gemm.as_str(), &[&top, weight, bias], &[&gemm])
                        .with_attribute(AttributeProto::int("transB", 1)),
                );
                step_outputs.push(self.unsqueeze(&format!("{}_seq", gemm), &gemm, &[1]));
            }
            let [amount, category, merchant]: [String; 3] = step_outputs
                .try_into()
                .map_err(|_| ExportError::Graph("decoder step lost a head".to_string()))?;
            outputs.push([amount, category, merchant]);
        }
        Ok(outputs)
    }

    fn finish(self, outputs: Vec<[String; 3]>, options: &GraphOptions) -> GraphProto {
        let mut nodes = self.nodes;
        let config = self.config;
        for (i, name) in [AMOUNT_OUTPUT, CATEGORY_OUTPUT, MERCHANT_OUTPUT].iter().enumerate() {
            let parts: Vec<&str> = outputs.iter().map(|step| step[i].as_str()).collect();
            nodes.push(
                NodeProto::new("Concat", *name, &parts, &[*name])
                    .with_attribute(AttributeProto::int("axis", 1)),
            );
        }

        let batch = || Dim::symbolic(BATCH_AXIS);
        let horizon = Dim::Fixed(config.forecast_horizon);
        GraphProto {
            node: nodes,
            name: format!("fin_o_{}", options.model_size.tag()),
            initializer: self.initializers,
            doc_string: String::new(),
            input: vec![
                ValueInfoProto::tensor(
                    INPUT_NAME,
                    DataType::Float,
                    &[batch(), Dim::Fixed(config.sequence_length), Dim::Fixed(INPUT_FEATURES)],
                ),
                ValueInfoProto::tensor(
                    TARGET_NAME,
                    DataType::Float,
                    &[batch(), horizon.clone(), Dim::Fixed(TARGET_FEATURES)],
                ),
            ],
            output: vec![
                ValueInfoProto::tensor(AMOUNT_OUTPUT, DataType::Float, &[batch(), horizon.clone(), Dim::Fixed(1)]),
                ValueInfoProto::tensor(
                    CATEGORY_OUTPUT,
                    DataType::Float,
                    &[batch(), horizon.clone(), Dim::Fixed(config.category_vocab_size)],
                ),
                ValueInfoProto::tensor(
                    MERCHANT_OUTPUT,
                    DataType::Float,
                    &[batch(), horizon, Dim::Fixed(config.merchant_vocab_size)],
                ),
            ],
            value_info: Vec::new(),
        }
    }
}

fn metadata(config: &ModelConfig, size: ModelSize) -> Vec<StringStringEntryProto> {
    [
        ("model_type", size.tag().to_string()),
        ("category_vocab_size", config.category_vocab_size.to_string()),
        ("merchant_vocab_size", config.merchant_vocab_size.to_string()),
        ("embedding_dim", config.embedding_dim.to_string()),
        ("hidden_dim", config.hidden_dim.to_string()),
        ("num_layers", config.num_layers.to_string()),
        ("sequence_length", config.sequence_length.to_string()),
        ("forecast_horizon", config.forecast_horizon.to_string()),
        ("exported_at", Utc::now().to_rfc3339()),
    ]
    .into_iter()
    .map(|(key, value)| StringStringEntryProto {
        key: key.to_string(),
        value,
    })
    .collect()
}

/// Builds the full model proto. Parameter shapes are validated first.
pub fn build_graph(store: &ParameterStore, config: &ModelConfig, options: &GraphOptions) -> Result<ModelProto> {
    validate_parameters(config, store)?;
    let mut builder = GraphBuilder::new(store, config, options.opset_version);
    let states = builder.encoder()?;
    let outputs = builder.decoder(states)?;
    let graph = builder.finish(outputs, options);

    debug!(
        "🔍 [Graph] {} nodes, {} initializers",
        graph.node.len(),
        graph.initializer.len()
    );

    Ok(ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: DEFAULT_DOMAIN.to_string(),
            version: options.opset_version,
        }],
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        domain: String::new(),
        model_version: 1,
        doc_string: format!(
            "Fin-O {} transaction forecaster (teacher-forced decoding, {} steps)",
            options.model_size, config.forecast_horizon
        ),
        graph: Some(graph),
        metadata_props: metadata(config, options.model_size),
    })
}

fn check_sample(config: &ModelConfig, sample: &SampleBatch) -> Result<()> {
    let (_, seq, features) = sample.input.dims3()?;
    let (_, horizon, target_features) = sample.target.dims3()?;
    if (seq, features) != (config.sequence_length, INPUT_FEATURES)
        || (horizon, target_features) != (config.forecast_horizon, TARGET_FEATURES)
    {
        return Err(ExportError::Graph(format!(
            "sample shapes {:?} / {:?} do not match the model's {}x{} window and {}x{} horizon",
            sample.input.dims(),
            sample.target.dims(),
            config.sequence_length,
            INPUT_FEATURES,
            config.forecast_horizon,
            TARGET_FEATURES
        )));
    }
    Ok(())
}

/// Serializes the graph next to `<output_dir>/fin-o-<size>.onnx` without
/// replacing it. The caller commits the staged file once it has been checked.
///
/// The sample is pushed through the in-memory model first so a model that
/// cannot run never produces a file.
pub fn stage_graph(
    store: &ParameterStore,
    config: &ModelConfig,
    options: &GraphOptions,
    sample: &SampleBatch,
    output_dir: &Path,
    device: &Device,
) -> Result<StagedFile> {
    check_sample(config, sample)?;
    let model = store.build_model(config, DecodingPolicy::TeacherForced, device)?;
    let forecast = model.forward(&sample.input, &sample.target, &mut StdRng::seed_from_u64(0))?;
    debug!(
        "🔍 [Graph] Sample forward: amount {:?}, category {:?}, merchant {:?}",
        forecast.amount.dims(),
        forecast.category.dims(),
        forecast.merchant.dims()
    );

    let proto = build_graph(store, config, options)?;
    let path = output_dir.join(options.model_size.graph_file_name());
    let bytes = proto.to_bytes();
    let staged = StagedFile::write(&path, &bytes)?;
    info!(
        "📦 [Graph] Staged {} ({:.2} MB, opset {})",
        path.display(),
        bytes.len() as f64 / (1024.0 * 1024.0),
        options.opset_version
    );
    Ok(staged)
}
