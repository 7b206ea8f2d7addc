// projeto: finoexport
// file: src/neural/model.rs
// Seq2seq LSTM forecaster: encoder, decoder and the decoding loop

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM};
use candle_nn::{embedding, linear, Embedding, Init, Linear, VarBuilder, RNN};
use rand::Rng;

use crate::neural::config::{
    DecodingPolicy, ModelConfig, CATEGORY_SLOT, INPUT_FEATURES, MERCHANT_SLOT, NUMERIC_SLOTS,
    TARGET_AMOUNT_SLOT, TARGET_CATEGORY_SLOT, TARGET_MERCHANT_SLOT,
};

/// Multi-layer LSTM laid out like `torch.nn.LSTM` (`weight_ih_l{k}`, ...).
#[derive(Debug, Clone)]
pub struct StackedLstm {
    layers: Vec<LSTM>,
}

impl StackedLstm {
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        // torch.nn.LSTM initializes every parameter from U(-1/sqrt(H), 1/sqrt(H))
        let bound = 1.0 / (hidden_dim as f64).sqrt();
        let init = Init::Uniform { lo: -bound, up: bound };

        let mut layers = Vec::with_capacity(num_layers);
        for layer_idx in 0..num_layers {
            let in_dim = if layer_idx == 0 { input_dim } else { hidden_dim };
            let config = LSTMConfig {
                w_ih_init: init,
                w_hh_init: init,
                b_ih_init: Some(init),
                b_hh_init: Some(init),
                layer_idx,
                ..Default::default()
            };
            layers.push(lstm(in_dim, hidden_dim, config, vb.clone())?);
        }
        Ok(Self { layers })
    }

    /// Runs a `[batch, seq, features]` sequence from zero state and returns
    /// the final state of every layer.
    pub fn encode(&self, input: &Tensor) -> candle_core::Result<Vec<LSTMState>> {
        let mut input = input.clone();
        let mut finals = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let states = layer.seq(&input)?;
            let last = states
                .last()
                .cloned()
                .ok_or_else(|| candle_core::Error::Msg("empty input sequence".to_string()))?;
            input = layer.states_to_tensor(&states)?;
            finals.push(last);
        }
        Ok(finals)
    }

    /// Advances every layer by one `[batch, features]` step.
    pub fn step(&self, input: &Tensor, states: &[LSTMState]) -> candle_core::Result<Vec<LSTMState>> {
        if states.len() != self.layers.len() {
            candle_core::bail!(
                "expected {} layer states, got {}",
                self.layers.len(),
                states.len()
            );
        }
        let mut input = input.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, state) in self.layers.iter().zip(states) {
            let state = layer.step(&input, state)?;
            input = state.h.clone();
            next.push(state);
        }
        Ok(next)
    }
}

fn ids_from_slot(frames: &Tensor, slot: usize) -> candle_core::Result<Tensor> {
    frames.i((.., .., slot))?.to_dtype(DType::U32)
}

#[derive(Debug, Clone)]
pub struct Encoder {
    category_embedding: Embedding,
    merchant_embedding: Embedding,
    lstm: StackedLstm,
    numeric_slots: Tensor,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let category_embedding = embedding(
            config.category_vocab_size,
            config.embedding_dim,
            vb.pp("category_embedding"),
        )?;
        let merchant_embedding = embedding(
            config.merchant_vocab_size,
            config.embedding_dim,
            vb.pp("merchant_embedding"),
        )?;
        let lstm = StackedLstm::new(
            config.encoder_input_dim(),
            config.hidden_dim,
            config.num_layers,
            vb.pp("lstm"),
        )?;
        let slots: Vec<u32> = NUMERIC_SLOTS.iter().map(|&s| s as u32).collect();
        let numeric_slots = Tensor::new(slots.as_slice(), vb.device())?;
        Ok(Self {
            category_embedding,
            merchant_embedding,
            lstm,
            numeric_slots,
        })
    }

    /// `src`: `[batch, seq, 14]`. Returns the final `(h, c)` of every layer.
    pub fn forward(&self, src: &Tensor) -> candle_core::Result<Vec<LSTMState>> {
        let numeric = src.index_select(&self.numeric_slots, 2)?;
        let category = self
            .category_embedding
            .forward(&ids_from_slot(src, CATEGORY_SLOT)?)?;
        let merchant = self
            .merchant_embedding
            .forward(&ids_from_slot(src, MERCHANT_SLOT)?)?;
        let input = Tensor::cat(&[&numeric, &category, &merchant], 2)?;
        self.lstm.encode(&input)
    }
}

/// One decoder step: the three heads plus the advanced recurrent state.
#[derive(Debug, Clone)]
pub struct DecoderStep {
    pub amount: Tensor,
    pub category: Tensor,
    pub merchant: Tensor,
    pub states: Vec<LSTMState>,
}

impl DecoderStep {
    /// Frame built from the model's own prediction: amount plus argmax ids.
    pub fn greedy_frame(&self) -> candle_core::Result<Tensor> {
        let category = self.category.argmax_keepdim(1)?.to_dtype(DType::F32)?;
        let merchant = self.merchant.argmax_keepdim(1)?.to_dtype(DType::F32)?;
        Tensor::cat(&[&self.amount, &category, &merchant], 1)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    category_embedding: Embedding,
    merchant_embedding: Embedding,
    lstm: StackedLstm,
    fc_amount: Linear,
    fc_category: Linear,
    fc_merchant: Linear,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let category_embedding = embedding(
            config.category_vocab_size,
            config.embedding_dim,
            vb.pp("category_embedding"),
        )?;
        let merchant_embedding = embedding(
            config.merchant_vocab_size,
            config.embedding_dim,
            vb.pp("merchant_embedding"),
        )?;
        let lstm = StackedLstm::new(
            config.decoder_input_dim(),
            config.hidden_dim,
            config.num_layers,
            vb.pp("lstm"),
        )?;
        let fc_amount = linear(config.hidden_dim, 1, vb.pp("fc_amount"))?;
        let fc_category = linear(config.hidden_dim, config.category_vocab_size, vb.pp("fc_category"))?;
        let fc_merchant = linear(config.hidden_dim, config.merchant_vocab_size, vb.pp("fc_merchant"))?;
        Ok(Self {
            category_embedding,
            merchant_embedding,
            lstm,
            fc_amount,
            fc_category,
            fc_merchant,
        })
    }

    /// `frame`: `[batch, >=3]` holding amount, category id, merchant id.
    pub fn forward(&self, frame: &Tensor, states: &[LSTMState]) -> candle_core::Result<DecoderStep> {
        let amount = frame.narrow(1, TARGET_AMOUNT_SLOT, 1)?;
        let category_ids = frame.i((.., TARGET_CATEGORY_SLOT))?.to_dtype(DType::U32)?;
        let merchant_ids = frame.i((.., TARGET_MERCHANT_SLOT))?.to_dtype(DType::U32)?;
        let category = self.category_embedding.forward(&category_ids)?;
        let merchant = self.merchant_embedding.forward(&merchant_ids)?;
        let input = Tensor::cat(&[&amount, &category, &merchant], 1)?;

        let states = self.lstm.step(&input, states)?;
        let output = match states.last() {
            Some(state) => state.h.clone(),
            None => candle_core::bail!("decoder has no layers"),
        };

        Ok(DecoderStep {
            amount: self.fc_amount.forward(&output)?,
            category: self.fc_category.forward(&output)?,
            merchant: self.fc_merchant.forward(&output)?,
            states,
        })
    }
}

/// Stacked decoder outputs over the forecast horizon.
#[derive(Debug, Clone)]
pub struct Forecast {
    /// `[batch, horizon, 1]`
    pub amount: Tensor,
    /// `[batch, horizon, category_vocab]`
    pub category: Tensor,
    /// `[batch, horizon, merchant_vocab]`
    pub merchant: Tensor,
}

#[derive(Debug, Clone)]
pub struct Seq2Seq {
    encoder: Encoder,
    decoder: Decoder,
    policy: DecodingPolicy,
}

impl Seq2Seq {
    /// Declares the model under the `encoder.` / `decoder.` prefixes of `vb`.
    pub fn new(config: &ModelConfig, policy: DecodingPolicy, vb: VarBuilder) -> candle_core::Result<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            policy,
        })
    }

    /// `src`: `[batch, seq, 14]`, `trg`: `[batch, horizon, 4]`.
    ///
    /// The first decoder input is target frame 0; after step `t` the next input
    /// is target frame `t` (or, under scheduled sampling, possibly the greedy
    /// prediction). `rng` is only drawn from under scheduled sampling.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        src: &Tensor,
        trg: &Tensor,
        rng: &mut R,
    ) -> candle_core::Result<Forecast> {
        let (src_batch, _seq, features) = src.dims3()?;
        let (batch, horizon, _) = trg.dims3()?;
        if features != INPUT_FEATURES {
            candle_core::bail!("input frames need {} slots, got {}", INPUT_FEATURES, features);
        }
        if src_batch != batch {
            candle_core::bail!("input batch {} differs from target batch {}", src_batch, batch);
        }
        if horizon == 0 {
            candle_core::bail!("target sequence is empty");
        }

        let mut states = self.encoder.forward(src)?;
        let mut input = trg.i((.., 0, ..))?;

        let mut amounts = Vec::with_capacity(horizon);
        let mut categories = Vec::with_capacity(horizon);
        let mut merchants = Vec::with_capacity(horizon);

        for t in 0..horizon {
            let step = self.decoder.forward(&input, &states)?;
            input = match self.policy {
                DecodingPolicy::TeacherForced => trg.i((.., t, ..))?,
                DecodingPolicy::ScheduledSampling { ratio } => {
                    if rng.random::<f64>() < ratio {
                        trg.i((.., t, ..))?
                    } else {
                        step.greedy_frame()?
                    }
                }
            };
            amounts.push(step.amount);
            categories.push(step.category);
            merchants.push(step.merchant);
            states = step.states;
        }

        Ok(Forecast {
            amount: Tensor::stack(&amounts, 1)?,
            category: Tensor::stack(&categories, 1)?,
            merchant: Tensor::stack(&merchants, 1)?,
        })
    }

    pub fn device(&self) -> &Device {
        self.encoder.numeric_slots.device()
    }
}
