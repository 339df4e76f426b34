use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};

use super::registry::{ModelRegistry, PretrainedConfig};
use super::{
    Backbone, BackboneInputs, BackboneOutput, CausalLm, CausalLmOutput, ForwardInputs,
    GenerateOptions, GenerationKwargs, GenerationResult, HasBackbone, TokenEmbedder,
};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::kv_cache::KvCache;
use crate::layers::{
    causal_mask, merge_heads, position_ids_from_attention_mask, repeat_kv,
    scaled_dot_product_attention, RotaryEmbedding, SwiGluMlp,
};
use crate::multimodal::IGNORE_INDEX;

pub const MODEL_TYPE: &str = "llama";

// ─── Attention ───────────────────────────────────────────────────────────────

struct LlamaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl LlamaAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_key_value_heads;
        let head_dim = cfg.head_dim();
        let bias = cfg.attention_bias.unwrap_or(false);

        let q_proj = linear_b(cfg.hidden_size, num_heads * head_dim, bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(cfg.hidden_size, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(cfg.hidden_size, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?;
        let o_proj = linear_b(num_heads * head_dim, cfg.hidden_size, bias, vb.pp("o_proj"))?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            cfg.rope_scaling.as_ref(),
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
        cache: Option<&mut KvCache>,
        layer_idx: usize,
        output_attentions: bool,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        let (b_sz, q_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = self.rotary_emb.apply(&q, &k, position_ids)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(layer_idx, &k, &v)?,
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let (attn_output, weights) =
            scaled_dot_product_attention(&q, &k, &v, attention_mask, scale, output_attentions)?;

        let out = merge_heads(&attn_output)?.apply(&self.o_proj)?;
        Ok((out, weights))
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

struct LlamaDecoderLayer {
    self_attn: LlamaAttention,
    mlp: SwiGluMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let self_attn = LlamaAttention::new(cfg, vb.pp("self_attn"))?;
        let mlp = SwiGluMlp::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            &cfg.hidden_act,
            false,
            vb.pp("mlp"),
        )?;
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
        cache: Option<&mut KvCache>,
        layer_idx: usize,
        output_attentions: bool,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let (xs, weights) = self.self_attn.forward(
            &xs,
            attention_mask,
            position_ids,
            cache,
            layer_idx,
            output_attentions,
        )?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let xs = self
            .post_attention_layernorm
            .forward(&xs)?
            .apply(&self.mlp)?;
        Ok(((residual + xs)?, weights))
    }
}

// ─── Backbone ────────────────────────────────────────────────────────────────

/// Llama decoder stack: embeddings, layers and final norm.
pub struct LlamaModel {
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    config: ModelConfig,
    device: Device,
    dtype: DType,
}

impl LlamaModel {
    /// `vb` points at the `model` prefix of the checkpoint.
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_key_value_heads == 0 || cfg.num_attention_heads % cfg.num_key_value_heads != 0 {
            return Err(Error::UnsupportedConfiguration(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                cfg.num_attention_heads, cfg.num_key_value_heads
            )));
        }
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;

        let vb_l = vb.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| LlamaDecoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            config: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl TokenEmbedder for LlamaModel {
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }
}

impl Backbone for LlamaModel {
    fn forward(&self, inputs: BackboneInputs) -> Result<BackboneOutput> {
        let BackboneInputs {
            input_ids,
            inputs_embeds,
            attention_mask,
            position_ids,
            past_key_values,
            use_cache,
            output_attentions,
            output_hidden_states,
        } = inputs;

        let mut xs = match (input_ids, inputs_embeds) {
            (Some(ids), None) => self.embed_tokens(&ids)?,
            (None, Some(embeds)) => embeds.to_dtype(self.dtype)?,
            _ => {
                return Err(Error::InvalidInput(
                    "specify exactly one of input_ids and inputs_embeds".into(),
                ))
            }
        };
        let (b_sz, q_len, _) = xs.dims3()?;

        let mut cache = match past_key_values {
            Some(cache) => Some(cache),
            None if use_cache => Some(KvCache::new(self.layers.len())),
            None => None,
        };
        let past_len = cache.as_ref().map(KvCache::seq_len).unwrap_or(0);

        let position_ids = match position_ids {
            Some(p) if p.dim(0)? == b_sz => p,
            Some(p) => p.broadcast_as((b_sz, q_len))?.contiguous()?,
            None => Tensor::arange(past_len as i64, (past_len + q_len) as i64, &self.device)?
                .unsqueeze(0)?
                .broadcast_as((b_sz, q_len))?
                .contiguous()?,
        };
        if position_ids.dims2()? != (b_sz, q_len) {
            return Err(Error::InvalidInput(format!(
                "position_ids shape {:?} does not match inputs ({b_sz}, {q_len})",
                position_ids.dims()
            )));
        }

        let mask = causal_mask(
            b_sz,
            q_len,
            past_len,
            attention_mask.as_ref(),
            DType::F32,
            &self.device,
        )?;

        let mut all_hidden_states = output_hidden_states.then(Vec::new);
        let mut all_attentions = output_attentions.then(Vec::new);
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            if let Some(states) = all_hidden_states.as_mut() {
                states.push(xs.clone());
            }
            let (out, weights) = layer.forward(
                &xs,
                mask.as_ref(),
                &position_ids,
                cache.as_mut(),
                layer_idx,
                output_attentions,
            )?;
            xs = out;
            if let (Some(attns), Some(w)) = (all_attentions.as_mut(), weights) {
                attns.push(w);
            }
        }
        let xs = self.norm.forward(&xs)?;
        if let Some(states) = all_hidden_states.as_mut() {
            states.push(xs.clone());
        }

        Ok(BackboneOutput {
            last_hidden_state: xs,
            past_key_values: if use_cache { cache } else { None },
            hidden_states: all_hidden_states,
            attentions: all_attentions,
        })
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn embedding_weight(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }
}

// ─── Causal LM ───────────────────────────────────────────────────────────────

/// Llama causal LM over any decoder backbone `B`.
pub struct LlamaForCausalLM<B = LlamaModel> {
    model: B,
    lm_head: Linear,
    config: ModelConfig,
}

impl LlamaForCausalLM<LlamaModel> {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let model = LlamaModel::new(cfg, vb.pp("model"))?;
        Self::from_backbone(model, vb)
    }
}

impl<B: Backbone> LlamaForCausalLM<B> {
    /// Attach an LM head (`lm_head` under `vb`, or the tied embeddings) to
    /// an already built backbone.
    pub fn from_backbone(model: B, vb: VarBuilder) -> Result<Self> {
        let config = model.config().clone();
        let lm_head = if config.tie_word_embeddings {
            Linear::new(model.embedding_weight().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };
        Ok(Self {
            model,
            lm_head,
            config,
        })
    }

    /// LM head evaluated in `pretraining_tp` vocabulary slices when set.
    fn lm_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let tp = self.config.pretraining_tp;
        let logits = if tp > 1 {
            let weight = self.lm_head.weight();
            let vocab = weight.dim(0)?;
            let slice = vocab.div_ceil(tp);
            let mut parts = Vec::with_capacity(tp);
            let mut start = 0;
            while start < vocab {
                let len = slice.min(vocab - start);
                parts.push(hidden.broadcast_matmul(&weight.narrow(0, start, len)?.t()?)?);
                start += len;
            }
            Tensor::cat(&parts, D::Minus1)?
        } else {
            self.lm_head.forward(hidden)?
        };
        Ok(logits.to_dtype(DType::F32)?)
    }
}

/// Mean next-token cross-entropy; positions labelled `IGNORE_INDEX` are skipped.
pub fn shifted_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, vocab) = logits.dims3()?;
    if labels.dims2()? != (b_sz, seq_len) {
        return Err(Error::InvalidInput(format!(
            "labels shape {:?} does not match logits ({b_sz}, {seq_len})",
            labels.dims()
        )));
    }
    let device = logits.device();
    if seq_len < 2 {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }
    let n = b_sz * (seq_len - 1);
    let shift_logits = logits
        .narrow(1, 0, seq_len - 1)?
        .contiguous()?
        .reshape((n, vocab))?
        .to_dtype(DType::F32)?;
    let shift_labels = labels
        .narrow(1, 1, seq_len - 1)?
        .contiguous()?
        .reshape(n)?
        .to_dtype(DType::I64)?;

    let ignore = Tensor::full(IGNORE_INDEX, n, device)?;
    let valid = shift_labels.ne(&ignore)?;
    let targets = valid.where_cond(&shift_labels, &shift_labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(&shift_logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;
    let valid = valid.to_dtype(DType::F32)?;
    let count = valid.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }
    let total = (picked * valid)?.sum_all()?;
    Ok((total.neg()? / count as f64)?)
}

fn take_last(t: &Tensor, n: usize, what: &str) -> Result<Tensor> {
    let len = t.dim(1)?;
    if len < n {
        return Err(Error::InvalidInput(format!(
            "{what} covers {len} positions, expected at least {n}"
        )));
    }
    Ok(t.narrow(1, len - n, n)?)
}

impl<B: Backbone> CausalLm for LlamaForCausalLM<B> {
    fn forward(&self, inputs: ForwardInputs) -> Result<CausalLmOutput> {
        let ForwardInputs {
            input_ids,
            attention_mask,
            position_ids,
            past_key_values,
            inputs_embeds,
            labels,
            use_cache,
            output_attentions,
            output_hidden_states,
            images,
            image_sizes: _,
            return_dict: _,
        } = inputs;
        if images.is_some() {
            return Err(Error::InvalidInput(
                "images passed to a text-only causal LM".into(),
            ));
        }

        let out = self.model.forward(BackboneInputs {
            input_ids,
            inputs_embeds,
            attention_mask,
            position_ids,
            past_key_values,
            use_cache: use_cache.unwrap_or(true),
            output_attentions: output_attentions.unwrap_or(false),
            output_hidden_states: output_hidden_states.unwrap_or(false),
        })?;

        let logits = self.lm_logits(&out.last_hidden_state)?;
        let loss = labels
            .map(|labels| shifted_cross_entropy(&logits, &labels))
            .transpose()?;

        Ok(CausalLmOutput {
            loss,
            logits,
            past_key_values: out.past_key_values,
            hidden_states: out.hidden_states,
            attentions: out.attentions,
        })
    }

    fn generate(
        &self,
        inputs: Option<&Tensor>,
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        crate::generation::generate(self, inputs, options)
    }

    fn prepare_inputs_for_generation(
        &self,
        input_ids: &Tensor,
        past_key_values: Option<KvCache>,
        attention_mask: Option<Tensor>,
        inputs_embeds: Option<Tensor>,
        cache_position: Option<Tensor>,
        kwargs: GenerationKwargs,
    ) -> Result<ForwardInputs> {
        let past_len = past_key_values.as_ref().map(KvCache::seq_len).unwrap_or(0);
        let seq_len = input_ids.dim(1)?;

        // Embeddings only drive the first (uncached) step.
        let inputs_embeds = inputs_embeds.filter(|_| past_len == 0);
        let (input_ids, q_len) = match &inputs_embeds {
            Some(embeds) => (None, embeds.dim(1)?),
            None => {
                let pending = match &cache_position {
                    Some(cp) => cp.dim(0)?.min(seq_len),
                    None => seq_len.saturating_sub(past_len),
                };
                if pending == 0 {
                    return Err(Error::InvalidInput("no unprocessed tokens to feed".into()));
                }
                (Some(take_last(input_ids, pending, "input_ids")?), pending)
            }
        };

        let position_ids = match (kwargs.position_ids, &attention_mask) {
            (Some(p), _) => Some(take_last(&p, q_len, "position_ids")?),
            (None, Some(mask)) => Some(take_last(
                &position_ids_from_attention_mask(mask)?,
                q_len,
                "attention_mask",
            )?),
            (None, None) => None,
        };

        Ok(ForwardInputs {
            input_ids,
            attention_mask,
            position_ids,
            past_key_values,
            inputs_embeds,
            use_cache: kwargs.use_cache,
            ..Default::default()
        })
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        self.model.device()
    }
}

impl<B> HasBackbone for LlamaForCausalLM<B> {
    type Model = B;

    fn get_model(&self) -> &B {
        &self.model
    }
}

// ─── Registration ────────────────────────────────────────────────────────────

fn config_factory(value: &serde_json::Value) -> Result<Box<dyn PretrainedConfig>> {
    Ok(Box::new(ModelConfig::from_json_value(value)?))
}

fn model_factory(config: &dyn PretrainedConfig, vb: VarBuilder) -> Result<Box<dyn CausalLm>> {
    let cfg = config
        .as_any()
        .downcast_ref::<ModelConfig>()
        .ok_or_else(|| Error::UnsupportedConfiguration("expected a llama config".into()))?;
    Ok(Box::new(LlamaForCausalLM::new(cfg, vb)?))
}

/// Register the plain Llama causal LM under `"llama"`.
pub fn register(registry: &ModelRegistry) -> bool {
    registry.register(MODEL_TYPE, config_factory, model_factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_llama_config;

    fn tiny_model() -> LlamaForCausalLM {
        let cfg = tiny_llama_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        LlamaForCausalLM::new(&cfg, vb).expect("build tiny llama")
    }

    fn ids(rows: &[&[i64]]) -> Tensor {
        let b = rows.len();
        let t = rows[0].len();
        let flat: Vec<i64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (b, t), &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_logits_shape_and_dtype() {
        let model = tiny_model();
        let out = model
            .forward(ForwardInputs::from_input_ids(ids(&[&[1, 2, 3], &[4, 5, 6]])))
            .unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, model.config().vocab_size]);
        assert_eq!(out.logits.dtype(), DType::F32);
        assert!(out.loss.is_none());
        let cache = out.past_key_values.expect("cache returned by default");
        assert_eq!(cache.seq_len(), 3);
    }

    #[test]
    fn forward_rejects_both_ids_and_embeds() {
        let model = tiny_model();
        let hidden = model.config().hidden_size;
        let embeds = Tensor::zeros((1, 2, hidden), DType::F32, &Device::Cpu).unwrap();
        let inputs = ForwardInputs {
            input_ids: Some(ids(&[&[1, 2]])),
            inputs_embeds: Some(embeds),
            ..Default::default()
        };
        assert!(matches!(model.forward(inputs), Err(Error::InvalidInput(_))));
        assert!(matches!(
            model.forward(ForwardInputs::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn embeds_and_ids_give_same_logits() {
        let model = tiny_model();
        let input_ids = ids(&[&[3, 1, 4]]);
        let embeds = model.get_model().embed_tokens(&input_ids).unwrap();

        let a = model
            .forward(ForwardInputs::from_input_ids(input_ids))
            .unwrap()
            .logits;
        let b = model.forward(ForwardInputs::from_embeds(embeds)).unwrap().logits;
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    fn assert_finite(t: &Tensor) {
        let values: Vec<f32> = t
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "non-finite values: {values:?}");
    }

    #[test]
    fn left_padded_batch_gives_finite_logits() {
        let model = tiny_model();
        let out = model
            .forward(
                ForwardInputs::from_input_ids(ids(&[&[0, 5, 6], &[4, 5, 6]]))
                    .with_attention_mask(ids(&[&[0, 1, 1], &[1, 1, 1]])),
            )
            .unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, model.config().vocab_size]);
        assert_finite(&out.logits);
    }

    #[test]
    fn left_padded_generate_gives_finite_scores() {
        let model = tiny_model();
        let options = GenerateOptions {
            output_scores: true,
            return_dict_in_generate: true,
            ..GenerateOptions::default()
                .with_max_new_tokens(3)
                .with_eos_token_ids(vec![u32::MAX])
                .with_attention_mask(ids(&[&[0, 0, 1, 1], &[1, 1, 1, 1]]))
        };
        let out = model
            .generate(Some(&ids(&[&[0, 0, 7, 8], &[3, 4, 7, 8]])), options)
            .unwrap();
        match out {
            GenerationResult::Structured { sequences, scores } => {
                assert_eq!(sequences.dims(), &[2, 7]);
                let scores = scores.expect("scores requested");
                assert_eq!(scores.len(), 3);
                scores.iter().for_each(assert_finite);
            }
            other => panic!("expected structured result, got {other:?}"),
        }
    }

    #[test]
    fn loss_with_uniform_logits_is_log_vocab() {
        // zero weights -> uniform distribution over the vocabulary
        let model = tiny_model();
        let vocab = model.config().vocab_size as f32;
        let inputs = ForwardInputs::from_input_ids(ids(&[&[1, 2, 3, 4]]))
            .with_labels(ids(&[&[IGNORE_INDEX, 2, IGNORE_INDEX, 4]]));
        let loss = model.forward(inputs).unwrap().loss.expect("loss");
        let loss = loss.to_scalar::<f32>().unwrap();
        assert!((loss - vocab.ln()).abs() < 1e-4);
    }

    #[test]
    fn all_ignored_labels_give_zero_loss() {
        let logits = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let labels = ids(&[&[IGNORE_INDEX, IGNORE_INDEX, IGNORE_INDEX]]);
        let loss = shifted_cross_entropy(&logits, &labels).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn cross_entropy_picks_target_logit() {
        let device = Device::Cpu;
        // second position predicts token 1 with certainty
        let logits = Tensor::new(&[[[0f32, 100.0, 0.0], [0.0, 0.0, 0.0]]], &device).unwrap();
        let labels = Tensor::new(&[[IGNORE_INDEX, 1]], &device).unwrap();
        let loss = shifted_cross_entropy(&logits, &labels).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn pretraining_tp_slices_match_single_head() {
        let device = Device::Cpu;
        let mut cfg = tiny_llama_config();
        cfg.vocab_size = 10;
        let weight = Tensor::randn(0f32, 1.0, (10, cfg.hidden_size), &device).unwrap();
        let hidden = Tensor::randn(0f32, 1.0, (1, 2, cfg.hidden_size), &device).unwrap();

        let build = |tp: usize| {
            let mut cfg = cfg.clone();
            cfg.pretraining_tp = tp;
            let model = LlamaModel::new(&cfg, VarBuilder::zeros(DType::F32, &device).pp("model"))
                .unwrap();
            LlamaForCausalLM {
                model,
                lm_head: Linear::new(weight.clone(), None),
                config: cfg,
            }
        };
        let a = build(1).lm_logits(&hidden).unwrap();
        let b = build(3).lm_logits(&hidden).unwrap();
        assert_eq!(b.dims(), &[1, 2, 10]);
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn hidden_states_and_attentions_are_collected() {
        let model = tiny_model();
        let layers = model.config().num_hidden_layers;
        let inputs = ForwardInputs {
            input_ids: Some(ids(&[&[1, 2, 3]])),
            output_hidden_states: Some(true),
            output_attentions: Some(true),
            ..Default::default()
        };
        let out = model.forward(inputs).unwrap();
        assert_eq!(out.hidden_states.unwrap().len(), layers + 1);
        let attentions = out.attentions.unwrap();
        assert_eq!(attentions.len(), layers);
        assert_eq!(
            attentions[0].dims(),
            &[1, model.config().num_attention_heads, 3, 3]
        );
    }

    #[test]
    fn cached_decode_extends_cache() {
        let model = tiny_model();
        let first = model
            .forward(ForwardInputs::from_input_ids(ids(&[&[1, 2, 3]])))
            .unwrap();
        let cache = first.past_key_values.unwrap();
        let next = model
            .forward(ForwardInputs::from_input_ids(ids(&[&[4]])).with_cache(cache))
            .unwrap();
        assert_eq!(next.logits.dims()[1], 1);
        assert_eq!(next.past_key_values.unwrap().seq_len(), 4);
    }

    #[test]
    fn prepare_slices_unprocessed_tokens() {
        let model = tiny_model();
        let first = model
            .forward(ForwardInputs::from_input_ids(ids(&[&[1, 2, 3]])))
            .unwrap();
        let cache = first.past_key_values.unwrap();
        let mask = ids(&[&[1, 1, 1, 1]]);
        let cache_position = Tensor::new(&[3i64], &Device::Cpu).unwrap();

        let prepared = model
            .prepare_inputs_for_generation(
                &ids(&[&[1, 2, 3, 9]]),
                Some(cache),
                Some(mask),
                None,
                Some(cache_position),
                GenerationKwargs::default(),
            )
            .unwrap();
        let input_ids: Vec<Vec<i64>> = prepared.input_ids.unwrap().to_vec2().unwrap();
        assert_eq!(input_ids, vec![vec![9]]);
        let pos: Vec<Vec<i64>> = prepared.position_ids.unwrap().to_vec2().unwrap();
        assert_eq!(pos, vec![vec![3]]);
        assert!(prepared.inputs_embeds.is_none());
    }

    #[test]
    fn prepare_uses_embeds_on_first_step_only() {
        let model = tiny_model();
        let hidden = model.config().hidden_size;
        let embeds = Tensor::zeros((1, 5, hidden), DType::F32, &Device::Cpu).unwrap();
        let empty = Tensor::from_vec(Vec::<i64>::new(), (1, 0), &Device::Cpu).unwrap();

        let prepared = model
            .prepare_inputs_for_generation(
                &empty,
                None,
                None,
                Some(embeds),
                None,
                GenerationKwargs::default(),
            )
            .unwrap();
        assert!(prepared.input_ids.is_none());
        assert_eq!(prepared.inputs_embeds.unwrap().dims(), &[1, 5, hidden]);
    }

    #[test]
    fn images_are_rejected_by_text_model() {
        let model = tiny_model();
        let images = Tensor::zeros((1, 3, 28, 28), DType::F32, &Device::Cpu).unwrap();
        let inputs = ForwardInputs::from_input_ids(ids(&[&[1]])).with_images(images, None);
        assert!(matches!(model.forward(inputs), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn tied_embeddings_share_the_embedding_matrix() {
        let mut cfg = tiny_llama_config();
        cfg.tie_word_embeddings = true;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = LlamaForCausalLM::new(&cfg, vb).unwrap();
        assert_eq!(
            model.lm_head.weight().dims(),
            model.get_model().embedding_weight().dims()
        );
    }

    #[test]
    fn register_is_idempotent() {
        let registry = ModelRegistry::new();
        assert!(register(&registry));
        assert!(!register(&registry));
        assert!(registry.contains(MODEL_TYPE));
    }
}
