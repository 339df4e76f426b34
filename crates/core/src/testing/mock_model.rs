use std::sync::Mutex;

use candle_core::{DType, Device, Tensor};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::kv_cache::KvCache;
use crate::models::{
    CausalLm, CausalLmOutput, ForwardInputs, GenerateOptions, GenerationKwargs,
    GenerationResult, HasBackbone, MergedInputs, MultimodalInputs, MultimodalMerge,
    TokenEmbedder,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn batch_and_len(input_ids: Option<&Tensor>, inputs_embeds: Option<&Tensor>) -> Result<(usize, usize)> {
    match (inputs_embeds, input_ids) {
        (Some(e), _) => Ok((e.dim(0)?, e.dim(1)?)),
        (None, Some(ids)) => Ok(ids.dims2()?),
        (None, None) => Ok((1, 1)),
    }
}

// ─── Embedders ───────────────────────────────────────────────────────────────

/// Maps token id `t` to a `hidden`-wide row filled with `t as f32`, so
/// merged sequences can be read back from the first embedding column.
pub struct RowEmbedder {
    hidden: usize,
}

impl RowEmbedder {
    pub fn new(hidden: usize) -> Self {
        Self { hidden }
    }
}

impl TokenEmbedder for RowEmbedder {
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        let ids: Vec<i64> = input_ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?;
        let data: Vec<f32> = ids
            .iter()
            .flat_map(|&id| std::iter::repeat(id as f32).take(self.hidden))
            .collect();
        Ok(Tensor::from_vec(data, (b, t, self.hidden), input_ids.device())?)
    }
}

/// Backbone stand-in that records merge and embedding calls.
///
/// The merge returns the configured output, or passes the inputs through
/// (no embeddings) when none is set.
pub struct MockBackbone {
    embedder: RowEmbedder,
    merge_output: Mutex<Option<MergedInputs>>,
    merge_calls: Mutex<Vec<MultimodalInputs>>,
    embed_calls: Mutex<Vec<Tensor>>,
}

impl MockBackbone {
    pub fn new(hidden: usize) -> Self {
        Self {
            embedder: RowEmbedder::new(hidden),
            merge_output: Mutex::new(None),
            merge_calls: Mutex::new(Vec::new()),
            embed_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_merge_output(&self, output: MergedInputs) {
        *lock(&self.merge_output) = Some(output);
    }

    pub fn merge_calls(&self) -> Vec<MultimodalInputs> {
        lock(&self.merge_calls).clone()
    }

    pub fn embed_calls(&self) -> Vec<Tensor> {
        lock(&self.embed_calls).clone()
    }
}

impl TokenEmbedder for MockBackbone {
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        lock(&self.embed_calls).push(input_ids.clone());
        self.embedder.embed_tokens(input_ids)
    }
}

impl MultimodalMerge for MockBackbone {
    fn prepare_inputs_labels_for_multimodal(
        &self,
        inputs: MultimodalInputs,
    ) -> Result<MergedInputs> {
        lock(&self.merge_calls).push(inputs.clone());
        Ok(match lock(&self.merge_output).clone() {
            Some(output) => output,
            None => MergedInputs {
                input_ids: inputs.input_ids,
                position_ids: inputs.position_ids,
                attention_mask: inputs.attention_mask,
                past_key_values: inputs.past_key_values,
                inputs_embeds: None,
                labels: inputs.labels,
            },
        })
    }
}

// ─── Recording Causal LM ─────────────────────────────────────────────────────

/// Arguments seen by one `prepare_inputs_for_generation` call.
#[derive(Debug, Clone)]
pub struct PrepareCall {
    pub input_ids: Tensor,
    pub attention_mask: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub cache_position: Option<Tensor>,
    pub kwargs: GenerationKwargs,
}

/// Inner causal LM that records every call and returns zero logits.
pub struct MockCausalLm {
    backbone: MockBackbone,
    config: ModelConfig,
    device: Device,
    forward_calls: Mutex<Vec<ForwardInputs>>,
    generate_calls: Mutex<Vec<(Option<Tensor>, GenerateOptions)>>,
    prepare_calls: Mutex<Vec<PrepareCall>>,
}

impl MockCausalLm {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            backbone: MockBackbone::new(config.hidden_size),
            config,
            device: Device::Cpu,
            forward_calls: Mutex::new(Vec::new()),
            generate_calls: Mutex::new(Vec::new()),
            prepare_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn forward_calls(&self) -> Vec<ForwardInputs> {
        lock(&self.forward_calls).clone()
    }

    pub fn generate_calls(&self) -> Vec<(Option<Tensor>, GenerateOptions)> {
        lock(&self.generate_calls).clone()
    }

    pub fn prepare_calls(&self) -> Vec<PrepareCall> {
        lock(&self.prepare_calls).clone()
    }
}

impl HasBackbone for MockCausalLm {
    type Model = MockBackbone;

    fn get_model(&self) -> &MockBackbone {
        &self.backbone
    }
}

impl CausalLm for MockCausalLm {
    fn forward(&self, inputs: ForwardInputs) -> Result<CausalLmOutput> {
        let (b, t) = batch_and_len(inputs.input_ids.as_ref(), inputs.inputs_embeds.as_ref())?;
        lock(&self.forward_calls).push(inputs);
        Ok(CausalLmOutput {
            loss: None,
            logits: Tensor::zeros((b, t, self.config.vocab_size), DType::F32, &self.device)?,
            past_key_values: None,
            hidden_states: None,
            attentions: None,
        })
    }

    fn generate(
        &self,
        inputs: Option<&Tensor>,
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        lock(&self.generate_calls).push((inputs.cloned(), options));
        Ok(GenerationResult::Sequences(Tensor::zeros(
            (1, 1),
            DType::I64,
            &self.device,
        )?))
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
        lock(&self.prepare_calls).push(PrepareCall {
            input_ids: input_ids.clone(),
            attention_mask: attention_mask.clone(),
            inputs_embeds: inputs_embeds.clone(),
            cache_position,
            kwargs: kwargs.clone(),
        });
        Ok(ForwardInputs {
            input_ids: Some(input_ids.clone()),
            attention_mask,
            position_ids: kwargs.position_ids,
            past_key_values,
            inputs_embeds,
            use_cache: kwargs.use_cache,
            images: kwargs.images,
            image_sizes: kwargs.image_sizes,
            ..Default::default()
        })
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

// ─── Scripted Causal LM ──────────────────────────────────────────────────────

/// What the generation loop handed to one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedCall {
    pub had_embeds: bool,
    pub input_len: Option<usize>,
    pub mask_len: Option<usize>,
}

/// Causal LM whose `n`-th forward call puts all probability mass on
/// `scripts[row][n]` (the last entry repeats once a script runs out).
pub struct ScriptedCausalLm {
    scripts: Vec<Vec<u32>>,
    config: ModelConfig,
    device: Device,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedCausalLm {
    pub fn new(vocab_size: usize, scripts: Vec<Vec<u32>>) -> Self {
        let config = ModelConfig {
            vocab_size,
            eos_token_id: None,
            ..super::tiny_llama_config()
        };
        Self {
            scripts,
            config,
            device: Device::Cpu,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }
}

impl CausalLm for ScriptedCausalLm {
    fn forward(&self, inputs: ForwardInputs) -> Result<CausalLmOutput> {
        let (b, t) = batch_and_len(inputs.input_ids.as_ref(), inputs.inputs_embeds.as_ref())?;
        let step = {
            let mut calls = lock(&self.calls);
            calls.push(RecordedCall {
                had_embeds: inputs.inputs_embeds.is_some(),
                input_len: inputs.input_ids.as_ref().map(|ids| ids.dim(1)).transpose()?,
                mask_len: inputs.attention_mask.as_ref().map(|m| m.dim(1)).transpose()?,
            });
            calls.len() - 1
        };

        let vocab = self.config.vocab_size;
        let mut logits = vec![0f32; b * t * vocab];
        for (row, script) in self.scripts.iter().enumerate().take(b) {
            if let Some(&last) = script.last() {
                let token = script.get(step).copied().unwrap_or(last) as usize;
                logits[(row * t + t - 1) * vocab + token] = 10.0;
            }
        }
        Ok(CausalLmOutput {
            loss: None,
            logits: Tensor::from_vec(logits, (b, t, vocab), &self.device)?,
            past_key_values: None,
            hidden_states: None,
            attentions: None,
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
        let input_ids = match (&inputs_embeds, &cache_position) {
            (Some(_), _) => None,
            (None, Some(cp)) => {
                let len = input_ids.dim(1)?;
                let n = cp.dim(0)?.min(len);
                Some(input_ids.narrow(1, len - n, n)?)
            }
            (None, None) => Some(input_ids.clone()),
        };
        Ok(ForwardInputs {
            input_ids,
            attention_mask,
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
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_forward_logits_shape() {
        let model = MockCausalLm::new(super::super::tiny_llama_config());
        let ids = Tensor::zeros((2, 5), DType::I64, &Device::Cpu).unwrap();
        let out = model.forward(ForwardInputs::from_input_ids(ids)).unwrap();
        assert_eq!(out.logits.dims(), &[2, 5, 64]);
        assert_eq!(model.forward_calls().len(), 1);
    }

    #[test]
    fn row_embedder_fills_rows_with_ids() {
        let ids = Tensor::new(&[[3i64, 7]], &Device::Cpu).unwrap();
        let e = RowEmbedder::new(2).embed_tokens(&ids).unwrap();
        let rows: Vec<Vec<Vec<f32>>> = e.to_vec3().unwrap();
        assert_eq!(rows, vec![vec![vec![3.0, 3.0], vec![7.0, 7.0]]]);
    }

    #[test]
    fn scripted_model_peaks_on_script() {
        let model = ScriptedCausalLm::new(8, vec![vec![6]]);
        let ids = Tensor::zeros((1, 3), DType::I64, &Device::Cpu).unwrap();
        let out = model.forward(ForwardInputs::from_input_ids(ids)).unwrap();
        let last: Vec<f32> = out.logits.get(0).unwrap().get(2).unwrap().to_vec1().unwrap();
        assert_eq!(last[6], 10.0);
        assert_eq!(model.recorded_calls()[0].input_len, Some(3));
    }
}
