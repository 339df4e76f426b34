//! LLaVA on a Llama-3 decoder, registered as `"llava_llama3"`.
//!
//! The causal LM is a thin adapter: it turns images into input embeddings
//! through the backbone's [`MultimodalMerge`] capability and hands
//! everything else to an inner Llama causal LM unchanged.

use std::ops::Deref;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde_json::Value;
use tracing::debug;

use super::llama::{LlamaForCausalLM, LlamaModel};
use super::llava_arch::{
    prepare_inputs_labels_for_multimodal, LlavaMultimodalConfig, MultimodalEncoder,
};
use super::registry::{ModelRegistry, PretrainedConfig};
use super::{
    Backbone, BackboneInputs, BackboneOutput, CausalLm, CausalLmOutput, ForwardInputs,
    GenerateOptions, GenerationKwargs, GenerationResult, HasBackbone, MergedInputs,
    MultimodalInputs, MultimodalMerge, TokenEmbedder,
};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::kv_cache::KvCache;

pub const MODEL_TYPE: &str = "llava_llama3";

/// Weight prefix of the vision tower inside a LLaVA checkpoint.
pub const VISION_TOWER_PREFIX: &str = "model.vision_tower.vision_tower.vision_model";

// ─── Config ──────────────────────────────────────────────────────────────────

/// Llama configuration tagged `model_type = "llava_llama3"`.
///
/// Dereferences to the underlying [`ModelConfig`], so every base field reads
/// as `cfg.hidden_size`. The `mm_*` fields are parsed once into
/// [`LlavaMultimodalConfig`].
#[derive(Debug, Clone)]
pub struct LlavaLlama3Config {
    text: ModelConfig,
    multimodal: LlavaMultimodalConfig,
}

impl LlavaLlama3Config {
    /// Wrap a parsed base config. An empty `model_type` is filled in; any
    /// other tag is rejected.
    pub fn from_model_config(mut text: ModelConfig) -> Result<Self> {
        if text.model_type.is_empty() {
            text.model_type = MODEL_TYPE.to_string();
        } else if text.model_type != MODEL_TYPE {
            return Err(Error::UnknownModelType(format!(
                "expected {MODEL_TYPE}, got {}",
                text.model_type
            )));
        }
        let multimodal = LlavaMultimodalConfig::from_model_config(&text)?;
        Ok(Self { text, multimodal })
    }

    pub fn from_json_value(value: &Value) -> Result<Self> {
        Self::from_model_config(ModelConfig::from_json_value(value)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Self::from_model_config(ModelConfig::from_json_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_model_config(ModelConfig::from_file(path)?)
    }

    pub fn text_config(&self) -> &ModelConfig {
        &self.text
    }

    pub fn multimodal(&self) -> &LlavaMultimodalConfig {
        &self.multimodal
    }
}

impl Deref for LlavaLlama3Config {
    type Target = ModelConfig;

    fn deref(&self) -> &ModelConfig {
        &self.text
    }
}

impl PretrainedConfig for LlavaLlama3Config {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn text_config(&self) -> &ModelConfig {
        &self.text
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ─── Backbone ────────────────────────────────────────────────────────────────

/// Llama decoder plus the LLaVA image encoder.
pub struct LlavaLlama3Model {
    llama: LlamaModel,
    encoder: Option<MultimodalEncoder>,
    multimodal: LlavaMultimodalConfig,
}

impl LlavaLlama3Model {
    /// `vb` points at the checkpoint root. The tower is read from
    /// [`VISION_TOWER_PREFIX`] unless `vision_vb` (a separate tower
    /// checkpoint at its `vision_model` prefix) is given.
    pub fn new(
        cfg: &LlavaLlama3Config,
        vb: VarBuilder,
        vision_vb: Option<VarBuilder>,
    ) -> Result<Self> {
        let model_vb = vb.pp("model");
        let llama = LlamaModel::new(cfg.text_config(), model_vb.clone())?;
        let multimodal = cfg.multimodal().clone();

        let encoder = match multimodal.vision_encoder_config() {
            Some(vision_cfg) => {
                let vision_vb = vision_vb.unwrap_or_else(|| vb.pp(VISION_TOWER_PREFIX));
                Some(MultimodalEncoder::new(
                    &multimodal,
                    &vision_cfg,
                    cfg.hidden_size,
                    vision_vb,
                    model_vb,
                )?)
            }
            None => {
                debug!("no vision tower configured; running text-only");
                None
            }
        };

        Ok(Self {
            llama,
            encoder,
            multimodal,
        })
    }

    pub fn multimodal_config(&self) -> &LlavaMultimodalConfig {
        &self.multimodal
    }

    pub fn encoder(&self) -> Option<&MultimodalEncoder> {
        self.encoder.as_ref()
    }

    /// Embedding positions one image occupies after the merge.
    pub fn num_image_tokens(&self) -> Option<usize> {
        self.encoder.as_ref().map(|e| e.tower().num_image_tokens())
    }

    pub fn dtype(&self) -> DType {
        self.llama.dtype()
    }
}

impl TokenEmbedder for LlavaLlama3Model {
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.llama.embed_tokens(input_ids)
    }
}

impl MultimodalMerge for LlavaLlama3Model {
    fn prepare_inputs_labels_for_multimodal(
        &self,
        inputs: MultimodalInputs,
    ) -> Result<MergedInputs> {
        prepare_inputs_labels_for_multimodal(
            &self.llama,
            self.encoder.as_ref(),
            &self.multimodal,
            inputs,
        )
    }
}

impl Backbone for LlavaLlama3Model {
    fn forward(&self, inputs: BackboneInputs) -> Result<BackboneOutput> {
        self.llama.forward(inputs)
    }

    fn config(&self) -> &ModelConfig {
        self.llama.config()
    }

    fn device(&self) -> &Device {
        self.llama.device()
    }

    fn embedding_weight(&self) -> &Tensor {
        self.llama.embedding_weight()
    }
}

// ─── Causal LM ───────────────────────────────────────────────────────────────

/// Causal-LM adapter over an inner causal LM `L` whose backbone can merge
/// images into embeddings.
pub struct LlavaLlama3ForCausalLM<L = LlamaForCausalLM<LlavaLlama3Model>> {
    inner: L,
}

impl LlavaLlama3ForCausalLM {
    pub fn new(cfg: &LlavaLlama3Config, vb: VarBuilder) -> Result<Self> {
        Self::with_vision_weights(cfg, vb, None)
    }

    /// Build with the vision tower read from a separate checkpoint.
    pub fn with_vision_weights(
        cfg: &LlavaLlama3Config,
        vb: VarBuilder,
        vision_vb: Option<VarBuilder>,
    ) -> Result<Self> {
        let model = LlavaLlama3Model::new(cfg, vb.clone(), vision_vb)?;
        Ok(Self::from_inner(LlamaForCausalLM::from_backbone(model, vb)?))
    }
}

impl<L> LlavaLlama3ForCausalLM<L> {
    pub fn from_inner(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L> HasBackbone for LlavaLlama3ForCausalLM<L>
where
    L: HasBackbone,
{
    type Model = L::Model;

    fn get_model(&self) -> &L::Model {
        self.inner.get_model()
    }
}

impl<L> CausalLm for LlavaLlama3ForCausalLM<L>
where
    L: CausalLm + HasBackbone,
    L::Model: MultimodalMerge,
{
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
            image_sizes,
            return_dict,
        } = inputs;

        let merged = match inputs_embeds {
            Some(inputs_embeds) => MergedInputs {
                input_ids,
                position_ids,
                attention_mask,
                past_key_values,
                inputs_embeds: Some(inputs_embeds),
                labels,
            },
            None => self
                .get_model()
                .prepare_inputs_labels_for_multimodal(MultimodalInputs {
                    input_ids,
                    position_ids,
                    attention_mask,
                    past_key_values,
                    labels,
                    images,
                    image_sizes,
                })?,
        };

        self.inner.forward(ForwardInputs {
            input_ids: merged.input_ids,
            attention_mask: merged.attention_mask,
            position_ids: merged.position_ids,
            past_key_values: merged.past_key_values,
            inputs_embeds: merged.inputs_embeds,
            labels: merged.labels,
            use_cache,
            output_attentions,
            output_hidden_states,
            images: None,
            image_sizes: None,
            return_dict,
        })
    }

    /// Images (in `options.images`) are merged once up front; the inner
    /// loop then decodes from embeddings only.
    fn generate(
        &self,
        inputs: Option<&Tensor>,
        mut options: GenerateOptions,
    ) -> Result<GenerationResult> {
        let position_ids = options.position_ids.take();
        let attention_mask = options.attention_mask.take();
        if options.inputs_embeds.is_some() {
            return Err(Error::UnsupportedConfiguration(
                "`inputs_embeds` is not supported".into(),
            ));
        }
        let images = options.images.take();
        let image_sizes = options.image_sizes.take();

        let (position_ids, attention_mask, inputs_embeds) = match images {
            Some(images) => {
                let merged = self
                    .get_model()
                    .prepare_inputs_labels_for_multimodal(MultimodalInputs {
                        input_ids: inputs.cloned(),
                        position_ids,
                        attention_mask,
                        past_key_values: None,
                        labels: None,
                        images: Some(images),
                        image_sizes,
                    })?;
                let inputs_embeds = match (merged.inputs_embeds, merged.input_ids) {
                    (Some(embeds), _) => embeds,
                    (None, Some(ids)) => self.get_model().embed_tokens(&ids)?,
                    (None, None) => {
                        return Err(Error::InvalidInput("generate needs input ids".into()))
                    }
                };
                (merged.position_ids, merged.attention_mask, inputs_embeds)
            }
            None => {
                let ids = inputs
                    .ok_or_else(|| Error::InvalidInput("generate needs input ids".into()))?;
                (position_ids, attention_mask, self.get_model().embed_tokens(ids)?)
            }
        };

        options.position_ids = position_ids;
        options.attention_mask = attention_mask;
        options.inputs_embeds = Some(inputs_embeds);
        self.inner.generate(None, options)
    }

    fn prepare_inputs_for_generation(
        &self,
        input_ids: &Tensor,
        past_key_values: Option<KvCache>,
        attention_mask: Option<Tensor>,
        inputs_embeds: Option<Tensor>,
        cache_position: Option<Tensor>,
        mut kwargs: GenerationKwargs,
    ) -> Result<ForwardInputs> {
        let images = kwargs.images.take();
        let image_sizes = kwargs.image_sizes.take();
        let mut inputs = self.inner.prepare_inputs_for_generation(
            input_ids,
            past_key_values,
            attention_mask,
            inputs_embeds,
            cache_position,
            kwargs,
        )?;
        if images.is_some() {
            inputs.images = images;
        }
        if image_sizes.is_some() {
            inputs.image_sizes = image_sizes;
        }
        Ok(inputs)
    }

    fn config(&self) -> &ModelConfig {
        self.inner.config()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }
}

// ─── Registration ────────────────────────────────────────────────────────────

fn config_factory(value: &Value) -> Result<Box<dyn PretrainedConfig>> {
    Ok(Box::new(LlavaLlama3Config::from_json_value(value)?))
}

fn model_factory(config: &dyn PretrainedConfig, vb: VarBuilder) -> Result<Box<dyn CausalLm>> {
    let cfg = config
        .as_any()
        .downcast_ref::<LlavaLlama3Config>()
        .ok_or_else(|| {
            Error::UnsupportedConfiguration(format!("expected a {MODEL_TYPE} config"))
        })?;
    Ok(Box::new(LlavaLlama3ForCausalLM::new(cfg, vb)?))
}

/// Register `"llava_llama3"`. Safe to call repeatedly; only the first call
/// takes effect.
pub fn register(registry: &ModelRegistry) -> bool {
    registry.register(MODEL_TYPE, config_factory, model_factory)
}
