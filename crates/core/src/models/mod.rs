//! Model implementations and the capability traits they are composed from.
//!
//! A causal LM (`CausalLm`) owns a decoder backbone (`Backbone`) and an LM
//! head. Multimodal backbones additionally implement `MultimodalMerge`,
//! which turns text ids plus images into a merged embedding sequence. The
//! LLaVA-Llama3 adapter only talks to these traits.

mod inputs;
pub mod llama;
pub mod llava_arch;
pub mod llava_llama3;
pub mod registry;

use candle_core::{Device, Tensor};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::kv_cache::KvCache;

pub use inputs::{
    BackboneInputs, BackboneOutput, CausalLmOutput, ForwardInputs, GenerateOptions,
    GenerationKwargs, GenerationResult, MergedInputs, MultimodalInputs,
};
pub use llama::{LlamaForCausalLM, LlamaModel};
pub use llava_arch::{LlavaMultimodalConfig, PaddingSide};
pub use llava_llama3::{LlavaLlama3Config, LlavaLlama3ForCausalLM, LlavaLlama3Model};
pub use registry::{ModelRegistry, PretrainedConfig};

/// Token-id to embedding lookup.
pub trait TokenEmbedder {
    /// `[batch, seq]` ids to `[batch, seq, hidden]` embeddings.
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor>;
}

/// Splices image features into the embedding stream.
pub trait MultimodalMerge: TokenEmbedder {
    fn prepare_inputs_labels_for_multimodal(
        &self,
        inputs: MultimodalInputs,
    ) -> Result<MergedInputs>;
}

/// Decoder stack without the LM head.
pub trait Backbone: TokenEmbedder + Send {
    fn forward(&self, inputs: BackboneInputs) -> Result<BackboneOutput>;

    fn config(&self) -> &ModelConfig;

    fn device(&self) -> &Device;

    /// Input embedding matrix `[vocab, hidden]`, used for tied LM heads.
    fn embedding_weight(&self) -> &Tensor;
}

/// Access to the backbone owned by a causal LM.
pub trait HasBackbone {
    type Model;

    fn get_model(&self) -> &Self::Model;
}

/// Causal language model: forward, generation and the per-step input
/// preparation used by the generation loop.
pub trait CausalLm: Send {
    fn forward(&self, inputs: ForwardInputs) -> Result<CausalLmOutput>;

    /// Generate from `inputs` token ids, or from `options.inputs_embeds`.
    fn generate(
        &self,
        inputs: Option<&Tensor>,
        options: GenerateOptions,
    ) -> Result<GenerationResult>;

    fn prepare_inputs_for_generation(
        &self,
        input_ids: &Tensor,
        past_key_values: Option<KvCache>,
        attention_mask: Option<Tensor>,
        inputs_embeds: Option<Tensor>,
        cache_position: Option<Tensor>,
        kwargs: GenerationKwargs,
    ) -> Result<ForwardInputs>;

    fn config(&self) -> &ModelConfig;

    fn device(&self) -> &Device;
}

/// Register every built-in model type with `registry`.
pub fn register_builtin_models(registry: &ModelRegistry) {
    llama::register(registry);
    llava_llama3::register(registry);
}
