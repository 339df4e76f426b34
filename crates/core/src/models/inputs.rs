//! Call payloads and results shared by the causal-LM implementations.

use candle_core::Tensor;

use crate::kv_cache::KvCache;
use crate::multimodal::ImageSize;
use crate::sampling::SamplingParams;

/// Arguments of one causal-LM forward pass.
///
/// `input_ids`, `labels` and `attention_mask` are `i64` tensors of shape
/// `[batch, seq]`; `inputs_embeds` is `[batch, seq, hidden]`; `images` is the
/// preprocessed pixel batch `[n_images, 3, H, W]`.
#[derive(Debug, Clone, Default)]
pub struct ForwardInputs {
    pub input_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub past_key_values: Option<KvCache>,
    pub inputs_embeds: Option<Tensor>,
    pub labels: Option<Tensor>,
    pub use_cache: Option<bool>,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    pub images: Option<Tensor>,
    pub image_sizes: Option<Vec<ImageSize>>,
    pub return_dict: Option<bool>,
}

impl ForwardInputs {
    pub fn from_input_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Default::default()
        }
    }

    pub fn from_embeds(inputs_embeds: Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, images: Tensor, image_sizes: Option<Vec<ImageSize>>) -> Self {
        self.images = Some(images);
        self.image_sizes = image_sizes;
        self
    }

    pub fn with_attention_mask(mut self, attention_mask: Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_cache(mut self, cache: KvCache) -> Self {
        self.past_key_values = Some(cache);
        self.use_cache = Some(true);
        self
    }
}

/// Result of a causal-LM forward pass.
#[derive(Debug, Clone)]
pub struct CausalLmOutput {
    /// Mean shifted cross-entropy over non-ignored labels.
    pub loss: Option<Tensor>,
    /// `[batch, seq, vocab]`, always f32.
    pub logits: Tensor,
    pub past_key_values: Option<KvCache>,
    /// Embedding output plus one entry per decoder layer.
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

impl CausalLmOutput {
    /// Positional view used by callers that asked for `return_dict = false`.
    #[allow(clippy::type_complexity)]
    pub fn into_tuple(
        self,
    ) -> (
        Option<Tensor>,
        Tensor,
        Option<KvCache>,
        Option<Vec<Tensor>>,
        Option<Vec<Tensor>>,
    ) {
        (
            self.loss,
            self.logits,
            self.past_key_values,
            self.hidden_states,
            self.attentions,
        )
    }
}

/// Options for [`super::CausalLm::generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub position_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    /// Pixel batch for multimodal models; merged before decoding starts.
    pub images: Option<Tensor>,
    pub image_sizes: Option<Vec<ImageSize>>,
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    /// Generation stops for a row once it emits one of these.
    pub eos_token_ids: Vec<u32>,
    /// Fills finished rows; defaults to the first eos id.
    pub pad_token_id: Option<u32>,
    pub output_scores: bool,
    pub return_dict_in_generate: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            position_ids: None,
            attention_mask: None,
            inputs_embeds: None,
            images: None,
            image_sizes: None,
            max_new_tokens: 128,
            sampling: SamplingParams::greedy(),
            eos_token_ids: Vec::new(),
            pad_token_id: None,
            output_scores: false,
            return_dict_in_generate: false,
        }
    }
}

impl GenerateOptions {
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_eos_token_ids(mut self, eos_token_ids: Vec<u32>) -> Self {
        self.eos_token_ids = eos_token_ids;
        self
    }

    pub fn with_attention_mask(mut self, attention_mask: Tensor) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_images(mut self, images: Tensor, image_sizes: Option<Vec<ImageSize>>) -> Self {
        self.images = Some(images);
        self.image_sizes = image_sizes;
        self
    }
}

/// Output of `generate`.
#[derive(Debug, Clone)]
pub enum GenerationResult {
    /// `[batch, len]` i64 token ids.
    Sequences(Tensor),
    Structured {
        sequences: Tensor,
        /// Processed scores per step, each `[batch, vocab]`.
        scores: Option<Vec<Tensor>>,
    },
}

impl GenerationResult {
    pub fn sequences(&self) -> &Tensor {
        match self {
            Self::Sequences(s) => s,
            Self::Structured { sequences, .. } => sequences,
        }
    }

    pub fn into_sequences(self) -> Tensor {
        match self {
            Self::Sequences(s) => s,
            Self::Structured { sequences, .. } => sequences,
        }
    }
}

/// Extra per-step arguments carried through `prepare_inputs_for_generation`.
#[derive(Debug, Clone, Default)]
pub struct GenerationKwargs {
    pub position_ids: Option<Tensor>,
    pub use_cache: Option<bool>,
    pub images: Option<Tensor>,
    pub image_sizes: Option<Vec<ImageSize>>,
}

/// Inputs of the multimodal merge.
#[derive(Debug, Clone, Default)]
pub struct MultimodalInputs {
    pub input_ids: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub past_key_values: Option<KvCache>,
    pub labels: Option<Tensor>,
    pub images: Option<Tensor>,
    pub image_sizes: Option<Vec<ImageSize>>,
}

/// Outputs of the multimodal merge. When images were spliced in,
/// `input_ids` is `None` and `inputs_embeds` carries the merged sequence.
#[derive(Debug, Clone, Default)]
pub struct MergedInputs {
    pub input_ids: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub past_key_values: Option<KvCache>,
    pub inputs_embeds: Option<Tensor>,
    pub labels: Option<Tensor>,
}

/// Arguments of a backbone (decoder stack) forward pass.
#[derive(Debug, Clone, Default)]
pub struct BackboneInputs {
    pub input_ids: Option<Tensor>,
    pub inputs_embeds: Option<Tensor>,
    pub attention_mask: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub past_key_values: Option<KvCache>,
    pub use_cache: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// `[batch, seq, hidden]` after the final norm.
    pub last_hidden_state: Tensor,
    pub past_key_values: Option<KvCache>,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}
