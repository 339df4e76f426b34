use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Base decoder configuration as found in a Hugging Face `config.json`.
///
/// Fields the decoder does not model directly (multimodal settings,
/// `torch_dtype`, ...) land in `extra` and are read by the wrappers that need
/// them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub model_type: String,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Tensor-parallel degree used during pretraining; the LM head is
    /// evaluated in this many vocabulary slices.
    #[serde(default = "default_pretraining_tp")]
    pub pretraining_tp: usize,
    #[serde(default)]
    pub attention_bias: Option<bool>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_pretraining_tp() -> usize {
    1
}

/// `eos_token_id` is a single id in most configs and a list in Llama 3.1+.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Multiple(ids) => ids.clone(),
        }
    }
}

/// RoPE frequency scaling. Only the `llama3` scheme changes frequencies;
/// other types are accepted and ignored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RopeScaling {
    #[serde(alias = "type")]
    pub rope_type: String,
    #[serde(default = "default_scaling_factor")]
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

fn default_scaling_factor() -> f64 {
    8.0
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl ModelConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_json_value(value: &serde_json::Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Per-head dimension; derived from `hidden_size` when the config omits it.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(|v| v.as_i64())
    }

    pub fn extra_usize(&self, key: &str) -> Option<usize> {
        self.extra
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Meta-Llama-3-8B
        Self {
            architectures: vec!["LlamaForCausalLM".to_string()],
            model_type: "llama".to_string(),
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            num_hidden_layers: 32,
            intermediate_size: 14336,
            vocab_size: 128256,
            max_position_embeddings: 8192,
            head_dim: None,
            hidden_act: "silu".to_string(),
            rms_norm_eps: 1e-5,
            rope_theta: 500000.0,
            rope_scaling: None,
            tie_word_embeddings: false,
            bos_token_id: Some(128000),
            eos_token_id: Some(TokenIds::Single(128001)),
            pad_token_id: None,
            pretraining_tp: 1,
            attention_bias: None,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLAVA_LLAMA3_8B_CONFIG: &str = r#"{
        "_name_or_path": "meta-llama/Meta-Llama-3-8B-Instruct",
        "architectures": ["LlavaLlama3ForCausalLM"],
        "attention_bias": false,
        "attention_dropout": 0.0,
        "bos_token_id": 128000,
        "eos_token_id": 128009,
        "hidden_act": "silu",
        "hidden_size": 4096,
        "image_aspect_ratio": "pad",
        "initializer_range": 0.02,
        "intermediate_size": 14336,
        "max_position_embeddings": 8192,
        "mm_hidden_size": 1024,
        "mm_patch_merge_type": "flat",
        "mm_projector_type": "mlp2x_gelu",
        "mm_use_im_patch_token": false,
        "mm_use_im_start_end": false,
        "mm_vision_select_feature": "patch",
        "mm_vision_select_layer": -2,
        "mm_vision_tower": "openai/clip-vit-large-patch14-336",
        "model_type": "llava_llama3",
        "num_attention_heads": 32,
        "num_hidden_layers": 32,
        "num_key_value_heads": 8,
        "pretraining_tp": 1,
        "rms_norm_eps": 1e-05,
        "rope_scaling": null,
        "rope_theta": 500000.0,
        "tie_word_embeddings": false,
        "tokenizer_model_max_length": 4096,
        "tokenizer_padding_side": "right",
        "torch_dtype": "bfloat16",
        "transformers_version": "4.40.0",
        "use_cache": true,
        "use_mm_proj": true,
        "vocab_size": 128256
    }"#;

    #[test]
    fn parse_llava_llama3_8b_config() {
        let config = ModelConfig::from_json_str(LLAVA_LLAMA3_8B_CONFIG).expect("parse config");

        assert_eq!(config.model_type, "llava_llama3");
        assert_eq!(config.hidden_size, 4096);
        assert_eq!(config.num_attention_heads, 32);
        assert_eq!(config.num_key_value_heads, 8);
        assert_eq!(config.num_hidden_layers, 32);
        assert_eq!(config.intermediate_size, 14336);
        assert_eq!(config.vocab_size, 128256);
        assert_eq!(config.rope_theta, 500000.0);
        assert_eq!(config.pretraining_tp, 1);
        assert_eq!(config.bos_token_id, Some(128000));
        assert_eq!(config.eos_token_ids(), vec![128009]);
        assert!(config.rope_scaling.is_none());
    }

    #[test]
    fn head_dim_is_derived_when_absent() {
        let config = ModelConfig::from_json_str(LLAVA_LLAMA3_8B_CONFIG).unwrap();
        assert_eq!(config.head_dim, None);
        assert_eq!(config.head_dim(), 128);
    }

    #[test]
    fn multimodal_fields_land_in_extra() {
        let config = ModelConfig::from_json_str(LLAVA_LLAMA3_8B_CONFIG).unwrap();
        assert_eq!(
            config.extra_str("mm_vision_tower"),
            Some("openai/clip-vit-large-patch14-336")
        );
        assert_eq!(config.extra_i64("mm_vision_select_layer"), Some(-2));
        assert_eq!(config.extra_usize("mm_hidden_size"), Some(1024));
        assert_eq!(config.extra_usize("tokenizer_model_max_length"), Some(4096));
        assert!(!config.extra.contains_key("hidden_size"));
    }

    #[test]
    fn eos_token_list_and_llama3_rope_scaling() {
        let json = r#"{
            "hidden_size": 64, "num_attention_heads": 4, "num_key_value_heads": 2,
            "num_hidden_layers": 2, "intermediate_size": 128, "vocab_size": 256,
            "max_position_embeddings": 512, "rms_norm_eps": 1e-5,
            "eos_token_id": [128001, 128008, 128009],
            "rope_scaling": {
                "factor": 8.0, "low_freq_factor": 1.0, "high_freq_factor": 4.0,
                "original_max_position_embeddings": 8192, "rope_type": "llama3"
            }
        }"#;
        let config = ModelConfig::from_json_str(json).unwrap();
        assert_eq!(config.eos_token_ids(), vec![128001, 128008, 128009]);
        let scaling = config.rope_scaling.expect("rope scaling");
        assert_eq!(scaling.rope_type, "llama3");
        assert_eq!(scaling.factor, 8.0);
        assert_eq!(config.pretraining_tp, 1);
        assert_eq!(config.hidden_act, "silu");
    }

    #[test]
    fn gqa_ratio_is_correct() {
        let config = ModelConfig::from_json_str(LLAVA_LLAMA3_8B_CONFIG).unwrap();
        assert_eq!(config.num_attention_heads / config.num_key_value_heads, 4);
    }
}
