use serde_json::{json, Value};

use crate::config::{ModelConfig, TokenIds};

/// Tiny Llama config for tests (2 layers, 32 hidden, 4 heads over 2 KV heads).
pub fn tiny_llama_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["LlamaForCausalLM".to_string()],
        model_type: "llama".to_string(),
        hidden_size: 32,
        num_attention_heads: 4,
        num_key_value_heads: 2,
        num_hidden_layers: 2,
        intermediate_size: 64,
        vocab_size: 64,
        max_position_embeddings: 128,
        head_dim: None,
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-5,
        rope_theta: 10000.0,
        rope_scaling: None,
        tie_word_embeddings: false,
        bos_token_id: Some(1),
        eos_token_id: Some(TokenIds::Single(2)),
        pad_token_id: None,
        pretraining_tp: 1,
        attention_bias: None,
        extra: serde_json::Map::new(),
    }
}

/// `config.json` of a tiny LLaVA-Llama3 checkpoint: the tiny Llama decoder,
/// a 2-layer CLIP tower on 28x28 images (4 patches of 14px) and an
/// `mlp2x_gelu` projector.
pub fn tiny_llava_config_json() -> Value {
    json!({
        "architectures": ["LlavaLlama3ForCausalLM"],
        "model_type": "llava_llama3",
        "hidden_size": 32,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "num_hidden_layers": 2,
        "intermediate_size": 64,
        "vocab_size": 64,
        "max_position_embeddings": 128,
        "rms_norm_eps": 1e-5,
        "rope_theta": 500000.0,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "pretraining_tp": 1,
        "image_aspect_ratio": "pad",
        "mm_hidden_size": 16,
        "mm_patch_merge_type": "flat",
        "mm_projector_type": "mlp2x_gelu",
        "mm_vision_select_feature": "patch",
        "mm_vision_select_layer": -2,
        "mm_vision_tower": "openai/clip-vit-large-patch14-336",
        "tokenizer_model_max_length": 128,
        "tokenizer_padding_side": "right",
        "vision_config": {
            "model_type": "clip_vision_model",
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "image_size": 28,
            "patch_size": 14,
            "hidden_act": "quick_gelu"
        }
    })
}

pub fn tiny_llava_model_config() -> ModelConfig {
    // the fixture is static; a parse failure is a bug in this file
    ModelConfig::from_json_value(&tiny_llava_config_json()).expect("tiny llava config parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_llama_config_is_valid() {
        let config = tiny_llama_config();
        assert_eq!(config.hidden_size, 32);
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.num_attention_heads % config.num_key_value_heads, 0);
        assert_eq!(config.eos_token_ids(), vec![2]);
    }

    #[test]
    fn tiny_llava_config_keeps_mm_fields() {
        let config = tiny_llava_model_config();
        assert_eq!(config.model_type, "llava_llama3");
        assert_eq!(config.extra_usize("mm_hidden_size"), Some(16));
        assert_eq!(config.extra_i64("mm_vision_select_layer"), Some(-2));
        assert!(config.extra.contains_key("vision_config"));
    }
}
