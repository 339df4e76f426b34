//! Shared decoder building blocks.

pub mod attention;
pub mod mask;
pub mod mlp;
pub mod rotary;

pub use attention::{merge_heads, repeat_kv, scaled_dot_product_attention};
pub use mask::{causal_mask, position_ids_from_attention_mask};
pub use mlp::SwiGluMlp;
pub use rotary::RotaryEmbedding;
