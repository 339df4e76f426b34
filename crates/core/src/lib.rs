//! LLaVA-Llama3: a Llama 3 decoder that reads images through a CLIP/SigLIP
//! tower and a projector, built on candle.

pub mod config;
pub mod error;
pub mod generation;
pub mod kv_cache;
pub mod layers;
pub mod loader;
pub mod models;
pub mod multimodal;
pub mod sampling;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
