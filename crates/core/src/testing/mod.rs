//! Shared test utilities for llava-core.
//!
//! Tiny model configurations, recording mocks of the capability traits and a
//! scripted causal LM for driving the generation loop.

mod mock_model;
mod tiny_config;

pub use mock_model::{
    MockBackbone, MockCausalLm, PrepareCall, RecordedCall, RowEmbedder, ScriptedCausalLm,
};
pub use tiny_config::{tiny_llama_config, tiny_llava_config_json, tiny_llava_model_config};
