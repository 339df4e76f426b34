//! Model-type registry.
//!
//! Maps a `config.json` `model_type` discriminator to a config factory and a
//! model factory. Registration is explicit and idempotent: the first
//! registration for a key wins and later ones are ignored. A static catalog
//! of Hugging Face architecture names covers configs that omit `model_type`.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use candle_nn::VarBuilder;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, info};

use super::CausalLm;
use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// A parsed model configuration, type-erased so the registry can hand it
/// back to the matching model factory.
pub trait PretrainedConfig: std::fmt::Debug + Send + Sync {
    fn model_type(&self) -> &str;

    /// Decoder configuration shared by every text model.
    fn text_config(&self) -> &ModelConfig;

    fn as_any(&self) -> &dyn Any;
}

impl PretrainedConfig for ModelConfig {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn text_config(&self) -> &ModelConfig {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type ConfigFactory = fn(&Value) -> Result<Box<dyn PretrainedConfig>>;
pub type ModelFactory = fn(&dyn PretrainedConfig, VarBuilder) -> Result<Box<dyn CausalLm>>;

#[derive(Clone, Copy)]
struct Entry {
    config_factory: ConfigFactory,
    model_factory: ModelFactory,
}

#[derive(Default)]
pub struct ModelRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model_type`. Returns `false` if the key was already taken,
    /// in which case the existing factories are kept.
    pub fn register(
        &self,
        model_type: &str,
        config_factory: ConfigFactory,
        model_factory: ModelFactory,
    ) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(model_type) {
            debug!(model_type, "model type already registered");
            return false;
        }
        entries.insert(
            model_type.to_string(),
            Entry {
                config_factory,
                model_factory,
            },
        );
        info!(model_type, "registered model type");
        true
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(model_type)
    }

    /// Registered keys, sorted.
    pub fn model_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn entry(&self, model_type: &str) -> Result<Entry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_type)
            .copied()
            .ok_or_else(|| Error::UnknownModelType(model_type.to_string()))
    }

    /// Parse a `config.json` value with the factory registered for its
    /// `model_type` (or, when absent, for its first architecture).
    pub fn load_config(&self, value: &Value) -> Result<Box<dyn PretrainedConfig>> {
        let model_type = resolve_model_type(value)?;
        let entry = self.entry(&model_type)?;
        (entry.config_factory)(value)
    }

    pub fn load_config_file(&self, path: &Path) -> Result<Box<dyn PretrainedConfig>> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        self.load_config(&value)
    }

    /// Build the causal LM registered for `config.model_type()`.
    pub fn from_config(
        &self,
        config: &dyn PretrainedConfig,
        vb: VarBuilder,
    ) -> Result<Box<dyn CausalLm>> {
        let entry = self.entry(config.model_type())?;
        info!(model_type = config.model_type(), "building model");
        (entry.model_factory)(config, vb)
    }
}

fn resolve_model_type(value: &Value) -> Result<String> {
    if let Some(model_type) = value.get("model_type").and_then(Value::as_str) {
        return Ok(model_type.to_string());
    }
    let arch = value
        .get("architectures")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .ok_or_else(|| Error::UnknownModelType("config has neither model_type nor architectures".into()))?;
    find_architecture(arch)
        .map(|info| info.model_type.to_string())
        .ok_or_else(|| Error::UnknownModelType(arch.to_string()))
}

/// Process-wide registry. Populate it with
/// [`super::register_builtin_models`] during start-up.
pub fn global() -> &'static ModelRegistry {
    static GLOBAL: Lazy<ModelRegistry> = Lazy::new(ModelRegistry::new);
    &GLOBAL
}

// ─── Static Catalog ──────────────────────────────────────────────────────────

/// Metadata for a known Hugging Face architecture name.
#[derive(Debug, Clone, Copy)]
pub struct ArchitectureInfo {
    /// `architectures` entries in `config.json` that map to this model.
    pub arch_names: &'static [&'static str],
    /// Registry key.
    pub model_type: &'static str,
    pub display_name: &'static str,
    pub multimodal: bool,
}

static ARCHITECTURES: &[ArchitectureInfo] = &[
    ArchitectureInfo {
        arch_names: &["LlamaForCausalLM", "LlamaModel", "LLaMAForCausalLM"],
        model_type: "llama",
        display_name: "Llama",
        multimodal: false,
    },
    ArchitectureInfo {
        arch_names: &["LlavaLlama3ForCausalLM", "LlavaLlamaForCausalLM"],
        model_type: "llava_llama3",
        display_name: "LLaVA-Llama3",
        multimodal: true,
    },
];

pub fn supported_architectures() -> &'static [ArchitectureInfo] {
    ARCHITECTURES
}

pub fn find_architecture(arch_name: &str) -> Option<&'static ArchitectureInfo> {
    ARCHITECTURES
        .iter()
        .find(|info| info.arch_names.contains(&arch_name))
}
