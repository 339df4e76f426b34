//! Checkpoint discovery and weight loading.
//!
//! A model id is either a local directory or a Hugging Face Hub repo.
//! Both are read through [`FileSource`], so single-file and sharded
//! safetensors checkpoints resolve the same way.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde_json::Value;
use tracing::{debug, info};

use crate::models::llava_llama3::{LlavaLlama3Config, LlavaLlama3ForCausalLM, VISION_TOWER_PREFIX};
use crate::models::{CausalLm, ModelRegistry};
use crate::multimodal::VisionEncoderConfig;

/// Where checkpoint files come from.
pub trait FileSource {
    /// Local path of `name`, downloading it first if needed.
    fn get(&self, name: &str) -> anyhow::Result<PathBuf>;
}

/// A checkpoint directory on disk.
pub struct LocalDir(pub PathBuf);

impl FileSource for LocalDir {
    fn get(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.0.join(name);
        anyhow::ensure!(path.exists(), "{} not found", path.display());
        Ok(path)
    }
}

struct HubRepo(hf_hub::api::sync::ApiRepo);

impl FileSource for HubRepo {
    fn get(&self, name: &str) -> anyhow::Result<PathBuf> {
        Ok(self.0.get(name)?)
    }
}

fn open_source(model_id: &str) -> anyhow::Result<Box<dyn FileSource>> {
    let local = Path::new(model_id);
    if local.is_dir() {
        debug!(path = %local.display(), "using local checkpoint directory");
        return Ok(Box::new(LocalDir(local.to_path_buf())));
    }
    let api = Api::new()?;
    Ok(Box::new(HubRepo(
        api.repo(Repo::new(model_id.to_string(), RepoType::Model)),
    )))
}

pub struct ModelFiles {
    /// Raw `config.json`; parsed by the registry for the matching model type.
    pub config: Value,
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
}

/// Resolve config, tokenizer and weights for `model_id` (local dir or Hub repo).
pub fn fetch_model(model_id: &str) -> anyhow::Result<ModelFiles> {
    let source = open_source(model_id)?;
    let files = fetch_from(source.as_ref())?;
    info!(model_id, shards = files.weights.len(), "resolved checkpoint");
    Ok(files)
}

pub fn fetch_from(source: &dyn FileSource) -> anyhow::Result<ModelFiles> {
    let config_path = source.get("config.json")?;
    let config: Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
        .with_context(|| format!("parse {}", config_path.display()))?;
    let tokenizer = source.get("tokenizer.json")?;
    let tokenizer_config = source.get("tokenizer_config.json").ok();
    let weights = load_safetensor_paths(source)?;

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
        tokenizer_config,
    })
}

/// A standalone CLIP/SigLIP checkpoint used as the image encoder.
pub struct VisionTowerFiles {
    /// `vision_config` object of the tower's `config.json`.
    pub vision_config: Value,
    pub weights: Vec<PathBuf>,
}

pub fn fetch_vision_tower(tower_id: &str) -> anyhow::Result<VisionTowerFiles> {
    let source = open_source(tower_id)?;
    let config_path = source.get("config.json")?;
    let config: Value = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
    // CLIPConfig nests the tower settings; a CLIPVisionConfig is the tower itself.
    let vision_config = config.get("vision_config").cloned().unwrap_or(config);
    let weights = load_safetensor_paths(source.as_ref())?;
    info!(tower_id, "resolved vision tower checkpoint");
    Ok(VisionTowerFiles {
        vision_config,
        weights,
    })
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Whether any tensor in `paths` lives under `prefix`.
pub fn has_tensor_prefix(paths: &[PathBuf], prefix: &str) -> anyhow::Result<bool> {
    let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::multi(paths)? };
    Ok(tensors
        .tensors()
        .iter()
        .any(|(name, _)| name.starts_with(prefix)))
}

/// Build any registered model from `files`.
pub fn load_model(
    registry: &ModelRegistry,
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<Box<dyn CausalLm>> {
    let config = registry.load_config(&files.config)?;
    let vb = load_weights(&files.weights, dtype, device)?;
    Ok(registry.from_config(config.as_ref(), vb)?)
}

/// Build a LLaVA-Llama3 model, taking the tower from `vision` when the
/// checkpoint itself does not carry tower weights.
pub fn load_llava_llama3(
    files: &ModelFiles,
    vision: Option<&VisionTowerFiles>,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<LlavaLlama3ForCausalLM> {
    let mut config_json = files.config.clone();
    let vision_vb = match vision {
        Some(tower) if !has_tensor_prefix(&files.weights, VISION_TOWER_PREFIX)? => {
            if let Some(obj) = config_json.as_object_mut() {
                obj.entry("vision_config")
                    .or_insert_with(|| tower.vision_config.clone());
            }
            let geometry = VisionEncoderConfig::from_json(&tower.vision_config);
            debug!(
                image_size = geometry.image_size,
                layers = geometry.num_hidden_layers,
                "loading separate vision tower"
            );
            Some(load_weights(&tower.weights, dtype, device)?.pp("vision_model"))
        }
        _ => None,
    };
    let cfg = LlavaLlama3Config::from_json_value(&config_json)?;
    let vb = load_weights(&files.weights, dtype, device)?;
    Ok(LlavaLlama3ForCausalLM::with_vision_weights(&cfg, vb, vision_vb)?)
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&c) = chars.peek() {
        let numeric = c.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != numeric {
                break;
            }
            run.push(c);
            chars.next();
        }
        parts.push(if numeric {
            Ok(run.parse::<u64>().unwrap_or(0))
        } else {
            Err(run)
        });
    }
    parts
}

fn load_safetensor_paths(source: &dyn FileSource) -> anyhow::Result<Vec<PathBuf>> {
    if let Ok(path) = source.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = source
        .get("model.safetensors.index.json")
        .context("no model.safetensors or model.safetensors.index.json")?;
    let index: Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in index"))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    filenames.iter().map(|f| source.get(f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            "model-00010-of-00020.safetensors".to_string(),
            "model-00002-of-00020.safetensors".to_string(),
            "model-00001-of-00020.safetensors".to_string(),
            "model-00011-of-00020.safetensors".to_string(),
        ];
        files.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
        assert_eq!(
            files,
            vec![
                "model-00001-of-00020.safetensors",
                "model-00002-of-00020.safetensors",
                "model-00010-of-00020.safetensors",
                "model-00011-of-00020.safetensors",
            ]
        );
    }

    #[test]
    fn natural_sort_handles_unpadded_numbers() {
        let mut files = vec![
            "shard-10.safetensors".to_string(),
            "shard-2.safetensors".to_string(),
            "shard-1.safetensors".to_string(),
        ];
        files.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
        assert_eq!(
            files,
            vec!["shard-1.safetensors", "shard-2.safetensors", "shard-10.safetensors"]
        );
    }

    #[test]
    fn sharded_index_resolves_unique_shards_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let index = serde_json::json!({
            "weight_map": {
                "model.norm.weight": "model-00002-of-00002.safetensors",
                "lm_head.weight": "model-00002-of-00002.safetensors",
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors"
            }
        });
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            index.to_string(),
        )
        .unwrap();
        for shard in ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"] {
            std::fs::write(dir.path().join(shard), b"").unwrap();
        }

        let paths = load_safetensor_paths(&LocalDir(dir.path().to_path_buf())).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[test]
    fn missing_weights_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_safetensor_paths(&LocalDir(dir.path().to_path_buf())).is_err());
    }

    #[test]
    fn local_directory_checkpoint_loads_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::testing::tiny_llama_config();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&cfg).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();

        // zero weights under the llama tensor names
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let h = cfg.hidden_size;
        let kv = cfg.num_key_value_heads * cfg.head_dim();
        let zeros = |shape: &[usize]| Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap();
        tensors.insert("model.embed_tokens.weight".into(), zeros(&[cfg.vocab_size, h]));
        tensors.insert("model.norm.weight".into(), zeros(&[h]));
        tensors.insert("lm_head.weight".into(), zeros(&[cfg.vocab_size, h]));
        for i in 0..cfg.num_hidden_layers {
            let p = format!("model.layers.{i}");
            tensors.insert(format!("{p}.self_attn.q_proj.weight"), zeros(&[h, h]));
            tensors.insert(format!("{p}.self_attn.k_proj.weight"), zeros(&[kv, h]));
            tensors.insert(format!("{p}.self_attn.v_proj.weight"), zeros(&[kv, h]));
            tensors.insert(format!("{p}.self_attn.o_proj.weight"), zeros(&[h, h]));
            let m = cfg.intermediate_size;
            tensors.insert(format!("{p}.mlp.gate_proj.weight"), zeros(&[m, h]));
            tensors.insert(format!("{p}.mlp.up_proj.weight"), zeros(&[m, h]));
            tensors.insert(format!("{p}.mlp.down_proj.weight"), zeros(&[h, m]));
            tensors.insert(format!("{p}.input_layernorm.weight"), zeros(&[h]));
            tensors.insert(format!("{p}.post_attention_layernorm.weight"), zeros(&[h]));
        }
        candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();

        let files = fetch_model(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.weights.len(), 1);
        assert!(files.tokenizer_config.is_none());
        assert!(!has_tensor_prefix(&files.weights, VISION_TOWER_PREFIX).unwrap());

        let registry = ModelRegistry::new();
        crate::models::register_builtin_models(&registry);
        let model = load_model(&registry, &files, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.config().hidden_size, h);
    }

    #[test]
    #[ignore] // requires network + disk space
    fn fetch_llava_llama3_8b() {
        let files = fetch_model("weizhiwang/LLaVA-Llama-3-8B").expect("failed to fetch model");
        assert_eq!(files.config["model_type"], "llava_llama3");
        assert!(!files.weights.is_empty());
        assert!(files.tokenizer.exists());
    }
}
