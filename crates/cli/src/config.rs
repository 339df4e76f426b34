//! Persistent defaults for `llava-cli`.
//!
//! Priority: command-line flags, then `~/.config/llava-cli/config.toml`,
//! then built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Checkpoint directory or Hub id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Separate vision tower checkpoint; defaults to `mm_vision_tower`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision_tower: Option<String>,

    /// auto, bf16, fp16 or fp32.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// cpu, cuda or metal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("llava-cli").join("config.toml"))
    }

    /// Config from the default path; empty when absent or unreadable.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Overlay `other` on `self`; set fields in `other` win.
    pub fn merge(&mut self, other: &CliConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            model,
            vision_tower,
            dtype,
            device,
            max_new_tokens,
            temperature,
            top_p,
            seed,
            system_prompt,
            log_level
        );
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = CliConfig {
            model: Some("weizhiwang/LLaVA-Llama-3-8B".to_string()),
            dtype: Some("bf16".to_string()),
            max_new_tokens: Some(256),
            temperature: Some(0.2),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(CliConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn unset_fields_are_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        CliConfig {
            seed: Some(7),
            ..Default::default()
        }
        .save_to(&path)
        .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "seed = 7");
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = CliConfig {
            model: Some("base".to_string()),
            max_new_tokens: Some(64),
            ..Default::default()
        };
        base.merge(&CliConfig {
            max_new_tokens: Some(512),
            device: Some("cpu".to_string()),
            ..Default::default()
        });

        assert_eq!(base.model.as_deref(), Some("base"));
        assert_eq!(base.max_new_tokens, Some(512));
        assert_eq!(base.device.as_deref(), Some("cpu"));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_new_tokens = \"many\"").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
