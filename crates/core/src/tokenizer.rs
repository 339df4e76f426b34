use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::multimodal::{DEFAULT_IMAGE_TOKEN, IMAGE_TOKEN_INDEX};

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = ahash::AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self { inner: tokenizer }
    }

    /// Encode without adding special tokens.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

/// Tokenize a prompt containing `<image>` markers.
///
/// Each marker becomes one `IMAGE_TOKEN_INDEX`; the text between markers is
/// encoded on its own. `bos_token_id`, when given, is emitted once at the
/// start.
pub fn tokenizer_image_token(
    tokenizer: &TokenizerWrapper,
    prompt: &str,
    bos_token_id: Option<u32>,
) -> anyhow::Result<Vec<i64>> {
    let mut ids: Vec<i64> = bos_token_id.map(i64::from).into_iter().collect();
    for (i, chunk) in prompt.split(DEFAULT_IMAGE_TOKEN).enumerate() {
        if i > 0 {
            ids.push(IMAGE_TOKEN_INDEX);
        }
        if chunk.is_empty() {
            continue;
        }
        ids.extend(tokenizer.encode(chunk)?.into_iter().map(i64::from));
    }
    Ok(ids)
}

// ─── Chat Template ────────────────────────────────────────────────────────

/// Llama 3 instruct format, used when `tokenizer_config.json` has no template.
pub const LLAMA3_CHAT_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}\
<|start_header_id|>{{ message.role }}<|end_header_id|>\n\n{{ message.content | trim }}<|eot_id|>\
{% endfor %}{% if add_generation_prompt %}<|start_header_id|>assistant<|end_header_id|>\n\n{% endif %}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

pub struct ChatTemplateEngine {
    template_source: String,
    bos_token: String,
    eos_token: String,
}

#[derive(Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
    #[serde(default)]
    bos_token: SpecialToken,
    #[serde(default)]
    eos_token: SpecialToken,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Dict {
        content: String,
    },
    #[default]
    None,
}

impl SpecialToken {
    fn as_str(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Dict { content } => content,
            SpecialToken::None => "",
        }
    }
}

impl ChatTemplateEngine {
    pub fn new(template_source: String, bos_token: String, eos_token: String) -> Self {
        Self {
            template_source,
            bos_token,
            eos_token,
        }
    }

    pub fn llama3() -> Self {
        Self::new(
            LLAMA3_CHAT_TEMPLATE.to_string(),
            "<|begin_of_text|>".to_string(),
            "<|eot_id|>".to_string(),
        )
    }

    /// Template from `tokenizer_config.json`, falling back to
    /// [`LLAMA3_CHAT_TEMPLATE`] when the file has none.
    pub fn from_tokenizer_config(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TokenizerConfig = serde_json::from_str(&content)?;
        let template_source = match config.chat_template {
            Some(t) => t,
            None => {
                tracing::debug!(path = %path.display(), "no chat_template, using llama3 format");
                LLAMA3_CHAT_TEMPLATE.to_string()
            }
        };
        Ok(Self {
            template_source,
            bos_token: config.bos_token.as_str().to_string(),
            eos_token: config.eos_token.as_str().to_string(),
        })
    }

    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    pub fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String> {
        let mut env = minijinja::Environment::new();
        env.add_template("chat", &self.template_source)?;
        let tmpl = env.get_template("chat")?;
        let rendered = tmpl.render(minijinja::context! {
            messages => messages,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }
}
