//! CLIP / SigLIP vision towers.
//!
//! Weight names follow the Hugging Face `CLIPVisionModel` and
//! `SiglipVisionModel` layouts (`embeddings.*`, `encoder.layers.*`,
//! `post_layernorm`). LLaVA reads an intermediate hidden state rather than
//! the final output, so the tower exposes [`VisionTower::select_features`].

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, LayerNorm, Linear, VarBuilder};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionEncoderType {
    Clip,
    SigLip,
}

/// Which tokens of the selected hidden state are handed to the projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectFeature {
    /// Drop the CLS token (CLIP) and keep patch tokens.
    #[default]
    Patch,
    /// Keep CLS and patch tokens.
    ClsPatch,
}

impl SelectFeature {
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s {
            "patch" => Ok(Self::Patch),
            "cls_patch" => Ok(Self::ClsPatch),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unexpected mm_vision_select_feature: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionEncoderConfig {
    pub encoder_type: VisionEncoderType,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: String,
}

impl Default for VisionEncoderConfig {
    fn default() -> Self {
        // openai/clip-vit-large-patch14-336
        Self {
            encoder_type: VisionEncoderType::Clip,
            hidden_size: 1024,
            intermediate_size: 4096,
            num_attention_heads: 16,
            num_hidden_layers: 24,
            image_size: 336,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-5,
            hidden_act: "quick_gelu".to_string(),
        }
    }
}

impl VisionEncoderConfig {
    pub fn clip_vit_l_14_336() -> Self {
        Self::default()
    }

    pub fn clip_vit_l_14_224() -> Self {
        Self {
            image_size: 224,
            ..Self::default()
        }
    }

    pub fn siglip_so400m_384() -> Self {
        Self {
            encoder_type: VisionEncoderType::SigLip,
            hidden_size: 1152,
            intermediate_size: 4304,
            num_attention_heads: 16,
            num_hidden_layers: 27,
            image_size: 384,
            patch_size: 14,
            num_channels: 3,
            layer_norm_eps: 1e-6,
            hidden_act: "gelu_pytorch_tanh".to_string(),
        }
    }

    /// Guess the tower geometry from a checkpoint name such as
    /// `openai/clip-vit-large-patch14-336`.
    pub fn from_tower_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("siglip") {
            Self::siglip_so400m_384()
        } else if lower.contains("336") {
            Self::clip_vit_l_14_336()
        } else {
            Self::clip_vit_l_14_224()
        }
    }

    /// Read a Hugging Face vision `config.json` object. Missing fields fall
    /// back to the defaults of the matching tower family.
    pub fn from_json(value: &Value) -> Self {
        let is_siglip = value.get("model_type").and_then(Value::as_str) == Some("siglip_vision_model")
            || value.get("model_type").and_then(Value::as_str) == Some("siglip");
        let defaults = if is_siglip {
            Self::siglip_so400m_384()
        } else {
            Self::default()
        };
        let get = |key: &str, fallback: usize| -> usize {
            value
                .get(key)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(fallback)
        };
        Self {
            encoder_type: defaults.encoder_type,
            hidden_size: get("hidden_size", defaults.hidden_size),
            intermediate_size: get("intermediate_size", defaults.intermediate_size),
            num_attention_heads: get("num_attention_heads", defaults.num_attention_heads),
            num_hidden_layers: get("num_hidden_layers", defaults.num_hidden_layers),
            image_size: get("image_size", defaults.image_size),
            patch_size: get("patch_size", defaults.patch_size),
            num_channels: get("num_channels", defaults.num_channels),
            layer_norm_eps: value
                .get("layer_norm_eps")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.layer_norm_eps),
            hidden_act: value
                .get("hidden_act")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(defaults.hidden_act),
        }
    }

    pub fn num_patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        let n = self.num_patches_per_side();
        n * n
    }

    /// Encoder sequence length: CLIP prepends a CLS token, SigLIP does not.
    pub fn seq_len(&self) -> usize {
        match self.encoder_type {
            VisionEncoderType::Clip => self.num_patches() + 1,
            VisionEncoderType::SigLip => self.num_patches(),
        }
    }
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

struct VisionEmbeddings {
    patch_embedding: Conv2d,
    class_embedding: Option<Tensor>,
    position_embedding: Embedding,
    hidden_size: usize,
}

impl VisionEmbeddings {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            padding: 0,
            dilation: 1,
            groups: 1,
            cudnn_fwd_algo: None,
        };
        let (patch_embedding, class_embedding) = match cfg.encoder_type {
            VisionEncoderType::Clip => (
                candle_nn::conv2d_no_bias(
                    cfg.num_channels,
                    cfg.hidden_size,
                    cfg.patch_size,
                    conv_cfg,
                    vb.pp("patch_embedding"),
                )?,
                Some(vb.get(cfg.hidden_size, "class_embedding")?),
            ),
            VisionEncoderType::SigLip => (
                candle_nn::conv2d(
                    cfg.num_channels,
                    cfg.hidden_size,
                    cfg.patch_size,
                    conv_cfg,
                    vb.pp("patch_embedding"),
                )?,
                None,
            ),
        };
        let position_embedding =
            candle_nn::embedding(cfg.seq_len(), cfg.hidden_size, vb.pp("position_embedding"))?;
        Ok(Self {
            patch_embedding,
            class_embedding,
            position_embedding,
            hidden_size: cfg.hidden_size,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b_sz = pixel_values.dim(0)?;
        // [b, hidden, h/p, w/p] -> [b, patches, hidden]
        let mut embeddings = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten(2, 3)?
            .transpose(1, 2)?;
        if let Some(cls) = &self.class_embedding {
            let cls = cls
                .reshape((1, 1, self.hidden_size))?
                .broadcast_as((b_sz, 1, self.hidden_size))?
                .to_dtype(embeddings.dtype())?;
            embeddings = Tensor::cat(&[&cls, &embeddings], 1)?;
        }
        let seq_len = embeddings.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, pixel_values.device())?;
        embeddings.broadcast_add(&self.position_embedding.forward(&position_ids)?)
    }
}

// ─── Encoder layer ───────────────────────────────────────────────────────────

struct VisionAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl VisionAttention {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let h = cfg.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(h, h, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(h, h, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(h, h, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(h, h, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, x: Tensor, b_sz: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = xs.dims3()?;
        let q = self.split_heads(self.q_proj.forward(xs)?, b_sz, seq_len)?;
        let k = self.split_heads(self.k_proj.forward(xs)?, b_sz, seq_len)?;
        let v = self.split_heads(self.v_proj.forward(xs)?, b_sz, seq_len)?;

        let (out, _) =
            crate::layers::scaled_dot_product_attention(&q, &k, &v, None, self.scale, false)?;
        self.out_proj.forward(&crate::layers::merge_heads(&out)?)
    }
}

struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
    hidden_act: String,
}

impl VisionMlp {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: candle_nn::linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            hidden_act: cfg.hidden_act.clone(),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?;
        let hidden = match self.hidden_act.as_str() {
            "quick_gelu" => quick_gelu(&hidden)?,
            "gelu" => hidden.gelu_erf()?,
            _ => hidden.gelu()?,
        };
        self.fc2.forward(&hidden)
    }
}

/// `x * sigmoid(1.702 * x)`
fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    x.mul(&candle_nn::ops::sigmoid(&(x * 1.702)?)?)
}

struct VisionEncoderLayer {
    self_attn: VisionAttention,
    mlp: VisionMlp,
    layer_norm1: LayerNorm,
    layer_norm2: LayerNorm,
}

impl VisionEncoderLayer {
    fn new(cfg: &VisionEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            self_attn: VisionAttention::new(cfg, vb.pp("self_attn"))?,
            mlp: VisionMlp::new(cfg, vb.pp("mlp"))?,
            layer_norm1: candle_nn::layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm1"))?,
            layer_norm2: candle_nn::layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(&self.layer_norm1.forward(xs)?)?;
        let xs = (residual + xs)?;
        let residual = &xs;
        let mlp_out = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        residual + mlp_out
    }
}

// ─── Tower ───────────────────────────────────────────────────────────────────

/// Vision transformer used as the LLaVA image encoder.
pub struct VisionTower {
    embeddings: VisionEmbeddings,
    pre_layernorm: Option<LayerNorm>,
    layers: Vec<VisionEncoderLayer>,
    post_layernorm: LayerNorm,
    config: VisionEncoderConfig,
    select_layer: i64,
    select_feature: SelectFeature,
    device: Device,
    dtype: DType,
}

impl VisionTower {
    /// `vb` points at the `vision_model` prefix of the checkpoint.
    pub fn new(
        cfg: &VisionEncoderConfig,
        select_layer: i64,
        select_feature: SelectFeature,
        vb: VarBuilder,
    ) -> crate::error::Result<Self> {
        let num_states = cfg.num_hidden_layers as i64 + 1;
        if select_layer >= num_states || select_layer < -num_states {
            return Err(Error::UnsupportedConfiguration(format!(
                "mm_vision_select_layer {select_layer} out of range for {} layers",
                cfg.num_hidden_layers
            )));
        }
        let embeddings = VisionEmbeddings::new(cfg, vb.pp("embeddings"))?;
        // "pre_layrnorm" is the upstream CLIP spelling
        let pre_layernorm = match cfg.encoder_type {
            VisionEncoderType::Clip => Some(candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("pre_layrnorm"),
            )?),
            VisionEncoderType::SigLip => None,
        };
        let vb_layers = vb.pp("encoder").pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| VisionEncoderLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let post_layernorm =
            candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("post_layernorm"))?;

        Ok(Self {
            embeddings,
            pre_layernorm,
            layers,
            post_layernorm,
            config: cfg.clone(),
            select_layer,
            select_feature,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Index into the `num_hidden_layers + 1` hidden states (embeddings first).
    fn selected_state_index(&self) -> usize {
        let num_states = self.layers.len() as i64 + 1;
        if self.select_layer < 0 {
            (num_states + self.select_layer) as usize
        } else {
            self.select_layer as usize
        }
    }

    /// Run the tower only as deep as the selected hidden state.
    pub fn hidden_state(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pixel_values = pixel_values.to_dtype(self.dtype)?;
        let mut xs = self.embeddings.forward(&pixel_values)?;
        if let Some(ln) = &self.pre_layernorm {
            xs = ln.forward(&xs)?;
        }
        for layer in self.layers.iter().take(self.selected_state_index()) {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    /// Full tower output with the final layer norm.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pixel_values = pixel_values.to_dtype(self.dtype)?;
        let mut xs = self.embeddings.forward(&pixel_values)?;
        if let Some(ln) = &self.pre_layernorm {
            xs = ln.forward(&xs)?;
        }
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.post_layernorm.forward(&xs)
    }

    /// Features fed to the projector: `[n_images, tokens, vision_hidden]`.
    pub fn select_features(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden_state(pixel_values)?;
        match (self.select_feature, self.config.encoder_type) {
            (SelectFeature::Patch, VisionEncoderType::Clip) => {
                let seq_len = hidden.dim(1)?;
                hidden.narrow(1, 1, seq_len - 1)
            }
            _ => Ok(hidden),
        }
    }

    /// Tokens each image contributes after feature selection.
    pub fn num_image_tokens(&self) -> usize {
        match (self.select_feature, self.config.encoder_type) {
            (SelectFeature::Patch, _) => self.config.num_patches(),
            (SelectFeature::ClsPatch, _) => self.config.seq_len(),
        }
    }

    pub fn config(&self) -> &VisionEncoderConfig {
        &self.config
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_clip() -> VisionEncoderConfig {
        VisionEncoderConfig {
            hidden_size: 32,
            intermediate_size: 64,
            num_attention_heads: 4,
            num_hidden_layers: 3,
            image_size: 28,
            patch_size: 14,
            ..Default::default()
        }
    }

    #[test]
    fn clip_336_geometry() {
        let cfg = VisionEncoderConfig::clip_vit_l_14_336();
        assert_eq!(cfg.num_patches_per_side(), 24);
        assert_eq!(cfg.num_patches(), 576);
        assert_eq!(cfg.seq_len(), 577);
    }

    #[test]
    fn siglip_has_no_cls_token() {
        let cfg = VisionEncoderConfig::siglip_so400m_384();
        assert_eq!(cfg.num_patches(), 729);
        assert_eq!(cfg.seq_len(), 729);
    }

    #[test]
    fn tower_name_selects_family() {
        let clip = VisionEncoderConfig::from_tower_name("openai/clip-vit-large-patch14-336");
        assert_eq!(clip.encoder_type, VisionEncoderType::Clip);
        assert_eq!(clip.image_size, 336);

        let clip224 = VisionEncoderConfig::from_tower_name("openai/clip-vit-large-patch14");
        assert_eq!(clip224.image_size, 224);

        let siglip = VisionEncoderConfig::from_tower_name("google/siglip-so400m-patch14-384");
        assert_eq!(siglip.encoder_type, VisionEncoderType::SigLip);
    }

    #[test]
    fn vision_config_json_overrides_defaults() {
        let json = serde_json::json!({
            "model_type": "clip_vision_model",
            "hidden_size": 64,
            "num_hidden_layers": 2,
            "image_size": 224
        });
        let cfg = VisionEncoderConfig::from_json(&json);
        assert_eq!(cfg.hidden_size, 64);
        assert_eq!(cfg.num_hidden_layers, 2);
        assert_eq!(cfg.image_size, 224);
        assert_eq!(cfg.patch_size, 14);
        assert_eq!(cfg.hidden_act, "quick_gelu");
    }

    #[test]
    fn select_feature_parse() {
        assert_eq!(SelectFeature::parse("patch").unwrap(), SelectFeature::Patch);
        assert_eq!(SelectFeature::parse("cls_patch").unwrap(), SelectFeature::ClsPatch);
        assert!(SelectFeature::parse("cls").is_err());
    }

    #[test]
    fn patch_features_drop_cls_token() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = VisionTower::new(&tiny_clip(), -2, SelectFeature::Patch, vb).unwrap();

        let pixels = Tensor::randn(0f32, 1.0, (2, 3, 28, 28), &device).unwrap();
        let features = tower.select_features(&pixels).unwrap();
        // 2x2 patches, CLS dropped
        assert_eq!(features.dims(), &[2, 4, 32]);
        assert_eq!(tower.num_image_tokens(), 4);
    }

    #[test]
    fn cls_patch_keeps_all_tokens() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = VisionTower::new(&tiny_clip(), -1, SelectFeature::ClsPatch, vb).unwrap();

        let pixels = Tensor::randn(0f32, 1.0, (1, 3, 28, 28), &device).unwrap();
        assert_eq!(tower.select_features(&pixels).unwrap().dims(), &[1, 5, 32]);
        assert_eq!(tower.forward(&pixels).unwrap().dims(), &[1, 5, 32]);
    }

    #[test]
    fn select_layer_index_counts_embeddings_state() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let tower = VisionTower::new(&tiny_clip(), -2, SelectFeature::Patch, vb.clone()).unwrap();
        // 3 layers -> 4 hidden states; -2 is the output of layer index 1
        assert_eq!(tower.selected_state_index(), 2);

        let tower = VisionTower::new(&tiny_clip(), 0, SelectFeature::Patch, vb).unwrap();
        assert_eq!(tower.selected_state_index(), 0);
    }

    #[test]
    fn select_layer_out_of_range_is_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let result = VisionTower::new(&tiny_clip(), -5, SelectFeature::Patch, vb);
        assert!(matches!(result, Err(Error::UnsupportedConfiguration(_))));
    }

    #[test]
    fn quick_gelu_values() {
        let x = Tensor::new(&[0.0f32, 1.0, -1.0], &Device::Cpu).unwrap();
        let values: Vec<f32> = quick_gelu(&x).unwrap().to_vec1().unwrap();
        assert!(values[0].abs() < 1e-5);
        assert!((values[1] - 0.8458).abs() < 0.01);
        assert!((values[2] + 0.1542).abs() < 0.01);
    }
}
