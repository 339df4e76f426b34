//! LLaVA multimodal capability shared by the LLaVA text backbones.
//!
//! Owns the `mm_*` settings read from `config.json`, the image encoder
//! (vision tower + projector) and the merge that turns ids containing
//! `IMAGE_TOKEN_INDEX` placeholders into one embedding sequence per row.

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;
use tracing::debug;

use super::{MergedInputs, MultimodalInputs, TokenEmbedder};
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::multimodal::{
    AspectMode, MultimodalProjector, ProjectorConfig, ProjectorType, SelectFeature,
    VisionEncoderConfig, VisionTower, IGNORE_INDEX, IMAGE_TOKEN_INDEX,
};

/// Side on which merged rows are padded to a common length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

impl PaddingSide {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown tokenizer_padding_side: {other}"
            ))),
        }
    }
}

/// How per-image features are laid out before splicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchMergeType {
    #[default]
    Flat,
    /// Single-tile `spatial`: same layout as `flat`.
    Spatial,
    /// `spatial_unpad`: a learned `image_newline` row follows each image.
    SpatialUnpad,
}

impl PatchMergeType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(Self::Flat),
            "spatial" => Ok(Self::Spatial),
            "spatial_unpad" => Ok(Self::SpatialUnpad),
            other => Err(Error::UnsupportedConfiguration(format!(
                "unknown mm_patch_merge_type: {other}"
            ))),
        }
    }
}

/// `mm_*` and tokenizer settings of a LLaVA checkpoint.
#[derive(Debug, Clone)]
pub struct LlavaMultimodalConfig {
    /// Tower checkpoint name, e.g. `openai/clip-vit-large-patch14-336`.
    pub mm_vision_tower: Option<String>,
    pub mm_hidden_size: Option<usize>,
    pub mm_projector_type: ProjectorType,
    pub mm_vision_select_layer: i64,
    pub mm_vision_select_feature: SelectFeature,
    pub mm_patch_merge_type: PatchMergeType,
    pub image_aspect_ratio: AspectMode,
    pub tokenizer_model_max_length: Option<usize>,
    pub tokenizer_padding_side: PaddingSide,
    /// Explicit tower geometry; otherwise guessed from `mm_vision_tower`.
    pub vision_config: Option<VisionEncoderConfig>,
}

impl Default for LlavaMultimodalConfig {
    fn default() -> Self {
        Self {
            mm_vision_tower: None,
            mm_hidden_size: None,
            mm_projector_type: ProjectorType::Linear,
            mm_vision_select_layer: -2,
            mm_vision_select_feature: SelectFeature::Patch,
            mm_patch_merge_type: PatchMergeType::Flat,
            image_aspect_ratio: AspectMode::Pad,
            tokenizer_model_max_length: None,
            tokenizer_padding_side: PaddingSide::Right,
            vision_config: None,
        }
    }
}

impl LlavaMultimodalConfig {
    /// Read the multimodal fields kept in `cfg.extra`.
    pub fn from_model_config(cfg: &ModelConfig) -> Result<Self> {
        let defaults = Self::default();
        let mm_projector_type = match cfg.extra_str("mm_projector_type") {
            Some(s) => ProjectorType::parse(s)?,
            None => defaults.mm_projector_type,
        };
        let mm_vision_select_feature = match cfg.extra_str("mm_vision_select_feature") {
            Some(s) => SelectFeature::parse(s)?,
            None => defaults.mm_vision_select_feature,
        };
        let mm_patch_merge_type = match cfg.extra_str("mm_patch_merge_type") {
            Some(s) => PatchMergeType::parse(s)?,
            None => defaults.mm_patch_merge_type,
        };
        let image_aspect_ratio = match cfg.extra_str("image_aspect_ratio") {
            Some(s) => AspectMode::parse(s)?,
            None => defaults.image_aspect_ratio,
        };
        let tokenizer_padding_side = match cfg.extra_str("tokenizer_padding_side") {
            Some(s) => PaddingSide::parse(s)?,
            None => defaults.tokenizer_padding_side,
        };
        let vision_config = cfg
            .extra
            .get("vision_config")
            .filter(|v| v.is_object())
            .map(VisionEncoderConfig::from_json);

        Ok(Self {
            mm_vision_tower: cfg.extra_str("mm_vision_tower").map(str::to_string),
            mm_hidden_size: cfg.extra_usize("mm_hidden_size"),
            mm_projector_type,
            mm_vision_select_layer: cfg
                .extra_i64("mm_vision_select_layer")
                .unwrap_or(defaults.mm_vision_select_layer),
            mm_vision_select_feature,
            mm_patch_merge_type,
            image_aspect_ratio,
            tokenizer_model_max_length: cfg.extra_usize("tokenizer_model_max_length"),
            tokenizer_padding_side,
            vision_config,
        })
    }

    /// Whether the checkpoint declares an image encoder at all.
    pub fn has_vision_tower(&self) -> bool {
        self.mm_vision_tower.is_some() || self.vision_config.is_some()
    }

    /// Tower geometry, if any tower is configured.
    pub fn vision_encoder_config(&self) -> Option<VisionEncoderConfig> {
        match (&self.vision_config, &self.mm_vision_tower) {
            (Some(cfg), _) => Some(cfg.clone()),
            (None, Some(name)) => Some(VisionEncoderConfig::from_tower_name(name)),
            (None, None) => None,
        }
    }
}

// ─── Image Encoder ───────────────────────────────────────────────────────────

/// Vision tower, projector and optional `image_newline`.
pub struct MultimodalEncoder {
    tower: VisionTower,
    projector: MultimodalProjector,
    image_newline: Option<Tensor>,
}

impl MultimodalEncoder {
    /// `vision_vb` points at the tower's `vision_model` prefix, `model_vb`
    /// at the LLaVA `model` prefix (holding `mm_projector`).
    pub fn new(
        mm: &LlavaMultimodalConfig,
        vision_cfg: &VisionEncoderConfig,
        llm_hidden_size: usize,
        vision_vb: VarBuilder,
        model_vb: VarBuilder,
    ) -> Result<Self> {
        let tower = VisionTower::new(
            vision_cfg,
            mm.mm_vision_select_layer,
            mm.mm_vision_select_feature,
            vision_vb,
        )?;
        let vision_hidden = mm.mm_hidden_size.unwrap_or(vision_cfg.hidden_size);
        if vision_hidden != vision_cfg.hidden_size {
            return Err(Error::UnsupportedConfiguration(format!(
                "mm_hidden_size {vision_hidden} does not match vision hidden size {}",
                vision_cfg.hidden_size
            )));
        }
        let projector = MultimodalProjector::new(
            &ProjectorConfig::new(mm.mm_projector_type, vision_hidden, llm_hidden_size),
            model_vb.pp("mm_projector"),
        )?;
        let image_newline = match mm.mm_patch_merge_type {
            PatchMergeType::SpatialUnpad => {
                Some(model_vb.get(llm_hidden_size, "image_newline")?)
            }
            PatchMergeType::Flat | PatchMergeType::Spatial => None,
        };
        Ok(Self {
            tower,
            projector,
            image_newline,
        })
    }

    pub fn tower(&self) -> &VisionTower {
        &self.tower
    }

    /// `[n_images, 3, H, W]` pixels to `[n_images, tokens, llm_hidden]`.
    pub fn encode_images(&self, images: &Tensor) -> Result<Tensor> {
        let features = self.tower.select_features(images)?;
        let projected = self.projector.project(&features)?;
        match &self.image_newline {
            Some(newline) => {
                let (n, _, hidden) = projected.dims3()?;
                let newline = newline
                    .to_dtype(projected.dtype())?
                    .reshape((1, 1, hidden))?
                    .broadcast_as((n, 1, hidden))?;
                Ok(Tensor::cat(&[&projected, &newline], 1)?)
            }
            None => Ok(projected),
        }
    }
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// LLaVA `prepare_inputs_labels_for_multimodal`.
///
/// Returns the inputs untouched when there are no images, no ids, or a
/// single-token (decode) step. Otherwise every row is stripped of padding,
/// split at `IMAGE_TOKEN_INDEX` and rebuilt as text embeddings interleaved
/// with image features, which are labelled `IGNORE_INDEX`. Rows are then
/// truncated to `tokenizer_model_max_length` and zero-padded on
/// `tokenizer_padding_side`. `labels`, `attention_mask` and `position_ids`
/// come back only if they were supplied.
pub fn prepare_inputs_labels_for_multimodal<E: TokenEmbedder + ?Sized>(
    embedder: &E,
    encoder: Option<&MultimodalEncoder>,
    mm: &LlavaMultimodalConfig,
    inputs: MultimodalInputs,
) -> Result<MergedInputs> {
    let MultimodalInputs {
        input_ids,
        position_ids,
        attention_mask,
        past_key_values,
        labels,
        images,
        image_sizes: _,
    } = inputs;

    let (input_ids, images) = match (input_ids, images) {
        (Some(ids), Some(images)) if ids.dim(1)? > 1 => (ids, images),
        (input_ids, _) => {
            return Ok(MergedInputs {
                input_ids,
                position_ids,
                attention_mask,
                past_key_values,
                inputs_embeds: None,
                labels,
            })
        }
    };
    let encoder = encoder.ok_or_else(|| {
        Error::Multimodal("images were passed but the model has no vision tower".into())
    })?;
    if images.rank() != 4 {
        return Err(Error::Multimodal(format!(
            "expected images of shape [n, 3, H, W], got {:?}",
            images.dims()
        )));
    }

    let image_features = encoder.encode_images(&images)?;
    merge_image_features(
        embedder,
        &image_features,
        mm,
        MultimodalInputs {
            input_ids: Some(input_ids),
            position_ids,
            attention_mask,
            past_key_values,
            labels,
            images: None,
            image_sizes: None,
        },
    )
}

/// Splice already-projected `image_features` (`[n_images, tokens, hidden]`)
/// into the rows of `inputs.input_ids`.
pub fn merge_image_features<E: TokenEmbedder + ?Sized>(
    embedder: &E,
    image_features: &Tensor,
    mm: &LlavaMultimodalConfig,
    inputs: MultimodalInputs,
) -> Result<MergedInputs> {
    let MultimodalInputs {
        input_ids,
        position_ids,
        attention_mask,
        past_key_values,
        labels,
        ..
    } = inputs;
    let input_ids =
        input_ids.ok_or_else(|| Error::Multimodal("merge needs input_ids".into()))?;
    let device = input_ids.device().clone();
    let (b_sz, seq_len) = input_ids.dims2()?;
    let n_images = image_features.dim(0)?;

    let ids: Vec<Vec<i64>> = input_ids.to_dtype(DType::I64)?.to_vec2()?;
    let keep: Vec<Vec<bool>> = match &attention_mask {
        Some(mask) => {
            if mask.dims2()? != (b_sz, seq_len) {
                return Err(Error::InvalidInput(format!(
                    "attention_mask shape {:?} does not match input_ids ({b_sz}, {seq_len})",
                    mask.dims()
                )));
            }
            let rows: Vec<Vec<i64>> = mask.to_dtype(DType::I64)?.to_vec2()?;
            rows.into_iter()
                .map(|r| r.into_iter().map(|v| v != 0).collect())
                .collect()
        }
        None => vec![vec![true; seq_len]; b_sz],
    };
    let label_rows: Vec<Vec<i64>> = match &labels {
        Some(l) => l.to_dtype(DType::I64)?.to_vec2()?,
        None => vec![vec![IGNORE_INDEX; seq_len]; b_sz],
    };

    let mut row_embeds: Vec<Tensor> = Vec::with_capacity(b_sz);
    let mut row_labels: Vec<Vec<i64>> = Vec::with_capacity(b_sz);
    let mut embed_dtype = image_features.dtype();
    let mut cur_image_idx = 0usize;

    for row in 0..b_sz {
        let (cur_ids, cur_labels): (Vec<i64>, Vec<i64>) = ids[row]
            .iter()
            .zip(&label_rows[row])
            .zip(&keep[row])
            .filter(|(_, &k)| k)
            .map(|((&id, &label), _)| (id, label))
            .unzip();

        let image_positions: Vec<usize> = cur_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == IMAGE_TOKEN_INDEX)
            .map(|(i, _)| i)
            .collect();

        // Text segments between placeholders, embedded in one lookup.
        let mut bounds = Vec::with_capacity(image_positions.len() + 2);
        bounds.push(-1i64);
        bounds.extend(image_positions.iter().map(|&p| p as i64));
        bounds.push(cur_ids.len() as i64);
        let segments: Vec<(usize, usize)> = bounds
            .windows(2)
            .map(|w| ((w[0] + 1) as usize, w[1] as usize))
            .collect();
        let text_ids: Vec<i64> = segments
            .iter()
            .flat_map(|&(s, e)| cur_ids[s..e].iter().copied())
            .collect();
        let text_embeds = if text_ids.is_empty() {
            None
        } else {
            let n = text_ids.len();
            let t = Tensor::from_vec(text_ids, (1, n), &device)?;
            let e = embedder.embed_tokens(&t)?.squeeze(0)?;
            embed_dtype = e.dtype();
            Some(e)
        };

        if image_positions.is_empty() {
            // A row without placeholders still consumes an image slot.
            cur_image_idx += 1;
            match text_embeds {
                Some(e) => row_embeds.push(e),
                None => row_embeds.push(Tensor::zeros(
                    (0, image_features.dim(2)?),
                    embed_dtype,
                    &device,
                )?),
            }
            row_labels.push(cur_labels);
            continue;
        }

        let mut parts: Vec<Tensor> = Vec::with_capacity(2 * segments.len());
        let mut new_labels: Vec<i64> = Vec::new();
        let mut offset = 0usize;
        for (i, &(s, e)) in segments.iter().enumerate() {
            let len = e - s;
            if len > 0 {
                if let Some(text) = &text_embeds {
                    parts.push(text.narrow(0, offset, len)?);
                }
                new_labels.extend_from_slice(&cur_labels[s..e]);
                offset += len;
            }
            if i < image_positions.len() {
                if cur_image_idx >= n_images {
                    return Err(Error::Multimodal(format!(
                        "{} image placeholders exceed the {n_images} images supplied",
                        cur_image_idx + 1
                    )));
                }
                let feature = image_features.get(cur_image_idx)?;
                new_labels.extend(std::iter::repeat(IGNORE_INDEX).take(feature.dim(0)?));
                parts.push(feature);
                cur_image_idx += 1;
            }
        }
        let parts = parts
            .iter()
            .map(|p| p.to_dtype(embed_dtype))
            .collect::<candle_core::Result<Vec<_>>>()?;
        row_embeds.push(Tensor::cat(&parts, 0)?);
        row_labels.push(new_labels);
    }

    if let Some(max_len) = mm.tokenizer_model_max_length {
        for (embeds, labels) in row_embeds.iter_mut().zip(row_labels.iter_mut()) {
            if labels.len() > max_len {
                *embeds = embeds.narrow(0, 0, max_len)?;
                labels.truncate(max_len);
            }
        }
    }

    let max_len = row_labels.iter().map(Vec::len).max().unwrap_or(0);
    let hidden = image_features.dim(D::Minus1)?;
    debug!(
        batch = b_sz,
        images = n_images,
        merged_len = max_len,
        padding_side = ?mm.tokenizer_padding_side,
        "merged image features into embeddings"
    );

    let mut padded_embeds = Vec::with_capacity(b_sz);
    let mut padded_labels = vec![IGNORE_INDEX; b_sz * max_len];
    let mut padded_mask = vec![0i64; b_sz * max_len];
    let mut padded_pos = vec![0i64; b_sz * max_len];

    for (row, (embeds, labels)) in row_embeds.iter().zip(&row_labels).enumerate() {
        let cur_len = labels.len();
        let pad = max_len - cur_len;
        let start = match mm.tokenizer_padding_side {
            PaddingSide::Left => pad,
            PaddingSide::Right => 0,
        };
        let row_tensor = if pad == 0 {
            embeds.clone()
        } else if cur_len == 0 {
            Tensor::zeros((max_len, hidden), embed_dtype, &device)?
        } else {
            let zeros = Tensor::zeros((pad, hidden), embed_dtype, &device)?;
            match mm.tokenizer_padding_side {
                PaddingSide::Left => Tensor::cat(&[&zeros, embeds], 0)?,
                PaddingSide::Right => Tensor::cat(&[embeds, &zeros], 0)?,
            }
        };
        padded_embeds.push(row_tensor);

        let base = row * max_len + start;
        padded_labels[base..base + cur_len].copy_from_slice(labels);
        padded_mask[base..base + cur_len].fill(1);
        for (j, p) in padded_pos[base..base + cur_len].iter_mut().enumerate() {
            *p = j as i64;
        }
    }

    let inputs_embeds = Tensor::stack(&padded_embeds, 0)?;
    let new_labels = labels
        .map(|_| Tensor::from_vec(padded_labels, (b_sz, max_len), &device))
        .transpose()?;
    let new_mask = attention_mask
        .map(|m| Tensor::from_vec(padded_mask, (b_sz, max_len), &device)?.to_dtype(m.dtype()))
        .transpose()?;
    let new_pos = position_ids
        .map(|p| Tensor::from_vec(padded_pos, (b_sz, max_len), &device)?.to_dtype(p.dtype()))
        .transpose()?;

    Ok(MergedInputs {
        input_ids: None,
        position_ids: new_pos,
        attention_mask: new_mask,
        past_key_values,
        inputs_embeds: Some(inputs_embeds),
        labels: new_labels,
    })
}
