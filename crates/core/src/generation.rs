//! Autoregressive decoding loop shared by every `CausalLm`.
//!
//! The first step feeds the whole prompt (token ids or precomputed
//! embeddings); later steps feed one token per row against the KV cache.
//! Each step goes through `prepare_inputs_for_generation`, so wrappers can
//! intercept the per-step inputs.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};
use crate::kv_cache::KvCache;
use crate::models::{CausalLm, GenerateOptions, GenerationKwargs, GenerationResult};
use crate::sampling::Sampler;

/// Run generation on `model`.
///
/// With token ids the returned sequences are the prompt followed by the new
/// tokens. With `inputs_embeds` only the new tokens are returned, since the
/// prompt has no token representation.
pub fn generate<M: CausalLm + ?Sized>(
    model: &M,
    input_ids: Option<&Tensor>,
    options: GenerateOptions,
) -> Result<GenerationResult> {
    let GenerateOptions {
        position_ids,
        attention_mask,
        inputs_embeds,
        images,
        image_sizes: _,
        max_new_tokens,
        sampling,
        eos_token_ids,
        pad_token_id,
        output_scores,
        return_dict_in_generate,
    } = options;
    if images.is_some() {
        return Err(Error::InvalidInput(
            "images must be merged into inputs_embeds before decoding".into(),
        ));
    }
    let device = model.device().clone();

    let (b_sz, prompt_len) = match (&inputs_embeds, input_ids) {
        (Some(embeds), _) => {
            let (b, t, _) = embeds.dims3()?;
            (b, t)
        }
        (None, Some(ids)) => ids.dims2()?,
        (None, None) => {
            return Err(Error::InvalidInput(
                "generate needs input ids or inputs_embeds".into(),
            ))
        }
    };
    if prompt_len == 0 {
        return Err(Error::InvalidInput("empty prompt".into()));
    }

    let eos_token_ids = if eos_token_ids.is_empty() {
        model.config().eos_token_ids()
    } else {
        eos_token_ids
    };
    let pad_id = pad_token_id
        .or(model.config().pad_token_id)
        .or(eos_token_ids.first().copied())
        .unwrap_or(0);

    let mut sequences: Vec<Vec<i64>> = match (&inputs_embeds, input_ids) {
        (None, Some(ids)) => ids.to_dtype(DType::I64)?.to_vec2()?,
        _ => vec![Vec::new(); b_sz],
    };
    let mut histories: Vec<Vec<u32>> = sequences
        .iter()
        .map(|row| row.iter().filter(|&&t| t >= 0).map(|&t| t as u32).collect())
        .collect();

    let mut attention_mask = match attention_mask {
        Some(mask) => mask.to_dtype(DType::I64)?,
        None => Tensor::ones((b_sz, prompt_len), DType::I64, &device)?,
    };
    let mut inputs_embeds = inputs_embeds;
    let mut position_ids = position_ids;
    let mut cache: Option<KvCache> = None;
    let mut cache_position = Tensor::arange(0i64, prompt_len as i64, &device)?;
    let mut total_len = prompt_len;

    let mut sampler = Sampler::new(sampling);
    let mut finished = vec![false; b_sz];
    let mut scores = Vec::new();

    debug!(
        batch = b_sz,
        prompt_len,
        max_new_tokens,
        greedy = sampler.params().is_greedy(),
        "starting generation"
    );

    for step in 0..max_new_tokens {
        let ids = ids_tensor(&sequences, &device)?;
        let model_inputs = model.prepare_inputs_for_generation(
            &ids,
            cache.take(),
            Some(attention_mask.clone()),
            inputs_embeds.take(),
            Some(cache_position.clone()),
            GenerationKwargs {
                position_ids: position_ids.take(),
                use_cache: Some(true),
                ..Default::default()
            },
        )?;
        let output = model.forward(model_inputs)?;
        cache = output.past_key_values;

        let seq_len = output.logits.dim(1)?;
        let next_logits = output.logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let (tokens, step_scores) = sampler.sample_batch(&next_logits, &histories)?;

        for (row, token) in tokens.into_iter().enumerate() {
            let token = if finished[row] { pad_id } else { token };
            sequences[row].push(token as i64);
            histories[row].push(token);
            if !finished[row] && eos_token_ids.contains(&token) {
                finished[row] = true;
            }
        }
        if output_scores {
            let vocab = step_scores.first().map(Vec::len).unwrap_or(0);
            let flat: Vec<f32> = step_scores.concat();
            scores.push(Tensor::from_vec(flat, (b_sz, vocab), &device)?);
        }

        let ones = Tensor::ones((b_sz, 1), DType::I64, &device)?;
        attention_mask = Tensor::cat(&[&attention_mask, &ones], 1)?;
        cache_position = Tensor::new(&[total_len as i64], &device)?;
        total_len += 1;

        if finished.iter().all(|&f| f) {
            debug!(step, "all rows finished");
            break;
        }
    }

    let sequences = ids_tensor(&sequences, &device)?;
    if return_dict_in_generate {
        Ok(GenerationResult::Structured {
            sequences,
            scores: output_scores.then_some(scores),
        })
    } else {
        Ok(GenerationResult::Sequences(sequences))
    }
}

fn ids_tensor(rows: &[Vec<i64>], device: &Device) -> Result<Tensor> {
    let b_sz = rows.len();
    let len = rows.first().map(Vec::len).unwrap_or(0);
    Ok(Tensor::from_vec(rows.concat(), (b_sz, len), device)?)
}
