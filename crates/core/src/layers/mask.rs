use candle_core::{DType, Device, Result, Tensor};

/// Build the additive attention bias for a decoder step.
///
/// `q_len` new positions attend to `past_len + q_len` keys. When a 2D padding
/// mask (`[b, past_len + q_len]`, 1 = keep) is given, padded keys are masked
/// as well. Returns `[b, 1, q_len, past_len + q_len]`, or `None` when no
/// position needs masking.
///
/// Masked keys get the most negative finite value of `dtype` rather than
/// `-inf`. A query row with no visible key (a left-pad slot) is left fully
/// unmasked so its softmax stays finite; its output is never read.
pub fn causal_mask(
    b_sz: usize,
    q_len: usize,
    past_len: usize,
    padding_mask: Option<&Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    let total_len = past_len + q_len;
    let keep: Option<Vec<Vec<i64>>> = match padding_mask {
        Some(m) => {
            let rows = m.to_dtype(DType::I64)?.to_vec2::<i64>()?;
            // masks for cached decode may cover only the visible tail
            Some(
                rows.into_iter()
                    .map(|row| {
                        if row.len() >= total_len {
                            row[row.len() - total_len..].to_vec()
                        } else {
                            let mut padded = vec![1; total_len - row.len()];
                            padded.extend(row);
                            padded
                        }
                    })
                    .collect(),
            )
        }
        None => None,
    };

    let has_padding = keep
        .as_ref()
        .is_some_and(|rows| rows.iter().any(|r| r.iter().any(|&v| v == 0)));
    if q_len <= 1 && !has_padding {
        return Ok(None);
    }

    let masked = masked_value(dtype);
    let mut data = Vec::with_capacity(b_sz * q_len * total_len);
    for b in 0..b_sz {
        for i in 0..q_len {
            let row_start = data.len();
            for j in 0..total_len {
                let causal_ok = j <= i + past_len;
                let pad_ok = keep
                    .as_ref()
                    .map(|rows| rows[b][j] != 0)
                    .unwrap_or(true);
                data.push(if causal_ok && pad_ok { 0.0f32 } else { masked });
            }
            if data[row_start..].iter().all(|&v| v != 0.0) {
                data[row_start..].fill(0.0);
            }
        }
    }
    let mask = Tensor::from_vec(data, (b_sz, 1, q_len, total_len), device)?;
    Ok(Some(mask.to_dtype(dtype)?))
}

/// Most negative value of `dtype` that survives the cast from f32.
pub fn masked_value(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => -65504.0,
        // f32::MIN rounds to -inf in bf16
        DType::BF16 => -3.38e38,
        _ => f32::MIN,
    }
}

/// Positions implied by a 2D padding mask: running count of kept tokens
/// minus one, with padded slots set to 1.
pub fn position_ids_from_attention_mask(mask: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len) = mask.dims2()?;
    let rows = mask.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let mut data = Vec::with_capacity(b_sz * seq_len);
    for row in rows {
        let mut kept = 0i64;
        for v in row {
            kept += v;
            data.push(if v == 0 { 1 } else { kept - 1 });
        }
    }
    Tensor::from_vec(data, (b_sz, seq_len), mask.device())
}
