use candle_core::{DType, Result, Tensor};

/// Expand grouped key/value heads so they line up with query heads.
///
/// `[b, kv_heads, seq, d] -> [b, kv_heads * n_rep, seq, d]`
pub fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b_sz, n_kv_head, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b_sz, n_kv_head, n_rep, seq_len, head_dim))?
        .reshape((b_sz, n_kv_head * n_rep, seq_len, head_dim))
}

/// Scaled dot-product attention over `[b, heads, seq, d]` tensors.
///
/// `mask` is an additive bias broadcastable to `[b, heads, q_len, kv_len]`.
/// Returns the attention output and, when `return_weights` is set, the
/// post-softmax weights.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
    return_weights: bool,
) -> Result<(Tensor, Option<Tensor>)> {
    let in_dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;

    let mut scores = (q.matmul(&k.t()?)? * scale)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(&mask.to_dtype(DType::F32)?)?;
    }
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    let out = weights.matmul(&v)?.to_dtype(in_dtype)?;
    let weights = if return_weights {
        Some(weights.to_dtype(in_dtype)?)
    } else {
        None
    };
    Ok((out, weights))
}

/// `[b, heads, seq, d] -> [b, seq, heads * d]`
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b_sz, n_heads, seq_len, head_dim) = x.dims4()?;
    x.transpose(1, 2)?
        .contiguous()?
        .reshape((b_sz, seq_len, n_heads * head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, D};

    #[test]
    fn repeat_kv_identity_for_single_group() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 2, 3, 4), &device).unwrap();
        let y = repeat_kv(x.clone(), 1).unwrap();
        assert_eq!(y.dims(), x.dims());
    }

    #[test]
    fn repeat_kv_expands_heads() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 2, 3, 4), &device).unwrap();
        let y = repeat_kv(x.clone(), 4).unwrap();
        assert_eq!(y.dims(), &[2, 8, 3, 4]);

        // heads 0..4 are copies of kv head 0
        let h0: Vec<f32> = x.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let h3: Vec<f32> = y.narrow(1, 3, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(h0, h3);
    }

    #[test]
    fn attention_weights_sum_to_one() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (1, 2, 3, 8), &device).unwrap();

        let (out, weights) =
            scaled_dot_product_attention(&q, &k, &v, None, 1.0 / 8f64.sqrt(), true).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3, 8]);
        let weights = weights.expect("weights requested");
        let sums: Vec<f32> = weights.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn masked_positions_get_zero_weight() {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 2, 4), DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 1, 2, 4), DType::F32, &device).unwrap();
        let v = Tensor::ones((1, 1, 2, 4), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[[[0f32, f32::NEG_INFINITY], [0.0, 0.0]]]], &device).unwrap();

        let (_, weights) =
            scaled_dot_product_attention(&q, &k, &v, Some(&mask), 0.5, true).unwrap();
        let w: Vec<f32> = weights.unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(w[0], 1.0);
        assert_eq!(w[1], 0.0);
        assert!((w[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn merge_heads_flattens() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4, 3, 8), DType::F32, &device).unwrap();
        assert_eq!(merge_heads(&x).unwrap().dims(), &[2, 3, 32]);
    }
}
