use candle_core::{DType, Device, Result, Tensor, D};

use crate::config::RopeScaling;

/// Rotary position embedding with explicit per-token positions.
///
/// Positions come from `position_ids` rather than a scalar offset so that
/// left-padded batches and merged multimodal sequences rotate correctly.
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        rope_scaling: Option<&RopeScaling>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        if let Some(scaling) = rope_scaling.filter(|s| s.rope_type == "llama3") {
            inv_freq = llama3_scaled_inv_freq(&inv_freq, scaling);
        }
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `q`/`k` (`[b, heads, seq, head_dim]`) by `position_ids` (`[b, seq]`).
    pub fn apply(&self, q: &Tensor, k: &Tensor, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b_sz, seq_len) = position_ids.dims2()?;
        let flat = position_ids.flatten_all()?.to_dtype(DType::U32)?;
        let half = self.cos.dim(1)?;
        let cos = self
            .cos
            .index_select(&flat, 0)?
            .reshape((b_sz, seq_len, half))?;
        let sin = self
            .sin
            .index_select(&flat, 0)?
            .reshape((b_sz, seq_len, half))?;
        // [b, seq, half] -> [b, 1, seq, head_dim]
        let cos = Tensor::cat(&[&cos, &cos], D::Minus1)?.unsqueeze(1)?;
        let sin = Tensor::cat(&[&sin, &sin], D::Minus1)?.unsqueeze(1)?;

        let q = rotate(&q.contiguous()?, &cos, &sin)?;
        let k = rotate(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }

    pub fn max_positions(&self) -> usize {
        self.cos.dim(0).unwrap_or(0)
    }
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let cos = cos.to_dtype(x.dtype())?;
    let sin = sin.to_dtype(x.dtype())?;
    x.broadcast_mul(&cos)? + rotate_half(x)?.broadcast_mul(&sin)?
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, last / 2)?;
    let x2 = x.narrow(D::Minus1, last / 2, last - last / 2)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

/// Llama 3.1 frequency rescaling: long wavelengths are divided by `factor`,
/// short ones kept, and the band between is interpolated.
fn llama3_scaled_inv_freq(inv_freq: &[f32], scaling: &RopeScaling) -> Vec<f32> {
    let old_context_len = scaling.original_max_position_embeddings as f32;
    let factor = scaling.factor as f32;
    let low_freq_factor = scaling.low_freq_factor as f32;
    let high_freq_factor = scaling.high_freq_factor as f32;
    let low_freq_wavelen = old_context_len / low_freq_factor;
    let high_freq_wavelen = old_context_len / high_freq_factor;

    inv_freq
        .iter()
        .map(|&freq| {
            let wavelen = 2.0 * std::f32::consts::PI / freq;
            if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / factor
            } else {
                let smooth = (old_context_len / wavelen - low_freq_factor)
                    / (high_freq_factor - low_freq_factor);
                (1.0 - smooth) * freq / factor + smooth * freq
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(b: usize, t: usize, offset: i64, device: &Device) -> Tensor {
        let data: Vec<i64> = (0..b)
            .flat_map(|_| (0..t as i64).map(move |p| p + offset))
            .collect();
        Tensor::from_vec(data, (b, t), device).unwrap()
    }

    #[test]
    fn test_rotary_embedding_new_shape() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(64, 128, 10000.0, None, DType::F32, &device)
            .expect("Failed to create RotaryEmbedding");

        assert_eq!(rope.sin.dims(), &[128, 32]);
        assert_eq!(rope.cos.dims(), &[128, 32]);
        assert_eq!(rope.max_positions(), 128);
    }

    #[test]
    fn test_rotary_position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(16, 32, 10000.0, None, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 2, 1, 16), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 2, 1, 16), &device).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k, &positions(1, 1, 0, &device)).unwrap();
        let diff_q = (q_rot - &q).unwrap().abs().unwrap().max_all().unwrap();
        let diff_k = (k_rot - &k).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff_q.to_scalar::<f32>().unwrap() < 1e-6);
        assert!(diff_k.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_rotary_preserves_norm() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(32, 64, 10000.0, None, DType::F32, &device).unwrap();
        let q = Tensor::randn(0f32, 1.0, (2, 4, 5, 32), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (2, 2, 5, 32), &device).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k, &positions(2, 5, 7, &device)).unwrap();
        assert_eq!(q_rot.dims(), &[2, 4, 5, 32]);
        assert_eq!(k_rot.dims(), &[2, 2, 5, 32]);

        let norm_before = q.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let norm_after = q_rot
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((norm_before - norm_after).abs() / norm_before < 1e-4);
    }

    #[test]
    fn test_rotary_per_row_positions_differ() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 16, 10000.0, None, DType::F32, &device).unwrap();
        let q = Tensor::ones((2, 1, 1, 8), DType::F32, &device).unwrap();
        let pos = Tensor::new(&[[0i64], [3i64]], &device).unwrap();

        let (q_rot, _) = rope.apply(&q, &q, &pos).unwrap();
        let rows: Vec<Vec<f32>> = q_rot.flatten_from(1).unwrap().to_vec2().unwrap();
        assert_ne!(rows[0], rows[1]);
    }

    #[test]
    fn test_llama3_scaling_keeps_high_freqs_and_scales_low_freqs() {
        let scaling = RopeScaling {
            rope_type: "llama3".to_string(),
            factor: 8.0,
            low_freq_factor: 1.0,
            high_freq_factor: 4.0,
            original_max_position_embeddings: 8192,
        };
        let inv_freq: Vec<f32> = (0..128)
            .step_by(2)
            .map(|i| 1.0 / 500000f32.powf(i as f32 / 128.0))
            .collect();
        let scaled = llama3_scaled_inv_freq(&inv_freq, &scaling);

        // highest frequency has the shortest wavelength and is untouched
        assert_eq!(scaled[0], inv_freq[0]);
        // lowest frequency is divided by the factor
        let last = inv_freq.len() - 1;
        assert!((scaled[last] - inv_freq[last] / 8.0).abs() < 1e-12);
    }
}
