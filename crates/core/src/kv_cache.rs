//! Contiguous per-layer key/value cache.
//!
//! Each layer stores `[batch, num_kv_heads, seq_len, head_dim]` tensors that
//! grow along the sequence axis. The cache is a value: forward passes take it
//! by value and hand back the extended copy, which is cheap because candle
//! tensors share storage.

use candle_core::{Result, Tensor};

#[derive(Debug, Clone, Default)]
pub struct KvCache {
    layers: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions (taken from the first populated layer).
    pub fn seq_len(&self) -> usize {
        self.layers
            .iter()
            .flatten()
            .next()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len() == 0
    }

    pub fn layer(&self, layer_idx: usize) -> Option<&(Tensor, Tensor)> {
        self.layers.get(layer_idx).and_then(|l| l.as_ref())
    }

    /// Append new keys/values for `layer_idx` and return the full cached
    /// keys/values for that layer.
    pub fn append(&mut self, layer_idx: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        if layer_idx >= self.layers.len() {
            self.layers.resize(layer_idx + 1, None);
        }
        let (k, v) = match &self.layers[layer_idx] {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?.contiguous()?,
                Tensor::cat(&[prev_v, v], 2)?.contiguous()?,
            ),
            None => (k.contiguous()?, v.contiguous()?),
        };
        self.layers[layer_idx] = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn clear(&mut self) {
        for layer in self.layers.iter_mut() {
            *layer = None;
        }
    }
}
