use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_b, Activation, Linear, VarBuilder};

/// Gated MLP of the Llama family: `down(act(gate(x)) * up(x))`.
pub struct SwiGluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
}

impl SwiGluMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        hidden_act: &str,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate_proj = linear_b(hidden_size, intermediate_size, bias, vb.pp("gate_proj"))?;
        let up_proj = linear_b(hidden_size, intermediate_size, bias, vb.pp("up_proj"))?;
        let down_proj = linear_b(intermediate_size, hidden_size, bias, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            act: activation_from_str(hidden_act),
        })
    }
}

fn activation_from_str(name: &str) -> Activation {
    match name {
        "gelu" => Activation::GeluPytorchTanh,
        "gelu_new" | "gelu_pytorch_tanh" => Activation::NewGelu,
        "relu" => Activation::Relu,
        _ => Activation::Silu,
    }
}

impl Module for SwiGluMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.apply(&self.act)?;
        let up = self.up_proj.forward(xs)?;
        (gate * up)?.apply(&self.down_proj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn mlp_preserves_hidden_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mlp = SwiGluMlp::new(16, 32, "silu", false, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 3, 16), &device).unwrap();
        let out = mlp.forward(&xs).unwrap();
        assert_eq!(out.dims(), &[2, 3, 16]);
    }

    #[test]
    fn unknown_activation_falls_back_to_silu() {
        assert!(matches!(activation_from_str("silu"), Activation::Silu));
        assert!(matches!(activation_from_str("swish"), Activation::Silu));
        assert!(matches!(activation_from_str("relu"), Activation::Relu));
    }
}
