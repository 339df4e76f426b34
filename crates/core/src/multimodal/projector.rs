//! Vision-language projector (`mm_projector`).
//!
//! Maps vision tower features into the language model's hidden space. The
//! checkpoint stores it as a `torch.nn.Sequential`, so MLP layers are named
//! `0`, `2`, `4`, ... with GELU modules in between.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorType {
    Linear,
    /// `mlp{depth}x_gelu`
    MlpGelu { depth: usize },
    Identity,
}

impl ProjectorType {
    /// Parse the `mm_projector_type` config string.
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "identity" => Ok(Self::Identity),
            other => other
                .strip_prefix("mlp")
                .and_then(|rest| rest.strip_suffix("x_gelu"))
                .and_then(|depth| depth.parse::<usize>().ok())
                .filter(|&depth| depth > 0)
                .map(|depth| Self::MlpGelu { depth })
                .ok_or_else(|| {
                    Error::UnsupportedConfiguration(format!("unknown projector type: {other}"))
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub projector_type: ProjectorType,
    /// `mm_hidden_size`
    pub vision_hidden_size: usize,
    pub llm_hidden_size: usize,
}

impl ProjectorConfig {
    pub fn new(
        projector_type: ProjectorType,
        vision_hidden_size: usize,
        llm_hidden_size: usize,
    ) -> Self {
        Self {
            projector_type,
            vision_hidden_size,
            llm_hidden_size,
        }
    }
}

pub struct MultimodalProjector {
    projector_type: ProjectorType,
    layers: Vec<Linear>,
}

impl MultimodalProjector {
    pub fn new(cfg: &ProjectorConfig, vb: VarBuilder) -> crate::error::Result<Self> {
        let layers = match cfg.projector_type {
            ProjectorType::Linear => vec![linear(
                cfg.vision_hidden_size,
                cfg.llm_hidden_size,
                vb,
            )?],
            ProjectorType::MlpGelu { depth } => {
                let mut layers = Vec::with_capacity(depth);
                layers.push(linear(
                    cfg.vision_hidden_size,
                    cfg.llm_hidden_size,
                    vb.pp("0"),
                )?);
                for i in 1..depth {
                    layers.push(linear(
                        cfg.llm_hidden_size,
                        cfg.llm_hidden_size,
                        vb.pp((2 * i).to_string()),
                    )?);
                }
                layers
            }
            ProjectorType::Identity => {
                if cfg.vision_hidden_size != cfg.llm_hidden_size {
                    return Err(Error::UnsupportedConfiguration(format!(
                        "identity projector needs mm_hidden_size == hidden_size ({} != {})",
                        cfg.vision_hidden_size, cfg.llm_hidden_size
                    )));
                }
                Vec::new()
            }
        };
        Ok(Self {
            projector_type: cfg.projector_type,
            layers,
        })
    }

    /// `[n, tokens, vision_hidden] -> [n, tokens, llm_hidden]`
    pub fn project(&self, features: &Tensor) -> Result<Tensor> {
        let mut xs = features.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                xs = xs.gelu_erf()?;
            }
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }

    pub fn projector_type(&self) -> ProjectorType {
        self.projector_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn parse_projector_types() {
        assert_eq!(ProjectorType::parse("linear").unwrap(), ProjectorType::Linear);
        assert_eq!(ProjectorType::parse("identity").unwrap(), ProjectorType::Identity);
        assert_eq!(
            ProjectorType::parse("mlp2x_gelu").unwrap(),
            ProjectorType::MlpGelu { depth: 2 }
        );
        assert_eq!(
            ProjectorType::parse("mlp3x_gelu").unwrap(),
            ProjectorType::MlpGelu { depth: 3 }
        );
        assert!(ProjectorType::parse("mlp0x_gelu").is_err());
        assert!(ProjectorType::parse("resampler").is_err());
    }

    #[test]
    fn mlp2x_gelu_projects_to_llm_width() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cfg = ProjectorConfig::new(ProjectorType::MlpGelu { depth: 2 }, 1024, 4096);
        let projector = MultimodalProjector::new(&cfg, vb).unwrap();

        let input = Tensor::zeros((1, 576, 1024), DType::F32, &device).unwrap();
        assert_eq!(projector.project(&input).unwrap().dims(), &[1, 576, 4096]);
    }

    #[test]
    fn linear_projector_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cfg = ProjectorConfig::new(ProjectorType::Linear, 32, 64);
        let projector = MultimodalProjector::new(&cfg, vb).unwrap();
        assert_eq!(projector.projector_type(), ProjectorType::Linear);

        let input = Tensor::zeros((2, 4, 32), DType::F32, &device).unwrap();
        assert_eq!(projector.project(&input).unwrap().dims(), &[2, 4, 64]);
    }

    #[test]
    fn identity_passes_features_through() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let cfg = ProjectorConfig::new(ProjectorType::Identity, 16, 16);
        let projector = MultimodalProjector::new(&cfg, vb).unwrap();

        let input = Tensor::randn(0f32, 1.0, (1, 3, 16), &device).unwrap();
        let out = projector.project(&input).unwrap();
        let diff = (out - &input).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn identity_rejects_width_mismatch() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let cfg = ProjectorConfig::new(ProjectorType::Identity, 16, 32);
        assert!(MultimodalProjector::new(&cfg, vb).is_err());
    }
}
