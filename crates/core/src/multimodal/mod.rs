//! Image side of the LLaVA stack: preprocessing, vision tower and projector.
//!
//! Images are encoded by a CLIP or SigLIP tower, projected into the
//! language model's hidden space and spliced into the token embedding
//! stream at `IMAGE_TOKEN_INDEX` placeholders (see `models::llava_arch`).

pub mod image_processor;
mod projector;
mod vision;

use serde::{Deserialize, Serialize};

pub use image_processor::{AspectMode, ImageProcessor, PreprocessedImages};
pub use projector::{MultimodalProjector, ProjectorConfig, ProjectorType};
pub use vision::{SelectFeature, VisionEncoderConfig, VisionEncoderType, VisionTower};

/// Placeholder id marking where image features go in `input_ids`.
pub const IMAGE_TOKEN_INDEX: i64 = -200;
/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;
/// Prompt marker replaced by `IMAGE_TOKEN_INDEX` during tokenisation.
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";

/// Original pixel size of an input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}
