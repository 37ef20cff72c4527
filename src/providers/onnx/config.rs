//! Locations of the Florence-2 ONNX exports.

use std::path::Path;

use super::artefact::OnnxArtefact;
use crate::config::ModelLayout;

pub const DECODER_FILE: &str = "decoder_model_merged.onnx";
pub const EMBED_TOKENS_FILE: &str = "embed_tokens.onnx";
pub const ENCODER_FILE: &str = "encoder_model.onnx";
pub const VISION_ENCODER_FILE: &str = "vision_encoder.onnx";

/// The four networks of one checkpoint and the decoder's cache layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxBackendConfig {
    pub decoder: OnnxArtefact,
    pub embed_tokens: OnnxArtefact,
    pub encoder: OnnxArtefact,
    pub vision_encoder: OnnxArtefact,
    /// Must match the exported decoder; it sets the number of cache
    /// outputs read back after each step.
    pub layout: ModelLayout,
}

impl OnnxBackendConfig {
    /// Unpinned artefacts under their conventional names in `dir`.
    #[must_use]
    pub fn from_model_dir(dir: &Path, layout: ModelLayout) -> Self {
        Self {
            decoder: OnnxArtefact::unpinned(dir.join(DECODER_FILE)),
            embed_tokens: OnnxArtefact::unpinned(dir.join(EMBED_TOKENS_FILE)),
            encoder: OnnxArtefact::unpinned(dir.join(ENCODER_FILE)),
            vision_encoder: OnnxArtefact::unpinned(dir.join(VISION_ENCODER_FILE)),
            layout,
        }
    }
}
