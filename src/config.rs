//! Configuration values for generation, cache layout, and post-processing.
//!
//! Every struct here is plain data passed by value into the component that
//! needs it. There are no process-wide defaults to mutate; [`Default`] gives
//! the values the published Florence-2 base checkpoints were exported with.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::quantizer::QuantizerMode;

/// Knobs for the autoregressive step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenerationConfig {
    /// Maximum decoder sequence length, including the start token.
    pub max_length: usize,
    /// Candidates requested from the sampler per step. Only the first is
    /// consumed.
    pub num_beams: usize,
    /// Candidates kept before the softmax; `0` means the whole vocabulary.
    pub top_k: usize,
    /// Size of the n-grams that may not repeat; `0` disables the ban.
    pub no_repeat_ngram_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 1025,
            num_beams: 3,
            top_k: 50,
            no_repeat_ngram_size: 3,
        }
    }
}

impl GenerationConfig {
    /// Ensure the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_length` is below two or `num_beams` is zero.
    #[must_use = "Validation should not be ignored"]
    pub fn validate(self) -> Result<Self, String> {
        if self.max_length < 2 {
            Err("max_length must be at least 2".into())
        } else if self.num_beams == 0 {
            Err("num_beams must be greater than 0".into())
        } else {
            Ok(self)
        }
    }
}

/// Shape of the decoder's attention stacks.
///
/// Used to build the empty cache handed to the backend on the first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModelLayout {
    pub num_decoder_layers: usize,
    pub num_decoder_heads: usize,
    pub decoder_hidden_size: usize,
    pub num_encoder_layers: usize,
    pub num_encoder_heads: usize,
    pub encoder_hidden_size: usize,
}

impl Default for ModelLayout {
    fn default() -> Self {
        Self {
            num_decoder_layers: 6,
            num_decoder_heads: 12,
            decoder_hidden_size: 768,
            num_encoder_layers: 6,
            num_encoder_heads: 12,
            encoder_hidden_size: 768,
        }
    }
}

impl ModelLayout {
    /// Per-head width of decoder self-attention.
    #[must_use]
    pub const fn decoder_head_dim(&self) -> usize {
        self.decoder_hidden_size / self.num_decoder_heads
    }

    /// Per-head width of cross-attention over the encoder output.
    #[must_use]
    pub const fn encoder_head_dim(&self) -> usize {
        self.encoder_hidden_size / self.num_encoder_heads
    }

    /// Ensure the layout describes at least one layer with evenly split heads.
    ///
    /// # Errors
    ///
    /// Returns an error if a count is zero or a hidden size does not divide
    /// evenly across its heads.
    #[must_use = "Validation should not be ignored"]
    pub fn validate(self) -> Result<Self, String> {
        if self.num_decoder_layers == 0 {
            return Err("num_decoder_layers must be greater than 0".into());
        }
        if self.num_decoder_heads == 0 || self.num_encoder_heads == 0 {
            return Err("attention head counts must be greater than 0".into());
        }
        if self.decoder_hidden_size % self.num_decoder_heads != 0 {
            return Err("decoder_hidden_size must be divisible by num_decoder_heads".into());
        }
        if self.encoder_hidden_size % self.num_encoder_heads != 0 {
            return Err("encoder_hidden_size must be divisible by num_encoder_heads".into());
        }
        Ok(self)
    }
}

/// Quantizer grids and polygon options for the structured-output parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PostProcessorConfig {
    pub box_bins: (u32, u32),
    pub coordinate_bins: (u32, u32),
    pub mode: QuantizerMode,
    /// Treat the first four coordinates of each polygon instance as its
    /// enclosing box.
    pub polygon_with_box_at_start: bool,
}

impl Default for PostProcessorConfig {
    fn default() -> Self {
        Self {
            box_bins: (1000, 1000),
            coordinate_bins: (1000, 1000),
            mode: QuantizerMode::Floor,
            polygon_with_box_at_start: false,
        }
    }
}

/// Everything a [`FlorenceModel`](crate::model::FlorenceModel) needs besides
/// its backend and tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlorenceConfig {
    pub generation: GenerationConfig,
    pub layout: ModelLayout,
    pub post_processing: PostProcessorConfig,
}

impl FlorenceConfig {
    /// Parses a JSON configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// fails validation.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse {}: {e}", path.display()))?;
        config.validate()
    }

    /// Validates every nested section.
    ///
    /// # Errors
    ///
    /// Returns the first section error encountered.
    #[must_use = "Validation should not be ignored"]
    pub fn validate(self) -> Result<Self, String> {
        self.generation.validate()?;
        self.layout.validate()?;
        Ok(self)
    }
}
