//! Inference control loop for Florence-2 vision-language models.
//!
//! [`FlorenceModel::run`] ties together the prompt [`tokenizer`], the
//! autoregressive [`generation`] engine, and the [`post_processing`]
//! parser. Tensor execution sits behind the [`providers::Backend`] trait;
//! the `onnx` feature supplies an ONNX Runtime implementation.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod generation;
pub mod geometry;
pub mod model;
pub mod post_processing;
pub mod providers;
pub mod quantizer;
pub mod task;
pub mod tokenizer;

#[cfg(feature = "cli")]
pub use cli::FlorenceArgs;
pub use config::{FlorenceConfig, GenerationConfig, ModelLayout, PostProcessorConfig};
pub use generation::cancel::{CancelRegistration, CancellationToken};
pub use generation::{GeneratedSequence, GenerationEngine, GenerationError};
pub use geometry::{BoundingBox, Coordinates, ImageSize};
pub use model::{FlorenceError, FlorenceModel};
pub use post_processing::{FlorenceResults, PostProcessingType, PostProcessor};
pub use providers::Backend;
pub use quantizer::{BoxQuantizer, CoordinatesQuantizer, QuantizerError, QuantizerMode};
pub use task::{Task, TaskError};
pub use tokenizer::{Tokenizer, TokenizerError};

pub mod tests;
