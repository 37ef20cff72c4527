//! The end-to-end Florence-2 pipeline.
//!
//! [`FlorenceModel::run`] builds the task prompt, merges image features in
//! front of the prompt embeddings, encodes, generates, decodes, and parses
//! the generated text into [`FlorenceResults`] for each image.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayView4, Axis, ShapeError, concatenate};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::FlorenceConfig;
use crate::generation::cancel::CancellationToken;
use crate::generation::{GenerationEngine, GenerationError, GenerationTokens};
use crate::geometry::ImageSize;
use crate::post_processing::{FlorenceResults, PostProcessor};
use crate::providers::Backend;
use crate::quantizer::QuantizerError;
use crate::task::{Task, TaskError};
use crate::tokenizer::{Tokenizer, TokenizerError};

/// Errors raised by [`FlorenceModel`].
#[derive(Debug, Error)]
pub enum FlorenceError<E> {
    #[error("unknown task {0:?}")]
    UnknownTask(String),
    #[error("task {0} requires text input")]
    MissingTextInput(Task),
    #[error("{images} images supplied with {sizes} image sizes")]
    BatchMismatch { images: usize, sizes: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Quantizer(#[from] QuantizerError),
    #[error("tensor shapes do not line up: {0}")]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Generation(#[from] GenerationError<E>),
    #[error("backend failed: {0}")]
    Backend(#[source] E),
}

impl<E> From<TaskError> for FlorenceError<E> {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Unknown(name) => Self::UnknownTask(name),
            TaskError::MissingTextInput(task) => Self::MissingTextInput(task),
        }
    }
}

/// Prepends image features to prompt embeddings along the sequence axis
/// and prefixes the prompt mask with ones for the image positions.
///
/// # Errors
///
/// Returns a [`ShapeError`] when batch or hidden sizes disagree.
pub fn merge_image_features(
    image_features: ArrayView3<'_, f32>,
    text_embeds: ArrayView3<'_, f32>,
    text_mask: ArrayView2<'_, i64>,
) -> Result<(Array3<f32>, Array2<i64>), ShapeError> {
    let (batch, image_len, _) = image_features.dim();
    let inputs_embeds = concatenate(Axis(1), &[image_features.reborrow(), text_embeds.reborrow()])?;
    let image_mask = Array2::<i64>::ones((batch, image_len));
    let attention_mask = concatenate(Axis(1), &[image_mask.view(), text_mask.reborrow()])?;
    Ok((inputs_embeds, attention_mask))
}

/// A tokenizer, backend, and configuration ready to run tasks.
///
/// The backend may be shared between runs; every run builds its own cache.
#[derive(Debug)]
pub struct FlorenceModel<B> {
    backend: B,
    tokenizer: Tokenizer,
    config: FlorenceConfig,
    post_processor: PostProcessor,
}

impl<B: Backend> FlorenceModel<B> {
    /// # Errors
    ///
    /// Fails if `config` does not validate or its quantizer grids are empty.
    pub fn new(backend: B, tokenizer: Tokenizer, config: FlorenceConfig) -> Result<Self, FlorenceError<B::Error>> {
        let config = config.validate().map_err(FlorenceError::InvalidConfig)?;
        let post_processor = PostProcessor::new(&config.post_processing)?;
        info!(vocab_size = tokenizer.vocab_size(), "florence model ready");
        Ok(Self {
            backend,
            tokenizer,
            config,
            post_processor,
        })
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub const fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    #[must_use]
    pub const fn config(&self) -> &FlorenceConfig {
        &self.config
    }

    /// Like [`run`](Self::run) with the task given by token or name.
    ///
    /// # Errors
    ///
    /// Returns [`FlorenceError::UnknownTask`] for an unrecognised task and
    /// otherwise fails as [`run`](Self::run) does.
    pub fn run_named(
        &self,
        task: &str,
        text_input: Option<&str>,
        pixel_values: ArrayView4<'_, f32>,
        image_sizes: &[ImageSize],
        cancel: &CancellationToken,
    ) -> Result<Vec<FlorenceResults>, FlorenceError<B::Error>> {
        let task: Task = task.parse()?;
        self.run(task, text_input, pixel_values, image_sizes, cancel)
    }

    /// Runs `task` over a batch of images shaped `[batch, 3, height, width]`.
    ///
    /// `image_sizes[i]` is the original size of image `i`; results are
    /// expressed in those pixels. Cancelling `cancel` interrupts the
    /// backend if it supports it and aborts before the next decoder step.
    ///
    /// # Errors
    ///
    /// Fails on a missing text input, a batch/size mismatch, or any
    /// tokenizer, backend, or generation failure. Nothing partial is
    /// returned.
    pub fn run(
        &self,
        task: Task,
        text_input: Option<&str>,
        pixel_values: ArrayView4<'_, f32>,
        image_sizes: &[ImageSize],
        cancel: &CancellationToken,
    ) -> Result<Vec<FlorenceResults>, FlorenceError<B::Error>> {
        let batch = pixel_values.dim().0;
        if batch == 0 || batch != image_sizes.len() {
            return Err(FlorenceError::BatchMismatch {
                images: batch,
                sizes: image_sizes.len(),
            });
        }
        let prompt = task.prompt(text_input)?;
        info!(%task, batch, "running task");

        let encoded = self.tokenizer.encode_batch(&vec![prompt; batch])?;
        if cancel.is_cancelled() {
            return Err(FlorenceError::Generation(GenerationError::Cancelled));
        }
        // Clears an interrupt left over from an earlier cancelled run.
        self.backend.begin_run().map_err(FlorenceError::Backend)?;
        let _interrupt = self
            .backend
            .interrupt_hook()
            .map(|hook| cancel.on_cancel(hook));

        let text_embeds = self
            .backend
            .embed(encoded.input_ids.view())
            .map_err(FlorenceError::Backend)?;
        let image_features = self
            .backend
            .vision_encode(pixel_values)
            .map_err(FlorenceError::Backend)?;
        let (inputs_embeds, attention_mask) = merge_image_features(
            image_features.view(),
            text_embeds.view(),
            encoded.attention_mask.view(),
        )?;
        let hidden_states = self
            .backend
            .encode(inputs_embeds.view(), attention_mask.view())
            .map_err(FlorenceError::Backend)?;

        let eos = self.tokenizer.eos_id()?;
        let tokens = GenerationTokens {
            decoder_start_token_id: eos,
            bos_token_id: self.tokenizer.bos_id()?,
            eos_token_id: eos,
        };
        let engine = GenerationEngine::new(
            &self.backend,
            self.config.generation,
            self.config.layout,
            tokens,
        )?;
        let sequences = engine.generate(hidden_states.view(), attention_mask.view(), cancel)?;

        sequences
            .iter()
            .zip(image_sizes)
            .map(|(sequence, &size)| -> Result<FlorenceResults, FlorenceError<B::Error>> {
                let text = self.tokenizer.decode(&sequence.token_ids, false)?;
                debug!(%text, score = sequence.score, "decoded sequence");
                Ok(self.post_processor.parse(&text, size, task)?)
            })
            .collect()
    }
}
