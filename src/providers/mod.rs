//! The tensor-execution seam.
//!
//! Florence-2 runs as four networks (token embedding, vision encoder, text
//! encoder, merged decoder) plus a ranking primitive. [`Backend`] exposes
//! each as one call over named `ndarray` tensors so the control loop can be
//! driven by ONNX Runtime or by an in-memory stand-in.

#[cfg(feature = "onnx")]
pub mod onnx;

use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4};

use crate::generation::cache::KvCache;
use crate::generation::sampler::rank_top_k;

/// Result of a top-k ranking: values descending, with their indices.
#[derive(Debug, Clone, PartialEq)]
pub struct TopK {
    pub values: Vec<f32>,
    pub indices: Vec<i64>,
}

/// Inputs to one merged-decoder step.
#[derive(Debug, Clone, Copy)]
pub struct DecoderStepInput<'a> {
    /// `[batch, 1, hidden]` embeddings of the step's input ids.
    pub inputs_embeds: ArrayView3<'a, f32>,
    /// `[batch, encoder_sequence]`.
    pub encoder_attention_mask: ArrayView2<'a, i64>,
    /// `[batch, encoder_sequence, hidden]`.
    pub encoder_hidden_states: ArrayView3<'a, f32>,
    /// `false` only on the first step, when `cache` is empty.
    pub use_cache: bool,
    pub cache: &'a KvCache,
}

/// Outputs of one merged-decoder step.
#[derive(Debug, Clone)]
pub struct DecoderStepOutput {
    /// `[batch, sequence, vocab]`; the last position is sampled.
    pub logits: Array3<f32>,
    /// Fresh cache tensors for every layer and side.
    pub present: KvCache,
}

/// Executes Florence-2's networks.
///
/// Implementations may be shared across runs but never hold per-run cache
/// state; the engine passes the cache in and takes it back on every step.
pub trait Backend {
    /// Error type returned when a network call fails.
    ///
    /// Errors must implement `std::error::Error` and be `Send + Sync + 'static`
    /// so they can be wrapped by the generation and model errors.
    type Error: std::error::Error + Send + Sync + 'static;

    /// `[batch, sequence]` ids to `[batch, sequence, hidden]` embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding network fails.
    fn embed(&self, input_ids: ArrayView2<'_, i64>) -> Result<Array3<f32>, Self::Error>;

    /// Runs the text encoder over merged image and prompt embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    fn encode(
        &self,
        inputs_embeds: ArrayView3<'_, f32>,
        attention_mask: ArrayView2<'_, i64>,
    ) -> Result<Array3<f32>, Self::Error>;

    /// Runs one decoder step.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder fails or its outputs are incomplete.
    fn decode_step(&self, input: DecoderStepInput<'_>) -> Result<DecoderStepOutput, Self::Error>;

    /// `[batch, 3, height, width]` pixels to `[batch, tokens, hidden]`
    /// image features.
    ///
    /// # Errors
    ///
    /// Returns an error if the vision encoder fails.
    fn vision_encode(&self, pixel_values: ArrayView4<'_, f32>) -> Result<Array3<f32>, Self::Error>;

    /// Ranks the `k` largest scores. Defaults to a CPU sort.
    ///
    /// # Errors
    ///
    /// Returns an error if a delegated ranking fails.
    fn top_k(&self, values: ArrayView1<'_, f32>, k: usize) -> Result<TopK, Self::Error> {
        Ok(rank_top_k(values, k))
    }

    /// Called once before each run's first step.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be prepared.
    fn begin_run(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Hook that aborts an in-flight call, if the backend supports it.
    fn interrupt_hook(&self) -> Option<Box<dyn FnOnce() + Send>> {
        None
    }
}
