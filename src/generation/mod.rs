//! Autoregressive step loop over a batch.
//!
//! Each step embeds one id per item, runs the merged decoder against the
//! shared encoder output, rotates the cache, then constrains, samples, and
//! checks completion for every item independently. Finished items keep
//! being fed the end-of-sequence id so the batch stays rectangular, but
//! their histories stop growing.

pub mod cache;
pub mod cancel;
pub mod logits;
pub mod sampler;
pub mod stopping;

use ndarray::{Array2, ArrayView2, ArrayView3, s};
use thiserror::Error;
use tracing::debug;

use crate::config::{GenerationConfig, ModelLayout};
use crate::providers::{Backend, DecoderStepInput};
use cache::{CacheLayerMismatch, KvCache};
use cancel::CancellationToken;
use logits::{
    ForcedBosTokenLogitsProcessor, ForcedEosTokenLogitsProcessor, LogitsProcessor,
    LogitsProcessorList, NoRepeatNGramLogitsProcessor,
};
use sampler::BeamSearchSampler;
use stopping::{EosTokenCriteria, MaxLengthCriteria, StoppingCriteriaList, StoppingCriterion};

/// Errors raised by [`GenerationEngine::generate`].
#[derive(Debug, Error)]
pub enum GenerationError<E> {
    #[error("backend failed: {0}")]
    Backend(#[source] E),
    #[error("generation was cancelled")]
    Cancelled,
    #[error("encoder output has an empty batch")]
    EmptyBatch,
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error(transparent)]
    Cache(#[from] CacheLayerMismatch),
    #[error("invalid generation config: {0}")]
    InvalidConfig(String),
}

/// A finished item: its ids from the start token onwards and their summed
/// log-probability.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSequence {
    pub token_ids: Vec<i64>,
    pub score: f64,
}

/// Token ids the engine needs from the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationTokens {
    /// First decoder input; Florence-2 uses the end-of-sequence id.
    pub decoder_start_token_id: i64,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
}

/// Per-item mutable state for one run.
#[derive(Debug, Clone)]
struct ItemState {
    history: Vec<i64>,
    score: f64,
    done: bool,
}

/// Drives a [`Backend`] through a full generation.
pub struct GenerationEngine<'a, B: Backend + ?Sized> {
    backend: &'a B,
    layout: ModelLayout,
    tokens: GenerationTokens,
    processors: LogitsProcessorList,
    criteria: StoppingCriteriaList,
    sampler: BeamSearchSampler,
}

impl<'a, B: Backend + ?Sized> GenerationEngine<'a, B> {
    /// Builds the standard Florence-2 chain: no-repeat n-gram (when
    /// enabled), forced BOS, forced EOS, then max-length and EOS stopping.
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::InvalidConfig`] if `config` or `layout`
    /// fails validation.
    pub fn new(
        backend: &'a B,
        config: GenerationConfig,
        layout: ModelLayout,
        tokens: GenerationTokens,
    ) -> Result<Self, GenerationError<B::Error>> {
        let config = config.validate().map_err(GenerationError::InvalidConfig)?;

        let mut processors = LogitsProcessorList::new();
        if config.no_repeat_ngram_size > 0 {
            processors.push(NoRepeatNGramLogitsProcessor::new(config.no_repeat_ngram_size));
        }
        processors.push(ForcedBosTokenLogitsProcessor::new(tokens.bos_token_id));
        processors.push(ForcedEosTokenLogitsProcessor::new(
            config.max_length,
            tokens.eos_token_id,
        ));

        let mut criteria = StoppingCriteriaList::new();
        criteria.push(MaxLengthCriteria::new(config.max_length));
        criteria.push(EosTokenCriteria::new([tokens.eos_token_id]));

        Self::with_chains(backend, config, layout, tokens, processors, criteria)
    }

    /// Builds an engine with caller-supplied processor and criteria chains.
    ///
    /// Nothing bounds the loop except `criteria`, so it should include a
    /// [`MaxLengthCriteria`].
    ///
    /// # Errors
    ///
    /// Returns [`GenerationError::InvalidConfig`] if `layout` cannot shape a
    /// cache: no decoder layers, no heads, or a hidden size that does not
    /// split evenly across heads.
    pub fn with_chains(
        backend: &'a B,
        config: GenerationConfig,
        layout: ModelLayout,
        tokens: GenerationTokens,
        processors: LogitsProcessorList,
        criteria: StoppingCriteriaList,
    ) -> Result<Self, GenerationError<B::Error>> {
        let layout = layout.validate().map_err(GenerationError::InvalidConfig)?;
        Ok(Self {
            backend,
            layout,
            tokens,
            processors,
            criteria,
            sampler: BeamSearchSampler::from_config(&config),
        })
    }

    /// Generates one sequence per item of the encoder output.
    ///
    /// # Errors
    ///
    /// Fails on an empty batch, mismatched mask or logits shapes, any
    /// backend error, or cancellation observed at the top of a step. Partial
    /// output is discarded.
    pub fn generate(
        &self,
        encoder_hidden_states: ArrayView3<'_, f32>,
        encoder_attention_mask: ArrayView2<'_, i64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<GeneratedSequence>, GenerationError<B::Error>> {
        let (batch, encoder_len, _) = encoder_hidden_states.dim();
        if batch == 0 {
            return Err(GenerationError::EmptyBatch);
        }
        if encoder_attention_mask.dim() != (batch, encoder_len) {
            return Err(GenerationError::ShapeMismatch(format!(
                "encoder mask {:?} does not match hidden states [{batch}, {encoder_len}]",
                encoder_attention_mask.shape()
            )));
        }

        let start = self.tokens.decoder_start_token_id;
        let mut items = vec![
            ItemState {
                history: vec![start],
                score: 0.0,
                done: false,
            };
            batch
        ];
        let mut next_ids = vec![start; batch];
        let mut cache = KvCache::empty(&self.layout, batch);
        self.backend.begin_run().map_err(GenerationError::Backend)?;

        for step in 0_usize.. {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            let use_cache = step > 0;

            let input_ids = Array2::from_shape_vec((batch, 1), next_ids.clone())
                .map_err(|e| GenerationError::ShapeMismatch(e.to_string()))?;
            let inputs_embeds = self
                .backend
                .embed(input_ids.view())
                .map_err(GenerationError::Backend)?;
            let output = self
                .backend
                .decode_step(DecoderStepInput {
                    inputs_embeds: inputs_embeds.view(),
                    encoder_attention_mask: encoder_attention_mask.reborrow(),
                    encoder_hidden_states: encoder_hidden_states.reborrow(),
                    use_cache,
                    cache: &cache,
                })
                .map_err(GenerationError::Backend)?;
            cache.update(output.present, use_cache)?;

            let (logits_batch, positions, _) = output.logits.dim();
            if logits_batch != batch || positions == 0 {
                return Err(GenerationError::ShapeMismatch(format!(
                    "logits {:?} for batch of {batch}",
                    output.logits.shape()
                )));
            }

            for (index, (item, next)) in items.iter_mut().zip(&mut next_ids).enumerate() {
                if item.done {
                    *next = self.tokens.eos_token_id;
                    continue;
                }
                let mut scores = output.logits.slice(s![index, positions - 1, ..]).to_vec();
                self.processors.process(index, &item.history, &mut scores);
                let candidates = self
                    .sampler
                    .sample(self.backend, index, &scores)
                    .map_err(GenerationError::Backend)?;
                let best = candidates.first().ok_or_else(|| {
                    GenerationError::ShapeMismatch("logits have an empty vocabulary axis".into())
                })?;
                item.score += best.log_prob;
                item.history.push(best.token_id);
                *next = best.token_id;
            }

            self.mark_finished(&mut items);
            let active = items.iter().filter(|item| !item.done).count();
            debug!(step, active, "generation step");
            if active == 0 {
                break;
            }
        }

        Ok(items
            .into_iter()
            .map(|item| GeneratedSequence {
                token_ids: item.history,
                score: item.score,
            })
            .collect())
    }

    fn mark_finished(&self, items: &mut [ItemState]) {
        let histories: Vec<&[i64]> = items.iter().map(|item| item.history.as_slice()).collect();
        let scores: Vec<f64> = items.iter().map(|item| item.score).collect();
        let stops = self.criteria.evaluate(&histories, &scores);
        for (item, stop) in items.iter_mut().zip(stops) {
            item.done |= stop;
        }
    }
}

impl<B: Backend + ?Sized> std::fmt::Debug for GenerationEngine<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationEngine")
            .field("layout", &self.layout)
            .field("tokens", &self.tokens)
            .field("processors", &self.processors)
            .field("criteria", &self.criteria)
            .field("sampler", &self.sampler)
            .finish_non_exhaustive()
    }
}
