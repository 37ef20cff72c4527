//! Top-k candidate selection with log-probabilities.

use std::cmp::Ordering;

use ndarray::ArrayView1;
use tracing::trace;

use crate::config::GenerationConfig;
use crate::providers::{Backend, TopK};

/// One ranked next-token choice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token_id: i64,
    /// Natural log of the token's probability within the top-k subset.
    pub log_prob: f64,
}

/// NaN scores rank and weigh like `-inf`.
fn comparable(value: f32) -> f32 {
    if value.is_nan() { f32::NEG_INFINITY } else { value }
}

/// Ranks the `k` largest values, highest first. Ties keep index order and
/// NaN ranks last.
#[must_use]
pub fn rank_top_k(values: ArrayView1<'_, f32>, k: usize) -> TopK {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        comparable(values[b])
            .partial_cmp(&comparable(values[a]))
            .unwrap_or(Ordering::Equal)
    });
    order.truncate(k);
    TopK {
        values: order.iter().map(|&i| values[i]).collect(),
        indices: order.iter().filter_map(|&i| i64::try_from(i).ok()).collect(),
    }
}

/// Numerically stable softmax.
///
/// NaN gets zero probability. When every value is `-inf` the distribution
/// is uniform.
#[must_use]
pub fn softmax(values: &[f32]) -> Vec<f64> {
    let values: Vec<f32> = values.iter().copied().map(comparable).collect();
    let max = values
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    if max.is_infinite() && max.is_sign_negative() {
        #[expect(clippy::cast_precision_loss, reason = "vocabulary sizes are far below 2^52")]
        let uniform = 1.0 / values.len() as f64;
        return vec![uniform; values.len()];
    }
    let exps: Vec<f64> = values
        .iter()
        .map(|&v| (f64::from(v) - f64::from(max)).exp())
        .collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Produces `num_beams` ranked candidates from the top-k of a score row.
///
/// Despite the name this does not track hypotheses across steps; the
/// engine consumes only the first candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamSearchSampler {
    top_k: usize,
    num_beams: usize,
}

impl BeamSearchSampler {
    /// `top_k == 0` keeps the whole vocabulary.
    #[must_use]
    pub const fn new(top_k: usize, num_beams: usize) -> Self {
        Self { top_k, num_beams }
    }

    #[must_use]
    pub const fn from_config(config: &GenerationConfig) -> Self {
        Self::new(config.top_k, config.num_beams)
    }

    /// Number of candidates kept before the softmax for a given vocabulary.
    #[must_use]
    pub fn effective_k(&self, vocab_size: usize) -> usize {
        if self.top_k == 0 {
            vocab_size
        } else {
            self.top_k.min(vocab_size)
        }
    }

    /// Ranks `scores` through the backend's top-k primitive and returns at
    /// most `num_beams` candidates, most probable first.
    ///
    /// # Errors
    ///
    /// Propagates any failure of [`Backend::top_k`].
    pub fn sample<B: Backend + ?Sized>(
        &self,
        backend: &B,
        batch_index: usize,
        scores: &[f32],
    ) -> Result<Vec<Candidate>, B::Error> {
        let k = self.effective_k(scores.len());
        let top = backend.top_k(ArrayView1::from(scores), k)?;
        let probabilities = softmax(&top.values);
        let candidates: Vec<Candidate> = top
            .indices
            .iter()
            .zip(probabilities)
            .take(self.num_beams)
            .map(|(&token_id, p)| Candidate {
                token_id,
                log_prob: p.ln(),
            })
            .collect();
        trace!(batch_index, k, best = ?candidates.first(), "sampled");
        Ok(candidates)
    }
}
