//! In-place constraints applied to one item's scores before sampling.

use std::collections::{HashMap, HashSet};

/// Transforms one item's next-token scores in place.
///
/// `input_ids` is the item's full history, starting with the decoder start
/// token.
pub trait LogitsProcessor {
    fn process(&self, batch_index: usize, input_ids: &[i64], scores: &mut [f32]);
}

fn ban(scores: &mut [f32], token: i64) {
    if let Some(score) = usize::try_from(token).ok().and_then(|i| scores.get_mut(i)) {
        *score = f32::NEG_INFINITY;
    }
}

fn force(scores: &mut [f32], token: i64) {
    scores.fill(f32::NEG_INFINITY);
    if let Some(score) = usize::try_from(token).ok().and_then(|i| scores.get_mut(i)) {
        *score = 0.0;
    }
}

/// Tokens that would complete an n-gram already present in `sequence`.
///
/// Looks up the last `ngram - 1` ids among the prefixes of every length-n
/// window seen so far. Returns nothing for `ngram == 0` or while fewer than
/// `ngram` ids exist.
#[must_use]
pub fn banned_ngram_tokens(sequence: &[i64], ngram: usize) -> HashSet<i64> {
    let mut banned = HashSet::new();
    if ngram == 0 || sequence.len() < ngram {
        return banned;
    }

    let mut history: HashMap<&[i64], HashSet<i64>> = HashMap::new();
    for window in sequence.windows(ngram) {
        let (prefix, last) = window.split_at(ngram - 1);
        history.entry(prefix).or_default().extend(last);
    }
    let tail = &sequence[sequence.len() + 1 - ngram..];
    if let Some(tokens) = history.get(tail) {
        banned.extend(tokens);
    }
    banned
}

/// Prevents any n-gram of the configured size from occurring twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoRepeatNGramLogitsProcessor {
    ngram_size: usize,
}

impl NoRepeatNGramLogitsProcessor {
    #[must_use]
    pub const fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }
}

impl LogitsProcessor for NoRepeatNGramLogitsProcessor {
    fn process(&self, _batch_index: usize, input_ids: &[i64], scores: &mut [f32]) {
        for token in banned_ngram_tokens(input_ids, self.ngram_size) {
            ban(scores, token);
        }
    }
}

/// Forces the beginning-of-sequence token right after the start token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedBosTokenLogitsProcessor {
    bos_token_id: i64,
}

impl ForcedBosTokenLogitsProcessor {
    #[must_use]
    pub const fn new(bos_token_id: i64) -> Self {
        Self { bos_token_id }
    }
}

impl LogitsProcessor for ForcedBosTokenLogitsProcessor {
    fn process(&self, _batch_index: usize, input_ids: &[i64], scores: &mut [f32]) {
        if input_ids.len() == 1 {
            force(scores, self.bos_token_id);
        }
    }
}

/// Forces the end-of-sequence token as the last token before `max_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedEosTokenLogitsProcessor {
    max_length: usize,
    eos_token_id: i64,
}

impl ForcedEosTokenLogitsProcessor {
    #[must_use]
    pub const fn new(max_length: usize, eos_token_id: i64) -> Self {
        Self {
            max_length,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for ForcedEosTokenLogitsProcessor {
    fn process(&self, _batch_index: usize, input_ids: &[i64], scores: &mut [f32]) {
        if self.max_length.checked_sub(1) == Some(input_ids.len()) {
            force(scores, self.eos_token_id);
        }
    }
}

/// Ordered chain of processors. Registration order is application order.
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor + Send + Sync>>,
}

impl LogitsProcessorList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: impl LogitsProcessor + Send + Sync + 'static) {
        self.processors.push(Box::new(processor));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl LogitsProcessor for LogitsProcessorList {
    fn process(&self, batch_index: usize, input_ids: &[i64], scores: &mut [f32]) {
        for processor in &self.processors {
            processor.process(batch_index, input_ids, scores);
        }
    }
}

impl std::fmt::Debug for LogitsProcessorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogitsProcessorList")
            .field("len", &self.processors.len())
            .finish()
    }
}
