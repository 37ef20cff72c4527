//! Per-item completion predicates.

/// Decides, for every item of a batch, whether generation is complete.
pub trait StoppingCriterion {
    /// `input_ids[i]` is item `i`'s full history; `scores[i]` its cumulative
    /// log-probability.
    fn evaluate(&self, input_ids: &[&[i64]], scores: &[f64]) -> Vec<bool>;
}

/// Fires once a history reaches `max_length` ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxLengthCriteria {
    max_length: usize,
}

impl MaxLengthCriteria {
    #[must_use]
    pub const fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl StoppingCriterion for MaxLengthCriteria {
    fn evaluate(&self, input_ids: &[&[i64]], _scores: &[f64]) -> Vec<bool> {
        input_ids
            .iter()
            .map(|ids| ids.len() >= self.max_length)
            .collect()
    }
}

/// Fires when the most recent id is one of the end-of-sequence ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EosTokenCriteria {
    eos_token_ids: Vec<i64>,
}

impl EosTokenCriteria {
    #[must_use]
    pub fn new(eos_token_ids: impl Into<Vec<i64>>) -> Self {
        Self {
            eos_token_ids: eos_token_ids.into(),
        }
    }
}

impl StoppingCriterion for EosTokenCriteria {
    fn evaluate(&self, input_ids: &[&[i64]], _scores: &[f64]) -> Vec<bool> {
        input_ids
            .iter()
            .map(|ids| ids.last().is_some_and(|last| self.eos_token_ids.contains(last)))
            .collect()
    }
}

/// Criteria combined by logical OR, independently per item.
#[derive(Default)]
pub struct StoppingCriteriaList {
    criteria: Vec<Box<dyn StoppingCriterion + Send + Sync>>,
}

impl StoppingCriteriaList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, criterion: impl StoppingCriterion + Send + Sync + 'static) {
        self.criteria.push(Box::new(criterion));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }
}

impl StoppingCriterion for StoppingCriteriaList {
    fn evaluate(&self, input_ids: &[&[i64]], scores: &[f64]) -> Vec<bool> {
        let mut done = vec![false; input_ids.len()];
        for criterion in &self.criteria {
            for (flag, fired) in done.iter_mut().zip(criterion.evaluate(input_ids, scores)) {
                *flag |= fired;
            }
        }
        done
    }
}

impl std::fmt::Debug for StoppingCriteriaList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppingCriteriaList")
            .field("len", &self.criteria.len())
            .finish()
    }
}
