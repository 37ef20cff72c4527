//! In-memory stand-ins for the model assets and backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ndarray::{Array3, ArrayD, ArrayView2, ArrayView3, ArrayView4, IxDyn};
use thiserror::Error;

use crate::config::ModelLayout;
use crate::generation::cache::{KeyValue, KvCache, LayerCache};
use crate::generation::cancel::CancellationToken;
use crate::providers::{Backend, DecoderStepInput, DecoderStepOutput};
use crate::tokenizer::{AddedToken, Tokenizer, TokenizerConfig};

#[must_use]
pub fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

/// Small layout keeping scripted tensors tiny.
pub const TEST_LAYOUT: ModelLayout = ModelLayout {
    num_decoder_layers: 2,
    num_decoder_heads: 2,
    decoder_hidden_size: 8,
    num_encoder_layers: 2,
    num_encoder_heads: 2,
    encoder_hidden_size: 8,
};

/// Image tokens produced by [`ScriptedBackend::vision_encode`].
pub const IMAGE_TOKENS: usize = 2;

/// Logit given to the scripted token; every other token scores zero.
const SCRIPTED_LOGIT: f32 = 10.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptedBackendError {
    #[error("scripted failure at step {0}")]
    Failure(usize),
    #[error("backend was interrupted")]
    Terminated,
}

#[derive(Debug, Default)]
struct Record {
    fed_ids: Vec<Vec<i64>>,
    use_cache: Vec<bool>,
    encoder_lengths: Vec<usize>,
}

/// Backend replaying a fixed token script.
///
/// `script[step][item]` receives the highest logit at that step; items or
/// steps beyond the script favour the last vocabulary id. Logits processors
/// still apply, so forced tokens win over the script.
///
/// Its interrupt hook sets a flag that stays set until the next
/// [`Backend::begin_run`]; every call made while it is set fails with
/// [`ScriptedBackendError::Terminated`].
#[derive(Debug)]
pub struct ScriptedBackend {
    vocab_size: usize,
    script: Vec<Vec<i64>>,
    fail_at: Option<usize>,
    cancel_at: Option<(usize, CancellationToken)>,
    terminated: Arc<AtomicBool>,
    record: Mutex<Record>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(vocab_size: usize, script: Vec<Vec<i64>>) -> Self {
        Self {
            vocab_size,
            script,
            fail_at: None,
            cancel_at: None,
            terminated: Arc::new(AtomicBool::new(false)),
            record: Mutex::new(Record::default()),
        }
    }

    /// Makes decoder step `step` fail.
    #[must_use]
    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Cancels `token` while decoder step `step` is running.
    #[must_use]
    pub fn cancelling_at(mut self, step: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((step, token));
        self
    }

    /// Whether an interrupt is pending.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ScriptedBackendError> {
        if self.is_terminated() {
            Err(ScriptedBackendError::Terminated)
        } else {
            Ok(())
        }
    }

    fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decoder steps run so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.record().use_cache.len()
    }

    /// Ids embedded for decoder step `step`, one per item.
    #[must_use]
    pub fn fed_ids(&self, step: usize) -> Vec<i64> {
        self.record().fed_ids.get(step).cloned().unwrap_or_default()
    }

    /// `use_cache` flags seen by each decoder step.
    #[must_use]
    pub fn use_cache_flags(&self) -> Vec<bool> {
        self.record().use_cache.clone()
    }

    /// Encoder sequence lengths seen by each text-encoder call.
    #[must_use]
    pub fn encoder_lengths(&self) -> Vec<usize> {
        self.record().encoder_lengths.clone()
    }

    fn scripted_token(&self, step: usize, item: usize) -> i64 {
        self.script
            .get(step)
            .and_then(|row| row.get(item))
            .copied()
            .unwrap_or_else(|| i64::try_from(self.vocab_size).unwrap_or(1) - 1)
    }

    fn filled(batch: usize, heads: usize, len: usize, head_dim: usize) -> KeyValue {
        let shape = IxDyn(&[batch, heads, len, head_dim]);
        KeyValue {
            key: ArrayD::zeros(shape.clone()),
            value: ArrayD::zeros(shape),
        }
    }
}

impl Backend for ScriptedBackend {
    type Error = ScriptedBackendError;

    fn embed(&self, input_ids: ArrayView2<'_, i64>) -> Result<Array3<f32>, Self::Error> {
        self.ensure_running()?;
        let (batch, len) = input_ids.dim();
        if len == 1 {
            self.record().fed_ids.push(input_ids.iter().copied().collect());
        }
        Ok(Array3::zeros((batch, len, TEST_LAYOUT.decoder_hidden_size)))
    }

    fn encode(
        &self,
        inputs_embeds: ArrayView3<'_, f32>,
        _attention_mask: ArrayView2<'_, i64>,
    ) -> Result<Array3<f32>, Self::Error> {
        self.ensure_running()?;
        self.record().encoder_lengths.push(inputs_embeds.dim().1);
        Ok(inputs_embeds.to_owned())
    }

    fn decode_step(&self, input: DecoderStepInput<'_>) -> Result<DecoderStepOutput, Self::Error> {
        self.ensure_running()?;
        let step = {
            let mut record = self.record();
            record.use_cache.push(input.use_cache);
            record.use_cache.len() - 1
        };
        if let Some((at, token)) = &self.cancel_at {
            if *at == step {
                token.cancel();
            }
        }
        if self.fail_at == Some(step) {
            return Err(ScriptedBackendError::Failure(step));
        }

        let (batch, _, _) = input.inputs_embeds.dim();
        let mut logits = Array3::zeros((batch, 1, self.vocab_size));
        for item in 0..batch {
            let token = self.scripted_token(step, item);
            if let Some(slot) = usize::try_from(token)
                .ok()
                .and_then(|t| logits.get_mut((item, 0, t)))
            {
                *slot = SCRIPTED_LOGIT;
            }
        }

        let past_len = input
            .cache
            .layers()
            .first()
            .map_or(0, |layer| layer.decoder.sequence_len());
        let encoder_len = input.encoder_hidden_states.dim().1;
        let heads = TEST_LAYOUT.num_decoder_heads;
        let head_dim = TEST_LAYOUT.decoder_head_dim();
        let present = KvCache::from_layers(
            (0..input.cache.num_layers())
                .map(|_| LayerCache {
                    decoder: Self::filled(batch, heads, past_len + 1, head_dim),
                    encoder: Self::filled(batch, heads, encoder_len, head_dim),
                })
                .collect(),
        );
        Ok(DecoderStepOutput { logits, present })
    }

    fn vision_encode(&self, pixel_values: ArrayView4<'_, f32>) -> Result<Array3<f32>, Self::Error> {
        self.ensure_running()?;
        let batch = pixel_values.dim().0;
        Ok(Array3::from_elem(
            (batch, IMAGE_TOKENS, TEST_LAYOUT.encoder_hidden_size),
            1.0,
        ))
    }

    fn begin_run(&self) -> Result<(), Self::Error> {
        self.terminated.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn interrupt_hook(&self) -> Option<Box<dyn FnOnce() + Send>> {
        let terminated = Arc::clone(&self.terminated);
        Some(Box::new(move || terminated.store(true, Ordering::SeqCst)))
    }
}

/// Location tokens `<loc_0>` … `<loc_999>` start at this id in
/// [`toy_tokenizer`].
pub const LOC_BASE: i64 = 100;

/// Ids of the plain words in [`toy_tokenizer`].
pub mod ids {
    pub const BOS: i64 = 0;
    pub const PAD: i64 = 1;
    pub const EOS: i64 = 2;
    pub const UNK: i64 = 3;
    pub const CAT: i64 = 4;
    pub const ON: i64 = 5;
    pub const MAT: i64 = 6;
    pub const DOG: i64 = 7;
    pub const IT: i64 = 8;
    pub const POLY: i64 = 9;
    pub const POLY_END: i64 = 10;
    pub const SEP: i64 = 11;
    pub const OD: i64 = 12;
}

/// Location token id for bin `n`.
#[must_use]
pub fn loc(n: i64) -> i64 {
    LOC_BASE + n
}

/// Florence-style tokenizer over a tiny vocabulary.
///
/// Word ids are in [`ids`]; every location bin from 0 to 999 is an added
/// token. Unused ids between the words and [`LOC_BASE`] hold filler
/// entries.
///
/// # Panics
///
/// Panics if the hard-coded assets are inconsistent.
#[must_use]
pub fn toy_tokenizer() -> Tokenizer {
    let words: [(&str, i64); 13] = [
        ("<s>", ids::BOS),
        ("<pad>", ids::PAD),
        ("</s>", ids::EOS),
        ("<unk>", ids::UNK),
        ("cat", ids::CAT),
        ("Ġon", ids::ON),
        ("Ġmat", ids::MAT),
        ("dog", ids::DOG),
        ("it", ids::IT),
        ("<poly>", ids::POLY),
        ("</poly>", ids::POLY_END),
        ("<sep>", ids::SEP),
        ("<OD>", ids::OD),
    ];
    let mut vocab: HashMap<String, u32> = HashMap::new();
    for (token, id) in words {
        vocab.insert(token.to_owned(), u32::try_from(id).unwrap_or(u32::MAX));
    }
    for filler in 13..100_u32 {
        vocab.insert(format!("filler{filler}"), filler);
    }

    let mut config = TokenizerConfig {
        bos_token: Some("<s>".into()),
        cls_token: Some("<s>".into()),
        eos_token: Some("</s>".into()),
        sep_token: Some("</s>".into()),
        pad_token: Some("<pad>".into()),
        unk_token: Some("<unk>".into()),
        ..TokenizerConfig::default()
    };
    for (content, id, special) in [
        ("<s>", ids::BOS, true),
        ("<pad>", ids::PAD, true),
        ("</s>", ids::EOS, true),
        ("<unk>", ids::UNK, true),
        ("<poly>", ids::POLY, false),
        ("</poly>", ids::POLY_END, false),
        ("<sep>", ids::SEP, false),
        ("<OD>", ids::OD, false),
    ] {
        config
            .added_tokens_decoder
            .insert(id.to_string(), AddedToken::new(content, special));
    }
    for bin in 0..1000 {
        config
            .added_tokens_decoder
            .insert(loc(bin).to_string(), AddedToken::new(format!("<loc_{bin}>"), false));
    }
    match Tokenizer::new(vocab, &config) {
        Ok(tokenizer) => tokenizer,
        Err(e) => panic!("toy tokenizer assets are inconsistent: {e}"),
    }
}
