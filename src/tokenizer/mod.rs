//! Byte-level tokenizer with a fixed vocabulary and no merge rules.
//!
//! Prompts are split by the GPT-2 pre-tokenizer, each piece is byte-level
//! re-encoded and looked up whole. Florence-2 prompts are short task
//! sentences whose words are all single vocabulary entries, so merge-based
//! splitting is never needed; pieces that are still missing map to the
//! unknown token.

pub mod byte_level;
pub mod config;
mod errors;
pub mod vocabulary;

use std::collections::HashMap;
use std::path::Path;

use ndarray::Array2;
use regex::Regex;
use tracing::{debug, info};

pub use config::{AddedToken, TokenizerAssets, TokenizerConfig};
pub use errors::TokenizerError;
pub use vocabulary::Vocabulary;

/// Byte-level stand-in for a leading space.
const SPACE_MARKER: char = '\u{120}';

/// Ids of the named special-token slots, resolved once at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls: i64,
    pub sep: i64,
    pub unk: i64,
    pub pad: Option<i64>,
    pub mask: Option<i64>,
    pub bos: Option<i64>,
    pub eos: Option<i64>,
}

/// One encoded prompt after truncation and padding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncodedSequence {
    pub input_ids: Vec<i64>,
    /// `1` for real tokens, `0` for right padding.
    pub attention_mask: Vec<i64>,
}

/// A padded batch shaped `[batch, sequence]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
}

impl EncodedBatch {
    /// Stacks sequences that already share a length.
    #[must_use]
    pub fn from_sequences(sequences: &[EncodedSequence]) -> Self {
        let width = sequences.first().map_or(0, |s| s.input_ids.len());
        let shape = (sequences.len(), width);
        Self {
            input_ids: Array2::from_shape_fn(shape, |(r, c)| sequences[r].input_ids[c]),
            attention_mask: Array2::from_shape_fn(shape, |(r, c)| sequences[r].attention_mask[c]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AddedEntry {
    id: i64,
    special: bool,
}

/// Encoder and decoder for Florence-2 prompts and generated ids.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocabulary: Vocabulary,
    special: SpecialTokens,
    added: HashMap<String, AddedEntry>,
    /// Alternation of added-token literals, longest first.
    added_pattern: Option<Regex>,
}

impl Tokenizer {
    /// Longest encoded sequence, including the classification and
    /// separation tokens.
    pub const MAX_TOKENS: usize = 512;

    /// Builds a tokenizer from a base vocabulary and its configuration.
    ///
    /// # Errors
    ///
    /// Fails on any vocabulary inconsistency, when `cls`, `sep`, or `unk` is
    /// undeclared, or when a declared special token is not in the table.
    pub fn new(vocab: HashMap<String, u32>, config: &TokenizerConfig) -> Result<Self, TokenizerError> {
        let added_tokens = config.added_tokens()?;
        let vocabulary = Vocabulary::new(
            vocab,
            added_tokens.iter().map(|(id, t)| (*id, t.content.clone())),
        )?;

        let special = SpecialTokens {
            cls: required(&vocabulary, "cls", config.cls_token.as_deref())?,
            sep: required(&vocabulary, "sep", config.sep_token.as_deref())?,
            unk: required(&vocabulary, "unk", config.unk_token.as_deref())?,
            pad: optional(&vocabulary, "pad", config.pad_token.as_deref())?,
            mask: optional(&vocabulary, "mask", config.mask_token.as_deref())?,
            bos: optional(&vocabulary, "bos", config.bos_token.as_deref())?,
            eos: optional(&vocabulary, "eos", config.eos_token.as_deref())?,
        };

        let mut added = HashMap::with_capacity(added_tokens.len());
        for (id, token) in added_tokens {
            added.entry(token.content).or_insert(AddedEntry {
                id: i64::from(id),
                special: token.special,
            });
        }
        let added_pattern = build_added_pattern(added.keys().map(String::as_str))?;

        Ok(Self {
            vocabulary,
            special,
            added,
            added_pattern,
        })
    }

    /// Builds a tokenizer from assets already read into memory.
    ///
    /// # Errors
    ///
    /// See [`Tokenizer::new`].
    pub fn from_assets(assets: TokenizerAssets) -> Result<Self, TokenizerError> {
        Self::new(assets.vocab, &assets.config)
    }

    /// Loads `vocab.json` and `tokenizer_config.json` from a model directory.
    ///
    /// # Errors
    ///
    /// Fails if either file is unreadable or the contents are inconsistent.
    pub fn from_dir(dir: &Path) -> Result<Self, TokenizerError> {
        let tokenizer = Self::from_assets(TokenizerAssets::from_dir(dir)?)?;
        info!(
            dir = %dir.display(),
            vocab_size = tokenizer.vocab_size(),
            added_tokens = tokenizer.added.len(),
            "tokenizer loaded"
        );
        Ok(tokenizer)
    }

    #[must_use]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocabulary.len()
    }

    #[must_use]
    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    /// Id of the beginning-of-sequence token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::UndeclaredSpecialToken`] if no BOS token was
    /// configured.
    pub fn bos_id(&self) -> Result<i64, TokenizerError> {
        self.special
            .bos
            .ok_or(TokenizerError::UndeclaredSpecialToken("bos"))
    }

    /// Id of the end-of-sequence token.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::UndeclaredSpecialToken`] if no EOS token was
    /// configured.
    pub fn eos_id(&self) -> Result<i64, TokenizerError> {
        self.special
            .eos
            .ok_or(TokenizerError::UndeclaredSpecialToken("eos"))
    }

    /// Token string stored at `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::UnknownId`] for an id outside the table.
    pub fn id_to_token(&self, id: i64) -> Result<&str, TokenizerError> {
        self.vocabulary
            .token(id)
            .ok_or(TokenizerError::UnknownId(id))
    }

    /// Lowest id holding exactly `token`.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<i64> {
        self.vocabulary.id(token)
    }

    /// Whether `token` is an added token flagged special.
    #[must_use]
    pub fn is_special(&self, token: &str) -> bool {
        self.added.get(token).is_some_and(|entry| entry.special)
    }

    /// `[CLS] + pieces + [SEP]` for one text, before truncation.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::Pattern`] if pre-tokenization fails.
    pub fn tokenize(&self, text: &str) -> Result<Vec<i64>, TokenizerError> {
        let mut ids = vec![self.special.cls];
        let mut rest = 0;
        if let Some(pattern) = &self.added_pattern {
            for m in pattern.find_iter(text) {
                self.push_pieces(&text[rest..m.start()], &mut ids)?;
                if let Some(entry) = self.added.get(m.as_str()) {
                    ids.push(entry.id);
                }
                rest = m.end();
            }
        }
        self.push_pieces(&text[rest..], &mut ids)?;
        ids.push(self.special.sep);
        Ok(ids)
    }

    fn push_pieces(&self, text: &str, ids: &mut Vec<i64>) -> Result<(), TokenizerError> {
        for piece in byte_level::pre_tokenize(text)? {
            ids.push(self.lookup(piece));
        }
        Ok(())
    }

    fn lookup(&self, piece: &str) -> i64 {
        let encoded = byte_level::encode_bytes(piece);
        self.vocabulary
            .id(&encoded)
            .or_else(|| {
                encoded
                    .strip_prefix(SPACE_MARKER)
                    .filter(|bare| !bare.is_empty())
                    .and_then(|bare| self.vocabulary.id(bare))
            })
            .unwrap_or(self.special.unk)
    }

    /// Encodes each text, truncates to [`Self::MAX_TOKENS`], and right-pads
    /// every sequence with zeros to the longest one.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::Pattern`] if pre-tokenization fails.
    pub fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<EncodedSequence>, TokenizerError> {
        let mut tokenized = texts
            .iter()
            .map(|t| self.tokenize(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        for ids in &mut tokenized {
            ids.truncate(Self::MAX_TOKENS);
        }
        let width = tokenized.iter().map(Vec::len).max().unwrap_or(0);
        debug!(batch = tokenized.len(), width, "encoded prompts");

        Ok(tokenized
            .into_iter()
            .map(|mut input_ids| {
                let real = input_ids.len();
                input_ids.resize(width, 0);
                let mut attention_mask = vec![1; real];
                attention_mask.resize(width, 0);
                EncodedSequence {
                    input_ids,
                    attention_mask,
                }
            })
            .collect())
    }

    /// [`Tokenizer::encode`] stacked into `[batch, sequence]` arrays.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::Pattern`] if pre-tokenization fails.
    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<EncodedBatch, TokenizerError> {
        Ok(EncodedBatch::from_sequences(&self.encode(texts)?))
    }

    /// Token strings for `ids`, optionally without special added tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::UnknownId`] for an id outside the table.
    pub fn convert_ids_to_tokens(
        &self,
        ids: &[i64],
        skip_special_tokens: bool,
    ) -> Result<Vec<&str>, TokenizerError> {
        let mut tokens = Vec::with_capacity(ids.len());
        for &id in ids {
            let token = self.id_to_token(id)?;
            if !(skip_special_tokens && self.is_special(token)) {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    /// Decodes `ids` into fragments: each added token stands alone and every
    /// run of ordinary tokens between them becomes one UTF-8 string.
    ///
    /// # Errors
    ///
    /// Fails on an unknown id or a token containing a character outside the
    /// byte table.
    pub fn decode_chain(&self, ids: &[i64]) -> Result<Vec<String>, TokenizerError> {
        let tokens = self.convert_ids_to_tokens(ids, false)?;
        self.decode_tokens(&tokens)
    }

    fn decode_tokens(&self, tokens: &[&str]) -> Result<Vec<String>, TokenizerError> {
        let mut fragments = Vec::new();
        let mut run = String::new();
        for &token in tokens {
            if self.added.contains_key(token) {
                if !run.is_empty() {
                    fragments.push(bytes_to_text(&run)?);
                    run.clear();
                }
                fragments.push(token.to_owned());
            } else {
                run.push_str(token);
            }
        }
        if !run.is_empty() {
            fragments.push(bytes_to_text(&run)?);
        }
        Ok(fragments)
    }

    /// Full decode: tokens, fragments, join, then spacing clean-up.
    ///
    /// # Errors
    ///
    /// Fails on an unknown id or an unmappable character.
    pub fn decode(&self, ids: &[i64], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        let tokens = self.convert_ids_to_tokens(ids, skip_special_tokens)?;
        let joined = self.decode_tokens(&tokens)?.concat();
        Ok(clean_up_tokenization(&joined))
    }
}

fn required(vocabulary: &Vocabulary, role: &'static str, token: Option<&str>) -> Result<i64, TokenizerError> {
    optional(vocabulary, role, token)?.ok_or(TokenizerError::UndeclaredSpecialToken(role))
}

fn optional(vocabulary: &Vocabulary, role: &'static str, token: Option<&str>) -> Result<Option<i64>, TokenizerError> {
    token
        .map(|t| {
            vocabulary
                .id(t)
                .ok_or_else(|| TokenizerError::MissingSpecialToken {
                    role,
                    token: t.to_owned(),
                })
        })
        .transpose()
}

fn build_added_pattern<'a>(literals: impl Iterator<Item = &'a str>) -> Result<Option<Regex>, TokenizerError> {
    let mut literals: Vec<&str> = literals.filter(|l| !l.is_empty()).collect();
    if literals.is_empty() {
        return Ok(None);
    }
    literals.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let alternation = literals
        .iter()
        .map(|l| regex::escape(l))
        .collect::<Vec<_>>()
        .join("|");
    Ok(Some(Regex::new(&alternation)?))
}

fn bytes_to_text(run: &str) -> Result<String, TokenizerError> {
    let bytes = byte_level::decode_chars(run)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Removes spaces the byte-level decoder leaves before punctuation and
/// English contractions.
#[must_use]
pub fn clean_up_tokenization(text: &str) -> String {
    const REPLACEMENTS: [(&str, &str); 10] = [
        (" .", "."),
        (" ?", "?"),
        (" !", "!"),
        (" ,", ","),
        (" ' ", ""),
        (" n't", "n't"),
        (" 'm", "'m"),
        (" 's", "'s"),
        (" 've", "'ve"),
        (" 're", "'re"),
    ];
    REPLACEMENTS
        .iter()
        .fold(text.to_owned(), |acc, (from, to)| acc.replace(from, to))
}
