//! On-disk tokenizer assets: `vocab.json` and `tokenizer_config.json`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use super::TokenizerError;

pub const VOCAB_FILE: &str = "vocab.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// One entry of `added_tokens_decoder`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddedToken {
    pub content: String,
    pub lstrip: bool,
    pub normalized: bool,
    pub rstrip: bool,
    pub single_word: bool,
    /// Dropped by skip-special decoding.
    pub special: bool,
}

impl AddedToken {
    #[must_use]
    pub fn new(content: impl Into<String>, special: bool) -> Self {
        Self {
            content: content.into(),
            special,
            ..Self::default()
        }
    }
}

/// Fields of a Hugging Face `tokenizer_config.json` this crate reads.
///
/// Unknown keys are ignored since exported configs carry many more.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Keyed by the token id written as a decimal string.
    pub added_tokens_decoder: BTreeMap<String, AddedToken>,
    pub bos_token: Option<String>,
    pub cls_token: Option<String>,
    pub eos_token: Option<String>,
    pub mask_token: Option<String>,
    pub pad_token: Option<String>,
    pub sep_token: Option<String>,
    pub unk_token: Option<String>,
}

impl TokenizerConfig {
    /// Added tokens with their keys parsed as ids, in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::InvalidAddedTokenId`] for a non-numeric key.
    pub fn added_tokens(&self) -> Result<Vec<(u32, AddedToken)>, TokenizerError> {
        let mut added = self
            .added_tokens_decoder
            .iter()
            .map(|(key, token)| {
                key.parse::<u32>()
                    .map(|id| (id, token.clone()))
                    .map_err(|_| TokenizerError::InvalidAddedTokenId(key.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        added.sort_by_key(|(id, _)| *id);
        Ok(added)
    }
}

/// Raw contents of a model directory's tokenizer files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenizerAssets {
    pub vocab: HashMap<String, u32>,
    pub config: TokenizerConfig,
}

impl TokenizerAssets {
    /// Reads [`VOCAB_FILE`] and [`TOKENIZER_CONFIG_FILE`] from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::Io`] or [`TokenizerError::Json`] naming the
    /// offending file.
    pub fn from_dir(dir: &Path) -> Result<Self, TokenizerError> {
        Ok(Self {
            vocab: read_json(&dir.join(VOCAB_FILE))?,
            config: read_json(&dir.join(TOKENIZER_CONFIG_FILE))?,
        })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TokenizerError> {
    let raw = fs::read_to_string(path).map_err(|source| TokenizerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| TokenizerError::Json {
        path: path.to_path_buf(),
        source,
    })
}
