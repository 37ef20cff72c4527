//! Error type for vocabulary construction, encoding, and decoding.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or using a [`Tokenizer`](super::Tokenizer).
///
/// Everything except [`UnknownId`](Self::UnknownId),
/// [`UnmappedCharacter`](Self::UnmappedCharacter), and
/// [`Pattern`](Self::Pattern) is a construction-time failure.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("vocabulary is empty")]
    EmptyVocabulary,
    #[error("token id {id} is assigned to both {existing:?} and {token:?}")]
    DuplicateId {
        id: u32,
        existing: String,
        token: String,
    },
    #[error("added token {content:?} conflicts with {existing:?} at id {id}")]
    AddedTokenConflict {
        id: u32,
        existing: String,
        content: String,
    },
    #[error("added token key {0:?} is not a token id")]
    InvalidAddedTokenId(String),
    #[error("no token is assigned to id {0}")]
    MissingId(u32),
    #[error("token id {id} cannot belong to a table of {tokens} tokens")]
    IdOutOfRange { id: u32, tokens: usize },
    #[error("{role} token {token:?} is not in the vocabulary")]
    MissingSpecialToken { role: &'static str, token: String },
    #[error("{0} token is not configured")]
    UndeclaredSpecialToken(&'static str),
    #[error("token id {0} is outside the vocabulary")]
    UnknownId(i64),
    #[error("character {0:?} has no byte mapping")]
    UnmappedCharacter(char),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("pre-tokenizer pattern failed: {0}")]
    Pattern(#[from] fancy_regex::Error),
    #[error("added-token pattern failed: {0}")]
    AddedTokenPattern(#[from] regex::Error),
}
