use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by [`OnnxBackend`](super::OnnxBackend).
#[derive(Debug, Error)]
pub enum OnnxBackendError {
    #[error("failed to read artefact at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artefact at {path} expected SHA-256 {expected} but found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to construct ONNX session builder: {0}")]
    CreateSessionBuilder(#[source] ort::Error),
    #[error("failed to create ONNX session from {path}: {source}")]
    CreateSession {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },
    #[error("failed to create the built-in top-k session: {0}")]
    CreateTopKSession(#[source] ort::Error),
    #[error("failed to create or update run options: {0}")]
    RunOptions(#[source] ort::Error),
    #[error("failed to convert input \"{name}\" into a tensor: {source}")]
    EncodeTensor {
        name: String,
        #[source]
        source: ort::Error,
    },
    #[error("{0} session mutex was poisoned by a previous panic")]
    SessionPoisoned(&'static str),
    #[error("failed to run {session}: {source}")]
    Inference {
        session: &'static str,
        #[source]
        source: ort::Error,
    },
    #[error("ONNX output \"{name}\" missing from session results")]
    OutputMissing { name: String },
    #[error("ONNX output \"{name}\" could not be extracted: {source}")]
    ExtractOutput {
        name: String,
        #[source]
        source: ort::Error,
    },
    #[error("ONNX output \"{name}\" has unexpected shape {shape:?}")]
    UnexpectedShape { name: String, shape: Vec<i64> },
}
