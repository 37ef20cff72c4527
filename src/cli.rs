//! CLI argument types and layered configuration for the `florence2` binary.
//! Loads from CLI args, environment (prefix `FLORENCE2_`), and optional
//! config files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use ndarray::Array4;
use ortho_config::OrthoError;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::geometry::ImageSize;
use crate::task::{Task, TaskError};

/// Side length of the square pixel tensor the vision encoder expects.
pub const DEFAULT_CROP_SIZE: usize = 768;

/// Command-line arguments for the `florence2` binary.
///
/// # Examples
///
/// Parse flags directly:
/// ```
/// use florence2::cli::FlorenceArgs;
/// use ortho_config::OrthoConfig;
///
/// let args = FlorenceArgs::load_from_iter(["florence2", "--task", "<OD>", "--dry-run=true"])
///     .expect("load args from CLI iterator");
/// assert!(args.dry_run);
/// assert_eq!(args.resolve_task().expect("known task").name(), "object_detection");
/// ```
///
/// Load from a configuration file:
/// ```
/// use florence2::cli::FlorenceArgs;
/// use ortho_config::OrthoConfig;
/// use std::io::Write;
/// use tempfile::NamedTempFile;
///
/// let mut file = NamedTempFile::new().expect("create temp file");
/// writeln!(file, "task = \"caption\"").expect("write config");
/// let path = file.path().to_str().expect("path str");
/// let args = FlorenceArgs::load_from_iter(["florence2", "--config-path", path])
///     .expect("load args from config path");
/// assert_eq!(args.task.as_deref(), Some("caption"));
/// ```
#[derive(Debug, Deserialize, ortho_config::OrthoConfig)]
#[ortho_config(prefix = "FLORENCE2")]
pub struct FlorenceArgs {
    /// Directory holding `vocab.json`, `tokenizer_config.json`, and the
    /// ONNX exports.
    pub model_dir: Option<PathBuf>,

    /// Task token (`<OD>`) or name (`object_detection`). Defaults to
    /// captioning.
    pub task: Option<String>,

    /// Text substituted into the prompt of tasks that take one.
    pub text: Option<String>,

    /// JSON file with generation, layout, and post-processing settings.
    pub model_config: Option<PathBuf>,

    /// Raw little-endian `f32` pixels shaped `[1, 3, crop, crop]`.
    pub pixels: Option<PathBuf>,

    /// Original image width in pixels.
    pub image_width: Option<u32>,

    /// Original image height in pixels.
    pub image_height: Option<u32>,

    /// Print the prompt ids instead of running the model.
    #[ortho_config(default = false)]
    #[serde(default)]
    pub dry_run: bool,

    /// Only log errors.
    #[ortho_config(default = false)]
    #[serde(default)]
    pub quiet: bool,

    /// Optional path to a configuration file.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl FlorenceArgs {
    /// Load configuration solely from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an [`OrthoError`] if any variable cannot be parsed.
    pub fn load_from_env() -> Result<Self, OrthoError> {
        Figment::new()
            .merge(Env::prefixed("FLORENCE2_"))
            .extract()
            .map_err(Into::into)
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an [`OrthoError`] if the file cannot be read or parsed.
    pub fn load_from_config(path: &str) -> Result<Self, OrthoError> {
        Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(Into::into)
    }

    /// Load configuration from environment variables and a file path.
    ///
    /// # Errors
    ///
    /// Returns an [`OrthoError`] if either source contains invalid values.
    pub fn load_from_env_and_config(path: &str) -> Result<Self, OrthoError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLORENCE2_"))
            .extract()
            .map_err(Into::into)
    }

    /// The requested task, or [`Task::Caption`] when none was given.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Unknown`] for an unrecognised task.
    pub fn resolve_task(&self) -> Result<Task, TaskError> {
        self.task.as_deref().map_or(Ok(Task::Caption), str::parse)
    }

    /// The original image size, when both dimensions were given.
    #[must_use]
    pub fn image_size(&self) -> Option<ImageSize> {
        Some(ImageSize::new(self.image_width?, self.image_height?))
    }
}

static LOGGING: Once = Once::new();

/// Installs a `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` picks the filter, defaulting to `info`; `quiet` forces
/// `error`. Later calls do nothing.
pub fn init_logging(quiet: bool) {
    LOGGING.call_once(|| {
        let filter = if quiet {
            EnvFilter::new("error")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Reads a `[1, 3, crop, crop]` tensor of little-endian `f32` values.
///
/// # Errors
///
/// Returns a message if the file cannot be read or holds the wrong number
/// of bytes.
pub fn load_pixel_values(path: &Path, crop: usize) -> Result<Array4<f32>, String> {
    let bytes = fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let expected = 3 * crop * crop * size_of::<f32>();
    if bytes.len() != expected {
        return Err(format!(
            "{} holds {} bytes, expected {expected} for a {crop}x{crop} RGB tensor",
            path.display(),
            bytes.len()
        ));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(size_of::<f32>())
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Array4::from_shape_vec((1, 3, crop, crop), values).map_err(|e| e.to_string())
}
