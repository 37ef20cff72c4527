use std::error::Error;
use std::path::Path;

use florence2::cli::{FlorenceArgs, init_logging};
use florence2::config::FlorenceConfig;
use florence2::task::Task;
use florence2::tokenizer::Tokenizer;
use ortho_config::OrthoConfig;
use tracing::info;

fn main() -> Result<(), Box<dyn Error>> {
    // CLI flags win over FLORENCE2_* variables, which win over the config file.
    let args = FlorenceArgs::load()?;
    init_logging(args.quiet);

    let task = args.resolve_task()?;
    let prompt = task.prompt(args.text.as_deref())?;
    let model_dir = args.model_dir.clone().ok_or("--model-dir is required")?;
    let config = match &args.model_config {
        Some(path) => FlorenceConfig::from_json_file(path)?,
        None => FlorenceConfig::default(),
    };
    let tokenizer = Tokenizer::from_dir(&model_dir)?;

    if args.dry_run {
        let ids = tokenizer.tokenize(&prompt)?;
        info!(%task, tokens = ids.len(), "dry run");
        println!("{}", serde_json::to_string(&ids)?);
        return Ok(());
    }
    run_model(&args, task, &model_dir, tokenizer, config)
}

#[cfg(feature = "onnx")]
fn run_model(
    args: &FlorenceArgs,
    task: Task,
    model_dir: &Path,
    tokenizer: Tokenizer,
    config: FlorenceConfig,
) -> Result<(), Box<dyn Error>> {
    use florence2::cli::{DEFAULT_CROP_SIZE, load_pixel_values};
    use florence2::generation::cancel::CancellationToken;
    use florence2::model::FlorenceModel;
    use florence2::providers::onnx::{OnnxBackend, OnnxBackendConfig};

    let size = args
        .image_size()
        .ok_or("--image-width and --image-height are required")?;
    let pixels_path = args.pixels.as_deref().ok_or("--pixels is required")?;
    let pixels = load_pixel_values(pixels_path, DEFAULT_CROP_SIZE)?;

    let backend = OnnxBackend::new(&OnnxBackendConfig::from_model_dir(model_dir, config.layout))?;
    let model = FlorenceModel::new(backend, tokenizer, config)?;
    let results = model.run(
        task,
        args.text.as_deref(),
        pixels.view(),
        &[size],
        &CancellationToken::new(),
    )?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

#[cfg(not(feature = "onnx"))]
fn run_model(
    _args: &FlorenceArgs,
    _task: Task,
    _model_dir: &Path,
    _tokenizer: Tokenizer,
    _config: FlorenceConfig,
) -> Result<(), Box<dyn Error>> {
    Err("built without the `onnx` feature; only --dry-run is available".into())
}
