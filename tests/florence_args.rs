//! Unit tests for `FlorenceArgs` argument parsing and layering.
#![cfg(feature = "cli")]

use florence2::cli::{FlorenceArgs, load_pixel_values};
use florence2::geometry::ImageSize;
use florence2::task::Task;
use rstest::{fixture, rstest};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::sync::{LazyLock, Mutex, MutexGuard};
use tempfile::NamedTempFile;

#[fixture]
fn temp_toml_file() -> NamedTempFile {
    NamedTempFile::new().unwrap_or_else(|e| panic!("create temp file: {e}"))
}

fn write_toml_content(file: &mut NamedTempFile, content: &str) {
    writeln!(file, "{content}").unwrap_or_else(|e| panic!("write config: {e}"));
}

fn get_config_path(file: &NamedTempFile) -> &str {
    file.path().to_str().unwrap_or_else(|| panic!("path str"))
}

static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

struct EnvVarGuard {
    key: String,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    fn new(key: &str, val: &str) -> Self {
        let lock = ENV_LOCK
            .lock()
            .unwrap_or_else(|e| panic!("env lock poisoned: {e}"));
        // Safety: process-wide env mutation is synchronised by ENV_LOCK.
        unsafe { env::set_var(key, val) };
        Self {
            key: key.to_owned(),
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        // Safety: process-wide env mutation is synchronised by ENV_LOCK.
        unsafe { env::remove_var(&self.key) };
    }
}

fn load(argv: &[&str]) -> FlorenceArgs {
    <FlorenceArgs as ortho_config::OrthoConfig>::load_from_iter(argv.iter().copied())
        .unwrap_or_else(|e| panic!("unexpected parse error: {e}"))
}

#[rstest]
#[case(vec!["florence2"], false)]
#[case(vec!["florence2", "--dry-run=true"], true)]
#[serial]
fn load_parses_dry_run(#[case] argv: Vec<&str>, #[case] expected: bool) {
    assert_eq!(load(&argv).dry_run, expected);
}

#[rstest]
#[case("maybe")]
#[case("1")]
#[case("yes")]
#[serial]
fn load_rejects_invalid_bool(#[case] value: &str) {
    let arg = format!("--dry-run={value}");
    let result =
        <FlorenceArgs as ortho_config::OrthoConfig>::load_from_iter(["florence2", arg.as_str()]);
    assert!(result.is_err());
}

#[rstest]
#[case(None, Ok(Task::Caption))]
#[case(Some("<OD>"), Ok(Task::ObjectDetection))]
#[case(Some("region_proposal"), Ok(Task::RegionProposal))]
#[case(Some("<SEGMENT>"), Err(()))]
#[serial]
fn resolves_task(#[case] task: Option<&str>, #[case] expected: Result<Task, ()>) {
    let mut argv = vec!["florence2"];
    if let Some(task) = task {
        argv.extend(["--task", task]);
    }
    assert_eq!(load(&argv).resolve_task().map_err(|_| ()), expected);
}

#[rstest]
#[serial]
fn image_size_needs_both_dimensions() {
    assert_eq!(load(&["florence2", "--image-width", "640"]).image_size(), None);
    assert_eq!(
        load(&["florence2", "--image-width", "640", "--image-height", "480"]).image_size(),
        Some(ImageSize::new(640, 480))
    );
}

#[rstest]
#[serial]
fn env_var_parsing_sets_task() {
    let _guard = EnvVarGuard::new("FLORENCE2_TASK", "ocr");
    let cfg = FlorenceArgs::load_from_env()
        .unwrap_or_else(|e| panic!("unexpected env parse error: {e}"));
    assert_eq!(cfg.task.as_deref(), Some("ocr"));
}

#[rstest]
#[serial]
fn env_var_parsing_invalid_bool() {
    let _guard = EnvVarGuard::new("FLORENCE2_DRY_RUN", "notabool");
    assert!(FlorenceArgs::load_from_env().is_err());
}

#[rstest]
#[serial]
fn config_file_sets_model_dir(mut temp_toml_file: NamedTempFile) {
    write_toml_content(&mut temp_toml_file, "model_dir = \"/models/florence-2-base\"");
    let cfg = FlorenceArgs::load_from_config(get_config_path(&temp_toml_file))
        .unwrap_or_else(|e| panic!("unexpected config parse error: {e}"));
    assert_eq!(
        cfg.model_dir.as_deref(),
        Some(std::path::Path::new("/models/florence-2-base"))
    );
}

#[rstest]
#[serial]
fn precedence_cli_over_env_and_config(mut temp_toml_file: NamedTempFile) {
    let _guard = EnvVarGuard::new("FLORENCE2_TASK", "ocr");
    write_toml_content(&mut temp_toml_file, "task = \"caption\"");
    let path = get_config_path(&temp_toml_file);
    let cfg = load(&["florence2", "--task", "<OD>", "--config-path", path]);
    assert_eq!(cfg.task.as_deref(), Some("<OD>"));
}

#[rstest]
#[serial]
fn precedence_env_over_config(mut temp_toml_file: NamedTempFile) {
    let _guard = EnvVarGuard::new("FLORENCE2_TASK", "ocr");
    write_toml_content(&mut temp_toml_file, "task = \"caption\"");
    let cfg = FlorenceArgs::load_from_env_and_config(get_config_path(&temp_toml_file))
        .unwrap_or_else(|e| panic!("unexpected parse error: {e}"));
    assert_eq!(cfg.task.as_deref(), Some("ocr"));
}

#[rstest]
fn loads_pixel_tensor() {
    let mut file = NamedTempFile::new().unwrap_or_else(|e| panic!("create temp file: {e}"));
    let values: Vec<u8> = (0..12_u8).flat_map(|v| f32::from(v).to_le_bytes()).collect();
    file.write_all(&values).unwrap_or_else(|e| panic!("write pixels: {e}"));
    let pixels = load_pixel_values(file.path(), 2).unwrap_or_else(|e| panic!("load: {e}"));
    assert_eq!(pixels.dim(), (1, 3, 2, 2));
    assert!((pixels[[0, 2, 1, 1]] - 11.0).abs() < f32::EPSILON);
}

#[rstest]
fn rejects_short_pixel_tensor() {
    let mut file = NamedTempFile::new().unwrap_or_else(|e| panic!("create temp file: {e}"));
    file.write_all(&[0; 10]).unwrap_or_else(|e| panic!("write pixels: {e}"));
    assert!(load_pixel_values(file.path(), 2).is_err());
}
