//! End-to-end runs of the pipeline over the scripted backend.

use florence2::config::{FlorenceConfig, GenerationConfig};
use florence2::generation::GenerationError;
use florence2::generation::cancel::CancellationToken;
use florence2::geometry::{Coordinates, ImageSize};
use florence2::model::{FlorenceError, FlorenceModel};
use florence2::post_processing::FlorenceResults;
use florence2::task::Task;
use florence2::tests::support::{
    ScriptedBackend, ScriptedBackendError, TEST_LAYOUT, ids, loc, toy_tokenizer,
};
use ndarray::Array4;
use rstest::rstest;

fn model(script: Vec<Vec<i64>>) -> FlorenceModel<ScriptedBackend> {
    model_over(ScriptedBackend::new(toy_tokenizer().vocab_size(), script))
}

fn model_over(backend: ScriptedBackend) -> FlorenceModel<ScriptedBackend> {
    let tokenizer = toy_tokenizer();
    let config = FlorenceConfig {
        generation: GenerationConfig {
            max_length: 32,
            ..GenerationConfig::default()
        },
        layout: TEST_LAYOUT,
        ..FlorenceConfig::default()
    };
    FlorenceModel::new(backend, tokenizer, config).unwrap_or_else(|e| panic!("model: {e}"))
}

fn column(tokens: &[i64]) -> Vec<Vec<i64>> {
    tokens.iter().map(|&t| vec![t]).collect()
}

#[rstest]
fn reads_text_regions() {
    let model = model(column(&[
        ids::BOS,
        ids::CAT,
        loc(10),
        loc(10),
        loc(20),
        loc(10),
        loc(20),
        loc(15),
        loc(10),
        loc(15),
        ids::EOS,
    ]));
    let pixels = Array4::<f32>::zeros((1, 3, 4, 4));
    let results = model
        .run(
            Task::OcrWithRegion,
            None,
            pixels.view(),
            &[ImageSize::new(1000, 1000)],
            &CancellationToken::new(),
        )
        .unwrap_or_else(|e| panic!("run: {e}"));
    let [FlorenceResults::Ocr(lines)] = results.as_slice() else {
        panic!("expected OCR output, got {results:?}");
    };
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, "cat");
    assert_eq!(
        lines[0].quad_box,
        vec![
            Coordinates::new(10.5, 10.5),
            Coordinates::new(20.5, 10.5),
            Coordinates::new(20.5, 15.5),
            Coordinates::new(10.5, 15.5),
        ]
    );
}

#[rstest]
fn segments_a_batch_with_region_prompt() {
    let model = model(vec![
        vec![ids::BOS, ids::BOS],
        vec![ids::POLY, ids::EOS],
        vec![loc(0), ids::EOS],
        vec![loc(0), ids::EOS],
        vec![loc(10), ids::EOS],
        vec![loc(0), ids::EOS],
        vec![loc(10), ids::EOS],
        vec![loc(10), ids::EOS],
        vec![ids::POLY_END, ids::EOS],
        vec![ids::EOS, ids::EOS],
    ]);
    let pixels = Array4::<f32>::zeros((2, 3, 4, 4));
    let results = model
        .run(
            Task::RegionToSegmentation,
            Some("<loc_1><loc_2><loc_3><loc_4>"),
            pixels.view(),
            &[ImageSize::new(1000, 1000), ImageSize::new(50, 50)],
            &CancellationToken::new(),
        )
        .unwrap_or_else(|e| panic!("run: {e}"));
    let [FlorenceResults::Polygons(first), FlorenceResults::Polygons(second)] = results.as_slice() else {
        panic!("expected two polygon outputs, got {results:?}");
    };
    assert_eq!(first.len(), 1);
    assert_eq!(
        first[0].polygons,
        vec![vec![
            Coordinates::new(0.5, 0.5),
            Coordinates::new(10.5, 0.5),
            Coordinates::new(10.5, 10.5),
        ]]
    );
    assert!(second.is_empty());
}

#[rstest]
fn cancelled_run_returns_nothing() {
    let token = CancellationToken::new();
    let tokenizer = toy_tokenizer();
    let backend = ScriptedBackend::new(tokenizer.vocab_size(), Vec::new()).cancelling_at(0, token.clone());
    let config = FlorenceConfig {
        layout: TEST_LAYOUT,
        ..FlorenceConfig::default()
    };
    let model = FlorenceModel::new(backend, tokenizer, config).unwrap_or_else(|e| panic!("model: {e}"));
    let pixels = Array4::<f32>::zeros((1, 3, 4, 4));
    let result = model.run(
        Task::Caption,
        None,
        pixels.view(),
        &[ImageSize::new(10, 10)],
        &token,
    );
    assert!(matches!(
        result,
        Err(FlorenceError::Generation(florence2::GenerationError::Cancelled))
    ));
    assert_eq!(model.backend().steps(), 1);
}

fn caption(
    model: &FlorenceModel<ScriptedBackend>,
    cancel: &CancellationToken,
) -> Result<Vec<FlorenceResults>, FlorenceError<ScriptedBackendError>> {
    let pixels = Array4::<f32>::zeros((1, 3, 4, 4));
    model.run(Task::Caption, None, pixels.view(), &[ImageSize::new(10, 10)], cancel)
}

#[rstest]
fn run_after_a_cancelled_run_succeeds() {
    let first = CancellationToken::new();
    let vocab_size = toy_tokenizer().vocab_size();
    let backend = ScriptedBackend::new(vocab_size, column(&[ids::BOS, ids::BOS, ids::CAT, ids::EOS]))
        .cancelling_at(0, first.clone());
    let model = model_over(backend);

    let cancelled = caption(&model, &first);
    assert!(matches!(
        cancelled,
        Err(FlorenceError::Generation(GenerationError::Cancelled))
    ));
    assert!(model.backend().is_terminated());

    let results = caption(&model, &CancellationToken::new())
        .unwrap_or_else(|e| panic!("second run: {e}"));
    assert_eq!(results, vec![FlorenceResults::PureText("cat".into())]);
    assert!(!model.backend().is_terminated());
}

#[rstest]
fn cancelled_token_never_reaches_backend() {
    let model = model(Vec::new());
    let token = CancellationToken::new();
    token.cancel();
    let result = caption(&model, &token);
    assert!(matches!(
        result,
        Err(FlorenceError::Generation(GenerationError::Cancelled))
    ));
    assert_eq!(model.backend().steps(), 0);
    assert!(model.backend().encoder_lengths().is_empty());
    assert!(!model.backend().is_terminated());
}

#[rstest]
fn finished_runs_release_their_interrupt_hook() {
    let script = column(&[ids::BOS, ids::CAT, ids::EOS].repeat(5));
    let model = model(script);
    let token = CancellationToken::new();
    for run in 0..5 {
        let results = caption(&model, &token).unwrap_or_else(|e| panic!("run {run}: {e}"));
        assert_eq!(results, vec![FlorenceResults::PureText("cat".into())]);
    }
    assert_eq!(token.registered_hooks(), 0);

    token.cancel();
    assert!(!model.backend().is_terminated());
}
