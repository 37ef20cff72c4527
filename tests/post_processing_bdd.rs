//! BDD tests for `PostProcessor`.

use florence2::config::PostProcessorConfig;
use florence2::geometry::ImageSize;
use florence2::post_processing::{FlorenceResults, PostProcessor};
use florence2::quantizer::QuantizerError;
use florence2::task::Task;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::cell::RefCell;

struct TestContext {
    processor: PostProcessor,
    task: RefCell<Option<Task>>,
    result: RefCell<Option<Result<FlorenceResults, QuantizerError>>>,
}

#[fixture]
fn test_context() -> TestContext {
    TestContext {
        processor: PostProcessor::new(&PostProcessorConfig::default())
            .unwrap_or_else(|e| panic!("default post-processor: {e}")),
        task: RefCell::new(None),
        result: RefCell::new(None),
    }
}

#[given("a post-processor for task {task}")]
#[expect(
    clippy::needless_pass_by_value,
    reason = "BDD macro injects owned value"
)]
fn given_task(task: String, #[from(test_context)] ctx: &TestContext) {
    let parsed = task
        .parse::<Task>()
        .unwrap_or_else(|e| panic!("unknown task in feature: {e}"));
    *ctx.task.borrow_mut() = Some(parsed);
}

#[when("parsing {text}")]
#[expect(
    clippy::needless_pass_by_value,
    reason = "BDD macro injects owned value"
)]
#[expect(clippy::expect_used, reason = "test asserts presence")]
fn when_parsing(text: String, #[from(test_context)] ctx: &TestContext) {
    let task = ctx.task.borrow().expect("task selected");
    *ctx.result.borrow_mut() = Some(ctx.processor.parse(&text, ImageSize::new(1000, 1000), task));
}

#[then("{count:usize} box groups are returned")]
#[expect(clippy::expect_used, reason = "test asserts presence")]
fn then_box_count(#[from(test_context)] ctx: &TestContext, count: usize) {
    let result = ctx.result.borrow();
    match result.as_ref().expect("expected result").as_ref().expect("expected parse") {
        FlorenceResults::BoundingBoxes(groups) => assert_eq!(groups.len(), count),
        other => panic!("expected boxes, got {other:?}"),
    }
}

#[then("the first label is {label}")]
#[expect(
    clippy::needless_pass_by_value,
    reason = "BDD macro injects owned value"
)]
#[expect(clippy::expect_used, reason = "test asserts presence")]
fn then_first_label(label: String, #[from(test_context)] ctx: &TestContext) {
    let result = ctx.result.borrow();
    match result.as_ref().expect("expected result").as_ref().expect("expected parse") {
        FlorenceResults::BoundingBoxes(groups) => {
            assert_eq!(groups.first().map(|g| g.label.as_str()), Some(label.as_str()));
        }
        other => panic!("expected boxes, got {other:?}"),
    }
}

#[then("the text is {text}")]
#[expect(
    clippy::needless_pass_by_value,
    reason = "BDD macro injects owned value"
)]
#[expect(clippy::expect_used, reason = "test asserts presence")]
fn then_text(text: String, #[from(test_context)] ctx: &TestContext) {
    let result = ctx.result.borrow();
    match result.as_ref().expect("expected result").as_ref().expect("expected parse") {
        FlorenceResults::PureText(actual) => assert_eq!(actual, &text),
        other => panic!("expected text, got {other:?}"),
    }
}

#[scenario(path = "tests/features/post_processing.feature", index = 0)]
fn detection_boxes(test_context: TestContext) {
    let _ = test_context;
}

#[scenario(path = "tests/features/post_processing.feature", index = 1)]
fn stoplisted_phrases(test_context: TestContext) {
    let _ = test_context;
}

#[scenario(path = "tests/features/post_processing.feature", index = 2)]
fn plain_caption(test_context: TestContext) {
    let _ = test_context;
}
