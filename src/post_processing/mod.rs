//! Converts generated text into typed results in original-image pixels.
//!
//! Generated text embeds positions as `<loc_N>` bin tokens. Each parser
//! pulls phrase text and bin runs out with regular expressions and maps the
//! bins back through the quantizers using the caller's image size. Text that
//! does not match yields fewer results, never an error.

mod patterns;

use std::collections::HashSet;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PostProcessorConfig;
use crate::geometry::{BoundingBox, Coordinates, ImageSize};
use crate::quantizer::{BoxQuantizer, CoordinatesQuantizer, QuantizerError};
use crate::task::Task;
use patterns::{
    BOX, GROUNDING_MARKERS, LEADING_PARTIAL_LOC, LOC, OCR_LINE, PHRASE, PHRASE_ALLOW_EMPTY,
    PHRASE_TEXT, POLYGON_INSTANCE, POLYGON_PHRASE, POLYGON_PHRASE_ALLOW_EMPTY,
    POLYGON_PHRASE_TEXT, POLYGON_RUN,
};

const POLYGON_START: &str = "<poly>";
const POLYGON_END: &str = "</poly>";

/// Generic phrases dropped from phrase-grounding results.
static PHRASE_GROUNDING_STOPLIST: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "it", "I", "me", "mine", "you", "your", "yours", "he", "him", "his", "she", "her", "hers",
        "they", "them", "their", "theirs", "one", "oneself", "we", "us", "our", "ours", "its",
        "myself", "yourself", "himself", "herself", "itself", "ourselves", "yourselves",
        "themselves", "this", "that", "these", "those", "who", "whom", "whose", "which", "what",
        "all", "another", "any", "anybody", "anyone", "anything", "each", "everybody",
        "everyone", "everything", "few", "many", "nobody", "none", "several", "some",
        "somebody", "someone", "something", "each other", "one another", "the image", "image",
        "images", "the", "a", "an", "a group", "other objects", "lots", "a set",
    ]
    .into_iter()
    .collect()
});

/// Parsing strategy applied to a task's generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessingType {
    PureText,
    OcrWithRegion,
    Od,
    Bboxes,
    DescriptionWithBboxes,
    PhraseGrounding,
    DescriptionWithPolygons,
    Polygons,
    /// Polygons when the text contains `<poly>`, boxes otherwise.
    DescriptionWithBboxesOrPolygons,
}

/// A text line with its four-corner quad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledOcrBox {
    pub quad_box: Vec<Coordinates<f32>>,
    pub text: String,
}

/// A phrase with every box generated for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledBoundingBoxes {
    pub bboxes: Vec<BoundingBox<f32>>,
    pub label: String,
}

/// One polygon instance: its sub-polygons and, when boxes lead each
/// instance, the enclosing box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPolygon {
    pub label: String,
    pub polygons: Vec<Vec<Coordinates<f32>>>,
    pub bboxes: Vec<BoundingBox<f32>>,
}

/// Structured result for one input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FlorenceResults {
    PureText(String),
    Ocr(Vec<LabeledOcrBox>),
    BoundingBoxes(Vec<LabeledBoundingBoxes>),
    Polygons(Vec<LabeledPolygon>),
}

/// Parser bound to one pair of quantizer grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessor {
    boxes: BoxQuantizer,
    coordinates: CoordinatesQuantizer,
    polygon_with_box_at_start: bool,
}

impl PostProcessor {
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveBins`] for an empty grid.
    pub fn new(config: &PostProcessorConfig) -> Result<Self, QuantizerError> {
        Ok(Self {
            boxes: BoxQuantizer::new(config.mode, config.box_bins)?,
            coordinates: CoordinatesQuantizer::new(config.mode, config.coordinate_bins)?,
            polygon_with_box_at_start: config.polygon_with_box_at_start,
        })
    }

    /// Parses `text` the way `task` requires.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse(
        &self,
        text: &str,
        image_size: ImageSize,
        task: Task,
    ) -> Result<FlorenceResults, QuantizerError> {
        self.parse_as(text, image_size, task.post_processing())
    }

    /// Parses `text` with an explicit strategy.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse_as(
        &self,
        text: &str,
        size: ImageSize,
        kind: PostProcessingType,
    ) -> Result<FlorenceResults, QuantizerError> {
        if size.width == 0 || size.height == 0 {
            return Err(QuantizerError::NonPositiveSize {
                width: size.width,
                height: size.height,
            });
        }
        Ok(match kind {
            PostProcessingType::PureText => {
                FlorenceResults::PureText(strip_sequence_markers(text))
            }
            PostProcessingType::OcrWithRegion => FlorenceResults::Ocr(self.parse_ocr(text, size)?),
            PostProcessingType::Od | PostProcessingType::DescriptionWithBboxes => {
                FlorenceResults::BoundingBoxes(self.parse_description_with_bboxes(text, size, false)?)
            }
            PostProcessingType::Bboxes => {
                FlorenceResults::BoundingBoxes(self.parse_description_with_bboxes(text, size, true)?)
            }
            PostProcessingType::PhraseGrounding => {
                FlorenceResults::BoundingBoxes(self.parse_phrase_grounding(text, size)?)
            }
            PostProcessingType::DescriptionWithPolygons => {
                FlorenceResults::Polygons(self.parse_description_with_polygons(text, size, false)?)
            }
            PostProcessingType::Polygons => {
                FlorenceResults::Polygons(self.parse_description_with_polygons(text, size, true)?)
            }
            PostProcessingType::DescriptionWithBboxesOrPolygons if text.contains(POLYGON_START) => {
                FlorenceResults::Polygons(self.parse_description_with_polygons(text, size, false)?)
            }
            PostProcessingType::DescriptionWithBboxesOrPolygons => {
                FlorenceResults::BoundingBoxes(self.parse_description_with_bboxes(text, size, false)?)
            }
        })
    }

    /// Text spans each followed by eight location tokens.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse_ocr(
        &self,
        text: &str,
        image_size: ImageSize,
    ) -> Result<Vec<LabeledOcrBox>, QuantizerError> {
        let text = text.replace("<s>", "");
        let mut instances = Vec::new();
        for caps in OCR_LINE.captures_iter(&text) {
            let bins: Option<Vec<u32>> = (2..=9)
                .map(|group| caps.get(group).and_then(|m| m.as_str().parse().ok()))
                .collect();
            let Some(bins) = bins else {
                warn!(line = &caps[0], "dropping OCR line with unparsable bins");
                continue;
            };
            let corners: Vec<Coordinates<u32>> = bins
                .chunks_exact(2)
                .map(|pair| Coordinates::new(pair[0], pair[1]))
                .collect();
            instances.push(LabeledOcrBox {
                quad_box: self.coordinates.dequantize(&corners, image_size)?,
                text: strip_sequence_markers(caps.get(1).map_or("", |m| m.as_str())),
            });
        }
        Ok(instances)
    }

    /// Phrases each followed by one or more four-token boxes.
    ///
    /// With `allow_empty_phrase`, bare box runs are accepted and labelled
    /// with an empty string.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse_description_with_bboxes(
        &self,
        text: &str,
        image_size: ImageSize,
        allow_empty_phrase: bool,
    ) -> Result<Vec<LabeledBoundingBoxes>, QuantizerError> {
        let text = strip_markup(text);
        let phrase_pattern = if allow_empty_phrase {
            &*PHRASE_ALLOW_EMPTY
        } else {
            &*PHRASE
        };

        let mut results = Vec::new();
        for phrase_match in phrase_pattern.find_iter(&text) {
            let raw = phrase_match.as_str();
            let stripped = raw.replace("<ground>", "").replace("<obj>", "");
            if stripped.is_empty() && !allow_empty_phrase {
                continue;
            }
            let Some(phrase) = capture_phrase(&PHRASE_TEXT, &stripped) else {
                continue;
            };
            let bins = parse_boxes(raw);
            if bins.is_empty() {
                continue;
            }
            results.push(LabeledBoundingBoxes {
                bboxes: self.boxes.dequantize(&bins, image_size)?,
                label: strip_sequence_markers(&printable_ascii(phrase.trim())),
            });
        }
        Ok(results)
    }

    /// Like [`parse_description_with_bboxes`](Self::parse_description_with_bboxes)
    /// but drops generic phrases such as `"it"` or `"the image"`.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse_phrase_grounding(
        &self,
        text: &str,
        image_size: ImageSize,
    ) -> Result<Vec<LabeledBoundingBoxes>, QuantizerError> {
        let text = strip_markup(text);
        let mut results = Vec::new();
        for phrase_match in PHRASE.find_iter(&text) {
            let raw = phrase_match.as_str();
            let stripped = GROUNDING_MARKERS.replace_all(raw, "");
            if stripped.trim().is_empty() {
                continue;
            }
            let Some(phrase) = capture_phrase(&PHRASE_TEXT, &stripped) else {
                continue;
            };
            let bins = parse_boxes(raw);
            if bins.is_empty() {
                continue;
            }
            let phrase = phrase.trim();
            if PHRASE_GROUNDING_STOPLIST.contains(phrase) {
                continue;
            }
            results.push(LabeledBoundingBoxes {
                bboxes: self.boxes.dequantize(&bins, image_size)?,
                label: strip_sequence_markers(&printable_ascii(phrase)),
            });
        }
        Ok(results)
    }

    /// Phrases followed by polygon runs, optionally grouped into
    /// `<poly>…</poly>` instances and split by `<sep>`.
    ///
    /// Each run becomes one sub-polygon; an odd trailing bin is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`QuantizerError::NonPositiveSize`] for an empty image.
    pub fn parse_description_with_polygons(
        &self,
        text: &str,
        image_size: ImageSize,
        allow_empty_phrase: bool,
    ) -> Result<Vec<LabeledPolygon>, QuantizerError> {
        let text = strip_markup(text);
        let phrase_pattern = if allow_empty_phrase {
            &*POLYGON_PHRASE_ALLOW_EMPTY
        } else {
            &*POLYGON_PHRASE
        };

        let mut results = Vec::new();
        for phrase_match in phrase_pattern.find_iter(&text) {
            let raw = phrase_match.as_str();
            let stripped = LEADING_PARTIAL_LOC.replace(raw, "");
            if stripped.is_empty() && !allow_empty_phrase {
                continue;
            }
            let Some(phrase) = capture_phrase(&POLYGON_PHRASE_TEXT, &stripped) else {
                continue;
            };
            let phrase = phrase.trim().to_owned();

            let instances: Vec<&str> = if raw.contains(POLYGON_START) && raw.contains(POLYGON_END) {
                POLYGON_INSTANCE
                    .captures_iter(raw)
                    .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
                    .collect()
            } else {
                vec![raw]
            };

            for instance in instances {
                if let Some(polygon) = self.parse_polygon_instance(instance, &phrase, image_size)? {
                    results.push(polygon);
                }
            }
        }
        Ok(results)
    }

    fn parse_polygon_instance(
        &self,
        instance: &str,
        label: &str,
        image_size: ImageSize,
    ) -> Result<Option<LabeledPolygon>, QuantizerError> {
        let runs: Vec<Vec<u32>> = POLYGON_RUN
            .captures_iter(instance)
            .filter_map(|caps| caps.get(1).map(|m| parse_locs(m.as_str())))
            .collect();
        if runs.is_empty() {
            return Ok(None);
        }

        let mut enclosing: Option<BoundingBox<u32>> = None;
        let mut polygons = Vec::with_capacity(runs.len());
        for mut bins in runs {
            if self.polygon_with_box_at_start && enclosing.is_none() {
                if bins.len() > 4 {
                    enclosing = BoundingBox::from_slice(&bins);
                    bins.drain(..4);
                } else {
                    enclosing = Some(BoundingBox::default());
                }
            }
            if bins.len() % 2 == 1 {
                bins.pop();
            }
            let points: Vec<Coordinates<u32>> = bins
                .chunks_exact(2)
                .map(|pair| Coordinates::new(pair[0], pair[1]))
                .collect();
            polygons.push(self.coordinates.dequantize(&points, image_size)?);
        }

        let bboxes = match enclosing {
            Some(bbox) => self.boxes.dequantize(&[bbox], image_size)?,
            None => Vec::new(),
        };
        Ok(Some(LabeledPolygon {
            label: label.to_owned(),
            polygons,
            bboxes,
        }))
    }
}

/// Removes `<s>` and `</s>`.
fn strip_sequence_markers(text: &str) -> String {
    text.replace("<s>", "").replace("</s>", "")
}

/// Removes `<s>`, `</s>`, and `<pad>`.
fn strip_markup(text: &str) -> String {
    strip_sequence_markers(text).replace("<pad>", "")
}

fn printable_ascii(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect()
}

fn capture_phrase<'t>(pattern: &regex::Regex, text: &'t str) -> Option<&'t str> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn parse_locs(run: &str) -> Vec<u32> {
    LOC.captures_iter(run)
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse().ok()))
        .collect()
}

fn parse_boxes(text: &str) -> Vec<BoundingBox<u32>> {
    BOX.captures_iter(text)
        .filter_map(|caps| {
            let bins: Option<Vec<u32>> = (1..=4)
                .map(|group| caps.get(group).and_then(|m| m.as_str().parse().ok()))
                .collect();
            if bins.is_none() {
                warn!(group = &caps[0], "dropping box with unparsable bins");
            }
            bins.and_then(|b| BoundingBox::from_slice(&b))
        })
        .collect()
}
