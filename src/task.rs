//! Florence-2 task catalogue and prompt construction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::post_processing::PostProcessingType;

/// Errors raised while selecting a task or building its prompt.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TaskError {
    #[error("unknown task {0:?}")]
    Unknown(String),
    #[error("task {0} requires text input")]
    MissingTextInput(Task),
}

/// One of the fifteen tasks the model was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Ocr,
    OcrWithRegion,
    Caption,
    DetailedCaption,
    MoreDetailedCaption,
    ObjectDetection,
    DenseRegionCaption,
    CaptionToPhraseGrounding,
    ReferringExpressionSegmentation,
    RegionToSegmentation,
    OpenVocabularyDetection,
    RegionToCategory,
    RegionToDescription,
    RegionToOcr,
    RegionProposal,
}

enum Prompt {
    Fixed(&'static str),
    /// `{}` is replaced by the caller's text.
    Template(&'static str),
}

impl Task {
    pub const ALL: [Self; 15] = [
        Self::Ocr,
        Self::OcrWithRegion,
        Self::Caption,
        Self::DetailedCaption,
        Self::MoreDetailedCaption,
        Self::ObjectDetection,
        Self::DenseRegionCaption,
        Self::CaptionToPhraseGrounding,
        Self::ReferringExpressionSegmentation,
        Self::RegionToSegmentation,
        Self::OpenVocabularyDetection,
        Self::RegionToCategory,
        Self::RegionToDescription,
        Self::RegionToOcr,
        Self::RegionProposal,
    ];

    /// The model's task token, e.g. `<OD>`.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Ocr => "<OCR>",
            Self::OcrWithRegion => "<OCR_WITH_REGION>",
            Self::Caption => "<CAPTION>",
            Self::DetailedCaption => "<DETAILED_CAPTION>",
            Self::MoreDetailedCaption => "<MORE_DETAILED_CAPTION>",
            Self::ObjectDetection => "<OD>",
            Self::DenseRegionCaption => "<DENSE_REGION_CAPTION>",
            Self::CaptionToPhraseGrounding => "<CAPTION_TO_PHRASE_GROUNDING>",
            Self::ReferringExpressionSegmentation => "<REFERRING_EXPRESSION_SEGMENTATION>",
            Self::RegionToSegmentation => "<REGION_TO_SEGMENTATION>",
            Self::OpenVocabularyDetection => "<OPEN_VOCABULARY_DETECTION>",
            Self::RegionToCategory => "<REGION_TO_CATEGORY>",
            Self::RegionToDescription => "<REGION_TO_DESCRIPTION>",
            Self::RegionToOcr => "<REGION_TO_OCR>",
            Self::RegionProposal => "<REGION_PROPOSAL>",
        }
    }

    /// Snake-case name, as used in configuration and on the command line.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::OcrWithRegion => "ocr_with_region",
            Self::Caption => "caption",
            Self::DetailedCaption => "detailed_caption",
            Self::MoreDetailedCaption => "more_detailed_caption",
            Self::ObjectDetection => "object_detection",
            Self::DenseRegionCaption => "dense_region_caption",
            Self::CaptionToPhraseGrounding => "caption_to_phrase_grounding",
            Self::ReferringExpressionSegmentation => "referring_expression_segmentation",
            Self::RegionToSegmentation => "region_to_segmentation",
            Self::OpenVocabularyDetection => "open_vocabulary_detection",
            Self::RegionToCategory => "region_to_category",
            Self::RegionToDescription => "region_to_description",
            Self::RegionToOcr => "region_to_ocr",
            Self::RegionProposal => "region_proposal",
        }
    }

    const fn prompt_kind(self) -> Prompt {
        match self {
            Self::Ocr => Prompt::Fixed("What is the text in the image?"),
            Self::OcrWithRegion => Prompt::Fixed("What is the text in the image, with regions?"),
            Self::Caption => Prompt::Fixed("What does the image describe?"),
            Self::DetailedCaption => Prompt::Fixed("Describe in detail what is shown in the image."),
            Self::MoreDetailedCaption => {
                Prompt::Fixed("Describe with a paragraph what is shown in the image.")
            }
            Self::ObjectDetection => Prompt::Fixed("Locate the objects with category name in the image."),
            Self::DenseRegionCaption => {
                Prompt::Fixed("Locate the objects in the image, with their descriptions.")
            }
            Self::RegionProposal => Prompt::Fixed("Locate the region proposals in the image."),
            Self::CaptionToPhraseGrounding => Prompt::Template("Locate the phrases in the caption: {}"),
            Self::ReferringExpressionSegmentation => Prompt::Template("Locate {} in the image with mask"),
            Self::RegionToSegmentation => Prompt::Template("What is the polygon mask of region {}"),
            Self::OpenVocabularyDetection => Prompt::Template("Locate {} in the image."),
            Self::RegionToCategory => Prompt::Template("What is the region {}?"),
            Self::RegionToDescription => Prompt::Template("What does the region {} describe?"),
            Self::RegionToOcr => Prompt::Template("What text is in the region {}?"),
        }
    }

    /// Whether [`Task::prompt`] needs caller text.
    #[must_use]
    pub const fn requires_text_input(self) -> bool {
        matches!(self.prompt_kind(), Prompt::Template(_))
    }

    /// Natural-language prompt sent to the encoder.
    ///
    /// Text input is ignored by tasks with a fixed prompt.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::MissingTextInput`] when a templated task gets no
    /// text.
    pub fn prompt(self, text_input: Option<&str>) -> Result<String, TaskError> {
        match self.prompt_kind() {
            Prompt::Fixed(prompt) => Ok(prompt.to_owned()),
            Prompt::Template(template) => text_input
                .map(|text| template.replacen("{}", text, 1))
                .ok_or(TaskError::MissingTextInput(self)),
        }
    }

    /// How generated text for this task is parsed.
    #[must_use]
    pub const fn post_processing(self) -> PostProcessingType {
        match self {
            Self::Ocr
            | Self::Caption
            | Self::DetailedCaption
            | Self::MoreDetailedCaption
            | Self::RegionToCategory
            | Self::RegionToDescription
            | Self::RegionToOcr => PostProcessingType::PureText,
            Self::OcrWithRegion => PostProcessingType::OcrWithRegion,
            Self::ObjectDetection | Self::DenseRegionCaption => {
                PostProcessingType::DescriptionWithBboxes
            }
            Self::CaptionToPhraseGrounding => PostProcessingType::PhraseGrounding,
            Self::ReferringExpressionSegmentation | Self::RegionToSegmentation => {
                PostProcessingType::Polygons
            }
            Self::OpenVocabularyDetection => PostProcessingType::DescriptionWithBboxesOrPolygons,
            Self::RegionProposal => PostProcessingType::Bboxes,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Task {
    type Err = TaskError;

    /// Accepts task tokens with or without angle brackets (`<OD>`, `OD`)
    /// and snake-case names (`object_detection`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .unwrap_or(trimmed);
        Self::ALL
            .into_iter()
            .find(|task| {
                task.token().get(1..task.token().len() - 1) == Some(bare) || task.name() == bare
            })
            .ok_or_else(|| TaskError::Unknown(s.to_owned()))
    }
}
