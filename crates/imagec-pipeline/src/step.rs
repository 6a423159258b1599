//! Pipeline steps: one configured command plus its flags.
//!
//! [`CommandSettings`] is an externally tagged union with one variant per
//! command, so a step reads as `{"blur": {...}, "breakPoint": true}` and
//! an unknown tag fails to deserialize.

use serde::{Deserialize, Serialize};

use crate::artifact::InOut;
use crate::command::{BuildEnv, Command, StepSettings};
use crate::commands::adaptive_threshold::AdaptiveThresholdSettings;
use crate::commands::ai_classifier::AiClassifierSettings;
use crate::commands::blur::BlurSettings;
use crate::commands::classifier::ClassifierSettings;
use crate::commands::colocalization::ColocalizationSettings;
use crate::commands::color_filter::ColorFilterSettings;
use crate::commands::crop::CropSettings;
use crate::commands::edge_detection::EdgeDetectionSettings;
use crate::commands::fill_holes::FillHolesSettings;
use crate::commands::hough::HoughTransformSettings;
use crate::commands::image_cache::ImageCacheSettings;
use crate::commands::image_from_class::ImageFromClassSettings;
use crate::commands::image_math::ImageMathSettings;
use crate::commands::intensity_transform::IntensityTransformSettings;
use crate::commands::measure_distance::MeasureDistanceSettings;
use crate::commands::measure_intensity::MeasureIntensitySettings;
use crate::commands::median_subtract::MedianSubtractSettings;
use crate::commands::morphological::MorphologicalSettings;
use crate::commands::object_cache::{ObjectsFromCacheSettings, ObjectsToCacheSettings};
use crate::commands::object_transform::ObjectTransformSettings;
use crate::commands::objects_to_image::ObjectsToImageSettings;
use crate::commands::reclassify::ReclassifySettings;
use crate::commands::rolling_ball::RollingBallSettings;
use crate::commands::save_image::ImageSaverSettings;
use crate::commands::skeletonize::SkeletonizeSettings;
use crate::commands::threshold::ThresholdSettings;
use crate::commands::validators::{NoiseValidatorSettings, ThresholdValidatorSettings};
use crate::commands::voronoi::VoronoiGridSettings;
use crate::commands::watershed::WatershedSettings;
use crate::diagnostics::StepLog;
use crate::types::PipelineError;

/// The settings of one command, tagged by command name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CommandSettings {
    Blur(BlurSettings),
    RollingBall(RollingBallSettings),
    MedianSubtract(MedianSubtractSettings),
    EdgeDetection(EdgeDetectionSettings),
    Crop(CropSettings),
    IntensityTransform(IntensityTransformSettings),
    ColorFilter(ColorFilterSettings),
    Morphological(MorphologicalSettings),
    FillHoles(FillHolesSettings),
    Skeletonize(SkeletonizeSettings),
    Threshold(ThresholdSettings),
    AdaptiveThreshold(AdaptiveThresholdSettings),
    Watershed(WatershedSettings),
    Classifier(ClassifierSettings),
    AiClassifier(AiClassifierSettings),
    HoughTransform(HoughTransformSettings),
    ObjectTransform(ObjectTransformSettings),
    Reclassify(ReclassifySettings),
    VoronoiGrid(VoronoiGridSettings),
    Colocalization(ColocalizationSettings),
    MeasureIntensity(MeasureIntensitySettings),
    MeasureDistance(MeasureDistanceSettings),
    ImageMath(ImageMathSettings),
    ImageCache(ImageCacheSettings),
    ObjectsToCache(ObjectsToCacheSettings),
    ObjectsFromCache(ObjectsFromCacheSettings),
    ImageFromClass(ImageFromClassSettings),
    ObjectsToImage(ObjectsToImageSettings),
    ImageSaver(ImageSaverSettings),
    ThresholdValidator(ThresholdValidatorSettings),
    NoiseValidator(NoiseValidatorSettings),
}

impl CommandSettings {
    /// The variant's settings behind the shared trait.
    #[must_use]
    pub fn settings(&self) -> &dyn StepSettings {
        match self {
            Self::Blur(s) => s,
            Self::RollingBall(s) => s,
            Self::MedianSubtract(s) => s,
            Self::EdgeDetection(s) => s,
            Self::Crop(s) => s,
            Self::IntensityTransform(s) => s,
            Self::ColorFilter(s) => s,
            Self::Morphological(s) => s,
            Self::FillHoles(s) => s,
            Self::Skeletonize(s) => s,
            Self::Threshold(s) => s,
            Self::AdaptiveThreshold(s) => s,
            Self::Watershed(s) => s,
            Self::Classifier(s) => s,
            Self::AiClassifier(s) => s,
            Self::HoughTransform(s) => s,
            Self::ObjectTransform(s) => s,
            Self::Reclassify(s) => s,
            Self::VoronoiGrid(s) => s,
            Self::Colocalization(s) => s,
            Self::MeasureIntensity(s) => s,
            Self::MeasureDistance(s) => s,
            Self::ImageMath(s) => s,
            Self::ImageCache(s) => s,
            Self::ObjectsToCache(s) => s,
            Self::ObjectsFromCache(s) => s,
            Self::ImageFromClass(s) => s,
            Self::ObjectsToImage(s) => s,
            Self::ImageSaver(s) => s,
            Self::ThresholdValidator(s) => s,
            Self::NoiseValidator(s) => s,
        }
    }

    /// The serde tag of the variant.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Declared capabilities of the command.
    #[must_use]
    pub fn in_out(&self) -> InOut {
        self.settings().in_out()
    }

    /// Record range and consistency problems.
    pub fn check(&self, log: &mut StepLog<'_>) {
        self.settings().check(log);
    }

    /// Build the runnable command.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a collaborator the command needs is
    /// missing or fails.
    pub fn build(&self, env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        self.settings().build(env)
    }
}

/// One entry of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    /// The configured command.
    #[serde(flatten)]
    pub command: CommandSettings,
    /// Skipped by the executor and ignored by the type validator.
    #[serde(default)]
    pub disabled: bool,
    /// Protected from editing; no effect on execution.
    #[serde(default)]
    pub locked: bool,
    /// Halt the tile after this step and publish what exists.
    #[serde(default)]
    pub break_point: bool,
}

impl PipelineStep {
    /// An enabled step without flags.
    #[must_use]
    pub const fn new(command: CommandSettings) -> Self {
        Self {
            command,
            disabled: false,
            locked: false,
            break_point: false,
        }
    }

    /// The same step with the breakpoint flag set.
    #[must_use]
    pub const fn with_break_point(mut self) -> Self {
        self.break_point = true;
        self
    }

    /// The same step, disabled.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

impl From<CommandSettings> for PipelineStep {
    fn from(command: CommandSettings) -> Self {
        Self::new(command)
    }
}
