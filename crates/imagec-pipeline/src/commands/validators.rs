//! Validators flag suspicious results without touching the artifacts.
//!
//! A failed check only sets a validity bit at the configured scope; the
//! tile keeps running and its objects are still published.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::measure_intensity::ImageRef;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object_list::ObjectList;
use crate::types::PipelineError;
use crate::validity::{ValidityFlag, ValidityScope};

/// Threshold-validator options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdValidatorSettings {
    /// The unthresholded plane whose histogram is inspected.
    pub image_in: ImageRef,
    /// Class used by the `(plane, class)` scope.
    pub class_in: ClassIdIn,
    /// The check fails when the applied minimum threshold is below
    /// `factor × argmax(histogram)`. 0 disables the check.
    pub hist_min_threshold_filter_factor: f64,
    /// Where the verdict is recorded.
    pub mode: ValidityScope,
}

impl Default for ThresholdValidatorSettings {
    fn default() -> Self {
        Self {
            image_in: ImageRef::Source,
            class_in: ClassIdIn::Default,
            hist_min_threshold_filter_factor: 1.3,
            mode: ValidityScope::InvalidateImage,
        }
    }
}

impl StepSettings for ThresholdValidatorSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::BINARY)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.hist_min_threshold_filter_factor >= 0.0,
            format!(
                "histMinThresholdFilterFactor must not be negative, got {}",
                self.hist_min_threshold_filter_factor
            ),
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ThresholdValidator(self.clone())))
    }
}

settings_command!(ThresholdValidator, ThresholdValidatorSettings, "thresholdValidator");

impl ThresholdValidator {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        if !image.is_binary() {
            return Err(PipelineError::InvalidConfig(
                "threshold validator needs a binary image".into(),
            ));
        }
        let factor = self.0.hist_min_threshold_filter_factor;
        if factor <= 0.0 {
            return Ok(());
        }
        let Some(applied) = image.applied_threshold() else {
            ctx.warn("binary image carries no threshold, validation skipped");
            return Ok(());
        };
        let (_, original) = self.0.image_in.load(ctx)?;
        let histogram = original.histogram16();
        let peak = histogram
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.cmp(b).then(ib.cmp(ia)))
            .map_or(0, |(i, _)| i);
        #[allow(clippy::cast_precision_loss)]
        let limit = peak as f64 * factor;
        tracing::debug!(peak, limit, applied_min = applied.min, "histogram filter");
        if f64::from(applied.min) < limit {
            let class_id = ctx.resolve(self.0.class_in);
            ctx.mark_validity(self.0.mode, ValidityFlag::PossibleWrongThreshold, class_id);
        }
        Ok(())
    }
}

/// Noise-validator options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NoiseValidatorSettings {
    /// Class whose objects are counted.
    pub input_class: ClassIdIn,
    /// More objects than this flag the class as noise.
    pub max_objects: u64,
    /// Where the verdict is recorded.
    pub mode: ValidityScope,
}

impl Default for NoiseValidatorSettings {
    fn default() -> Self {
        Self {
            input_class: ClassIdIn::Default,
            max_objects: 100_000,
            mode: ValidityScope::InvalidateImage,
        }
    }
}

impl StepSettings for NoiseValidatorSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::OBJECT)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        if matches!(self.input_class, ClassIdIn::None) {
            log.error("input class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(NoiseValidator(self.clone())))
    }
}

settings_command!(NoiseValidator, NoiseValidatorSettings, "noiseValidator");

impl NoiseValidator {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let class_id = ctx.resolve(self.0.input_class);
        let count = objects.count(class_id) as u64;
        if count > self.0.max_objects {
            tracing::debug!(%class_id, count, max = self.0.max_objects, "possible noise");
            ctx.mark_validity(self.0.mode, ValidityFlag::PossibleNoise, class_id);
        }
        Ok(())
    }
}
