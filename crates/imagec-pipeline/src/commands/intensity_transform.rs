//! Point-wise intensity adjustments.
//!
//! Applied in a fixed order: normalize, gamma, contrast and brightness,
//! invert.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane, saturate_u16};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

const FULL_SCALE: f64 = 65535.0;

/// Intensity-transform options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntensityTransformSettings {
    /// Stretch the plane's own min..max to the full range first.
    pub normalize: bool,
    /// Multiplicative gain.
    pub contrast: f64,
    /// Additive offset on the 16-bit scale.
    pub brightness: f64,
    /// Gamma exponent on the unit-scaled value.
    pub gamma: f64,
    /// Mirror values around the middle of the range last.
    pub invert: bool,
}

impl Default for IntensityTransformSettings {
    fn default() -> Self {
        Self {
            normalize: false,
            contrast: 1.0,
            brightness: 0.0,
            gamma: 1.0,
            invert: false,
        }
    }
}

impl StepSettings for IntensityTransformSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::IMAGE)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.contrast > 0.0,
            format!("contrast must be positive, got {}", self.contrast),
        );
        log.require(
            self.gamma > 0.0,
            format!("gamma must be positive, got {}", self.gamma),
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(IntensityTransform(self.clone())))
    }
}

settings_command!(IntensityTransform, IntensityTransformSettings, "intensityTransform");

impl IntensityTransform {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let s = &self.0;
        let pixels = image.to_gray16();
        let (lo, hi) = pixels
            .pixels()
            .fold((u16::MAX, 0u16), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        let span = f64::from(hi.saturating_sub(lo));

        let out = Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
            let mut v = f64::from(pixels.get_pixel(x, y).0[0]);
            if s.normalize && span > 0.0 {
                v = (v - f64::from(lo)) / span * FULL_SCALE;
            }
            if (s.gamma - 1.0).abs() > f64::EPSILON {
                v = (v / FULL_SCALE).clamp(0.0, 1.0).powf(s.gamma) * FULL_SCALE;
            }
            v = v.mul_add(s.contrast, s.brightness);
            if s.invert {
                v = FULL_SCALE - v.clamp(0.0, FULL_SCALE);
            }
            image::Luma([saturate_u16(v)])
        });
        *image = image.derive_gray16(out)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{gray, run};
    use crate::diagnostics::CompileLog;

    #[test]
    fn normalize_stretches_to_full_range() {
        let mut image = gray(4, 1, |x, _| 1000 + u16::try_from(x).unwrap() * 1000);
        let step = IntensityTransform(IntensityTransformSettings {
            normalize: true,
            ..IntensityTransformSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(0, 0), 0);
        assert_eq!(image.value_u16(3, 0), u16::MAX);
    }

    #[test]
    fn contrast_brightness_and_invert() {
        let mut image = gray(1, 1, |_, _| 1000);
        let step = IntensityTransform(IntensityTransformSettings {
            contrast: 2.0,
            brightness: 500.0,
            invert: true,
            ..IntensityTransformSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(0, 0), 65535 - 2500);
    }

    #[test]
    fn non_positive_gamma_rejected() {
        let mut log = CompileLog::new();
        IntensityTransformSettings {
            gamma: 0.0,
            ..IntensityTransformSettings::default()
        }
        .check(&mut log.step("p", 2));
        assert!(log.has_errors());
    }
}
