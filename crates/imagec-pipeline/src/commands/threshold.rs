//! Global thresholds producing a label mask.
//!
//! A step carries one or more thresholds, each labelling its in-range
//! pixels with its own class. The final mask is the pixel-wise maximum
//! of the per-threshold masks, so where ranges overlap the larger label
//! wins. Automatic methods pick the lower bound from the 8-bit histogram
//! of the plane; the configured range then clamps it.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::auto_threshold::{AutoMethod, histogram8};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{AppliedThreshold, Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// How a threshold's lower bound is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdMode {
    /// Use `thresholdMin` as is.
    #[default]
    Manual,
    Huang,
    Intermodes,
    IsoData,
    Li,
    MaxEntropy,
    Mean,
    Minimum,
    Moments,
    Otsu,
    Percentile,
    RenyiEntropy,
    Shanbhag,
    Triangle,
    Yen,
}

impl ThresholdMode {
    /// The automatic method, if any.
    #[must_use]
    pub const fn auto_method(self) -> Option<AutoMethod> {
        Some(match self {
            Self::Manual => return None,
            Self::Huang => AutoMethod::Huang,
            Self::Intermodes => AutoMethod::Intermodes,
            Self::IsoData => AutoMethod::IsoData,
            Self::Li => AutoMethod::Li,
            Self::MaxEntropy => AutoMethod::MaxEntropy,
            Self::Mean => AutoMethod::Mean,
            Self::Minimum => AutoMethod::Minimum,
            Self::Moments => AutoMethod::Moments,
            Self::Otsu => AutoMethod::Otsu,
            Self::Percentile => AutoMethod::Percentile,
            Self::RenyiEntropy => AutoMethod::RenyiEntropy,
            Self::Shanbhag => AutoMethod::Shanbhag,
            Self::Triangle => AutoMethod::Triangle,
            Self::Yen => AutoMethod::Yen,
        })
    }
}

/// One threshold of a threshold step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdEntry {
    /// Lower-bound selection.
    pub mode: ThresholdMode,
    /// Inclusive lower bound (floor for automatic methods).
    pub threshold_min: u16,
    /// Inclusive upper bound.
    pub threshold_max: u16,
    /// Label written for in-range pixels.
    pub class_out: ClassIdIn,
}

impl Default for ThresholdEntry {
    fn default() -> Self {
        Self {
            mode: ThresholdMode::Manual,
            threshold_min: 0,
            threshold_max: u16::MAX,
            class_out: ClassIdIn::Default,
        }
    }
}

impl ThresholdEntry {
    /// The inclusive range applied to `hist`.
    #[must_use]
    pub fn range(&self, hist: &[u64]) -> (u16, u16) {
        let min = match self.mode.auto_method() {
            None => self.threshold_min,
            Some(method) => {
                let level = u32::try_from(method.level(hist)).unwrap_or(u32::MAX);
                let scaled = level.saturating_add(1).saturating_mul(257);
                let scaled = u16::try_from(scaled).unwrap_or(u16::MAX);
                scaled.clamp(self.threshold_min, self.threshold_max.max(self.threshold_min))
            }
        };
        (min, self.threshold_max)
    }
}

/// Threshold step options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdSettings {
    /// Thresholds, composed by pixel-wise maximum.
    pub thresholds: Vec<ThresholdEntry>,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            thresholds: vec![ThresholdEntry::default()],
        }
    }
}

impl StepSettings for ThresholdSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::IMAGE, OutputKind::Binary)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.thresholds.is_empty(), "at least one threshold is required");
        for (i, entry) in self.thresholds.iter().enumerate() {
            log.require(
                entry.threshold_max >= entry.threshold_min,
                format!(
                    "threshold {i}: thresholdMax ({}) < thresholdMin ({})",
                    entry.threshold_max, entry.threshold_min
                ),
            );
            if matches!(entry.class_out, ClassIdIn::None) {
                log.error(format!("threshold {i}: output class must not be NONE"));
            }
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Threshold(self.clone())))
    }
}

settings_command!(Threshold, ThresholdSettings, "threshold");

impl Threshold {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let pixels = image.to_gray16();
        let hist = histogram8(&pixels);
        let mut labels = Gray16Image::new(pixels.width(), pixels.height());
        let mut applied: Option<AppliedThreshold> = None;

        for entry in &self.0.thresholds {
            let (min, max) = entry.range(&hist);
            let label = ctx.resolve(entry.class_out).get();
            tracing::debug!(min, max, label, mode = ?entry.mode, "threshold applied");
            for (src, dst) in pixels.pixels().zip(labels.pixels_mut()) {
                let v = src.0[0];
                if (min..=max).contains(&v) {
                    *dst = Luma([dst.0[0].max(label)]);
                }
            }
            applied = Some(match applied {
                None => AppliedThreshold { min, max },
                Some(a) => AppliedThreshold {
                    min: a.min.min(min),
                    max: a.max.max(max),
                },
            });
        }

        *image = ImagePlane::binary(labels, image.id(), applied)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::class_id::ClassId;
    use crate::commands::tests::{gray, run};
    use crate::diagnostics::CompileLog;

    fn manual(min: u16, max: u16, class: u16) -> ThresholdEntry {
        ThresholdEntry {
            mode: ThresholdMode::Manual,
            threshold_min: min,
            threshold_max: max,
            class_out: ClassIdIn::Class(ClassId::new(class)),
        }
    }

    #[test]
    fn manual_range_labels_pixels() {
        let mut image = gray(4, 1, |x, _| [100, 20000, 40000, 65535][x as usize]);
        let step = Threshold(ThresholdSettings {
            thresholds: vec![manual(20000, 50000, 3)],
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert!(image.is_binary());
        let values: Vec<u16> = (0..4).map(|x| image.value_u16(x, 0)).collect();
        assert_eq!(values, vec![0, 3, 3, 0]);
        assert_eq!(
            image.applied_threshold(),
            Some(AppliedThreshold {
                min: 20000,
                max: 50000
            })
        );
    }

    #[test]
    fn composition_is_pixelwise_max() {
        let mut image = gray(3, 1, |x, _| [1000, 30000, 60000][x as usize]);
        let step = Threshold(ThresholdSettings {
            thresholds: vec![manual(20000, 65535, 5), manual(500, 40000, 2)],
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        let values: Vec<u16> = (0..3).map(|x| image.value_u16(x, 0)).collect();
        assert_eq!(values, vec![2, 5, 5]);
        assert_eq!(
            image.applied_threshold(),
            Some(AppliedThreshold { min: 500, max: 65535 })
        );
    }

    #[test]
    fn default_class_is_resolved() {
        let mut image = gray(2, 1, |x, _| if x == 0 { 0 } else { 50000 });
        let step = Threshold(ThresholdSettings {
            thresholds: vec![ThresholdEntry {
                threshold_min: 100,
                ..ThresholdEntry::default()
            }],
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(1, 0), 1);
    }

    #[test]
    fn otsu_splits_bimodal_plane() {
        let mut image = gray(20, 20, |x, _| if x < 10 { 2000 } else { 50000 });
        let step = Threshold(ThresholdSettings {
            thresholds: vec![ThresholdEntry {
                mode: ThresholdMode::Otsu,
                ..ThresholdEntry::default()
            }],
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(2, 2), 0);
        assert_eq!(image.value_u16(15, 2), 1);
        let applied = image.applied_threshold().unwrap();
        assert!(applied.min > 2000 && applied.min <= 50000);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut log = CompileLog::new();
        ThresholdSettings {
            thresholds: vec![manual(5000, 100, 1)],
        }
        .check(&mut log.step("p", 0));
        assert!(log.has_errors());
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        let err = serde_json::from_str::<ThresholdEntry>(r#"{"mode": "MAGIC"}"#);
        assert!(err.is_err());
        let ok: ThresholdEntry = serde_json::from_str(r#"{"mode": "ISO_DATA", "classOut": 4}"#).unwrap();
        assert_eq!(ok.mode, ThresholdMode::IsoData);
    }
}
