//! Local (adaptive) thresholds.
//!
//! Each pixel is compared against statistics of a disc of `radius`
//! around it. Local Otsu uses a square window clipped at the border.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::auto_threshold::{AutoMethod, BINS};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::filters::{KernelShape, Rank, kernel_offsets, rank_filter, sample};
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Local threshold algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptiveMethod {
    /// Mid-grey of local min and max, with a contrast gate.
    #[default]
    Bernsen,
    /// Closer to the local max than to the local min.
    Contrast,
    /// Above the local mean minus `c`.
    Mean,
    /// Above the local median minus `c`.
    Median,
    /// Otsu level of the local window.
    Otsu,
}

/// Adaptive threshold options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptiveThresholdSettings {
    /// Algorithm.
    pub method: AdaptiveMethod,
    /// Window radius in pixels.
    pub radius: u32,
    /// Offset subtracted from the local statistic (mean and median).
    pub c_value: i32,
    /// Bernsen contrast gate, in 8-bit grey levels.
    pub contrast_threshold: u16,
    /// Label written for foreground pixels.
    pub class_out: ClassIdIn,
}

impl Default for AdaptiveThresholdSettings {
    fn default() -> Self {
        Self {
            method: AdaptiveMethod::Bernsen,
            radius: 15,
            c_value: 0,
            contrast_threshold: 15,
            class_out: ClassIdIn::Default,
        }
    }
}

impl StepSettings for AdaptiveThresholdSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::IMAGE, OutputKind::Binary)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(self.radius >= 1, "radius must be at least 1");
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(AdaptiveThreshold(self.clone())))
    }
}

settings_command!(AdaptiveThreshold, AdaptiveThresholdSettings, "adaptiveThreshold");

impl AdaptiveThreshold {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let pixels = image.to_gray16();
        let label = ctx.resolve(self.0.class_out).get();
        let foreground = self.foreground(&pixels);
        let labels = Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
            let i = (y as usize) * (pixels.width() as usize) + x as usize;
            Luma([if foreground[i] { label } else { 0 }])
        });
        *image = ImagePlane::binary(labels, image.id(), None)?;
        Ok(())
    }

    fn foreground(&self, pixels: &Gray16Image) -> Vec<bool> {
        let s = &self.0;
        let disc = kernel_offsets(KernelShape::Ellipse, s.radius * 2 + 1);
        let raw = pixels.as_raw();
        match s.method {
            AdaptiveMethod::Bernsen => {
                let max = rank_filter(pixels, &disc, Rank::Max);
                let min = rank_filter(pixels, &disc, Rank::Min);
                let gate = i32::from(s.contrast_threshold) * 257;
                raw.iter()
                    .zip(max.as_raw().iter().zip(min.as_raw()))
                    .map(|(&v, (&hi, &lo))| {
                        let contrast = i32::from(hi) - i32::from(lo);
                        let mid = (i32::from(hi) + i32::from(lo)) / 2;
                        if contrast < gate {
                            mid >= 32768
                        } else {
                            i32::from(v) >= mid
                        }
                    })
                    .collect()
            }
            AdaptiveMethod::Contrast => {
                let max = rank_filter(pixels, &disc, Rank::Max);
                let min = rank_filter(pixels, &disc, Rank::Min);
                raw.iter()
                    .zip(max.as_raw().iter().zip(min.as_raw()))
                    .map(|(&v, (&hi, &lo))| v != 0 && hi - v <= v - lo)
                    .collect()
            }
            AdaptiveMethod::Mean => {
                let mean = local_mean(pixels, &disc);
                raw.iter()
                    .zip(mean)
                    .map(|(&v, m)| f64::from(v) > m - f64::from(s.c_value))
                    .collect()
            }
            AdaptiveMethod::Median => {
                let median = rank_filter(pixels, &disc, Rank::Median);
                raw.iter()
                    .zip(median.as_raw())
                    .map(|(&v, &m)| i32::from(v) > i32::from(m) - s.c_value)
                    .collect()
            }
            AdaptiveMethod::Otsu => local_otsu(pixels, s.radius),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn local_mean(pixels: &Gray16Image, offsets: &[(i32, i32)]) -> Vec<f64> {
    let n = offsets.len().max(1) as f64;
    pixels
        .enumerate_pixels()
        .map(|(x, y, _)| {
            let sum: u64 = offsets
                .iter()
                .map(|&(dx, dy)| {
                    u64::from(sample(pixels, i64::from(x) + i64::from(dx), i64::from(y) + i64::from(dy)))
                })
                .sum();
            sum as f64 / n
        })
        .collect()
}

/// Per-pixel Otsu level over a `2r x 2r` window, kept as a running
/// 8-bit histogram that slides along each row.
fn local_otsu(pixels: &Gray16Image, radius: u32) -> Vec<bool> {
    let (w, h) = (pixels.width() as usize, pixels.height() as usize);
    let r = radius as usize;
    let bin = |x: usize, y: usize| usize::from(pixels.as_raw()[y * w + x] / 257);
    let mut out = vec![false; w * h];
    let mut hist = vec![0u64; BINS];
    for y in 0..h {
        let (y0, y1) = (y.saturating_sub(r), (y + r).min(h));
        hist.iter_mut().for_each(|c| *c = 0);
        let mut lo = 0;
        let mut hi = 0;
        for x in 0..w {
            let (x0, x1) = (x.saturating_sub(r), (x + r).min(w));
            while hi < x1 {
                for yy in y0..y1 {
                    hist[bin(hi, yy)] += 1;
                }
                hi += 1;
            }
            while lo < x0 {
                for yy in y0..y1 {
                    hist[bin(lo, yy)] -= 1;
                }
                lo += 1;
            }
            let level = AutoMethod::Otsu.level(&hist);
            let v = pixels.as_raw()[y * w + x];
            out[y * w + x] = bin(x, y) > level || v == u16::MAX;
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{gray, run};

    fn uneven_spots() -> ImagePlane {
        // Background ramps from dark to bright; spots sit 8000 above it.
        gray(60, 20, |x, y| {
            let base = 2000 + u16::try_from(x).unwrap() * 500;
            let spot = (x % 20 == 10) && (8..12).contains(&y);
            if spot { base + 8000 } else { base }
        })
    }

    fn threshold(method: AdaptiveMethod) -> ImagePlane {
        let mut image = uneven_spots();
        let step = AdaptiveThreshold(AdaptiveThresholdSettings {
            method,
            radius: 4,
            c_value: -2000,
            ..AdaptiveThresholdSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        image
    }

    #[test]
    fn mean_finds_spots_on_a_ramp() {
        let image = threshold(AdaptiveMethod::Mean);
        assert!(image.is_binary());
        assert_eq!(image.value_u16(10, 9), 1);
        assert_eq!(image.value_u16(50, 9), 1);
        assert_eq!(image.value_u16(5, 2), 0);
    }

    #[test]
    fn median_finds_spots_on_a_ramp() {
        let image = threshold(AdaptiveMethod::Median);
        assert_eq!(image.value_u16(30, 10), 1);
        assert_eq!(image.value_u16(45, 2), 0);
    }

    #[test]
    fn bernsen_low_contrast_follows_mid_grey() {
        let mut image = gray(10, 10, |_, _| 60000);
        run(
            &AdaptiveThreshold(AdaptiveThresholdSettings::default()),
            &mut image,
            &mut ObjectList::new(),
        )
        .unwrap();
        assert_eq!(image.value_u16(5, 5), 1);

        let mut dark = gray(10, 10, |_, _| 100);
        run(
            &AdaptiveThreshold(AdaptiveThresholdSettings::default()),
            &mut dark,
            &mut ObjectList::new(),
        )
        .unwrap();
        assert_eq!(dark.value_u16(5, 5), 0);
    }

    #[test]
    fn local_otsu_splits_halves() {
        let mut image = gray(20, 10, |x, _| if x < 10 { 1000 } else { 50000 });
        let step = AdaptiveThreshold(AdaptiveThresholdSettings {
            method: AdaptiveMethod::Otsu,
            radius: 3,
            ..AdaptiveThresholdSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(9, 5), 0);
        assert_eq!(image.value_u16(10, 5), 1);
    }
}
