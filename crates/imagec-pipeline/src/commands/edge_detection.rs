//! Sobel, Laplacian, and Canny edge detection.
//!
//! Sobel and Laplacian produce gradient magnitude images on the 16-bit
//! scale. Canny wraps [`imageproc::edges::canny`] on the 8-bit view of
//! the plane and labels edge pixels with the output class.

use image::{GrayImage, Luma};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::filters::sample;
use crate::image_plane::{Gray16Image, ImagePlane, saturate_u16};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Minimum allowed Canny threshold.
///
/// A zero low threshold marks every pixel with any gradient as a
/// candidate edge.
pub const MIN_THRESHOLD: f32 = 1.0;
const _: () = assert!(MIN_THRESHOLD > 0.0);

/// Edge operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeMode {
    /// 3x3 Sobel gradient magnitude.
    #[default]
    Sobel,
    /// Absolute 4-neighbour Laplacian.
    Laplacian,
    /// Canny with hysteresis; produces a binary mask.
    Canny,
}

/// Edge detection options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeDetectionSettings {
    /// Operator.
    pub mode: EdgeMode,
    /// Canny low threshold on the 8-bit gradient scale.
    pub threshold_low: f32,
    /// Canny high threshold on the 8-bit gradient scale.
    pub threshold_high: f32,
    /// Label of Canny edge pixels.
    pub class_out: ClassIdIn,
}

impl Default for EdgeDetectionSettings {
    fn default() -> Self {
        Self {
            mode: EdgeMode::Sobel,
            threshold_low: 50.0,
            threshold_high: 150.0,
            class_out: ClassIdIn::Default,
        }
    }
}

impl StepSettings for EdgeDetectionSettings {
    fn in_out(&self) -> InOut {
        match self.mode {
            EdgeMode::Sobel | EdgeMode::Laplacian => {
                InOut::new(ArtifactSet::IMAGE, OutputKind::Image)
            }
            EdgeMode::Canny => InOut::new(ArtifactSet::IMAGE, OutputKind::Binary),
        }
    }

    fn check(&self, log: &mut StepLog<'_>) {
        if self.mode == EdgeMode::Canny {
            log.require(
                self.threshold_high >= self.threshold_low,
                format!(
                    "thresholdHigh ({}) is below thresholdLow ({})",
                    self.threshold_high, self.threshold_low
                ),
            );
            if matches!(self.class_out, ClassIdIn::None) {
                log.error("Canny edges need an output class");
            }
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(EdgeDetection(self.clone())))
    }
}

settings_command!(EdgeDetection, EdgeDetectionSettings, "edgeDetection");

impl EdgeDetection {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let pixels = image.to_gray16();
        *image = match self.0.mode {
            EdgeMode::Sobel => ImagePlane::gray16(sobel(&pixels), image.id())?,
            EdgeMode::Laplacian => ImagePlane::gray16(laplacian(&pixels), image.id())?,
            EdgeMode::Canny => {
                let label = ctx.resolve(self.0.class_out).get();
                let edges = canny(&to_gray8(&pixels), self.0.threshold_low, self.0.threshold_high);
                let labels = Gray16Image::from_fn(edges.width(), edges.height(), |x, y| {
                    Luma([if edges.get_pixel(x, y).0[0] > 0 { label } else { 0 }])
                });
                ImagePlane::binary(labels, image.id(), None)?
            }
        };
        Ok(())
    }
}

/// 8-bit view keeping the high byte.
fn to_gray8(pixels: &Gray16Image) -> GrayImage {
    GrayImage::from_fn(pixels.width(), pixels.height(), |x, y| {
        Luma([pixels.get_pixel(x, y).0[0].to_be_bytes()[0]])
    })
}

/// Canny with both thresholds clamped to [`MIN_THRESHOLD`] and
/// `low <= high`.
#[must_use = "returns the binary edge map"]
pub fn canny(image: &GrayImage, low_threshold: f32, high_threshold: f32) -> GrayImage {
    let high = high_threshold.max(MIN_THRESHOLD);
    let low = low_threshold.max(MIN_THRESHOLD).min(high);
    imageproc::edges::canny(image, low, high)
}

/// Sobel gradient magnitude, edge-replicated.
#[must_use]
pub fn sobel(pixels: &Gray16Image) -> Gray16Image {
    Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
        let (x, y) = (i64::from(x), i64::from(y));
        let p = |dx: i64, dy: i64| f64::from(sample(pixels, x + dx, y + dy));
        let gx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
        let gy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
        Luma([saturate_u16(gx.hypot(gy))])
    })
}

/// Absolute response of the `[0 1 0; 1 -4 1; 0 1 0]` kernel.
#[must_use]
pub fn laplacian(pixels: &Gray16Image) -> Gray16Image {
    Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
        let (x, y) = (i64::from(x), i64::from(y));
        let p = |dx: i64, dy: i64| f64::from(sample(pixels, x + dx, y + dy));
        let response = p(0, -1) + p(-1, 0) + p(1, 0) + p(0, 1) - 4.0 * p(0, 0);
        Luma([saturate_u16(response.abs())])
    })
}
