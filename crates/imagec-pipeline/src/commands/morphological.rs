//! Grayscale morphology with flat structuring elements.
//!
//! On binary planes erosion and dilation act on the label values, so a
//! dilated label grows into background and the larger label wins where
//! two labels meet.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::check_odd_kernel;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::filters::{KernelShape, Rank, kernel_offsets, rank_filter, subtract};
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Morphological operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MorphOperation {
    /// Minimum filter.
    #[default]
    Erode,
    /// Maximum filter.
    Dilate,
    /// Erode then dilate.
    Open,
    /// Dilate then erode.
    Close,
    /// Dilation minus erosion.
    Gradient,
}

/// Morphological step options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MorphologicalSettings {
    /// Operation.
    pub operation: MorphOperation,
    /// Structuring element shape.
    pub shape: KernelShape,
    /// Odd edge length of the element.
    pub kernel_size: u32,
    /// How often the operation is applied.
    pub iterations: u32,
}

impl Default for MorphologicalSettings {
    fn default() -> Self {
        Self {
            operation: MorphOperation::Erode,
            shape: KernelShape::Rectangle,
            kernel_size: 3,
            iterations: 1,
        }
    }
}

impl StepSettings for MorphologicalSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::PIXELS)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        check_odd_kernel(log, "kernelSize", self.kernel_size);
        log.require(self.iterations >= 1, "iterations must be at least 1");
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Morphological(self.clone())))
    }
}

settings_command!(Morphological, MorphologicalSettings, "morphological");

impl Morphological {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let offsets = kernel_offsets(self.0.shape, self.0.kernel_size);
        let mut pixels = image.to_gray16();
        for _ in 0..self.0.iterations {
            pixels = apply(self.0.operation, &pixels, &offsets);
        }
        *image = image.derive_gray16(pixels)?;
        Ok(())
    }
}

fn apply(operation: MorphOperation, pixels: &Gray16Image, offsets: &[(i32, i32)]) -> Gray16Image {
    let erode = |img: &Gray16Image| rank_filter(img, offsets, Rank::Min);
    let dilate = |img: &Gray16Image| rank_filter(img, offsets, Rank::Max);
    match operation {
        MorphOperation::Erode => erode(pixels),
        MorphOperation::Dilate => dilate(pixels),
        MorphOperation::Open => dilate(&erode(pixels)),
        MorphOperation::Close => erode(&dilate(pixels)),
        MorphOperation::Gradient => subtract(&dilate(pixels), &erode(pixels)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{labels, run};

    fn count(image: &ImagePlane, label: u16) -> usize {
        image.to_gray16().pixels().filter(|p| p.0[0] == label).count()
    }

    #[test]
    fn open_removes_specks_and_keeps_blocks() {
        let mut image = labels(20, 20, |x, y| {
            if (5..12).contains(&x) && (5..12).contains(&y) || (x, y) == (16, 16) {
                1
            } else {
                0
            }
        });
        let step = Morphological(MorphologicalSettings {
            operation: MorphOperation::Open,
            ..MorphologicalSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert!(image.is_binary());
        assert_eq!(image.value_u16(16, 16), 0);
        assert_eq!(count(&image, 1), 49);
    }

    #[test]
    fn gradient_marks_the_boundary() {
        let mut image = labels(10, 10, |x, _| if x >= 5 { 3 } else { 0 });
        let step = Morphological(MorphologicalSettings {
            operation: MorphOperation::Gradient,
            shape: KernelShape::Cross,
            ..MorphologicalSettings::default()
        });
        run(&step, &mut image, &mut ObjectList::new()).unwrap();
        assert_eq!(image.value_u16(4, 3), 3);
        assert_eq!(image.value_u16(5, 3), 3);
        assert_eq!(image.value_u16(0, 3), 0);
        assert_eq!(image.value_u16(9, 3), 0);
    }
}
