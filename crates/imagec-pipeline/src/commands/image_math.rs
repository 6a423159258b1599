//! Pixel-wise arithmetic between the active plane and a second plane.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::measure_intensity::ImageRef;
use crate::context::ProcessContext;
use crate::image_plane::{Gray16Image, ImagePlane, saturate_u16};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// The per-pixel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MathFunction {
    /// `65535 - a`; the operand is not read.
    Invert,
    #[default]
    Add,
    Subtract,
    Multiply,
    /// `a / b`, 0 where `b` is 0.
    Divide,
    And,
    Or,
    Xor,
    Min,
    Max,
    Average,
    /// `|a - b|`.
    Difference,
}

impl MathFunction {
    const fn needs_operand(self) -> bool {
        !matches!(self, Self::Invert)
    }

    fn apply(self, a: u16, b: u16) -> u16 {
        let (fa, fb) = (f64::from(a), f64::from(b));
        match self {
            Self::Invert => u16::MAX - a,
            Self::Add => a.saturating_add(b),
            Self::Subtract => a.saturating_sub(b),
            Self::Multiply => saturate_u16(fa * fb),
            Self::Divide => {
                if b == 0 {
                    0
                } else {
                    saturate_u16(fa / fb)
                }
            }
            Self::And => a & b,
            Self::Or => a | b,
            Self::Xor => a ^ b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            Self::Average => saturate_u16(f64::midpoint(fa, fb)),
            Self::Difference => a.abs_diff(b),
        }
    }
}

/// Image-math options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageMathSettings {
    /// Operation to apply.
    pub function: MathFunction,
    /// The second plane.
    pub operand: ImageRef,
    /// Compute `operand ∘ active` instead of `active ∘ operand`.
    pub swap_operands: bool,
}

impl StepSettings for ImageMathSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::IMAGE)
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ImageMath(self.clone())))
    }
}

settings_command!(ImageMath, ImageMathSettings, "imageMath");

impl ImageMath {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let function = self.0.function;
        let active = image.to_gray16();
        let operand = if function.needs_operand() {
            let (key, plane) = self.0.operand.load(ctx)?;
            if plane.dimensions() != image.dimensions() {
                return Err(PipelineError::InvalidConfig(format!(
                    "image math operand {key} is {}x{}, active plane is {}x{}",
                    plane.width(),
                    plane.height(),
                    image.width(),
                    image.height()
                )));
            }
            Some(plane.to_gray16())
        } else {
            None
        };

        let out = Gray16Image::from_fn(active.width(), active.height(), |x, y| {
            let a = active.get_pixel(x, y).0[0];
            let b = operand.as_ref().map_or(0, |o| o.get_pixel(x, y).0[0]);
            let v = if self.0.swap_operands {
                function.apply(b, a)
            } else {
                function.apply(a, b)
            };
            image::Luma([v])
        });
        tracing::debug!(%function, "image math");
        *image = image.derive_gray16(out)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::{CacheScope, MemoryIdx, MemoryKey};
    use crate::commands::tests::gray;
    use crate::context::tests::Harness;

    fn math(settings: ImageMathSettings, image: &mut ImagePlane) -> Result<(), PipelineError> {
        let mut h = Harness::new(image.dimensions());
        let dims = image.dimensions();
        h.with_ctx(1, |ctx| {
            ctx.store_image(
                MemoryKey::Slot(MemoryIdx::M01),
                Arc::new(gray(dims.width, dims.height, |_, _| 300)),
                CacheScope::Iteration,
            );
            ImageMath(settings).execute(ctx, image, &mut ObjectList::new())
        })
    }

    fn with_slot(function: MathFunction) -> ImageMathSettings {
        ImageMathSettings {
            function,
            operand: ImageRef::Memory(MemoryIdx::M01),
            swap_operands: false,
        }
    }

    // --- function tests ---

    #[test]
    fn function_table() {
        assert_eq!(MathFunction::Add.apply(65000, 1000), u16::MAX);
        assert_eq!(MathFunction::Subtract.apply(10, 20), 0);
        assert_eq!(MathFunction::Divide.apply(10, 0), 0);
        assert_eq!(MathFunction::Divide.apply(10, 4), 3);
        assert_eq!(MathFunction::Average.apply(10, 21), 16);
        assert_eq!(MathFunction::Difference.apply(10, 21), 11);
        assert_eq!(MathFunction::Xor.apply(0b1100, 0b1010), 0b0110);
        assert_eq!(MathFunction::Invert.apply(1, 99), 65534);
    }

    // --- command tests ---

    #[test]
    fn subtracts_cached_plane() {
        let mut image = gray(4, 4, |x, _| 100 * u16::try_from(x).unwrap() + 200);
        math(with_slot(MathFunction::Subtract), &mut image).unwrap();
        assert_eq!(image.value_u16(0, 0), 0);
        assert_eq!(image.value_u16(3, 0), 200);
    }

    #[test]
    fn swapped_operands() {
        let mut image = gray(2, 2, |_, _| 100);
        let settings = ImageMathSettings {
            swap_operands: true,
            ..with_slot(MathFunction::Subtract)
        };
        math(settings, &mut image).unwrap();
        assert_eq!(image.value_u16(0, 0), 200);
    }

    #[test]
    fn invert_skips_the_operand() {
        let mut image = gray(2, 2, |_, _| 5);
        let settings = ImageMathSettings {
            operand: ImageRef::Memory(MemoryIdx::M07),
            ..with_slot(MathFunction::Invert)
        };
        math(settings, &mut image).unwrap();
        assert_eq!(image.value_u16(1, 1), 65530);
    }

    #[test]
    fn missing_operand_leaves_image_untouched() {
        let mut image = gray(2, 2, |_, _| 5);
        let settings = ImageMathSettings {
            operand: ImageRef::Memory(MemoryIdx::M07),
            ..with_slot(MathFunction::Add)
        };
        let err = math(settings, &mut image).unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
        assert_eq!(image.value_u16(0, 0), 5);
    }

    #[test]
    fn settings_from_json() {
        let s: ImageMathSettings =
            serde_json::from_str(r#"{"function": "DIFFERENCE", "operand": {"channel": 2}}"#).unwrap();
        assert_eq!(s.function, MathFunction::Difference);
        assert_eq!(s.operand, ImageRef::Channel(2));
    }
}
