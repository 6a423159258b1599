//! Rasterize object classes into a label mask.
//!
//! The pixels of the first class set are combined with those of the
//! second set by a boolean function; every set pixel of the result gets
//! the output label.

use image::Luma;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::{Dimensions, PipelineError};

/// Boolean combination of the two class sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaskFunction {
    /// First set only.
    #[default]
    None,
    /// Complement of the first set.
    Not,
    And,
    AndNot,
    Or,
    Xor,
}

impl MaskFunction {
    const fn uses_second(self) -> bool {
        !matches!(self, Self::None | Self::Not)
    }

    const fn apply(self, a: bool, b: bool) -> bool {
        match self {
            Self::None => a,
            Self::Not => !a,
            Self::And => a && b,
            Self::AndNot => a && !b,
            Self::Or => a || b,
            Self::Xor => a ^ b,
        }
    }
}

/// Image-from-class options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageFromClassSettings {
    /// First class set.
    pub classes_in: Vec<ClassIdIn>,
    /// How the two sets combine.
    pub function: MaskFunction,
    /// Second class set (binary functions only).
    pub classes_second: Vec<ClassIdIn>,
    /// Label written into the mask.
    pub class_out: ClassIdIn,
}

impl Default for ImageFromClassSettings {
    fn default() -> Self {
        Self {
            classes_in: vec![ClassIdIn::Default],
            function: MaskFunction::None,
            classes_second: Vec::new(),
            class_out: ClassIdIn::Default,
        }
    }
}

impl StepSettings for ImageFromClassSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::OBJECT, OutputKind::Binary)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.classes_in.is_empty(), "at least one input class is required");
        if self.function.uses_second() {
            log.require(
                !self.classes_second.is_empty(),
                "the selected function needs a second class set",
            );
        } else if !self.classes_second.is_empty() {
            log.warning("the second class set is ignored by this function");
        }
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output label must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ImageFromClass(self.clone())))
    }
}

settings_command!(ImageFromClass, ImageFromClassSettings, "imageFromClass");

impl ImageFromClass {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let dims = image.dimensions();
        let first = coverage(ctx, objects, &self.0.classes_in, dims);
        let second = if self.0.function.uses_second() {
            coverage(ctx, objects, &self.0.classes_second, dims)
        } else {
            vec![false; first.len()]
        };
        let label = ctx.resolve(self.0.class_out).get();
        let width = dims.width as usize;
        let labels = Gray16Image::from_fn(dims.width, dims.height, |x, y| {
            let i = y as usize * width + x as usize;
            Luma([if self.0.function.apply(first[i], second[i]) { label } else { 0 }])
        });
        *image = ImagePlane::binary(labels, image.id(), None)?;
        Ok(())
    }
}

/// Row-major flags of the pixels covered by any object of `classes`.
fn coverage(
    ctx: &ProcessContext<'_>,
    objects: &ObjectList,
    classes: &[ClassIdIn],
    dims: Dimensions,
) -> Vec<bool> {
    let mut covered = vec![false; dims.width as usize * dims.height as usize];
    for class in classes {
        for object in objects.class(ctx.resolve(*class)) {
            for (x, y) in object.pixels() {
                if x < dims.width && y < dims.height {
                    covered[y as usize * dims.width as usize + x as usize] = true;
                }
            }
        }
    }
    covered
}
