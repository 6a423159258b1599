//! Zero everything outside a rectangle.
//!
//! The plane keeps its dimensions so tile coordinates of later objects
//! stay valid.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{Gray16Image, ImagePlane};
use crate::object_list::ObjectList;
use crate::types::{BoundingBox, PipelineError};

/// Crop rectangle in tile coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CropSettings {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl StepSettings for CropSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::PIXELS)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.width > 0 && self.height > 0,
            format!("crop rectangle {}x{} is empty", self.width, self.height),
        );
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Crop(self.clone())))
    }
}

settings_command!(Crop, CropSettings, "crop");

impl Crop {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let keep = BoundingBox::new(self.0.x, self.0.y, self.0.width, self.0.height);
        let pixels = image.to_gray16();
        let out = Gray16Image::from_fn(pixels.width(), pixels.height(), |x, y| {
            if keep.contains(x, y) {
                *pixels.get_pixel(x, y)
            } else {
                image::Luma([0])
            }
        });
        *image = image.derive_gray16(out)?;
        Ok(())
    }
}
