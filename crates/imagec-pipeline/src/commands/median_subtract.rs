//! Subtract a median-filtered copy of the plane from itself.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::check_odd_kernel;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::filters;
use crate::image_plane::ImagePlane;
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Median-subtraction options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MedianSubtractSettings {
    /// Odd edge length of the median window.
    pub kernel_size: u32,
}

impl Default for MedianSubtractSettings {
    fn default() -> Self {
        Self { kernel_size: 5 }
    }
}

impl StepSettings for MedianSubtractSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::IMAGE)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        check_odd_kernel(log, "kernelSize", self.kernel_size);
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(MedianSubtract(self.clone())))
    }
}

settings_command!(MedianSubtract, MedianSubtractSettings, "medianSubtract");

impl MedianSubtract {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let pixels = image.to_gray16();
        let background = filters::median(&pixels, self.0.kernel_size);
        *image = image.derive_gray16(filters::subtract(&pixels, &background))?;
        Ok(())
    }
}
