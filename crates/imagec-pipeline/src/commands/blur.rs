//! Gaussian and median smoothing.

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

/// Smoothing kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlurMode {
    /// Gaussian kernel with sigma derived from the kernel size.
    #[default]
    Gaussian,
    /// Square median filter.
    Median,
}

/// Blur step options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlurSettings {
    /// Kernel type.
    pub mode: BlurMode,
    /// Odd kernel edge length.
    pub kernel_size: u32,
    /// How many times the kernel is applied.
    pub repeat: u32,
}

impl Default for BlurSettings {
    fn default() -> Self {
        Self {
            mode: BlurMode::Gaussian,
            kernel_size: 3,
            repeat: 1,
        }
    }
}

impl StepSettings for BlurSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::PIXELS)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        check_odd_kernel(log, "kernelSize", self.kernel_size);
        log.require(self.repeat >= 1, "repeat must be at least 1");
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Blur(self.clone())))
    }
}

settings_command!(Blur, BlurSettings, "blur");

impl Blur {
    fn run(
        &self,
        _ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let settings = &self.0;
        let mut pixels = image.to_gray16();
        for _ in 0..settings.repeat {
            pixels = match settings.mode {
                BlurMode::Gaussian => {
                    filters::gaussian(&pixels, filters::sigma_for_kernel(settings.kernel_size))
                }
                BlurMode::Median => filters::median(&pixels, settings.kernel_size),
            };
        }
        *image = image.derive_gray16(pixels)?;
        Ok(())
    }
}
