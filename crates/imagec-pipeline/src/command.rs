//! The command contract.
//!
//! A command is built once per run from its settings and then executed
//! on every tile. It declares which artifact kinds it accepts and what it
//! produces; the executor and the validator rely on that declaration.
//!
//! Commands compute into locals and write their active artifacts only
//! once everything that can fail has succeeded, so a failed step leaves
//! the image and the object list as they were.

use crate::artifact::InOut;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::io::ModelLoader;
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// A configured, runnable operation.
pub trait Command: Send + Sync + std::fmt::Debug {
    /// Stable command name, as used in settings.
    fn name(&self) -> &'static str;

    /// Accepted input kinds and produced output kind.
    fn in_out(&self) -> InOut;

    /// Run the command on the active artifacts of one tile.
    ///
    /// May replace or modify `image` in place, and may add, move, or
    /// modify objects in `objects`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on failure; `image` and `objects` are
    /// then unchanged.
    fn execute(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError>;
}

/// What building a command may need from outside the core.
#[derive(Clone, Copy, Default)]
pub struct BuildEnv<'a> {
    /// Model loader for AI classifier steps.
    pub models: Option<&'a dyn ModelLoader>,
}

impl std::fmt::Debug for BuildEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildEnv")
            .field("models", &self.models.is_some())
            .finish()
    }
}

/// Behaviour shared by every command's settings.
pub trait StepSettings {
    /// Accepted input kinds and produced output kind.
    fn in_out(&self) -> InOut;

    /// Record range and consistency problems. An empty check means the
    /// settings carry no runtime constraint.
    fn check(&self, _log: &mut StepLog<'_>) {}

    /// Build the runnable command.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a collaborator the command needs is
    /// missing or fails.
    fn build(&self, env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError>;
}

/// Implement [`Command`] for a runtime struct that wraps its settings
/// as `.0` and provides `fn run(&self, ctx, image, objects)`.
macro_rules! settings_command {
    ($command:ident, $settings:ty, $name:literal) => {
        #[doc = concat!("Runtime form of [`", stringify!($settings), "`].")]
        #[derive(Debug, Clone)]
        pub struct $command(pub(crate) $settings);

        impl $crate::command::Command for $command {
            fn name(&self) -> &'static str {
                $name
            }

            fn in_out(&self) -> $crate::artifact::InOut {
                $crate::command::StepSettings::in_out(&self.0)
            }

            fn execute(
                &self,
                ctx: &mut $crate::context::ProcessContext<'_>,
                image: &mut $crate::image_plane::ImagePlane,
                objects: &mut $crate::object_list::ObjectList,
            ) -> Result<(), $crate::types::PipelineError> {
                self.run(ctx, image, objects)
            }
        }
    };
}

pub(crate) use settings_command;
