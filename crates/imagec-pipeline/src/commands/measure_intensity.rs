//! Per-object intensity aggregates on source or cached planes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::cache::{MemoryIdx, MemoryKey};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::IntensityAggregates;
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// A plane referred to by a measuring or combining step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageRef {
    /// The pipeline's own source plane.
    #[default]
    Source,
    /// Another channel of the current tile.
    Channel(u32),
    /// A plane parked by an image-cache step.
    Memory(MemoryIdx),
}

impl ImageRef {
    /// The cache key the plane is recorded under, and the plane itself.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingArtifact`] for an unset memory
    /// slot, or [`PipelineError::External`] if a channel cannot be read.
    pub fn load(
        self,
        ctx: &mut ProcessContext<'_>,
    ) -> Result<(MemoryKey, Arc<ImagePlane>), PipelineError> {
        match self {
            Self::Source => Ok((ctx.source_key(), ctx.load_source(None)?)),
            Self::Channel(c) => Ok((
                MemoryKey::Source(ctx.plane().with_channel(c)),
                ctx.load_source(Some(c))?,
            )),
            Self::Memory(idx) => {
                let key = MemoryKey::Slot(idx);
                let plane = ctx.load_image(&key)?;
                Ok((key, plane))
            }
        }
    }
}

/// Measure-intensity options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasureIntensitySettings {
    /// Classes whose objects are measured.
    pub input_classes: Vec<ClassIdIn>,
    /// Planes to measure on.
    pub planes_in: Vec<ImageRef>,
}

impl Default for MeasureIntensitySettings {
    fn default() -> Self {
        Self {
            input_classes: vec![ClassIdIn::Default],
            planes_in: vec![ImageRef::Source],
        }
    }
}

impl StepSettings for MeasureIntensitySettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::OBJECT)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.input_classes.is_empty(), "at least one input class is required");
        log.require(!self.planes_in.is_empty(), "at least one plane is required");
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(MeasureIntensity(self.clone())))
    }
}

settings_command!(MeasureIntensity, MeasureIntensitySettings, "measureIntensity");

impl MeasureIntensity {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let planes = self
            .0
            .planes_in
            .iter()
            .map(|r| r.load(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let classes: Vec<_> = self.0.input_classes.iter().map(|c| ctx.resolve(*c)).collect();

        for (key, plane) in &planes {
            for class_id in &classes {
                for object in objects.class_mut(*class_id) {
                    let mut aggregates = object.measure_intensity(plane);
                    if aggregates.has_fault() {
                        ctx.warn(
                            PipelineError::ArithmeticFault(format!(
                                "intensity of object {} on {key}",
                                object.id()
                            ))
                            .to_string(),
                        );
                        aggregates = IntensityAggregates::NAN;
                    }
                    if !object.record_intensity(*key, aggregates) {
                        ctx.warn(format!(
                            "object {} already measured on {key}, keeping the first value",
                            object.id()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
