//! Pairwise distances from one set of classes to another.

use geo::line_measures::Distance as _;
use geo::Euclidean;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::class_id::{ClassId, ClassIdIn};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::{Distance, Object, ObjectId};
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Measure-distance options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeasureDistanceSettings {
    /// Classes whose objects receive the distance records.
    pub input_classes: Vec<ClassIdIn>,
    /// Classes measured against.
    pub reference_classes: Vec<ClassIdIn>,
    /// Skip pairs whose centres are farther apart than this.
    pub max_distance: Option<f64>,
}

impl Default for MeasureDistanceSettings {
    fn default() -> Self {
        Self {
            input_classes: vec![ClassIdIn::Default],
            reference_classes: Vec::new(),
            max_distance: None,
        }
    }
}

impl StepSettings for MeasureDistanceSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::OBJECT)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.input_classes.is_empty(), "at least one input class is required");
        log.require(
            !self.reference_classes.is_empty(),
            "at least one reference class is required",
        );
        if let Some(max) = self.max_distance {
            log.require(max >= 0.0, "maxDistance must not be negative");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(MeasureDistance(self.clone())))
    }
}

settings_command!(MeasureDistance, MeasureDistanceSettings, "measureDistance");

impl MeasureDistance {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let inputs: Vec<ClassId> = self.0.input_classes.iter().map(|c| ctx.resolve(*c)).collect();
        let references: Vec<ClassId> =
            self.0.reference_classes.iter().map(|c| ctx.resolve(*c)).collect();

        let mut records: Vec<(ObjectId, ObjectId, Distance)> = Vec::new();
        for class_id in &inputs {
            for object in objects.class(*class_id) {
                for reference in references.iter().flat_map(|c| objects.class(*c)) {
                    if reference.id() == object.id() {
                        continue;
                    }
                    let distance = distance_between(object, reference);
                    if self.0.max_distance.is_none_or(|max| distance.centre <= max) {
                        records.push((object.id(), reference.id(), distance));
                    }
                }
            }
        }
        let count = records.len();
        for (id, peer, distance) in records {
            if let Some(object) = objects.find_mut(id) {
                object.record_distance(peer, distance);
            }
        }
        tracing::debug!(count, "distances recorded");
        Ok(())
    }
}

/// Centre and surface distance; the surface distance is 0 when the masks
/// overlap.
#[must_use]
pub fn distance_between(a: &Object, b: &Object) -> Distance {
    let centre = a.centre_of_mass().distance(b.centre_of_mass());
    let surface = if a.overlap_with(b).is_some() {
        0.0
    } else {
        Euclidean.distance(&a.polygon(), &b.polygon())
    };
    Distance { centre, surface }
}
