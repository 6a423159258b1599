//! Connected components of a label mask become objects.
//!
//! Each entry picks one label of the binary plane, extracts its outer
//! contours and keeps the components that pass the entry's filter.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::object_transform::snap_area;
use crate::commands::{ObjectFilter, binary_labels, objects_from_components};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::Object;
use crate::object_list::ObjectList;
use crate::raster::{components, label_mask};
use crate::types::PipelineError;

/// Above this many components a label is skipped as noise.
pub const MAX_COMPONENTS: usize = 50_000;

/// One label-to-class rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierEntry {
    /// Mask label to pick up.
    pub label: ClassIdIn,
    /// Class of the produced objects.
    pub class_out: ClassIdIn,
    /// Size and shape gate.
    #[serde(flatten)]
    pub filter: ObjectFilter,
    /// Replace each object by a circle of this diameter (0 keeps the shape).
    pub snap_area_size: u32,
}

impl Default for ClassifierEntry {
    fn default() -> Self {
        Self {
            label: ClassIdIn::Default,
            class_out: ClassIdIn::Default,
            filter: ObjectFilter::default(),
            snap_area_size: 0,
        }
    }
}

/// Classifier options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierSettings {
    /// Rules, applied in order.
    pub classes: Vec<ClassifierEntry>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            classes: vec![ClassifierEntry::default()],
        }
    }
}

impl StepSettings for ClassifierSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::BINARY, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.classes.is_empty(), "at least one class is required");
        for entry in &self.classes {
            entry.filter.check(log);
            if matches!(entry.class_out, ClassIdIn::None) || matches!(entry.label, ClassIdIn::None) {
                log.error("label and output class must not be NONE");
            }
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Classifier(self.clone())))
    }
}

settings_command!(Classifier, ClassifierSettings, "classifier");

impl Classifier {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let labels = binary_labels(image, "classifier")?;
        let dims = image.dimensions();
        let mut found = Vec::new();
        for entry in &self.0.classes {
            let label = ctx.resolve(entry.label);
            let class_out = ctx.resolve(entry.class_out);
            let parts = components(&label_mask(&labels, label.get()));
            if parts.len() > MAX_COMPONENTS {
                ctx.warn(format!(
                    "label {label}: {} components exceed the limit of {MAX_COMPONENTS}, skipped",
                    parts.len()
                ));
                continue;
            }
            let mut entry_objects =
                objects_from_components(ctx, parts, class_out, image.id(), &entry.filter, 1.0);
            if entry.snap_area_size > 0 {
                entry_objects = entry_objects
                    .into_iter()
                    .filter_map(|object| {
                        let mask = snap_area(object.centre_of_mass(), entry.snap_area_size, dims);
                        object.with_tile_mask(&mask)
                    })
                    .collect::<Vec<Object>>();
            }
            tracing::debug!(%label, %class_out, count = entry_objects.len(), "classified");
            found.extend(entry_objects);
        }
        objects.extend(found);
        Ok(())
    }
}
