//! Snapshots of object classes in the memory cache.
//!
//! [`ObjectsToCache`] parks a copy of each listed class under its class
//! id. [`ObjectsFromCache`] brings a parked snapshot back as copies with
//! fresh identifiers, each parented to the cached object it came from.

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::cache::CacheScope;
use crate::class_id::ClassIdIn;
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Objects-to-cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectsToCacheSettings {
    /// Classes to snapshot.
    pub classes_in: Vec<ClassIdIn>,
    /// How long the snapshots live.
    pub scope: CacheScope,
}

impl Default for ObjectsToCacheSettings {
    fn default() -> Self {
        Self {
            classes_in: vec![ClassIdIn::Default],
            scope: CacheScope::Iteration,
        }
    }
}

impl StepSettings for ObjectsToCacheSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::OBJECT)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.classes_in.is_empty(), "at least one class is required");
        if self.scope == CacheScope::Persistent
            && self.classes_in.iter().any(|c| matches!(c, ClassIdIn::Temp(_)))
        {
            log.error("TEMP classes are cleared after each pipeline and cannot be PERSISTENT");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ObjectsToCache(self.clone())))
    }
}

settings_command!(ObjectsToCache, ObjectsToCacheSettings, "objectsToCache");

impl ObjectsToCache {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        for class in &self.0.classes_in {
            let class_id = ctx.resolve(*class);
            let snapshot = objects.class(class_id).to_vec();
            tracing::debug!(%class_id, count = snapshot.len(), "objects cached");
            ctx.store_objects(class_id, snapshot, self.0.scope);
        }
        Ok(())
    }
}

/// Objects-from-cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectsFromCacheSettings {
    /// The class the snapshot was parked under.
    pub class_in: ClassIdIn,
    /// Class of the restored copies.
    pub class_out: ClassIdIn,
}

impl Default for ObjectsFromCacheSettings {
    fn default() -> Self {
        Self {
            class_in: ClassIdIn::Default,
            class_out: ClassIdIn::Default,
        }
    }
}

impl StepSettings for ObjectsFromCacheSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::ANY, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ObjectsFromCache(self.clone())))
    }
}

settings_command!(ObjectsFromCache, ObjectsFromCacheSettings, "objectsFromCache");

impl ObjectsFromCache {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let snapshot = ctx.load_objects(ctx.resolve(self.0.class_in))?;
        let class_out = ctx.resolve(self.0.class_out);
        let copies: Vec<_> = snapshot
            .iter()
            .map(|o| o.copy_as(ctx.next_id(), class_out))
            .collect();
        objects.extend(copies);
        Ok(())
    }
}
