//! Park the active plane in a memory slot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::cache::{CacheScope, MemoryIdx, MemoryKey};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object_list::ObjectList;
use crate::types::PipelineError;

/// Image-cache options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageCacheSettings {
    /// Target slot.
    pub memory_id: MemoryIdx,
    /// How long the entry lives.
    pub scope: CacheScope,
}

impl Default for ImageCacheSettings {
    fn default() -> Self {
        Self {
            memory_id: MemoryIdx::M01,
            scope: CacheScope::Iteration,
        }
    }
}

impl StepSettings for ImageCacheSettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::PIXELS)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        if self.memory_id.is_temp() && self.scope == CacheScope::Persistent {
            log.error(format!(
                "{} is cleared after each pipeline and cannot be PERSISTENT",
                self.memory_id
            ));
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(ImageCache(self.clone())))
    }
}

settings_command!(ImageCache, ImageCacheSettings, "imageCache");

impl ImageCache {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        _objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        ctx.store_image(
            MemoryKey::Slot(self.0.memory_id),
            Arc::new(image.clone()),
            self.0.scope,
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::gray;
    use crate::context::tests::Harness;
    use crate::diagnostics::CompileLog;

    #[test]
    fn stored_plane_is_readable_in_the_same_tile() {
        let mut h = Harness::new(crate::types::Dimensions::new(4, 4));
        let mut image = gray(4, 4, |x, y| u16::try_from(x * y).unwrap());
        let expected = image.clone();
        let loaded = h.with_ctx(1, |ctx| {
            ImageCache(ImageCacheSettings {
                memory_id: MemoryIdx::M04,
                scope: CacheScope::Iteration,
            })
            .execute(ctx, &mut image, &mut ObjectList::new())
            .unwrap();
            ctx.load_image(&MemoryKey::Slot(MemoryIdx::M04)).unwrap()
        });
        assert_eq!(*loaded, expected);
        assert_eq!(image, expected);
    }

    #[test]
    fn temp_slots_cannot_be_persistent() {
        let mut log = CompileLog::new();
        ImageCacheSettings {
            memory_id: MemoryIdx::Temp01,
            scope: CacheScope::Persistent,
        }
        .check(&mut log.step("p", 0));
        assert!(log.has_errors());
    }
}
