//! Successive pairwise intersection of object classes.
//!
//! The first class is intersected with the second, the result with the
//! third, and so on. Every object takes part in at most one intersection
//! per round. Each final intersection becomes an object of the output
//! class, parented to its first source, with overlap records linking it
//! and all of its sources to each other.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::{ClassId, ClassIdIn};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::{Object, ObjectId, Overlap};
use crate::object_list::ObjectList;
use crate::spatial::BoxIndex;
use crate::types::PipelineError;

/// Colocalization options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColocalizationSettings {
    /// Classes to intersect, in order.
    pub input_classes: Vec<ClassIdIn>,
    /// Class of the intersection objects.
    pub class_out: ClassIdIn,
    /// Minimum overlap as a fraction of the smaller mask.
    pub min_intersection: f64,
}

impl Default for ColocalizationSettings {
    fn default() -> Self {
        Self {
            input_classes: Vec::new(),
            class_out: ClassIdIn::Default,
            min_intersection: 0.1,
        }
    }
}

impl StepSettings for ColocalizationSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::OBJECT, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(
            self.input_classes.len() >= 2,
            "colocalization needs at least two input classes",
        );
        log.require(
            (0.0..=1.0).contains(&self.min_intersection),
            format!("minIntersection must be in [0, 1], got {}", self.min_intersection),
        );
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Colocalization(self.clone())))
    }
}

settings_command!(Colocalization, ColocalizationSettings, "colocalization");

/// An intersection in progress and the objects it came from.
struct Chain {
    piece: Object,
    sources: Vec<ObjectId>,
}

impl Colocalization {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let classes: Vec<ClassId> = self.0.input_classes.iter().map(|c| ctx.resolve(*c)).collect();
        let Some((first, rest)) = classes.split_first() else {
            return Ok(());
        };
        let class_out = ctx.resolve(self.0.class_out);

        let mut chains: Vec<Chain> = objects
            .class(*first)
            .iter()
            .map(|o| Chain {
                piece: o.clone(),
                sources: vec![o.id()],
            })
            .collect();
        for class_id in rest {
            let others = objects.class(*class_id);
            let index = BoxIndex::new(others);
            let mut used = BTreeSet::new();
            let mut next = Vec::new();
            for chain in &chains {
                for j in index.candidates(chain.piece.bbox()) {
                    let other = &others[j];
                    if used.contains(&j) || chain.sources.contains(&other.id()) {
                        continue;
                    }
                    let enough = chain
                        .piece
                        .overlap_with(other)
                        .is_some_and(|o| o.fraction >= self.0.min_intersection);
                    if !enough {
                        continue;
                    }
                    let Some((bbox, mask)) = chain.piece.intersection_mask(other) else {
                        continue;
                    };
                    used.insert(j);
                    let mut sources = chain.sources.clone();
                    sources.push(other.id());
                    next.push(Chain {
                        piece: Object::from_local_mask(
                            ObjectId::new(0),
                            class_out,
                            image.id(),
                            bbox,
                            mask,
                            chain.piece.confidence().min(other.confidence()),
                        ),
                        sources,
                    });
                    break;
                }
            }
            chains = next;
        }
        if rest.is_empty() {
            return Ok(());
        }

        // Links are computed first and written afterwards.
        let mut links: Vec<(ObjectId, ObjectId, Overlap)> = Vec::new();
        let mut results = Vec::with_capacity(chains.len());
        for Chain { mut piece, sources } in chains {
            piece.set_id(ctx.next_id());
            piece.set_parent(sources.first().copied());
            for (i, a) in sources.iter().enumerate() {
                let Some(source_a) = objects.find(*a) else {
                    continue;
                };
                if let Some(overlap) = piece.overlap_with(source_a) {
                    links.push((*a, piece.id(), overlap));
                }
                for b in &sources[i + 1..] {
                    if let Some(overlap) = objects.find(*b).and_then(|o| source_a.overlap_with(o)) {
                        links.push((*a, *b, overlap));
                    }
                }
            }
            results.push(piece);
        }
        for piece in &mut results {
            for (a, b, overlap) in &links {
                if *b == piece.id() {
                    piece.record_overlap(*a, *overlap);
                }
            }
        }
        for (a, b, overlap) in links {
            if let Some(object) = objects.find_mut(a) {
                object.record_overlap(b, overlap);
            }
            if let Some(object) = objects.find_mut(b) {
                object.record_overlap(a, overlap);
            }
        }
        tracing::debug!(%class_out, count = results.len(), "colocalized");
        objects.extend(results);
        Ok(())
    }
}
