//! Move or copy objects into another class.
//!
//! Candidates are the objects of the input classes that pass the metrics
//! and intensity gates. With an intersection rule, a candidate is only
//! applied if it overlaps (or, with `APPLY_IF_NOT_MATCH`, does not
//! overlap) an object of the reference classes by at least
//! `minIntersection` of the smaller mask. Each candidate is applied at
//! most once, to the first reference it matches in creation order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut};
use crate::class_id::{ClassId, ClassIdIn};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::commands::ObjectFilter;
use crate::commands::measure_intensity::ImageRef;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::{Object, ObjectId};
use crate::object_list::ObjectList;
use crate::spatial::BoxIndex;
use crate::types::PipelineError;

/// Move keeps the object; copy creates a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReclassifyMode {
    /// Change the class in place; the id is kept.
    #[default]
    #[serde(rename = "RECLASSIFY_MOVE")]
    Move,
    /// Add a copy with a fresh id, parented to the source.
    #[serde(rename = "RECLASSIFY_COPY")]
    Copy,
}

/// Whether the intersection rule selects matching or non-matching
/// objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterLogic {
    #[default]
    ApplyIfMatch,
    ApplyIfNotMatch,
}

/// Parent assigned to moved objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HierarchyHandling {
    /// The matched reference object becomes the parent.
    #[default]
    CreateTree,
    /// The parent is left as it is.
    KeepExisting,
    /// The parent is cleared.
    Remove,
}

/// Overlap rule against reference classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntersectionRule {
    /// Reference classes.
    pub input_classes_intersect_with: Vec<ClassIdIn>,
    /// Minimum overlap as a fraction of the smaller mask.
    pub min_intersection: f64,
    /// Apply on match or on no match.
    pub logic: FilterLogic,
    /// Parent handling for moved objects.
    pub hierarchy_mode: HierarchyHandling,
}

impl Default for IntersectionRule {
    fn default() -> Self {
        Self {
            input_classes_intersect_with: Vec::new(),
            min_intersection: 0.1,
            logic: FilterLogic::ApplyIfMatch,
            hierarchy_mode: HierarchyHandling::CreateTree,
        }
    }
}

/// Keep objects whose mean intensity on a plane lies in a range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntensityGate {
    /// Plane to measure on.
    pub image_in: ImageRef,
    /// Smallest accepted mean.
    pub min_intensity: f64,
    /// Largest accepted mean.
    pub max_intensity: f64,
}

impl Default for IntensityGate {
    fn default() -> Self {
        Self {
            image_in: ImageRef::Source,
            min_intensity: 0.0,
            max_intensity: f64::from(u16::MAX),
        }
    }
}

/// Reclassify options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReclassifySettings {
    /// Classes whose objects are candidates.
    pub input_classes: Vec<ClassIdIn>,
    /// Move or copy.
    pub mode: ReclassifyMode,
    /// Target class.
    pub new_class_id: ClassIdIn,
    /// Optional overlap rule.
    pub intersection: Option<IntersectionRule>,
    /// Size and shape gate.
    pub metrics: ObjectFilter,
    /// Optional intensity gate.
    pub intensity: Option<IntensityGate>,
}

impl Default for ReclassifySettings {
    fn default() -> Self {
        Self {
            input_classes: vec![ClassIdIn::Default],
            mode: ReclassifyMode::Move,
            new_class_id: ClassIdIn::Default,
            intersection: None,
            metrics: ObjectFilter::default(),
            intensity: None,
        }
    }
}

impl StepSettings for ReclassifySettings {
    fn in_out(&self) -> InOut {
        InOut::pass_through(ArtifactSet::OBJECT)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.input_classes.is_empty(), "at least one input class is required");
        if matches!(self.new_class_id, ClassIdIn::None) {
            log.error("target class must not be NONE");
        }
        self.metrics.check(log);
        if let Some(rule) = &self.intersection {
            log.require(
                !rule.input_classes_intersect_with.is_empty(),
                "intersection needs at least one reference class",
            );
            log.require(
                (0.0..=1.0).contains(&rule.min_intersection),
                format!("minIntersection must be in [0, 1], got {}", rule.min_intersection),
            );
        }
        if let Some(gate) = &self.intensity {
            log.require(
                gate.max_intensity >= gate.min_intensity,
                "maxIntensity is smaller than minIntensity",
            );
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(Reclassify(self.clone())))
    }
}

settings_command!(Reclassify, ReclassifySettings, "reclassify");

impl Reclassify {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        _image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let s = &self.0;
        let gate_plane = s
            .intensity
            .map(|gate| gate.image_in.load(ctx).map(|(_, plane)| (gate, plane)))
            .transpose()?;
        let target = ctx.resolve(s.new_class_id);
        let inputs: Vec<ClassId> = s.input_classes.iter().map(|c| ctx.resolve(*c)).collect();

        let references: Vec<&Object> = s
            .intersection
            .iter()
            .flat_map(|rule| rule.input_classes_intersect_with.iter())
            .flat_map(|c| objects.class(ctx.resolve(*c)))
            .collect();
        let index = BoxIndex::new(references.iter().copied());

        // Decide on an immutable view, then apply. Values are the decision
        // order and the parent the object ends up with.
        let mut decisions: HashMap<ObjectId, (usize, Option<ObjectId>)> = HashMap::new();
        for class_id in &inputs {
            for candidate in objects.class(*class_id) {
                if decisions.contains_key(&candidate.id()) {
                    continue;
                }
                if !s.metrics.accepts(candidate) {
                    continue;
                }
                if let Some((gate, plane)) = &gate_plane {
                    let avg = candidate.measure_intensity(plane).avg;
                    if !(gate.min_intensity..=gate.max_intensity).contains(&avg) {
                        continue;
                    }
                }
                let order = decisions.len();
                let Some(rule) = &s.intersection else {
                    decisions.insert(candidate.id(), (order, candidate.parent_id()));
                    continue;
                };
                let matched = index
                    .candidates(candidate.bbox())
                    .into_iter()
                    .map(|i| references[i])
                    .filter(|r| r.id() != candidate.id())
                    .find(|r| {
                        candidate
                            .overlap_with(r)
                            .is_some_and(|o| o.fraction >= rule.min_intersection)
                    });
                let parent = match (rule.logic, matched) {
                    (FilterLogic::ApplyIfMatch, Some(reference)) => match rule.hierarchy_mode {
                        HierarchyHandling::CreateTree => Some(reference.id()),
                        HierarchyHandling::KeepExisting => candidate.parent_id(),
                        HierarchyHandling::Remove => None,
                    },
                    (FilterLogic::ApplyIfNotMatch, None) => match rule.hierarchy_mode {
                        HierarchyHandling::CreateTree | HierarchyHandling::KeepExisting => {
                            candidate.parent_id()
                        }
                        HierarchyHandling::Remove => None,
                    },
                    _ => continue,
                };
                decisions.insert(candidate.id(), (order, parent));
            }
        }

        let applied = decisions.len();
        match s.mode {
            ReclassifyMode::Move => {
                let mut moved: Vec<(usize, Option<ObjectId>, Object)> = objects
                    .take_matching(|o| decisions.contains_key(&o.id()))
                    .into_iter()
                    .filter_map(|o| decisions.get(&o.id()).map(|&(order, parent)| (order, parent, o)))
                    .collect();
                moved.sort_by_key(|(order, ..)| *order);
                objects.extend(moved.into_iter().map(|(_, parent, mut object)| {
                    object.set_parent(parent);
                    object.set_class(target);
                    object
                }));
            }
            ReclassifyMode::Copy => {
                let mut sources: Vec<(usize, &Object)> = objects
                    .iter()
                    .filter_map(|o| decisions.get(&o.id()).map(|&(order, _)| (order, o)))
                    .collect();
                sources.sort_by_key(|(order, _)| *order);
                let copies: Vec<Object> = sources
                    .into_iter()
                    .map(|(_, source)| source.copy_as(ctx.next_id(), target))
                    .collect();
                objects.extend(copies);
            }
        }
        tracing::debug!(%target, applied, mode = ?s.mode, "reclassified");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::commands::tests::{gray, run};
    use crate::object::tests::square;

    const SPOT: u16 = 2;
    const CELL: u16 = 3;
    const SPOT_IN_CELL: u16 = 4;

    fn class(c: u16) -> ClassIdIn {
        ClassIdIn::Class(ClassId::new(c))
    }

    fn by_intersection(mode: ReclassifyMode, logic: FilterLogic) -> ReclassifySettings {
        ReclassifySettings {
            input_classes: vec![class(SPOT)],
            mode,
            new_class_id: class(SPOT_IN_CELL),
            intersection: Some(IntersectionRule {
                input_classes_intersect_with: vec![class(CELL)],
                logic,
                ..IntersectionRule::default()
            }),
            ..ReclassifySettings::default()
        }
    }

    fn spots_and_cell() -> ObjectList {
        let mut objects = ObjectList::new();
        objects.push(square(100, SPOT, 0, 0, 10));
        objects.push(square(101, SPOT, 40, 40, 4));
        objects.push(square(200, CELL, 0, 0, 20));
        objects
    }

    fn apply(settings: ReclassifySettings, objects: &mut ObjectList) {
        let mut image = gray(64, 64, |_, _| 0);
        run(&Reclassify(settings), &mut image, objects).unwrap();
    }

    #[test]
    fn move_by_intersection_keeps_id() {
        let mut objects = spots_and_cell();
        apply(by_intersection(ReclassifyMode::Move, FilterLogic::ApplyIfMatch), &mut objects);
        assert_eq!(objects.count(ClassId::new(SPOT)), 1);
        let moved = objects.class(ClassId::new(SPOT_IN_CELL));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id(), ObjectId::new(100));
        assert_eq!(moved[0].parent_id(), Some(ObjectId::new(200)));
        assert_eq!(objects.len(), 3);
    }

    #[test]
    fn copy_leaves_source_and_parents_copy() {
        let mut objects = spots_and_cell();
        apply(by_intersection(ReclassifyMode::Copy, FilterLogic::ApplyIfMatch), &mut objects);
        assert_eq!(objects.count(ClassId::new(SPOT)), 2);
        let copy = &objects.class(ClassId::new(SPOT_IN_CELL))[0];
        assert_ne!(copy.id(), ObjectId::new(100));
        assert_eq!(copy.parent_id(), Some(ObjectId::new(100)));
        assert_eq!(copy.area(), 100);
    }

    #[test]
    fn not_match_selects_outsiders() {
        let mut objects = spots_and_cell();
        apply(by_intersection(ReclassifyMode::Move, FilterLogic::ApplyIfNotMatch), &mut objects);
        let moved = objects.class(ClassId::new(SPOT_IN_CELL));
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id(), ObjectId::new(101));
    }

    #[test]
    fn hierarchy_remove_clears_parent() {
        let mut objects = ObjectList::new();
        let mut spot = square(100, SPOT, 0, 0, 10);
        spot.set_parent(Some(ObjectId::new(7)));
        objects.push(spot);
        objects.push(square(200, CELL, 0, 0, 20));
        let mut settings = by_intersection(ReclassifyMode::Move, FilterLogic::ApplyIfMatch);
        if let Some(rule) = settings.intersection.as_mut() {
            rule.hierarchy_mode = HierarchyHandling::Remove;
        }
        apply(settings, &mut objects);
        assert_eq!(objects.class(ClassId::new(SPOT_IN_CELL))[0].parent_id(), None);
    }

    #[test]
    fn small_overlap_is_not_a_match() {
        let mut objects = ObjectList::new();
        objects.push(square(100, SPOT, 0, 0, 10));
        // Shares a 1x10 column: 10% of the spot is not above the 50% gate.
        objects.push(square(200, CELL, 9, 0, 10));
        let mut settings = by_intersection(ReclassifyMode::Move, FilterLogic::ApplyIfMatch);
        if let Some(rule) = settings.intersection.as_mut() {
            rule.min_intersection = 0.5;
        }
        apply(settings, &mut objects);
        assert_eq!(objects.count(ClassId::new(SPOT_IN_CELL)), 0);
    }

    #[test]
    fn metrics_gate_without_intersection() {
        let mut objects = spots_and_cell();
        let settings = ReclassifySettings {
            input_classes: vec![class(SPOT)],
            new_class_id: class(SPOT_IN_CELL),
            metrics: ObjectFilter {
                min_particle_size: 50,
                ..ObjectFilter::default()
            },
            ..ReclassifySettings::default()
        };
        apply(settings, &mut objects);
        assert_eq!(objects.count(ClassId::new(SPOT_IN_CELL)), 1);
        assert_eq!(objects.class(ClassId::new(SPOT))[0].id(), ObjectId::new(101));
    }

    #[test]
    fn dense_move_applies_each_object_once_in_input_order() {
        let mut objects = ObjectList::new();
        for i in 0..40u32 {
            let class_id = if i % 2 == 0 { CELL } else { SPOT };
            objects.push(square(u64::from(1000 - i), class_id, (i % 20) * 3, (i / 20) * 3, 2));
        }
        let settings = ReclassifySettings {
            input_classes: vec![class(SPOT), class(CELL), class(SPOT)],
            new_class_id: class(SPOT_IN_CELL),
            ..ReclassifySettings::default()
        };
        let expected: Vec<ObjectId> = objects
            .class(ClassId::new(SPOT))
            .iter()
            .chain(objects.class(ClassId::new(CELL)))
            .map(Object::id)
            .collect();
        apply(settings, &mut objects);

        assert_eq!(objects.len(), 40);
        assert!(objects.class(ClassId::new(SPOT)).is_empty());
        assert!(objects.class(ClassId::new(CELL)).is_empty());
        let moved: Vec<ObjectId> = objects
            .class(ClassId::new(SPOT_IN_CELL))
            .iter()
            .map(Object::id)
            .collect();
        assert_eq!(moved, expected);
    }

    #[test]
    fn intensity_gate_uses_source_plane() {
        let mut objects = ObjectList::new();
        objects.push(square(100, SPOT, 0, 0, 4));
        let settings = ReclassifySettings {
            input_classes: vec![class(SPOT)],
            new_class_id: class(SPOT_IN_CELL),
            intensity: Some(IntensityGate {
                min_intensity: 1.0,
                ..IntensityGate::default()
            }),
            ..ReclassifySettings::default()
        };
        // The harness source plane of channel 0 is all zeros.
        apply(settings, &mut objects);
        assert_eq!(objects.count(ClassId::new(SPOT_IN_CELL)), 0);
    }
}
