//! The command catalogue.
//!
//! One module per command family. Every command is a settings struct
//! (the serde form stored in a pipeline step) plus a runtime struct built
//! from it via [`StepSettings::build`](crate::command::StepSettings::build).
//! Helpers shared by several commands live here.

pub mod adaptive_threshold;
pub mod ai_classifier;
pub mod auto_threshold;
pub mod blur;
pub mod classifier;
pub mod colocalization;
pub mod color_filter;
pub mod crop;
pub mod edge_detection;
pub mod fill_holes;
pub mod hough;
pub mod image_cache;
pub mod image_from_class;
pub mod image_math;
pub mod intensity_transform;
pub mod measure_distance;
pub mod measure_intensity;
pub mod median_subtract;
pub mod morphological;
pub mod object_cache;
pub mod object_transform;
pub mod objects_to_image;
pub mod reclassify;
pub mod rolling_ball;
pub mod save_image;
pub mod skeletonize;
pub mod threshold;
pub mod validators;
pub mod voronoi;
pub mod watershed;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::class_id::ClassId;
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::{ImagePlane, PlaneId};
use crate::object::{Object, ObjectId};
use crate::raster::{Component, components, fill_mask_holes};
use crate::types::PipelineError;

/// Size and shape gate applied when turning masks into objects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectFilter {
    /// Smallest accepted area in pixels.
    pub min_particle_size: u64,
    /// Largest accepted area in pixels (unbounded when absent).
    pub max_particle_size: Option<u64>,
    /// Smallest accepted circularity in `[0, 1]`.
    pub min_circularity: f64,
}

impl Default for ObjectFilter {
    fn default() -> Self {
        Self {
            min_particle_size: 1,
            max_particle_size: None,
            min_circularity: 0.0,
        }
    }
}

impl ObjectFilter {
    /// Returns `true` if `object` passes the gate.
    #[must_use]
    pub fn accepts(&self, object: &Object) -> bool {
        object.area() >= self.min_particle_size
            && self.max_particle_size.is_none_or(|max| object.area() <= max)
            && object.circularity() >= self.min_circularity
    }

    pub(crate) fn check(&self, log: &mut StepLog<'_>) {
        if let Some(max) = self.max_particle_size {
            log.require(
                max >= self.min_particle_size,
                format!(
                    "maxParticleSize ({max}) is smaller than minParticleSize ({})",
                    self.min_particle_size
                ),
            );
        }
        log.require(
            (0.0..=1.0).contains(&self.min_circularity),
            format!("minCircularity must be in [0, 1], got {}", self.min_circularity),
        );
    }
}

/// Turn every 8-connected component of `mask` into an object of
/// `class_id`, holes filled, and keep those `filter` accepts.
///
/// Identifiers are only drawn for accepted objects.
pub(crate) fn objectify(
    ctx: &ProcessContext<'_>,
    mask: &GrayImage,
    class_id: ClassId,
    plane: PlaneId,
    filter: &ObjectFilter,
    confidence: f32,
) -> Vec<Object> {
    objects_from_components(ctx, components(mask), class_id, plane, filter, confidence)
}

/// [`objectify`] on components that were already extracted.
pub(crate) fn objects_from_components(
    ctx: &ProcessContext<'_>,
    components: Vec<Component>,
    class_id: ClassId,
    plane: PlaneId,
    filter: &ObjectFilter,
    confidence: f32,
) -> Vec<Object> {
    components
        .into_iter()
        .filter_map(|component| {
            let mut object = Object::from_local_mask(
                ObjectId::new(0),
                class_id,
                plane,
                component.bbox,
                fill_mask_holes(&component.mask),
                confidence,
            );
            filter.accepts(&object).then(|| {
                object.set_id(ctx.next_id());
                object
            })
        })
        .collect()
}

/// Record an error unless `size` is an odd number of at least 1.
pub(crate) fn check_odd_kernel(log: &mut StepLog<'_>, name: &str, size: u32) {
    log.require(
        size % 2 == 1,
        format!("{name} must be an odd number, got {size}"),
    );
}

/// The labels of a binary plane.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `image` is not binary.
pub(crate) fn binary_labels(
    image: &ImagePlane,
    command: &str,
) -> Result<crate::image_plane::Gray16Image, PipelineError> {
    if !image.is_binary() {
        return Err(PipelineError::InvalidConfig(format!(
            "{command} needs a binary image"
        )));
    }
    Ok(image.to_gray16())
}
