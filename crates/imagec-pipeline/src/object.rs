//! Objects: labelled regions with geometry, relations, and measurements.
//!
//! Objects live in an arena keyed by [`ObjectId`]. Parent, origin,
//! overlap, and distance relations are stored as identifiers, never as
//! references, so an object can be cloned or serialised on its own.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::cache::MemoryKey;
use crate::class_id::ClassId;
use crate::contour::{circularity, trace_outer_contours, traced_perimeter};
use crate::image_plane::{ImagePlane, PlaneId};
use crate::raster::{crop_mask, mask_bounds};
use crate::types::{BoundingBox, Point};

/// Identifier unique within a results store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The single assignment point for object identifiers.
///
/// Identifiers increase monotonically; nothing may assume consecutive
/// objects get consecutive identifiers.
#[derive(Debug)]
pub struct ObjectIdGenerator {
    next: Mutex<u64>,
}

impl ObjectIdGenerator {
    /// Start issuing at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Start issuing at `first`, e.g. after the highest id already in a
    /// results store.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: Mutex::new(first),
        }
    }

    /// Issue the next identifier.
    pub fn next_id(&self) -> ObjectId {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let id = ObjectId(*next);
        *next += 1;
        id
    }
}

impl Default for ObjectIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-plane intensity aggregates over an object's mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityAggregates {
    /// Sum of pixel values.
    pub sum: f64,
    /// Mean pixel value.
    pub avg: f64,
    /// Minimum pixel value.
    pub min: f64,
    /// Maximum pixel value.
    pub max: f64,
}

impl IntensityAggregates {
    /// All aggregates NaN, written when a measurement faults.
    pub const NAN: Self = Self {
        sum: f64::NAN,
        avg: f64::NAN,
        min: f64::NAN,
        max: f64::NAN,
    };

    /// Returns `true` if any aggregate is not finite.
    #[must_use]
    pub const fn has_fault(&self) -> bool {
        !(self.sum.is_finite() && self.avg.is_finite() && self.min.is_finite() && self.max.is_finite())
    }
}

/// Overlap record between two objects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Overlap {
    /// Overlapping pixel count.
    pub area: u64,
    /// `area / min(area_a, area_b)`.
    pub fraction: f64,
}

/// Distance record between two objects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distance {
    /// Centre-of-mass to centre-of-mass distance.
    pub centre: f64,
    /// Closest distance between the two contours (0 when they touch).
    pub surface: f64,
}

/// A labelled region of a tile.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    id: ObjectId,
    class_id: ClassId,
    parent_id: Option<ObjectId>,
    origin_id: Option<ObjectId>,
    plane: PlaneId,
    confidence: f32,
    bbox: BoundingBox,
    mask: GrayImage,
    contour: Vec<Point>,
    area: u64,
    perimeter: f64,
    circularity: f64,
    centre_of_mass: Point,
    intensities: BTreeMap<MemoryKey, IntensityAggregates>,
    overlaps: BTreeMap<ObjectId, Overlap>,
    distances: BTreeMap<ObjectId, Distance>,
}

impl Object {
    /// Build an object from a tile-sized mask (non-zero = inside).
    ///
    /// Returns `None` if the mask is empty.
    #[must_use]
    pub fn from_tile_mask(
        id: ObjectId,
        class_id: ClassId,
        plane: PlaneId,
        tile_mask: &GrayImage,
        confidence: f32,
    ) -> Option<Self> {
        let bbox = mask_bounds(tile_mask)?;
        Some(Self::from_local_mask(
            id,
            class_id,
            plane,
            bbox,
            crop_mask(tile_mask, bbox),
            confidence,
        ))
    }

    /// Build an object from a bbox-sized mask.
    ///
    /// The caller guarantees `mask` has the dimensions of `bbox` and at
    /// least one foreground pixel.
    #[must_use]
    pub fn from_local_mask(
        id: ObjectId,
        class_id: ClassId,
        plane: PlaneId,
        bbox: BoundingBox,
        mask: GrayImage,
        confidence: f32,
    ) -> Self {
        let mut object = Self {
            id,
            class_id,
            parent_id: None,
            origin_id: None,
            plane,
            confidence,
            bbox,
            mask,
            contour: Vec::new(),
            area: 0,
            perimeter: 0.0,
            circularity: 0.0,
            centre_of_mass: bbox.centre(),
            intensities: BTreeMap::new(),
            overlaps: BTreeMap::new(),
            distances: BTreeMap::new(),
        };
        object.recompute_geometry();
        object
    }

    /// Recompute contour, area, perimeter, circularity, and centre of mass
    /// from the mask.
    #[allow(clippy::cast_precision_loss)]
    fn recompute_geometry(&mut self) {
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut area = 0u64;
        for (x, y, p) in self.mask.enumerate_pixels() {
            if p.0[0] != 0 {
                area += 1;
                sum_x += f64::from(x);
                sum_y += f64::from(y);
            }
        }
        let ox = f64::from(self.bbox.x);
        let oy = f64::from(self.bbox.y);
        self.area = area;
        if area > 0 {
            self.centre_of_mass = Point::new(ox + sum_x / area as f64, oy + sum_y / area as f64);
        }
        self.contour = trace_outer_contours(&self.mask)
            .into_iter()
            .max_by_key(crate::contour::Contour::len)
            .map(|c| c.translated(ox, oy).into_points())
            .unwrap_or_default();
        self.perimeter = traced_perimeter(&self.contour);
        self.circularity = circularity(area as f64, self.perimeter);
    }

    /// A copy with a fresh identifier under `class_id`, parented to `self`.
    ///
    /// Geometry and intensity measurements carry over; relations do not.
    #[must_use]
    pub fn copy_as(&self, id: ObjectId, class_id: ClassId) -> Self {
        Self {
            id,
            class_id,
            parent_id: Some(self.id),
            origin_id: Some(self.origin_id.unwrap_or(self.id)),
            overlaps: BTreeMap::new(),
            distances: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// A new object with the same identity and relations but a new mask.
    ///
    /// Intensity measurements are dropped because they described the old
    /// region. Returns `None` if the new mask is empty.
    #[must_use]
    pub fn with_tile_mask(&self, tile_mask: &GrayImage) -> Option<Self> {
        let bbox = mask_bounds(tile_mask)?;
        let mut reshaped = Self::from_local_mask(
            self.id,
            self.class_id,
            self.plane,
            bbox,
            crop_mask(tile_mask, bbox),
            self.confidence,
        );
        reshaped.parent_id = self.parent_id;
        reshaped.origin_id = self.origin_id;
        Some(reshaped)
    }

    // --- accessors ---

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Current class.
    #[must_use]
    pub const fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Parent object, if any.
    #[must_use]
    pub const fn parent_id(&self) -> Option<ObjectId> {
        self.parent_id
    }

    /// Upstream root object, if any.
    #[must_use]
    pub const fn origin_id(&self) -> Option<ObjectId> {
        self.origin_id
    }

    /// Plane the object was detected on.
    #[must_use]
    pub const fn plane(&self) -> PlaneId {
        self.plane
    }

    /// Detection confidence in `[0, 1]`.
    #[must_use]
    pub const fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Bounding box in tile coordinates.
    #[must_use]
    pub const fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Bbox-sized mask.
    #[must_use]
    pub const fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Outer contour in tile coordinates.
    #[must_use]
    pub fn contour(&self) -> &[Point] {
        &self.contour
    }

    /// Pixel count of the mask.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.area
    }

    /// Traced perimeter length.
    #[must_use]
    pub const fn perimeter(&self) -> f64 {
        self.perimeter
    }

    /// `min(1, 4*pi*A / P^2)`.
    #[must_use]
    pub const fn circularity(&self) -> f64 {
        self.circularity
    }

    /// Mask centroid in tile coordinates.
    #[must_use]
    pub const fn centre_of_mass(&self) -> Point {
        self.centre_of_mass
    }

    /// Intensity aggregates by measured plane.
    #[must_use]
    pub const fn intensities(&self) -> &BTreeMap<MemoryKey, IntensityAggregates> {
        &self.intensities
    }

    /// Overlap records by peer.
    #[must_use]
    pub const fn overlaps(&self) -> &BTreeMap<ObjectId, Overlap> {
        &self.overlaps
    }

    /// Distance records by peer.
    #[must_use]
    pub const fn distances(&self) -> &BTreeMap<ObjectId, Distance> {
        &self.distances
    }

    // --- mutation ---

    pub(crate) const fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    pub(crate) const fn set_class(&mut self, class_id: ClassId) {
        self.class_id = class_id;
    }

    pub(crate) const fn set_parent(&mut self, parent: Option<ObjectId>) {
        self.parent_id = parent;
    }

    /// Record intensity aggregates for `key`.
    ///
    /// Write-once: returns `false` and leaves the existing value when the
    /// key is already present.
    pub fn record_intensity(&mut self, key: MemoryKey, aggregates: IntensityAggregates) -> bool {
        if self.intensities.contains_key(&key) {
            return false;
        }
        self.intensities.insert(key, aggregates);
        true
    }

    /// Record an overlap with `peer`, replacing a previous record.
    pub fn record_overlap(&mut self, peer: ObjectId, overlap: Overlap) {
        self.overlaps.insert(peer, overlap);
    }

    /// Record a distance to `peer`, replacing a previous record.
    pub fn record_distance(&mut self, peer: ObjectId, distance: Distance) {
        self.distances.insert(peer, distance);
    }

    // --- geometry queries ---

    /// Returns `true` if the tile pixel `(x, y)` lies inside the mask.
    #[must_use]
    pub fn contains_pixel(&self, x: u32, y: u32) -> bool {
        self.bbox.contains(x, y) && self.mask.get_pixel(x - self.bbox.x, y - self.bbox.y).0[0] != 0
    }

    /// Iterate the tile coordinates of all mask pixels.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let (ox, oy) = (self.bbox.x, self.bbox.y);
        self.mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] != 0)
            .map(move |(x, y, _)| (ox + x, oy + y))
    }

    /// Overlap with another object, or `None` if the masks are disjoint.
    ///
    /// The fraction is relative to the smaller of the two objects.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn overlap_with(&self, other: &Self) -> Option<Overlap> {
        let region = self.bbox.intersection(&other.bbox)?;
        let mut area = 0u64;
        for y in region.y..region.bottom() {
            for x in region.x..region.right() {
                if self.contains_pixel(x, y) && other.contains_pixel(x, y) {
                    area += 1;
                }
            }
        }
        let smaller = self.area.min(other.area);
        (area > 0 && smaller > 0).then(|| Overlap {
            area,
            fraction: area as f64 / smaller as f64,
        })
    }

    /// Intersection mask of two objects in tile coordinates, sized to the
    /// overlapping bbox region. `None` when disjoint.
    #[must_use]
    pub fn intersection_mask(&self, other: &Self) -> Option<(BoundingBox, GrayImage)> {
        let region = self.bbox.intersection(&other.bbox)?;
        let mut any = false;
        let mask = GrayImage::from_fn(region.width, region.height, |x, y| {
            let (tx, ty) = (region.x + x, region.y + y);
            if self.contains_pixel(tx, ty) && other.contains_pixel(tx, ty) {
                any = true;
                crate::raster::FOREGROUND
            } else {
                image::Luma([0])
            }
        });
        any.then_some((region, mask))
    }

    /// Compute intensity aggregates of `plane` under the mask.
    ///
    /// Pixels outside the plane are ignored. Returns
    /// [`IntensityAggregates::NAN`] when no pixel could be sampled.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn measure_intensity(&self, plane: &ImagePlane) -> IntensityAggregates {
        let dims = plane.dimensions();
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut n = 0u64;
        for (x, y) in self.pixels() {
            if x >= dims.width || y >= dims.height {
                continue;
            }
            let v = plane.value_f64(x, y);
            sum += v;
            min = min.min(v);
            max = max.max(v);
            n += 1;
        }
        if n == 0 {
            return IntensityAggregates::NAN;
        }
        IntensityAggregates {
            sum,
            avg: sum / n as f64,
            min,
            max,
        }
    }

    /// Contour as a `geo` polygon in tile coordinates.
    #[must_use]
    pub fn polygon(&self) -> geo::Polygon<f64> {
        let exterior: Vec<geo::Coord<f64>> = self
            .contour
            .iter()
            .map(|p| geo::Coord { x: p.x, y: p.y })
            .collect();
        geo::Polygon::new(geo::LineString::from(exterior), Vec::new())
    }
}
