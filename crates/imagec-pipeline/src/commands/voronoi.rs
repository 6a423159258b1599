//! Voronoi partition of the tile around seed objects.
//!
//! Every pixel goes to the nearest seed (the bounding-box centre of a
//! seed object), optionally limited to `maxRadius` and to the union of
//! the mask classes. Each seed's region then yields one area: the piece
//! holding the seed, or the largest piece when areas without a point are
//! allowed.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactSet, InOut, OutputKind};
use crate::class_id::{ClassId, ClassIdIn};
use crate::command::{BuildEnv, Command, StepSettings, settings_command};
use crate::context::ProcessContext;
use crate::diagnostics::StepLog;
use crate::image_plane::ImagePlane;
use crate::object::{Object, ObjectId};
use crate::object_list::ObjectList;
use crate::raster::{Component, FOREGROUND, components};
use crate::spatial::PointIndex;
use crate::types::{BoundingBox, Dimensions, PipelineError, Point};

/// Voronoi options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoronoiGridSettings {
    /// Classes whose objects seed the partition.
    pub points_class_in: Vec<ClassIdIn>,
    /// Classes whose union limits the areas; empty means the whole tile.
    pub mask_classes: Vec<ClassIdIn>,
    /// Class of the produced areas.
    pub class_out: ClassIdIn,
    /// Largest distance of an area pixel from its seed.
    pub max_radius: Option<u32>,
    /// Drop areas that do not contain their seed point.
    pub exclude_areas_without_point: bool,
    /// Drop areas touching the tile border.
    pub exclude_areas_at_the_edge: bool,
    /// Smallest kept area in pixels.
    pub min_area_size: u64,
    /// Largest kept area in pixels.
    pub max_area_size: Option<u64>,
}

impl Default for VoronoiGridSettings {
    fn default() -> Self {
        Self {
            points_class_in: vec![ClassIdIn::Default],
            mask_classes: Vec::new(),
            class_out: ClassIdIn::Default,
            max_radius: None,
            exclude_areas_without_point: true,
            exclude_areas_at_the_edge: false,
            min_area_size: 0,
            max_area_size: None,
        }
    }
}

impl StepSettings for VoronoiGridSettings {
    fn in_out(&self) -> InOut {
        InOut::new(ArtifactSet::OBJECT, OutputKind::Object)
    }

    fn check(&self, log: &mut StepLog<'_>) {
        log.require(!self.points_class_in.is_empty(), "at least one seed class is required");
        if let Some(max) = self.max_area_size {
            log.require(
                max >= self.min_area_size,
                "maxAreaSize is smaller than minAreaSize",
            );
        }
        if self.max_radius == Some(0) {
            log.warning("maxRadius 0 leaves only the seed pixels");
        }
        if matches!(self.class_out, ClassIdIn::None) {
            log.error("output class must not be NONE");
        }
    }

    fn build(&self, _env: &BuildEnv<'_>) -> Result<Box<dyn Command>, PipelineError> {
        Ok(Box::new(VoronoiGrid(self.clone())))
    }
}

settings_command!(VoronoiGrid, VoronoiGridSettings, "voronoiGrid");

impl VoronoiGrid {
    fn run(
        &self,
        ctx: &mut ProcessContext<'_>,
        image: &mut ImagePlane,
        objects: &mut ObjectList,
    ) -> Result<(), PipelineError> {
        let s = &self.0;
        let dims = image.dimensions();
        let seeds: Vec<Point> = s
            .points_class_in
            .iter()
            .flat_map(|c| objects.class(ctx.resolve(*c)))
            .map(|o| bbox_centre(o.bbox()))
            .collect();
        if seeds.is_empty() {
            return Ok(());
        }
        let mask_classes: Vec<ClassId> = s.mask_classes.iter().map(|c| ctx.resolve(*c)).collect();
        let mask = (!mask_classes.is_empty()).then(|| union_mask(objects, &mask_classes, dims));

        let regions = partition(&seeds, dims, s.max_radius, mask.as_ref());
        let class_out = ctx.resolve(s.class_out);
        let mut areas = Vec::new();
        for (seed, region) in seeds.iter().zip(regions) {
            let Some(area) = self.pick_area(*seed, region) else {
                continue;
            };
            let mut object =
                Object::from_local_mask(ObjectId::new(0), class_out, image.id(), area.bbox, area.mask, 1.0);
            let size_ok = object.area() >= s.min_area_size
                && s.max_area_size.is_none_or(|max| object.area() <= max);
            let edge_ok = !(s.exclude_areas_at_the_edge && object.bbox().touches_border(dims));
            if size_ok && edge_ok {
                object.set_id(ctx.next_id());
                areas.push(object);
            }
        }
        tracing::debug!(seeds = seeds.len(), areas = areas.len(), "voronoi");
        objects.extend(areas);
        Ok(())
    }

    fn pick_area(&self, seed: Point, region: Option<Component>) -> Option<Component> {
        let region = region?;
        let origin = region.bbox;
        let mut pieces = components(&region.mask);
        for piece in &mut pieces {
            piece.bbox = BoundingBox::new(
                origin.x + piece.bbox.x,
                origin.y + piece.bbox.y,
                piece.bbox.width,
                piece.bbox.height,
            );
        }
        if self.0.exclude_areas_without_point {
            pieces.into_iter().find(|piece| contains(piece, seed))
        } else {
            pieces.into_iter().max_by_key(|piece| {
                piece.mask.pixels().filter(|p| p.0[0] != 0).count()
            })
        }
    }
}

fn bbox_centre(b: BoundingBox) -> Point {
    Point::new(
        f64::from(b.x) + f64::from(b.width / 2),
        f64::from(b.y) + f64::from(b.height / 2),
    )
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn contains(piece: &Component, p: Point) -> bool {
    if p.x < 0.0 || p.y < 0.0 {
        return false;
    }
    let (x, y) = (p.x as u32, p.y as u32);
    piece.bbox.contains(x, y)
        && piece
            .mask
            .get_pixel(x - piece.bbox.x, y - piece.bbox.y)
            .0[0]
            != 0
}

fn union_mask(objects: &ObjectList, classes: &[ClassId], dims: Dimensions) -> GrayImage {
    let mut mask = GrayImage::new(dims.width, dims.height);
    for class_id in classes {
        for object in objects.class(*class_id) {
            for (x, y) in object.pixels() {
                if x < dims.width && y < dims.height {
                    mask.put_pixel(x, y, FOREGROUND);
                }
            }
        }
    }
    mask
}

/// Bbox-local region of every seed after radius and mask limits; `None`
/// for a seed that got no pixel.
fn partition(
    seeds: &[Point],
    dims: Dimensions,
    max_radius: Option<u32>,
    mask: Option<&GrayImage>,
) -> Vec<Option<Component>> {
    let index = PointIndex::new(seeds);
    let limit = max_radius.map(|r| f64::from(r) * f64::from(r));
    let mut owner = vec![usize::MAX; (dims.width as usize) * (dims.height as usize)];
    let mut bounds: Vec<Option<(u32, u32, u32, u32)>> = vec![None; seeds.len()];
    for y in 0..dims.height {
        for x in 0..dims.width {
            if mask.is_some_and(|m| m.get_pixel(x, y).0[0] == 0) {
                continue;
            }
            let Some((seed, d2)) = index.nearest(Point::new(f64::from(x), f64::from(y))) else {
                continue;
            };
            if limit.is_some_and(|l| d2 > l) {
                continue;
            }
            owner[(y as usize) * (dims.width as usize) + x as usize] = seed;
            let slot = &mut bounds[seed];
            *slot = Some(match *slot {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    bounds
        .iter()
        .enumerate()
        .map(|(seed, b)| {
            let (x0, y0, x1, y1) = (*b)?;
            let bbox = BoundingBox::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
            let mask = GrayImage::from_fn(bbox.width, bbox.height, |lx, ly| {
                let i = ((bbox.y + ly) as usize) * (dims.width as usize) + (bbox.x + lx) as usize;
                if owner[i] == seed { FOREGROUND } else { image::Luma([0]) }
            });
            Some(Component { bbox, mask })
        })
        .collect()
}
