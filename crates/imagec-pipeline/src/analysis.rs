//! Analysis configuration: plate, classes, image handling, images, and
//! the pipelines to run on each image.
//!
//! Besides holding the deserialized document, this module plans the
//! iterations of one image: tiles in a regular grid (tile x, then tile
//! y), then time points, then focal planes.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::class_id::ClassId;
use crate::diagnostics::CompileLog;
use crate::io::{ImageMetadata, TileInfo};
use crate::pipeline::Pipeline;
use crate::types::{Dimensions, PipelineError};
use crate::validate::check_pipelines;

/// Pseudo pipeline name used for analysis-level compile entries.
pub const ANALYSIS: &str = "<analysis>";

/// Plate layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlateSetup {
    /// Plate identifier written with every tile.
    pub plate_id: u64,
    /// Well rows.
    pub rows: u32,
    /// Well columns.
    pub cols: u32,
    /// Arrangement of image numbers inside one well, row by row.
    pub well_image_order: Vec<Vec<u32>>,
    /// Edge length of the density map cells, in pixels.
    pub density_map_size: u32,
}

impl Default for PlateSetup {
    fn default() -> Self {
        Self {
            plate_id: 1,
            rows: 16,
            cols: 24,
            well_image_order: vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]],
            density_map_size: 200,
        }
    }
}

/// A user-defined class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDefinition {
    /// Identifier used by pipelines and written on objects.
    pub class_id: ClassId,
    /// Display name.
    pub name: String,
}

/// How several focal planes are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ZProjection {
    /// Pixel-wise maximum.
    MaxIntensity,
    /// Pixel-wise minimum.
    MinIntensity,
    /// Pixel-wise mean, rounded.
    AvgIntensity,
}

/// Which focal planes are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZStackHandling {
    /// One plane.
    ExactOne(u32),
    /// Every plane in its own iteration.
    EachIndividual,
    /// All planes projected into one.
    IntensityProjection(ZProjection),
}

impl Default for ZStackHandling {
    fn default() -> Self {
        Self::ExactOne(0)
    }
}

/// Which time points are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TStackHandling {
    /// One time point.
    ExactOne(u32),
    /// Every time point in its own iteration.
    EachIndividual,
}

impl Default for TStackHandling {
    fn default() -> Self {
        Self::ExactOne(0)
    }
}

/// Inclusive range of time points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TRange {
    /// First time point.
    pub start: u32,
    /// Last time point.
    pub end: u32,
}

/// Image handling shared by all images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSetup {
    /// Tile size for images larger than one tile.
    pub composite_tile_size: Dimensions,
    /// Focal-plane selection.
    pub z_stack_handling: ZStackHandling,
    /// Time-point selection.
    pub t_stack_handling: TStackHandling,
    /// Limits [`TStackHandling::EachIndividual`].
    pub t_range: Option<TRange>,
}

impl Default for ImageSetup {
    fn default() -> Self {
        Self {
            composite_tile_size: Dimensions::new(4096, 4096),
            z_stack_handling: ZStackHandling::default(),
            t_stack_handling: TStackHandling::default(),
            t_range: None,
        }
    }
}

/// One planned pass over an image: a tile at a time point and focal
/// plane. Projected iterations use focal plane 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    /// Tile geometry.
    pub tile: TileInfo,
    /// Time point.
    pub t: u32,
    /// Focal plane.
    pub z: u32,
}

impl ImageSetup {
    /// Plan every iteration over an image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if a selected focal plane
    /// or time point does not exist, or the tile size is zero.
    pub fn iterations(
        &self,
        tile_size: Dimensions,
        metadata: &ImageMetadata,
    ) -> Result<Vec<Iteration>, PipelineError> {
        if tile_size.pixel_count() == 0 {
            return Err(PipelineError::InvalidConfig("tile size must not be zero".into()));
        }
        let image = metadata.dimensions();
        let tiles = tile_grid(image, tile_size);
        let ts = self.time_points(metadata.planes.t)?;
        let zs = self.focal_planes(metadata.planes.z)?;
        let mut plan = Vec::with_capacity(tiles.len() * ts.len() * zs.len());
        for tile in &tiles {
            for &t in &ts {
                for &z in &zs {
                    plan.push(Iteration { tile: *tile, t, z });
                }
            }
        }
        Ok(plan)
    }

    fn time_points(&self, count: u32) -> Result<Vec<u32>, PipelineError> {
        match self.t_stack_handling {
            TStackHandling::ExactOne(t) => {
                exists("time point", t, count)?;
                Ok(vec![t])
            }
            TStackHandling::EachIndividual => {
                let last = count.saturating_sub(1);
                let (start, end) = self
                    .t_range
                    .map_or((0, last), |r| (r.start, r.end.min(last)));
                Ok((start..=end).filter(|t| *t < count).collect())
            }
        }
    }

    fn focal_planes(&self, count: u32) -> Result<Vec<u32>, PipelineError> {
        match self.z_stack_handling {
            ZStackHandling::ExactOne(z) => {
                exists("focal plane", z, count)?;
                Ok(vec![z])
            }
            ZStackHandling::EachIndividual => Ok((0..count).collect()),
            ZStackHandling::IntensityProjection(_) => Ok(vec![0]),
        }
    }

    /// The projection to apply when loading source planes, if any.
    #[must_use]
    pub const fn projection(&self) -> Option<ZProjection> {
        match self.z_stack_handling {
            ZStackHandling::IntensityProjection(p) => Some(p),
            ZStackHandling::ExactOne(_) | ZStackHandling::EachIndividual => None,
        }
    }
}

fn exists(what: &str, index: u32, count: u32) -> Result<(), PipelineError> {
    if index < count {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "{what} {index} does not exist, the image has {count}"
        )))
    }
}

/// Tiles covering `image`, column-major (tile x outer, tile y inner).
///
/// An image with no more pixels than one tile is a single tile.
#[must_use]
pub fn tile_grid(image: Dimensions, tile_size: Dimensions) -> Vec<TileInfo> {
    if image.pixel_count() <= tile_size.pixel_count() {
        return vec![TileInfo::whole(image)];
    }
    let nx = image.width.div_ceil(tile_size.width);
    let ny = image.height.div_ceil(tile_size.height);
    (0..nx)
        .flat_map(|tx| (0..ny).map(move |ty| (tx, ty)))
        .filter_map(|(tx, ty)| TileInfo::new(tx, ty, tile_size, image))
        .collect()
}

/// One image to analyse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    /// Where the image I/O finds it.
    pub path: PathBuf,
    /// Series inside the file.
    #[serde(default)]
    pub series: u32,
    /// Group (well) the image belongs to.
    #[serde(default)]
    pub group_id: u64,
    /// Identifier written with every tile.
    pub image_id: u64,
    /// Overrides the composite tile size.
    #[serde(default)]
    pub tile_size: Option<Dimensions>,
}

/// A complete analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Plate layout.
    #[serde(default)]
    pub plate: PlateSetup,
    /// User-defined classes.
    #[serde(default)]
    pub classes: Vec<ClassDefinition>,
    /// Image handling.
    #[serde(default)]
    pub image_setup: ImageSetup,
    /// Images in processing order.
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    /// Pipelines in execution order.
    pub pipelines: Vec<Pipeline>,
}

impl AnalysisConfig {
    /// An analysis of `images` with `pipelines` and default settings.
    #[must_use]
    pub fn new(images: Vec<ImageEntry>, pipelines: Vec<Pipeline>) -> Self {
        Self {
            plate: PlateSetup::default(),
            classes: Vec::new(),
            image_setup: ImageSetup::default(),
            images,
            pipelines,
        }
    }

    /// Tile size used for `image`.
    #[must_use]
    pub fn tile_size(&self, image: &ImageEntry) -> Dimensions {
        image.tile_size.unwrap_or(self.image_setup.composite_tile_size)
    }

    /// Check the whole configuration.
    #[must_use]
    pub fn check(&self) -> CompileLog {
        let mut log = check_pipelines(&self.pipelines);
        let mut own = log.pipeline(ANALYSIS);

        own.require(
            self.plate.rows > 0 && self.plate.cols > 0,
            "plate needs at least one row and one column",
        );
        let tile = self.image_setup.composite_tile_size;
        own.require(
            tile.width > 0 && tile.height > 0,
            "compositeTileSize must not be zero",
        );
        if let Some(range) = self.image_setup.t_range {
            own.require(
                range.start <= range.end,
                format!("tRange start {} is after end {}", range.start, range.end),
            );
        }

        let mut class_ids = HashSet::new();
        for class in &self.classes {
            if !class.class_id.is_user() {
                own.error(format!("class {} cannot be user-defined", class.class_id));
            }
            if !class_ids.insert(class.class_id) {
                own.error(format!("class {} is defined twice", class.class_id));
            }
        }
        if !self.classes.is_empty() {
            for pipeline in &self.pipelines {
                if !class_ids.contains(&pipeline.default_class) {
                    own.warning(format!(
                        "pipeline `{}` uses undefined class {}",
                        pipeline.name, pipeline.default_class
                    ));
                }
            }
        }

        let mut image_ids = HashSet::new();
        for image in &self.images {
            if !image_ids.insert(image.image_id) {
                own.error(format!("image id {} is used twice", image.image_id));
            }
            if let Some(size) = image.tile_size {
                own.require(
                    size.width > 0 && size.height > 0,
                    format!("image {}: tile size must not be zero", image.image_id),
                );
            }
        }
        if self.images.is_empty() {
            own.info("no images to analyse");
        }
        log
    }
}
