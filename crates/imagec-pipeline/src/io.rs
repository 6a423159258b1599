//! Collaborator contracts: image I/O and AI models.
//!
//! The core never touches the filesystem. Callers hand it an
//! [`ImageIo`] that reads tiles of stacked microscopy images and,
//! optionally, a [`ModelLoader`] for AI classifier steps.
//! [`InMemoryImageIo`] serves planes held in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::image_plane::{Gray16Image, ImagePlane, PixelBuffer, PixelType, PlaneId};
use crate::types::{BoundingBox, Dimensions, PipelineError};

/// Number of planes along each stack axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneCounts {
    /// Focal planes.
    pub z: u32,
    /// Time points.
    pub t: u32,
    /// Channels.
    pub c: u32,
}

/// What an image reader knows about an image before reading pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Full-resolution width in pixels.
    pub width: u32,
    /// Full-resolution height in pixels.
    pub height: u32,
    /// Number of series in the file.
    pub n_series: u32,
    /// Plane counts per series.
    pub planes: PlaneCounts,
    /// Element type of the stored pixels.
    pub pixel_type: PixelType,
    /// Unit of the physical pixel size, e.g. `"um"`.
    pub physical_pixel_size_unit: String,
}

impl ImageMetadata {
    /// Full-resolution dimensions.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Position and extent of one tile inside its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileInfo {
    /// Tile column.
    pub tile_x: u32,
    /// Tile row.
    pub tile_y: u32,
    /// Nominal tile width.
    pub tile_width: u32,
    /// Nominal tile height.
    pub tile_height: u32,
    /// Pixel region covered, clipped to the image.
    pub region: BoundingBox,
    /// Full image dimensions.
    pub image: Dimensions,
}

impl TileInfo {
    /// The tile at `(tile_x, tile_y)` of a regular grid over `image`.
    ///
    /// Returns `None` if the tile lies outside the image.
    #[must_use]
    pub fn new(tile_x: u32, tile_y: u32, tile_size: Dimensions, image: Dimensions) -> Option<Self> {
        let x = tile_x.checked_mul(tile_size.width)?;
        let y = tile_y.checked_mul(tile_size.height)?;
        if x >= image.width || y >= image.height {
            return None;
        }
        let width = tile_size.width.min(image.width - x);
        let height = tile_size.height.min(image.height - y);
        Some(Self {
            tile_x,
            tile_y,
            tile_width: tile_size.width,
            tile_height: tile_size.height,
            region: BoundingBox::new(x, y, width, height),
            image,
        })
    }

    /// A single tile covering the whole image.
    #[must_use]
    pub const fn whole(image: Dimensions) -> Self {
        Self {
            tile_x: 0,
            tile_y: 0,
            tile_width: image.width,
            tile_height: image.height,
            region: BoundingBox::new(0, 0, image.width, image.height),
            image,
        }
    }

    /// Actual pixel dimensions of this tile.
    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.region.width, self.region.height)
    }
}

/// Reads tiles of stacked microscopy images.
///
/// Implementations must be usable from several tile workers at once.
pub trait ImageIo: Send + Sync {
    /// An opened image.
    type Handle: Send + Sync;

    /// Open an image file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] if the image cannot be opened.
    fn open_image(&self, path: &Path) -> Result<Self::Handle, PipelineError>;

    /// Read the image's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on read failure.
    fn metadata(&self, handle: &Self::Handle) -> Result<ImageMetadata, PipelineError>;

    /// Read the tile region of one plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on read failure or when the
    /// plane does not exist.
    fn read_tile(
        &self,
        handle: &Self::Handle,
        plane: PlaneId,
        tile: &TileInfo,
    ) -> Result<ImagePlane, PipelineError>;
}

// ───── AI models ───────────────────────────────────────────────────

/// Serialization format of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelFormat {
    #[default]
    Onnx,
    Torchscript,
    #[serde(rename = "TENSORFLOW")]
    #[strum(serialize = "TENSORFLOW")]
    TensorFlow,
}

/// Network architecture, which decides how outputs are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
pub enum ModelArchitecture {
    /// Box detector with instance masks.
    #[default]
    YoloV5,
    /// Per-pixel semantic segmentation.
    UNet,
    /// Cellpose cyto3 instance segmentation.
    Cyto3,
    /// Star-convex polygon instance segmentation.
    StarDist,
}

/// Thresholds and input shape handed to inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InferenceParams {
    /// Minimum class probability for a detection.
    pub class_threshold: f32,
    /// Minimum per-pixel probability for a mask pixel.
    pub mask_threshold: f32,
    /// Network input width (the tile is resized to it).
    pub input_width: u32,
    /// Network input height.
    pub input_height: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            class_threshold: 0.5,
            mask_threshold: 0.8,
            input_width: 640,
            input_height: 640,
        }
    }
}

/// One detected box.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxPrediction {
    /// Box in tile coordinates.
    pub bbox: BoundingBox,
    /// Model class index.
    pub class_index: u32,
    /// Detection confidence in `[0, 1]`.
    pub confidence: f32,
    /// Optional bbox-sized instance mask; the full box when absent.
    pub mask: Option<GrayImage>,
}

/// Model output for one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum Inference {
    /// Per-pixel model class index (0 = background).
    Labels(Gray16Image),
    /// Per-box detections.
    Boxes(Vec<BoxPrediction>),
}

/// A loaded model, shared immutably by every tile of a run.
pub trait AiModel: Send + Sync + std::fmt::Debug {
    /// Run inference on one tile.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] if inference fails.
    fn infer(&self, tile: &ImagePlane, params: &InferenceParams) -> Result<Inference, PipelineError>;
}

/// Loads models for AI classifier steps.
pub trait ModelLoader: Send + Sync {
    /// Load a model file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] if the model cannot be loaded.
    fn load_model(
        &self,
        path: &Path,
        format: ModelFormat,
        architecture: ModelArchitecture,
    ) -> Result<Arc<dyn AiModel>, PipelineError>;
}

// ───── In-memory image I/O ─────────────────────────────────────────

/// An image held entirely in memory: one buffer per plane.
#[derive(Debug, Clone)]
pub struct InMemoryImage {
    metadata: ImageMetadata,
    planes: BTreeMap<PlaneId, PixelBuffer>,
}

impl InMemoryImage {
    /// A single-plane 16-bit image.
    #[must_use]
    pub fn gray16(image: Gray16Image) -> Self {
        let mut planes = BTreeMap::new();
        let (width, height) = image.dimensions();
        planes.insert(PlaneId::default(), PixelBuffer::Gray16(image));
        Self {
            metadata: ImageMetadata {
                width,
                height,
                n_series: 1,
                planes: PlaneCounts { z: 1, t: 1, c: 1 },
                pixel_type: PixelType::U16,
                physical_pixel_size_unit: "px".to_owned(),
            },
            planes,
        }
    }

    /// Add (or replace) a plane, growing the plane counts to cover it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if the buffer size differs
    /// from the image size.
    pub fn with_plane(mut self, plane: PlaneId, buffer: PixelBuffer) -> Result<Self, PipelineError> {
        if buffer.dimensions() != self.metadata.dimensions() {
            return Err(PipelineError::InvalidConfig(format!(
                "plane {plane} is {}x{}, image is {}x{}",
                buffer.dimensions().width,
                buffer.dimensions().height,
                self.metadata.width,
                self.metadata.height
            )));
        }
        let counts = &mut self.metadata.planes;
        counts.z = counts.z.max(plane.z + 1);
        counts.t = counts.t.max(plane.t + 1);
        counts.c = counts.c.max(plane.c + 1);
        self.metadata.n_series = self.metadata.n_series.max(plane.series + 1);
        self.planes.insert(plane, buffer);
        Ok(self)
    }
}

/// [`ImageIo`] over images registered by path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryImageIo {
    images: HashMap<PathBuf, Arc<InMemoryImage>>,
}

impl InMemoryImageIo {
    /// No images.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image under `path`.
    pub fn insert(&mut self, path: impl Into<PathBuf>, image: InMemoryImage) {
        self.images.insert(path.into(), Arc::new(image));
    }
}

impl ImageIo for InMemoryImageIo {
    type Handle = Arc<InMemoryImage>;

    fn open_image(&self, path: &Path) -> Result<Self::Handle, PipelineError> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::External(format!("no image at {}", path.display())))
    }

    fn metadata(&self, handle: &Self::Handle) -> Result<ImageMetadata, PipelineError> {
        Ok(handle.metadata.clone())
    }

    fn read_tile(
        &self,
        handle: &Self::Handle,
        plane: PlaneId,
        tile: &TileInfo,
    ) -> Result<ImagePlane, PipelineError> {
        let buffer = handle
            .planes
            .get(&plane)
            .ok_or_else(|| PipelineError::External(format!("image has no plane {plane}")))?;
        ImagePlane::new(crop_buffer(buffer, tile.region), plane)
    }
}

/// Copy a region out of a pixel buffer.
#[must_use]
pub fn crop_buffer(buffer: &PixelBuffer, region: BoundingBox) -> PixelBuffer {
    use image::GenericImageView;
    let (x, y, w, h) = (region.x, region.y, region.width, region.height);
    match buffer {
        PixelBuffer::Gray8(img) => PixelBuffer::Gray8(img.view(x, y, w, h).to_image()),
        PixelBuffer::Gray16(img) => PixelBuffer::Gray16(img.view(x, y, w, h).to_image()),
        PixelBuffer::Gray32F(img) => PixelBuffer::Gray32F(img.view(x, y, w, h).to_image()),
        PixelBuffer::Rgb8(img) => PixelBuffer::Rgb8(img.view(x, y, w, h).to_image()),
    }
}
