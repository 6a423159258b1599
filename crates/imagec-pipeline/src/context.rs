//! Per-tile process context.
//!
//! A [`ProcessContext`] is what a command sees besides its active
//! artifacts: the pipeline it belongs to, the tile it runs on, the cache,
//! the validity being accumulated, and the run log. It borrows two
//! pieces: a read-only [`TileEnv`] shared by every pipeline of the tile
//! iteration, and the mutable [`TileState`] that carries across those
//! pipelines. Neither crosses threads.

use std::sync::Arc;

use crate::cache::{CacheScope, MemoryKey, TileCache};
use crate::class_id::{ClassId, ClassIdIn};
use crate::diagnostics::{RunLogEntry, Severity};
use crate::image_plane::{ImagePlane, PlaneId};
use crate::io::TileInfo;
use crate::object::{Object, ObjectId, ObjectIdGenerator};
use crate::sink::ControlImage;
use crate::types::{Dimensions, PipelineError};
use crate::validity::{TileValidity, ValidityFlag, ValidityScope};

/// Loads other channels of the tile being processed.
pub trait PlaneLoader {
    /// Read `plane` for the current tile.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] if image I/O fails.
    fn load_plane(&self, plane: PlaneId) -> Result<ImagePlane, PipelineError>;
}

/// Which image a tile belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageIdentity {
    /// Plate identifier.
    pub plate_id: u64,
    /// Group (well) identifier.
    pub group_id: u64,
    /// Image identifier.
    pub image_id: u64,
}

/// Read-only facts about one tile iteration.
pub struct TileEnv<'a> {
    /// Image the tile belongs to.
    pub identity: ImageIdentity,
    /// Tile geometry.
    pub tile: TileInfo,
    /// Series, Z, and T of the iteration (channel 0).
    pub plane: PlaneId,
    /// Object identifier source.
    pub ids: &'a ObjectIdGenerator,
    /// Source of other channels.
    pub loader: &'a dyn PlaneLoader,
}

impl std::fmt::Debug for TileEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileEnv")
            .field("identity", &self.identity)
            .field("tile", &self.tile)
            .field("plane", &self.plane)
            .finish_non_exhaustive()
    }
}

/// Mutable state that lives for one tile iteration.
#[derive(Debug)]
pub struct TileState {
    /// Iteration layer of the cache.
    pub cache: TileCache,
    /// Validity accumulated so far.
    pub validity: TileValidity,
    /// Warnings raised so far.
    pub log: Vec<RunLogEntry>,
    /// Control images rendered so far.
    pub control_images: Vec<ControlImage>,
}

impl TileState {
    /// Fresh state over a cache layer.
    #[must_use]
    pub fn new(cache: TileCache) -> Self {
        Self {
            cache,
            validity: TileValidity::default(),
            log: Vec::new(),
            control_images: Vec::new(),
        }
    }
}

/// Everything a command may touch besides its active artifacts.
#[derive(Debug)]
pub struct ProcessContext<'a> {
    env: &'a TileEnv<'a>,
    state: &'a mut TileState,
    pipeline: &'a str,
    default_class: ClassId,
    source_key: MemoryKey,
    grayscale: bool,
    step: usize,
}

impl<'a> ProcessContext<'a> {
    /// Context for one pipeline within a tile iteration.
    #[must_use]
    pub fn new(
        env: &'a TileEnv<'a>,
        state: &'a mut TileState,
        pipeline: &'a str,
        default_class: ClassId,
        source_key: MemoryKey,
    ) -> Self {
        Self {
            env,
            state,
            pipeline,
            default_class,
            source_key,
            grayscale: false,
            step: 0,
        }
    }

    // --- identity ---

    /// Name of the running pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &str {
        self.pipeline
    }

    /// The pipeline's default class.
    #[must_use]
    pub const fn default_class(&self) -> ClassId {
        self.default_class
    }

    /// Resolve a class reference against the pipeline default.
    #[must_use]
    pub const fn resolve(&self, class: ClassIdIn) -> ClassId {
        class.resolve(self.default_class)
    }

    /// Image the tile belongs to.
    #[must_use]
    pub const fn identity(&self) -> ImageIdentity {
        self.env.identity
    }

    /// Tile geometry.
    #[must_use]
    pub const fn tile(&self) -> &TileInfo {
        &self.env.tile
    }

    /// Pixel dimensions of the tile.
    #[must_use]
    pub const fn tile_dimensions(&self) -> Dimensions {
        self.env.tile.dimensions()
    }

    /// Series, Z, and T of the iteration.
    #[must_use]
    pub const fn plane(&self) -> PlaneId {
        self.env.plane
    }

    /// Cache key of the pipeline's source plane.
    #[must_use]
    pub const fn source_key(&self) -> MemoryKey {
        self.source_key
    }

    /// Zero-based index of the executing step.
    #[must_use]
    pub const fn step(&self) -> usize {
        self.step
    }

    pub(crate) const fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    /// Returns `true` once a color filter has reduced the pipeline to
    /// grayscale.
    #[must_use]
    pub const fn is_grayscale(&self) -> bool {
        self.grayscale
    }

    /// Mark the pipeline as grayscale from here on.
    pub const fn set_grayscale(&mut self) {
        self.grayscale = true;
    }

    /// Issue a fresh object identifier.
    pub fn next_id(&self) -> ObjectId {
        self.env.ids.next_id()
    }

    // --- cache ---

    /// Read a cached plane.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingArtifact`] if nothing is cached
    /// under `key`.
    pub fn load_image(&self, key: &MemoryKey) -> Result<Arc<ImagePlane>, PipelineError> {
        self.state
            .cache
            .load_image(key)
            .ok_or_else(|| PipelineError::MissingArtifact {
                step: self.step,
                key: key.to_string(),
            })
    }

    /// Park a plane in the cache.
    pub fn store_image(&mut self, key: MemoryKey, plane: Arc<ImagePlane>, scope: CacheScope) {
        self.state.cache.store_image(key, plane, scope);
    }

    /// Read a cached class snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingArtifact`] if the class was never
    /// parked.
    pub fn load_objects(&self, class_id: ClassId) -> Result<Arc<Vec<Object>>, PipelineError> {
        self.state
            .cache
            .load_objects(class_id)
            .ok_or_else(|| PipelineError::MissingArtifact {
                step: self.step,
                key: format!("objects of class {class_id}"),
            })
    }

    /// Park a class snapshot in the cache.
    pub fn store_objects(&mut self, class_id: ClassId, objects: Vec<Object>, scope: CacheScope) {
        self.state.cache.store_objects(class_id, objects, scope);
    }

    /// The pipeline's source plane, or another channel of it.
    ///
    /// Source planes are read through image I/O on first use and parked
    /// in the iteration cache under [`MemoryKey::Source`]. Once the
    /// pipeline is grayscale, RGB planes are returned as luminance.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingArtifact`] if the pipeline source
    /// is a memory slot that was never written, or
    /// [`PipelineError::External`] if image I/O fails.
    pub fn load_source(&mut self, channel: Option<u32>) -> Result<Arc<ImagePlane>, PipelineError> {
        let key = match (channel, self.source_key) {
            (Some(c), _) => MemoryKey::Source(self.env.plane.with_channel(c)),
            (None, key) => key,
        };
        let plane = match self.state.cache.load_image(&key) {
            Some(plane) => plane,
            None => match key {
                MemoryKey::Source(id) => {
                    let plane = Arc::new(self.env.loader.load_plane(id)?);
                    self.state
                        .cache
                        .store_image(key, Arc::clone(&plane), CacheScope::Iteration);
                    plane
                }
                _ => return self.load_image(&key),
            },
        };
        if self.grayscale && plane.is_rgb() {
            return Ok(Arc::new(plane.derive_gray16(plane.to_gray16())?));
        }
        Ok(plane)
    }

    // --- validity and logging ---

    /// Record a validity flag at `scope` for `class_id` on this plane.
    pub fn mark_validity(&mut self, scope: ValidityScope, flag: ValidityFlag, class_id: ClassId) {
        let plane = self.env.plane;
        self.state.validity.mark(scope, flag, plane, class_id);
    }

    /// Validity accumulated so far in this tile iteration.
    #[must_use]
    pub const fn validity(&self) -> &TileValidity {
        &self.state.validity
    }

    /// Record a warning in the run log.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(Severity::Warning, message.into());
    }

    /// Record a note in the run log.
    pub fn info(&mut self, message: impl Into<String>) {
        self.log(Severity::Info, message.into());
    }

    fn log(&mut self, severity: Severity, message: String) {
        match severity {
            Severity::Info => tracing::debug!(
                pipeline = self.pipeline,
                step = self.step,
                "{message}"
            ),
            Severity::Warning | Severity::Error => tracing::warn!(
                pipeline = self.pipeline,
                step = self.step,
                "{message}"
            ),
        }
        self.state.log.push(RunLogEntry {
            severity,
            pipeline: self.pipeline.to_owned(),
            step: Some(self.step),
            message,
        });
    }

    /// Hand a rendered control image to the publisher.
    pub fn push_control_image(&mut self, image: ControlImage) {
        self.state.control_images.push(image);
    }
}
