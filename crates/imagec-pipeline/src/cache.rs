//! The image-memory cache.
//!
//! Two layers share one read/write surface:
//!
//! - [`MemoryCache`] holds `PERSISTENT` entries for a pipeline group (one
//!   image). It is shared across tile workers, so it is sharded with one
//!   lock per shard. Readers see the last committed value.
//! - [`TileCache`] holds `ITERATION` entries for one tile pass. It is
//!   owned by that tile's run and never crosses threads; dropping it is
//!   the tile-boundary flush.
//!
//! Reads check the iteration layer first, then the group layer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{BuildHasher, RandomState};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::class_id::ClassId;
use crate::image_plane::{ImagePlane, PlaneId};
use crate::object::Object;

/// A named image-memory slot from the settings.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryIdx {
    M01,
    M02,
    M03,
    M04,
    M05,
    M06,
    M07,
    M08,
    M09,
    M10,
    /// Pipeline-scoped register, cleared when the pipeline finishes.
    #[serde(rename = "TEMP_01")]
    #[strum(serialize = "TEMP_01")]
    Temp01,
    /// Pipeline-scoped register, cleared when the pipeline finishes.
    #[serde(rename = "TEMP_02")]
    #[strum(serialize = "TEMP_02")]
    Temp02,
}

impl MemoryIdx {
    /// Returns `true` for pipeline-scoped registers.
    #[must_use]
    pub const fn is_temp(self) -> bool {
        matches!(self, Self::Temp01 | Self::Temp02)
    }
}

/// Key of a cached image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryKey {
    /// A source plane read from image I/O for the current tile.
    Source(PlaneId),
    /// The zero plane of a `Blank` pipeline source.
    Blank,
    /// A slot written by an image-cache step.
    Slot(MemoryIdx),
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(plane) => write!(f, "source {plane}"),
            Self::Blank => write!(f, "blank"),
            Self::Slot(idx) => write!(f, "slot {idx}"),
        }
    }
}

/// Lifetime of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheScope {
    /// Flushed at the end of the tile pass.
    #[default]
    Iteration,
    /// Flushed at the end of the pipeline group.
    Persistent,
}

const SHARDS: usize = 8;

/// Group-level, thread-safe store of `PERSISTENT` entries.
#[derive(Debug)]
pub struct MemoryCache {
    hasher: RandomState,
    image_shards: [RwLock<HashMap<MemoryKey, Arc<ImagePlane>>>; SHARDS],
    objects: RwLock<BTreeMap<ClassId, Arc<Vec<Object>>>>,
}

impl MemoryCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: RandomState::new(),
            image_shards: std::array::from_fn(|_| RwLock::new(HashMap::new())),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, key: &MemoryKey) -> &RwLock<HashMap<MemoryKey, Arc<ImagePlane>>> {
        let index = (self.hasher.hash_one(key) as usize) % SHARDS;
        &self.image_shards[index]
    }

    fn store_image(&self, key: MemoryKey, plane: Arc<ImagePlane>) {
        self.shard(&key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, plane);
    }

    fn load_image(&self, key: &MemoryKey) -> Option<Arc<ImagePlane>> {
        self.shard(key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store_objects(&self, class_id: ClassId, objects: Arc<Vec<Object>>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_id, objects);
    }

    fn load_objects(&self, class_id: ClassId) -> Option<Arc<Vec<Object>>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class_id)
            .cloned()
    }

    /// Drop every entry (pipeline-group boundary).
    pub fn clear(&self) {
        for shard in &self.image_shards {
            shard.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of persistent image entries.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.image_shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-tile view of the cache: owns the `ITERATION` layer and reaches
/// through to the shared group layer.
#[derive(Debug)]
pub struct TileCache {
    group: Arc<MemoryCache>,
    images: HashMap<MemoryKey, Arc<ImagePlane>>,
    objects: BTreeMap<ClassId, Arc<Vec<Object>>>,
}

impl TileCache {
    /// A fresh iteration layer over `group`.
    #[must_use]
    pub fn new(group: Arc<MemoryCache>) -> Self {
        Self {
            group,
            images: HashMap::new(),
            objects: BTreeMap::new(),
        }
    }

    /// Park an image plane.
    ///
    /// An iteration write replaces any iteration entry under the same
    /// key. A persistent write also evicts the iteration entry so the
    /// next read sees the value just committed.
    pub fn store_image(&mut self, key: MemoryKey, plane: Arc<ImagePlane>, scope: CacheScope) {
        match scope {
            CacheScope::Iteration => {
                self.images.insert(key, plane);
            }
            CacheScope::Persistent => {
                self.images.remove(&key);
                self.group.store_image(key, plane);
            }
        }
    }

    /// Read an image plane.
    #[must_use]
    pub fn load_image(&self, key: &MemoryKey) -> Option<Arc<ImagePlane>> {
        self.images
            .get(key)
            .cloned()
            .or_else(|| self.group.load_image(key))
    }

    /// Park a snapshot of one class.
    pub fn store_objects(&mut self, class_id: ClassId, objects: Vec<Object>, scope: CacheScope) {
        let objects = Arc::new(objects);
        match scope {
            CacheScope::Iteration => {
                self.objects.insert(class_id, objects);
            }
            CacheScope::Persistent => {
                self.objects.remove(&class_id);
                self.group.store_objects(class_id, objects);
            }
        }
    }

    /// Read a parked class snapshot.
    #[must_use]
    pub fn load_objects(&self, class_id: ClassId) -> Option<Arc<Vec<Object>>> {
        self.objects
            .get(&class_id)
            .cloned()
            .or_else(|| self.group.load_objects(class_id))
    }

    /// Drop pipeline-scoped registers from the iteration layer.
    pub fn clear_temp(&mut self) {
        self.images
            .retain(|key, _| !matches!(key, MemoryKey::Slot(idx) if idx.is_temp()));
        self.objects.retain(|class, _| !class.is_temp());
    }

    /// Number of iteration-scoped image entries.
    #[must_use]
    pub fn iteration_image_count(&self) -> usize {
        self.images.len()
    }
}
