//! The results sink: where published tiles go.
//!
//! The executor opens a tile, streams its objects and measurements,
//! and commits with [`ResultsSink::end_tile`]. Nothing a sink stages is
//! visible until that commit; a failed or aborted tile leaves no trace.
//! [`InMemorySink`] implements the full contract for tests and
//! embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::cache::MemoryKey;
use crate::class_id::ClassId;
use crate::image_plane::PlaneId;
use crate::io::TileInfo;
use crate::object::{IntensityAggregates, Object, ObjectId};
use crate::types::PipelineError;
use crate::validity::Validity;

/// Identity of a published tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    /// Plate identifier.
    pub plate_id: u64,
    /// Group (well) identifier.
    pub group_id: u64,
    /// Image identifier.
    pub image_id: u64,
    /// Tile column.
    pub tile_x: u32,
    /// Tile row.
    pub tile_y: u32,
    /// Time point.
    pub t_stack: u32,
}

/// Opaque handle of a tile between `begin_tile` and `end_tile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileHandle(u64);

impl TileHandle {
    /// Wrap a sink-chosen raw handle.
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

/// A rendered control image from a save-image step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlImage {
    /// Suggested file name, without directory.
    pub name: String,
    /// Rendered pixels.
    pub image: RgbImage,
}

/// Destination of published results.
///
/// All methods take `&self`; implementations synchronise internally
/// because tiles may be published from several workers.
pub trait ResultsSink: Send + Sync {
    /// Open a tile for writing.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] if the sink cannot accept it.
    fn begin_tile(&self, key: &TileKey, info: &TileInfo) -> Result<TileHandle, PipelineError>;

    /// Stage one object. Writing the same object id twice within a tile
    /// replaces the earlier write.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure.
    fn write_object(&self, tile: TileHandle, object: &Object) -> Result<(), PipelineError>;

    /// Stage one intensity measurement of an object.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure.
    fn write_measurement(
        &self,
        tile: TileHandle,
        object: ObjectId,
        plane: &MemoryKey,
        aggregates: &IntensityAggregates,
    ) -> Result<(), PipelineError>;

    /// OR validity bits into an image record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure.
    fn set_image_validity(&self, image_id: u64, validity: Validity) -> Result<(), PipelineError>;

    /// Commit everything staged for the tile.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure, in which case the
    /// staged data is discarded.
    fn end_tile(&self, tile: TileHandle) -> Result<(), PipelineError>;

    /// Discard everything staged for the tile.
    fn abort_tile(&self, _tile: TileHandle) {}

    /// OR validity bits into a plane (or plane and class) record.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure.
    fn set_plane_validity(
        &self,
        _image_id: u64,
        _plane: PlaneId,
        _class_id: Option<ClassId>,
        _validity: Validity,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Stage a control image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::External`] on failure.
    fn write_control_image(
        &self,
        _tile: TileHandle,
        _image: &ControlImage,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

// ───── In-memory sink ──────────────────────────────────────────────

/// One intensity measurement row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRow {
    /// Measured object.
    pub object: ObjectId,
    /// Measured plane.
    pub plane: MemoryKey,
    /// Aggregates.
    pub aggregates: IntensityAggregates,
}

/// A tile as committed to an [`InMemorySink`].
#[derive(Debug, Clone)]
pub struct CommittedTile {
    /// Tile identity.
    pub key: TileKey,
    /// Tile geometry.
    pub info: TileInfo,
    /// Objects in id order.
    pub objects: Vec<Object>,
    /// Measurements in `(object, plane)` order.
    pub measurements: Vec<MeasurementRow>,
    /// Control images in write order.
    pub control_images: Vec<ControlImage>,
}

#[derive(Debug)]
struct Staged {
    key: TileKey,
    info: TileInfo,
    objects: BTreeMap<ObjectId, Object>,
    measurements: BTreeMap<(ObjectId, MemoryKey), IntensityAggregates>,
    control_images: Vec<ControlImage>,
}

#[derive(Debug, Default)]
struct SinkState {
    next_handle: u64,
    staged: HashMap<TileHandle, Staged>,
    committed: Vec<CommittedTile>,
    image_validity: BTreeMap<u64, Validity>,
    plane_validity: BTreeMap<(u64, PlaneId, Option<ClassId>), Validity>,
}

/// A [`ResultsSink`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<SinkState>,
    fail_commits: AtomicBool,
}

impl InMemorySink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `end_tile` fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed tiles in commit order.
    #[must_use]
    pub fn tiles(&self) -> Vec<CommittedTile> {
        self.lock().committed.clone()
    }

    /// Every committed object, tile by tile.
    #[must_use]
    pub fn objects(&self) -> Vec<Object> {
        self.lock()
            .committed
            .iter()
            .flat_map(|t| t.objects.iter().cloned())
            .collect()
    }

    /// Committed objects of one class.
    #[must_use]
    pub fn objects_of(&self, class_id: ClassId) -> Vec<Object> {
        self.objects()
            .into_iter()
            .filter(|o| o.class_id() == class_id)
            .collect()
    }

    /// Every committed measurement row.
    #[must_use]
    pub fn measurements(&self) -> Vec<MeasurementRow> {
        self.lock()
            .committed
            .iter()
            .flat_map(|t| t.measurements.iter().copied())
            .collect()
    }

    /// Image-level validity (empty if never set).
    #[must_use]
    pub fn image_validity(&self, image_id: u64) -> Validity {
        self.lock()
            .image_validity
            .get(&image_id)
            .copied()
            .unwrap_or_default()
    }

    /// Plane-level (or plane and class level) validity.
    #[must_use]
    pub fn plane_validity(&self, image_id: u64, plane: PlaneId, class_id: Option<ClassId>) -> Validity {
        self.lock()
            .plane_validity
            .get(&(image_id, plane, class_id))
            .copied()
            .unwrap_or_default()
    }

    /// Number of tiles opened but neither committed nor aborted.
    #[must_use]
    pub fn open_tiles(&self) -> usize {
        self.lock().staged.len()
    }
}

fn unknown_handle(tile: TileHandle) -> PipelineError {
    PipelineError::External(format!("unknown tile handle {}", tile.get()))
}

impl ResultsSink for InMemorySink {
    fn begin_tile(&self, key: &TileKey, info: &TileInfo) -> Result<TileHandle, PipelineError> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = TileHandle(state.next_handle);
        state.staged.insert(
            handle,
            Staged {
                key: *key,
                info: *info,
                objects: BTreeMap::new(),
                measurements: BTreeMap::new(),
                control_images: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn write_object(&self, tile: TileHandle, object: &Object) -> Result<(), PipelineError> {
        let mut state = self.lock();
        let staged = state.staged.get_mut(&tile).ok_or_else(|| unknown_handle(tile))?;
        staged.objects.insert(object.id(), object.clone());
        Ok(())
    }

    fn write_measurement(
        &self,
        tile: TileHandle,
        object: ObjectId,
        plane: &MemoryKey,
        aggregates: &IntensityAggregates,
    ) -> Result<(), PipelineError> {
        let mut state = self.lock();
        let staged = state.staged.get_mut(&tile).ok_or_else(|| unknown_handle(tile))?;
        staged.measurements.insert((object, *plane), *aggregates);
        Ok(())
    }

    fn set_image_validity(&self, image_id: u64, validity: Validity) -> Result<(), PipelineError> {
        *self.lock().image_validity.entry(image_id).or_default() |= validity;
        Ok(())
    }

    fn end_tile(&self, tile: TileHandle) -> Result<(), PipelineError> {
        let mut state = self.lock();
        let staged = state.staged.remove(&tile).ok_or_else(|| unknown_handle(tile))?;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(PipelineError::External(format!(
                "commit of tile {} refused",
                tile.get()
            )));
        }
        state.committed.push(CommittedTile {
            key: staged.key,
            info: staged.info,
            objects: staged.objects.into_values().collect(),
            measurements: staged
                .measurements
                .into_iter()
                .map(|((object, plane), aggregates)| MeasurementRow {
                    object,
                    plane,
                    aggregates,
                })
                .collect(),
            control_images: staged.control_images,
        });
        Ok(())
    }

    fn abort_tile(&self, tile: TileHandle) {
        self.lock().staged.remove(&tile);
    }

    fn set_plane_validity(
        &self,
        image_id: u64,
        plane: PlaneId,
        class_id: Option<ClassId>,
        validity: Validity,
    ) -> Result<(), PipelineError> {
        *self
            .lock()
            .plane_validity
            .entry((image_id, plane, class_id))
            .or_default() |= validity;
        Ok(())
    }

    fn write_control_image(
        &self,
        tile: TileHandle,
        image: &ControlImage,
    ) -> Result<(), PipelineError> {
        let mut state = self.lock();
        let staged = state.staged.get_mut(&tile).ok_or_else(|| unknown_handle(tile))?;
        staged.control_images.push(image.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::object::tests::square;
    use crate::types::Dimensions;
    use crate::validity::ValidityFlag;

    fn key() -> TileKey {
        TileKey {
            plate_id: 1,
            group_id: 2,
            image_id: 3,
            tile_x: 0,
            tile_y: 0,
            t_stack: 0,
        }
    }

    fn info() -> TileInfo {
        TileInfo::whole(Dimensions::new(16, 16))
    }

    #[test]
    fn nothing_visible_before_commit() {
        let sink = InMemorySink::new();
        let tile = sink.begin_tile(&key(), &info()).unwrap();
        sink.write_object(tile, &square(1, 1, 0, 0, 2)).unwrap();
        assert!(sink.objects().is_empty());
        assert_eq!(sink.open_tiles(), 1);
        sink.end_tile(tile).unwrap();
        assert_eq!(sink.objects().len(), 1);
        assert_eq!(sink.open_tiles(), 0);
    }

    #[test]
    fn object_writes_are_idempotent() {
        let sink = InMemorySink::new();
        let tile = sink.begin_tile(&key(), &info()).unwrap();
        let obj = square(4, 1, 0, 0, 2);
        sink.write_object(tile, &obj).unwrap();
        sink.write_object(tile, &obj).unwrap();
        sink.end_tile(tile).unwrap();
        assert_eq!(sink.objects().len(), 1);
    }

    #[test]
    fn aborted_and_failed_tiles_leave_no_trace() {
        let sink = InMemorySink::new();
        let a = sink.begin_tile(&key(), &info()).unwrap();
        sink.write_object(a, &square(1, 1, 0, 0, 2)).unwrap();
        sink.abort_tile(a);

        sink.fail_commits(true);
        let b = sink.begin_tile(&key(), &info()).unwrap();
        sink.write_object(b, &square(2, 1, 0, 0, 2)).unwrap();
        assert!(sink.end_tile(b).is_err());

        assert!(sink.tiles().is_empty());
        assert_eq!(sink.open_tiles(), 0);
        assert!(sink.write_object(a, &square(3, 1, 0, 0, 2)).is_err());
    }

    #[test]
    fn validity_is_or_merged() {
        let sink = InMemorySink::new();
        sink.set_image_validity(3, ValidityFlag::PossibleNoise.into()).unwrap();
        sink.set_image_validity(3, ValidityFlag::Invalid.into()).unwrap();
        let v = sink.image_validity(3);
        assert!(v.contains(ValidityFlag::PossibleNoise));
        assert!(v.contains(ValidityFlag::Invalid));
        assert!(sink.image_validity(4).is_empty());
    }
}
