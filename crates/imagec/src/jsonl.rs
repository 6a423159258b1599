//! A [`ResultsSink`] writing newline-delimited JSON.
//!
//! Everything a tile hands over is staged in memory and written as one
//! `tile` record when the tile ends; an aborted tile writes nothing.
//! Validity updates are written as they arrive. Control images, if a
//! directory is configured, are saved as PNG files at commit time and
//! removed again if the tile record cannot be written.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use imagec_pipeline::measurement::Measurement;
use imagec_pipeline::object::IntensityAggregates;
use imagec_pipeline::types::BoundingBox;
use imagec_pipeline::sink::TileHandle;
use imagec_pipeline::{
    ClassId, ControlImage, MemoryKey, Object, ObjectId, PipelineError, PlaneId, ResultsSink,
    TileInfo, TileKey, Validity, ValidityFlag,
};
use serde::Serialize;
use strum::IntoEnumIterator;

/// One line of output.
#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// A committed tile.
    Tile {
        /// Tile identity.
        key: TileKey,
        /// Pixel region inside the image.
        region: BoundingBox,
        /// Published objects.
        objects: Vec<ObjectRecord>,
        /// Control image files written for the tile.
        control_images: Vec<PathBuf>,
    },
    /// Image-level validity bits.
    ImageValidity {
        /// Image identifier.
        image_id: u64,
        /// Flags set by this update.
        flags: Vec<ValidityFlag>,
    },
    /// Plane or plane-and-class validity bits.
    PlaneValidity {
        /// Image identifier.
        image_id: u64,
        /// Plane the flags apply to.
        plane: PlaneId,
        /// Class the flags apply to, if scoped to one.
        class_id: Option<ClassId>,
        /// Flags set by this update.
        flags: Vec<ValidityFlag>,
    },
}

/// An object with its shape measurements and intensity rows.
#[derive(Debug, Serialize)]
pub struct ObjectRecord {
    /// Object identifier.
    pub object_id: ObjectId,
    /// Class of the object.
    pub class_id: ClassId,
    /// Bounding box in tile coordinates.
    pub bbox: BoundingBox,
    /// Non-intensity measurements.
    pub values: BTreeMap<Measurement, f64>,
    /// Intensity aggregates per measured plane.
    pub intensities: Vec<IntensityRecord>,
}

/// Intensity aggregates on one plane.
#[derive(Debug, Serialize)]
pub struct IntensityRecord {
    /// Plane measured on.
    pub plane: MemoryKey,
    /// Aggregates.
    #[serde(flatten)]
    pub aggregates: IntensityAggregates,
}

impl ObjectRecord {
    fn new(object: &Object) -> Self {
        let values = Measurement::iter()
            .filter(|m| !m.is_intensity())
            .filter_map(|m| m.value(object, None).map(|v| (m, v)))
            .collect();
        Self {
            object_id: object.id(),
            class_id: object.class_id(),
            bbox: object.bbox(),
            values,
            intensities: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Staged {
    key: TileKey,
    region: BoundingBox,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    measurements: BTreeMap<(ObjectId, MemoryKey), IntensityAggregates>,
    control_images: Vec<ControlImage>,
}

#[derive(Debug)]
struct Inner<W> {
    writer: W,
    next_handle: u64,
    staged: HashMap<TileHandle, Staged>,
}

/// Writes committed results to `W`, one JSON record per line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    inner: Mutex<Inner<W>>,
    control_dir: Option<PathBuf>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// A sink writing to `writer` that drops control images.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(Inner {
                writer,
                next_handle: 0,
                staged: HashMap::new(),
            }),
            control_dir: None,
        }
    }

    /// Save control images into `dir`.
    #[must_use]
    pub fn with_control_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.control_dir = Some(dir.into());
        self
    }

    /// The writer, once the run is over.
    pub fn into_inner(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .writer
    }

    fn lock(&self) -> MutexGuard<'_, Inner<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staged<'a>(
        inner: &'a mut Inner<W>,
        tile: TileHandle,
    ) -> Result<&'a mut Staged, PipelineError> {
        inner
            .staged
            .get_mut(&tile)
            .ok_or_else(|| PipelineError::External(format!("unknown tile handle {}", tile.get())))
    }

    /// One record as a complete line, so a failed write never leaves a
    /// record half serialized.
    fn encode(record: &Record) -> Result<Vec<u8>, PipelineError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| PipelineError::External(format!("serializing record: {e}")))?;
        line.push(b'\n');
        Ok(line)
    }

    fn write(writer: &mut W, record: &Record) -> Result<(), PipelineError> {
        let line = Self::encode(record)?;
        writer
            .write_all(&line)
            .map_err(|e| PipelineError::External(format!("writing record: {e}")))
    }

    fn control_paths(&self, key: &TileKey, images: &[ControlImage]) -> Vec<PathBuf> {
        let Some(dir) = &self.control_dir else {
            return Vec::new();
        };
        images
            .iter()
            .map(|control| {
                dir.join(format!(
                    "{}_{}_{}_{}_{}.png",
                    key.image_id, key.tile_x, key.tile_y, key.t_stack, control.name
                ))
            })
            .collect()
    }

    /// Save `images` to `paths`; on failure nothing saved here remains.
    fn save_control_images(
        &self,
        images: &[ControlImage],
        paths: &[PathBuf],
    ) -> Result<(), PipelineError> {
        let Some(dir) = &self.control_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| PipelineError::External(format!("{}: {e}", dir.display())))?;
        for (i, (control, path)) in images.iter().zip(paths).enumerate() {
            if let Err(e) = control.image.save(path) {
                remove_files(&paths[..=i]);
                return Err(PipelineError::External(format!("{}: {e}", path.display())));
            }
        }
        Ok(())
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), %error, "control image left behind");
            }
            _ => {}
        }
    }
}

fn flags(validity: Validity) -> Vec<ValidityFlag> {
    validity.flags().collect()
}

impl<W: Write + Send> ResultsSink for JsonLinesSink<W> {
    fn begin_tile(&self, key: &TileKey, info: &TileInfo) -> Result<TileHandle, PipelineError> {
        let mut inner = self.lock();
        inner.next_handle += 1;
        let handle = TileHandle::new(inner.next_handle);
        inner.staged.insert(
            handle,
            Staged {
                key: *key,
                region: info.region,
                objects: BTreeMap::new(),
                measurements: BTreeMap::new(),
                control_images: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn write_object(&self, tile: TileHandle, object: &Object) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        Self::staged(&mut inner, tile)?
            .objects
            .insert(object.id(), ObjectRecord::new(object));
        Ok(())
    }

    fn write_measurement(
        &self,
        tile: TileHandle,
        object: ObjectId,
        plane: &MemoryKey,
        aggregates: &IntensityAggregates,
    ) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        Self::staged(&mut inner, tile)?
            .measurements
            .insert((object, *plane), *aggregates);
        Ok(())
    }

    fn set_image_validity(&self, image_id: u64, validity: Validity) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        Self::write(
            &mut inner.writer,
            &Record::ImageValidity {
                image_id,
                flags: flags(validity),
            },
        )
    }

    fn end_tile(&self, tile: TileHandle) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        let mut staged = inner
            .staged
            .remove(&tile)
            .ok_or_else(|| PipelineError::External(format!("unknown tile handle {}", tile.get())))?;
        for ((object, plane), aggregates) in staged.measurements {
            if let Some(record) = staged.objects.get_mut(&object) {
                record.intensities.push(IntensityRecord { plane, aggregates });
            }
        }
        let paths = self.control_paths(&staged.key, &staged.control_images);
        let line = Self::encode(&Record::Tile {
            key: staged.key,
            region: staged.region,
            objects: staged.objects.into_values().collect(),
            control_images: paths.clone(),
        })?;
        self.save_control_images(&staged.control_images, &paths)?;
        let written = inner.writer.write_all(&line);
        let flushed = written.and_then(|()| inner.writer.flush());
        if let Err(e) = flushed {
            remove_files(&paths);
            return Err(PipelineError::External(format!("writing tile record: {e}")));
        }
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
        let mut inner = self.lock();
        Self::write(
            &mut inner.writer,
            &Record::PlaneValidity {
                image_id,
                plane,
                class_id,
                flags: flags(validity),
            },
        )
    }

    fn write_control_image(
        &self,
        tile: TileHandle,
        image: &ControlImage,
    ) -> Result<(), PipelineError> {
        let mut inner = self.lock();
        Self::staged(&mut inner, tile)?
            .control_images
            .push(image.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};
    use imagec_pipeline::Dimensions;

    fn key() -> TileKey {
        TileKey {
            plate_id: 1,
            group_id: 2,
            image_id: 3,
            tile_x: 0,
            tile_y: 1,
            t_stack: 0,
        }
    }

    fn object(id: u64) -> Object {
        let mask = GrayImage::from_pixel(2, 2, Luma([255]));
        Object::from_local_mask(
            ObjectId::new(id),
            ClassId::new(1),
            PlaneId::default(),
            BoundingBox::new(4, 4, 2, 2),
            mask,
            1.0,
        )
    }

    fn lines(sink: JsonLinesSink<Vec<u8>>) -> Vec<serde_json::Value> {
        String::from_utf8(sink.into_inner())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn committed_tile_is_one_record() {
        let sink = JsonLinesSink::new(Vec::new());
        let info = TileInfo::whole(Dimensions::new(16, 16));
        let handle = sink.begin_tile(&key(), &info).unwrap();
        sink.write_object(handle, &object(7)).unwrap();
        let aggregates = IntensityAggregates {
            sum: 40.0,
            avg: 10.0,
            min: 10.0,
            max: 10.0,
        };
        let plane = MemoryKey::Source(PlaneId::default());
        sink.write_measurement(handle, ObjectId::new(7), &plane, &aggregates)
            .unwrap();
        sink.end_tile(handle).unwrap();

        let records = lines(sink);
        assert_eq!(records.len(), 1);
        let tile = &records[0];
        assert_eq!(tile["record"], "tile");
        assert_eq!(tile["key"]["image_id"], 3);
        let obj = &tile["objects"][0];
        assert_eq!(obj["object_id"], 7);
        assert_eq!(obj["values"]["AREA_SIZE"], 4.0);
        assert_eq!(obj["intensities"][0]["avg"], 10.0);
    }

    #[test]
    fn aborted_tile_writes_nothing() {
        let sink = JsonLinesSink::new(Vec::new());
        let handle = sink
            .begin_tile(&key(), &TileInfo::whole(Dimensions::new(4, 4)))
            .unwrap();
        sink.write_object(handle, &object(1)).unwrap();
        sink.abort_tile(handle);
        assert!(sink.end_tile(handle).is_err());
        assert!(lines(sink).is_empty());
    }

    #[test]
    fn validity_records_list_flags() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.set_image_validity(3, Validity::default().with(ValidityFlag::PossibleNoise))
            .unwrap();
        let records = lines(sink);
        assert_eq!(records[0]["record"], "image_validity");
        assert_eq!(records[0]["flags"][0], "POSSIBLE_NOISE");
    }

    #[test]
    fn control_images_are_saved_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(Vec::new()).with_control_dir(dir.path());
        let handle = sink
            .begin_tile(&key(), &TileInfo::whole(Dimensions::new(4, 4)))
            .unwrap();
        let control = ControlImage {
            name: "overlay".into(),
            image: RgbImage::new(4, 4),
        };
        sink.write_control_image(handle, &control).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        sink.end_tile(handle).unwrap();
        assert!(dir.path().join("3_0_1_0_overlay.png").exists());
    }

    /// Accepts nothing.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_commit_removes_its_control_images() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(FullDisk).with_control_dir(dir.path());
        let handle = sink
            .begin_tile(&key(), &TileInfo::whole(Dimensions::new(4, 4)))
            .unwrap();
        let control = ControlImage {
            name: "ctl".into(),
            image: RgbImage::new(4, 4),
        };
        sink.write_control_image(handle, &control).unwrap();

        let err = sink.end_tile(handle).unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
