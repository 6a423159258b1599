//! imagec-pipeline: Typed pipeline execution for tiled microscopy images
//! (sans-IO).
//!
//! An analysis is a list of images and a list of pipelines. Each pipeline
//! is an ordered list of commands; every command declares which artifact
//! kinds it accepts (image, binary mask, object list) and what it
//! produces, and a configuration whose kinds do not line up is refused
//! before any pixel is read.
//!
//! Images are processed as iterations (tile × time point × focal plane).
//! Each iteration runs every pipeline in order against one shared object
//! list, then hands the user-class objects, their measurements, and the
//! validity flags raised along the way to a [`ResultsSink`], atomically
//! per tile.
//!
//! This crate has **no I/O dependencies**: image reading goes through an
//! [`ImageIo`], AI models through a [`ModelLoader`], and results through
//! a [`ResultsSink`]. Filesystem-backed implementations live in `imagec`.

pub mod analysis;
pub mod artifact;
pub mod cache;
pub mod class_id;
pub mod command;
pub mod commands;
pub mod context;
pub mod contour;
pub mod diagnostics;
pub mod executor;
pub mod factory;
pub mod filters;
pub mod image_plane;
pub mod io;
pub mod measurement;
pub mod object;
pub mod object_list;
pub mod pipeline;
pub mod raster;
pub mod sink;
pub mod spatial;
pub mod step;
pub mod tile;
pub mod types;
pub mod validate;
pub mod validity;

pub use analysis::{AnalysisConfig, ImageEntry, ImageSetup, PlateSetup};
pub use artifact::{ArtifactKind, ArtifactSet, InOut, OutputKind};
pub use cache::{CacheScope, MemoryIdx, MemoryKey};
pub use class_id::{ClassId, ClassIdIn};
pub use command::Command;
pub use diagnostics::{CompileLog, RunReport, Severity, TileReport};
pub use executor::{CancelToken, Executor, ExecutorOptions};
pub use factory::{CompiledPipeline, compile};
pub use image_plane::{ImagePlane, PixelType, PlaneId};
pub use io::{ImageIo, ImageMetadata, ModelLoader, TileInfo};
pub use object::{Object, ObjectId};
pub use pipeline::{Pipeline, PipelineSource};
pub use sink::{ControlImage, InMemorySink, ResultsSink, TileKey};
pub use step::{CommandSettings, PipelineStep};
pub use tile::TileOutcome;
pub use types::{Dimensions, PipelineError};
pub use validate::{check_pipelines, label_edges, type_check};
pub use validity::{Validity, ValidityFlag};
