//! Runs an analysis over its images.
//!
//! The executor checks and compiles the configuration once, then walks
//! every image: open it, plan its iterations (tile × T × Z), and run each
//! iteration through the tile state machine. All iterations of an image
//! share one group cache layer, so `PERSISTENT` cache entries written by
//! one tile are visible to the tiles after it.
//!
//! With `parallel_tiles > 1` the iterations of an image are pulled by a
//! fixed set of scoped worker threads. Tile reports are put back into
//! plan order afterwards, and object identifiers are derived from the
//! iteration index, so the output does not depend on scheduling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::analysis::{AnalysisConfig, ImageEntry, Iteration, ZProjection};
use crate::cache::{MemoryCache, TileCache};
use crate::command::BuildEnv;
use crate::context::{ImageIdentity, PlaneLoader, TileEnv};
use crate::diagnostics::{ImageValidity, RunReport, SkippedImage, TileReport};
use crate::factory::{CompiledPipeline, compile};
use crate::image_plane::{Gray16Image, ImagePlane, PlaneId};
use crate::io::{ImageIo, ModelLoader, TileInfo};
use crate::object::ObjectIdGenerator;
use crate::sink::{ResultsSink, TileKey};
use crate::tile::{Deadline, TileJob, run_tile};
use crate::types::PipelineError;
use crate::validity::Validity;

/// Object identifiers of one iteration live in their own block of this
/// many values.
const IDS_PER_ITERATION: u64 = 1 << 32;

/// Cooperative cancellation shared between a caller and the executor.
///
/// Firing the token stops new tiles from starting; running tiles stop at
/// their next step boundary and are reported as aborted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Scheduling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Tiles of one image processed concurrently (at least 1).
    pub parallel_tiles: usize,
    /// Wall-clock budget of a single tile iteration.
    pub tile_timeout: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallel_tiles: 1,
            tile_timeout: None,
        }
    }
}

/// Runs analyses against an image reader and a results sink.
pub struct Executor<'a, I: ImageIo> {
    io: &'a I,
    sink: &'a dyn ResultsSink,
    models: Option<&'a dyn ModelLoader>,
    options: ExecutorOptions,
    cancel: CancelToken,
}

impl<I: ImageIo> std::fmt::Debug for Executor<'_, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl<'a, I: ImageIo> Executor<'a, I> {
    /// An executor with default options and no model loader.
    #[must_use]
    pub fn new(io: &'a I, sink: &'a dyn ResultsSink) -> Self {
        Self {
            io,
            sink,
            models: None,
            options: ExecutorOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Use `models` to build AI classifier steps.
    #[must_use]
    pub fn with_models(mut self, models: &'a dyn ModelLoader) -> Self {
        self.models = Some(models);
        self
    }

    /// Replace the scheduling options.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Observe `cancel` instead of a private token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle that cancels this executor's runs.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Check, compile, and run `config`.
    ///
    /// Images that cannot be opened or planned, or whose tile worker
    /// panicked, are listed in [`RunReport::skipped`]; the run continues
    /// with the next image.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ConfigRejected`] if the configuration
    /// check reports an error, or whatever compiling a step fails with.
    #[tracing::instrument(skip_all, fields(images = config.images.len()))]
    pub fn run(&self, config: &AnalysisConfig) -> Result<RunReport, PipelineError> {
        let checked = config.check();
        if checked.has_errors() {
            tracing::warn!(errors = checked.error_count(), "configuration rejected");
            return Err(PipelineError::ConfigRejected(checked));
        }
        let env = BuildEnv {
            models: self.models,
        };
        let (compiled, _) = compile(&config.pipelines, &env)?;

        let mut report = RunReport {
            compile_log: checked,
            ..RunReport::default()
        };
        for entry in &config.images {
            if self.cancel.is_cancelled() {
                break;
            }
            let first_index = report.tiles.len();
            let tiles = match self.run_image(config, &compiled, entry, first_index) {
                Ok(tiles) => tiles,
                Err(PipelineError::External(msg) | PipelineError::InvalidConfig(msg)) => {
                    tracing::warn!(
                        image = entry.image_id,
                        path = %entry.path.display(),
                        "image skipped: {msg}"
                    );
                    report.skipped.push(SkippedImage {
                        image_id: entry.image_id,
                        error: msg,
                    });
                    continue;
                }
                Err(error) => return Err(error),
            };
            let mut validity = Validity::default();
            for tile in tiles.iter().filter(|t| t.outcome.is_done()) {
                validity |= tile.validity.image;
            }
            tracing::info!(
                image = entry.image_id,
                tiles = tiles.len(),
                objects = tiles.iter().map(TileReport::objects_published).sum::<usize>(),
                "image finished"
            );
            report.images.push(ImageValidity {
                image_id: entry.image_id,
                validity,
            });
            report.tiles.extend(tiles);
        }
        report.cancelled = self.cancel.is_cancelled();
        tracing::info!(
            done = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    /// Plan and run every iteration of one image.
    fn run_image(
        &self,
        config: &AnalysisConfig,
        compiled: &[CompiledPipeline],
        entry: &ImageEntry,
        first_index: usize,
    ) -> Result<Vec<TileReport>, PipelineError> {
        let handle = self.io.open_image(&entry.path)?;
        let metadata = self.io.metadata(&handle)?;
        if entry.series >= metadata.n_series {
            return Err(PipelineError::InvalidConfig(format!(
                "series {} does not exist, the image has {}",
                entry.series, metadata.n_series
            )));
        }
        let plan = config
            .image_setup
            .iterations(config.tile_size(entry), &metadata)?;
        tracing::debug!(image = entry.image_id, iterations = plan.len(), "image planned");

        let image = ImageRun {
            identity: ImageIdentity {
                plate_id: config.plate.plate_id,
                group_id: entry.group_id,
                image_id: entry.image_id,
            },
            series: entry.series,
            handle: &handle,
            pipelines: compiled,
            group: Arc::new(MemoryCache::new()),
            projection: config
                .image_setup
                .projection()
                .map(|p| (p, metadata.planes.z)),
            plan: &plan,
            first_index,
        };

        let next = AtomicUsize::new(0);
        let workers = self.options.parallel_tiles.clamp(1, plan.len().max(1));
        let mut tiles = if workers == 1 {
            self.work(&image, &next)
        } else {
            std::thread::scope(|s| {
                let handles: Vec<_> = (0..workers)
                    .map(|_| s.spawn(|| self.work(&image, &next)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().map_err(|_| {
                            PipelineError::External("tile worker panicked".into())
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })?
            .into_iter()
            .flatten()
            .collect()
        };
        tiles.sort_by_key(|t| t.index);
        Ok(tiles)
    }

    /// Pull iterations until the plan is exhausted or the run is
    /// cancelled.
    fn work(&self, image: &ImageRun<'_, I::Handle>, next: &AtomicUsize) -> Vec<TileReport> {
        let mut reports = Vec::new();
        while !self.cancel.is_cancelled() {
            let i = next.fetch_add(1, Ordering::SeqCst);
            let Some(iteration) = image.plan.get(i) else {
                break;
            };
            reports.push(self.run_iteration(image, image.first_index + i, iteration));
        }
        reports
    }

    fn run_iteration(
        &self,
        image: &ImageRun<'_, I::Handle>,
        index: usize,
        iteration: &Iteration,
    ) -> TileReport {
        let started = Instant::now();
        let ids = ObjectIdGenerator::starting_at(
            (index as u64 + 1).saturating_mul(IDS_PER_ITERATION),
        );
        let loader = IoPlaneLoader {
            io: self.io,
            handle: image.handle,
            tile: iteration.tile,
            projection: image.projection,
        };
        let job = TileJob {
            env: TileEnv {
                identity: image.identity,
                tile: iteration.tile,
                plane: PlaneId::new(image.series, iteration.z, iteration.t, 0),
                ids: &ids,
                loader: &loader,
            },
            key: TileKey {
                plate_id: image.identity.plate_id,
                group_id: image.identity.group_id,
                image_id: image.identity.image_id,
                tile_x: iteration.tile.tile_x,
                tile_y: iteration.tile.tile_y,
                t_stack: iteration.t,
            },
            pipelines: image.pipelines,
            deadline: Deadline::start(&self.cancel, self.options.tile_timeout),
        };
        let cache = TileCache::new(Arc::clone(&image.group));
        run_tile(&job, cache, self.sink).into_report(index, started.elapsed())
    }
}

/// What every iteration of one image shares.
struct ImageRun<'a, H> {
    identity: ImageIdentity,
    series: u32,
    handle: &'a H,
    pipelines: &'a [CompiledPipeline],
    group: Arc<MemoryCache>,
    projection: Option<(ZProjection, u32)>,
    plan: &'a [Iteration],
    first_index: usize,
}

/// Reads planes of the current tile, projecting along Z if configured.
struct IoPlaneLoader<'a, I: ImageIo> {
    io: &'a I,
    handle: &'a I::Handle,
    tile: TileInfo,
    projection: Option<(ZProjection, u32)>,
}

impl<I: ImageIo> PlaneLoader for IoPlaneLoader<'_, I> {
    fn load_plane(&self, plane: PlaneId) -> Result<ImagePlane, PipelineError> {
        let Some((projection, planes)) = self.projection else {
            return self.io.read_tile(self.handle, plane, &self.tile);
        };
        let stack = (0..planes)
            .map(|z| {
                self.io
                    .read_tile(self.handle, PlaneId { z, ..plane }, &self.tile)
                    .map(|p| p.to_gray16())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let projected = project(projection, &stack).ok_or_else(|| {
            PipelineError::External(format!("no focal planes to project for {plane}"))
        })?;
        ImagePlane::gray16(projected, PlaneId { z: 0, ..plane })
    }
}

/// Combine a Z stack pixel by pixel. Returns `None` for an empty stack.
fn project(projection: ZProjection, stack: &[Gray16Image]) -> Option<Gray16Image> {
    let first = stack.first()?;
    let (width, height) = first.dimensions();
    let n = stack.len() as u64;
    Some(Gray16Image::from_fn(width, height, |x, y| {
        let values = stack.iter().map(|plane| plane.get_pixel(x, y).0[0]);
        let value = match projection {
            ZProjection::MaxIntensity => values.max().unwrap_or(0),
            ZProjection::MinIntensity => values.min().unwrap_or(0),
            ZProjection::AvgIntensity => {
                let sum: u64 = values.map(u64::from).sum();
                u16::try_from((sum + n / 2) / n).unwrap_or(u16::MAX)
            }
        };
        image::Luma([value])
    }))
}
