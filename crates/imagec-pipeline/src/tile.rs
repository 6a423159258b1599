//! One tile iteration, stage by stage.
//!
//! A tile moves through the states below. Each stage value is consumed
//! by the method that advances it, so a finished or aborted tile cannot
//! be driven again:
//!
//! ```text
//! Init ──start──▶ Running(i) ──advance──▶ Running(i+1)
//!                      │                    │
//!                      ├─ breakpoint ──▶ Publishing ──publish──▶ Done
//!                      ├─ last step  ──▶ Publishing              │
//!                      └─ fatal error ─▶ Aborted          PublishFailed
//! ```
//!
//! `Running` walks every pipeline of the iteration in order. All of them
//! share one object list; each starts with its own source plane as the
//! active image. `TEMP_*` classes and memory slots are cleared when a
//! pipeline finishes. Cancellation and the tile timeout are checked at
//! every step boundary.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;
use crate::cache::{CacheScope, MemoryKey, TileCache};
use crate::class_id::ClassId;
use crate::context::{ProcessContext, TileEnv, TileState};
use crate::diagnostics::{
    ControlImageInfo, RunLogEntry, Severity, StepDiagnostics, TileReport,
};
use crate::executor::CancelToken;
use crate::factory::CompiledPipeline;
use crate::image_plane::ImagePlane;
use crate::object_list::ObjectList;
use crate::sink::{ResultsSink, TileHandle, TileKey};
use crate::types::{PipelineError, StopReason};

/// Terminal state of a tile iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileOutcome {
    /// Every step ran and the results were committed.
    Done,
    /// A breakpoint halted the tile; what existed was committed.
    DoneAtBreakPoint {
        /// Pipeline holding the breakpoint.
        pipeline: String,
        /// Step carrying the breakpoint.
        step: usize,
    },
    /// A fatal error stopped the tile; nothing was published.
    Aborted {
        /// Pipeline that was running, if any.
        pipeline: Option<String>,
        /// Step that failed, if the failure belongs to one.
        step: Option<usize>,
        /// Error description.
        error: String,
    },
    /// The sink refused the results.
    PublishFailed {
        /// Error description.
        error: String,
    },
}

impl TileOutcome {
    /// Returns `true` if the tile's results were committed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done | Self::DoneAtBreakPoint { .. })
    }
}

impl fmt::Display for TileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::DoneAtBreakPoint { pipeline, step } => {
                write!(f, "done (breakpoint at {pipeline} step {step})")
            }
            Self::Aborted {
                pipeline,
                step,
                error,
            } => {
                write!(f, "aborted")?;
                if let Some(pipeline) = pipeline {
                    write!(f, " in {pipeline}")?;
                }
                if let Some(step) = step {
                    write!(f, " at step {step}")?;
                }
                write!(f, ": {error}")
            }
            Self::PublishFailed { error } => write!(f, "publish failed: {error}"),
        }
    }
}

/// Cancellation and timeout, checked between steps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline<'a> {
    cancel: &'a CancelToken,
    started: Instant,
    timeout: Option<Duration>,
}

impl<'a> Deadline<'a> {
    pub(crate) fn start(cancel: &'a CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            timeout,
        }
    }

    fn check(&self) -> Result<(), StopReason> {
        if self.cancel.is_cancelled() {
            return Err(StopReason::Cancelled);
        }
        match self.timeout {
            Some(limit) if self.started.elapsed() >= limit => Err(StopReason::Timeout(limit)),
            _ => Ok(()),
        }
    }
}

/// Everything one tile iteration reads.
#[derive(Debug)]
pub(crate) struct TileJob<'a> {
    pub env: TileEnv<'a>,
    pub key: TileKey,
    pub pipelines: &'a [CompiledPipeline],
    pub deadline: Deadline<'a>,
}

/// Drive a tile from start to a terminal state.
#[tracing::instrument(
    skip_all,
    fields(
        image = job.key.image_id,
        tile_x = job.key.tile_x,
        tile_y = job.key.tile_y,
        t = job.key.t_stack,
        z = job.env.plane.z,
    )
)]
pub(crate) fn run_tile<'j>(
    job: &'j TileJob<'j>,
    cache: TileCache,
    sink: &dyn ResultsSink,
) -> Finished<'j> {
    let mut running = Init::new(job, cache).start();
    loop {
        running = match running.advance() {
            Transition::Running(next) => next,
            Transition::BreakHit(publishing) | Transition::Finished(publishing) => {
                return publishing.publish(sink);
            }
            Transition::Aborted(aborted) => return aborted.finish(),
        };
    }
}

// ───────────────────────── Stage 0: Init ─────────────────────────────

/// A tile whose context is built but which has not run anything.
#[must_use = "tile stages are consumed by advancing — call .start() to continue"]
#[derive(Debug)]
pub(crate) struct Init<'j> {
    job: &'j TileJob<'j>,
    state: TileState,
}

impl<'j> Init<'j> {
    pub(crate) fn new(job: &'j TileJob<'j>, cache: TileCache) -> Self {
        Self {
            job,
            state: TileState::new(cache),
        }
    }

    /// Begin with the first step of the first pipeline.
    pub(crate) fn start(self) -> Running<'j> {
        Running {
            job: self.job,
            state: self.state,
            objects: ObjectList::new(),
            pipeline: 0,
            step: 0,
            active: None,
            last_kind: None,
            timings: Vec::new(),
        }
    }
}

// ───────────────────────── Stage 1: Running ──────────────────────────

/// The active image of the running pipeline.
#[derive(Debug)]
struct Active {
    image: ImagePlane,
    kind: ArtifactKind,
    grayscale: bool,
}

/// What [`Running::advance`] led to.
#[derive(Debug)]
pub(crate) enum Transition<'j> {
    /// More work remains.
    Running(Running<'j>),
    /// A breakpoint step ran.
    BreakHit(Publishing<'j>),
    /// The last step of the last pipeline ran.
    Finished(Publishing<'j>),
    /// A fatal error occurred.
    Aborted(Aborted<'j>),
}

/// A tile in the middle of its pipelines.
#[must_use = "tile stages are consumed by advancing — call .advance() to continue"]
#[derive(Debug)]
pub(crate) struct Running<'j> {
    job: &'j TileJob<'j>,
    state: TileState,
    objects: ObjectList,
    pipeline: usize,
    step: usize,
    active: Option<Active>,
    last_kind: Option<ArtifactKind>,
    timings: Vec<StepDiagnostics>,
}

impl<'j> Running<'j> {
    /// Index of the running pipeline and of its next step.
    #[cfg(test)]
    const fn position(&self) -> (usize, usize) {
        (self.pipeline, self.step)
    }

    /// Run one unit of work: open a pipeline, execute a step, or close a
    /// finished pipeline.
    pub(crate) fn advance(mut self) -> Transition<'j> {
        let job = self.job;
        if let Err(reason) = job.deadline.check() {
            let step = self.current_step_index();
            return self.abort(step, PipelineError::TileTimeout(reason));
        }
        let Some(pipeline) = job.pipelines.get(self.pipeline) else {
            return Transition::Finished(self.into_publishing(None));
        };

        let mut active = match self.active.take() {
            Some(active) => active,
            None => match self.open(pipeline) {
                Ok(active) => active,
                Err(error) => return self.abort(None, error),
            },
        };

        let Some(step) = pipeline.steps.get(self.step) else {
            self.close_pipeline();
            return Transition::Running(self);
        };

        let io = step.in_out();
        if !io.input.contains(active.kind) {
            let error = PipelineError::TypeMismatch {
                pipeline: pipeline.name.clone(),
                step: step.index,
                expected: io.input,
                got: active.kind,
            };
            return self.abort(Some(step.index), error);
        }

        let started = Instant::now();
        let key = pipeline.source.memory_key(job.env.plane);
        let mut ctx = ProcessContext::new(
            &job.env,
            &mut self.state,
            &pipeline.name,
            pipeline.default_class,
            key,
        );
        ctx.set_step(step.index);
        if active.grayscale {
            ctx.set_grayscale();
        }
        let result = step
            .command
            .execute(&mut ctx, &mut active.image, &mut self.objects);
        active.grayscale = ctx.is_grayscale();
        let duration = started.elapsed();
        tracing::debug!(
            pipeline = %pipeline.name,
            step = step.index,
            command = step.command.name(),
            ?duration,
            "step finished"
        );
        self.timings.push(StepDiagnostics {
            pipeline: pipeline.name.clone(),
            step: step.index,
            command: step.command.name().to_owned(),
            duration,
        });

        match result {
            Ok(()) => active.kind = io.output.resolve(active.kind),
            Err(PipelineError::ArithmeticFault(message)) => {
                tracing::warn!(pipeline = %pipeline.name, step = step.index, "{message}");
                self.state.log.push(RunLogEntry {
                    severity: Severity::Warning,
                    pipeline: pipeline.name.clone(),
                    step: Some(step.index),
                    message,
                });
            }
            Err(error) => return self.abort(Some(step.index), error),
        }

        self.last_kind = Some(active.kind);
        self.active = Some(active);
        self.step += 1;
        if step.break_point {
            tracing::debug!(pipeline = %pipeline.name, step = step.index, "breakpoint hit");
            return Transition::BreakHit(
                self.into_publishing(Some((pipeline.name.clone(), step.index))),
            );
        }
        Transition::Running(self)
    }

    /// Load the pipeline's source as its active image.
    fn open(&mut self, pipeline: &CompiledPipeline) -> Result<Active, PipelineError> {
        let job = self.job;
        let key = pipeline.source.memory_key(job.env.plane);
        if key == MemoryKey::Blank && self.state.cache.load_image(&key).is_none() {
            let blank = ImagePlane::blank(job.env.tile.dimensions(), job.env.plane)?;
            self.state
                .cache
                .store_image(key, Arc::new(blank), CacheScope::Iteration);
        }
        let mut ctx = ProcessContext::new(
            &job.env,
            &mut self.state,
            &pipeline.name,
            pipeline.default_class,
            key,
        );
        let image = Arc::unwrap_or_clone(ctx.load_source(None)?);
        if pipeline.source_kind == ArtifactKind::Binary && !image.is_binary() {
            return Err(PipelineError::InvalidConfig(format!(
                "source {key} of `{}` is not a label mask",
                pipeline.name
            )));
        }
        tracing::trace!(pipeline = %pipeline.name, %key, "pipeline opened");
        Ok(Active {
            image,
            kind: pipeline.source_kind,
            grayscale: false,
        })
    }

    /// Drop the pipeline's scratch registers and move to the next one.
    fn close_pipeline(&mut self) {
        self.objects.clear_temp();
        self.state.cache.clear_temp();
        self.active = None;
        self.pipeline += 1;
        self.step = 0;
    }

    fn current_step_index(&self) -> Option<usize> {
        self.job
            .pipelines
            .get(self.pipeline)
            .and_then(|p| p.steps.get(self.step))
            .map(|s| s.index)
    }

    fn abort(self, step: Option<usize>, error: PipelineError) -> Transition<'j> {
        let pipeline = self.job.pipelines.get(self.pipeline).map(|p| p.name.clone());
        tracing::warn!(pipeline = ?pipeline, step = ?step, %error, "tile aborted");
        Transition::Aborted(Aborted {
            job: self.job,
            state: self.state,
            timings: self.timings,
            last_kind: self.last_kind,
            outcome: TileOutcome::Aborted {
                pipeline,
                step,
                error: error.to_string(),
            },
        })
    }

    fn into_publishing(self, break_at: Option<(String, usize)>) -> Publishing<'j> {
        Publishing {
            job: self.job,
            state: self.state,
            objects: self.objects,
            timings: self.timings,
            last_kind: self.last_kind,
            break_at,
        }
    }
}

// ───────────────────────── Stage 2: Publishing ───────────────────────

/// A tile whose objects are final and waiting to be committed.
#[must_use = "tile stages are consumed by advancing — call .publish() to continue"]
#[derive(Debug)]
pub(crate) struct Publishing<'j> {
    job: &'j TileJob<'j>,
    state: TileState,
    objects: ObjectList,
    timings: Vec<StepDiagnostics>,
    last_kind: Option<ArtifactKind>,
    break_at: Option<(String, usize)>,
}

impl<'j> Publishing<'j> {
    /// The objects about to be published (before filtering out
    /// non-user classes).
    #[cfg(test)]
    const fn objects(&self) -> &ObjectList {
        &self.objects
    }

    /// Hand everything to the sink and commit.
    ///
    /// Validity is written only after the commit succeeded, so a failed
    /// tile leaves no trace in the sink. A validity write refused after
    /// the commit is a run-log warning; the tile stays committed.
    pub(crate) fn publish(mut self, sink: &dyn ResultsSink) -> Finished<'j> {
        let committed = self.commit(sink);
        let (outcome, objects_by_class) = match committed {
            Ok(counts) => {
                if let Err(error) = self.write_validity(sink) {
                    tracing::warn!(%error, "validity update refused after commit");
                    self.state.log.push(RunLogEntry {
                        severity: Severity::Warning,
                        pipeline: String::new(),
                        step: None,
                        message: format!("validity not recorded: {error}"),
                    });
                }
                let outcome = match &self.break_at {
                    Some((pipeline, step)) => TileOutcome::DoneAtBreakPoint {
                        pipeline: pipeline.clone(),
                        step: *step,
                    },
                    None => TileOutcome::Done,
                };
                (outcome, counts)
            }
            Err(error) => {
                tracing::warn!(%error, "tile publication failed");
                (
                    TileOutcome::PublishFailed {
                        error: error.to_string(),
                    },
                    Vec::new(),
                )
            }
        };
        if outcome.is_done() {
            tracing::info!(
                objects = objects_by_class.iter().map(|(_, n)| n).sum::<usize>(),
                "tile published"
            );
        }
        let control_images = if outcome.is_done() {
            self.state
                .control_images
                .iter()
                .map(|c| ControlImageInfo {
                    name: c.name.clone(),
                    width: c.image.width(),
                    height: c.image.height(),
                })
                .collect()
        } else {
            Vec::new()
        };
        Finished {
            job: self.job,
            outcome,
            objects_by_class,
            state: self.state,
            timings: self.timings,
            last_kind: self.last_kind,
            control_images,
        }
    }

    fn commit(&self, sink: &dyn ResultsSink) -> Result<Vec<(ClassId, usize)>, PipelineError> {
        let key = &self.job.key;
        let handle = sink.begin_tile(key, &self.job.env.tile)?;
        let counts = match self.stage(sink, handle) {
            Ok(counts) => counts,
            Err(error) => {
                sink.abort_tile(handle);
                return Err(error);
            }
        };
        sink.end_tile(handle)?;
        Ok(counts)
    }

    fn write_validity(&self, sink: &dyn ResultsSink) -> Result<(), PipelineError> {
        let key = &self.job.key;
        let validity = &self.state.validity;
        if !validity.image.is_empty() {
            sink.set_image_validity(key.image_id, validity.image)?;
        }
        for (plane, bits) in &validity.planes {
            sink.set_plane_validity(key.image_id, *plane, None, *bits)?;
        }
        for ((plane, class_id), bits) in &validity.plane_classes {
            sink.set_plane_validity(key.image_id, *plane, Some(*class_id), *bits)?;
        }
        Ok(())
    }

    fn stage(
        &self,
        sink: &dyn ResultsSink,
        handle: TileHandle,
    ) -> Result<Vec<(ClassId, usize)>, PipelineError> {
        let mut counts = Vec::new();
        for class_id in self.objects.class_ids().filter(|c| c.is_user()) {
            let objects = self.objects.class(class_id);
            for object in objects {
                sink.write_object(handle, object)?;
                for (plane, aggregates) in object.intensities() {
                    sink.write_measurement(handle, object.id(), plane, aggregates)?;
                }
            }
            counts.push((class_id, objects.len()));
        }
        for image in &self.state.control_images {
            sink.write_control_image(handle, image)?;
        }
        Ok(counts)
    }
}

// ───────────────────────── Terminal stages ───────────────────────────

/// A tile stopped by a fatal error. Nothing reaches the sink.
#[derive(Debug)]
pub(crate) struct Aborted<'j> {
    job: &'j TileJob<'j>,
    state: TileState,
    timings: Vec<StepDiagnostics>,
    last_kind: Option<ArtifactKind>,
    outcome: TileOutcome,
}

impl<'j> Aborted<'j> {
    /// Discard the tile's results.
    pub(crate) fn finish(self) -> Finished<'j> {
        Finished {
            job: self.job,
            outcome: self.outcome,
            objects_by_class: Vec::new(),
            state: self.state,
            timings: self.timings,
            last_kind: self.last_kind,
            control_images: Vec::new(),
        }
    }
}

/// A tile in a terminal state.
#[derive(Debug)]
pub(crate) struct Finished<'j> {
    job: &'j TileJob<'j>,
    outcome: TileOutcome,
    objects_by_class: Vec<(ClassId, usize)>,
    state: TileState,
    timings: Vec<StepDiagnostics>,
    last_kind: Option<ArtifactKind>,
    control_images: Vec<ControlImageInfo>,
}

impl Finished<'_> {
    /// Terminal state.
    pub(crate) const fn outcome(&self) -> &TileOutcome {
        &self.outcome
    }

    /// Summarise the tile for the run report.
    pub(crate) fn into_report(self, index: usize, duration: Duration) -> TileReport {
        TileReport {
            index,
            key: self.job.key,
            z: self.job.env.plane.z,
            outcome: self.outcome,
            objects_by_class: self.objects_by_class,
            validity: self.state.validity,
            log: self.state.log,
            steps: self.timings,
            control_images: self.control_images,
            last_artifact: self.last_kind,
            duration,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactSet, InOut};
    use crate::cache::MemoryCache;
    use crate::class_id::{ClassIdIn, TempSlot};
    use crate::command::{BuildEnv, Command};
    use crate::commands::blur::BlurSettings;
    use crate::commands::classifier::{ClassifierEntry, ClassifierSettings};
    use crate::commands::measure_intensity::MeasureIntensitySettings;
    use crate::commands::threshold::ThresholdSettings;
    use crate::commands::validators::NoiseValidatorSettings;
    use crate::context::ImageIdentity;
    use crate::context::tests::FixedLoader;
    use crate::factory::{CompiledStep, build_pipeline};
    use crate::image_plane::PlaneId;
    use crate::io::TileInfo;
    use crate::object::{IntensityAggregates, Object, ObjectId, ObjectIdGenerator};
    use crate::pipeline::Pipeline;
    use crate::sink::InMemorySink;
    use crate::step::{CommandSettings, PipelineStep};
    use crate::types::Dimensions;
    use crate::validity::Validity;

    /// Always reports an arithmetic fault.
    #[derive(Debug)]
    struct Faulty;

    impl Command for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn in_out(&self) -> InOut {
            InOut::pass_through(ArtifactSet::ANY)
        }

        fn execute(
            &self,
            _ctx: &mut ProcessContext<'_>,
            _image: &mut ImagePlane,
            _objects: &mut ObjectList,
        ) -> Result<(), PipelineError> {
            Err(PipelineError::ArithmeticFault("overflow".into()))
        }
    }

    struct Fixture {
        ids: ObjectIdGenerator,
        loader: FixedLoader,
        cancel: CancelToken,
        pipelines: Vec<CompiledPipeline>,
        dims: Dimensions,
    }

    impl Fixture {
        fn new(pipelines: &[Pipeline]) -> Self {
            let dims = Dimensions::new(4, 4);
            Self {
                ids: ObjectIdGenerator::new(),
                loader: FixedLoader::new(dims),
                cancel: CancelToken::new(),
                pipelines: pipelines
                    .iter()
                    .map(|p| build_pipeline(p, &BuildEnv::default()).unwrap())
                    .collect(),
                dims,
            }
        }

        fn job(&self, timeout: Option<Duration>) -> TileJob<'_> {
            TileJob {
                env: TileEnv {
                    identity: ImageIdentity {
                        plate_id: 1,
                        group_id: 1,
                        image_id: 1,
                    },
                    tile: TileInfo::whole(self.dims),
                    plane: PlaneId::default(),
                    ids: &self.ids,
                    loader: &self.loader,
                },
                key: TileKey {
                    plate_id: 1,
                    group_id: 1,
                    image_id: 1,
                    tile_x: 0,
                    tile_y: 0,
                    t_stack: 0,
                },
                pipelines: &self.pipelines,
                deadline: Deadline::start(&self.cancel, timeout),
            }
        }

        fn run(&self, sink: &InMemorySink) -> TileReport {
            let job = self.job(None);
            run_tile(&job, cache(), sink).into_report(0, Duration::ZERO)
        }
    }

    fn cache() -> TileCache {
        TileCache::new(Arc::new(MemoryCache::new()))
    }

    fn counting(name: &str, class: u16) -> Pipeline {
        Pipeline::new(name, ClassId::new(class))
            .step(CommandSettings::Threshold(ThresholdSettings::default()))
            .step(CommandSettings::Classifier(ClassifierSettings::default()))
            .step(CommandSettings::MeasureIntensity(
                MeasureIntensitySettings::default(),
            ))
    }

    // --- running tests ---

    #[test]
    fn counting_pipeline_publishes_objects_and_measurements() {
        let fx = Fixture::new(&[counting("count", 1)]);
        let sink = InMemorySink::new();
        let report = fx.run(&sink);
        assert_eq!(report.outcome, TileOutcome::Done);
        assert_eq!(report.objects_by_class, [(ClassId::new(1), 1)]);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.last_artifact, Some(ArtifactKind::Object));
        assert_eq!(sink.objects().len(), 1);
        assert_eq!(sink.measurements().len(), 1);
        assert_eq!(sink.open_tiles(), 0);
    }

    #[test]
    fn running_advances_one_step_at_a_time() {
        let fx = Fixture::new(&[counting("a", 1), counting("b", 2)]);
        let job = fx.job(None);
        let running = Init::new(&job, cache()).start();
        assert_eq!(running.position(), (0, 0));
        let Transition::Running(running) = running.advance() else {
            unreachable!("first step should leave the tile running");
        };
        assert_eq!(running.position(), (0, 1));
        let mut running = running;
        for _ in 0..3 {
            let Transition::Running(next) = running.advance() else {
                unreachable!("pipeline a should still be running");
            };
            running = next;
        }
        assert_eq!(running.position(), (1, 0));
    }

    #[test]
    fn break_point_halts_every_remaining_pipeline() {
        let first = Pipeline::new("a", ClassId::new(1))
            .step(
                PipelineStep::new(CommandSettings::Threshold(ThresholdSettings::default()))
                    .with_break_point(),
            )
            .step(CommandSettings::Classifier(ClassifierSettings::default()));
        let fx = Fixture::new(&[first, counting("b", 2)]);
        let sink = InMemorySink::new();
        let report = fx.run(&sink);
        assert_eq!(
            report.outcome,
            TileOutcome::DoneAtBreakPoint {
                pipeline: "a".into(),
                step: 0
            }
        );
        assert!(report.outcome.is_done());
        assert_eq!(report.last_artifact, Some(ArtifactKind::Binary));
        assert_eq!(report.steps.len(), 1);
        assert!(sink.objects().is_empty());
        assert_eq!(sink.tiles().len(), 1);
    }

    #[test]
    fn temp_classes_are_never_published() {
        let classifier = ClassifierSettings {
            classes: vec![
                ClassifierEntry {
                    class_out: ClassIdIn::Temp(TempSlot::Temp01),
                    ..ClassifierEntry::default()
                },
                ClassifierEntry::default(),
            ],
        };
        let p = Pipeline::new("p", ClassId::new(3))
            .step(CommandSettings::Threshold(ThresholdSettings::default()))
            .step(PipelineStep::new(CommandSettings::Classifier(classifier)).with_break_point());
        let fx = Fixture::new(&[p]);
        let job = fx.job(None);
        let mut running = Init::new(&job, cache()).start();
        let publishing = loop {
            running = match running.advance() {
                Transition::Running(next) => next,
                Transition::BreakHit(publishing) => break publishing,
                Transition::Finished(_) | Transition::Aborted(_) => {
                    unreachable!("the breakpoint should be hit")
                }
            };
        };
        assert_eq!(publishing.objects().count(TempSlot::Temp01.class_id()), 1);
        assert_eq!(publishing.objects().count(ClassId::new(3)), 1);

        let sink = InMemorySink::new();
        let report = publishing.publish(&sink).into_report(0, Duration::ZERO);
        assert_eq!(report.objects_by_class, [(ClassId::new(3), 1)]);
        assert_eq!(sink.objects().len(), 1);
    }

    #[test]
    fn runtime_type_mismatch_aborts_without_publishing() {
        let p = Pipeline::new("p", ClassId::new(1))
            .step(CommandSettings::Blur(BlurSettings::default()))
            .step(CommandSettings::Classifier(ClassifierSettings::default()));
        let fx = Fixture::new(&[p]);
        let sink = InMemorySink::new();
        let report = fx.run(&sink);
        assert!(
            matches!(
                &report.outcome,
                TileOutcome::Aborted { step: Some(1), error, .. } if error.contains("expected BINARY")
            ),
            "{}",
            report.outcome
        );
        assert!(sink.tiles().is_empty());
        assert_eq!(sink.open_tiles(), 0);
        assert!(report.objects_by_class.is_empty());
    }

    #[test]
    fn arithmetic_fault_is_a_warning() {
        let mut fx = Fixture::new(&[counting("count", 1)]);
        fx.pipelines[0].steps.insert(
            0,
            CompiledStep {
                index: 0,
                command: Box::new(Faulty),
                break_point: false,
            },
        );
        let sink = InMemorySink::new();
        let report = fx.run(&sink);
        assert_eq!(report.outcome, TileOutcome::Done);
        assert_eq!(report.log.len(), 1);
        assert_eq!(report.log[0].severity, Severity::Warning);
        assert!(report.log[0].message.contains("overflow"));
    }

    // --- stop tests ---

    #[test]
    fn cancelled_tile_stops_before_the_next_step() {
        let fx = Fixture::new(&[counting("count", 1)]);
        fx.cancel.cancel();
        let sink = InMemorySink::new();
        let report = fx.run(&sink);
        assert!(
            matches!(
                &report.outcome,
                TileOutcome::Aborted { step: Some(0), error, .. } if error.contains("cancelled")
            ),
            "{}",
            report.outcome
        );
        assert!(report.steps.is_empty());
        assert!(sink.tiles().is_empty());
    }

    #[test]
    fn exhausted_time_budget_aborts() {
        let fx = Fixture::new(&[counting("count", 1)]);
        let job = fx.job(Some(Duration::ZERO));
        let sink = InMemorySink::new();
        let finished = run_tile(&job, cache(), &sink);
        assert!(matches!(finished.outcome(), TileOutcome::Aborted { .. }));
        assert!(finished.outcome().to_string().contains("timed out"));
    }

    // --- publication tests ---

    #[test]
    fn refused_commit_is_publish_failed() {
        let fx = Fixture::new(&[counting("count", 1)]);
        let sink = InMemorySink::new();
        sink.fail_commits(true);
        let report = fx.run(&sink);
        assert!(matches!(report.outcome, TileOutcome::PublishFailed { .. }));
        assert!(!report.outcome.is_done());
        assert!(report.objects_by_class.is_empty());
        assert!(sink.objects().is_empty());
    }

    /// Commits tiles but refuses every validity update.
    struct RefusesValidity(InMemorySink);

    impl ResultsSink for RefusesValidity {
        fn begin_tile(&self, key: &TileKey, info: &TileInfo) -> Result<TileHandle, PipelineError> {
            self.0.begin_tile(key, info)
        }

        fn write_object(&self, tile: TileHandle, object: &Object) -> Result<(), PipelineError> {
            self.0.write_object(tile, object)
        }

        fn write_measurement(
            &self,
            tile: TileHandle,
            object: ObjectId,
            plane: &MemoryKey,
            aggregates: &IntensityAggregates,
        ) -> Result<(), PipelineError> {
            self.0.write_measurement(tile, object, plane, aggregates)
        }

        fn set_image_validity(&self, _: u64, _: Validity) -> Result<(), PipelineError> {
            Err(PipelineError::External("validity write refused".into()))
        }

        fn end_tile(&self, tile: TileHandle) -> Result<(), PipelineError> {
            self.0.end_tile(tile)
        }
    }

    #[test]
    fn refused_validity_keeps_the_committed_tile() {
        let noisy = counting("count", 1).step(CommandSettings::NoiseValidator(
            NoiseValidatorSettings {
                max_objects: 0,
                ..NoiseValidatorSettings::default()
            },
        ));
        let fx = Fixture::new(&[noisy]);
        let sink = RefusesValidity(InMemorySink::new());
        let job = fx.job(None);
        let report = run_tile(&job, cache(), &sink).into_report(0, Duration::ZERO);

        assert_eq!(report.outcome, TileOutcome::Done);
        assert_eq!(report.objects_by_class, [(ClassId::new(1), 1)]);
        assert_eq!(sink.0.tiles().len(), 1);
        assert_eq!(sink.0.objects().len(), 1);
        assert!(!report.validity.image.is_empty());
        assert_eq!(report.log.len(), 1);
        assert_eq!(report.log[0].severity, Severity::Warning);
        assert!(report.log[0].message.contains("validity write refused"));
    }

    #[test]
    fn outcome_serializes_with_state_tag() {
        let json = serde_json::to_value(TileOutcome::DoneAtBreakPoint {
            pipeline: "p".into(),
            step: 2,
        })
        .unwrap();
        assert_eq!(json["state"], "DONE_AT_BREAK_POINT");
        assert_eq!(json["step"], 2);
    }
}
