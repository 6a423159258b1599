//! Integration tests: whole analyses through the executor, against
//! in-memory images and an in-memory sink.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use image::Luma;
use imagec_pipeline::analysis::{AnalysisConfig, ImageEntry};
use imagec_pipeline::commands::blur::BlurSettings;
use imagec_pipeline::commands::classifier::ClassifierSettings;
use imagec_pipeline::commands::image_cache::ImageCacheSettings;
use imagec_pipeline::commands::measure_intensity::MeasureIntensitySettings;
use imagec_pipeline::commands::reclassify::{IntersectionRule, ReclassifySettings};
use imagec_pipeline::commands::threshold::{ThresholdEntry, ThresholdMode, ThresholdSettings};
use imagec_pipeline::commands::validators::NoiseValidatorSettings;
use imagec_pipeline::commands::voronoi::VoronoiGridSettings;
use imagec_pipeline::image_plane::{Gray16Image, PixelBuffer};
use imagec_pipeline::io::{InMemoryImage, InMemoryImageIo};
use imagec_pipeline::{
    ArtifactKind, ArtifactSet, CancelToken, ClassId, ClassIdIn, CommandSettings, Dimensions,
    Executor, ExecutorOptions, InMemorySink, Object, Pipeline, PipelineError, PipelineSource,
    PipelineStep, PlaneId, RunReport, TileOutcome, ValidityFlag, type_check,
};

const IMAGE: &str = "plate/A01.tif";

/// A plane of `background` with filled squares `(x, y, size, value)`.
fn plane(dims: Dimensions, background: u16, squares: &[(u32, u32, u32, u16)]) -> Gray16Image {
    Gray16Image::from_fn(dims.width, dims.height, |x, y| {
        let value = squares
            .iter()
            .find(|(sx, sy, size, _)| x >= *sx && x < sx + size && y >= *sy && y < sy + size)
            .map_or(background, |(_, _, _, v)| *v);
        Luma([value])
    })
}

/// One image at [`IMAGE`] with a channel per plane.
fn io(channels: Vec<Gray16Image>) -> InMemoryImageIo {
    let mut channels = channels.into_iter();
    let mut image = InMemoryImage::gray16(channels.next().expect("at least one channel"));
    for (c, buffer) in (1..).zip(channels) {
        image = image
            .with_plane(PlaneId::new(0, 0, 0, c), PixelBuffer::Gray16(buffer))
            .unwrap();
    }
    let mut io = InMemoryImageIo::new();
    io.insert(IMAGE, image);
    io
}

fn config(pipelines: Vec<Pipeline>) -> AnalysisConfig {
    AnalysisConfig::new(
        vec![ImageEntry {
            path: IMAGE.into(),
            series: 0,
            group_id: 1,
            image_id: 1,
            tile_size: None,
        }],
        pipelines,
    )
}

fn threshold(min: u16) -> CommandSettings {
    CommandSettings::Threshold(ThresholdSettings {
        thresholds: vec![ThresholdEntry {
            threshold_min: min,
            ..ThresholdEntry::default()
        }],
    })
}

fn classifier() -> CommandSettings {
    CommandSettings::Classifier(ClassifierSettings::default())
}

fn class(id: u16) -> ClassIdIn {
    ClassIdIn::Class(ClassId::new(id))
}

/// Threshold `channel` at `min` and classify into `class_id`.
fn segment(name: &str, class_id: u16, channel: u32, min: u16) -> Pipeline {
    Pipeline::new(name, ClassId::new(class_id))
        .with_source(PipelineSource::FromFile { channel }, ArtifactKind::Image)
        .step(threshold(min))
        .step(classifier())
}

/// A pipeline that starts from the shared object list.
fn on_objects(name: &str, class_id: u16) -> Pipeline {
    Pipeline::new(name, ClassId::new(class_id))
        .with_source(PipelineSource::default(), ArtifactKind::Object)
}

fn run(io: &InMemoryImageIo, config: &AnalysisConfig) -> (RunReport, InMemorySink) {
    run_with(io, config, ExecutorOptions::default())
}

fn run_with(
    io: &InMemoryImageIo,
    config: &AnalysisConfig,
    options: ExecutorOptions,
) -> (RunReport, InMemorySink) {
    let sink = InMemorySink::new();
    let report = Executor::new(io, &sink)
        .with_options(options)
        .run(config)
        .unwrap();
    (report, sink)
}

fn sorted(mut objects: Vec<Object>) -> Vec<Object> {
    objects.sort_by_key(Object::id);
    objects
}

fn counting_image() -> Gray16Image {
    plane(Dimensions::new(256, 256), 1000, &[(118, 118, 20, 40000)])
}

fn counting_pipeline() -> Pipeline {
    segment("count", 1, 0, 20000).step(CommandSettings::MeasureIntensity(
        MeasureIntensitySettings::default(),
    ))
}

// --- scenario tests ---

#[test]
fn count_only() {
    let io = io(vec![counting_image()]);
    let (report, sink) = run(&io, &config(vec![counting_pipeline()]));

    assert_eq!(report.completed(), 1, "{}", report.report());
    let objects = sink.objects_of(ClassId::new(1));
    assert_eq!(objects.len(), 1);
    let object = &objects[0];
    assert_eq!(object.area(), 400);
    let centre = object.centre_of_mass();
    assert!((centre.x - 128.0).abs() <= 1.0, "{centre:?}");
    assert!((centre.y - 128.0).abs() <= 1.0, "{centre:?}");

    let rows = sink.measurements();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object, object.id());
    assert!((rows[0].aggregates.avg - 40000.0).abs() < 1e-9);
    assert!((rows[0].aggregates.min - 40000.0).abs() < 1e-9);
    assert!((rows[0].aggregates.max - 40000.0).abs() < 1e-9);
}

#[test]
fn reclassify_move_by_intersection() {
    let dims = Dimensions::new(64, 64);
    let io = io(vec![
        plane(dims, 0, &[(0, 0, 20, 5000)]),
        plane(dims, 0, &[(0, 0, 10, 5000)]),
    ]);
    let cell = segment("cells", 2, 0, 1000);
    let spot = segment("spots", 1, 1, 1000);
    let reclassify = on_objects("spot in cell", 3).step(CommandSettings::Reclassify(
        ReclassifySettings {
            input_classes: vec![class(1)],
            new_class_id: class(3),
            intersection: Some(IntersectionRule {
                input_classes_intersect_with: vec![class(2)],
                min_intersection: 0.1,
                ..IntersectionRule::default()
            }),
            ..ReclassifySettings::default()
        },
    ));

    let (_, before) = run(&io, &config(vec![cell.clone(), spot.clone()]));
    let original = before.objects_of(ClassId::new(1));
    assert_eq!(original.len(), 1);

    let (report, after) = run(&io, &config(vec![cell, spot, reclassify]));
    assert_eq!(report.completed(), 1, "{}", report.report());
    assert!(after.objects_of(ClassId::new(1)).is_empty());
    let moved = after.objects_of(ClassId::new(3));
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].id(), original[0].id());
    assert_eq!(moved[0].area(), 100);
    let parent = after.objects_of(ClassId::new(2))[0].id();
    assert_eq!(moved[0].parent_id(), Some(parent));
}

#[test]
fn noise_validator_invalidates_the_image() {
    let squares: Vec<_> = (0..11).map(|i| (2 + i * 8, 10, 4, 9000)).collect();
    let io = io(vec![plane(Dimensions::new(100, 32), 0, &squares)]);
    let pipeline = segment("noisy", 1, 0, 1000).step(CommandSettings::NoiseValidator(
        NoiseValidatorSettings {
            max_objects: 10,
            ..NoiseValidatorSettings::default()
        },
    ));
    let (report, sink) = run(&io, &config(vec![pipeline]));

    assert_eq!(report.tiles[0].outcome, TileOutcome::Done);
    assert!(sink.image_validity(1).contains(ValidityFlag::PossibleNoise));
    assert!(report.images[0].validity.contains(ValidityFlag::PossibleNoise));
    assert_eq!(sink.objects_of(ClassId::new(1)).len(), 11);
}

#[test]
fn break_point_publishes_the_threshold_mask_state() {
    let io = io(vec![counting_image()]);
    let pipeline = Pipeline::new("otsu", ClassId::new(1))
        .step(CommandSettings::Blur(BlurSettings::default()))
        .step(
            PipelineStep::new(CommandSettings::Threshold(ThresholdSettings {
                thresholds: vec![ThresholdEntry {
                    mode: ThresholdMode::Otsu,
                    ..ThresholdEntry::default()
                }],
            }))
            .with_break_point(),
        )
        .step(classifier());
    let (report, sink) = run(&io, &config(vec![pipeline]));

    let tile = &report.tiles[0];
    assert_eq!(
        tile.outcome,
        TileOutcome::DoneAtBreakPoint {
            pipeline: "otsu".into(),
            step: 1
        }
    );
    assert_eq!(tile.last_artifact, Some(ArtifactKind::Binary));
    assert!(tile.steps.iter().all(|s| s.command != "classifier"));
    assert!(sink.objects().is_empty());
    assert_eq!(sink.tiles().len(), 1);
}

#[test]
fn type_mismatch_refuses_the_run() {
    let pipeline = Pipeline::new("bad", ClassId::new(1))
        .step(CommandSettings::Blur(BlurSettings::default()))
        .step(CommandSettings::Reclassify(ReclassifySettings::default()));
    let err = type_check(&pipeline).unwrap_err();
    assert!(
        matches!(
            err,
            PipelineError::TypeMismatch {
                step: 1,
                expected: ArtifactSet::OBJECT,
                got: ArtifactKind::Image,
                ..
            }
        ),
        "{err}"
    );

    let io = io(vec![counting_image()]);
    let sink = InMemorySink::new();
    let err = Executor::new(&io, &sink)
        .run(&config(vec![pipeline]))
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConfigRejected(_)), "{err}");
    assert!(sink.tiles().is_empty());
}

#[test]
fn voronoi_areas_are_limited_to_the_mask() {
    let dims = Dimensions::new(100, 100);
    let tissue = Gray16Image::from_fn(100, 100, |x, _| Luma([if x < 50 { 5000 } else { 0 }]));
    let seeds = plane(dims, 0, &[(24, 49, 3, 5000), (74, 49, 3, 5000)]);
    let io = io(vec![tissue, seeds]);
    let voronoi = on_objects("areas", 7).step(CommandSettings::VoronoiGrid(VoronoiGridSettings {
        points_class_in: vec![class(6)],
        mask_classes: vec![class(5)],
        class_out: class(7),
        exclude_areas_without_point: true,
        ..VoronoiGridSettings::default()
    }));
    let pipelines = vec![
        segment("tissue", 5, 0, 1000),
        segment("center", 6, 1, 1000),
        voronoi,
    ];
    let (report, sink) = run(&io, &config(pipelines));

    assert_eq!(report.completed(), 1, "{}", report.report());
    let areas = sink.objects_of(ClassId::new(7));
    assert_eq!(areas.len(), 1);
    let area = &areas[0];
    assert!(area.contains_pixel(25, 50));
    assert!(area.contour().iter().all(|p| p.x < 50.0), "{:?}", area.bbox());
    assert!(area.pixels().all(|(x, _)| x < 50));
}

// --- property tests ---

#[test]
fn repeated_runs_publish_identical_results() {
    let io = io(vec![counting_image()]);
    let config = config(vec![counting_pipeline()]);
    let (_, first) = run(&io, &config);
    let (_, second) = run(&io, &config);
    assert_eq!(sorted(first.objects()), sorted(second.objects()));
    assert_eq!(first.measurements(), second.measurements());
}

#[test]
fn tiles_split_objects_and_parallel_runs_agree() {
    let io = io(vec![counting_image()]);
    let mut config = config(vec![counting_pipeline()]);
    config.image_setup.composite_tile_size = Dimensions::new(128, 128);

    let (report, sequential) = run(&io, &config);
    assert_eq!(report.tiles.len(), 4);
    assert_eq!(report.completed(), 4);
    let objects = sorted(sequential.objects());
    assert_eq!(objects.len(), 4);
    assert!(objects.iter().all(|o| o.area() == 100));

    let (parallel_report, parallel) = run_with(
        &io,
        &config,
        ExecutorOptions {
            parallel_tiles: 4,
            ..ExecutorOptions::default()
        },
    );
    let indices: Vec<_> = parallel_report.tiles.iter().map(|t| t.index).collect();
    assert_eq!(indices, [0, 1, 2, 3]);
    assert_eq!(sorted(parallel.objects()), objects);
}

#[test]
fn image_validity_is_the_or_of_tile_validity() {
    let io = io(vec![plane(
        Dimensions::new(256, 256),
        0,
        &[(10, 10, 5, 9000)],
    )]);
    let pipeline = segment("sparse", 1, 0, 1000).step(CommandSettings::NoiseValidator(
        NoiseValidatorSettings {
            max_objects: 0,
            ..NoiseValidatorSettings::default()
        },
    ));
    let mut config = config(vec![pipeline]);
    config.image_setup.composite_tile_size = Dimensions::new(128, 128);
    let (report, sink) = run(&io, &config);

    let flagged: Vec<_> = report
        .tiles
        .iter()
        .filter(|t| !t.validity.image.is_empty())
        .map(|t| (t.key.tile_x, t.key.tile_y))
        .collect();
    assert_eq!(flagged, [(0, 0)]);
    assert!(report.images[0].validity.contains(ValidityFlag::PossibleNoise));
    assert!(sink.image_validity(1).contains(ValidityFlag::PossibleNoise));
}

#[test]
fn break_point_steps_after_it_have_no_effect() {
    let io = io(vec![counting_image()]);
    let halted = segment("count", 1, 0, 20000);
    let mut with_break = halted.clone();
    with_break.steps[1].break_point = true;
    let with_break = with_break.step(CommandSettings::Reclassify(ReclassifySettings {
        new_class_id: class(2),
        ..ReclassifySettings::default()
    }));

    let (_, plain) = run(&io, &config(vec![halted]));
    let (_, broken) = run(&io, &config(vec![with_break]));
    assert_eq!(sorted(plain.objects()), sorted(broken.objects()));
    assert!(broken.objects_of(ClassId::new(2)).is_empty());
}

#[test]
fn disabled_and_pass_through_steps_change_nothing() {
    let io = io(vec![counting_image()]);
    let flag_noise = || {
        CommandSettings::NoiseValidator(NoiseValidatorSettings {
            max_objects: 0,
            ..NoiseValidatorSettings::default()
        })
    };
    let plain = counting_pipeline().step(flag_noise());
    let padded = Pipeline::new("count", ClassId::new(1))
        .with_source(PipelineSource::FromFile { channel: 0 }, ArtifactKind::Image)
        .step(PipelineStep::new(CommandSettings::Blur(BlurSettings::default())).disabled())
        .step(CommandSettings::ImageCache(ImageCacheSettings::default()))
        .step(threshold(20000))
        .step(classifier())
        .step(CommandSettings::NoiseValidator(NoiseValidatorSettings::default()))
        .step(CommandSettings::MeasureIntensity(
            MeasureIntensitySettings::default(),
        ))
        .step(flag_noise());

    let (plain_report, expected) = run(&io, &config(vec![plain]));
    let (padded_report, actual) = run(&io, &config(vec![padded]));
    assert_eq!(padded_report.completed(), 1, "{}", padded_report.report());
    assert_eq!(sorted(actual.objects()), sorted(expected.objects()));
    assert_eq!(actual.measurements(), expected.measurements());
    assert_eq!(actual.image_validity(1), expected.image_validity(1));
    assert!(actual.image_validity(1).contains(ValidityFlag::PossibleNoise));
    assert_eq!(
        padded_report.tiles[0].objects_by_class,
        plain_report.tiles[0].objects_by_class
    );
}

// --- failure tests ---

#[test]
fn refused_commits_fail_the_tile_only() {
    let io = io(vec![counting_image()]);
    let sink = InMemorySink::new();
    sink.fail_commits(true);
    let report = Executor::new(&io, &sink)
        .run(&config(vec![counting_pipeline()]))
        .unwrap();
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.tiles[0].outcome,
        TileOutcome::PublishFailed { .. }
    ));
    assert!(sink.tiles().is_empty());
    assert!(sink.image_validity(1).is_empty());
}

#[test]
fn cancelled_run_starts_no_tiles() {
    let io = io(vec![counting_image()]);
    let sink = InMemorySink::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = Executor::new(&io, &sink)
        .with_cancel(cancel)
        .run(&config(vec![counting_pipeline()]))
        .unwrap();
    assert!(report.cancelled);
    assert!(report.tiles.is_empty());
    assert!(sink.tiles().is_empty());
}

#[test]
fn zero_time_budget_aborts_every_tile() {
    let io = io(vec![counting_image()]);
    let (report, sink) = run_with(
        &io,
        &config(vec![counting_pipeline()]),
        ExecutorOptions {
            tile_timeout: Some(std::time::Duration::ZERO),
            ..ExecutorOptions::default()
        },
    );
    assert_eq!(report.failed(), 1);
    assert!(report.tiles[0].outcome.to_string().contains("timed out"));
    assert!(sink.objects().is_empty());
}

#[test]
fn unknown_images_are_skipped() {
    let io = io(vec![counting_image()]);
    let mut config = config(vec![counting_pipeline()]);
    config.images.push(ImageEntry {
        path: "plate/missing.tif".into(),
        series: 0,
        group_id: 1,
        image_id: 2,
        tile_size: None,
    });
    let (report, sink) = run(&io, &config);
    assert_eq!(report.completed(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].image_id, 2);
    assert_eq!(sink.objects().len(), 1);
}
