//! Integration tests: analyses over image files on disk, written to JSON
//! lines.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use image::{ImageBuffer, Luma};
use imagec::{FileImageIo, JsonLinesSink, load_config};
use imagec_pipeline::analysis::{AnalysisConfig, ImageEntry};
use imagec_pipeline::commands::classifier::ClassifierSettings;
use imagec_pipeline::commands::measure_intensity::MeasureIntensitySettings;
use imagec_pipeline::commands::threshold::{ThresholdEntry, ThresholdSettings};
use imagec_pipeline::{
    ArtifactKind, ClassId, CommandSettings, Executor, Pipeline, PipelineSource,
};

/// A 64×64 16-bit plane with one bright 10×10 square.
fn write_plane(path: &Path) {
    let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(64, 64, |x, y| {
        let inside = (20..30).contains(&x) && (20..30).contains(&y);
        Luma([if inside { 50_000 } else { 500 }])
    });
    img.save(path).unwrap();
}

fn pipeline() -> Pipeline {
    Pipeline::new("count", ClassId::new(1))
        .with_source(PipelineSource::FromFile { channel: 0 }, ArtifactKind::Image)
        .step(CommandSettings::Threshold(ThresholdSettings {
            thresholds: vec![ThresholdEntry {
                threshold_min: 10_000,
                ..ThresholdEntry::default()
            }],
        }))
        .step(CommandSettings::Classifier(ClassifierSettings::default()))
        .step(CommandSettings::MeasureIntensity(
            MeasureIntensitySettings::default(),
        ))
}

/// Write a configuration referencing `images` relative to `dir`.
fn write_config(dir: &Path, images: &[&str]) -> std::path::PathBuf {
    let entries = images
        .iter()
        .zip(1..)
        .map(|(path, image_id)| ImageEntry {
            path: (*path).into(),
            series: 0,
            group_id: 1,
            image_id,
            tile_size: None,
        })
        .collect();
    let config = AnalysisConfig::new(entries, vec![pipeline()]);
    let path = dir.join("analysis.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn records(bytes: Vec<u8>) -> Vec<serde_json::Value> {
    String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn counts_objects_in_a_png() {
    let dir = tempfile::tempdir().unwrap();
    write_plane(&dir.path().join("A01.png"));
    let config = load_config(&write_config(dir.path(), &["A01.png"])).unwrap();

    let sink = JsonLinesSink::new(Vec::new());
    let report = Executor::new(&FileImageIo, &sink).run(&config).unwrap();
    assert_eq!(report.completed(), 1, "{}", report.report());

    let records = records(sink.into_inner());
    let tiles: Vec<_> = records.iter().filter(|r| r["record"] == "tile").collect();
    assert_eq!(tiles.len(), 1);
    let objects = tiles[0]["objects"].as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["class_id"], 1);
    assert_eq!(objects[0]["values"]["AREA_SIZE"], 100.0);
    assert_eq!(objects[0]["intensities"][0]["avg"], 50_000.0);
}

#[test]
fn missing_image_is_skipped_and_the_rest_runs() {
    let dir = tempfile::tempdir().unwrap();
    write_plane(&dir.path().join("A01.png"));
    let config = load_config(&write_config(dir.path(), &["missing.png", "A01.png"])).unwrap();

    let sink = JsonLinesSink::new(Vec::new());
    let report = Executor::new(&FileImageIo, &sink).run(&config).unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].image_id, 1);
    assert_eq!(report.completed(), 1);

    let records = records(sink.into_inner());
    assert!(
        records
            .iter()
            .filter(|r| r["record"] == "tile")
            .all(|r| r["key"]["image_id"] == 2)
    );
}
