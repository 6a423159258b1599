//! Compile log, run log, and per-tile run reports.
//!
//! The compile log collects `check()` findings and type-compatibility
//! errors before anything runs. The run report collects what each tile
//! did: its final state, per-step timings, and the warnings raised while
//! it ran.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactKind;
use crate::class_id::ClassId;
use crate::sink::TileKey;
use crate::tile::TileOutcome;
use crate::validity::{TileValidity, Validity};

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Severity of a log entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

// ───── Compile log ─────────────────────────────────────────────────

/// One finding from configuration-time checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileEntry {
    /// How serious the finding is.
    pub severity: Severity,
    /// Name of the pipeline the finding belongs to.
    pub pipeline: String,
    /// Zero-based step index, or `None` for pipeline-level findings.
    pub step: Option<usize>,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for CompileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(
                f,
                "[{}] {} step {step}: {}",
                self.severity, self.pipeline, self.message
            ),
            None => write!(f, "[{}] {}: {}", self.severity, self.pipeline, self.message),
        }
    }
}

/// Aggregated configuration-time findings.
///
/// A run is refused when the log holds any [`Severity::Error`] entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileLog {
    entries: Vec<CompileEntry>,
}

impl CompileLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(
        &mut self,
        severity: Severity,
        pipeline: &str,
        step: Option<usize>,
        message: impl Into<String>,
    ) {
        self.entries.push(CompileEntry {
            severity,
            pipeline: pipeline.to_owned(),
            step,
            message: message.into(),
        });
    }

    /// A view that tags entries with one pipeline step.
    pub fn step<'a>(&'a mut self, pipeline: &'a str, step: usize) -> StepLog<'a> {
        StepLog {
            log: self,
            pipeline,
            step: Some(step),
        }
    }

    /// A view that tags entries with a pipeline but no step.
    pub fn pipeline<'a>(&'a mut self, pipeline: &'a str) -> StepLog<'a> {
        StepLog {
            log: self,
            pipeline,
            step: None,
        }
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[CompileEntry] {
        &self.entries
    }

    /// Number of error entries.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    /// Number of entries with the given severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.entries.iter().filter(|e| e.severity == severity).count()
    }

    /// Returns `true` if any entry is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Move every entry of `other` into this log.
    pub fn append(&mut self, other: &mut Self) {
        self.entries.append(&mut other.entries);
    }

    /// Format the log as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::with_capacity(self.entries.len() + 2);
        lines.push(format!("Compile Log\n{}", "=".repeat(60)));
        for entry in &self.entries {
            lines.push(entry.to_string());
        }
        lines.push(format!(
            "{} error(s), {} warning(s), {} info",
            self.error_count(),
            self.count(Severity::Warning),
            self.count(Severity::Info),
        ));
        lines.join("\n")
    }
}

/// A [`CompileLog`] borrowed for one step's `check()`.
#[derive(Debug)]
pub struct StepLog<'a> {
    log: &'a mut CompileLog,
    pipeline: &'a str,
    step: Option<usize>,
}

impl StepLog<'_> {
    /// Record an error; the run will be refused.
    pub fn error(&mut self, message: impl Into<String>) {
        self.log.push(Severity::Error, self.pipeline, self.step, message);
    }

    /// Record a warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.log.push(Severity::Warning, self.pipeline, self.step, message);
    }

    /// Record an informational note.
    pub fn info(&mut self, message: impl Into<String>) {
        self.log.push(Severity::Info, self.pipeline, self.step, message);
    }

    /// Record an error unless `ok` holds.
    pub fn require(&mut self, ok: bool, message: impl Into<String>) {
        if !ok {
            self.error(message);
        }
    }
}

// ───── Run log ─────────────────────────────────────────────────────

/// A warning or note raised while a tile ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// How serious the entry is.
    pub severity: Severity,
    /// Pipeline that raised it.
    pub pipeline: String,
    /// Step that raised it.
    pub step: Option<usize>,
    /// Human-readable description.
    pub message: String,
}

/// Wall-clock time spent in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    /// Pipeline the step belongs to.
    pub pipeline: String,
    /// Zero-based step index.
    pub step: usize,
    /// Command name.
    pub command: String,
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// A control image produced by a save-image step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlImageInfo {
    /// File name suggested to the sink.
    pub name: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

/// What one tile iteration did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileReport {
    /// Position of this iteration in the run.
    pub index: usize,
    /// Sink key of the tile.
    pub key: TileKey,
    /// Focal plane of the iteration.
    pub z: u32,
    /// Terminal state.
    pub outcome: TileOutcome,
    /// Objects handed to the sink, by class.
    pub objects_by_class: Vec<(ClassId, usize)>,
    /// Validity the tile produced.
    pub validity: TileValidity,
    /// Warnings raised while running.
    pub log: Vec<RunLogEntry>,
    /// Per-step timings.
    pub steps: Vec<StepDiagnostics>,
    /// Control images handed to the sink.
    pub control_images: Vec<ControlImageInfo>,
    /// Kind of the active artifact when the tile stopped.
    pub last_artifact: Option<ArtifactKind>,
    /// Wall-clock duration of the whole iteration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl TileReport {
    /// Total objects handed to the sink.
    #[must_use]
    pub fn objects_published(&self) -> usize {
        self.objects_by_class.iter().map(|(_, n)| n).sum()
    }
}

/// Image-level validity after all tiles of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageValidity {
    /// Image identifier.
    pub image_id: u64,
    /// OR of every tile's image-level bits.
    pub validity: Validity,
}

/// An image the run could not process at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedImage {
    /// Image identifier.
    pub image_id: u64,
    /// Why it was skipped.
    pub error: String,
}

/// Everything a run produced besides what went to the sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Configuration-time findings (warnings and info only, since runs
    /// with errors are refused).
    pub compile_log: CompileLog,
    /// One report per tile iteration, in iteration order.
    pub tiles: Vec<TileReport>,
    /// Per-image validity.
    pub images: Vec<ImageValidity>,
    /// Images that could not be opened or planned.
    #[serde(default)]
    pub skipped: Vec<SkippedImage>,
    /// Set if the cancel token fired during the run.
    pub cancelled: bool,
}

impl RunReport {
    /// Number of tiles that reached `Done`.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.tiles.iter().filter(|t| t.outcome.is_done()).count()
    }

    /// Number of tiles that did not reach `Done`.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.tiles.len() - self.completed()
    }

    /// Total objects published across all tiles.
    #[must_use]
    pub fn objects_published(&self) -> usize {
        self.tiles.iter().map(TileReport::objects_published).sum()
    }

    /// Format the report as a human-readable summary.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Run Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "{:<8} {:<22} {:>10} {:>8}  {}",
            "Tile", "Key", "Duration", "Objects", "Outcome"
        ));
        lines.push("-".repeat(80));
        for tile in &self.tiles {
            let key = format!(
                "i{} x{} y{} t{} z{}",
                tile.key.image_id, tile.key.tile_x, tile.key.tile_y, tile.key.t_stack, tile.z
            );
            lines.push(format!(
                "{:<8} {key:<22} {:>8.3}ms {:>8}  {}",
                tile.index,
                duration_ms(tile.duration),
                tile.objects_published(),
                tile.outcome,
            ));
            for entry in &tile.log {
                lines.push(format!("         [{}] {}", entry.severity, entry.message));
            }
        }
        lines.push(String::new());
        for image in &self.images {
            let flags: Vec<String> = image.validity.flags().map(|f| f.to_string()).collect();
            let flags = if flags.is_empty() {
                "valid".to_owned()
            } else {
                flags.join(", ")
            };
            lines.push(format!("Image {}: {flags}", image.image_id));
        }
        for image in &self.skipped {
            lines.push(format!("Image {}: skipped ({})", image.image_id, image.error));
        }
        lines.push(format!(
            "Tiles: {} done, {} failed  |  Objects: {}{}",
            self.completed(),
            self.failed(),
            self.objects_published(),
            if self.cancelled { "  |  cancelled" } else { "" },
        ));
        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
