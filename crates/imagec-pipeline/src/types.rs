//! Shared types for the imagec pipeline engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactKind, ArtifactSet};
use crate::diagnostics::CompileLog;

/// A 2D point in tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image or tile dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Axis-aligned pixel rectangle. `x`/`y` is the top-left pixel,
/// `width`/`height` are always positive for a non-empty box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left pixel column.
    pub x: u32,
    /// Top pixel row.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl BoundingBox {
    /// Create a new bounding box.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// One past the rightmost column.
    #[must_use]
    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    /// One past the bottom row.
    #[must_use]
    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Returns `true` if the pixel `(x, y)` lies inside the box.
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Returns `true` if the box touches the border of a region of the
    /// given dimensions.
    #[must_use]
    pub const fn touches_border(&self, dims: Dimensions) -> bool {
        self.x == 0 || self.y == 0 || self.right() >= dims.width || self.bottom() >= dims.height
    }

    /// Overlapping region of two boxes, or `None` if they are disjoint.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x0 < x1 && y0 < y1).then(|| Self::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Self::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Geometric centre of the box.
    #[must_use]
    pub fn centre(&self) -> Point {
        Point::new(
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }
}

/// Why a tile stopped at a step boundary before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The caller fired the cancel token.
    Cancelled,
    /// The per-tile time budget was exceeded.
    Timeout(#[serde(with = "crate::diagnostics::duration_serde")] Duration),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout(limit) => write!(f, "timed out after {:.3}s", limit.as_secs_f64()),
        }
    }
}

/// Errors that can occur while configuring or running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A step does not accept the artifact kind reaching it.
    #[error("pipeline `{pipeline}` step {step}: expected {expected}, got {got}")]
    TypeMismatch {
        /// Name of the pipeline containing the step.
        pipeline: String,
        /// Zero-based index of the offending step.
        step: usize,
        /// The step's accepted input kinds.
        expected: ArtifactSet,
        /// The effective upstream output kind.
        got: ArtifactKind,
    },

    /// A cache read found no entry for a referenced memory slot.
    #[error("step {step}: no cached artifact for {key}")]
    MissingArtifact {
        /// Zero-based index of the step that issued the read.
        step: usize,
        /// Display form of the missing key.
        key: String,
    },

    /// A step's options are out of range or internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The compile log contains at least one error entry.
    #[error("configuration rejected with {} error(s)", .0.error_count())]
    ConfigRejected(CompileLog),

    /// Image I/O, model inference, or a sink write failed.
    #[error("external collaborator failed: {0}")]
    External(String),

    /// Cooperative cancellation or the tile timeout fired.
    #[error("tile stopped: {0}")]
    TileTimeout(StopReason),

    /// Overflow or NaN while computing a measurement.
    #[error("arithmetic fault: {0}")]
    ArithmeticFault(String),

    /// A control image could not be encoded.
    #[error("failed to encode image: {0}")]
    ImageEncode(#[from] image::ImageError),
}
