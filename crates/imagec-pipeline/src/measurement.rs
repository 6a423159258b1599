//! The closed set of per-object measurements a sink accepts.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::MemoryKey;
use crate::object::Object;
use crate::types::PipelineError;

/// A named measurement column.
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
    strum::IntoStaticStr,
    strum::VariantNames,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Measurement {
    Count,
    Confidence,
    AreaSize,
    Perimeter,
    Circularity,
    CenterOfMassX,
    CenterOfMassY,
    IntensitySum,
    IntensityAvg,
    IntensityMin,
    IntensityMax,
    Intersecting,
    ObjectId,
    OriginObjectId,
    ParentObjectId,
}

impl Measurement {
    /// Parse a measurement name, rejecting unknown names.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for unknown names.
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        Self::from_str(name)
            .map_err(|_| PipelineError::InvalidConfig(format!("unknown measurement `{name}`")))
    }

    /// Returns `true` for measurements that need a plane key.
    #[must_use]
    pub const fn is_intensity(self) -> bool {
        matches!(
            self,
            Self::IntensitySum | Self::IntensityAvg | Self::IntensityMin | Self::IntensityMax
        )
    }

    /// Read this measurement from an object.
    ///
    /// Intensity measurements read the aggregates recorded under `plane`
    /// and yield `None` when nothing was recorded. Identifier columns
    /// yield `None` when the relation is unset.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn value(self, object: &Object, plane: Option<&MemoryKey>) -> Option<f64> {
        let intensity = || plane.and_then(|key| object.intensities().get(key));
        match self {
            Self::Count => Some(1.0),
            Self::Confidence => Some(f64::from(object.confidence())),
            Self::AreaSize => Some(object.area() as f64),
            Self::Perimeter => Some(object.perimeter()),
            Self::Circularity => Some(object.circularity()),
            Self::CenterOfMassX => Some(object.centre_of_mass().x),
            Self::CenterOfMassY => Some(object.centre_of_mass().y),
            Self::IntensitySum => intensity().map(|a| a.sum),
            Self::IntensityAvg => intensity().map(|a| a.avg),
            Self::IntensityMin => intensity().map(|a| a.min),
            Self::IntensityMax => intensity().map(|a| a.max),
            Self::Intersecting => Some(object.overlaps().len() as f64),
            Self::ObjectId => Some(object.id().get() as f64),
            Self::OriginObjectId => object.origin_id().map(|id| id.get() as f64),
            Self::ParentObjectId => object.parent_id().map(|id| id.get() as f64),
        }
    }
}
