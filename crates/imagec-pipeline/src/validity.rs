//! Validity flags: a 32-bit bitset of per-image annotations.
//!
//! Bit positions are a stable contract with the results sink and must
//! never be renumbered.

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::class_id::ClassId;
use crate::image_plane::PlaneId;

/// Named validity bits.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidityFlag {
    /// Bit 0.
    Unknown,
    /// Bit 1.
    Invalid,
    /// Bit 2.
    ManualOutSorted,
    /// Bit 3.
    PossibleNoise,
    /// Bit 4.
    PossibleWrongThreshold,
}

impl ValidityFlag {
    /// Stable bit position.
    #[must_use]
    pub const fn position(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Invalid => 1,
            Self::ManualOutSorted => 2,
            Self::PossibleNoise => 3,
            Self::PossibleWrongThreshold => 4,
        }
    }

    /// Mask with only this flag's bit set.
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << self.position()
    }
}

/// A set of validity flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Validity(u32);

impl Validity {
    /// No flags set.
    pub const EMPTY: Self = Self(0);

    /// Wrap raw bits as read from a sink.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Set a flag.
    pub const fn insert(&mut self, flag: ValidityFlag) {
        self.0 |= flag.bit();
    }

    /// This set plus `flag`.
    #[must_use]
    pub const fn with(self, flag: ValidityFlag) -> Self {
        Self(self.0 | flag.bit())
    }

    /// Returns `true` if `flag` is set.
    #[must_use]
    pub const fn contains(self, flag: ValidityFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// Returns `true` if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Named flags that are set.
    pub fn flags(self) -> impl Iterator<Item = ValidityFlag> {
        <ValidityFlag as strum::IntoEnumIterator>::iter().filter(move |f| self.contains(*f))
    }
}

impl From<ValidityFlag> for Validity {
    fn from(flag: ValidityFlag) -> Self {
        Self(flag.bit())
    }
}

impl BitOr for Validity {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Validity {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where a validator writes its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidityScope {
    /// The whole image.
    #[default]
    InvalidateImage,
    /// Only the current plane.
    InvalidateImagePlane,
    /// Only the current `(plane, class)` pair.
    InvalidateImagePlaneClass,
}

/// Serde support for maps with structured keys as `[key, value]` pairs,
/// since JSON object keys must be strings.
mod entries_serde {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a map as a sequence of `(key, value)` pairs.
    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        K: Serialize,
        V: Serialize,
    {
        serializer.collect_seq(map.iter())
    }

    /// Deserialize a map from a sequence of `(key, value)` pairs.
    pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
    where
        D: Deserializer<'de>,
        K: Deserialize<'de> + Ord,
        V: Deserialize<'de>,
    {
        Vec::<(K, V)>::deserialize(deserializer).map(|pairs| pairs.into_iter().collect())
    }
}

/// Validity accumulated by one tile, at every scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileValidity {
    /// Image-level bits.
    pub image: Validity,
    /// Plane-level bits.
    #[serde(with = "entries_serde")]
    pub planes: BTreeMap<PlaneId, Validity>,
    /// `(plane, class)`-level bits.
    #[serde(with = "entries_serde")]
    pub plane_classes: BTreeMap<(PlaneId, ClassId), Validity>,
}

impl TileValidity {
    /// Record `flag` at `scope`.
    pub fn mark(&mut self, scope: ValidityScope, flag: ValidityFlag, plane: PlaneId, class_id: ClassId) {
        match scope {
            ValidityScope::InvalidateImage => self.image.insert(flag),
            ValidityScope::InvalidateImagePlane => {
                self.planes.entry(plane).or_default().insert(flag);
            }
            ValidityScope::InvalidateImagePlaneClass => {
                self.plane_classes
                    .entry((plane, class_id))
                    .or_default()
                    .insert(flag);
            }
        }
    }

    /// OR another tile's validity into this one.
    pub fn merge(&mut self, other: &Self) {
        self.image |= other.image;
        for (plane, bits) in &other.planes {
            *self.planes.entry(*plane).or_default() |= *bits;
        }
        for (key, bits) in &other.plane_classes {
            *self.plane_classes.entry(*key).or_default() |= *bits;
        }
    }

    /// Returns `true` if nothing was flagged at any scope.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
            && self.planes.values().all(|v| v.is_empty())
            && self.plane_classes.values().all(|v| v.is_empty())
    }
}
