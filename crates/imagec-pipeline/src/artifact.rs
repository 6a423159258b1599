//! Artifact kinds and the input/output capabilities commands declare.
//!
//! Every value flowing between steps is one of three kinds: a grayscale
//! [`Image`](ArtifactKind::Image), a label mask
//! ([`Binary`](ArtifactKind::Binary)), or an object set
//! ([`Object`](ArtifactKind::Object)). A command accepts a non-empty
//! [`ArtifactSet`] and produces an [`OutputKind`], which may defer to
//! whatever kind reached it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of artifact kinds.
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
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    /// Dense grayscale (or RGB) pixel data.
    Image,
    /// Pixels are class labels in `{0, c1, c2, ...}`.
    Binary,
    /// An object set.
    Object,
}

impl ArtifactKind {
    const fn bit(self) -> u8 {
        match self {
            Self::Image => 0b001,
            Self::Binary => 0b010,
            Self::Object => 0b100,
        }
    }
}

/// A set of artifact kinds, used for a command's accepted inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactSet(u8);

impl ArtifactSet {
    /// Accepts grayscale images only.
    pub const IMAGE: Self = Self(0b001);
    /// Accepts label masks only.
    pub const BINARY: Self = Self(0b010);
    /// Accepts object sets only.
    pub const OBJECT: Self = Self(0b100);
    /// Accepts either pixel kind.
    pub const PIXELS: Self = Self(0b011);
    /// Accepts every kind.
    pub const ANY: Self = Self(0b111);

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if `kind` is a member.
    #[must_use]
    pub const fn contains(self, kind: ArtifactKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns `true` if the set has no members.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the members in declaration order.
    pub fn kinds(self) -> impl Iterator<Item = ArtifactKind> {
        <ArtifactKind as strum::IntoEnumIterator>::iter().filter(move |k| self.contains(*k))
    }
}

impl From<ArtifactKind> for ArtifactSet {
    fn from(kind: ArtifactKind) -> Self {
        Self(kind.bit())
    }
}

impl fmt::Display for ArtifactSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.kinds().map(|k| k.to_string()).collect();
        if names.len() == 1 {
            write!(f, "{}", names[0])
        } else {
            write!(f, "{{{}}}", names.join(", "))
        }
    }
}

/// What a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputKind {
    /// Produces a grayscale image.
    Image,
    /// Produces a label mask.
    Binary,
    /// Produces objects.
    Object,
    /// Passes through whatever kind reached the command.
    OutputEqualToInput,
}

impl OutputKind {
    /// Resolve the produced kind given the kind that reached the command.
    #[must_use]
    pub const fn resolve(self, incoming: ArtifactKind) -> ArtifactKind {
        match self {
            Self::Image => ArtifactKind::Image,
            Self::Binary => ArtifactKind::Binary,
            Self::Object => ArtifactKind::Object,
            Self::OutputEqualToInput => incoming,
        }
    }
}

/// A command's declared capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InOut {
    /// Accepted input kinds (never empty).
    pub input: ArtifactSet,
    /// Produced kind.
    pub output: OutputKind,
}

impl InOut {
    /// Create a capability pair.
    #[must_use]
    pub const fn new(input: ArtifactSet, output: OutputKind) -> Self {
        Self { input, output }
    }

    /// `IMAGE -> IMAGE`-style pixel transform that keeps the incoming kind.
    #[must_use]
    pub const fn pass_through(input: ArtifactSet) -> Self {
        Self::new(input, OutputKind::OutputEqualToInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_membership() {
        assert!(ArtifactSet::PIXELS.contains(ArtifactKind::Image));
        assert!(ArtifactSet::PIXELS.contains(ArtifactKind::Binary));
        assert!(!ArtifactSet::PIXELS.contains(ArtifactKind::Object));
        assert!(ArtifactSet::ANY.contains(ArtifactKind::Object));
        assert_eq!(
            ArtifactSet::IMAGE.union(ArtifactSet::BINARY),
            ArtifactSet::PIXELS
        );
    }

    #[test]
    fn set_display() {
        assert_eq!(ArtifactSet::OBJECT.to_string(), "OBJECT");
        assert_eq!(ArtifactSet::PIXELS.to_string(), "{IMAGE, BINARY}");
    }

    #[test]
    fn equal_to_input_resolves_to_incoming() {
        assert_eq!(
            OutputKind::OutputEqualToInput.resolve(ArtifactKind::Binary),
            ArtifactKind::Binary
        );
        assert_eq!(
            OutputKind::Object.resolve(ArtifactKind::Image),
            ArtifactKind::Object
        );
    }

    #[test]
    fn kind_parses_from_name() {
        assert_eq!("BINARY".parse::<ArtifactKind>().ok(), Some(ArtifactKind::Binary));
        assert!("PIXELS".parse::<ArtifactKind>().is_err());
    }
}
