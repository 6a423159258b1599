//! Class identifiers.
//!
//! [`ClassId`] is the concrete identifier stored on objects and written
//! into label masks. [`ClassIdIn`] is what settings refer to: a concrete
//! class, the pipeline default (`"$"`), or one of the pipeline-scoped
//! `TEMP_*` registers. [`ClassIdIn::resolve`] turns the latter into the
//! former at execution time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Concrete class identifier. The raw value doubles as the pixel label
/// in binary masks, so [`ClassId::NONE`] (0) is the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(u16);

/// First raw value reserved for `TEMP_*` registers.
const TEMP_BASE: u16 = 0xFF00;

impl ClassId {
    /// No class; the background label.
    pub const NONE: Self = Self(0);
    /// Placeholder for an unresolved class.
    pub const UNDEFINED: Self = Self(u16::MAX);

    /// Create a class identifier from its raw value.
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw value, also the pixel label.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns `true` for the reserved `TEMP_*` registers.
    #[must_use]
    pub const fn is_temp(self) -> bool {
        self.0 > TEMP_BASE && self.0 <= TEMP_BASE + TempSlot::COUNT
    }

    /// Returns `true` for classes that may be published.
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 != Self::NONE.0 && self.0 != Self::UNDEFINED.0 && !self.is_temp()
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "NONE"),
            Self::UNDEFINED => write!(f, "UNDEFINED"),
            c if c.is_temp() => match TempSlot::from_raw(c.0 - TEMP_BASE) {
                Some(slot) => write!(f, "{slot}"),
                None => write!(f, "{}", c.0),
            },
            c => write!(f, "{}", c.0),
        }
    }
}

/// Pipeline-scoped class registers. Cleared when the pipeline finishes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum TempSlot {
    /// `TEMP_01`
    #[strum(serialize = "TEMP_01")]
    Temp01,
    /// `TEMP_02`
    #[strum(serialize = "TEMP_02")]
    Temp02,
    /// `TEMP_03`
    #[strum(serialize = "TEMP_03")]
    Temp03,
    /// `TEMP_04`
    #[strum(serialize = "TEMP_04")]
    Temp04,
    /// `TEMP_LAST`
    #[strum(serialize = "TEMP_LAST")]
    TempLast,
}

impl TempSlot {
    const COUNT: u16 = 5;

    const fn raw(self) -> u16 {
        match self {
            Self::Temp01 => 1,
            Self::Temp02 => 2,
            Self::Temp03 => 3,
            Self::Temp04 => 4,
            Self::TempLast => 5,
        }
    }

    const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Temp01),
            2 => Some(Self::Temp02),
            3 => Some(Self::Temp03),
            4 => Some(Self::Temp04),
            5 => Some(Self::TempLast),
            _ => None,
        }
    }

    /// The concrete class backing this register.
    #[must_use]
    pub const fn class_id(self) -> ClassId {
        ClassId(TEMP_BASE + self.raw())
    }
}

/// A class reference as written in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "ClassIdRepr", into = "ClassIdRepr")]
pub enum ClassIdIn {
    /// `"$"`: the enclosing pipeline's default class.
    #[default]
    Default,
    /// `"NONE"`: no class.
    None,
    /// A concrete class.
    Class(ClassId),
    /// A pipeline-scoped register.
    Temp(TempSlot),
}

impl ClassIdIn {
    /// Resolve against the pipeline's default class.
    #[must_use]
    pub const fn resolve(self, pipeline_default: ClassId) -> ClassId {
        match self {
            Self::Default => pipeline_default,
            Self::None => ClassId::NONE,
            Self::Class(c) => c,
            Self::Temp(slot) => slot.class_id(),
        }
    }
}

impl From<ClassId> for ClassIdIn {
    fn from(c: ClassId) -> Self {
        Self::Class(c)
    }
}

impl From<TempSlot> for ClassIdIn {
    fn from(slot: TempSlot) -> Self {
        Self::Temp(slot)
    }
}

/// Serde proxy: classes appear as numbers or reserved names.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ClassIdRepr {
    Number(u16),
    Name(String),
}

impl TryFrom<ClassIdRepr> for ClassIdIn {
    type Error = String;

    fn try_from(repr: ClassIdRepr) -> Result<Self, Self::Error> {
        match repr {
            ClassIdRepr::Number(n) if n >= TEMP_BASE => {
                Err(format!("class id {n} is in the reserved range"))
            }
            ClassIdRepr::Number(0) => Ok(Self::None),
            ClassIdRepr::Number(n) => Ok(Self::Class(ClassId(n))),
            ClassIdRepr::Name(name) => match name.as_str() {
                "$" => Ok(Self::Default),
                "NONE" => Ok(Self::None),
                other => other
                    .parse::<TempSlot>()
                    .map(Self::Temp)
                    .map_err(|_| format!("unknown class reference `{other}`")),
            },
        }
    }
}

impl From<ClassIdIn> for ClassIdRepr {
    fn from(c: ClassIdIn) -> Self {
        match c {
            ClassIdIn::Default => Self::Name("$".into()),
            ClassIdIn::None => Self::Name("NONE".into()),
            ClassIdIn::Class(id) => Self::Number(id.0),
            ClassIdIn::Temp(slot) => Self::Name(slot.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_resolves_to_pipeline_class() {
        let default = ClassId::new(7);
        assert_eq!(ClassIdIn::Default.resolve(default), default);
        assert_eq!(ClassIdIn::Class(ClassId::new(3)).resolve(default), ClassId::new(3));
        assert_eq!(ClassIdIn::None.resolve(default), ClassId::NONE);
    }

    #[test]
    fn temp_slots_are_distinct_and_reserved() {
        use strum::IntoEnumIterator;
        let ids: Vec<ClassId> = TempSlot::iter().map(TempSlot::class_id).collect();
        for (i, a) in ids.iter().enumerate() {
            assert!(a.is_temp());
            assert!(!a.is_user());
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(ClassId::new(12).is_user());
        assert!(!ClassId::NONE.is_user());
    }

    #[test]
    fn deserializes_numbers_and_names() {
        let parsed: Vec<ClassIdIn> =
            serde_json::from_str(r#"[4, "$", "TEMP_02", "TEMP_LAST", "NONE", 0]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ClassIdIn::Class(ClassId::new(4)),
                ClassIdIn::Default,
                ClassIdIn::Temp(TempSlot::Temp02),
                ClassIdIn::Temp(TempSlot::TempLast),
                ClassIdIn::None,
                ClassIdIn::None,
            ]
        );
    }

    #[test]
    fn rejects_unknown_names_and_reserved_numbers() {
        assert!(serde_json::from_str::<ClassIdIn>(r#""TEMP_09""#).is_err());
        assert!(serde_json::from_str::<ClassIdIn>("65280").is_err());
    }

    #[test]
    fn serializes_round_trip_names() {
        let json = serde_json::to_string(&ClassIdIn::Temp(TempSlot::Temp01)).unwrap();
        assert_eq!(json, r#""TEMP_01""#);
        let json = serde_json::to_string(&ClassIdIn::Default).unwrap();
        assert_eq!(json, r#""$""#);
    }

    #[test]
    fn display_uses_register_names() {
        assert_eq!(TempSlot::Temp03.class_id().to_string(), "TEMP_03");
        assert_eq!(ClassId::new(9).to_string(), "9");
        assert_eq!(ClassId::NONE.to_string(), "NONE");
    }
}
