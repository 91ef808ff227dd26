//! Shot-type classification and pose slot mapping.
//!
//! Batch items carry a loosely structured view tag (or only a source URL).
//! The classifier turns that text into a [`ViewClass`] using ordered
//! pattern predicates; the first matching rule wins. Each view class then
//! fans out into the shot types that need generating, and each shot type
//! maps onto one pose slot in the brand library.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Categorical shot tag carried by every output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShotType {
    FrontFull,
    FrontCropped,
    BackFull,
    Detail,
}

impl ShotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShotType::FrontFull => "FRONT_FULL",
            ShotType::FrontCropped => "FRONT_CROPPED",
            ShotType::BackFull => "BACK_FULL",
            ShotType::Detail => "DETAIL",
        }
    }

    /// Library slot holding poses for this shot.
    pub fn slot(&self) -> PoseSlot {
        match self {
            ShotType::FrontFull => PoseSlot::A,
            ShotType::FrontCropped => PoseSlot::B,
            ShotType::BackFull => PoseSlot::C,
            ShotType::Detail => PoseSlot::D,
        }
    }

    /// Whether candidate poses are further narrowed by product type.
    pub fn filters_by_product(&self) -> bool {
        matches!(self, ShotType::FrontCropped | ShotType::Detail)
    }
}

impl fmt::Display for ShotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShotType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FRONT_FULL" => Ok(ShotType::FrontFull),
            "FRONT_CROPPED" => Ok(ShotType::FrontCropped),
            "BACK_FULL" => Ok(ShotType::BackFull),
            "DETAIL" => Ok(ShotType::Detail),
            other => Err(format!("unknown shot type '{}'", other)),
        }
    }
}

/// Pose library slot letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoseSlot {
    A,
    B,
    C,
    D,
}

impl PoseSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoseSlot::A => "A",
            PoseSlot::B => "B",
            PoseSlot::C => "C",
            PoseSlot::D => "D",
        }
    }
}

impl fmt::Display for PoseSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoseSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(PoseSlot::A),
            "B" => Ok(PoseSlot::B),
            "C" => Ok(PoseSlot::C),
            "D" => Ok(PoseSlot::D),
            other => Err(format!("unknown pose slot '{}'", other)),
        }
    }
}

/// Facing of the source shot, as inferred from its tag or URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewClass {
    FrontFacing,
    BackFacing,
    DetailShot,
    Unknown,
}

const FRONT_ONLY: &[ShotType] = &[ShotType::FrontFull, ShotType::FrontCropped, ShotType::Detail];

impl ViewClass {
    /// Shot types generated for an item of this class.
    ///
    /// Unknown views are treated as front-facing.
    pub fn shot_types(&self) -> &'static [ShotType] {
        match self {
            ViewClass::BackFacing => &[ShotType::BackFull],
            ViewClass::DetailShot => &[ShotType::Detail],
            ViewClass::FrontFacing | ViewClass::Unknown => FRONT_ONLY,
        }
    }
}

/// One ordered classification rule.
struct Rule {
    class: ViewClass,
    needles: &'static [&'static str],
}

/// Evaluated top to bottom; the first rule with a matching needle wins.
const RULES: &[Rule] = &[
    Rule {
        class: ViewClass::BackFacing,
        needles: &["back", "_b.", "_back"],
    },
    Rule {
        class: ViewClass::DetailShot,
        needles: &["detail", "close"],
    },
    Rule {
        class: ViewClass::FrontFacing,
        needles: &["front", "_f.", "_front", "_ff", "_fc"],
    },
];

/// Classifies a view tag or source URL.
pub fn classify_view(text: &str) -> ViewClass {
    let lowered = text.to_ascii_lowercase();
    RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| lowered.contains(needle)))
        .map(|rule| rule.class)
        .unwrap_or(ViewClass::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_view_tags() {
        assert_eq!(classify_view("back"), ViewClass::BackFacing);
        assert_eq!(classify_view("Detail"), ViewClass::DetailShot);
        assert_eq!(classify_view("close-up"), ViewClass::DetailShot);
        assert_eq!(classify_view("FRONT"), ViewClass::FrontFacing);
        assert_eq!(classify_view("side"), ViewClass::Unknown);
    }

    #[test]
    fn test_classify_view_url_heuristics() {
        assert_eq!(
            classify_view("https://cdn.example.com/sku123_b.jpg"),
            ViewClass::BackFacing
        );
        assert_eq!(
            classify_view("https://cdn.example.com/sku123_f.jpg"),
            ViewClass::FrontFacing
        );
        assert_eq!(
            classify_view("https://cdn.example.com/sku123_ff_2.png"),
            ViewClass::FrontFacing
        );
        assert_eq!(
            classify_view("https://cdn.example.com/sku123_fc.png"),
            ViewClass::FrontFacing
        );
        assert_eq!(
            classify_view("https://cdn.example.com/sku123.png"),
            ViewClass::Unknown
        );
    }

    #[test]
    fn test_rule_order_back_before_front() {
        assert_eq!(classify_view("front_back_combo"), ViewClass::BackFacing);
        assert_eq!(classify_view("front detail"), ViewClass::DetailShot);
    }

    #[test]
    fn test_shot_types_per_class() {
        assert_eq!(ViewClass::BackFacing.shot_types(), &[ShotType::BackFull]);
        assert_eq!(ViewClass::DetailShot.shot_types(), &[ShotType::Detail]);
        assert_eq!(ViewClass::FrontFacing.shot_types().len(), 3);
        assert_eq!(
            ViewClass::Unknown.shot_types(),
            ViewClass::FrontFacing.shot_types()
        );
    }

    #[test]
    fn test_shot_slots() {
        assert_eq!(ShotType::FrontFull.slot(), PoseSlot::A);
        assert_eq!(ShotType::FrontCropped.slot(), PoseSlot::B);
        assert_eq!(ShotType::BackFull.slot(), PoseSlot::C);
        assert_eq!(ShotType::Detail.slot(), PoseSlot::D);
        assert!(ShotType::FrontCropped.filters_by_product());
        assert!(ShotType::Detail.filters_by_product());
        assert!(!ShotType::FrontFull.filters_by_product());
    }

    #[test]
    fn test_shot_type_strings() {
        assert_eq!("BACK_FULL".parse::<ShotType>().unwrap(), ShotType::BackFull);
        assert!("SIDE".parse::<ShotType>().is_err());
        assert_eq!(
            serde_json::to_string(&ShotType::FrontCropped).unwrap(),
            "\"FRONT_CROPPED\""
        );
        assert_eq!(" b ".parse::<PoseSlot>().unwrap(), PoseSlot::B);
    }
}
