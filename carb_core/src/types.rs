//! Core domain types for carb logging.
//!
//! This module defines the fundamental types used throughout the system:
//! - Carb entries (direct and fat/protein derived)
//! - Macro-nutrient input as entered on a meal form
//! - Stored measurements (insulin deliveries and carbs) and their handles

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Carb Entries
// ============================================================================

/// Where a carb entry's numbers came from
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Typed in by the user
    #[default]
    Direct,
    /// Computed from fat and protein by the absorption calculator
    FatProtein,
}

/// A carbohydrate entry ready to be submitted to a sink
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbEntry {
    pub quantity_grams: f64,
    pub start_date: DateTime<Utc>,
    pub food_type: Option<String>,
    pub absorption_time_seconds: f64,
    pub external_id: Option<String>,
    #[serde(default)]
    pub origin: EntryOrigin,
}

impl CarbEntry {
    /// Whether this entry was produced by the fat/protein calculation
    pub fn is_derived(&self) -> bool {
        self.origin == EntryOrigin::FatProtein
    }

    /// Same quantity, date, food type and absorption time.
    ///
    /// External id and origin are ignored.
    pub fn same_content(&self, other: &CarbEntry) -> bool {
        self.quantity_grams == other.quantity_grams
            && self.start_date == other.start_date
            && self.food_type == other.food_type
            && self.absorption_time_seconds == other.absorption_time_seconds
    }
}

/// Preset absorption speeds, or an explicit duration
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AbsorptionChoice {
    Fast,
    Medium,
    Slow,
    Custom { seconds: f64 },
}

impl FromStr for AbsorptionChoice {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(AbsorptionChoice::Fast),
            "medium" => Ok(AbsorptionChoice::Medium),
            "slow" => Ok(AbsorptionChoice::Slow),
            other => Err(crate::Error::invalid(format!(
                "unknown absorption speed '{}' (expected fast, medium or slow)",
                other
            ))),
        }
    }
}

// ============================================================================
// Macro Input
// ============================================================================

/// Grams of carbohydrate recorded when the carb field is left empty.
///
/// Keeps a timestamped marker of the meal even when only fat/protein was entered.
pub const EMPTY_CARB_MARKER_GRAMS: f64 = 0.1;

/// Macro-nutrient quantities of a meal, in grams
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MacroInput {
    pub carb_grams: f64,
    pub fat_grams: f64,
    pub protein_grams: f64,
}

impl MacroInput {
    pub fn new(carb_grams: f64, fat_grams: f64, protein_grams: f64) -> Self {
        Self {
            carb_grams,
            fat_grams,
            protein_grams,
        }
    }

    /// Build from raw form fields.
    ///
    /// Negative values clamp to zero. A missing carb value becomes
    /// [`EMPTY_CARB_MARKER_GRAMS`]; missing fat/protein become zero.
    pub fn from_form(carbs: Option<f64>, fat: Option<f64>, protein: Option<f64>) -> Self {
        Self {
            carb_grams: carbs.map(clamp_field).unwrap_or(EMPTY_CARB_MARKER_GRAMS),
            fat_grams: fat.map(clamp_field).unwrap_or(0.0),
            protein_grams: protein.map(clamp_field).unwrap_or(0.0),
        }
    }

    /// Reject negative or non-finite quantities
    pub fn validate(&self) -> crate::Result<()> {
        for (name, value) in [
            ("carb", self.carb_grams),
            ("fat", self.fat_grams),
            ("protein", self.protein_grams),
        ] {
            if !value.is_finite() {
                return Err(crate::Error::invalid(format!(
                    "{} grams must be a finite number",
                    name
                )));
            }
            if value < 0.0 {
                return Err(crate::Error::invalid(format!(
                    "{} grams must not be negative (got {})",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// At least one macro is large enough to be worth recording
    pub fn is_submittable(&self) -> bool {
        self.carb_grams > EMPTY_CARB_MARKER_GRAMS || self.fat_grams > 0.0 || self.protein_grams > 0.0
    }
}

fn clamp_field(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}

// ============================================================================
// Measurements
// ============================================================================

/// Opaque identity of a stored measurement
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MeasurementHandle(Uuid);

impl MeasurementHandle {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MeasurementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MeasurementHandle {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::invalid(format!("invalid measurement handle '{}': {}", s, e)))
    }
}

/// Kind-specific fields of a measurement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementDetail {
    /// Insulin delivery; `unit_value` is in units
    Delivery,
    /// Carbohydrate entry; `unit_value` is in grams
    Carb {
        food_type: Option<String>,
        absorption_time_seconds: f64,
        #[serde(default)]
        origin: EntryOrigin,
    },
}

impl MeasurementDetail {
    pub fn kind_name(&self) -> &'static str {
        match self {
            MeasurementDetail::Delivery => "delivery",
            MeasurementDetail::Carb { .. } => "carb",
        }
    }
}

/// A measurement as held by the store. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub handle: MeasurementHandle,
    pub created_at: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub unit_value: f64,
    pub external_id: Option<String>,
    pub detail: MeasurementDetail,
}

impl Measurement {
    /// View a carb measurement as the entry it was recorded from
    pub fn as_carb_entry(&self) -> Option<CarbEntry> {
        match &self.detail {
            MeasurementDetail::Carb {
                food_type,
                absorption_time_seconds,
                origin,
            } => Some(CarbEntry {
                quantity_grams: self.unit_value,
                start_date: self.start_date,
                food_type: food_type.clone(),
                absorption_time_seconds: *absorption_time_seconds,
                external_id: self.external_id.clone(),
                origin: *origin,
            }),
            MeasurementDetail::Delivery => None,
        }
    }

    pub fn is_delivery(&self) -> bool {
        matches!(self.detail, MeasurementDetail::Delivery)
    }
}

/// A record to be appended; the store assigns handle and creation time
#[derive(Clone, Debug, PartialEq)]
pub struct NewMeasurement {
    pub start_date: DateTime<Utc>,
    pub unit_value: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub detail: MeasurementDetail,
}

impl NewMeasurement {
    /// An insulin delivery of `units` at `start_date`
    pub fn delivery(start_date: DateTime<Utc>, units: f64) -> Self {
        Self {
            start_date,
            unit_value: units,
            created_at: None,
            external_id: None,
            detail: MeasurementDetail::Delivery,
        }
    }
}

impl From<&CarbEntry> for NewMeasurement {
    fn from(entry: &CarbEntry) -> Self {
        Self {
            start_date: entry.start_date,
            unit_value: entry.quantity_grams,
            created_at: None,
            external_id: entry.external_id.clone(),
            detail: MeasurementDetail::Carb {
                food_type: entry.food_type.clone(),
                absorption_time_seconds: entry.absorption_time_seconds,
                origin: entry.origin,
            },
        }
    }
}

/// Shift a date by fractional seconds (millisecond precision).
///
/// `None` when the offset or the resulting date is out of range.
pub fn offset_by_secs(date: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let delta = Duration::try_milliseconds((seconds * 1000.0).round() as i64)?;
    date.checked_add_signed(delta)
}
