//! Fat/protein carb-equivalent calculation.
//!
//! Fat and protein raise blood glucose hours after a meal. This module turns
//! their calories into "fat-protein units" (FPU) and emits a synthetic carb
//! entry that starts after an onset delay and absorbs over a square-wave
//! window:
//!
//! - FPU = (protein × 4 + fat × 9) / calories-per-unit ratio
//! - carb equivalent = FPU × 10 × low-carb multiplier
//! - duration = min(2 + FPU + 3, 16) hours
//!
//! The low-carb multiplier weights fat and protein at 50% for a carb-free
//! meal, rising linearly to full weight at 40 g of carbs.

use crate::{offset_by_secs, AbsorptionConfig, CarbEntry, EntryOrigin, Error, MacroInput, Result};
use chrono::{DateTime, Utc};

/// Carbs at or above which fat and protein count at full weight
pub const FULL_WEIGHT_CARB_GRAMS: f64 = 40.0;

/// Upper bound of the square-wave window, in hours
pub const MAX_SQUARE_WAVE_HOURS: f64 = 16.0;

/// Smallest carb equivalent worth emitting, in grams
pub const MIN_EMITTED_GRAMS: f64 = 1.0;

/// Intermediate values of one calculation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FpuBreakdown {
    pub protein_calories: f64,
    pub fat_calories: f64,
    pub low_carb_multiplier: f64,
    pub fpu: f64,
    pub carb_equivalent_grams: f64,
    pub square_wave_duration_hours: f64,
}

/// The meal a derived entry is attached to
#[derive(Clone, Debug)]
pub struct MealSource<'a> {
    pub start_date: DateTime<Utc>,
    pub food_type: Option<&'a str>,
    pub external_id: Option<&'a str>,
}

impl<'a> MealSource<'a> {
    pub fn at(start_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            food_type: None,
            external_id: None,
        }
    }
}

/// Weight of fat and protein for a meal with the given carbs, in `[0.5, 1.0]`
pub fn low_carb_multiplier(carb_grams: f64) -> f64 {
    if carb_grams >= FULL_WEIGHT_CARB_GRAMS {
        1.0
    } else {
        (carb_grams / 80.0) + 0.5
    }
}

/// Square-wave absorption window for a given FPU, capped at 16 hours
pub fn square_wave_duration_hours(fpu: f64) -> f64 {
    // Two hours from the published model, three more for the tail of an
    // extended bolus.
    (2.0 + fpu + 3.0).min(MAX_SQUARE_WAVE_HOURS)
}

/// Run steps 1-5 of the calculation. Inputs are assumed validated.
pub fn breakdown(macros: &MacroInput, calories_per_unit_ratio: f64) -> FpuBreakdown {
    let protein_calories = macros.protein_grams * 4.0;
    let fat_calories = macros.fat_grams * 9.0;
    let low_carb_multiplier = low_carb_multiplier(macros.carb_grams);
    let fpu = (protein_calories + fat_calories) / calories_per_unit_ratio;
    let carb_equivalent_grams = fpu * 10.0 * low_carb_multiplier;

    FpuBreakdown {
        protein_calories,
        fat_calories,
        low_carb_multiplier,
        fpu,
        carb_equivalent_grams,
        square_wave_duration_hours: square_wave_duration_hours(fpu),
    }
}

/// Compute the delayed fat/protein carb entry for a meal.
///
/// Returns `Ok(None)` when the meal is below the recording threshold or the
/// carb equivalent is under 1 g. Fails with `InvalidInput` on negative or
/// non-finite macros, or when the delayed start date is out of range.
///
/// The absorption window never exceeds `config.max_absorption_seconds`.
pub fn compute(
    macros: &MacroInput,
    source: &MealSource<'_>,
    config: &AbsorptionConfig,
) -> Result<Option<CarbEntry>> {
    macros.validate()?;

    if !macros.is_submittable() {
        return Ok(None);
    }

    let b = breakdown(macros, config.calories_per_unit_ratio);

    if b.carb_equivalent_grams < MIN_EMITTED_GRAMS {
        tracing::debug!(
            "Carb equivalent {:.2} g below threshold, no fat/protein entry",
            b.carb_equivalent_grams
        );
        return Ok(None);
    }

    tracing::debug!(
        "FPU {:.2} (multiplier {:.3}) -> {:.1} g over {:.1} h",
        b.fpu,
        b.low_carb_multiplier,
        b.carb_equivalent_grams,
        b.square_wave_duration_hours
    );

    let start_date = offset_by_secs(source.start_date, config.onset_delay_seconds).ok_or_else(
        || {
            Error::invalid(format!(
                "meal date {} plus an onset delay of {} s is out of range",
                source.start_date.to_rfc3339(),
                config.onset_delay_seconds
            ))
        },
    )?;
    let absorption_time_seconds =
        (b.square_wave_duration_hours * 3600.0).min(config.max_absorption_seconds);

    Ok(Some(CarbEntry {
        quantity_grams: b.carb_equivalent_grams,
        start_date,
        food_type: source.food_type.map(str::to_owned),
        absorption_time_seconds,
        external_id: source.external_id.map(str::to_owned),
        origin: EntryOrigin::FatProtein,
    }))
}
