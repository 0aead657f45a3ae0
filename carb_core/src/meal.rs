//! Meal recording flow.
//!
//! Turns raw form fields into a direct carb entry plus an optional delayed
//! fat/protein entry, then submits both to a sink.

use crate::calculator::{self, MealSource};
use crate::entry::DirectEntryBuilder;
use crate::{
    AbsorptionChoice, CarbEntry, Config, EntrySink, Error, MacroInput, MeasurementHandle, Result,
};
use chrono::{DateTime, Utc};

/// Raw values of a meal form
#[derive(Clone, Debug)]
pub struct MealForm {
    pub carbs: Option<f64>,
    pub fat: Option<f64>,
    pub protein: Option<f64>,
    pub start_date: DateTime<Utc>,
    pub food_type: Option<String>,
    pub absorption: Option<AbsorptionChoice>,
    /// Entry being edited, if any
    pub original: Option<CarbEntry>,
}

impl MealForm {
    pub fn new(start_date: DateTime<Utc>) -> Self {
        Self {
            carbs: None,
            fat: None,
            protein: None,
            start_date,
            food_type: None,
            absorption: None,
            original: None,
        }
    }
}

/// Entries a meal form resolves to
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MealPlan {
    pub direct: Option<CarbEntry>,
    pub fat_protein: Option<CarbEntry>,
}

impl MealPlan {
    pub fn is_empty(&self) -> bool {
        self.direct.is_none() && self.fat_protein.is_none()
    }
}

/// Handles of the entries a plan was stored under
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MealReceipt {
    pub direct: Option<MeasurementHandle>,
    pub fat_protein: Option<MeasurementHandle>,
}

/// Resolve a meal form into entries without side effects.
///
/// When editing, an unchanged form resolves to an empty plan: the
/// fat/protein entry is only recomputed alongside a changed direct entry.
pub fn plan_meal(form: &MealForm, config: &Config, now: DateTime<Utc>) -> Result<MealPlan> {
    let macros = MacroInput::from_form(form.carbs, form.fat, form.protein);
    if !macros.is_submittable() {
        return Err(Error::invalid(
            "enter carbs above 0.1 g, or some fat or protein",
        ));
    }

    let direct = DirectEntryBuilder::new(macros.carb_grams, form.start_date)
        .food_type(form.food_type.clone())
        .absorption(form.absorption)
        .original(form.original.clone())
        .build(&config.absorption, &config.limits, now)?;

    if form.original.is_some() && direct.is_none() {
        return Ok(MealPlan::default());
    }

    let external_id = form.original.as_ref().and_then(|o| o.external_id.as_deref());
    let source = MealSource {
        start_date: form.start_date,
        food_type: form.food_type.as_deref(),
        external_id,
    };
    let fat_protein = calculator::compute(&macros, &source, &config.absorption)?;

    Ok(MealPlan {
        direct,
        fat_protein,
    })
}

/// Submit the direct entry, then the fat/protein entry.
///
/// The first failure is returned as-is; nothing is retried.
pub fn submit_plan<S: EntrySink + ?Sized>(plan: &MealPlan, sink: &mut S) -> Result<MealReceipt> {
    let direct = plan.direct.as_ref().map(|e| sink.submit(e)).transpose()?;
    let fat_protein = plan.fat_protein.as_ref().map(|e| sink.submit(e)).transpose()?;

    tracing::info!(
        "Recorded meal: direct={:?} fat_protein={:?}",
        direct,
        fat_protein
    );

    Ok(MealReceipt {
        direct,
        fat_protein,
    })
}
