//! Resolution of the "as entered" carb entry.
//!
//! Applies default absorption times, enforces entry limits and suppresses
//! resubmission of an edited entry that didn't actually change.

use crate::{
    offset_by_secs, AbsorptionChoice, AbsorptionConfig, CarbEntry, EntryLimits, EntryOrigin,
    Error, Result,
};
use chrono::{DateTime, Utc};

/// Builder for a directly entered carb entry
#[derive(Clone, Debug)]
pub struct DirectEntryBuilder {
    quantity_grams: f64,
    start_date: DateTime<Utc>,
    food_type: Option<String>,
    absorption: Option<AbsorptionChoice>,
    original: Option<CarbEntry>,
}

impl DirectEntryBuilder {
    pub fn new(quantity_grams: f64, start_date: DateTime<Utc>) -> Self {
        Self {
            quantity_grams,
            start_date,
            food_type: None,
            absorption: None,
            original: None,
        }
    }

    /// Start from an existing entry being edited
    pub fn editing(original: CarbEntry) -> Self {
        Self {
            quantity_grams: original.quantity_grams,
            start_date: original.start_date,
            food_type: original.food_type.clone(),
            absorption: Some(AbsorptionChoice::Custom {
                seconds: original.absorption_time_seconds,
            }),
            original: Some(original),
        }
    }

    pub fn quantity(mut self, grams: f64) -> Self {
        self.quantity_grams = grams;
        self
    }

    pub fn start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = start_date;
        self
    }

    pub fn food_type(mut self, food_type: Option<String>) -> Self {
        self.food_type = food_type;
        self
    }

    pub fn absorption(mut self, choice: Option<AbsorptionChoice>) -> Self {
        self.absorption = choice;
        self
    }

    /// Entry being edited; used for change detection and external id
    pub fn original(mut self, original: Option<CarbEntry>) -> Self {
        self.original = original;
        self
    }

    /// Resolve the entry.
    ///
    /// Returns `Ok(None)` when an original was given and nothing changed.
    pub fn build(
        &self,
        config: &AbsorptionConfig,
        limits: &EntryLimits,
        now: DateTime<Utc>,
    ) -> Result<Option<CarbEntry>> {
        if !self.quantity_grams.is_finite() || self.quantity_grams < 0.0 {
            return Err(Error::invalid(format!(
                "carb quantity must be a non-negative number (got {})",
                self.quantity_grams
            )));
        }
        if self.quantity_grams > limits.max_quantity_grams {
            return Err(Error::invalid(format!(
                "carb quantity {} g exceeds the maximum of {} g",
                self.quantity_grams, limits.max_quantity_grams
            )));
        }

        let absorption_time_seconds = config.resolve(self.absorption);
        if !(absorption_time_seconds > 0.0) {
            return Err(Error::invalid("absorption time must be positive"));
        }
        if absorption_time_seconds > config.max_absorption_seconds {
            return Err(Error::invalid(format!(
                "absorption time {:.1} h exceeds the maximum of {:.1} h",
                absorption_time_seconds / 3600.0,
                config.max_absorption_seconds / 3600.0
            )));
        }

        let latest = offset_by_secs(now, limits.max_future_seconds).ok_or_else(|| {
            Error::invalid(format!(
                "future-entry limit of {} s is out of range",
                limits.max_future_seconds
            ))
        })?;
        if self.start_date > latest {
            return Err(Error::invalid(format!(
                "entry date {} is too far in the future",
                self.start_date.to_rfc3339()
            )));
        }

        let entry = CarbEntry {
            quantity_grams: self.quantity_grams,
            start_date: self.start_date,
            food_type: self.food_type.clone(),
            absorption_time_seconds,
            external_id: self.original.as_ref().and_then(|o| o.external_id.clone()),
            origin: EntryOrigin::Direct,
        };

        if let Some(original) = &self.original {
            if original.same_content(&entry) {
                tracing::debug!("Entry unchanged from original, nothing to submit");
                return Ok(None);
            }
        }

        Ok(Some(entry))
    }
}
