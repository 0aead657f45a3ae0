//! Destination for carb entries.

use crate::{CarbEntry, MeasurementHandle, Result};

/// Anything that can persist a carb entry
pub trait EntrySink {
    fn submit(&mut self, entry: &CarbEntry) -> Result<MeasurementHandle>;
}

impl<S: EntrySink + ?Sized> EntrySink for &mut S {
    fn submit(&mut self, entry: &CarbEntry) -> Result<MeasurementHandle> {
        (**self).submit(entry)
    }
}
