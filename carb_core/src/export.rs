//! CSV export of stored measurements.

use crate::{Measurement, MeasurementDetail, MeasurementStore, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::ops::Range;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    handle: String,
    kind: &'static str,
    start_date: String,
    created_at: String,
    unit_value: f64,
    food_type: Option<String>,
    absorption_time_seconds: Option<f64>,
    origin: Option<&'static str>,
    external_id: Option<String>,
}

impl From<&Measurement> for CsvRow {
    fn from(m: &Measurement) -> Self {
        let (food_type, absorption_time_seconds, origin) = match &m.detail {
            MeasurementDetail::Delivery => (None, None, None),
            MeasurementDetail::Carb {
                food_type,
                absorption_time_seconds,
                origin,
            } => (
                food_type.clone(),
                Some(*absorption_time_seconds),
                Some(match origin {
                    crate::EntryOrigin::Direct => "direct",
                    crate::EntryOrigin::FatProtein => "fat_protein",
                }),
            ),
        };

        CsvRow {
            handle: m.handle.to_string(),
            kind: m.detail.kind_name(),
            start_date: m.start_date.to_rfc3339(),
            created_at: m.created_at.to_rfc3339(),
            unit_value: m.unit_value,
            food_type,
            absorption_time_seconds,
            origin,
            external_id: m.external_id.clone(),
        }
    }
}

/// Write measurements in `range` to a CSV file, replacing it.
///
/// Returns the number of rows written. The file is synced before returning.
pub fn export_csv(
    store: &MeasurementStore,
    range: Range<DateTime<Utc>>,
    path: &Path,
) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(file);

    let mut count = 0;
    for measurement in store.query(range, None) {
        writer.serialize(CsvRow::from(&measurement))?;
        count += 1;
    }

    // An empty export still gets a header line
    if count == 0 {
        writer.write_record([
            "handle",
            "kind",
            "start_date",
            "created_at",
            "unit_value",
            "food_type",
            "absorption_time_seconds",
            "origin",
            "external_id",
        ])?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    file.sync_all()?;

    tracing::info!("Exported {} measurements to {:?}", count, path);
    Ok(count)
}
