//! Append-only measurement store.
//!
//! Records are kept sorted by `start_date`, ties in insertion order. Writers
//! serialize on a single lock and journal each mutation before applying it.
//! Readers take a cheap snapshot of the sequence and iterate it without
//! holding the lock, so a query never observes a partial write.

use crate::journal::{Journal, JournalOp};
use crate::{
    CarbEntry, EntrySink, Error, Measurement, MeasurementHandle, NewMeasurement, Result,
};
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Timestamped store of delivery and carb measurements
#[derive(Debug)]
pub struct MeasurementStore {
    records: RwLock<Arc<Vec<Measurement>>>,
    journal: Option<Journal>,
}

impl Default for MeasurementStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MeasurementStore {
    /// A store with no backing file
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Arc::new(Vec::new())),
            journal: None,
        }
    }

    /// Open a journaled store, replaying any existing journal
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let journal = Journal::new(path);
        let records = replay(journal.read_ops()?);

        tracing::info!(
            "Opened measurement store {:?} with {} records",
            journal.path(),
            records.len()
        );

        Ok(Self {
            records: RwLock::new(Arc::new(records)),
            journal: Some(journal),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(Journal::path)
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Vec<Measurement>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Vec<Measurement>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, op: &JournalOp) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(op),
            None => Ok(()),
        }
    }

    /// Append a record, assigning a handle and a creation time if absent
    pub fn append(&self, record: NewMeasurement) -> Result<MeasurementHandle> {
        validate(&record)?;

        let measurement = Measurement {
            handle: MeasurementHandle::generate(),
            created_at: record.created_at.unwrap_or_else(Utc::now),
            start_date: record.start_date,
            unit_value: record.unit_value,
            external_id: record.external_id,
            detail: record.detail,
        };
        let handle = measurement.handle;

        let mut guard = self.write();
        self.log(&JournalOp::Append {
            measurement: measurement.clone(),
        })?;
        insert_sorted(Arc::make_mut(&mut *guard), measurement);

        tracing::debug!("Appended measurement {}", handle);
        Ok(handle)
    }

    /// Records with `start_date` in `[range.start, range.end)`, oldest first
    pub fn query(&self, range: Range<DateTime<Utc>>, limit: Option<usize>) -> MeasurementQuery {
        let snapshot = Arc::clone(&*self.read());
        let start = snapshot.partition_point(|m| m.start_date < range.start);
        let end = snapshot.partition_point(|m| m.start_date < range.end).max(start);

        MeasurementQuery {
            snapshot,
            next: start,
            end,
            remaining: limit,
        }
    }

    /// Carb entries in range, paired with their handles
    pub fn carb_entries(
        &self,
        range: Range<DateTime<Utc>>,
    ) -> impl Iterator<Item = (MeasurementHandle, CarbEntry)> {
        self.query(range, None)
            .filter_map(|m| m.as_carb_entry().map(|entry| (m.handle, entry)))
    }

    pub fn get(&self, handle: MeasurementHandle) -> Option<Measurement> {
        self.read().iter().find(|m| m.handle == handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove a record and return it
    pub fn delete(&self, handle: MeasurementHandle) -> Result<Measurement> {
        let mut guard = self.write();
        let idx = position(&guard, handle).ok_or(Error::NotFound(handle))?;

        self.log(&JournalOp::Delete { handle })?;
        let removed = Arc::make_mut(&mut *guard).remove(idx);

        tracing::debug!("Deleted measurement {}", handle);
        Ok(removed)
    }

    /// Replace a record with a new one in a single step.
    ///
    /// The replacement gets a fresh handle and inherits the old external id
    /// when it has none of its own.
    pub fn replace(
        &self,
        handle: MeasurementHandle,
        record: NewMeasurement,
    ) -> Result<MeasurementHandle> {
        validate(&record)?;

        let mut guard = self.write();
        let idx = position(&guard, handle).ok_or(Error::NotFound(handle))?;

        let measurement = Measurement {
            handle: MeasurementHandle::generate(),
            created_at: record.created_at.unwrap_or_else(Utc::now),
            start_date: record.start_date,
            unit_value: record.unit_value,
            external_id: record
                .external_id
                .or_else(|| guard[idx].external_id.clone()),
            detail: record.detail,
        };
        let new_handle = measurement.handle;

        self.log(&JournalOp::Replace {
            handle,
            measurement: measurement.clone(),
        })?;
        let records = Arc::make_mut(&mut *guard);
        records.remove(idx);
        insert_sorted(records, measurement);

        tracing::debug!("Replaced measurement {} with {}", handle, new_handle);
        Ok(new_handle)
    }

    /// Rewrite the journal to hold only live records. Returns the record count.
    ///
    /// The journal is replayed again under its lock, so records appended by
    /// other processes since this store was opened survive and become
    /// visible here.
    pub fn compact(&self) -> Result<usize> {
        let mut guard = self.write();
        let Some(journal) = &self.journal else {
            return Ok(guard.len());
        };

        let live = journal.rewrite_with(replay)?;
        let count = live.len();
        *guard = Arc::new(live);
        Ok(count)
    }
}

impl EntrySink for MeasurementStore {
    fn submit(&mut self, entry: &CarbEntry) -> Result<MeasurementHandle> {
        self.append(NewMeasurement::from(entry))
    }
}

/// Lazy iterator over a snapshot of the store
#[derive(Clone, Debug)]
pub struct MeasurementQuery {
    snapshot: Arc<Vec<Measurement>>,
    next: usize,
    end: usize,
    remaining: Option<usize>,
}

impl Iterator for MeasurementQuery {
    type Item = Measurement;

    fn next(&mut self) -> Option<Measurement> {
        if self.next >= self.end || self.remaining == Some(0) {
            return None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        let item = self.snapshot[self.next].clone();
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.end.saturating_sub(self.next);
        let n = self.remaining.map_or(left, |r| r.min(left));
        (n, Some(n))
    }
}

impl ExactSizeIterator for MeasurementQuery {}

fn validate(record: &NewMeasurement) -> Result<()> {
    if !record.unit_value.is_finite() || record.unit_value < 0.0 {
        return Err(Error::invalid(format!(
            "measurement value must be a non-negative number (got {})",
            record.unit_value
        )));
    }
    Ok(())
}

fn position(records: &[Measurement], handle: MeasurementHandle) -> Option<usize> {
    records.iter().position(|m| m.handle == handle)
}

fn insert_sorted(records: &mut Vec<Measurement>, measurement: Measurement) {
    let idx = records.partition_point(|m| m.start_date <= measurement.start_date);
    records.insert(idx, measurement);
}

fn replay(ops: Vec<JournalOp>) -> Vec<Measurement> {
    let mut records = Vec::new();
    for op in ops {
        match op {
            JournalOp::Append { measurement } => {
                if position(&records, measurement.handle).is_some() {
                    tracing::warn!("Duplicate handle {} in journal, skipping", measurement.handle);
                    continue;
                }
                insert_sorted(&mut records, measurement);
            }
            JournalOp::Delete { handle } => match position(&records, handle) {
                Some(idx) => {
                    records.remove(idx);
                }
                None => tracing::warn!("Journal deletes unknown handle {}", handle),
            },
            JournalOp::Replace {
                handle,
                measurement,
            } => {
                match position(&records, handle) {
                    Some(idx) => {
                        records.remove(idx);
                    }
                    None => tracing::warn!("Journal replaces unknown handle {}", handle),
                }
                insert_sorted(&mut records, measurement);
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryOrigin, MeasurementDetail};
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn all() -> Range<DateTime<Utc>> {
        t(-100_000)..t(100_000)
    }

    fn carb(grams: f64, at: DateTime<Utc>) -> CarbEntry {
        CarbEntry {
            quantity_grams: grams,
            start_date: at,
            food_type: None,
            absorption_time_seconds: 10_800.0,
            external_id: Some(format!("ext-{}", grams)),
            origin: EntryOrigin::Direct,
        }
    }

    #[test]
    fn test_append_then_query_roundtrip() {
        let store = MeasurementStore::in_memory();
        let handle = store.append(NewMeasurement::delivery(t(0), 2.35)).unwrap();

        let found: Vec<_> = store.query(t(-1)..t(1), None).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, handle);
        assert_eq!(found[0].start_date, t(0));
        assert_eq!(found[0].unit_value, 2.35);
    }

    #[test]
    fn test_created_at_assigned_unless_given() {
        let store = MeasurementStore::in_memory();
        let before = Utc::now();
        let a = store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();

        let mut explicit = NewMeasurement::delivery(t(1), 1.0);
        explicit.created_at = Some(t(-60));
        let b = store.append(explicit).unwrap();

        assert!(store.get(a).unwrap().created_at >= before);
        assert_eq!(store.get(b).unwrap().created_at, t(-60));
    }

    #[test]
    fn test_query_orders_by_start_date_then_insertion() {
        let store = MeasurementStore::in_memory();
        let late = store.append(NewMeasurement::delivery(t(30), 1.0)).unwrap();
        let tie_a = store.append(NewMeasurement::delivery(t(10), 2.0)).unwrap();
        let early = store.append(NewMeasurement::delivery(t(0), 3.0)).unwrap();
        let tie_b = store.append(NewMeasurement::delivery(t(10), 4.0)).unwrap();

        let order: Vec<_> = store.query(all(), None).map(|m| m.handle).collect();
        assert_eq!(order, vec![early, tie_a, tie_b, late]);
    }

    #[test]
    fn test_query_range_is_half_open_and_limited() {
        let store = MeasurementStore::in_memory();
        for minutes in 0..10 {
            store
                .append(NewMeasurement::delivery(t(minutes * 10), minutes as f64))
                .unwrap();
        }

        let values: Vec<_> = store.query(t(20)..t(50), None).map(|m| m.unit_value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);

        let limited = store.query(t(0)..t(100), Some(2));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited.map(|m| m.unit_value).collect::<Vec<_>>(), vec![0.0, 1.0]);

        assert_eq!(store.query(t(50)..t(20), None).count(), 0);
    }

    #[test]
    fn test_query_is_restartable_snapshot() {
        let store = MeasurementStore::in_memory();
        store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();

        let first = store.query(all(), None);
        store.append(NewMeasurement::delivery(t(1), 2.0)).unwrap();

        // The earlier query sees its own snapshot; a fresh one sees the append
        assert_eq!(first.count(), 1);
        assert_eq!(store.query(all(), None).count(), 2);
    }

    #[test]
    fn test_delete_unknown_handle_is_not_found() {
        let store = MeasurementStore::in_memory();
        let handle = store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();

        store.delete(handle).unwrap();
        assert!(matches!(store.delete(handle), Err(Error::NotFound(h)) if h == handle));
        assert!(store.is_empty());
    }

    #[test]
    fn test_negative_value_rejected() {
        let store = MeasurementStore::in_memory();
        let result = store.append(NewMeasurement::delivery(t(0), -1.0));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_carries_external_id() {
        let mut store = MeasurementStore::in_memory();
        let handle = store.submit(&carb(30.0, t(0))).unwrap();

        let mut edited = carb(45.0, t(5));
        edited.external_id = None;
        let new_handle = store.replace(handle, NewMeasurement::from(&edited)).unwrap();

        assert_ne!(new_handle, handle);
        assert!(store.get(handle).is_none());
        let entry = store.get(new_handle).unwrap().as_carb_entry().unwrap();
        assert_eq!(entry.quantity_grams, 45.0);
        assert_eq!(entry.external_id.as_deref(), Some("ext-30"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_unknown_handle_leaves_store_untouched() {
        let store = MeasurementStore::in_memory();
        store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();
        let stale = MeasurementHandle::generate();

        let result = store.replace(stale, NewMeasurement::delivery(t(1), 2.0));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_carb_entries_skip_deliveries() {
        let mut store = MeasurementStore::in_memory();
        store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();
        store.submit(&carb(20.0, t(1))).unwrap();

        let entries: Vec<_> = store.carb_entries(all()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.quantity_grams, 20.0);
    }

    #[test]
    fn test_journal_replay_restores_state() {
        crate::logging::init_test();
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("measurements.jsonl");

        let (kept, replaced_with) = {
            let mut store = MeasurementStore::open(&path).unwrap();
            let kept = store.append(NewMeasurement::delivery(t(0), 1.25)).unwrap();
            let gone = store.append(NewMeasurement::delivery(t(5), 3.0)).unwrap();
            let edited = store.submit(&carb(30.0, t(10))).unwrap();
            store.delete(gone).unwrap();
            let replaced_with = store
                .replace(edited, NewMeasurement::from(&carb(35.0, t(12))))
                .unwrap();
            (kept, replaced_with)
        };

        let store = MeasurementStore::open(&path).unwrap();
        let records: Vec<_> = store.query(all(), None).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].handle, kept);
        assert_eq!(records[0].unit_value, 1.25);
        assert_eq!(records[0].start_date, t(0));
        assert_eq!(records[1].handle, replaced_with);
        assert!(matches!(records[1].detail, MeasurementDetail::Carb { .. }));
    }

    #[test]
    fn test_compact_keeps_live_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("measurements.jsonl");

        let store = MeasurementStore::open(&path).unwrap();
        for minutes in 0..5 {
            let h = store.append(NewMeasurement::delivery(t(minutes), 1.0)).unwrap();
            if minutes % 2 == 1 {
                store.delete(h).unwrap();
            }
        }
        assert_eq!(store.compact().unwrap(), 3);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let reopened = MeasurementStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn test_compact_keeps_appends_made_after_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("measurements.jsonl");

        let compactor = MeasurementStore::open(&path).unwrap();
        compactor.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();

        // Another process appends after the compactor loaded its snapshot
        let other = MeasurementStore::open(&path).unwrap();
        let late = other.append(NewMeasurement::delivery(t(5), 2.0)).unwrap();

        assert_eq!(compactor.compact().unwrap(), 2);
        assert!(compactor.get(late).is_some());

        let reopened = MeasurementStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.get(late).is_some());
    }

    #[test]
    fn test_open_skips_non_utf8_journal_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("measurements.jsonl");

        let store = MeasurementStore::open(&path).unwrap();
        store.append(NewMeasurement::delivery(t(0), 1.0)).unwrap();
        let mut contents = std::fs::read(&path).unwrap();
        contents.extend_from_slice(b"\xff\xfe garbage\n");
        std::fs::write(&path, contents).unwrap();

        let reopened = MeasurementStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_storage_failure_leaves_memory_unchanged() {
        let temp_dir = tempfile::tempdir().unwrap();
        // A directory where the journal file should be makes every write fail
        let path = temp_dir.path().join("journal");
        std::fs::create_dir(&path).unwrap();
        let store = MeasurementStore {
            records: RwLock::new(Arc::new(Vec::new())),
            journal: Some(Journal::new(&path)),
        };

        let result = store.append(NewMeasurement::delivery(t(0), 1.0));
        assert!(result.unwrap_err().is_storage_failure());
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_appends_and_queries() {
        let store = Arc::new(MeasurementStore::in_memory());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store
                            .append(NewMeasurement::delivery(t(i), w as f64))
                            .unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let dates: Vec<_> = store.query(all(), None).map(|m| m.start_date).collect();
                    assert!(dates.windows(2).all(|w| w[0] <= w[1]));
                }
            })
        };

        for handle in writers {
            handle.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(store.len(), 200);
    }
}
