//! Write-ahead journal for measurement persistence.
//!
//! Store mutations are appended to a JSONL (JSON Lines) file. Replaying the
//! journal in order rebuilds the store.
//!
//! Every access first locks a sidecar `.lock` file next to the journal. The
//! journal itself is replaced by rename on compaction, so locking the journal
//! file would leave a writer holding a lock on an unlinked inode.

use crate::{Error, Measurement, MeasurementHandle, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One journaled store mutation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    Append { measurement: Measurement },
    Delete { handle: MeasurementHandle },
    Replace {
        handle: MeasurementHandle,
        measurement: Measurement,
    },
}

/// JSONL journal file with locking
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Journal {
    /// Create a journal for the given path; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Open (creating if needed) the sidecar lock file
    fn lock_file(&self) -> Result<File> {
        std::fs::create_dir_all(self.parent_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        Ok(file)
    }

    /// Append one operation and flush it before returning
    pub fn append(&self, op: &JournalOp) -> Result<()> {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = self.append_locked(op);
        lock.unlock()?;
        result
    }

    fn append_locked(&self, op: &JournalOp) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // A crash mid-write can leave a torn last line; start on a fresh one
        let torn = ends_mid_line(&mut file)?;

        let mut writer = std::io::BufWriter::new(&file);
        if torn {
            writer.write_all(b"\n")?;
        }
        let line = serde_json::to_string(op)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Read every operation in file order.
    ///
    /// Lines that are not valid UTF-8 JSON are logged and skipped.
    pub fn read_ops(&self) -> Result<Vec<JournalOp>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let result = self.read_ops_locked();
        lock.unlock()?;
        result
    }

    fn read_ops_locked(&self) -> Result<Vec<JournalOp>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let reader = BufReader::new(file);
        let mut ops = Vec::new();

        for (line_num, line_result) in reader.split(b'\n').enumerate() {
            let line = line_result?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<JournalOp>(&line) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable journal entry at line {}: {}",
                        line_num + 1,
                        e
                    );
                }
            }
        }

        tracing::debug!("Read {} operations from journal", ops.len());
        Ok(ops)
    }

    /// Atomically replace the journal with one append per live record.
    ///
    /// The current operations are re-read under the exclusive lock and passed
    /// to `rebuild`, so appends made by other processes since this journal
    /// was last read are kept. Returns the live records written.
    pub fn rewrite_with<F>(&self, rebuild: F) -> Result<Vec<Measurement>>
    where
        F: FnOnce(Vec<JournalOp>) -> Vec<Measurement>,
    {
        let lock = self.lock_file()?;
        lock.lock_exclusive()?;
        let result = self
            .read_ops_locked()
            .map(rebuild)
            .and_then(|live| self.write_live(&live).map(|()| live));
        lock.unlock()?;

        let live = result?;
        tracing::info!("Rewrote journal {:?} with {} records", self.path, live.len());
        Ok(live)
    }

    fn write_live(&self, live: &[Measurement]) -> Result<()> {
        let temp = NamedTempFile::new_in(self.parent_dir())?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for measurement in live {
                let op = JournalOp::Append {
                    measurement: measurement.clone(),
                };
                serde_json::to_writer(&mut writer, &op)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::from(e.error))?;
        Ok(())
    }
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MeasurementDetail;
    use chrono::Utc;

    fn create_test_measurement(units: f64) -> Measurement {
        Measurement {
            handle: MeasurementHandle::generate(),
            created_at: Utc::now(),
            start_date: Utc::now(),
            unit_value: units,
            external_id: None,
            detail: MeasurementDetail::Delivery,
        }
    }

    #[test]
    fn test_append_and_read_ops() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(temp_dir.path().join("m.jsonl"));

        let m = create_test_measurement(1.5);
        journal
            .append(&JournalOp::Append {
                measurement: m.clone(),
            })
            .unwrap();
        journal.append(&JournalOp::Delete { handle: m.handle }).unwrap();

        let ops = journal.read_ops().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], JournalOp::Append { measurement: m.clone() });
        assert_eq!(ops[1], JournalOp::Delete { handle: m.handle });
    }

    #[test]
    fn test_read_missing_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(temp_dir.path().join("nonexistent.jsonl"));
        assert!(journal.read_ops().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("m.jsonl");
        let journal = Journal::new(&path);

        journal
            .append(&JournalOp::Append {
                measurement: create_test_measurement(2.0),
            })
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();
        drop(file);
        journal
            .append(&JournalOp::Append {
                measurement: create_test_measurement(3.0),
            })
            .unwrap();

        assert_eq!(journal.read_ops().unwrap().len(), 2);
    }

    #[test]
    fn test_append_after_torn_line_starts_fresh_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("m.jsonl");
        std::fs::write(&path, r#"{"op":"append","measurement":{"hand"#).unwrap();

        let journal = Journal::new(&path);
        let m = create_test_measurement(1.0);
        journal.append(&JournalOp::Append { measurement: m.clone() }).unwrap();

        let ops = journal.read_ops().unwrap();
        assert_eq!(ops, vec![JournalOp::Append { measurement: m }]);
    }

    #[test]
    fn test_non_utf8_line_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("m.jsonl");
        let journal = Journal::new(&path);

        let m = create_test_measurement(1.0);
        journal.append(&JournalOp::Append { measurement: m.clone() }).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\xff\xfe garbage\n").unwrap();
        drop(file);

        let ops = journal.read_ops().unwrap();
        assert_eq!(ops, vec![JournalOp::Append { measurement: m }]);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let temp_dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(temp_dir.path().join("m.jsonl"));

        for units in [1.0, 2.0, 3.0] {
            let m = create_test_measurement(units);
            journal.append(&JournalOp::Append { measurement: m.clone() }).unwrap();
            journal.append(&JournalOp::Delete { handle: m.handle }).unwrap();
        }
        let keep = create_test_measurement(4.0);
        let written = journal
            .rewrite_with(|ops| {
                assert_eq!(ops.len(), 6);
                vec![keep.clone()]
            })
            .unwrap();
        assert_eq!(written, vec![keep.clone()]);

        let ops = journal.read_ops().unwrap();
        assert_eq!(ops, vec![JournalOp::Append { measurement: keep }]);

        // Only the journal and its lock file remain
        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["m.jsonl", "m.lock"]);
    }

    #[test]
    fn test_rewrite_sees_appends_from_another_handle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("m.jsonl");
        let compactor = Journal::new(&path);
        let writer = Journal::new(&path);

        let first = create_test_measurement(1.0);
        compactor
            .append(&JournalOp::Append { measurement: first.clone() })
            .unwrap();
        let late = create_test_measurement(2.0);
        writer
            .append(&JournalOp::Append { measurement: late.clone() })
            .unwrap();

        let live = compactor
            .rewrite_with(|ops| {
                ops.into_iter()
                    .filter_map(|op| match op {
                        JournalOp::Append { measurement } => Some(measurement),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap();
        assert_eq!(live, vec![first, late]);
    }
}
