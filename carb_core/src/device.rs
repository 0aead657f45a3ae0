//! Device manager capability and state persistence.
//!
//! A device manager can describe itself, snapshot its state as a JSON
//! object and be rebuilt from that snapshot. State files are written
//! atomically with file locking, like the rest of the data directory.

use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Serialized manager state
pub type RawState = Map<String, Value>;

/// A device that can be saved and restored
pub trait DeviceManager: Sized {
    /// Unique identifier of the manager type
    const MANAGER_IDENTIFIER: &'static str;

    /// Human-readable name of the manager type
    const LOCALIZED_TITLE: &'static str;

    fn localized_title(&self) -> &str {
        Self::LOCALIZED_TITLE
    }

    /// Current state, suitable for [`DeviceManager::restore`]
    fn serialize_state(&self) -> RawState;

    /// Rebuild from saved state; `None` if the state is unusable
    fn restore(state: &RawState) -> Option<Self>;
}

/// On-disk envelope for a manager's state
#[derive(Debug, Serialize, Deserialize)]
struct DeviceStateFile {
    manager_identifier: String,
    state: RawState,
}

/// Save a manager's state atomically
pub fn save_manager<M: DeviceManager>(manager: &M, path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let envelope = DeviceStateFile {
        manager_identifier: M::MANAGER_IDENTIFIER.to_string(),
        state: manager.serialize_state(),
    };

    let temp = NamedTempFile::new_in(parent)?;
    temp.as_file().lock_exclusive()?;
    {
        let mut writer = std::io::BufWriter::new(temp.as_file());
        serde_json::to_writer(&mut writer, &envelope)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.as_file().unlock()?;
    temp.persist(path).map_err(|e| Error::from(e.error))?;

    tracing::debug!("Saved {} state to {:?}", M::MANAGER_IDENTIFIER, path);
    Ok(())
}

/// Load a manager from its state file.
///
/// Missing, unreadable or foreign state files yield `Ok(None)` with a warning.
pub fn load_manager<M: DeviceManager>(path: &Path) -> Result<Option<M>> {
    if !path.exists() {
        tracing::debug!("No device state at {:?}", path);
        return Ok(None);
    }

    let file = File::open(path)?;
    file.lock_shared()?;
    let mut contents = Vec::new();
    let read = std::io::BufReader::new(&file).read_to_end(&mut contents);
    file.unlock()?;
    if let Err(e) = read {
        tracing::warn!("Failed to read device state {:?}: {}. Ignoring.", path, e);
        return Ok(None);
    }

    let envelope: DeviceStateFile = match serde_json::from_slice(&contents) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Failed to parse device state {:?}: {}. Ignoring.", path, e);
            return Ok(None);
        }
    };

    if envelope.manager_identifier != M::MANAGER_IDENTIFIER {
        tracing::warn!(
            "Device state {:?} belongs to {}, expected {}",
            path,
            envelope.manager_identifier,
            M::MANAGER_IDENTIFIER
        );
        return Ok(None);
    }

    let manager = M::restore(&envelope.state);
    if manager.is_none() {
        tracing::warn!("Invalid {} state in {:?}", M::MANAGER_IDENTIFIER, path);
    }
    Ok(manager)
}

// ============================================================================
// Manual injections
// ============================================================================

/// Pen or syringe injections logged by hand
#[derive(Clone, Debug, PartialEq)]
pub struct ManualInjectionManager {
    /// Smallest dose step the pen can dial
    pub dose_increment_units: f64,
    pub max_bolus_units: f64,
}

impl Default for ManualInjectionManager {
    fn default() -> Self {
        Self {
            dose_increment_units: 0.5,
            max_bolus_units: 20.0,
        }
    }
}

impl ManualInjectionManager {
    pub fn new(dose_increment_units: f64, max_bolus_units: f64) -> Result<Self> {
        if !(dose_increment_units.is_finite() && dose_increment_units > 0.0) {
            return Err(Error::invalid("dose increment must be positive"));
        }
        if !(max_bolus_units.is_finite() && max_bolus_units >= dose_increment_units) {
            return Err(Error::invalid(
                "maximum bolus must be at least one dose increment",
            ));
        }
        Ok(Self {
            dose_increment_units,
            max_bolus_units,
        })
    }

    /// Round a requested dose to the nearest deliverable increment
    pub fn round_dose(&self, units: f64) -> Result<f64> {
        if !units.is_finite() || units <= 0.0 {
            return Err(Error::invalid(format!(
                "dose must be a positive number of units (got {})",
                units
            )));
        }
        let steps = (units / self.dose_increment_units).round();
        // Trim float noise from the multiplication (0.1 * 23 = 2.3000000000000003)
        let rounded = (steps * self.dose_increment_units * 1000.0).round() / 1000.0;
        if rounded <= 0.0 {
            return Err(Error::invalid(format!(
                "dose {} U is below the {} U increment",
                units, self.dose_increment_units
            )));
        }
        if rounded > self.max_bolus_units {
            return Err(Error::invalid(format!(
                "dose {} U exceeds the maximum bolus of {} U",
                rounded, self.max_bolus_units
            )));
        }
        Ok(rounded)
    }
}

impl DeviceManager for ManualInjectionManager {
    const MANAGER_IDENTIFIER: &'static str = "ManualInjection";
    const LOCALIZED_TITLE: &'static str = "Manual Injections";

    fn serialize_state(&self) -> RawState {
        let mut state = RawState::new();
        state.insert(
            "doseIncrementUnits".into(),
            Value::from(self.dose_increment_units),
        );
        state.insert("maxBolusUnits".into(), Value::from(self.max_bolus_units));
        state
    }

    fn restore(state: &RawState) -> Option<Self> {
        let increment = state.get("doseIncrementUnits")?.as_f64()?;
        let max_bolus = state.get("maxBolusUnits")?.as_f64()?;
        Self::new(increment, max_bolus).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let manager = ManualInjectionManager::new(0.1, 12.0).unwrap();
        let restored = ManualInjectionManager::restore(&manager.serialize_state());
        assert_eq!(restored, Some(manager));
    }

    #[test]
    fn test_restore_rejects_bad_state() {
        let mut state = ManualInjectionManager::default().serialize_state();
        state.insert("doseIncrementUnits".into(), Value::from(-1.0));
        assert!(ManualInjectionManager::restore(&state).is_none());

        state.remove("doseIncrementUnits");
        assert!(ManualInjectionManager::restore(&state).is_none());
    }

    #[test]
    fn test_localized_title() {
        assert_eq!(
            ManualInjectionManager::default().localized_title(),
            "Manual Injections"
        );
    }

    #[test]
    fn test_round_dose() {
        let manager = ManualInjectionManager::default();
        assert_eq!(manager.round_dose(2.3).unwrap(), 2.5);
        assert_eq!(manager.round_dose(2.2).unwrap(), 2.0);
        assert!(manager.round_dose(0.1).is_err());
        assert!(manager.round_dose(-1.0).is_err());
        assert!(manager.round_dose(25.0).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("device.json");

        let manager = ManualInjectionManager::new(1.0, 30.0).unwrap();
        save_manager(&manager, &path).unwrap();

        let loaded: Option<ManualInjectionManager> = load_manager(&path).unwrap();
        assert_eq!(loaded, Some(manager));
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("device.json");

        assert!(load_manager::<ManualInjectionManager>(&path).unwrap().is_none());

        std::fs::write(&path, "{ invalid json }").unwrap();
        assert!(load_manager::<ManualInjectionManager>(&path).unwrap().is_none());
    }

    #[test]
    fn test_load_non_utf8_state_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("device.json");
        std::fs::write(&path, b"{\"manager_identifier\":\"\xff\xfe\"}").unwrap();

        assert!(load_manager::<ManualInjectionManager>(&path).unwrap().is_none());
    }

    #[test]
    fn test_load_foreign_manager_is_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("device.json");
        std::fs::write(
            &path,
            r#"{"manager_identifier":"SomePump","state":{"doseIncrementUnits":0.5,"maxBolusUnits":10.0}}"#,
        )
        .unwrap();

        assert!(load_manager::<ManualInjectionManager>(&path).unwrap().is_none());
    }
}
