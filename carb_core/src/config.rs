//! Configuration file support for carblog.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/carblog/config.toml`.

use crate::{AbsorptionChoice, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest onset delay or future-entry window a config may set (7 days)
pub const MAX_TIME_OFFSET_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub absorption: AbsorptionConfig,

    #[serde(default)]
    pub limits: EntryLimits,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Parameters of the fat/protein calculation and absorption defaults
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AbsorptionConfig {
    /// Kilocalories of fat+protein per fat-protein unit
    #[serde(default = "default_calories_per_unit_ratio")]
    pub calories_per_unit_ratio: f64,

    /// Delay between the meal and the start of the derived entry
    #[serde(default = "default_onset_delay_seconds")]
    pub onset_delay_seconds: f64,

    #[serde(default = "default_max_absorption_seconds")]
    pub max_absorption_seconds: f64,

    #[serde(default)]
    pub defaults: DefaultAbsorptionTimes,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            calories_per_unit_ratio: default_calories_per_unit_ratio(),
            onset_delay_seconds: default_onset_delay_seconds(),
            max_absorption_seconds: default_max_absorption_seconds(),
            defaults: DefaultAbsorptionTimes::default(),
        }
    }
}

impl AbsorptionConfig {
    /// Resolve an absorption choice to seconds; `None` picks the medium default
    pub fn resolve(&self, choice: Option<AbsorptionChoice>) -> f64 {
        match choice {
            Some(AbsorptionChoice::Fast) => self.defaults.fast,
            Some(AbsorptionChoice::Medium) | None => self.defaults.medium,
            Some(AbsorptionChoice::Slow) => self.defaults.slow,
            Some(AbsorptionChoice::Custom { seconds }) => seconds,
        }
    }
}

/// Preset absorption times, in seconds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DefaultAbsorptionTimes {
    #[serde(default = "default_fast")]
    pub fast: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_slow")]
    pub slow: f64,
}

impl Default for DefaultAbsorptionTimes {
    fn default() -> Self {
        Self {
            fast: default_fast(),
            medium: default_medium(),
            slow: default_slow(),
        }
    }
}

/// Bounds applied to entries before they are accepted
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntryLimits {
    #[serde(default = "default_max_quantity_grams")]
    pub max_quantity_grams: f64,

    /// How far in the future an entry's date may lie
    #[serde(default = "default_max_future_seconds")]
    pub max_future_seconds: f64,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            max_quantity_grams: default_max_quantity_grams(),
            max_future_seconds: default_max_future_seconds(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share"),
        None => PathBuf::from("."),
    });
    base.join("carblog")
}

fn default_calories_per_unit_ratio() -> f64 {
    100.0
}

fn default_onset_delay_seconds() -> f64 {
    3600.0
}

fn default_max_absorption_seconds() -> f64 {
    16.0 * 3600.0
}

fn default_fast() -> f64 {
    2.0 * 3600.0
}

fn default_medium() -> f64 {
    3.0 * 3600.0
}

fn default_slow() -> f64 {
    4.0 * 3600.0
}

fn default_max_quantity_grams() -> f64 {
    250.0
}

fn default_max_future_seconds() -> f64 {
    4.0 * 3600.0
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config"),
            None => PathBuf::from("."),
        });
        base.join("carblog").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Check the numeric settings are usable
    pub fn validate(&self) -> Result<()> {
        let a = &self.absorption;
        if !(a.calories_per_unit_ratio.is_finite() && a.calories_per_unit_ratio > 0.0) {
            return Err(Error::Config(format!(
                "calories_per_unit_ratio must be > 0 (got {})",
                a.calories_per_unit_ratio
            )));
        }
        if !(0.0..=MAX_TIME_OFFSET_SECONDS).contains(&a.onset_delay_seconds) {
            return Err(Error::Config(format!(
                "onset_delay_seconds must be in [0, {}] (got {})",
                MAX_TIME_OFFSET_SECONDS, a.onset_delay_seconds
            )));
        }
        if !(a.max_absorption_seconds.is_finite() && a.max_absorption_seconds > 0.0) {
            return Err(Error::Config(format!(
                "max_absorption_seconds must be > 0 (got {})",
                a.max_absorption_seconds
            )));
        }
        for (name, value) in [
            ("fast", a.defaults.fast),
            ("medium", a.defaults.medium),
            ("slow", a.defaults.slow),
        ] {
            if !(value > 0.0 && value <= a.max_absorption_seconds) {
                return Err(Error::Config(format!(
                    "default {} absorption time must be in (0, {}] (got {})",
                    name, a.max_absorption_seconds, value
                )));
            }
        }
        if !(self.limits.max_quantity_grams > 0.0) {
            return Err(Error::Config("max_quantity_grams must be > 0".into()));
        }
        if !(0.0..=MAX_TIME_OFFSET_SECONDS).contains(&self.limits.max_future_seconds) {
            return Err(Error::Config(format!(
                "max_future_seconds must be in [0, {}] (got {})",
                MAX_TIME_OFFSET_SECONDS, self.limits.max_future_seconds
            )));
        }
        Ok(())
    }
}
