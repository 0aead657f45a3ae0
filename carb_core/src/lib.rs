#![forbid(unsafe_code)]

//! Core domain model and business logic for carblog.
//!
//! This crate provides:
//! - Domain types (carb entries, macro input, measurements)
//! - Fat/protein carb-equivalent calculation
//! - Direct entry resolution and the meal recording flow
//! - A journaled, timestamped measurement store
//! - CSV export
//! - Device manager state persistence

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod calculator;
pub mod entry;
pub mod sink;
pub mod meal;
pub mod journal;
pub mod store;
pub mod export;
pub mod device;

// Re-export commonly used types
pub use error::{Error, Result, StorageError};
pub use types::*;
pub use config::{AbsorptionConfig, Config, DefaultAbsorptionTimes, EntryLimits};
pub use calculator::{compute, FpuBreakdown, MealSource};
pub use entry::DirectEntryBuilder;
pub use sink::EntrySink;
pub use meal::{plan_meal, submit_plan, MealForm, MealPlan, MealReceipt};
pub use store::{MeasurementQuery, MeasurementStore};
pub use export::export_csv;
pub use device::{DeviceManager, ManualInjectionManager, RawState};
