use carb_core::calculator;
use carb_core::device::{load_manager, save_manager};
use carb_core::*;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "carblog")]
#[command(about = "Carb and insulin log with fat/protein carb equivalents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a meal; fat and protein add a delayed carb entry
    Meal {
        /// Carbohydrate grams (empty records a 0.1 g marker)
        #[arg(long, allow_negative_numbers = true)]
        carbs: Option<f64>,

        /// Fat grams
        #[arg(long, allow_negative_numbers = true)]
        fat: Option<f64>,

        /// Protein grams
        #[arg(long, allow_negative_numbers = true)]
        protein: Option<f64>,

        #[arg(long)]
        food_type: Option<String>,

        /// Absorption speed (fast, medium, slow)
        #[arg(long, value_parser = parse_absorption, conflicts_with = "absorption_hours")]
        absorption: Option<AbsorptionChoice>,

        /// Explicit absorption time in hours
        #[arg(long)]
        absorption_hours: Option<f64>,

        /// Meal time (RFC 3339), defaults to now
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,

        /// Show the entries without recording them
        #[arg(long)]
        dry_run: bool,
    },

    /// Record an insulin dose
    Dose {
        /// Units of insulin
        #[arg(long)]
        units: f64,

        /// Dose time (RFC 3339), defaults to now
        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// List measurements in chronological order
    List {
        /// Start of range (RFC 3339), defaults to 24 hours ago
        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,

        /// End of range, exclusive (RFC 3339), defaults to 24 hours ahead
        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Edit a carb entry
    Edit {
        #[arg(value_parser = parse_handle)]
        handle: MeasurementHandle,

        #[arg(long)]
        carbs: Option<f64>,

        #[arg(long)]
        food_type: Option<String>,

        #[arg(long, value_parser = parse_absorption, conflicts_with = "absorption_hours")]
        absorption: Option<AbsorptionChoice>,

        #[arg(long)]
        absorption_hours: Option<f64>,

        #[arg(long, value_parser = parse_time)]
        at: Option<DateTime<Utc>>,
    },

    /// Delete a measurement
    Delete {
        #[arg(value_parser = parse_handle)]
        handle: MeasurementHandle,
    },

    /// Export measurements to CSV
    Export {
        #[arg(long)]
        out: PathBuf,

        #[arg(long, value_parser = parse_time)]
        from: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_time)]
        to: Option<DateTime<Utc>>,
    },

    /// Rewrite the journal without deleted records
    Compact,

    /// Show or change manual injection settings
    Device {
        /// Smallest dose step in units
        #[arg(long)]
        increment: Option<f64>,

        /// Largest allowed dose in units
        #[arg(long)]
        max_bolus: Option<f64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    carb_core::logging::init_for_cli(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());

    match cli.command {
        Commands::Meal {
            carbs,
            fat,
            protein,
            food_type,
            absorption,
            absorption_hours,
            at,
            dry_run,
        } => {
            let mut form = MealForm::new(at.unwrap_or_else(Utc::now));
            form.carbs = carbs;
            form.fat = fat;
            form.protein = protein;
            form.food_type = food_type;
            form.absorption = absorption_choice(absorption, absorption_hours);
            cmd_meal(&data_dir, &form, dry_run, &config)
        }
        Commands::Dose { units, at } => cmd_dose(&data_dir, units, at.unwrap_or_else(Utc::now)),
        Commands::List { from, to, limit } => {
            let now = Utc::now();
            let range = from.unwrap_or(now - Duration::hours(24))..to.unwrap_or(now + Duration::hours(24));
            cmd_list(&data_dir, range, limit)
        }
        Commands::Edit {
            handle,
            carbs,
            food_type,
            absorption,
            absorption_hours,
            at,
        } => {
            let changes = EntryChanges {
                carbs,
                food_type,
                absorption: absorption_choice(absorption, absorption_hours),
                at,
            };
            cmd_edit(&data_dir, handle, changes, &config)
        }
        Commands::Delete { handle } => cmd_delete(&data_dir, handle),
        Commands::Export { out, from, to } => {
            let range = from.unwrap_or(DateTime::<Utc>::MIN_UTC)..to.unwrap_or(DateTime::<Utc>::MAX_UTC);
            cmd_export(&data_dir, range, &out)
        }
        Commands::Compact => cmd_compact(&data_dir),
        Commands::Device {
            increment,
            max_bolus,
        } => cmd_device(&data_dir, increment, max_bolus),
    }
}

fn journal_path(data_dir: &Path) -> PathBuf {
    data_dir.join("journal").join("measurements.jsonl")
}

fn device_path(data_dir: &Path) -> PathBuf {
    data_dir.join("device.json")
}

fn open_store(data_dir: &Path) -> Result<MeasurementStore> {
    MeasurementStore::open(journal_path(data_dir))
}

fn cmd_meal(data_dir: &Path, form: &MealForm, dry_run: bool, config: &Config) -> Result<()> {
    let plan = plan_meal(form, config, Utc::now())?;

    let macros = MacroInput::from_form(form.carbs, form.fat, form.protein);
    let breakdown = calculator::breakdown(&macros, config.absorption.calories_per_unit_ratio);
    println!(
        "FPU: {:.2} (fat/protein weight {:.0}%)",
        breakdown.fpu,
        breakdown.low_carb_multiplier * 100.0
    );

    if dry_run {
        display_plan(&plan, &MealReceipt::default());
        println!("\n[Dry run - not recording]");
        return Ok(());
    }

    let mut store = open_store(data_dir)?;
    let receipt = submit_plan(&plan, &mut store)?;
    display_plan(&plan, &receipt);
    Ok(())
}

fn display_plan(plan: &MealPlan, receipt: &MealReceipt) {
    if let Some(entry) = &plan.direct {
        println!("✓ Carb entry: {}", describe_entry(entry, receipt.direct));
    }
    match &plan.fat_protein {
        Some(entry) => println!("✓ Fat/protein entry: {}", describe_entry(entry, receipt.fat_protein)),
        None => println!("  No fat/protein entry"),
    }
}

fn describe_entry(entry: &CarbEntry, handle: Option<MeasurementHandle>) -> String {
    let mut line = format!(
        "{:.1} g at {} over {:.1} h",
        entry.quantity_grams,
        entry.start_date.format("%Y-%m-%d %H:%M"),
        entry.absorption_time_seconds / 3600.0
    );
    if let Some(handle) = handle {
        line.push_str(&format!(" [{}]", handle));
    }
    line
}

fn cmd_dose(data_dir: &Path, units: f64, at: DateTime<Utc>) -> Result<()> {
    let manager: ManualInjectionManager =
        load_manager(&device_path(data_dir))?.unwrap_or_default();
    let rounded = manager.round_dose(units)?;

    let store = open_store(data_dir)?;
    let handle = store.append(NewMeasurement::delivery(at, rounded))?;

    println!("✓ Dose logged: {} U [{}]", rounded, handle);
    Ok(())
}

fn cmd_list(
    data_dir: &Path,
    range: std::ops::Range<DateTime<Utc>>,
    limit: Option<usize>,
) -> Result<()> {
    let store = open_store(data_dir)?;
    let mut shown = 0;

    for m in store.query(range, limit) {
        let what = match m.as_carb_entry() {
            Some(entry) => format!(
                "carb     {:>6.1} g  {:.1} h{}{}",
                entry.quantity_grams,
                entry.absorption_time_seconds / 3600.0,
                if entry.is_derived() { "  (fat/protein)" } else { "" },
                entry
                    .food_type
                    .map(|f| format!("  {}", f))
                    .unwrap_or_default()
            ),
            None => format!("delivery {:>6.2} U", m.unit_value),
        };
        println!("{}  {}  {}", m.start_date.format("%Y-%m-%d %H:%M"), what, m.handle);
        shown += 1;
    }

    if shown == 0 {
        println!("No measurements in range.");
    }
    Ok(())
}

struct EntryChanges {
    carbs: Option<f64>,
    food_type: Option<String>,
    absorption: Option<AbsorptionChoice>,
    at: Option<DateTime<Utc>>,
}

fn cmd_edit(
    data_dir: &Path,
    handle: MeasurementHandle,
    changes: EntryChanges,
    config: &Config,
) -> Result<()> {
    let store = open_store(data_dir)?;
    let original = store
        .get(handle)
        .ok_or(Error::NotFound(handle))?
        .as_carb_entry()
        .ok_or_else(|| Error::invalid("only carb entries can be edited"))?;

    let mut builder = DirectEntryBuilder::editing(original.clone());
    if let Some(carbs) = changes.carbs {
        builder = builder.quantity(carbs);
    }
    if let Some(food_type) = changes.food_type {
        builder = builder.food_type(Some(food_type));
    }
    if let Some(choice) = changes.absorption {
        builder = builder.absorption(Some(choice));
    }
    if let Some(at) = changes.at {
        builder = builder.start_date(at);
    }

    let Some(mut entry) = builder.build(&config.absorption, &config.limits, Utc::now())? else {
        println!("No changes.");
        return Ok(());
    };
    entry.origin = original.origin;

    let new_handle = store.replace(handle, NewMeasurement::from(&entry))?;
    println!("✓ Updated entry: {}", describe_entry(&entry, Some(new_handle)));
    Ok(())
}

fn cmd_delete(data_dir: &Path, handle: MeasurementHandle) -> Result<()> {
    let store = open_store(data_dir)?;
    store.delete(handle)?;
    println!("✓ Deleted {}", handle);
    Ok(())
}

fn cmd_export(
    data_dir: &Path,
    range: std::ops::Range<DateTime<Utc>>,
    out: &Path,
) -> Result<()> {
    let store = open_store(data_dir)?;
    let count = export_csv(&store, range, out)?;
    println!("✓ Exported {} measurements to {}", count, out.display());
    Ok(())
}

fn cmd_compact(data_dir: &Path) -> Result<()> {
    if !journal_path(data_dir).exists() {
        println!("No journal found - nothing to compact.");
        return Ok(());
    }
    let store = open_store(data_dir)?;
    let count = store.compact()?;
    println!("✓ Compacted journal to {} records", count);
    Ok(())
}

fn cmd_device(data_dir: &Path, increment: Option<f64>, max_bolus: Option<f64>) -> Result<()> {
    let path = device_path(data_dir);
    let mut manager: ManualInjectionManager = load_manager(&path)?.unwrap_or_default();

    if increment.is_some() || max_bolus.is_some() {
        manager = ManualInjectionManager::new(
            increment.unwrap_or(manager.dose_increment_units),
            max_bolus.unwrap_or(manager.max_bolus_units),
        )?;
        save_manager(&manager, &path)?;
        println!("✓ Saved device settings");
    }

    println!("{}", manager.localized_title());
    println!("  Dose increment: {} U", manager.dose_increment_units);
    println!("  Maximum bolus:  {} U", manager.max_bolus_units);
    Ok(())
}

fn absorption_choice(
    preset: Option<AbsorptionChoice>,
    hours: Option<f64>,
) -> Option<AbsorptionChoice> {
    hours
        .map(|h| AbsorptionChoice::Custom { seconds: h * 3600.0 })
        .or(preset)
}

fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 time '{}': {}", s, e))
}

fn parse_absorption(s: &str) -> std::result::Result<AbsorptionChoice, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_handle(s: &str) -> std::result::Result<MeasurementHandle, String> {
    s.parse().map_err(|e: Error| e.to_string())
}
