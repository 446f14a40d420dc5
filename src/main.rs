use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args as ClapArgs, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use remotelab::config::Config;
use remotelab::correction::{self, CorrectionOptions};
use remotelab::db::{PlantConfig, PlantConfigInput, DEFAULT_COLLECTED_LIMIT, DEFAULT_CORRECTION_LIMIT};
use remotelab::recorder::{self, StepRecorder};
use remotelab::secrets::{self, AiKeySource, KeyCipher};
use remotelab::serve::AppState;
use remotelab::{csv_io, grading, report, Database};
use std::collections::HashSet;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "remotelab")]
#[command(author, version, about = "Manage PLC lab experiments and grade collected pulse trains")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: remotelab.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and SQLITE_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Only print results
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the REST API
    Serve {
        /// Port to listen on (default from config / PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },

    /// Plant configurations
    Experiment {
        #[command(subcommand)]
        action: ExperimentAction,
    },

    /// Professor's reference patterns
    GroundTruth {
        #[command(subcommand)]
        action: GroundTruthAction,
    },

    /// Collected pulse trains
    Collected {
        #[command(subcommand)]
        action: CollectedAction,
    },

    /// Ingest a captured sample log (`timestamp,byte` per line)
    Record {
        /// Experiment ID
        experiment_id: i32,

        /// Sample log file
        log: PathBuf,

        /// Seconds without a transition that end the run
        #[arg(long)]
        idle_timeout: Option<f64>,
    },

    /// Grade the collected run of one experiment
    Correct {
        /// Experiment ID
        experiment_id: i32,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Relative duration tolerance (default: 0.30)
        #[arg(long)]
        tolerance: Option<f64>,

        /// Complete occurrences needed for approval (default: 2)
        #[arg(long, value_parser = parse_required)]
        required: Option<usize>,

        /// Evaluate the last collected element too
        #[arg(long)]
        keep_last: bool,

        /// Also write the report to a file (.json or text)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Grade every experiment that has a ground truth pattern
    CorrectAll {
        /// Number of parallel workers (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Also write the results to a file (.json or text)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// AI key settings
    AiKey {
        #[command(subcommand)]
        action: AiKeyAction,
    },

    /// Create a backup of the database
    Backup {
        /// Output path for backup (default: remotelab_backup_<timestamp>.sqlite3)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct ExperimentFields {
    /// Experiment name (unique)
    name: String,

    /// PLC address
    #[arg(long)]
    ip: String,

    #[arg(long, default_value = "0")]
    rack: i32,

    #[arg(long, default_value = "1")]
    slot: i32,

    /// Data block number
    #[arg(long)]
    db_number: i32,

    /// Number of digital inputs
    #[arg(long)]
    inputs: i32,

    /// Number of digital outputs
    #[arg(long)]
    outputs: i32,

    /// I/O names, MSB first (comma separated)
    #[arg(long, value_delimiter = ',')]
    io_names: Vec<String>,
}

impl ExperimentFields {
    fn into_input(self) -> Result<PlantConfigInput> {
        let input = PlantConfigInput {
            experiment_name: self.name,
            ip_profinet: self.ip,
            rack_profinet: self.rack,
            slot_profinet: self.slot,
            db_number_profinet: self.db_number,
            num_of_inputs: self.inputs,
            num_of_outputs: self.outputs,
            io_names: Some(self.io_names).filter(|n| !n.is_empty()),
        };
        if let Err(errors) = input.validate() {
            bail!("{}", errors.join("; "));
        }
        Ok(input)
    }
}

#[derive(Subcommand, Debug)]
enum ExperimentAction {
    /// List all experiments
    List,

    /// Add an experiment
    Add(ExperimentFields),

    /// Replace an experiment's configuration
    Edit {
        /// Experiment ID
        id: i32,

        #[command(flatten)]
        fields: ExperimentFields,
    },

    /// Remove an experiment
    Remove {
        /// Experiment ID
        id: i32,
    },

    /// Show one experiment as JSON
    Show {
        /// Experiment ID
        id: i32,
    },
}

#[derive(Subcommand, Debug)]
enum GroundTruthAction {
    /// List all patterns
    List,

    /// Add a pattern for a configured experiment
    Add {
        /// Experiment name
        experiment: String,

        /// Pattern as JSON, e.g. '[{"pulse_value": 8, "duration": 1.0}]'
        pattern: String,
    },

    /// Replace a pattern
    Edit {
        /// Pattern ID
        id: i32,

        /// Experiment name
        experiment: String,

        /// Pattern as JSON
        pattern: String,
    },

    /// Remove a pattern
    Remove {
        /// Pattern ID
        id: i32,
    },

    /// Import patterns from a CSV file or directory (experiment_name, ground_truth)
    Import {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CollectedAction {
    /// Show collected rows
    List {
        /// Only rows of this experiment, in step order
        #[arg(short, long)]
        experiment: Option<i32>,

        /// Number of rows to show
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Import collector CSV files into an experiment
    Import {
        /// Experiment ID
        experiment_id: i32,

        /// CSV file or directory
        path: PathBuf,
    },

    /// Show the pulse values of the latest recorded run
    Summary {
        /// Experiment ID
        experiment_id: i32,
    },

    /// Export an experiment's rows as CSV
    Export {
        /// Experiment ID
        experiment_id: i32,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an experiment's rows
    Clear {
        /// Experiment ID
        experiment_id: i32,
    },
}

#[derive(Subcommand, Debug)]
enum AiKeyAction {
    /// Show the key source (never the key)
    Show,

    /// Choose the key source
    Set {
        /// system_variable or manual
        source: String,

        /// Key to store when the source is manual
        #[arg(long)]
        key: Option<String>,
    },

    /// Forget the stored settings
    Clear,
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    if let Command::Backup { output } = &args.command {
        return backup(&config.db_path, output.clone());
    }

    let db = Database::open_at(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    match args.command {
        Command::Serve { port, host } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(host) = host {
                config.host = host;
            }
            let state = AppState {
                db,
                cipher: KeyCipher::from_secret(&config.ai_key_secret),
                correction: config.correction,
            };
            remotelab::serve::start(&config.bind_addr(), state).context("Server error")?;
            Ok(0)
        }
        Command::Experiment { action } => handle_experiment(&db, action),
        Command::GroundTruth { action } => handle_ground_truth(&db, action, args.quiet),
        Command::Collected { action } => handle_collected(&db, action, args.quiet),
        Command::Record { experiment_id, log, idle_timeout } => {
            record(&db, experiment_id, &log, idle_timeout.unwrap_or(config.idle_timeout))
        }
        Command::Correct { experiment_id, json, tolerance, required, keep_last, output } => {
            let mut options = config.correction;
            if let Some(t) = tolerance {
                options = options.with_tolerance(t);
            }
            if let Some(r) = required {
                options = options.with_required_occurrences(r);
            }
            if keep_last {
                options = options.with_drop_last(false);
            }
            correct(&db, experiment_id, &options, json, output.as_deref(), args.quiet)
        }
        Command::CorrectAll { jobs, json, output } => {
            if let Some(jobs) = jobs {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .build_global()
                    .ok();
            }
            correct_all(&db, &config.correction, json, output.as_deref(), args.quiet)
        }
        Command::AiKey { action } => handle_ai_key(&db, &config, action),
        Command::Backup { .. } => Ok(0),
    }
}

fn parse_required(raw: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("at least one occurrence must be required".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn progress_bar(len: usize, quiet: bool) -> Option<ProgressBar> {
    if quiet || len < 2 {
        return None;
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("=>-"));
    }
    Some(pb)
}

/// A single CSV file, or every CSV under a directory
fn csv_inputs(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let files = csv_io::csv_files_in(path);
        if files.is_empty() {
            bail!("No CSV files found under {}", path.display());
        }
        Ok(files)
    } else if path.exists() {
        Ok(vec![path.to_path_buf()])
    } else {
        bail!("{} does not exist", path.display())
    }
}

fn require_experiment(db: &Database, id: i32) -> Result<PlantConfig> {
    match db.get_plant_config(id)? {
        Some(config) => Ok(config),
        None => bail!("Experiment {} not found", id),
    }
}

fn handle_experiment(db: &Database, action: ExperimentAction) -> Result<i32> {
    match action {
        ExperimentAction::List => {
            let configs = db.list_plant_configs()?;
            if configs.is_empty() {
                println!("No experiments configured.");
            } else {
                println!("{:<5} {:<24} {:<16} {:>4} {:>4} {:>4} {:>4} {:>4}", "ID", "NAME", "IP", "RACK", "SLOT", "DB", "IN", "OUT");
                println!("{}", "-".repeat(76));
                for c in configs {
                    println!(
                        "{:<5} {:<24} {:<16} {:>4} {:>4} {:>4} {:>4} {:>4}",
                        c.id,
                        truncate(&c.experiment_name, 24),
                        c.ip_profinet,
                        c.rack_profinet,
                        c.slot_profinet,
                        c.db_number_profinet,
                        c.num_of_inputs,
                        c.num_of_outputs
                    );
                }
            }
        }

        ExperimentAction::Add(fields) => {
            let input = fields.into_input()?;
            let id = db.create_plant_config(&input)?;
            println!("Created experiment {} ({})", id, input.experiment_name);
        }

        ExperimentAction::Edit { id, fields } => {
            let input = fields.into_input()?;
            if !db.update_plant_config(id, &input)? {
                bail!("Experiment {} not found", id);
            }
            println!("Updated experiment {}", id);
        }

        ExperimentAction::Remove { id } => {
            if !db.delete_plant_config(id)? {
                bail!("Experiment {} not found", id);
            }
            println!("Removed experiment {}", id);
        }

        ExperimentAction::Show { id } => {
            let config = require_experiment(db, id)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(0)
}

fn check_pattern(pattern: &str) -> Result<()> {
    correction::parse_pattern(pattern).context("Invalid ground truth pattern")?;
    Ok(())
}

fn require_configured(db: &Database, experiment: &str) -> Result<()> {
    if db.get_plant_config_by_name(experiment)?.is_none() {
        bail!("No experiment named `{}` is configured", experiment);
    }
    Ok(())
}

fn handle_ground_truth(db: &Database, action: GroundTruthAction, quiet: bool) -> Result<i32> {
    match action {
        GroundTruthAction::List => {
            let patterns = db.list_ground_truth()?;
            if patterns.is_empty() {
                println!("No ground truth patterns.");
            } else {
                println!("{:<5} {:<24} {}", "ID", "EXPERIMENT", "PATTERN");
                println!("{}", "-".repeat(76));
                for p in patterns {
                    println!("{:<5} {:<24} {}", p.id, truncate(&p.experiment_name, 24), truncate(&p.ground_truth, 45));
                }
            }
        }

        GroundTruthAction::Add { experiment, pattern } => {
            check_pattern(&pattern)?;
            require_configured(db, &experiment)?;
            let id = db.create_ground_truth(&experiment, &pattern)?;
            println!("Created ground truth {} for {}", id, experiment);
        }

        GroundTruthAction::Edit { id, experiment, pattern } => {
            check_pattern(&pattern)?;
            require_configured(db, &experiment)?;
            if !db.update_ground_truth(id, &experiment, &pattern)? {
                bail!("Ground truth {} not found", id);
            }
            println!("Updated ground truth {}", id);
        }

        GroundTruthAction::Remove { id } => {
            if !db.delete_ground_truth(id)? {
                bail!("Ground truth {} not found", id);
            }
            println!("Removed ground truth {}", id);
        }

        GroundTruthAction::Import { path } => {
            let allowed: HashSet<String> = db
                .list_plant_configs()?
                .into_iter()
                .map(|c| c.experiment_name)
                .collect();

            let mut imported = 0;
            let mut skipped = 0;
            for file in csv_inputs(&path)? {
                let rows = csv_io::read_ground_truth_path(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;

                let (valid, invalid): (Vec<_>, Vec<_>) =
                    rows.into_iter().partition(|r| correction::parse_pattern(&r.ground_truth).is_ok());
                for bad in &invalid {
                    tracing::warn!(name = %bad.experiment_name, file = %file.display(), "unparsable pattern, skipping");
                }

                let (ok, skip) = db.import_ground_truth(&valid, &allowed)?;
                imported += ok;
                skipped += skip + invalid.len();
            }

            if !quiet {
                eprintln!("Imported {} pattern(s), skipped {}", imported, skipped);
            }
        }
    }
    Ok(0)
}

fn handle_collected(db: &Database, action: CollectedAction, quiet: bool) -> Result<i32> {
    match action {
        CollectedAction::List { experiment, limit } => {
            let rows = match experiment {
                Some(id) => db.list_collected_by_experiment(id, limit.unwrap_or(DEFAULT_CORRECTION_LIMIT))?,
                None => db.list_collected(limit.unwrap_or(DEFAULT_COLLECTED_LIMIT))?,
            };
            if rows.is_empty() {
                println!("No collected rows.");
            } else {
                println!("{:<7} {:<5} {:<4} {:<5} {:>6} {:>9}  {}", "ID", "EXP", "RUN", "STEP", "VALUE", "DURATION", "BITS");
                println!("{}", "-".repeat(75));
                for r in rows {
                    println!(
                        "{:<7} {:<5} {:<4} {:<5} {:>6} {:>9}  {}",
                        r.id,
                        r.experiment_id,
                        r.run_id,
                        r.step,
                        r.pulse_value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                        r.duration.map(|d| format!("{:.3}", d)).unwrap_or_else(|| "-".to_string()),
                        truncate(r.bits.as_deref().unwrap_or("-"), 40)
                    );
                }
            }
        }

        CollectedAction::Import { experiment_id, path } => {
            let config = require_experiment(db, experiment_id)?;
            let files = csv_inputs(&path)?;
            let pb = progress_bar(files.len(), quiet);

            let mut total = 0;
            for file in &files {
                let samples = csv_io::read_collected_path(file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let (run_id, count) = db.import_collected_rows(experiment_id, &config.experiment_name, &samples)?;
                tracing::debug!(file = %file.display(), run_id, count, "run imported");
                total += count;
                if let Some(ref pb) = pb {
                    pb.inc(1);
                    pb.set_message(file.display().to_string());
                }
            }

            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            if !quiet {
                eprintln!("Imported {} row(s) from {} run(s) into {}", total, files.len(), config.experiment_name);
            }
        }

        CollectedAction::Summary { experiment_id } => {
            let config = require_experiment(db, experiment_id)?;
            match db.latest_summary(experiment_id)? {
                Some(summary) => println!("{} ({}): {}", config.experiment_name, summary.created_at, summary.pattern),
                None => println!("No recorded run for {}.", config.experiment_name),
            }
        }

        CollectedAction::Export { experiment_id, output } => {
            let rows = db.list_collected_by_experiment(experiment_id, i64::MAX)?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    csv_io::write_collected(file, &rows)?;
                    if !quiet {
                        eprintln!("Exported {} row(s) to {}", rows.len(), path.display());
                    }
                }
                None => csv_io::write_collected(io::stdout().lock(), &rows)?,
            }
        }

        CollectedAction::Clear { experiment_id } => {
            let count = db.clear_collected(experiment_id)?;
            println!("Deleted {} row(s) of experiment {}", count, experiment_id);
        }
    }
    Ok(0)
}

fn record(db: &Database, experiment_id: i32, log: &Path, idle_timeout: f64) -> Result<i32> {
    let config = require_experiment(db, experiment_id)?;
    let layout = config.layout();
    layout.validate()?;

    let file = std::fs::File::open(log).with_context(|| format!("Failed to open {}", log.display()))?;
    let mut recorder = StepRecorder::new(experiment_id, &config.experiment_name, layout)
        .with_idle_timeout(idle_timeout);
    let steps = recorder
        .replay(BufReader::new(file))
        .with_context(|| format!("Failed to replay {}", log.display()))?;

    let run_id = db.next_run_id(experiment_id)?;
    for step in &steps {
        db.insert_collected_row(run_id, step)?;
    }

    let values: Vec<u32> = steps.iter().map(|s| s.pulse_value).collect();
    let summary = recorder::summary_string(&values);
    db.insert_summary(experiment_id, &summary)?;

    println!("Recorded run {} with {} step(s) for {}: {}", run_id, steps.len(), config.experiment_name, summary);
    Ok(0)
}

fn correct(
    db: &Database,
    experiment_id: i32,
    options: &CorrectionOptions,
    json: bool,
    output: Option<&Path>,
    quiet: bool,
) -> Result<i32> {
    let report = grading::correct_experiment(db, experiment_id, options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report::render_text(&report));
    }

    if let Some(path) = output {
        report::generate(path, &report).with_context(|| format!("Failed to write {}", path.display()))?;
        if !quiet {
            eprintln!("Report saved: {}", path.display());
        }
    }

    Ok(if report.is_approved() { 0 } else { 2 })
}

fn correct_all(
    db: &Database,
    options: &CorrectionOptions,
    json: bool,
    output: Option<&Path>,
    quiet: bool,
) -> Result<i32> {
    let entries = grading::correct_all(db, options)?;
    if entries.is_empty() {
        println!("No experiments with a ground truth pattern.");
        return Ok(0);
    }

    let mut stdout = io::stdout().lock();
    if json {
        report::json::write_batch(&mut stdout, &entries)?;
    } else {
        report::text::write_batch(&mut stdout, &entries)?;
    }

    if let Some(path) = output {
        report::generate_batch(path, &entries).with_context(|| format!("Failed to write {}", path.display()))?;
        if !quiet {
            eprintln!("Report saved: {}", path.display());
        }
    }

    let summary = report::Summary::from_entries(&entries);
    Ok(if summary.approved == summary.total { 0 } else { 2 })
}

fn handle_ai_key(db: &Database, config: &Config, action: AiKeyAction) -> Result<i32> {
    let cipher = KeyCipher::from_secret(&config.ai_key_secret);

    match action {
        AiKeyAction::Show => {
            let status = secrets::ai_key_status(db)?;
            println!("Source:     {}", status.source);
            println!("Manual key: {}", if status.has_manual_key { "stored" } else { "none" });
            if let Some(updated) = status.updated_at {
                println!("Updated:    {}", updated);
            }
            match secrets::resolve_ai_key(db, &cipher, config.openai_api_key.as_deref()) {
                Ok(_) => println!("Resolved:   yes"),
                Err(e) => println!("Resolved:   no ({})", e),
            }
        }

        AiKeyAction::Set { source, key } => {
            let source: AiKeySource = source.parse()?;
            secrets::save_ai_key(db, &cipher, source, key.as_deref())?;
            println!("AI key source set to {}", source);
        }

        AiKeyAction::Clear => {
            db.clear_ai_key_settings()?;
            println!("AI key settings cleared");
        }
    }
    Ok(0)
}

fn backup(db_path: &Path, output: Option<PathBuf>) -> Result<i32> {
    if !db_path.exists() {
        bail!("No database found at {}", db_path.display());
    }

    let backup_path = output.unwrap_or_else(|| {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        PathBuf::from(format!("remotelab_backup_{}.sqlite3", timestamp))
    });

    let bytes = std::fs::copy(db_path, &backup_path)
        .with_context(|| format!("Failed to create backup {}", backup_path.display()))?;
    println!("Backup created: {} ({} bytes)", backup_path.display(), bytes);
    Ok(0)
}
