//! SQLite database with Diesel ORM
//!
//! Stores plant configurations, the professor's ground truth patterns,
//! collected pulse trains, run summaries and the AI key settings.
//! Tables are created on open.

use crate::correction::PulseStep;
use crate::plc::{IoLayout, LayoutError};
use crate::recorder::RecordedStep;
use crate::schema::*;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_DB_PATH: &str = "data/remote_lab.sqlite3";

/// Rows returned by `list_collected` when no limit is given
pub const DEFAULT_COLLECTED_LIMIT: i64 = 200;

/// Rows used for a correction run
pub const DEFAULT_CORRECTION_LIMIT: i64 = 500;

// ============================================================================
// Diesel Models
// ============================================================================

/// Queryable plant configuration
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = plant_config)]
pub struct PlantConfig {
    pub id: i32,
    pub experiment_name: String,
    pub ip_profinet: String,
    pub rack_profinet: i32,
    pub slot_profinet: i32,
    pub db_number_profinet: i32,
    pub num_of_inputs: i32,
    pub num_of_outputs: i32,
    /// JSON list of I/O names, MSB first
    pub io_names: Option<String>,
}

impl PlantConfig {
    pub fn layout(&self) -> IoLayout {
        IoLayout::new(self.num_of_inputs.max(0) as usize, self.num_of_outputs.max(0) as usize)
    }

    /// Configured I/O names, if any were stored and parse as a string list
    pub fn io_name_list(&self) -> Option<Vec<String>> {
        self.io_names
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
    }
}

/// Insertable / updatable plant configuration
#[derive(Insertable, AsChangeset)]
#[diesel(table_name = plant_config, treat_none_as_null = true)]
struct NewPlantConfig<'a> {
    experiment_name: &'a str,
    ip_profinet: &'a str,
    rack_profinet: i32,
    slot_profinet: i32,
    db_number_profinet: i32,
    num_of_inputs: i32,
    num_of_outputs: i32,
    io_names: Option<String>,
}

/// Validated plant configuration fields, from a form, the API or the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfigInput {
    pub experiment_name: String,
    pub ip_profinet: String,
    pub rack_profinet: i32,
    pub slot_profinet: i32,
    pub db_number_profinet: i32,
    pub num_of_inputs: i32,
    pub num_of_outputs: i32,
    #[serde(default)]
    pub io_names: Option<Vec<String>>,
}

const NUMERIC_FIELDS: &[&str] = &[
    "rack_profinet",
    "slot_profinet",
    "db_number_profinet",
    "num_of_inputs",
    "num_of_outputs",
];

impl PlantConfigInput {
    /// Build from loosely typed JSON (numbers may arrive as strings).
    /// Returns every validation message at once.
    pub fn from_json(payload: &Value) -> std::result::Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        let text = |field: &str, errors: &mut Vec<String>| -> String {
            let value = payload.get(field).and_then(json_text).unwrap_or_default();
            if value.is_empty() {
                errors.push(format!("field {} is required", field));
            }
            value
        };
        let experiment_name = text("experiment_name", &mut errors);
        let ip_profinet = text("ip_profinet", &mut errors);

        let mut numbers = [0i32; 5];
        for (slot, field) in numbers.iter_mut().zip(NUMERIC_FIELDS) {
            match payload.get(*field).filter(|v| !v.is_null()) {
                None => errors.push(format!("field {} is required", field)),
                Some(v) => match json_int(v) {
                    Some(n) => *slot = n,
                    None if json_text(v).map_or(true, |s| s.is_empty()) => {
                        errors.push(format!("field {} is required", field))
                    }
                    None => errors.push(format!("field {} must be an integer", field)),
                },
            }
        }

        let io_names = match payload.get("io_names") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|v| json_text(v).unwrap_or_else(|| v.to_string()))
                    .collect(),
            ),
            Some(_) => {
                errors.push("field io_names must be a list".to_string());
                None
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        let [rack_profinet, slot_profinet, db_number_profinet, num_of_inputs, num_of_outputs] = numbers;
        let input = Self {
            experiment_name,
            ip_profinet,
            rack_profinet,
            slot_profinet,
            db_number_profinet,
            num_of_inputs,
            num_of_outputs,
            io_names,
        };
        input.validate().map(|_| input)
    }

    /// Semantic checks on already typed fields
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.experiment_name.trim().is_empty() {
            errors.push("field experiment_name is required".to_string());
        }
        if self.ip_profinet.trim().is_empty() {
            errors.push("field ip_profinet is required".to_string());
        }
        if self.num_of_inputs < 0 || self.num_of_outputs < 0 {
            errors.push("I/O counts cannot be negative".to_string());
        } else {
            let layout = IoLayout::new(self.num_of_inputs as usize, self.num_of_outputs as usize);
            if let Err(e @ LayoutError::TooMany(_)) = layout.validate() {
                errors.push(e.to_string());
            }
            if let Some(names) = &self.io_names {
                if !names.is_empty() && names.len() != layout.total() {
                    errors.push(format!(
                        "io_names has {} entries but the plant has {} I/Os",
                        names.len(),
                        layout.total()
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn as_new(&self) -> NewPlantConfig<'_> {
        NewPlantConfig {
            experiment_name: self.experiment_name.trim(),
            ip_profinet: self.ip_profinet.trim(),
            rack_profinet: self.rack_profinet,
            slot_profinet: self.slot_profinet,
            db_number_profinet: self.db_number_profinet,
            num_of_inputs: self.num_of_inputs,
            num_of_outputs: self.num_of_outputs,
            io_names: self
                .io_names
                .as_ref()
                .filter(|n| !n.is_empty())
                .and_then(|n| serde_json::to_string(n).ok()),
        }
    }
}

fn json_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_int(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Queryable ground truth pattern
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = ground_truth_patterns)]
pub struct GroundTruthPattern {
    pub id: i32,
    pub experiment_name: String,
    /// Serialized reference sequence (JSON)
    pub ground_truth: String,
}

/// Insertable ground truth pattern
#[derive(Insertable, AsChangeset)]
#[diesel(table_name = ground_truth_patterns)]
struct NewGroundTruth<'a> {
    experiment_name: &'a str,
    ground_truth: &'a str,
}

/// One row of a ground truth CSV import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthRow {
    pub experiment_name: String,
    pub ground_truth: String,
}

/// Queryable collected row
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = collected_rows)]
pub struct CollectedRow {
    pub id: i32,
    pub experiment_id: i32,
    /// Recording session within the experiment, numbered from 1
    pub run_id: i32,
    pub experiment_name: Option<String>,
    pub step: i32,
    /// JSON bit vector, e.g. `[false, true, false]`
    pub bits: Option<String>,
    pub pulse_value: Option<i32>,
    pub duration: Option<f64>,
    pub time_stamp: Option<String>,
}

impl CollectedRow {
    pub fn to_pulse_step(&self) -> PulseStep {
        PulseStep {
            value: self.pulse_value.and_then(|v| u32::try_from(v).ok()),
            duration: self.duration,
        }
    }
}

/// Insertable collected row
#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = collected_rows)]
struct NewCollectedRow<'a> {
    experiment_id: i32,
    run_id: i32,
    experiment_name: Option<&'a str>,
    step: i32,
    bits: Option<String>,
    pulse_value: Option<i32>,
    duration: Option<f64>,
    time_stamp: Option<String>,
}

/// A collected sample before it is scoped to an experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedSample {
    #[serde(default)]
    pub step: Option<i32>,
    /// Bit vector as JSON text, or the raw cell when it could not be parsed
    #[serde(default)]
    pub bits: Option<String>,
    #[serde(default)]
    pub pulse_value: Option<i64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub time_stamp: Option<String>,
}

/// Queryable run summary
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = collected_summary)]
pub struct CollectedSummary {
    pub id: i32,
    pub experiment_id: i32,
    pub pattern: String,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = collected_summary)]
struct NewCollectedSummary<'a> {
    experiment_id: i32,
    pattern: &'a str,
    created_at: &'a str,
}

/// Queryable AI key settings (singleton)
#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(table_name = ai_settings)]
pub struct AiSettingsRow {
    pub id: i32,
    pub source: String,
    pub encrypted_key: Option<String>,
    pub updated_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = ai_settings)]
struct NewAiSettings<'a> {
    source: &'a str,
    encrypted_key: Option<&'a str>,
    updated_at: &'a str,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Database connection wrapper with connection pool
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

/// Error type for database operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(DieselError),
    #[error("Already exists: {0}")]
    Conflict(String),
}

impl From<DieselError> for DbError {
    fn from(e: DieselError) -> Self {
        match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DbError::Conflict(info.message().to_string())
            }
            other => DbError::Query(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl Database {
    /// Open database at specified path, creating parent directories
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Connection(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(5)
            .build(manager)
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool, path };
        db.init_schema()?;
        tracing::debug!(path = %db.path.display(), "database ready");
        Ok(db)
    }

    /// Path of the backing SQLite file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get_conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS plant_config (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                experiment_name TEXT NOT NULL UNIQUE,
                ip_profinet TEXT NOT NULL,
                rack_profinet INTEGER NOT NULL,
                slot_profinet INTEGER NOT NULL,
                db_number_profinet INTEGER NOT NULL,
                num_of_inputs INTEGER NOT NULL,
                num_of_outputs INTEGER NOT NULL,
                io_names TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS ground_truth_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                experiment_name TEXT NOT NULL UNIQUE,
                ground_truth TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS collected_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                experiment_id INTEGER NOT NULL,
                run_id INTEGER NOT NULL DEFAULT 1,
                experiment_name TEXT,
                step INTEGER NOT NULL,
                bits TEXT,
                pulse_value INTEGER,
                duration REAL,
                time_stamp TEXT
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS collected_summary (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                experiment_id INTEGER NOT NULL,
                pattern TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query(r#"
            CREATE TABLE IF NOT EXISTS ai_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                source TEXT NOT NULL,
                encrypted_key TEXT,
                updated_at TEXT NOT NULL
            )
        "#).execute(&mut conn)?;

        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_collected_experiment ON collected_rows(experiment_id, run_id, step)").execute(&mut conn)?;
        diesel::sql_query("CREATE INDEX IF NOT EXISTS idx_summary_experiment ON collected_summary(experiment_id)").execute(&mut conn)?;

        Ok(())
    }

    fn last_insert_id(conn: &mut DbConn) -> Result<i32> {
        let id: i32 = diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("last_insert_rowid()"))
            .first(conn)?;
        Ok(id)
    }

    // ========================================================================
    // Plant Configurations
    // ========================================================================

    /// Create a plant configuration; duplicate names are a `Conflict`
    pub fn create_plant_config(&self, input: &PlantConfigInput) -> Result<i32> {
        let mut conn = self.get_conn()?;

        diesel::insert_into(plant_config::table)
            .values(&input.as_new())
            .execute(&mut conn)?;

        let id = Self::last_insert_id(&mut conn)?;
        tracing::info!(id, name = %input.experiment_name, "plant config created");
        Ok(id)
    }

    /// All plant configurations ordered by experiment name
    pub fn list_plant_configs(&self) -> Result<Vec<PlantConfig>> {
        let mut conn = self.get_conn()?;
        let configs = plant_config::table
            .order(plant_config::experiment_name.asc())
            .select(PlantConfig::as_select())
            .load(&mut conn)?;
        Ok(configs)
    }

    pub fn get_plant_config(&self, id: i32) -> Result<Option<PlantConfig>> {
        let mut conn = self.get_conn()?;
        let config = plant_config::table
            .find(id)
            .select(PlantConfig::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(config)
    }

    pub fn get_plant_config_by_name(&self, name: &str) -> Result<Option<PlantConfig>> {
        let mut conn = self.get_conn()?;
        let config = plant_config::table
            .filter(plant_config::experiment_name.eq(name))
            .select(PlantConfig::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(config)
    }

    /// Update a plant configuration; returns false when the id does not exist
    pub fn update_plant_config(&self, id: i32, input: &PlantConfigInput) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count = diesel::update(plant_config::table.find(id))
            .set(&input.as_new())
            .execute(&mut conn)?;
        Ok(count > 0)
    }

    pub fn delete_plant_config(&self, id: i32) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count = diesel::delete(plant_config::table.find(id)).execute(&mut conn)?;
        if count > 0 {
            tracing::info!(id, "plant config deleted");
        }
        Ok(count > 0)
    }

    // ========================================================================
    // Ground Truth Patterns
    // ========================================================================

    pub fn create_ground_truth(&self, experiment_name: &str, ground_truth: &str) -> Result<i32> {
        let mut conn = self.get_conn()?;

        diesel::insert_into(ground_truth_patterns::table)
            .values(&NewGroundTruth { experiment_name, ground_truth })
            .execute(&mut conn)?;

        Self::last_insert_id(&mut conn)
    }

    /// All patterns ordered by experiment name
    pub fn list_ground_truth(&self) -> Result<Vec<GroundTruthPattern>> {
        let mut conn = self.get_conn()?;
        let patterns = ground_truth_patterns::table
            .order(ground_truth_patterns::experiment_name.asc())
            .select(GroundTruthPattern::as_select())
            .load(&mut conn)?;
        Ok(patterns)
    }

    pub fn get_ground_truth(&self, id: i32) -> Result<Option<GroundTruthPattern>> {
        let mut conn = self.get_conn()?;
        let pattern = ground_truth_patterns::table
            .find(id)
            .select(GroundTruthPattern::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(pattern)
    }

    pub fn get_ground_truth_by_experiment(&self, experiment_name: &str) -> Result<Option<GroundTruthPattern>> {
        let mut conn = self.get_conn()?;
        let pattern = ground_truth_patterns::table
            .filter(ground_truth_patterns::experiment_name.eq(experiment_name))
            .select(GroundTruthPattern::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(pattern)
    }

    pub fn update_ground_truth(&self, id: i32, experiment_name: &str, ground_truth: &str) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count = diesel::update(ground_truth_patterns::table.find(id))
            .set(&NewGroundTruth { experiment_name, ground_truth })
            .execute(&mut conn)?;
        Ok(count > 0)
    }

    pub fn delete_ground_truth(&self, id: i32) -> Result<bool> {
        let mut conn = self.get_conn()?;
        let count = diesel::delete(ground_truth_patterns::table.find(id)).execute(&mut conn)?;
        Ok(count > 0)
    }

    /// Insert or replace the pattern of an experiment; returns its id
    pub fn upsert_ground_truth(&self, experiment_name: &str, ground_truth: &str) -> Result<i32> {
        let mut conn = self.get_conn()?;
        Self::upsert_ground_truth_with(&mut conn, experiment_name, ground_truth)
    }

    fn upsert_ground_truth_with(conn: &mut DbConn, experiment_name: &str, ground_truth: &str) -> Result<i32> {
        diesel::insert_into(ground_truth_patterns::table)
            .values(&NewGroundTruth { experiment_name, ground_truth })
            .on_conflict(ground_truth_patterns::experiment_name)
            .do_update()
            .set(ground_truth_patterns::ground_truth.eq(ground_truth))
            .execute(conn)?;

        let id = ground_truth_patterns::table
            .filter(ground_truth_patterns::experiment_name.eq(experiment_name))
            .select(ground_truth_patterns::id)
            .first(conn)?;
        Ok(id)
    }

    /// Upsert every row whose experiment is in `allowed`.
    /// Returns `(imported, skipped)`.
    pub fn import_ground_truth(
        &self,
        rows: &[GroundTruthRow],
        allowed: &HashSet<String>,
    ) -> Result<(usize, usize)> {
        let mut conn = self.get_conn()?;

        conn.transaction::<_, DbError, _>(|conn| {
            let mut imported = 0;
            let mut skipped = 0;
            for row in rows {
                if !allowed.contains(&row.experiment_name) {
                    tracing::warn!(name = %row.experiment_name, "no experiment configured, skipping pattern");
                    skipped += 1;
                    continue;
                }
                Self::upsert_ground_truth_with(conn, &row.experiment_name, &row.ground_truth)?;
                imported += 1;
            }
            Ok((imported, skipped))
        })
    }

    // ========================================================================
    // Collected Data
    // ========================================================================

    /// Run id the next recording session of an experiment should use
    pub fn next_run_id(&self, experiment_id: i32) -> Result<i32> {
        let mut conn = self.get_conn()?;
        Self::next_run_id_with(&mut conn, experiment_id)
    }

    fn next_run_id_with(conn: &mut DbConn, experiment_id: i32) -> Result<i32> {
        let last = collected_rows::table
            .filter(collected_rows::experiment_id.eq(experiment_id))
            .select(diesel::dsl::max(collected_rows::run_id))
            .first::<Option<i32>>(conn)?;
        Ok(last.unwrap_or(0) + 1)
    }

    /// Most recent run of an experiment, if anything was collected
    pub fn last_run_id(&self, experiment_id: i32) -> Result<Option<i32>> {
        let mut conn = self.get_conn()?;
        let id = collected_rows::table
            .filter(collected_rows::experiment_id.eq(experiment_id))
            .select(diesel::dsl::max(collected_rows::run_id))
            .first::<Option<i32>>(&mut conn)?;
        Ok(id)
    }

    /// Store one step closed by the recorder as part of run `run_id`
    pub fn insert_collected_row(&self, run_id: i32, step: &RecordedStep) -> Result<i32> {
        let mut conn = self.get_conn()?;

        let row = NewCollectedRow {
            experiment_id: step.experiment_id,
            run_id,
            experiment_name: Some(&step.experiment_name),
            step: step.step,
            bits: serde_json::to_string(&step.bits).ok(),
            pulse_value: i32::try_from(step.pulse_value).ok(),
            duration: Some(step.duration),
            time_stamp: Some(step.timestamp.to_string()),
        };

        diesel::insert_into(collected_rows::table)
            .values(&row)
            .execute(&mut conn)?;

        Self::last_insert_id(&mut conn)
    }

    /// Store imported samples as a new run of an experiment, in one
    /// transaction. Returns the run id and the number of rows.
    /// Samples without a step index are numbered by their position.
    pub fn import_collected_rows(
        &self,
        experiment_id: i32,
        experiment_name: &str,
        samples: &[CollectedSample],
    ) -> Result<(i32, usize)> {
        let mut conn = self.get_conn()?;

        let (run_id, count) = conn.transaction::<_, DbError, _>(|conn| {
            let run_id = Self::next_run_id_with(conn, experiment_id)?;
            let mut count = 0;
            for (idx, s) in samples.iter().enumerate() {
                let row = NewCollectedRow {
                    experiment_id,
                    run_id,
                    experiment_name: Some(experiment_name),
                    step: s.step.unwrap_or(idx as i32),
                    bits: s.bits.clone(),
                    pulse_value: s.pulse_value.and_then(|v| i32::try_from(v).ok()),
                    duration: s.duration,
                    time_stamp: s.time_stamp.clone(),
                };
                count += diesel::insert_into(collected_rows::table)
                    .values(&row)
                    .execute(conn)?;
            }
            Ok((run_id, count))
        })?;

        tracing::info!(experiment_id, run_id, count, "collected rows imported");
        Ok((run_id, count))
    }

    /// Most recent rows across all experiments, newest first
    pub fn list_collected(&self, limit: i64) -> Result<Vec<CollectedRow>> {
        let mut conn = self.get_conn()?;
        let rows = collected_rows::table
            .order(collected_rows::id.desc())
            .limit(limit)
            .select(CollectedRow::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Rows of one experiment, run by run, each in step order
    pub fn list_collected_by_experiment(&self, experiment_id: i32, limit: i64) -> Result<Vec<CollectedRow>> {
        let mut conn = self.get_conn()?;
        let rows = collected_rows::table
            .filter(collected_rows::experiment_id.eq(experiment_id))
            .order((collected_rows::run_id.asc(), collected_rows::step.asc(), collected_rows::id.asc()))
            .limit(limit)
            .select(CollectedRow::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Rows of a single run in step order
    pub fn list_collected_run(&self, experiment_id: i32, run_id: i32, limit: i64) -> Result<Vec<CollectedRow>> {
        let mut conn = self.get_conn()?;
        let rows = collected_rows::table
            .filter(collected_rows::experiment_id.eq(experiment_id))
            .filter(collected_rows::run_id.eq(run_id))
            .order((collected_rows::step.asc(), collected_rows::id.asc()))
            .limit(limit)
            .select(CollectedRow::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Pulse values of an experiment, run by run (invalid values skipped)
    pub fn pulse_values_by_experiment(&self, experiment_id: i32) -> Result<Vec<u32>> {
        let mut conn = self.get_conn()?;
        let values: Vec<Option<i32>> = collected_rows::table
            .filter(collected_rows::experiment_id.eq(experiment_id))
            .order((collected_rows::run_id.asc(), collected_rows::step.asc(), collected_rows::id.asc()))
            .select(collected_rows::pulse_value)
            .load(&mut conn)?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|v| u32::try_from(v).ok())
            .collect())
    }

    pub fn clear_collected(&self, experiment_id: i32) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let count = diesel::delete(collected_rows::table.filter(collected_rows::experiment_id.eq(experiment_id)))
            .execute(&mut conn)?;
        Ok(count)
    }

    // ========================================================================
    // Run Summaries
    // ========================================================================

    pub fn insert_summary(&self, experiment_id: i32, pattern: &str) -> Result<i32> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();

        diesel::insert_into(collected_summary::table)
            .values(&NewCollectedSummary { experiment_id, pattern, created_at: &now })
            .execute(&mut conn)?;

        Self::last_insert_id(&mut conn)
    }

    pub fn latest_summary(&self, experiment_id: i32) -> Result<Option<CollectedSummary>> {
        let mut conn = self.get_conn()?;
        let summary = collected_summary::table
            .filter(collected_summary::experiment_id.eq(experiment_id))
            .order(collected_summary::id.desc())
            .select(CollectedSummary::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(summary)
    }

    // ========================================================================
    // AI Key Settings
    // ========================================================================

    /// Replace the settings row; the table never holds more than one
    pub fn save_ai_key_settings(&self, source: &str, encrypted_key: Option<&str>) -> Result<()> {
        let mut conn = self.get_conn()?;
        let now = chrono::Local::now().to_rfc3339();

        conn.transaction::<_, DbError, _>(|conn| {
            diesel::delete(ai_settings::table).execute(conn)?;
            diesel::insert_into(ai_settings::table)
                .values(&NewAiSettings { source, encrypted_key, updated_at: &now })
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn get_ai_key_settings(&self) -> Result<Option<AiSettingsRow>> {
        let mut conn = self.get_conn()?;
        let row = ai_settings::table
            .order(ai_settings::id.desc())
            .select(AiSettingsRow::as_select())
            .first(&mut conn)
            .optional()?;
        Ok(row)
    }

    pub fn clear_ai_key_settings(&self) -> Result<()> {
        let mut conn = self.get_conn()?;
        diesel::delete(ai_settings::table).execute(&mut conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(dir.path().join("nested").join("lab.sqlite3")).unwrap();
        (dir, db)
    }

    fn config(name: &str) -> PlantConfigInput {
        PlantConfigInput {
            experiment_name: name.to_string(),
            ip_profinet: "192.168.0.10".to_string(),
            rack_profinet: 0,
            slot_profinet: 1,
            db_number_profinet: 5,
            num_of_inputs: 2,
            num_of_outputs: 2,
            io_names: None,
        }
    }

    // ==========================================================================
    // INPUT VALIDATION
    // ==========================================================================

    #[test]
    fn test_input_from_json_accepts_numeric_strings() {
        let payload = json!({
            "experiment_name": " press ",
            "ip_profinet": "10.0.0.1",
            "rack_profinet": "0",
            "slot_profinet": 1,
            "db_number_profinet": "12",
            "num_of_inputs": 4,
            "num_of_outputs": "4"
        });
        let input = PlantConfigInput::from_json(&payload).unwrap();
        assert_eq!(input.experiment_name, "press");
        assert_eq!(input.db_number_profinet, 12);
        assert_eq!(input.num_of_outputs, 4);
    }

    #[test]
    fn test_input_from_json_collects_all_errors() {
        let payload = json!({
            "experiment_name": "",
            "ip_profinet": "10.0.0.1",
            "rack_profinet": "abc",
            "slot_profinet": 1,
            "num_of_inputs": 1,
            "num_of_outputs": 1
        });
        let errors = PlantConfigInput::from_json(&payload).unwrap_err();
        assert!(errors.contains(&"field experiment_name is required".to_string()));
        assert!(errors.contains(&"field rack_profinet must be an integer".to_string()));
        assert!(errors.contains(&"field db_number_profinet is required".to_string()));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_input_rejects_too_many_ios() {
        let mut input = config("x");
        input.num_of_inputs = 6;
        input.num_of_outputs = 3;
        let errors = input.validate().unwrap_err();
        assert!(errors[0].contains("greater than 8"));
    }

    #[test]
    fn test_input_rejects_mismatched_io_names() {
        let mut input = config("x");
        input.io_names = Some(vec!["a".to_string()]);
        assert!(input.validate().is_err());
    }

    // ==========================================================================
    // PLANT CONFIG CRUD
    // ==========================================================================

    #[test]
    fn test_plant_config_crud() {
        let (_dir, db) = temp_db();

        let id = db.create_plant_config(&config("press")).unwrap();
        let stored = db.get_plant_config(id).unwrap().unwrap();
        assert_eq!(stored.experiment_name, "press");
        assert_eq!(stored.layout(), IoLayout::new(2, 2));

        let mut changed = config("press-v2");
        changed.io_names = Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]);
        assert!(db.update_plant_config(id, &changed).unwrap());

        let stored = db.get_plant_config_by_name("press-v2").unwrap().unwrap();
        assert_eq!(stored.io_name_list().unwrap(), vec!["a", "b", "c", "d"]);

        assert!(db.delete_plant_config(id).unwrap());
        assert!(db.get_plant_config(id).unwrap().is_none());
        assert!(!db.delete_plant_config(id).unwrap());
    }

    #[test]
    fn test_update_missing_config_returns_false() {
        let (_dir, db) = temp_db();
        assert!(!db.update_plant_config(42, &config("ghost")).unwrap());
    }

    #[test]
    fn test_duplicate_experiment_name_conflicts() {
        let (_dir, db) = temp_db();
        db.create_plant_config(&config("press")).unwrap();
        let err = db.create_plant_config(&config("press")).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn test_list_configs_sorted_by_name() {
        let (_dir, db) = temp_db();
        db.create_plant_config(&config("zeta")).unwrap();
        db.create_plant_config(&config("alpha")).unwrap();

        let names: Vec<String> = db.list_plant_configs().unwrap().into_iter().map(|c| c.experiment_name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    // ==========================================================================
    // GROUND TRUTH
    // ==========================================================================

    #[test]
    fn test_ground_truth_crud_and_upsert() {
        let (_dir, db) = temp_db();

        let id = db.create_ground_truth("press", "[1,2]").unwrap();
        assert_eq!(db.get_ground_truth(id).unwrap().unwrap().ground_truth, "[1,2]");

        let same = db.upsert_ground_truth("press", "[3]").unwrap();
        assert_eq!(same, id);
        let stored = db.get_ground_truth_by_experiment("press").unwrap().unwrap();
        assert_eq!(stored.ground_truth, "[3]");

        assert!(db.update_ground_truth(id, "press", "[4]").unwrap());
        assert!(db.delete_ground_truth(id).unwrap());
        assert!(db.list_ground_truth().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_ground_truth_conflicts() {
        let (_dir, db) = temp_db();
        db.create_ground_truth("press", "[1]").unwrap();
        assert!(matches!(db.create_ground_truth("press", "[2]"), Err(DbError::Conflict(_))));
    }

    #[test]
    fn test_import_ground_truth_skips_unknown_experiments() {
        let (_dir, db) = temp_db();
        let rows = vec![
            GroundTruthRow { experiment_name: "press".into(), ground_truth: "[1]".into() },
            GroundTruthRow { experiment_name: "ghost".into(), ground_truth: "[2]".into() },
            GroundTruthRow { experiment_name: "press".into(), ground_truth: "[5]".into() },
        ];
        let allowed: HashSet<String> = ["press".to_string()].into_iter().collect();

        let (imported, skipped) = db.import_ground_truth(&rows, &allowed).unwrap();
        assert_eq!((imported, skipped), (2, 1));
        assert_eq!(db.list_ground_truth().unwrap().len(), 1);
        assert_eq!(db.get_ground_truth_by_experiment("press").unwrap().unwrap().ground_truth, "[5]");
    }

    // ==========================================================================
    // COLLECTED DATA
    // ==========================================================================

    #[test]
    fn test_import_and_list_collected() {
        let (_dir, db) = temp_db();
        let samples = vec![
            CollectedSample { step: Some(1), pulse_value: Some(4), duration: Some(1.0), ..Default::default() },
            CollectedSample { step: Some(0), pulse_value: Some(8), duration: Some(2.0), ..Default::default() },
        ];
        assert_eq!(db.import_collected_rows(3, "press", &samples).unwrap(), (1, 2));

        let rows = db.list_collected_by_experiment(3, DEFAULT_CORRECTION_LIMIT).unwrap();
        let values: Vec<Option<i32>> = rows.iter().map(|r| r.pulse_value).collect();
        assert_eq!(values, vec![Some(8), Some(4)]);
        assert_eq!(rows[0].to_pulse_step(), PulseStep::new(8, 2.0));

        // Newest first across experiments
        let recent = db.list_collected(DEFAULT_COLLECTED_LIMIT).unwrap();
        assert_eq!(recent[0].step, 0);

        assert_eq!(db.pulse_values_by_experiment(3).unwrap(), vec![8, 4]);
        assert_eq!(db.last_run_id(3).unwrap(), Some(1));
        assert_eq!(db.clear_collected(3).unwrap(), 2);
        assert_eq!(db.last_run_id(3).unwrap(), None);
        assert_eq!(db.next_run_id(3).unwrap(), 1);
    }

    #[test]
    fn test_each_import_is_a_separate_run() {
        let (_dir, db) = temp_db();
        let run: Vec<CollectedSample> = [8, 4, 2, 8, 4, 2, 0]
            .iter()
            .enumerate()
            .map(|(i, &v)| CollectedSample { step: Some(i as i32), pulse_value: Some(v), ..Default::default() })
            .collect();

        assert_eq!(db.import_collected_rows(1, "press", &run).unwrap(), (1, 7));
        assert_eq!(db.import_collected_rows(1, "press", &run).unwrap(), (2, 7));
        // Another experiment numbers its runs independently
        assert_eq!(db.import_collected_rows(2, "lift", &run[..2]).unwrap(), (1, 2));

        assert_eq!(db.last_run_id(1).unwrap(), Some(2));
        assert_eq!(db.next_run_id(1).unwrap(), 3);

        // Runs stay whole instead of interleaving on equal step numbers
        assert_eq!(
            db.pulse_values_by_experiment(1).unwrap(),
            vec![8, 4, 2, 8, 4, 2, 0, 8, 4, 2, 8, 4, 2, 0]
        );
        let latest = db.list_collected_run(1, 2, DEFAULT_CORRECTION_LIMIT).unwrap();
        assert_eq!(latest.len(), 7);
        assert!(latest.iter().all(|r| r.run_id == 2));
        let steps: Vec<i32> = latest.iter().map(|r| r.step).collect();
        assert_eq!(steps, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_samples_without_step_use_position() {
        let (_dir, db) = temp_db();
        let samples = vec![
            CollectedSample { pulse_value: Some(1), ..Default::default() },
            CollectedSample { pulse_value: Some(2), ..Default::default() },
        ];
        db.import_collected_rows(1, "x", &samples).unwrap();
        let steps: Vec<i32> = db.list_collected_by_experiment(1, 10).unwrap().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![0, 1]);
    }

    #[test]
    fn test_insert_collected_row() {
        let (_dir, db) = temp_db();
        let step = RecordedStep {
            experiment_id: 2,
            experiment_name: "press".into(),
            step: 0,
            bits: vec![true, false],
            pulse_value: 2,
            duration: 1.5,
            timestamp: 1000.0,
        };
        let run_id = db.next_run_id(2).unwrap();
        db.insert_collected_row(run_id, &step).unwrap();

        let rows = db.list_collected_by_experiment(2, 10).unwrap();
        assert_eq!(rows[0].run_id, 1);
        assert_eq!(rows[0].bits.as_deref(), Some("[true,false]"));
        assert_eq!(rows[0].to_pulse_step(), PulseStep::new(2, 1.5));
    }

    #[test]
    fn test_summaries_latest_wins() {
        let (_dir, db) = temp_db();
        db.insert_summary(1, "[1,2]").unwrap();
        db.insert_summary(1, "[3,4]").unwrap();
        assert_eq!(db.latest_summary(1).unwrap().unwrap().pattern, "[3,4]");
        assert!(db.latest_summary(2).unwrap().is_none());
    }

    // ==========================================================================
    // AI KEY SETTINGS
    // ==========================================================================

    #[test]
    fn test_ai_settings_single_row() {
        let (_dir, db) = temp_db();
        db.save_ai_key_settings("manual", Some("cipher")).unwrap();
        db.save_ai_key_settings("system_variable", None).unwrap();

        let row = db.get_ai_key_settings().unwrap().unwrap();
        assert_eq!(row.source, "system_variable");
        assert!(row.encrypted_key.is_none());

        db.clear_ai_key_settings().unwrap();
        assert!(db.get_ai_key_settings().unwrap().is_none());
    }
}
