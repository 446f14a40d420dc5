//! Correction of a stored experiment
//!
//! Loads the plant configuration, the professor's pattern and the latest
//! collected run of one experiment and runs the matcher over them. Shared by the CLI
//! and the REST API.

use crate::correction::{self, CorrectionError, CorrectionOptions, CorrectionReport};
use crate::db::{Database, DbError, DEFAULT_CORRECTION_LIMIT};
use crate::report::BatchEntry;
use rayon::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("experiment {0} not found")]
    NotFound(i32),
    #[error("no ground truth pattern for experiment `{0}`")]
    NoGroundTruth(String),
    #[error("no collected rows for experiment {0}")]
    NoCollected(i32),
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Grade the latest collected run of experiment `experiment_id`
pub fn correct_experiment(
    db: &Database,
    experiment_id: i32,
    options: &CorrectionOptions,
) -> Result<CorrectionReport, GradeError> {
    let config = db
        .get_plant_config(experiment_id)?
        .ok_or(GradeError::NotFound(experiment_id))?;

    let ground_truth = db
        .get_ground_truth_by_experiment(&config.experiment_name)?
        .ok_or_else(|| GradeError::NoGroundTruth(config.experiment_name.clone()))?;
    let pattern = correction::parse_pattern(&ground_truth.ground_truth)?;

    let run_id = db
        .last_run_id(experiment_id)?
        .ok_or(GradeError::NoCollected(experiment_id))?;
    let rows = db.list_collected_run(experiment_id, run_id, DEFAULT_CORRECTION_LIMIT)?;
    if rows.is_empty() {
        return Err(GradeError::NoCollected(experiment_id));
    }
    let sequence: Vec<_> = rows.iter().map(|r| r.to_pulse_step()).collect();

    let gt_json = serde_json::from_str::<serde_json::Value>(&ground_truth.ground_truth).ok();
    let configured = config.io_name_list();
    let io_names = correction::resolve_io_names(
        configured.as_deref(),
        gt_json.as_ref(),
        Some(config.layout()),
    );

    let report = correction::correct(&pattern, &sequence, &io_names, options)?;
    tracing::info!(
        experiment_id,
        run_id,
        name = %config.experiment_name,
        verdict = %report.verdict,
        occurrences = report.occurrences,
        "correction finished"
    );
    Ok(report)
}

/// Grade every configured experiment that has a ground truth pattern
pub fn correct_all(db: &Database, options: &CorrectionOptions) -> Result<Vec<BatchEntry>, GradeError> {
    let configs = db.list_plant_configs()?;
    let patterns: std::collections::HashSet<String> = db
        .list_ground_truth()?
        .into_iter()
        .map(|p| p.experiment_name)
        .collect();

    let entries = configs
        .par_iter()
        .filter(|c| patterns.contains(&c.experiment_name))
        .map(|c| {
            let (report, error) = match correct_experiment(db, c.id, options) {
                Ok(report) => (Some(report), None),
                Err(e) => (None, Some(e.to_string())),
            };
            BatchEntry {
                experiment_id: c.id,
                experiment_name: c.experiment_name.clone(),
                report,
                error,
            }
        })
        .collect();

    Ok(entries)
}
