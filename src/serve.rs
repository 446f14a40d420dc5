//! REST API
//!
//! `remotelab serve` → JSON endpoints for experiments, ground truth
//! patterns, collected rows, corrections and the AI key settings.
//! Every response is wrapped in `{ ok, data, error }`.

use crate::correction::CorrectionOptions;
use crate::db::{CollectedSample, Database, DbError, PlantConfigInput, DEFAULT_COLLECTED_LIMIT};
use crate::grading::{self, GradeError};
use crate::secrets::{self, AiKeySource, KeyCipher, SecretError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiny_http::{Header, Method, Request, Response, Server};

#[derive(Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }
}

impl ApiResponse<()> {
    fn failure(error: String) -> Self {
        Self { ok: false, data: None, error: Some(error) }
    }
}

/// Status code and JSON body of a handled request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    fn ok<T: Serialize>(data: T) -> Self {
        Self::with_status(200, data)
    }

    fn created<T: Serialize>(data: T) -> Self {
        Self::with_status(201, data)
    }

    fn with_status<T: Serialize>(status: u16, data: T) -> Self {
        match serde_json::to_string(&ApiResponse::success(data)) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(500, format!("serialization failed: {}", e)),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        let body = serde_json::to_string(&ApiResponse::failure(message.into()))
            .unwrap_or_else(|_| r#"{"ok":false,"data":null,"error":"internal error"}"#.to_string());
        Self { status, body }
    }
}

/// Errors a handler can return; each maps to one status code
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    fn into_reply(self) -> Reply {
        match self {
            ApiError::BadRequest(m) => Reply::error(400, m),
            ApiError::NotFound(m) => Reply::error(404, m),
            ApiError::Conflict(m) => Reply::error(409, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                Reply::error(500, m)
            }
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict(m) => ApiError::Conflict(format!("experiment name already exists ({})", m)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<GradeError> for ApiError {
    fn from(e: GradeError) -> Self {
        match e {
            GradeError::NotFound(_) => ApiError::NotFound(e.to_string()),
            GradeError::NoGroundTruth(_) | GradeError::NoCollected(_) | GradeError::Correction(_) => {
                ApiError::BadRequest(e.to_string())
            }
            GradeError::Db(db) => db.into(),
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(e: SecretError) -> Self {
        match e {
            SecretError::Db(db) => db.into(),
            SecretError::UnknownSource(_) | SecretError::MissingManualKey => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult = Result<Reply, ApiError>;

/// Everything the handlers need
pub struct AppState {
    pub db: Database,
    pub cipher: KeyCipher,
    pub correction: CorrectionOptions,
}

#[derive(Deserialize, Debug, Default)]
struct CollectedQuery {
    limit: Option<i64>,
    experiment_id: Option<i32>,
}

#[derive(Deserialize, Debug, Default)]
struct CorrectionParams {
    tolerance: Option<f64>,
    required_occurrences: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct AiKeyUpdate {
    source: String,
    #[serde(default)]
    manual_key: Option<String>,
}

/// Start the server and handle requests until the process is stopped
pub fn start(addr: &str, state: AppState) -> std::io::Result<()> {
    let server = Server::http(addr).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
    })?;

    tracing::info!(addr, db = %state.db.path().display(), "remotelab API listening");

    for request in server.incoming_requests() {
        if let Err(e) = handle_request(request, &state) {
            tracing::warn!(error = %e, "failed to answer request");
        }
    }

    Ok(())
}

fn handle_request(mut request: Request, state: &AppState) -> std::io::Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();

    let mut body = String::new();
    request.as_reader().read_to_string(&mut body)?;

    let reply = route(state, &method, &url, &body);
    tracing::debug!(%method, %url, status = reply.status, "request");

    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response.add_header(header);
    }
    request.respond(response)
}

/// Dispatch one request. Kept free of socket I/O so it can be driven directly.
pub fn route(state: &AppState, method: &Method, url: &str, body: &str) -> Reply {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, q),
        None => (url, ""),
    };
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = match (method, segments.as_slice()) {
        (Method::Get, ["api", "experiments"]) => list_experiments(state),
        (Method::Post, ["api", "experiments"]) => create_experiment(state, body),
        (Method::Get, ["api", "experiments", id]) => with_id(id, |id| get_experiment(state, id)),
        (Method::Put, ["api", "experiments", id]) => with_id(id, |id| update_experiment(state, id, body)),
        (Method::Delete, ["api", "experiments", id]) => with_id(id, |id| delete_experiment(state, id)),
        (Method::Post, ["api", "experiments", id, "correction"]) => {
            with_id(id, |id| run_correction(state, id, body))
        }

        (Method::Get, ["api", "ground-truth"]) => list_ground_truth(state),
        (Method::Post, ["api", "ground-truth"]) => create_ground_truth(state, body),
        (Method::Get, ["api", "ground-truth", id]) => with_id(id, |id| get_ground_truth(state, id)),
        (Method::Put, ["api", "ground-truth", id]) => with_id(id, |id| update_ground_truth(state, id, body)),
        (Method::Delete, ["api", "ground-truth", id]) => with_id(id, |id| delete_ground_truth(state, id)),

        (Method::Get, ["api", "collected"]) => list_collected(state, query),
        (Method::Post, ["api", "collected", id]) => with_id(id, |id| import_collected(state, id, body)),
        (Method::Get, ["api", "collected", id, "summary"]) => with_id(id, |id| collected_summary(state, id)),

        (Method::Get, ["api", "settings", "ai-key"]) => get_ai_key(state),
        (Method::Put, ["api", "settings", "ai-key"]) => put_ai_key(state, body),

        _ => Err(ApiError::NotFound(format!("no route for {} {}", method, path))),
    };

    result.unwrap_or_else(ApiError::into_reply)
}

fn with_id<F>(raw: &str, handler: F) -> ApiResult
where
    F: FnOnce(i32) -> ApiResult,
{
    let id = raw
        .parse::<i32>()
        .map_err(|_| ApiError::BadRequest(format!("invalid id `{}`", raw)))?;
    handler(id)
}

fn parse_json(body: &str) -> Result<Value, ApiError> {
    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    serde_json::from_str(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {}", e)))
}

// ============================================================================
// Experiments
// ============================================================================

fn list_experiments(state: &AppState) -> ApiResult {
    Ok(Reply::ok(state.db.list_plant_configs()?))
}

fn experiment_input(body: &str) -> Result<PlantConfigInput, ApiError> {
    let payload = parse_json(body)?;
    PlantConfigInput::from_json(&payload).map_err(|errors| ApiError::BadRequest(errors.join("; ")))
}

fn create_experiment(state: &AppState, body: &str) -> ApiResult {
    let input = experiment_input(body)?;
    let id = state.db.create_plant_config(&input)?;
    let created = state
        .db
        .get_plant_config(id)?
        .ok_or_else(|| ApiError::Internal(format!("experiment {} vanished after insert", id)))?;
    Ok(Reply::created(created))
}

fn get_experiment(state: &AppState, id: i32) -> ApiResult {
    state
        .db
        .get_plant_config(id)?
        .map(Reply::ok)
        .ok_or_else(|| ApiError::NotFound(format!("experiment {} not found", id)))
}

fn update_experiment(state: &AppState, id: i32, body: &str) -> ApiResult {
    let input = experiment_input(body)?;
    if !state.db.update_plant_config(id, &input)? {
        return Err(ApiError::NotFound(format!("experiment {} not found", id)));
    }
    get_experiment(state, id)
}

fn delete_experiment(state: &AppState, id: i32) -> ApiResult {
    if !state.db.delete_plant_config(id)? {
        return Err(ApiError::NotFound(format!("experiment {} not found", id)));
    }
    Ok(Reply::ok(serde_json::json!({ "deleted": id })))
}

fn run_correction(state: &AppState, id: i32, body: &str) -> ApiResult {
    let params: CorrectionParams = if body.trim().is_empty() {
        CorrectionParams::default()
    } else {
        serde_json::from_str(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {}", e)))?
    };

    let mut options = state.correction;
    if let Some(tolerance) = params.tolerance {
        options.tolerance = tolerance;
    }
    if let Some(required) = params.required_occurrences {
        if required == 0 {
            return Err(ApiError::BadRequest("required_occurrences must be at least 1".to_string()));
        }
        options.required_occurrences = required;
    }

    Ok(Reply::ok(grading::correct_experiment(&state.db, id, &options)?))
}

// ============================================================================
// Ground Truth
// ============================================================================

/// `(experiment_name, ground_truth)` from a body. The pattern may be sent as
/// JSON or as an already serialized string.
fn ground_truth_input(state: &AppState, body: &str) -> Result<(String, String), ApiError> {
    let payload = parse_json(body)?;

    let name = payload
        .get("experiment_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("field experiment_name is required".to_string()))?
        .to_string();

    let pattern = match payload.get("ground_truth") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(other) => Some(other.to_string()),
    }
    .ok_or_else(|| ApiError::BadRequest("field ground_truth is required".to_string()))?;

    crate::correction::parse_pattern(&pattern)
        .map_err(|e| ApiError::BadRequest(format!("invalid ground_truth: {}", e)))?;

    if state.db.get_plant_config_by_name(&name)?.is_none() {
        return Err(ApiError::BadRequest(format!("no experiment named `{}` is configured", name)));
    }

    Ok((name, pattern))
}

fn list_ground_truth(state: &AppState) -> ApiResult {
    Ok(Reply::ok(state.db.list_ground_truth()?))
}

fn create_ground_truth(state: &AppState, body: &str) -> ApiResult {
    let (name, pattern) = ground_truth_input(state, body)?;
    let id = state.db.create_ground_truth(&name, &pattern).map_err(|e| match e {
        DbError::Conflict(_) => ApiError::Conflict(format!("a pattern for `{}` already exists", name)),
        other => other.into(),
    })?;
    let created = state.db.get_ground_truth(id)?;
    Ok(Reply::created(created))
}

fn get_ground_truth(state: &AppState, id: i32) -> ApiResult {
    state
        .db
        .get_ground_truth(id)?
        .map(Reply::ok)
        .ok_or_else(|| ApiError::NotFound(format!("ground truth {} not found", id)))
}

fn update_ground_truth(state: &AppState, id: i32, body: &str) -> ApiResult {
    let (name, pattern) = ground_truth_input(state, body)?;
    let updated = state.db.update_ground_truth(id, &name, &pattern).map_err(|e| match e {
        DbError::Conflict(_) => ApiError::Conflict(format!("a pattern for `{}` already exists", name)),
        other => other.into(),
    })?;
    if !updated {
        return Err(ApiError::NotFound(format!("ground truth {} not found", id)));
    }
    get_ground_truth(state, id)
}

fn delete_ground_truth(state: &AppState, id: i32) -> ApiResult {
    if !state.db.delete_ground_truth(id)? {
        return Err(ApiError::NotFound(format!("ground truth {} not found", id)));
    }
    Ok(Reply::ok(serde_json::json!({ "deleted": id })))
}

// ============================================================================
// Collected Data
// ============================================================================

fn list_collected(state: &AppState, query: &str) -> ApiResult {
    let params: CollectedQuery = serde_urlencoded::from_str(query)
        .map_err(|e| ApiError::BadRequest(format!("invalid query: {}", e)))?;

    let rows = match params.experiment_id {
        Some(id) => state
            .db
            .list_collected_by_experiment(id, params.limit.unwrap_or(crate::db::DEFAULT_CORRECTION_LIMIT))?,
        None => state.db.list_collected(params.limit.unwrap_or(DEFAULT_COLLECTED_LIMIT))?,
    };
    Ok(Reply::ok(rows))
}

fn import_collected(state: &AppState, id: i32, body: &str) -> ApiResult {
    let config = state
        .db
        .get_plant_config(id)?
        .ok_or_else(|| ApiError::NotFound(format!("experiment {} not found", id)))?;

    let payload = parse_json(body)?;
    let rows = match payload {
        Value::Array(_) => payload,
        Value::Object(mut map) => map
            .remove("rows")
            .ok_or_else(|| ApiError::BadRequest("expected a list of rows or {\"rows\": [...]}".to_string()))?,
        _ => return Err(ApiError::BadRequest("expected a list of rows".to_string())),
    };
    let samples: Vec<CollectedSample> = serde_json::from_value(rows)
        .map_err(|e| ApiError::BadRequest(format!("invalid rows: {}", e)))?;

    let (run_id, count) = state.db.import_collected_rows(id, &config.experiment_name, &samples)?;
    Ok(Reply::created(serde_json::json!({ "imported": count, "run_id": run_id })))
}

fn collected_summary(state: &AppState, id: i32) -> ApiResult {
    let summary = state
        .db
        .latest_summary(id)?
        .ok_or_else(|| ApiError::NotFound(format!("no run summary for experiment {}", id)))?;
    Ok(Reply::ok(summary))
}

// ============================================================================
// AI Key Settings
// ============================================================================

fn get_ai_key(state: &AppState) -> ApiResult {
    Ok(Reply::ok(secrets::ai_key_status(&state.db)?))
}

fn put_ai_key(state: &AppState, body: &str) -> ApiResult {
    let update: AiKeyUpdate = serde_json::from_value(parse_json(body)?)
        .map_err(|e| ApiError::BadRequest(format!("invalid settings: {}", e)))?;
    let source: AiKeySource = update.source.parse()?;

    secrets::save_ai_key(&state.db, &state.cipher, source, update.manual_key.as_deref())?;
    get_ai_key(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            db: Database::open_at(dir.path().join("lab.sqlite3")).unwrap(),
            cipher: KeyCipher::from_secret("test"),
            correction: CorrectionOptions::default(),
        };
        (dir, state)
    }

    fn body(reply: &Reply) -> Value {
        serde_json::from_str(&reply.body).unwrap()
    }

    fn experiment(name: &str) -> String {
        json!({
            "experiment_name": name,
            "ip_profinet": "192.168.0.1",
            "rack_profinet": 0,
            "slot_profinet": "1",
            "db_number_profinet": 7,
            "num_of_inputs": 2,
            "num_of_outputs": 2
        })
        .to_string()
    }

    // ==========================================================================
    // EXPERIMENTS
    // ==========================================================================

    #[test]
    fn test_experiment_lifecycle() {
        let (_dir, state) = state();

        let reply = route(&state, &Method::Post, "/api/experiments", &experiment("press"));
        assert_eq!(reply.status, 201);
        let id = body(&reply)["data"]["id"].as_i64().unwrap();

        let reply = route(&state, &Method::Get, &format!("/api/experiments/{}", id), "");
        assert_eq!(reply.status, 200);
        assert_eq!(body(&reply)["data"]["slot_profinet"], 1);

        let reply = route(&state, &Method::Put, &format!("/api/experiments/{}", id), &experiment("press-2"));
        assert_eq!(body(&reply)["data"]["experiment_name"], "press-2");

        let reply = route(&state, &Method::Delete, &format!("/api/experiments/{}", id), "");
        assert_eq!(reply.status, 200);

        let reply = route(&state, &Method::Get, &format!("/api/experiments/{}", id), "");
        assert_eq!(reply.status, 404);
        assert_eq!(body(&reply)["ok"], false);
    }

    #[test]
    fn test_validation_errors_are_400() {
        let (_dir, state) = state();
        let reply = route(&state, &Method::Post, "/api/experiments", r#"{"experiment_name": "x"}"#);
        assert_eq!(reply.status, 400);
        assert!(body(&reply)["error"].as_str().unwrap().contains("ip_profinet"));

        let reply = route(&state, &Method::Post, "/api/experiments", "not json");
        assert_eq!(reply.status, 400);

        let reply = route(&state, &Method::Get, "/api/experiments/abc", "");
        assert_eq!(reply.status, 400);
    }

    #[test]
    fn test_duplicate_experiment_is_409() {
        let (_dir, state) = state();
        route(&state, &Method::Post, "/api/experiments", &experiment("press"));
        let reply = route(&state, &Method::Post, "/api/experiments", &experiment("press"));
        assert_eq!(reply.status, 409);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let (_dir, state) = state();
        assert_eq!(route(&state, &Method::Get, "/api/nothing", "").status, 404);
        assert_eq!(route(&state, &Method::Patch, "/api/experiments", "").status, 404);
    }

    // ==========================================================================
    // GROUND TRUTH AND CORRECTION
    // ==========================================================================

    #[test]
    fn test_ground_truth_requires_configured_experiment() {
        let (_dir, state) = state();
        let payload = json!({"experiment_name": "ghost", "ground_truth": [1, 2]}).to_string();
        let reply = route(&state, &Method::Post, "/api/ground-truth", &payload);
        assert_eq!(reply.status, 400);
    }

    #[test]
    fn test_correction_flow() {
        let (_dir, state) = state();
        let reply = route(&state, &Method::Post, "/api/experiments", &experiment("press"));
        let id = body(&reply)["data"]["id"].as_i64().unwrap();

        let pattern = json!({
            "experiment_name": "press",
            "ground_truth": [{"pulse_value": 8, "duration": 1.0}, {"pulse_value": 4, "duration": 1.0}]
        });
        let reply = route(&state, &Method::Post, "/api/ground-truth", &pattern.to_string());
        assert_eq!(reply.status, 201);

        let reply = route(&state, &Method::Post, "/api/ground-truth", &pattern.to_string());
        assert_eq!(reply.status, 409);

        let rows = json!([
            {"step": 0, "pulse_value": 8, "duration": 1.0},
            {"step": 1, "pulse_value": 4, "duration": 1.1},
            {"step": 2, "pulse_value": 2, "duration": 1.0}
        ]);
        let reply = route(&state, &Method::Post, &format!("/api/collected/{}", id), &rows.to_string());
        assert_eq!(reply.status, 201);
        assert_eq!(body(&reply)["data"]["imported"], 3);
        assert_eq!(body(&reply)["data"]["run_id"], 1);

        let url = format!("/api/collected?experiment_id={}&limit=2", id);
        let reply = route(&state, &Method::Get, &url, "");
        assert_eq!(body(&reply)["data"].as_array().unwrap().len(), 2);

        let url = format!("/api/experiments/{}/correction", id);
        let reply = route(&state, &Method::Post, &url, "");
        assert_eq!(body(&reply)["data"]["verdict"], "rejected");
        assert_eq!(body(&reply)["data"]["occurrences"], 1);

        let reply = route(&state, &Method::Post, &url, r#"{"required_occurrences": 1}"#);
        assert_eq!(body(&reply)["data"]["verdict"], "approved");
    }

    #[test]
    fn test_collected_summary() {
        let (_dir, state) = state();
        let reply = route(&state, &Method::Post, "/api/experiments", &experiment("press"));
        let id = body(&reply)["data"]["id"].as_i64().unwrap() as i32;

        let url = format!("/api/collected/{}/summary", id);
        assert_eq!(route(&state, &Method::Get, &url, "").status, 404);

        state.db.insert_summary(id, "[8,4,0]").unwrap();
        let reply = route(&state, &Method::Get, &url, "");
        assert_eq!(reply.status, 200);
        assert_eq!(body(&reply)["data"]["pattern"], "[8,4,0]");
        assert_eq!(body(&reply)["data"]["experiment_id"], id);
    }

    #[test]
    fn test_correction_unknown_experiment_is_404() {
        let (_dir, state) = state();
        let reply = route(&state, &Method::Post, "/api/experiments/5/correction", "");
        assert_eq!(reply.status, 404);
    }

    // ==========================================================================
    // AI KEY SETTINGS
    // ==========================================================================

    #[test]
    fn test_ai_key_settings_never_return_key() {
        let (_dir, state) = state();
        let reply = route(&state, &Method::Get, "/api/settings/ai-key", "");
        assert_eq!(body(&reply)["data"]["source"], "system_variable");

        let payload = json!({"source": "manual", "manual_key": "sk-secret"}).to_string();
        let reply = route(&state, &Method::Put, "/api/settings/ai-key", &payload);
        assert_eq!(reply.status, 200);
        assert_eq!(body(&reply)["data"]["has_manual_key"], true);
        assert!(!reply.body.contains("sk-secret"));

        let payload = json!({"source": "manual"}).to_string();
        assert_eq!(route(&state, &Method::Put, "/api/settings/ai-key", &payload).status, 400);

        let payload = json!({"source": "cloud"}).to_string();
        assert_eq!(route(&state, &Method::Put, "/api/settings/ai-key", &payload).status, 400);
    }
}
