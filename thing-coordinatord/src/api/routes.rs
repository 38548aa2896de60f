use std::sync::{Arc, Mutex};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use shared::composition::{CompositionError, IoTApp};
use shared::protocol::API_PREFIX;
use shared::types::{Entity, Relationship, Service, Thing};
use crate::engine::runs::{RunError, RunManager, RunState};
use crate::registry_manager::RegistryHandle;
use crate::store::db::{AppListing, AppStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub hash_rx: watch::Receiver<String>,
    pub store: Arc<Mutex<AppStore>>,
    pub runs: RunManager,
}

type ApiError = (StatusCode, String);

#[derive(Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    pub problems: Vec<String>,
}

#[derive(Serialize)]
pub struct RunStarted {
    pub run_id: String,
}

#[derive(Deserialize)]
pub struct RunInput {
    pub value: String,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/things", get(get_things))
        .route("/things/stale", get(get_stale_things))
        .route("/entities", get(get_entities))
        .route("/services", get(get_services))
        .route("/relationships", get(get_relationships))
        .route("/registry/hash", get(get_hash))
        .route("/apps", get(list_apps))
        .route("/apps/:id", get(get_app).put(put_app).delete(delete_app))
        .route("/apps/:id/validate", get(validate_app))
        .route("/apps/:id/runs", post(start_run))
        .route("/runs/:run", get(get_run))
        .route("/runs/:run/input", post(answer_run))
        .route("/runs/:run/cancel", post(cancel_run));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

fn internal(context: &str, e: impl std::fmt::Display) -> ApiError {
    tracing::error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, context.to_string())
}

async fn get_things(State(state): State<AppState>) -> Result<Json<Vec<Thing>>, ApiError> {
    state.registry.things().await
        .map(Json)
        .map_err(|e| internal("Failed to query things", e))
}

async fn get_stale_things(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    state.registry.stale_things().await
        .map(Json)
        .map_err(|e| internal("Failed to query stale things", e))
}

async fn get_entities(State(state): State<AppState>) -> Result<Json<Vec<Entity>>, ApiError> {
    state.registry.entities().await
        .map(Json)
        .map_err(|e| internal("Failed to query entities", e))
}

async fn get_services(State(state): State<AppState>) -> Result<Json<Vec<Service>>, ApiError> {
    state.registry.services().await
        .map(Json)
        .map_err(|e| internal("Failed to query services", e))
}

async fn get_relationships(State(state): State<AppState>) -> Result<Json<Vec<Relationship>>, ApiError> {
    state.registry.relationships().await
        .map(Json)
        .map_err(|e| internal("Failed to query relationships", e))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

/// Run a store operation off the async workers
async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AppStore) -> anyhow::Result<T> + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        f(&store)
    })
    .await
    .map_err(|e| internal("Store task failed", e))?
    .map_err(|e| internal("Store operation failed", format!("{:#}", e)))
}

async fn load_app(state: &AppState, id: String) -> Result<IoTApp, ApiError> {
    with_store(state, move |store| store.get_app(&id))
        .await?
        .ok_or((StatusCode::NOT_FOUND, "No such app".to_string()))
}

async fn list_apps(State(state): State<AppState>) -> Result<Json<Vec<AppListing>>, ApiError> {
    with_store(&state, |store| store.list_apps()).await.map(Json)
}

async fn get_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IoTApp>, ApiError> {
    load_app(&state, id).await.map(Json)
}

/// Decode an app document. Unparseable JSON is a bad request; a document
/// that parses but breaks the graph rules is unprocessable.
fn parse_app(body: &str) -> Result<IoTApp, ApiError> {
    IoTApp::from_json(body).map_err(|e| match &e {
        CompositionError::Serialization(inner) if !inner.is_data() => {
            (StatusCode::BAD_REQUEST, e.to_string())
        }
        _ => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    })
}

async fn put_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let app = parse_app(&body)?;
    if app.id() != id {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Body id {} does not match path id {}", app.id(), id),
        ));
    }

    let created = with_store(&state, move |store| store.upsert_app(&app)).await?;
    tracing::info!("Saved app {}", id);
    Ok(if created { StatusCode::CREATED } else { StatusCode::NO_CONTENT })
}

async fn delete_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = with_store(&state, move |store| store.delete_app(&id)).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "No such app".to_string()))
    }
}

async fn validate_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidationResponse>, ApiError> {
    let app = load_app(&state, id).await?;
    let problems = app.validate();
    Ok(Json(ValidationResponse {
        valid: problems.is_empty(),
        problems,
    }))
}

async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let app = load_app(&state, id).await?;
    let run_id = state.runs.start(app);
    Ok((StatusCode::ACCEPTED, Json(RunStarted { run_id })))
}

fn run_error(e: RunError) -> ApiError {
    match e {
        RunError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        RunError::NotWaiting(_) => (StatusCode::CONFLICT, e.to_string()),
    }
}

async fn get_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> Result<Json<RunState>, ApiError> {
    state.runs.state(&run).map(Json).map_err(run_error)
}

async fn answer_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
    Json(input): Json<RunInput>,
) -> Result<StatusCode, ApiError> {
    state.runs.answer(&run, input.value).map_err(run_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.runs.cancel(&run).map_err(run_error)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_json_is_bad_request() {
        let (status, _) = parse_app("{not json").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_graph_violation_is_unprocessable() {
        // the edge's endpoints are not among the app's instances
        let body = r#"{
            "id": "app-1",
            "name": "broken",
            "service_instances": [],
            "relationship_instances": [{
                "id": "r1",
                "type": "ordered",
                "src": {"id": "a", "service": {"name": "A", "thing_id": "T", "thing_name": "T", "entity_id": "E", "space_id": "S", "endpoint": "A", "input_params": [], "output": null}, "input_values": {}},
                "dst": {"id": "b", "service": {"name": "B", "thing_id": "T", "thing_name": "T", "entity_id": "E", "space_id": "S", "endpoint": "B", "input_params": [], "output": null}, "input_values": {}}
            }]
        }"#;
        let (status, message) = parse_app(body).unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(message.contains("invalid graph"), "{message}");
    }

    #[test]
    fn test_valid_document_parses() {
        let app = IoTApp::with_id("app-1", "empty");
        let parsed = parse_app(&app.to_json().unwrap()).unwrap();
        assert_eq!(parsed.id(), "app-1");
    }
}
