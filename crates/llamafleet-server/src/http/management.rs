//! Management REST surface: a thin CRUD adapter over the Registry (spec §6), mirroring
//! the shape of the teacher's `berth registry-api` command.

use std::time::SystemTime;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use llamafleet_registry::{InstanceOptions, InstanceOptionsInput};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/instances", get(list_instances))
        .route(
            "/api/instances/:name",
            post(create_instance).get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route("/api/instances/:name/start", post(start_instance))
        .route("/api/instances/:name/stop", post(stop_instance))
        .route("/api/instances/:name/restart", post(restart_instance))
        .route("/api/instances/:name/logs", get(get_logs))
}

#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub name: String,
    pub running: bool,
    pub restarts: u32,
    pub last_used_at_epoch_seconds: u64,
    pub options: Option<InstanceOptions>,
}

async fn view(instance: &llamafleet_registry::Instance) -> InstanceView {
    let last_used_at_epoch_seconds = instance
        .last_used_at()
        .await
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    InstanceView {
        name: instance.name().to_string(),
        running: instance.is_running().await,
        restarts: instance.restarts().await,
        last_used_at_epoch_seconds,
        options: instance.options().await,
    }
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    let mut out = Vec::new();
    for instance in state.registry.list().await {
        out.push(view(&instance).await);
    }
    Json(out)
}

async fn get_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<InstanceView>, ApiError> {
    let instance = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| llamafleet_registry::RegistryError::NotFound(name.clone()))?;
    Ok(Json(view(&instance).await))
}

async fn create_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<InstanceOptionsInput>,
) -> Result<Json<InstanceView>, ApiError> {
    let instance = state.registry.create(&name, input).await?;
    Ok(Json(view(&instance).await))
}

/// Updates an instance's options. Per spec §9, does not auto-restart a running
/// instance to pick up the new values — the caller must explicitly `POST .../restart`.
async fn update_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<InstanceOptionsInput>,
) -> Result<(), ApiError> {
    state.registry.update(&name, input).await?;
    Ok(())
}

async fn delete_instance(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.delete(&name).await?;
    Ok(())
}

async fn start_instance(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.start(&name).await?;
    Ok(())
}

async fn stop_instance(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.stop(&name).await?;
    Ok(())
}

async fn restart_instance(State(state): State<AppState>, Path(name): Path<String>) -> Result<(), ApiError> {
    state.registry.restart(&name).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    lines: Option<i64>,
}

async fn get_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let instance = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| llamafleet_registry::RegistryError::NotFound(name.clone()))?;
    let lines = instance
        .get_logs(query.lines.unwrap_or(-1))
        .await
        .map_err(|e| {
            llamafleet_registry::RegistryError::Supervisor(llamafleet_registry::SupervisorError::LogFile(e))
        })?;
    Ok(Json(lines))
}
