//! The OpenAI-compatible inference surface: resolves `model` to an Instance, starts it
//! on demand, waits for readiness, and reverse-proxies the request (spec §4.4).

use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use llamafleet_registry::Instance;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::ApiError;
use super::AppState;

const HEALTH_POLL_INITIAL: Duration = Duration::from_millis(100);
const HEALTH_POLL_CAP: Duration = Duration::from_secs(2);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
}

async fn chat_completions(
    state: State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    proxy(state, headers, body, "/v1/chat/completions").await
}

async fn completions(state: State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    proxy(state, headers, body, "/v1/completions").await
}

async fn embeddings(state: State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    proxy(state, headers, body, "/v1/embeddings").await
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let names: Vec<Value> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|i| serde_json::json!({"id": i.name(), "object": "model"}))
        .collect();
    Json(serde_json::json!({"object": "list", "data": names}))
}

async fn proxy(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
    upstream_path: &'static str,
) -> Result<Response, ApiError> {
    let model = extract_model(&body)?;
    let instance = state
        .registry
        .get(&model)
        .await
        .ok_or_else(|| ApiError::UnknownModel(model.clone()))?;

    if !instance.is_running().await {
        if !state.config.on_demand_start {
            return Err(ApiError::UnknownModel(model));
        }
        state.registry.start(&model).await?;
        await_ready(&state, &instance).await?;
    }

    instance.touch_last_used().await;
    let proxy_target = instance
        .get_proxy()
        .await
        .ok_or_else(|| ApiError::UnknownModel(model.clone()))?;

    let url = proxy_target.url_for(upstream_path);
    let mut upstream_headers = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_ref()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            upstream_headers.insert(name, value);
        }
    }

    let response = proxy_target
        .client()
        .post(&url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(ApiError::UpstreamConnection)?;

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let stream = response.bytes_stream();
    let mut out = Response::new(Body::from_stream(stream));
    *out.status_mut() = status;
    *out.headers_mut() = response_headers;
    Ok(out)
}

fn extract_model(body: &Bytes) -> Result<String, ApiError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ApiError::MissingModel)?;
    value
        .get("model")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or(ApiError::MissingModel)
}

/// Polls the instance's health endpoint with exponential backoff until it reports
/// ready or `health_check_timeout_seconds` elapses (spec §4.4).
async fn await_ready(state: &AppState, instance: &Arc<Instance>) -> Result<(), ApiError> {
    let deadline = Instant::now() + Duration::from_secs(state.config.health_check_timeout_seconds);
    let mut backoff = HEALTH_POLL_INITIAL;

    loop {
        let Some(proxy) = instance.get_proxy().await else {
            return Err(ApiError::ReadinessTimeout(instance.name().to_string()));
        };
        let url = proxy.url_for(&state.config.health_check_path);
        match state.health_client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(instance = instance.name(), "instance reported ready");
                return Ok(());
            }
            Ok(resp) => {
                warn!(instance = instance.name(), status = %resp.status(), "health check not ready yet");
            }
            Err(e) => {
                warn!(instance = instance.name(), error = %e, "health check request failed");
            }
        }

        if Instant::now() + backoff >= deadline {
            return Err(ApiError::ReadinessTimeout(instance.name().to_string()));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(HEALTH_POLL_CAP);
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "host" | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use llamafleet_registry::{NoEviction, Registry, RestartPolicy};
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let registry = Arc::new(Registry::new(
            dir.path().join("state"),
            dir.path().join("logs"),
            RestartPolicy::default(),
            0,
            4,
            Arc::new(NoEviction),
        ));
        AppState::new(registry, Arc::new(llamafleet_runtime::AppConfig::default()))
    }

    #[test]
    fn extract_model_rejects_body_without_model_field() {
        let body = Bytes::from_static(br#"{"messages":[]}"#);
        assert!(matches!(extract_model(&body), Err(ApiError::MissingModel)));
    }

    #[test]
    fn extract_model_reads_model_field() {
        let body = Bytes::from_static(br#"{"model":"small","messages":[]}"#);
        assert_eq!(extract_model(&body).unwrap(), "small");
    }

    #[tokio::test]
    async fn chat_completions_for_unknown_model_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router().with_state(state(&dir));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"nope","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_completions_missing_model_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router().with_state(state(&dir));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_models_is_empty_with_no_instances() {
        let dir = tempfile::tempdir().unwrap();
        let app = router().with_state(state(&dir));
        let resp = app
            .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

