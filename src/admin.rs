use crate::error::EngineError;
use crate::metrics;
use crate::models::{InstanceStatus, LogEntry, MockConfig};
use crate::registry::Registry;
use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

/// Control surface over HTTP, nested under `/_admin` by the binary.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes))
        .route(
            "/nodes/:node_id",
            get(get_node).put(configure_node).delete(remove_node),
        )
        .route("/nodes/:node_id/start", post(start_node))
        .route("/nodes/:node_id/stop", post(stop_node))
        .route("/nodes/:node_id/status", get(node_status))
        .route("/nodes/:node_id/logs", get(query_logs).delete(clear_logs))
        .route("/nodes/:node_id/logs/stream", get(stream_logs))
        .route("/nodes/:node_id/logs/:entry_id", delete(delete_log))
        .route("/metrics", get(render_metrics))
        .with_state(registry)
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            EngineError::NotConfigured(_) => StatusCode::NOT_FOUND,
            EngineError::Busy(_) | EngineError::PortBind { .. } => StatusCode::CONFLICT,
            EngineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            EngineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.code(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn list_nodes(State(registry): State<Registry>) -> Json<Vec<InstanceStatus>> {
    Json(registry.list())
}

async fn get_node(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<Json<MockConfig>> {
    Ok(Json(registry.config(&node_id)?))
}

async fn configure_node(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
    Json(config): Json<MockConfig>,
) -> ApiResult<Json<InstanceStatus>> {
    Ok(Json(registry.configure(&node_id, config)?))
}

async fn remove_node(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<StatusCode> {
    registry.remove(&node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_node(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<Json<InstanceStatus>> {
    Ok(Json(registry.start(&node_id).await?))
}

async fn stop_node(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<Json<InstanceStatus>> {
    Ok(Json(registry.stop(&node_id).await?))
}

async fn node_status(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<Json<InstanceStatus>> {
    Ok(Json(registry.status(&node_id)?))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    keyword: Option<String>,
}

async fn query_logs(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
    Query(q): Query<LogQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(registry.query_logs(&node_id, q.keyword.as_deref())?))
}

async fn clear_logs(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> StatusCode {
    registry.clear_logs(&node_id);
    StatusCode::NO_CONTENT
}

async fn delete_log(
    State(registry): State<Registry>,
    AxPath((node_id, entry_id)): AxPath<(String, u64)>,
) -> ApiResult<StatusCode> {
    if registry.delete_log(&node_id, entry_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn stream_logs(
    State(registry): State<Registry>,
    AxPath(node_id): AxPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (instance_id, mut rx) = registry.subscribe_logs(&node_id)?;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(entry) if entry.instance_id == instance_id => {
                    match Event::default().json_data(&*entry) {
                        Ok(event) => yield Ok(event),
                        Err(e) => tracing::warn!("Failed to encode log event: {}", e),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Log stream for {} lagged, skipped {} entries", node_id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn render_metrics() -> String {
    metrics::render()
}
