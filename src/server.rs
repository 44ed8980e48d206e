use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::core::error::PipelineError;
use crate::services::pipeline::{story_payload, Coordinator};

#[derive(Debug)]
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub async fn process_story(
    State(coordinator): State<Arc<Coordinator>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let accepted = coordinator.accept_job(&payload).await?;
    // The worker keeps running detached once its handle is dropped.
    Ok(Json(json!({
        "tripettoId": accepted.correlation_id,
        "story": accepted.story,
    })))
}

pub async fn get_story_data(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = coordinator.get_job(&id).await?;
    let mut body = story_payload(&job.id, &job.input_config, job.story().unwrap_or(&Value::Null));
    body["image_urls"] = json!(job.image_urls());
    body["status"] = json!(job.status);
    body["stage"] = json!(job.stage);
    Ok(Json(body))
}

pub fn api_routes() -> Router<Arc<Coordinator>> {
    Router::new()
        .route("/process-story", post(process_story))
        .route("/get-story-data/{id}", get(get_story_data))
}

pub async fn serve(bind: &str, coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let app = Router::new().merge(api_routes()).with_state(coordinator);
    let listener = TcpListener::bind(bind).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
