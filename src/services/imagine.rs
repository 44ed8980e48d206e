use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::PipelineError;
use crate::services::task::{
    run_to_completion, PollPolicy, SessionProvider, TaskBackend, TaskKind, TaskStatus,
};

const UPSCALE_BUTTONS: [&str; 4] = ["U1", "U2", "U3", "U4"];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_upscale")]
    pub upscale: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
            upscale: default_upscale(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.mymidjourney.ai/api/v1/midjourney".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_upscale() -> bool {
    true
}

impl ImageConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Opens one HTTP session per fan-out batch.
pub struct ImageClient {
    config: ImageConfig,
}

impl ImageClient {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl SessionProvider for ImageClient {
    fn open_session(&self) -> Arc<dyn TaskBackend> {
        debug!("Opening image session");
        Arc::new(ImageSession {
            base_url: self.config.base_url.trim_end_matches('/').to_string(),
            api_key: self.config.api_key.clone(),
            client: reqwest::Client::new(),
        })
    }
}

/// Connection context shared by the sub-jobs of one batch. Its connection
/// pool is released when the last clone is dropped.
pub struct ImageSession {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct MessageStatus {
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl MessageStatus {
    fn task_status(&self) -> TaskStatus {
        if self.status.as_deref() == Some("FAIL") {
            return TaskStatus::Errored(
                self.error.clone().unwrap_or_else(|| "image generation failed".to_string()),
            );
        }
        match self.progress {
            Some(p) if p >= 100.0 => TaskStatus::Ready,
            Some(p) if p > 0.0 => TaskStatus::InProgress,
            _ if self.status.as_deref() == Some("PROCESSING") => TaskStatus::InProgress,
            _ => TaskStatus::Queued,
        }
    }
}

impl ImageSession {
    async fn post_action(&self, path: &str, body: &Value) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", path))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Image API error on {} ({}): {}", path, status, error_text));
        }

        let body = resp.text().await?;
        let parsed: SubmitResponse = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse {} response. Body: {}", path, body))?;
        match parsed.message_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(anyhow!(
                "No messageId in {} response: {}",
                path,
                parsed.error.unwrap_or(body)
            )),
        }
    }

    async fn message(&self, message_id: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{}/message/{}", self.base_url, message_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("Failed to check image status")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Image API status error ({}): {}", status, error_text));
        }
        Ok(resp.json::<Value>().await?)
    }
}

fn transport(err: anyhow::Error) -> PipelineError {
    PipelineError::Submission(format!("{:#}", err))
}

#[async_trait]
impl TaskBackend for ImageSession {
    fn kind(&self) -> TaskKind {
        TaskKind::Image
    }

    /// `{"prompt": ..}` starts a generation; `{"messageId": .., "button": ..}`
    /// applies a button action to a finished one.
    async fn submit(&self, payload: &Value) -> Result<String, PipelineError> {
        let path = if payload.get("button").is_some() {
            "/button"
        } else {
            "/imagine"
        };
        self.post_action(path, payload).await.map_err(transport)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
        let message = self.message(task_id).await.map_err(transport)?;
        let status: MessageStatus = serde_json::from_value(message).unwrap_or_default();
        Ok(status.task_status())
    }

    async fn fetch(&self, task_id: &str) -> Result<Value, PipelineError> {
        self.message(task_id).await.map_err(transport)
    }
}

pub fn pick_upscale_button() -> &'static str {
    UPSCALE_BUTTONS.choose(&mut rand::rng()).copied().unwrap_or("U1")
}

fn image_uri(result: Option<&Value>, task_id: &str) -> Result<String, PipelineError> {
    result
        .and_then(|v| v.get("uri"))
        .and_then(Value::as_str)
        .filter(|uri| !uri.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::DataShape(format!("image task {} finished without a uri", task_id)))
}

/// Generates one image and, when `upscale` is set, upscales a random quadrant.
pub async fn render_image(
    session: &dyn TaskBackend,
    prompt: &str,
    poll: PollPolicy,
    upscale: bool,
) -> Result<String, PipelineError> {
    let grid = run_to_completion(session, &json!({ "prompt": prompt }), poll).await?;
    if !upscale {
        return image_uri(grid.result.as_ref(), &grid.task_id);
    }

    let button = pick_upscale_button();
    debug!("Applying {} to image task {}", button, grid.task_id);
    let upscaled = run_to_completion(
        session,
        &json!({ "messageId": grid.task_id, "button": button }),
        poll,
    )
    .await?;
    let uri = image_uri(upscaled.result.as_ref(), &upscaled.task_id)?;
    info!("Image ready: {}", uri);
    Ok(uri)
}
