use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::core::error::PipelineError;
use crate::services::task::{PollPolicy, TaskBackend, TaskKind, TaskStatus};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub visual: String,
    #[serde(default)]
    pub hero_prompt: String,
    #[serde(default)]
    pub page_prompts: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            story: String::new(),
            visual: String::new(),
            hero_prompt: String::new(),
            page_prompts: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    300
}

impl AssistantConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// One assistant, driven through the thread/run API.
///
/// A task id is `"{thread_id}/{run_id}"`; every submission gets its own
/// thread so concurrent jobs never share conversation state.
#[derive(Debug)]
pub struct AssistantClient {
    base_url: String,
    api_key: String,
    assistant_id: String,
    kind: TaskKind,
    client: reqwest::Client,
}

impl AssistantClient {
    pub fn new(config: &AssistantConfig, assistant_id: &str, kind: TaskKind) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            assistant_id: assistant_id.to_string(),
            kind,
            client: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: for<'de> Deserialize<'de>>(request: reqwest::RequestBuilder, what: &str) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Assistant API error on {} ({}): {}", what, status, error_text));
        }

        let body = resp.text().await?;
        serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse {} response. Body: {}", what, body))
    }

    async fn start_run(&self, content: String) -> Result<String> {
        let thread: ObjectId = Self::send(self.post("/threads").json(&json!({})), "create thread").await?;

        let message = MessageRequest {
            role: "user".to_string(),
            content,
        };
        let _: Value = Self::send(
            self.post(&format!("/threads/{}/messages", thread.id)).json(&message),
            "create message",
        )
        .await?;

        let run: ObjectId = Self::send(
            self.post(&format!("/threads/{}/runs", thread.id)).json(&RunRequest {
                assistant_id: self.assistant_id.clone(),
            }),
            "create run",
        )
        .await?;

        Ok(format!("{}/{}", thread.id, run.id))
    }
}

#[derive(Serialize)]
struct MessageRequest {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct RunRequest {
    assistant_id: String,
}

#[derive(Deserialize)]
struct ObjectId {
    id: String,
}

#[derive(Deserialize, Debug)]
struct RunResponse {
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Deserialize, Debug)]
struct RunError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<ThreadMessage>,
}

#[derive(Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Deserialize)]
struct MessageText {
    value: String,
}

impl RunResponse {
    fn task_status(&self) -> TaskStatus {
        match self.status.as_str() {
            "queued" => TaskStatus::Queued,
            "completed" => TaskStatus::Ready,
            "failed" | "cancelled" | "expired" | "incomplete" => {
                let reason = self
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("run {}", self.status));
                TaskStatus::Errored(reason)
            }
            _ => TaskStatus::InProgress,
        }
    }
}

impl MessageList {
    /// Newest assistant text; the API lists messages newest first.
    fn first_assistant_text(&self) -> Option<String> {
        self.data
            .iter()
            .filter(|m| m.role == "assistant")
            .flat_map(|m| m.content.iter())
            .filter(|c| c.kind == "text")
            .find_map(|c| c.text.as_ref().map(|t| t.value.clone()))
    }
}

fn split_task_id(task_id: &str) -> Result<(&str, &str), PipelineError> {
    task_id
        .split_once('/')
        .filter(|(thread, run)| !thread.is_empty() && !run.is_empty())
        .ok_or_else(|| PipelineError::DataShape(format!("malformed assistant task id '{}'", task_id)))
}

fn transport(err: anyhow::Error) -> PipelineError {
    PipelineError::Submission(format!("{:#}", err))
}

/// Message body sent to the assistant: strings verbatim, anything else as JSON.
pub fn message_content(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TaskBackend for AssistantClient {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn submit(&self, payload: &Value) -> Result<String, PipelineError> {
        let task_id = self.start_run(message_content(payload)).await.map_err(transport)?;
        debug!("Started {} run {} on assistant {}", self.kind, task_id, self.assistant_id);
        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
        let (thread, run) = split_task_id(task_id)?;
        let resp: RunResponse = Self::send(self.get(&format!("/threads/{}/runs/{}", thread, run)), "retrieve run")
            .await
            .map_err(transport)?;
        Ok(resp.task_status())
    }

    async fn fetch(&self, task_id: &str) -> Result<Value, PipelineError> {
        let (thread, _) = split_task_id(task_id)?;
        let list: MessageList = Self::send(self.get(&format!("/threads/{}/messages", thread)), "list messages")
            .await
            .map_err(transport)?;
        list.first_assistant_text()
            .map(Value::String)
            .ok_or_else(|| PipelineError::DataShape(format!("no assistant reply in thread {}", thread)))
    }
}
