use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::PipelineError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Text,
    VisualDescription,
    PromptSynthesis,
    Image,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::VisualDescription => "visual_description",
            Self::PromptSynthesis => "prompt_synthesis",
            Self::Image => "image",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Ready,
    TimedOut,
    Errored(String),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::TimedOut | Self::Errored(_))
    }
}

/// One outstanding call to an external generation service.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub submitted_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub result: Option<Value>,
}

impl GenerationTask {
    fn submitted(task_id: String, kind: TaskKind) -> Self {
        Self {
            task_id,
            kind,
            submitted_at: Utc::now(),
            status: TaskStatus::Queued,
            result: None,
        }
    }

    fn elapsed(&self) -> Duration {
        (Utc::now() - self.submitted_at).to_std().unwrap_or_default()
    }
}

/// Submit / poll / fetch against one external generation service.
///
/// Implementations never retry internally; `submit` transport failures
/// surface as `PipelineError::Submission`.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn kind(&self) -> TaskKind;
    async fn submit(&self, payload: &Value) -> Result<String, PipelineError>;
    async fn poll(&self, task_id: &str) -> Result<TaskStatus, PipelineError>;
    async fn fetch(&self, task_id: &str) -> Result<Value, PipelineError>;
}

/// Hands out a backend bound to a fresh connection context.
///
/// A fan-out batch opens exactly one session and drops it once every
/// sub-job in the batch has finished.
pub trait SessionProvider: Send + Sync {
    fn open_session(&self) -> Arc<dyn TaskBackend>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Submits once, polls until ready/errored or the timeout elapses, then
/// fetches the result exactly once.
pub async fn run_to_completion(
    backend: &dyn TaskBackend,
    payload: &Value,
    policy: PollPolicy,
) -> Result<GenerationTask, PipelineError> {
    let kind = backend.kind();
    let task_id = backend.submit(payload).await?;
    let mut task = GenerationTask::submitted(task_id, kind);
    debug!("Submitted {} task {}", kind, task.task_id);

    let waited = tokio::time::timeout(policy.timeout, async {
        loop {
            match backend.poll(&task.task_id).await {
                Ok(status) if status.is_terminal() => return status,
                Ok(status) => task.status = status,
                Err(e) => warn!("Polling {} task {} failed: {}", kind, task.task_id, e),
            }
            tokio::time::sleep(policy.interval).await;
        }
    })
    .await;

    match waited {
        Ok(TaskStatus::Ready) => {
            task.status = TaskStatus::Ready;
            task.result = Some(backend.fetch(&task.task_id).await?);
            debug!("{} task {} ready after {:?}", kind, task.task_id, task.elapsed());
            Ok(task)
        }
        Ok(TaskStatus::Errored(reason)) => Err(PipelineError::TaskErrored {
            kind,
            task_id: task.task_id,
            reason,
        }),
        Ok(other) => Err(PipelineError::TaskErrored {
            kind,
            task_id: task.task_id,
            reason: format!("unexpected terminal status {:?}", other),
        }),
        Err(_) => {
            task.status = TaskStatus::TimedOut;
            Err(PipelineError::Timeout {
                kind,
                task_id: task.task_id,
                waited: policy.timeout,
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.backoff;
        }
        self.backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Runs `op` up to `policy.attempts` times, sleeping between attempts.
/// Returns the last error once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            warn!("{} failed (attempt {}/{}), retrying...", label, attempt + 1, attempts);
            tokio::time::sleep(policy.delay()).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} error: {}", label, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| PipelineError::Submission(format!("{} never ran", label))))
}
