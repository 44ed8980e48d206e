use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::error::PipelineError;
use crate::core::ingress::parse_request;
use crate::core::job::{Job, JobStatus, PipelineStage, StoryConfiguration, StoryRequest};
use crate::core::store::JobStore;
use crate::services::assistant::{AssistantClient, AssistantConfig};
use crate::services::imagine::{render_image, ImageClient, ImageConfig};
use crate::services::notifier::Notifier;
use crate::services::task::{
    run_to_completion, with_retry, PollPolicy, RetryPolicy, SessionProvider, TaskBackend, TaskKind,
};
use crate::services::transform::{
    describe_visual, hero_prompt_from_response, normalize_story, page_label, ImagePromptSet,
    VisualDescription,
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_image_attempts")]
    pub image_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub retry_jitter_ms: u64,
    /// Caps in-flight image sub-jobs; unset runs every slot at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_attempts: default_image_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_jitter_ms: 0,
            max_concurrency: None,
        }
    }
}

fn default_image_attempts() -> usize {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub text_poll: PollPolicy,
    pub image_poll: PollPolicy,
    pub retry: RetryPolicy,
    pub max_concurrency: Option<usize>,
    pub upscale: bool,
}

impl PipelineSettings {
    pub fn from_config(pipeline: &PipelineConfig, assistant: &AssistantConfig, image: &ImageConfig) -> Self {
        Self {
            text_poll: assistant.poll_policy(),
            image_poll: image.poll_policy(),
            retry: RetryPolicy {
                attempts: pipeline.image_attempts,
                backoff: Duration::from_millis(pipeline.retry_backoff_ms),
                jitter: Duration::from_millis(pipeline.retry_jitter_ms),
            },
            max_concurrency: pipeline.max_concurrency,
            upscale: image.upscale,
        }
    }
}

/// External services, one backend per text stage plus the image provider.
pub struct StageClients {
    pub story: Arc<dyn TaskBackend>,
    pub visual: Arc<dyn TaskBackend>,
    pub hero_prompt: Arc<dyn TaskBackend>,
    pub page_prompts: Arc<dyn TaskBackend>,
    pub images: Arc<dyn SessionProvider>,
}

impl StageClients {
    pub fn from_config(assistant: &AssistantConfig, image: &ImageConfig) -> Self {
        Self {
            story: Arc::new(AssistantClient::new(assistant, &assistant.story, TaskKind::Text)),
            visual: Arc::new(AssistantClient::new(
                assistant,
                &assistant.visual,
                TaskKind::VisualDescription,
            )),
            hero_prompt: Arc::new(AssistantClient::new(
                assistant,
                &assistant.hero_prompt,
                TaskKind::PromptSynthesis,
            )),
            page_prompts: Arc::new(AssistantClient::new(
                assistant,
                &assistant.page_prompts,
                TaskKind::PromptSynthesis,
            )),
            images: Arc::new(ImageClient::new(image)),
        }
    }
}

/// Outcome of one image sub-job. `uri` is `None` once retries are exhausted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageResult {
    pub slot_id: String,
    pub page: String,
    pub uri: Option<String>,
}

/// What the caller gets back once the story exists. The remaining stages
/// keep running on `worker`.
pub struct AcceptedJob {
    pub correlation_id: String,
    pub story: Value,
    pub story_configuration: StoryConfiguration,
    pub worker: JoinHandle<()>,
}

pub fn story_payload(correlation_id: &str, request: &StoryRequest, story: &Value) -> Value {
    json!({
        "tripettoId": correlation_id,
        "order": request.order,
        "story_configuration": request.story_configuration,
        "visual_configuration": request.visual_configuration,
        "story": story,
    })
}

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    clients: StageClients,
    notifier: Arc<dyn Notifier>,
    settings: PipelineSettings,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        clients: StageClients,
        notifier: Arc<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            clients,
            notifier,
            settings,
        }
    }

    /// Validates the request, creates the job and generates the story.
    ///
    /// Returns as soon as the story is stored; imagery continues in the
    /// background. A story failure marks the job `Failed` and is returned
    /// to the caller without starting any image work.
    pub async fn accept_job(self: &Arc<Self>, payload: &Value) -> Result<AcceptedJob, PipelineError> {
        let (id, request) = parse_request(payload)?;
        self.store.create(&id, request.clone()).await?;
        info!("[{}] Job accepted", id);

        // A panic in the story backend must still end the job as `Failed`.
        let story_task = {
            let coordinator = self.clone();
            let request = request.clone();
            tokio::spawn(async move { coordinator.generate_story(&request).await })
        };
        let story = match story_task.await {
            Ok(Ok(story)) => story,
            Ok(Err(e)) => return Err(self.fail_story(&id, e.in_stage(PipelineStage::StoryGenerated)).await),
            Err(e) => {
                let err = PipelineError::StageFailed {
                    stage: PipelineStage::StoryGenerated,
                    message: if e.is_panic() {
                        format!("story stage panicked: {}", e)
                    } else {
                        format!("story stage cancelled: {}", e)
                    },
                };
                return Err(self.fail_story(&id, err).await);
            }
        };
        self.record(&id, PipelineStage::StoryGenerated, story.clone()).await?;
        info!("[{}] Story generated", id);

        let story_configuration = request.story_configuration.clone();
        let worker = self.spawn_background(id.clone(), request, story.clone());

        Ok(AcceptedJob {
            correlation_id: id,
            story,
            story_configuration,
            worker,
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, PipelineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    async fn generate_story(&self, request: &StoryRequest) -> Result<Value, PipelineError> {
        let raw = self
            .run_text_stage(self.clients.story.as_ref(), &json!(request.story_configuration))
            .await?;
        normalize_story(&raw).ok_or_else(|| PipelineError::DataShape("story response was empty".to_string()))
    }

    async fn run_text_stage(&self, backend: &dyn TaskBackend, payload: &Value) -> Result<Value, PipelineError> {
        let task = run_to_completion(backend, payload, self.settings.text_poll).await?;
        task.result.ok_or_else(|| {
            PipelineError::DataShape(format!("{} task {} returned no result", task.kind, task.task_id))
        })
    }

    async fn record(&self, id: &str, stage: PipelineStage, output: Value) -> Result<Job, PipelineError> {
        self.store
            .update(id, stage, output)
            .await
            .map_err(|e| e.in_stage(stage))
    }

    async fn fail_story(&self, id: &str, err: PipelineError) -> PipelineError {
        error!("[{}] {}", id, err);
        self.mark_failed(id, &err.to_string()).await;
        err
    }

    async fn mark_failed(&self, id: &str, message: &str) {
        if let Err(e) = self
            .store
            .set_status(id, JobStatus::Failed, Some(message.to_string()))
            .await
        {
            error!("[{}] Could not mark job as failed: {}", id, e);
        }
    }

    /// Runs the post-story stages on a detached task. Errors and panics in
    /// that task end with the job marked `Failed`; nothing escapes.
    fn spawn_background(self: &Arc<Self>, id: String, request: StoryRequest, story: Value) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let stages = {
                let coordinator = coordinator.clone();
                let id = id.clone();
                tokio::spawn(async move { coordinator.run_background(&id, &request, &story).await })
            };

            let failure = match stages.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) if e.is_panic() => Some(format!("background stage panicked: {}", e)),
                Err(e) => Some(format!("background stage cancelled: {}", e)),
            };
            if let Some(message) = failure {
                error!("[{}] {}", id, message);
                coordinator.mark_failed(&id, &message).await;
            }
        })
    }

    async fn run_background(&self, id: &str, request: &StoryRequest, story: &Value) -> Result<(), PipelineError> {
        self.store.set_status(id, JobStatus::Running, None).await?;
        let mut degraded = false;

        if let Err(e) = self.notifier.publish_story(&story_payload(id, request, story)).await {
            warn!("[{}] Story callback failed: {:#}", id, e);
        }

        // Visual description: non-fatal.
        let visual = match self
            .run_text_stage(self.clients.visual.as_ref(), &json!(request.visual_configuration))
            .await
        {
            Ok(raw) => describe_visual(&raw),
            Err(e) => {
                warn!("[{}] {}, continuing without it", id, e.in_stage(PipelineStage::VisualDescribed));
                VisualDescription::default()
            }
        };
        degraded |= visual.is_empty();
        self.record(id, PipelineStage::VisualDescribed, visual.to_value()).await?;

        // Hero image: non-fatal, downstream prompts tolerate its absence.
        let hero_uri = self.generate_hero_image(id, request, &visual).await;
        degraded |= hero_uri.is_none();
        self.record(id, PipelineStage::ChildImageReady, json!({ "child_image_uri": hero_uri }))
            .await?;

        let merged = visual.with_hero_image(hero_uri);
        let prompt_request = json!({
            "book_data": story,
            "visual_description": merged.to_value(),
        });
        let prompts = match self
            .run_text_stage(self.clients.page_prompts.as_ref(), &prompt_request)
            .await
        {
            Ok(raw) => ImagePromptSet::from_response(&raw),
            Err(e) => {
                warn!("[{}] {}", id, e.in_stage(PipelineStage::PromptsSynthesized));
                ImagePromptSet::default()
            }
        };
        degraded |= prompts.is_empty();
        self.record(id, PipelineStage::PromptsSynthesized, prompts.to_value()).await?;
        info!("[{}] {} image prompt(s) synthesized", id, prompts.len());

        let results = self.generate_page_images(id, &prompts).await;
        let image_urls: BTreeMap<String, String> = results
            .iter()
            .filter_map(|r| r.uri.as_ref().map(|uri| (r.page.clone(), uri.clone())))
            .collect();
        degraded |= image_urls.len() < prompts.len();
        self.record(
            id,
            PipelineStage::ImagesGenerated,
            json!({ "image_urls": image_urls, "results": results }),
        )
        .await?;
        info!("[{}] {}/{} image(s) generated", id, image_urls.len(), prompts.len());

        self.notifier
            .notify(id, &image_urls)
            .await
            .map_err(|e| PipelineError::StageFailed {
                stage: PipelineStage::Notified,
                message: format!("{:#}", e),
            })?;
        self.record(
            id,
            PipelineStage::Notified,
            json!({ "delivered_at": Utc::now(), "image_count": image_urls.len() }),
        )
        .await?;

        let status = if degraded {
            JobStatus::PartialFailure
        } else {
            JobStatus::Completed
        };
        self.store.set_status(id, status, None).await?;
        info!("[{}] Job finished as {:?}", id, status);
        Ok(())
    }

    async fn generate_hero_image(
        &self,
        id: &str,
        request: &StoryRequest,
        visual: &VisualDescription,
    ) -> Option<String> {
        let payload = json!({
            "visual_configuration": request.visual_configuration,
            "visual_description": visual.to_value(),
        });
        let prompt = match self.run_text_stage(self.clients.hero_prompt.as_ref(), &payload).await {
            Ok(raw) => hero_prompt_from_response(&raw)?,
            Err(e) => {
                warn!("[{}] Hero prompt failed: {}", id, e.in_stage(PipelineStage::ChildImageReady));
                return None;
            }
        };

        let session = self.clients.images.open_session();
        match render_image(session.as_ref(), &prompt, self.settings.image_poll, self.settings.upscale).await {
            Ok(uri) => {
                info!("[{}] Hero image ready", id);
                Some(uri)
            }
            Err(e) => {
                warn!("[{}] Hero image failed: {}", id, e.in_stage(PipelineStage::ChildImageReady));
                None
            }
        }
    }

    /// Fan-out/fan-in over one image session. Results come back in prompt
    /// order whatever order the sub-jobs finish in.
    async fn generate_page_images(&self, id: &str, prompts: &ImagePromptSet) -> Vec<ImageResult> {
        if prompts.is_empty() {
            return Vec::new();
        }

        let session = self.clients.images.open_session();
        let settings = self.settings;
        let in_flight = settings.max_concurrency.unwrap_or(prompts.len()).max(1);
        let slots: Vec<(usize, u32, String)> = prompts
            .iter()
            .enumerate()
            .map(|(position, (index, prompt))| (position, index, prompt.to_string()))
            .collect();

        let mut results: Vec<(usize, ImageResult)> = futures_util::stream::iter(slots)
            .map(|(position, index, prompt)| {
                let session = session.clone();
                let label = format!("[{}] image prompt_img_{:02}", id, index);
                async move {
                    let uri = with_retry(&label, settings.retry, |_| {
                        let session = session.clone();
                        let prompt = prompt.clone();
                        async move {
                            render_image(session.as_ref(), &prompt, settings.image_poll, settings.upscale).await
                        }
                    })
                    .await;

                    let uri = match uri {
                        Ok(uri) => Some(uri),
                        Err(e) => {
                            warn!("{} gave up: {}", label, e);
                            None
                        }
                    };
                    let result = ImageResult {
                        slot_id: format!("prompt_img_{:02}", index),
                        page: page_label(position),
                        uri,
                    };
                    (position, result)
                }
            })
            .buffer_unordered(in_flight)
            .collect()
            .await;

        drop(session);
        debug!("[{}] Image session released", id);

        results.sort_by_key(|(position, _)| *position);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryJobStore;
    use crate::services::task::TaskStatus;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Text stage that answers every task with a fixed reply.
    struct MockAssistant {
        kind: TaskKind,
        reply: Option<Value>,
        panic_on_fetch: bool,
        call_count: Arc<Mutex<usize>>,
    }

    impl MockAssistant {
        fn replying(kind: TaskKind, reply: Value) -> Self {
            Self {
                kind,
                reply: Some(reply),
                panic_on_fetch: false,
                call_count: Arc::new(Mutex::new(0)),
            }
        }

        fn failing(kind: TaskKind) -> Self {
            Self {
                kind,
                reply: None,
                panic_on_fetch: false,
                call_count: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl TaskBackend for MockAssistant {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn submit(&self, _payload: &Value) -> Result<String, PipelineError> {
            let mut count = self.call_count.lock().unwrap();
            *count += 1;
            if self.reply.is_none() {
                return Err(PipelineError::Submission("connection refused".into()));
            }
            Ok(format!("thread_{}/run_{}", count, count))
        }

        async fn poll(&self, _task_id: &str) -> Result<TaskStatus, PipelineError> {
            Ok(TaskStatus::Ready)
        }

        async fn fetch(&self, _task_id: &str) -> Result<Value, PipelineError> {
            if self.panic_on_fetch {
                panic!("assistant exploded");
            }
            Ok(self.reply.clone().unwrap_or(Value::Null))
        }
    }

    /// Image service; prompts containing "fail" always error, prompts
    /// containing "slow" finish last.
    #[derive(Default)]
    struct MockImages {
        sessions: Arc<Mutex<usize>>,
        submissions: Arc<Mutex<Vec<String>>>,
        tasks: Arc<Mutex<HashMap<String, String>>>,
    }

    struct MockImageSession {
        submissions: Arc<Mutex<Vec<String>>>,
        tasks: Arc<Mutex<HashMap<String, String>>>,
    }

    impl SessionProvider for MockImages {
        fn open_session(&self) -> Arc<dyn TaskBackend> {
            *self.sessions.lock().unwrap() += 1;
            Arc::new(MockImageSession {
                submissions: self.submissions.clone(),
                tasks: self.tasks.clone(),
            })
        }
    }

    #[async_trait]
    impl TaskBackend for MockImageSession {
        fn kind(&self) -> TaskKind {
            TaskKind::Image
        }

        async fn submit(&self, payload: &Value) -> Result<String, PipelineError> {
            let prompt = payload["prompt"].as_str().unwrap_or_default().to_string();
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(prompt.clone());
            if prompt.contains("fail") {
                return Err(PipelineError::Submission("image service down".into()));
            }
            let task_id = format!("m{}", submissions.len());
            self.tasks.lock().unwrap().insert(task_id.clone(), prompt);
            Ok(task_id)
        }

        async fn poll(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
            let slow = self
                .tasks
                .lock()
                .unwrap()
                .get(task_id)
                .is_some_and(|p| p.contains("slow"));
            if slow {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Ok(TaskStatus::Ready)
        }

        async fn fetch(&self, task_id: &str) -> Result<Value, PipelineError> {
            let prompt = self.tasks.lock().unwrap().get(task_id).cloned().unwrap_or_default();
            Ok(json!({ "progress": 100, "uri": format!("https://cdn/{}.png", prompt.replace(' ', "_")) }))
        }
    }

    #[derive(Default)]
    struct MockNotifier {
        should_fail: bool,
        story_delay: Option<Duration>,
        delivered: Arc<Mutex<Vec<(String, BTreeMap<String, String>)>>>,
        stories: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, correlation_id: &str, image_urls: &BTreeMap<String, String>) -> anyhow::Result<()> {
            if self.should_fail {
                return Err(anyhow::anyhow!("webhook unreachable"));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((correlation_id.to_string(), image_urls.clone()));
            Ok(())
        }

        async fn publish_story(&self, payload: &Value) -> anyhow::Result<()> {
            if let Some(delay) = self.story_delay {
                tokio::time::sleep(delay).await;
                return Err(anyhow::anyhow!("story webhook timed out"));
            }
            self.stories.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn settings() -> PipelineSettings {
        let poll = PollPolicy::new(Duration::from_millis(1), Duration::from_secs(2));
        PipelineSettings {
            text_poll: poll,
            image_poll: poll,
            retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(1),
                jitter: Duration::ZERO,
            },
            max_concurrency: None,
            upscale: false,
        }
    }

    fn visual_reply() -> Value {
        json!("```json\n{\"child_character\": {\"name\": \"Mia\", \"hair\": \"black\"}, \"companion\": {\"name\": \"Biscuit\", \"type\": \"dog\"}, \"illustration_style\": \"watercolor\"}\n```")
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        store: Arc<MemoryJobStore>,
        story_calls: Arc<Mutex<usize>>,
        visual_calls: Arc<Mutex<usize>>,
        images: Arc<Mutex<Vec<String>>>,
        sessions: Arc<Mutex<usize>>,
        delivered: Arc<Mutex<Vec<(String, BTreeMap<String, String>)>>>,
        stories: Arc<Mutex<Vec<Value>>>,
    }

    fn harness(story: MockAssistant, visual: MockAssistant, prompts: Value, notifier: MockNotifier) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let image_api = MockImages::default();
        let harness_parts = (
            story.call_count.clone(),
            visual.call_count.clone(),
            image_api.submissions.clone(),
            image_api.sessions.clone(),
            notifier.delivered.clone(),
            notifier.stories.clone(),
        );

        let clients = StageClients {
            story: Arc::new(story),
            visual: Arc::new(visual),
            hero_prompt: Arc::new(MockAssistant::replying(
                TaskKind::PromptSynthesis,
                json!("{\"prompt\": \"hero portrait\"}"),
            )),
            page_prompts: Arc::new(MockAssistant::replying(TaskKind::PromptSynthesis, prompts)),
            images: Arc::new(image_api),
        };
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            clients,
            Arc::new(notifier),
            settings(),
        ));

        Harness {
            coordinator,
            store,
            story_calls: harness_parts.0,
            visual_calls: harness_parts.1,
            images: harness_parts.2,
            sessions: harness_parts.3,
            delivered: harness_parts.4,
            stories: harness_parts.5,
        }
    }

    fn request(id: &str) -> Value {
        json!({
            "tripettoId": id,
            "userid": "user-1",
            "So, who is the brave hero of our story? Could you share the name?": "Mia",
            "Heroes often have companions. \nWho will share ___s adventures in the story?": "Dog"
        })
    }

    fn story_backend() -> MockAssistant {
        MockAssistant::replying(TaskKind::Text, json!("book_data = {\"title\": \"Mia and Biscuit\"}"))
    }

    #[tokio::test]
    async fn test_full_pipeline_orders_pages() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!("{\"prompt_img_00\": \"A slow\", \"prompt_img_07\": \"B\", \"prompt_img_03\": \"C\", \"note\": \"x\"}"),
            MockNotifier::default(),
        );

        let accepted = h.coordinator.accept_job(&request("t-1")).await?;
        assert_eq!(accepted.correlation_id, "t-1");
        assert_eq!(accepted.story, json!({"title": "Mia and Biscuit"}));
        assert_eq!(accepted.story_configuration.child_name, "Mia");
        accepted.worker.await?;

        let job = h.coordinator.get_job("t-1").await?;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stage, PipelineStage::Notified);
        assert_eq!(job.story(), Some(&json!({"title": "Mia and Biscuit"})));
        let (_, submitted) = parse_request(&request("t-1"))?;
        assert_eq!(job.input_config, submitted);
        assert_eq!(job.input_config.story_configuration.companion_type, "Dog");

        let urls = job.image_urls();
        assert_eq!(urls["page_01"], "https://cdn/A_slow.png");
        assert_eq!(urls["page_02"], "https://cdn/C.png");
        assert_eq!(urls["page_03"], "https://cdn/B.png");

        let visual = &job.stage_outputs["visual_description"];
        assert_eq!(visual["characters"][0]["name"], "Mia");
        assert_eq!(visual["illustration_style"], "watercolor");

        let delivered = h.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "t-1");
        assert_eq!(delivered[0].1, urls);

        let stories = h.stories.lock().unwrap();
        assert_eq!(stories[0]["tripettoId"], "t-1");
        assert_eq!(stories[0]["story_configuration"]["child_name"], "Mia");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_slot_keeps_siblings() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"image_prompts": [{"prompt_img_01": "first"}, {"prompt_img_02": "second fail"}, {"prompt_img_03": "third"}]}),
            MockNotifier::default(),
        );

        let accepted = h.coordinator.accept_job(&request("t-2")).await?;
        accepted.worker.await?;

        let job = h.coordinator.get_job("t-2").await?;
        assert_eq!(job.status, JobStatus::PartialFailure);
        let urls = job.image_urls();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls["page_01"], "https://cdn/first.png");
        assert_eq!(urls["page_03"], "https://cdn/third.png");
        assert!(!urls.contains_key("page_02"));

        let results = &job.stage_outputs["images"]["results"];
        assert_eq!(results[1]["slot_id"], "prompt_img_02");
        assert!(results[1]["uri"].is_null());

        let attempts = h
            .images
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == "second fail")
            .count();
        assert_eq!(attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_one_session_per_batch() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a", "prompt_img_01": "b", "prompt_img_02": "c", "prompt_img_03": "d"}),
            MockNotifier::default(),
        );

        let accepted = h.coordinator.accept_job(&request("t-3")).await?;
        accepted.worker.await?;

        // hero image batch + page batch
        assert_eq!(*h.sessions.lock().unwrap(), 2);
        assert_eq!(h.images.lock().unwrap().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a"}),
            MockNotifier::default(),
        );

        let accepted = h.coordinator.accept_job(&request("dup")).await?;
        accepted.worker.await?;

        let second = h.coordinator.accept_job(&request("dup")).await;
        assert!(matches!(second, Err(PipelineError::DuplicateId(_))));
        assert_eq!(*h.story_calls.lock().unwrap(), 1);

        let job = h.coordinator.get_job("dup").await?;
        assert_eq!(job.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_id_is_validation_error() {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({}),
            MockNotifier::default(),
        );

        let result = h.coordinator.accept_job(&json!({"userid": "u"})).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
        assert_eq!(*h.story_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_story_failure_stops_pipeline() -> anyhow::Result<()> {
        let h = harness(
            MockAssistant::failing(TaskKind::Text),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a"}),
            MockNotifier::default(),
        );

        let result = h.coordinator.accept_job(&request("t-4")).await;
        match result {
            Err(PipelineError::StageFailed { stage, .. }) => assert_eq!(stage, PipelineStage::StoryGenerated),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("story failure must not be accepted"),
        }

        let job = h.coordinator.get_job("t-4").await?;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, PipelineStage::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("connection refused"));

        assert_eq!(*h.visual_calls.lock().unwrap(), 0);
        assert!(h.images.lock().unwrap().is_empty());
        assert!(h.delivered.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_visual_failure_degrades() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::failing(TaskKind::VisualDescription),
            json!({"prompt_img_00": "a"}),
            MockNotifier::default(),
        );

        let accepted = h.coordinator.accept_job(&request("t-5")).await?;
        accepted.worker.await?;

        let job = h.coordinator.get_job("t-5").await?;
        assert_eq!(job.status, JobStatus::PartialFailure);
        assert_eq!(job.stage, PipelineStage::Notified);
        assert_eq!(job.image_urls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_notify_failure_marks_failed() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a"}),
            MockNotifier {
                should_fail: true,
                ..Default::default()
            },
        );

        let accepted = h.coordinator.accept_job(&request("t-6")).await?;
        accepted.worker.await?;

        let job = h.coordinator.get_job("t-6").await?;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, PipelineStage::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("notified"));
        // Story and images stay available.
        assert!(job.story().is_some());
        assert_eq!(job.image_urls().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_in_background_is_contained() -> anyhow::Result<()> {
        let mut visual = MockAssistant::replying(TaskKind::VisualDescription, visual_reply());
        visual.panic_on_fetch = true;
        let h = harness(story_backend(), visual, json!({"prompt_img_00": "a"}), MockNotifier::default());

        let accepted = h.coordinator.accept_job(&request("t-7")).await?;
        accepted.worker.await?;

        let job = h.store.get("t-7").await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap_or_default().contains("panicked"));
        assert!(h.delivered.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_in_story_stage_is_contained() -> anyhow::Result<()> {
        let mut story = story_backend();
        story.panic_on_fetch = true;
        let h = harness(
            story,
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a"}),
            MockNotifier::default(),
        );

        let result = h.coordinator.accept_job(&request("t-8")).await;
        match result {
            Err(PipelineError::StageFailed { stage, message }) => {
                assert_eq!(stage, PipelineStage::StoryGenerated);
                assert!(message.contains("panicked"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("a panicking story stage must not be accepted"),
        }

        let job = h.coordinator.get_job("t-8").await?;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.stage, PipelineStage::Failed);
        assert_eq!(*h.visual_calls.lock().unwrap(), 0);
        assert!(h.images.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_story_callback_does_not_block_caller() -> anyhow::Result<()> {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({"prompt_img_00": "a"}),
            MockNotifier {
                story_delay: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );

        let started = std::time::Instant::now();
        let accepted = h.coordinator.accept_job(&request("t-9")).await?;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(accepted.story, json!({"title": "Mia and Biscuit"}));

        accepted.worker.await?;
        let job = h.coordinator.get_job("t-9").await?;
        // A failed story callback is logged, not fatal.
        assert_eq!(job.status, JobStatus::Completed);
        assert!(h.stories.lock().unwrap().is_empty());
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let h = harness(
            story_backend(),
            MockAssistant::replying(TaskKind::VisualDescription, visual_reply()),
            json!({}),
            MockNotifier::default(),
        );
        assert!(matches!(
            h.coordinator.get_job("nope").await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
