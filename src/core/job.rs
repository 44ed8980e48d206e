use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    PartialFailure,
    Completed,
    Failed,
}

/// Position of a job in the generation pipeline.
///
/// Stages advance strictly in declaration order; `Failed` can be entered
/// from any non-terminal stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    StoryGenerated,
    VisualDescribed,
    ChildImageReady,
    PromptsSynthesized,
    ImagesGenerated,
    Notified,
    Failed,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::StoryGenerated => "story_generated",
            Self::VisualDescribed => "visual_described",
            Self::ChildImageReady => "child_image_ready",
            Self::PromptsSynthesized => "prompts_synthesized",
            Self::ImagesGenerated => "images_generated",
            Self::Notified => "notified",
            Self::Failed => "failed",
        }
    }

    /// Key under which the stage's result is kept in `Job::stage_outputs`.
    pub fn output_key(&self) -> Option<&'static str> {
        match self {
            Self::StoryGenerated => Some("story"),
            Self::VisualDescribed => Some("visual_description"),
            Self::ChildImageReady => Some("hero_image"),
            Self::PromptsSynthesized => Some("image_prompts"),
            Self::ImagesGenerated => Some("images"),
            Self::Notified => Some("notification"),
            Self::Received | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Notified | Self::Failed)
    }

    pub fn can_advance_to(&self, next: PipelineStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next > *self
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub user_id: String,
    pub date: String,
    #[serde(rename = "tripettoId")]
    pub correlation_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoryConfiguration {
    pub child_name: String,
    pub child_age: String,
    pub child_gender: String,
    pub companion_name: String,
    pub companion_type: String,
    pub companion_gender: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChildAppearance {
    pub child_name: String,
    pub child_gender: String,
    pub child_age: u32,
    pub child_ethnic: String,
    pub child_skin_tone: String,
    pub child_hair_color: String,
    pub child_hair_length: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompanionAppearance {
    pub companion_name: String,
    pub companion_gender: String,
    pub companion_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VisualConfiguration {
    pub child: ChildAppearance,
    pub companion: CompanionAppearance,
}

/// The normalized triple a job is created from. Never mutated after creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoryRequest {
    pub order: Order,
    pub story_configuration: StoryConfiguration,
    pub visual_configuration: VisualConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub input_config: StoryRequest,
    #[serde(default)]
    pub stage_outputs: BTreeMap<String, Value>,
    pub status: JobStatus,
    pub stage: PipelineStage,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: &str, input_config: StoryRequest) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            input_config,
            stage_outputs: BTreeMap::new(),
            status: JobStatus::Pending,
            stage: PipelineStage::Received,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stores a stage result and advances to that stage. Out-of-order
    /// transitions keep the output but leave the stage untouched.
    pub fn record(&mut self, stage: PipelineStage, output: Value) -> bool {
        if let Some(key) = stage.output_key() {
            self.stage_outputs.insert(key.to_string(), output);
        }
        self.updated_at = Utc::now();

        if self.stage.can_advance_to(stage) {
            self.stage = stage;
            true
        } else {
            false
        }
    }

    pub fn set_status(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        if status == JobStatus::Failed && !self.stage.is_terminal() {
            self.stage = PipelineStage::Failed;
        }
        if error.is_some() {
            self.error = error;
        }
        self.updated_at = Utc::now();
    }

    pub fn story(&self) -> Option<&Value> {
        self.stage_outputs.get("story")
    }

    /// Delivered page → uri map, empty until images were generated.
    pub fn image_urls(&self) -> BTreeMap<String, String> {
        self.stage_outputs
            .get("images")
            .and_then(|v| v.get("image_urls"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}
