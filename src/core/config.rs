use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use url::Url;

use crate::core::store::StoreConfig;
use crate::services::assistant::AssistantConfig;
use crate::services::imagine::ImageConfig;
use crate::services::notifier::NotifierConfig;
use crate::services::pipeline::PipelineConfig;

pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";
pub const IMAGE_KEY_ENV: &str = "MID_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml_ng::from_str(content)?;
        config.resolve_credentials(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Fills empty API keys from the environment.
    pub fn resolve_credentials(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.assistant.api_key.is_empty() {
            self.assistant.api_key = lookup(OPENAI_KEY_ENV).unwrap_or_default();
        }
        if self.image.api_key.is_empty() {
            self.image.api_key = lookup(IMAGE_KEY_ENV).unwrap_or_default();
        }
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.assistant.base_url).context("assistant.base_url is not a valid URL")?;
        Url::parse(&self.image.base_url).context("image.base_url is not a valid URL")?;
        Url::parse(&self.notifier.image_callback_url)
            .context("notifier.image_callback_url is not a valid URL")?;
        if let Some(url) = &self.notifier.story_callback_url {
            Url::parse(url).context("notifier.story_callback_url is not a valid URL")?;
        }

        if self.assistant.api_key.is_empty() {
            bail!("assistant.api_key is empty and {} is not set", OPENAI_KEY_ENV);
        }
        if self.image.api_key.is_empty() {
            bail!("image.api_key is empty and {} is not set", IMAGE_KEY_ENV);
        }
        for (name, id) in [
            ("story", &self.assistant.story),
            ("visual", &self.assistant.visual),
            ("hero_prompt", &self.assistant.hero_prompt),
            ("page_prompts", &self.assistant.page_prompts),
        ] {
            if id.is_empty() {
                bail!("assistant.{} assistant id is missing", name);
            }
        }

        if self.pipeline.image_attempts == 0 {
            bail!("pipeline.image_attempts must be at least 1");
        }
        if self.pipeline.max_concurrency == Some(0) {
            bail!("pipeline.max_concurrency must be at least 1");
        }
        if self.notifier.attempts == 0 {
            bail!("notifier.attempts must be at least 1");
        }
        Ok(())
    }
}
