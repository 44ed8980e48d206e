use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotifierConfig {
    #[serde(default)]
    pub image_callback_url: String,
    #[serde(default)]
    pub story_callback_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            image_callback_url: String::new(),
            story_callback_url: None,
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_attempts() -> usize {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

/// Downstream sink for finished artifacts. Delivery retries are the
/// notifier's concern; an `Err` means delivery never succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, correlation_id: &str, image_urls: &BTreeMap<String, String>) -> Result<()>;

    /// Pushes the freshly generated story out-of-band. Optional.
    async fn publish_story(&self, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

pub fn image_payload(correlation_id: &str, image_urls: &BTreeMap<String, String>) -> Value {
    json!({
        "image_urls": image_urls,
        "tripettoId": correlation_id,
    })
}

pub struct WebhookNotifier {
    config: NotifierConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    async fn post_once(&self, url: &str, payload: &Value) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to post to {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Webhook {} returned {}: {}", url, status, error_text));
        }
        Ok(())
    }

    async fn post_with_retry(&self, url: &str, payload: &Value) -> Result<()> {
        let max_retries = self.config.attempts.max(1);
        let mut last_error = anyhow!("Unknown error");

        for attempt in 0..max_retries {
            if attempt > 0 {
                warn!("Webhook delivery failed (attempt {}/{}), retrying...", attempt + 1, max_retries);
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }

            match self.post_once(url, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Webhook delivery error: {:#}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error.context(format!("Webhook delivery to {} failed after retries", url)))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, correlation_id: &str, image_urls: &BTreeMap<String, String>) -> Result<()> {
        if self.config.image_callback_url.is_empty() {
            return Err(anyhow!("No image callback URL configured"));
        }
        self.post_with_retry(&self.config.image_callback_url, &image_payload(correlation_id, image_urls))
            .await?;
        info!("Delivered {} image(s) for {}", image_urls.len(), correlation_id);
        Ok(())
    }

    async fn publish_story(&self, payload: &Value) -> Result<()> {
        match self.config.story_callback_url.as_deref() {
            Some(url) if !url.is_empty() => self.post_with_retry(url, payload).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_payload_shape() {
        let mut urls = BTreeMap::new();
        urls.insert("page_02".to_string(), "https://cdn/b.png".to_string());
        urls.insert("page_01".to_string(), "https://cdn/a.png".to_string());

        let payload = image_payload("t-1", &urls);
        assert_eq!(payload["tripettoId"], "t-1");
        assert_eq!(payload["image_urls"]["page_01"], "https://cdn/a.png");
        let keys: Vec<_> = payload["image_urls"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["page_01", "page_02"]);
    }

    #[test]
    fn test_config_defaults() {
        let config: NotifierConfig =
            serde_yaml_ng::from_str("image_callback_url: https://hooks.example/images").unwrap();
        assert_eq!(config.attempts, 3);
        assert_eq!(config.timeout_secs, 60);
        assert!(config.story_callback_url.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_story_callback_is_noop() {
        let notifier = WebhookNotifier::new(&NotifierConfig::default()).unwrap();
        assert!(notifier.publish_story(&json!({"story": "x"})).await.is_ok());
        assert!(notifier.notify("t-1", &BTreeMap::new()).await.is_err());
    }
}
