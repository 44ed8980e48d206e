use anyhow::Result;
use log::info;
use std::sync::Arc;

use story2picturebook::core::config::Config;
use story2picturebook::core::store::open_store;
use story2picturebook::server;
use story2picturebook::services::notifier::WebhookNotifier;
use story2picturebook::services::pipeline::{Coordinator, PipelineSettings, StageClients};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with assistant ids and callback URLs.");
            return Err(e);
        }
    };
    config.validate()?;

    let store = open_store(&config.store).await?;
    let clients = StageClients::from_config(&config.assistant, &config.image);
    let notifier = Arc::new(WebhookNotifier::new(&config.notifier)?);
    let settings = PipelineSettings::from_config(&config.pipeline, &config.assistant, &config.image);

    let coordinator = Arc::new(Coordinator::new(store, clients, notifier, settings));
    match settings.max_concurrency {
        Some(cap) => info!(
            "Pipeline ready: {} image attempt(s), up to {} concurrent image(s)",
            settings.retry.attempts, cap
        ),
        None => info!(
            "Pipeline ready: {} image attempt(s), all image slots in parallel",
            settings.retry.attempts
        ),
    }

    server::serve(&config.server.bind, coordinator).await
}
