//! `chatgate serve` - wire the gateway together and run it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use chatgate::api::{start_server, AppState};
use chatgate::cache::ExpiringValue;
use chatgate::config::Config;
use chatgate::logging::init_logging;
use chatgate::orchestrator::Orchestrator;
use chatgate::prompt::{SystemPromptWatcher, DEFAULT_SYSTEM_PROMPT};
use chatgate::providers::{GeminiBackend, GenerationOptions};

pub(crate) async fn cmd_serve(
    config_path: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut config =
        Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    init_logging(&config.logging);

    let backend = GeminiBackend::from_config(
        config.backend.api_key.as_deref(),
        &config.backend.model,
        &config.backend.api_base,
        GenerationOptions {
            temperature: config.backend.temperature,
            max_output_tokens: config.backend.max_output_tokens,
        },
    )?;
    let context = chatgate::context::from_config(&config.context)
        .context("Failed to set up user context source")?;

    let prompt_cache = Arc::new(ExpiringValue::new(config.prompt.ttl()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match &config.prompt.file {
        Some(path) => {
            let watcher = SystemPromptWatcher::new(
                path.clone(),
                Duration::from_secs(config.prompt.watch_interval_secs),
            );
            watcher
                .load_into(&prompt_cache)
                .with_context(|| format!("Failed to load system prompt from {}", path.display()))?;
            tokio::spawn(watcher.watch(Arc::clone(&prompt_cache), shutdown_rx));
        }
        None => prompt_cache.set_default_ttl(DEFAULT_SYSTEM_PROMPT.trim().to_string()),
    }

    info!(
        model = %config.backend.model,
        context = context.name(),
        prompt_ttl_secs = config.prompt.ttl_secs,
        "Starting chat gateway"
    );

    let orchestrator = Orchestrator::new(Arc::new(backend), prompt_cache)
        .with_context(context)
        .with_limits(config.backend.session_limits());

    start_server(&config.server, AppState::new(orchestrator), async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    Ok(())
}
