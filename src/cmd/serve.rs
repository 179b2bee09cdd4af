//! `shipwright serve`: API, queue consumer and stuck-job sweep in one process.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use shipwright::config::ShipwrightConfig;
use shipwright::llm::AnthropicClient;
use shipwright::pipeline::prompts::PromptLibrary;
use shipwright::pipeline::{Collaborators, StepDispatcher, StuckJobSweep, Transitions};
use shipwright::queue::{LocalQueue, StepHandler};
use shipwright::server::{self, AppState};
use shipwright::store::{FsArtifactStore, SqliteStore};

pub async fn cmd_serve(config: &ShipwrightConfig) -> Result<()> {
    config.validate()?;

    let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
    let artifacts = Arc::new(FsArtifactStore::new(&config.storage.artifact_dir));
    let provider = Arc::new(AnthropicClient::new(
        &config.provider.base_url,
        &config.provider.api_version,
        config.retry_policy(),
    )?);
    let (queue, consumer) = LocalQueue::new(config.queue_settings());

    let collaborators = Collaborators {
        jobs: store.clone(),
        secrets: store.clone(),
        artifacts: artifacts.clone(),
        audit: store.clone(),
        queue: Arc::new(queue),
        provider,
    };
    let prompts = match &config.prompts.dir {
        Some(dir) => PromptLibrary::load(dir)?,
        None => PromptLibrary::builtin(),
    };
    let dispatcher: Arc<dyn StepHandler> = Arc::new(StepDispatcher::new(
        &collaborators,
        Arc::new(prompts),
        config.stage_table(),
        config.provider.secret_name.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer_task = tokio::spawn(consumer.run(dispatcher, stopped(shutdown_rx.clone())));

    let sweep = StuckJobSweep::new(store.clone(), config.stale_after());
    let interval = config.sweep_interval();
    let sweep_rx = shutdown_rx.clone();
    let sweep_task = tokio::spawn(async move { sweep.run(interval, stopped(sweep_rx)).await });

    let state = AppState {
        transitions: Transitions::new(&collaborators),
        secrets: store.clone(),
        artifacts,
    };
    let server_shutdown = async move {
        ctrl_c().await;
        let _ = shutdown_tx.send(true);
    };
    // If the server fails, dropping the sender still stops the other tasks.
    let served = server::serve(state, &config.bind_address(), server_shutdown).await;

    if let Err(err) = consumer_task.await {
        warn!(error = %err, "queue consumer task panicked");
    }
    if let Err(err) = sweep_task.await {
        warn!(error = %err, "sweep task panicked");
    }
    info!("shipwright stopped");
    served
}

/// Resolves once the shutdown flag is set or its sender is gone.
fn stopped(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
