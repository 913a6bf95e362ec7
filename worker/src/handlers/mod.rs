//! NATS message handlers

pub mod import;

use std::sync::Arc;

use anyhow::Result;
use async_nats::Client;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::services::active_jobs::ActiveJobs;
use crate::services::object_storage::LocalObjectStorage;
use crate::services::pipeline::{ImportContext, ImportPipeline};
use crate::services::progress::ProgressHub;
use crate::services::queue::{JetStreamQueue, PhaseRunner};
use crate::services::store::PgImportStore;
use import::ImportHandlerState;

/// Start all message handlers and, unless `run_workers` is false, the phase workers.
/// Returns when any of them stops.
pub async fn start_handlers(client: Client, pool: PgPool, config: &Config, run_workers: bool) -> Result<()> {
    info!("Starting message handlers...");

    let store = Arc::new(PgImportStore::new(pool));
    let storage = Arc::new(LocalObjectStorage::new(
        config.storage_root.clone(),
        config.storage_signing_key.clone(),
    ));
    info!("Object storage rooted at {}", config.storage_root.display());

    let queue = Arc::new(JetStreamQueue::new(client.clone()).await?);

    let ctx = ImportContext {
        store: store.clone(),
        storage,
        directory: store,
        queue: queue.clone(),
        progress: Arc::new(ProgressHub::new(Some(client.clone()))),
        active_jobs: ActiveJobs::default(),
        settings: config.import.clone(),
    };
    let pipeline = Arc::new(ImportPipeline::new(ctx));
    let state = ImportHandlerState {
        pipeline: pipeline.clone(),
        jwt_secret: Arc::new(config.jwt_secret.clone()),
    };

    let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    macro_rules! spawn_handler {
        ($subject:literal, $handler:path) => {{
            let subscriber = client.subscribe($subject).await?;
            let handle = tokio::spawn($handler(client.clone(), subscriber, state.clone()));
            handles.push(($subject, handle));
        }};
    }

    spawn_handler!("crm.import.create", import::handle_create);
    spawn_handler!("crm.import.mapping.set", import::handle_set_mapping);
    spawn_handler!("crm.import.options.set", import::handle_set_options);
    spawn_handler!("crm.import.parse", import::handle_enqueue_parse);
    spawn_handler!("crm.import.commit", import::handle_enqueue_commit);
    spawn_handler!("crm.import.cancel", import::handle_cancel);
    spawn_handler!("crm.import.retry", import::handle_retry);
    spawn_handler!("crm.import.status", import::handle_poll_status);
    spawn_handler!("crm.import.subscribe", import::handle_subscribe);
    spawn_handler!("crm.import.rows", import::handle_get_rows);
    spawn_handler!("crm.import.job", import::handle_get_job);
    spawn_handler!("crm.import.preview", import::handle_preview);
    spawn_handler!("crm.import.ui_state.save", import::handle_save_ui_state);
    spawn_handler!("crm.import.delete", import::handle_delete);
    spawn_handler!("crm.import.file_url", import::handle_file_url);

    info!("Subscribed to {} import subjects", handles.len());

    if run_workers {
        let runner: Arc<dyn PhaseRunner> = pipeline;
        let handle = tokio::spawn(async move { queue.consume(runner).await });
        handles.push(("phase workers", handle));
        info!("Import phase workers started");
    } else {
        info!("Phase workers disabled; only serving requests");
    }

    let (names, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let (result, index, _) = futures::future::select_all(joins).await;
    error!("{} handler finished: {:?}", names[index], result);

    Ok(())
}
