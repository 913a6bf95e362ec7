//! Import API handlers (`crm.import.*`)
//!
//! Every subject runs the same request/reply loop: decode the envelope, pass the
//! elevated-role gate, call the pipeline and reply with its result or error code.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use base64::Engine;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::{require_elevated_role, AuthInfo};
use crate::error::{ImportError, ImportResult};
use crate::services::pipeline::ImportPipeline;
use crate::services::progress::progress_subject;
use crate::types::{
    CreateImportJobRequest, EnqueueCommitRequest, ErrorResponse, GetRowsRequest, JobIdPayload, Request,
    RetryRequest, SaveUiStateRequest, SetColumnMappingRequest, SetOptionsRequest, SubscribeProgressResponse,
    SuccessResponse,
};

/// Shared by every import subject loop
#[derive(Clone)]
pub struct ImportHandlerState {
    pub pipeline: Arc<ImportPipeline>,
    pub jwt_secret: Arc<String>,
}

async fn serve<P, R, F, Fut>(
    client: Client,
    mut subscriber: Subscriber,
    state: ImportHandlerState,
    operation: &'static str,
    handle: F,
) -> Result<()>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(Arc<ImportPipeline>, AuthInfo, P) -> Fut,
    Fut: Future<Output = ImportResult<R>>,
{
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => {
                warn!("{} request without reply subject", operation);
                continue;
            }
        };

        let request: Request<P> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse {} request: {}", operation, e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let request_id = request.id;
        let result = match require_elevated_role(&request, &state.jwt_secret) {
            Ok(auth) => handle(Arc::clone(&state.pipeline), auth, request.payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                let success = SuccessResponse::new(request_id, response);
                let _ = client.publish(reply, serde_json::to_vec(&success)?.into()).await;
            }
            Err(e) => {
                match &e {
                    ImportError::Internal(inner) => error!("{} failed: {:#}", operation, inner),
                    other => debug!("{} rejected: {}", operation, other),
                }
                let error = e.to_response(request_id);
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
            }
        }
    }

    Ok(())
}

/// Handle crm.import.create
pub async fn handle_create(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "createImportJob",
        |pipeline, auth, payload: CreateImportJobRequest| async move {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload.file_base64.as_bytes())
                .map_err(|e| ImportError::UnsupportedFile(format!("file payload is not valid base64: {}", e)))?;
            pipeline
                .create_import_job(&auth, &payload.file_name, payload.content_type.as_deref(), bytes)
                .await
        },
    )
    .await
}

/// Handle crm.import.mapping.set
pub async fn handle_set_mapping(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "setColumnMapping",
        |pipeline, auth, payload: SetColumnMappingRequest| async move {
            pipeline.set_column_mapping(&auth, payload.job_id, payload.mapping).await
        },
    )
    .await
}

/// Handle crm.import.options.set
pub async fn handle_set_options(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "setOptions",
        |pipeline, auth, payload: SetOptionsRequest| async move {
            pipeline
                .set_options(&auth, payload.job_id, payload.assignment, payload.duplicates)
                .await
        },
    )
    .await
}

/// Handle crm.import.parse
pub async fn handle_enqueue_parse(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "enqueueParse",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.enqueue_parse(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.commit
pub async fn handle_enqueue_commit(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "enqueueCommit",
        |pipeline, auth, payload: EnqueueCommitRequest| async move {
            pipeline.enqueue_commit(&auth, payload.job_id, payload.options).await
        },
    )
    .await
}

/// Handle crm.import.cancel
pub async fn handle_cancel(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "cancel",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.cancel(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.retry
pub async fn handle_retry(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "retry",
        |pipeline, auth, payload: RetryRequest| async move {
            pipeline.retry(&auth, payload.job_id, payload.phase).await
        },
    )
    .await
}

/// Handle crm.import.status
pub async fn handle_poll_status(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "pollStatus",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.poll_status(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.subscribe
///
/// Replies with the latest snapshot; later ones follow on the job's progress subject.
pub async fn handle_subscribe(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "subscribeProgress",
        |pipeline, auth, payload: JobIdPayload| async move {
            let mut stream = pipeline.subscribe_progress(&auth, payload.job_id).await?;
            let snapshot = stream
                .next()
                .await
                .ok_or_else(|| anyhow::anyhow!("Progress stream of job {} closed early", payload.job_id))?;
            let subject = (!snapshot.status.is_terminal()).then(|| progress_subject(payload.job_id));
            Ok::<_, ImportError>(SubscribeProgressResponse { snapshot, subject })
        },
    )
    .await
}

/// Handle crm.import.rows
pub async fn handle_get_rows(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "getRows",
        |pipeline, auth, payload: GetRowsRequest| async move {
            pipeline
                .get_rows(&auth, payload.job_id, payload.status, payload.page.clamped())
                .await
        },
    )
    .await
}

/// Handle crm.import.job
pub async fn handle_get_job(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "getJob",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.get_job(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.preview
pub async fn handle_preview(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "preview",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.preview(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.ui_state.save
pub async fn handle_save_ui_state(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "saveUiState",
        |pipeline, auth, payload: SaveUiStateRequest| async move {
            pipeline.save_ui_state(&auth, payload.job_id, payload.ui_state).await
        },
    )
    .await
}

/// Handle crm.import.delete
pub async fn handle_delete(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "deleteJob",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.delete_job(&auth, payload.job_id).await },
    )
    .await
}

/// Handle crm.import.file_url
pub async fn handle_file_url(client: Client, subscriber: Subscriber, state: ImportHandlerState) -> Result<()> {
    serve(
        client,
        subscriber,
        state,
        "getFileUrl",
        |pipeline, auth, payload: JobIdPayload| async move { pipeline.get_file_url(&auth, payload.job_id).await },
    )
    .await
}
