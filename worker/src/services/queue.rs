//! Work queue for import phases
//!
//! Uses a NATS JetStream work-queue stream with a durable pull consumer, explicit
//! acknowledgements and bounded redelivery. Delivery is at-least-once; the workers
//! are idempotent per checkpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::types::ImportPhase;

const STREAM_NAME: &str = "CRM_IMPORT_JOBS";
const CONSUMER_NAME: &str = "import_workers";
const SUBJECT_PREFIX: &str = "crm.jobs.import";

/// Queue payload: run `phase` of `job_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMessage {
    pub job_id: Uuid,
    pub phase: ImportPhase,
    pub enqueued_at: DateTime<Utc>,
}

impl PhaseMessage {
    pub fn new(job_id: Uuid, phase: ImportPhase) -> Self {
        Self {
            job_id,
            phase,
            enqueued_at: Utc::now(),
        }
    }

    pub fn subject(&self) -> String {
        format!("{}.{}", SUBJECT_PREFIX, self.phase.as_str())
    }
}

#[async_trait]
pub trait PhaseQueue: Send + Sync {
    async fn enqueue(&self, message: &PhaseMessage) -> Result<()>;
}

/// Executes one delivered phase message
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn run_phase(&self, message: PhaseMessage) -> Result<()>;
}

pub struct JetStreamQueue {
    js: JsContext,
}

impl JetStreamQueue {
    /// Connect the queue and make sure the stream exists
    pub async fn new(client: Client) -> Result<Self> {
        let js = jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: vec![format!("{}.*", SUBJECT_PREFIX)],
            max_messages: 100_000,
            max_bytes: 64 * 1024 * 1024,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        js.get_or_create_stream(stream_config).await?;
        info!("JetStream stream '{}' ready", STREAM_NAME);

        Ok(Self { js })
    }

    /// Pull phase messages and hand each to `runner` in its own task
    pub async fn consume(&self, runner: Arc<dyn PhaseRunner>) -> Result<()> {
        let stream = self.js.get_stream(STREAM_NAME).await?;

        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(CONSUMER_NAME.to_string()),
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(600),
            max_deliver: 3,
            filter_subject: format!("{}.*", SUBJECT_PREFIX),
            ..Default::default()
        };

        let consumer = stream.get_or_create_consumer(CONSUMER_NAME, consumer_config).await?;
        info!("JetStream consumer '{}' ready", CONSUMER_NAME);

        let mut messages = consumer.messages().await?;

        while let Some(msg) = messages.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    error!("Error receiving import phase message: {}", e);
                    continue;
                }
            };

            let message: PhaseMessage = match serde_json::from_slice(&msg.payload) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Dropping malformed import phase message: {}", e);
                    let _ = msg.ack().await;
                    continue;
                }
            };

            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let job_id = message.job_id;
                let phase = message.phase;
                match runner.run_phase(message).await {
                    Ok(()) => {
                        if let Err(e) = msg.ack().await {
                            error!("Failed to ack {} phase of job {}: {:?}", phase.as_str(), job_id, e);
                        }
                    }
                    Err(e) => {
                        error!("{} phase of job {} failed before completion: {}", phase.as_str(), job_id, e);
                        let _ = msg.ack_with(jetstream::AckKind::Nak(None)).await;
                    }
                }
            });
        }

        Ok(())
    }
}

#[async_trait]
impl PhaseQueue for JetStreamQueue {
    async fn enqueue(&self, message: &PhaseMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.js.publish(message.subject(), payload.into()).await?.await?;
        debug!("Enqueued {} phase of job {}", message.phase.as_str(), message.job_id);
        Ok(())
    }
}

// =============================================================================
// In-memory (tests)
// =============================================================================

#[cfg(test)]
pub mod memory {
    use parking_lot::Mutex;

    use super::*;

    /// Records enqueued messages; tests deliver them by hand
    #[derive(Default)]
    pub struct MemoryQueue {
        messages: Mutex<Vec<PhaseMessage>>,
    }

    impl MemoryQueue {
        pub fn take(&self) -> Vec<PhaseMessage> {
            std::mem::take(&mut *self.messages.lock())
        }
    }

    #[async_trait]
    impl PhaseQueue for MemoryQueue {
        async fn enqueue(&self, message: &PhaseMessage) -> Result<()> {
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_per_phase() {
        let id = Uuid::nil();
        assert_eq!(PhaseMessage::new(id, ImportPhase::Parse).subject(), "crm.jobs.import.parse");
        assert_eq!(PhaseMessage::new(id, ImportPhase::Commit).subject(), "crm.jobs.import.commit");
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let json = serde_json::to_string(&PhaseMessage::new(Uuid::nil(), ImportPhase::Commit)).unwrap();
        assert!(json.contains("\"jobId\""));
        assert!(json.contains("\"phase\":\"commit\""));
        assert!(json.contains("enqueuedAt"));
    }
}
