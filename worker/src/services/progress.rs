//! Progress channel
//!
//! One watch channel per watched job holds the latest snapshot, so a subscriber that
//! connects late (or reconnects) sees only the most recent state. Channels exist only
//! while someone listens: a subscriber seeds one from the stored job, and a channel
//! nobody receives from is dropped. A terminal snapshot drops the channel too, which
//! ends every subscriber stream after that final value. Snapshots are mirrored on
//! NATS under `crm.import.progress.<job_id>`.

use std::collections::HashMap;

use async_nats::Client;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::warn;
use uuid::Uuid;

use crate::types::ProgressSnapshot;

pub const SUBJECT_PROGRESS_PREFIX: &str = "crm.import.progress";

/// Bus subject carrying the snapshots of one job
pub fn progress_subject(job_id: Uuid) -> String {
    format!("{}.{}", SUBJECT_PROGRESS_PREFIX, job_id)
}

pub struct ProgressHub {
    channels: Mutex<HashMap<Uuid, watch::Sender<ProgressSnapshot>>>,
    client: Option<Client>,
}

impl ProgressHub {
    pub fn new(client: Option<Client>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            client,
        }
    }

    /// Push a snapshot to local subscribers and to the bus
    pub async fn publish(&self, snapshot: ProgressSnapshot) {
        {
            let mut channels = self.channels.lock();
            let listening = channels.get(&snapshot.job_id).map(|s| s.receiver_count() > 0);
            match listening {
                Some(true) if !snapshot.status.is_terminal() => {
                    if let Some(sender) = channels.get(&snapshot.job_id) {
                        sender.send_replace(snapshot.clone());
                    }
                }
                Some(_) => {
                    if let Some(sender) = channels.remove(&snapshot.job_id) {
                        sender.send_replace(snapshot.clone());
                    }
                }
                None => {}
            }
        }

        let Some(client) = &self.client else {
            return;
        };
        let subject = progress_subject(snapshot.job_id);
        match serde_json::to_vec(&snapshot) {
            Ok(payload) => {
                if let Err(e) = client.publish(subject, payload.into()).await {
                    warn!("Failed to publish progress for job {}: {}", snapshot.job_id, e);
                }
            }
            Err(e) => warn!("Failed to serialize progress for job {}: {}", snapshot.job_id, e),
        }
    }

    /// Stream of snapshots starting with the latest one.
    /// `current` seeds the channel when nobody is watching the job yet.
    pub fn subscribe(&self, current: ProgressSnapshot) -> BoxStream<'static, ProgressSnapshot> {
        if current.status.is_terminal() {
            return stream::once(async move { current }).boxed();
        }

        let mut channels = self.channels.lock();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = match channels.get(&current.job_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let job_id = current.job_id;
                let (sender, receiver) = watch::channel(current);
                channels.insert(job_id, sender);
                receiver
            }
        };

        WatchStream::new(receiver).boxed()
    }

    #[cfg(test)]
    pub fn is_open(&self, job_id: &Uuid) -> bool {
        self.channels.lock().contains_key(job_id)
    }

    #[cfg(test)]
    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImportJobStatus, ImportPhase, JobCounters, JobCursor};
    use chrono::Utc;

    fn snapshot(job_id: Uuid, status: ImportJobStatus, position: i64) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id,
            status,
            phase: Some(ImportPhase::Parse),
            counters: JobCounters::default(),
            cursor: JobCursor::new(position, 10),
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest_only() {
        let hub = ProgressHub::new(None);
        let job = Uuid::new_v4();
        let _watcher = hub.subscribe(snapshot(job, ImportJobStatus::Queued, 0));
        hub.publish(snapshot(job, ImportJobStatus::Parsing, 1)).await;
        hub.publish(snapshot(job, ImportJobStatus::Parsing, 2)).await;
        hub.publish(snapshot(job, ImportJobStatus::Parsing, 3)).await;

        let mut stream = hub.subscribe(snapshot(job, ImportJobStatus::Parsing, 0));
        let first = stream.next().await.unwrap();
        assert_eq!(first.cursor.position, 3);
    }

    #[tokio::test]
    async fn test_unwatched_jobs_hold_no_channel() {
        let hub = ProgressHub::new(None);
        let idle = Uuid::new_v4();
        hub.publish(snapshot(idle, ImportJobStatus::Pending, 0)).await;
        assert!(!hub.is_open(&idle));

        let abandoned = Uuid::new_v4();
        let stream = hub.subscribe(snapshot(abandoned, ImportJobStatus::Ready, 0));
        assert!(hub.is_open(&abandoned));
        drop(stream);

        hub.publish(snapshot(abandoned, ImportJobStatus::Validating, 0)).await;
        assert!(!hub.is_open(&abandoned));

        let other = Uuid::new_v4();
        let dropped = hub.subscribe(snapshot(other, ImportJobStatus::Ready, 0));
        drop(dropped);
        let _live = hub.subscribe(snapshot(Uuid::new_v4(), ImportJobStatus::Queued, 0));
        assert_eq!(hub.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_stream_closes_after_terminal_snapshot() {
        let hub = ProgressHub::new(None);
        let job = Uuid::new_v4();
        let mut stream = hub.subscribe(snapshot(job, ImportJobStatus::Queued, 0));
        assert_eq!(stream.next().await.unwrap().status, ImportJobStatus::Queued);

        hub.publish(snapshot(job, ImportJobStatus::Parsing, 1)).await;
        assert_eq!(stream.next().await.unwrap().cursor.position, 1);

        hub.publish(snapshot(job, ImportJobStatus::Cancelled, 1)).await;
        assert_eq!(stream.next().await.unwrap().status, ImportJobStatus::Cancelled);
        assert!(stream.next().await.is_none());
        assert!(!hub.is_open(&job));
    }

    #[tokio::test]
    async fn test_terminal_job_yields_single_snapshot() {
        let hub = ProgressHub::new(None);
        let job = Uuid::new_v4();
        let mut stream = hub.subscribe(snapshot(job, ImportJobStatus::Completed, 10));
        assert_eq!(stream.next().await.unwrap().status, ImportJobStatus::Completed);
        assert!(stream.next().await.is_none());
    }
}
