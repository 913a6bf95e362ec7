//! Import job types: lifecycle status, counters, cursor, progress snapshots and
//! the request/response payloads of the import API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

use super::mapping::{ColumnMapping, MappingSummary};
use super::options::{AssignmentConfig, DuplicateConfig, ImportOptions};
use super::import_row::{ImportRow, RowFilter};
use super::messages::Page;

// ==========================================================================
// Tests First (TDD)
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ImportJobStatus::Importing).unwrap();
        assert_eq!(json, "\"importing\"");
    }

    #[test]
    fn test_terminal_states() {
        assert!(ImportJobStatus::Completed.is_terminal());
        assert!(ImportJobStatus::Failed.is_terminal());
        assert!(ImportJobStatus::Cancelled.is_terminal());
        assert!(!ImportJobStatus::Ready.is_terminal());
        assert!(!ImportJobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in ImportJobStatus::ALL {
            assert_eq!(ImportJobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = ProgressSnapshot {
            job_id: Uuid::nil(),
            status: ImportJobStatus::Parsing,
            phase: Some(ImportPhase::Parse),
            counters: JobCounters {
                total: 1000,
                valid: 480,
                invalid: 20,
                ..Default::default()
            },
            cursor: JobCursor {
                position: 1,
                total_estimate: 2,
                last_row_number: 0,
            },
            error: None,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("jobId"));
        assert!(json.contains("totalEstimate"));
        assert!(json.contains("\"phase\":\"parse\""));
        assert!(!json.contains("job_id"));
    }

    #[test]
    fn test_counters_processed_and_eligible() {
        let counters = JobCounters {
            total: 10,
            valid: 8,
            invalid: 2,
            file_duplicates: 1,
            ..Default::default()
        };
        assert_eq!(counters.parsed(), 10);
        assert_eq!(counters.finalized(), 2);
    }

    #[test]
    fn test_cursor_clamps_to_estimate() {
        let cursor = JobCursor::new(7, 5);
        assert_eq!(cursor.position, 5);
        assert_eq!(cursor.total_estimate, 5);
    }

    #[test]
    fn test_create_request_deserializes() {
        let json = r#"{"fileName":"contacts.csv","fileBase64":"YQ=="}"#;
        let req: CreateImportJobRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.file_name, "contacts.csv");
        assert!(req.content_type.is_none());
    }
}

// ==========================================================================
// Status & phases
// ==========================================================================

/// Lifecycle status of an import job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    Pending,
    Queued,
    Parsing,
    Validating,
    Ready,
    Importing,
    Completed,
    Failed,
    Cancelled,
}

impl ImportJobStatus {
    pub const ALL: [ImportJobStatus; 9] = [
        ImportJobStatus::Pending,
        ImportJobStatus::Queued,
        ImportJobStatus::Parsing,
        ImportJobStatus::Validating,
        ImportJobStatus::Ready,
        ImportJobStatus::Importing,
        ImportJobStatus::Completed,
        ImportJobStatus::Failed,
        ImportJobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "pending",
            ImportJobStatus::Queued => "queued",
            ImportJobStatus::Parsing => "parsing",
            ImportJobStatus::Validating => "validating",
            ImportJobStatus::Ready => "ready",
            ImportJobStatus::Importing => "importing",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::Failed => "failed",
            ImportJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<ImportJobStatus> {
        ImportJobStatus::ALL.iter().copied().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportJobStatus::Completed | ImportJobStatus::Failed | ImportJobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ImportJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two queued units of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_phase", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Parse,
    Commit,
}

impl ImportPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::Parse => "parse",
            ImportPhase::Commit => "commit",
        }
    }
}

/// Accepted upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_file_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Xlsx,
}

// ==========================================================================
// Job record
// ==========================================================================

/// Uploaded file descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub kind: FileKind,
    pub size_bytes: i64,
    pub storage_locator: String,
    /// Hex SHA-256 of the file bytes
    pub content_hash: String,
}

/// Running counters; each is monotonic within a phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub total: i64,
    pub valid: i64,
    pub invalid: i64,
    pub imported: i64,
    /// Subset of `imported` that merged into an existing contact
    pub updated: i64,
    pub skipped: i64,
    pub file_duplicates: i64,
    pub db_duplicates: i64,
}

impl JobCounters {
    /// Rows that went through validation so far
    pub fn parsed(&self) -> i64 {
        self.valid + self.invalid
    }

    /// Rows with a final outcome
    pub fn finalized(&self) -> i64 {
        self.imported + self.skipped + self.invalid
    }
}

/// Position within the active phase. `position` counts completed chunks (parse) or
/// batches (commit) and never exceeds `total_estimate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCursor {
    pub position: i64,
    pub total_estimate: i64,
    /// Highest row number already checkpointed by the phase
    pub last_row_number: i64,
}

impl JobCursor {
    pub fn new(position: i64, total_estimate: i64) -> Self {
        Self {
            position: position.min(total_estimate).max(0),
            total_estimate,
            last_row_number: 0,
        }
    }
}

/// Worker-level failure recorded on the job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub message: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Where the operator left the wizard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardState {
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub confirmations: BTreeMap<String, bool>,
}

/// One end-to-end request to ingest a single uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    /// Tenant the contacts are imported for
    pub owner_id: Uuid,
    /// User who uploaded the file
    pub created_by: Uuid,
    pub file: FileDescriptor,
    pub status: ImportJobStatus,
    /// Phase most recently enqueued; retry re-enqueues it
    pub last_phase: Option<ImportPhase>,
    pub headers: Vec<String>,
    pub mapping: ColumnMapping,
    pub assignment: AssignmentConfig,
    pub duplicates: DuplicateConfig,
    pub counters: JobCounters,
    pub cursor: JobCursor,
    pub error: Option<JobError>,
    pub ui_state: WizardState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn options(&self) -> ImportOptions {
        ImportOptions {
            assignment: self.assignment.clone(),
            duplicates: self.duplicates.clone(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.id,
            status: self.status,
            phase: self.last_phase,
            counters: self.counters,
            cursor: self.cursor,
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Fields needed to create a job
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub created_by: Uuid,
    pub file: FileDescriptor,
    pub headers: Vec<String>,
    pub mapping: ColumnMapping,
}

/// Live progress pushed to observers and returned by status polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
    pub phase: Option<ImportPhase>,
    pub counters: JobCounters,
    pub cursor: JobCursor,
    pub error: Option<JobError>,
    pub updated_at: DateTime<Utc>,
}

// ==========================================================================
// API payloads
// ==========================================================================

/// Upload request; the file travels base64-encoded on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImportJobRequest {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub file_base64: String,
}

/// Response to an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImportJobResponse {
    pub job_id: Uuid,
    pub storage_locator: String,
    /// Identical bytes were already uploaded by this owner
    pub existing: bool,
    pub headers: Vec<String>,
    pub mapping: ColumnMapping,
    pub summary: MappingSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetColumnMappingRequest {
    pub job_id: Uuid,
    pub mapping: ColumnMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOptionsRequest {
    pub job_id: Uuid,
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub duplicates: DuplicateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueCommitRequest {
    pub job_id: Uuid,
    /// Last-moment option overrides; applied before enqueueing
    #[serde(default)]
    pub options: Option<ImportOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub job_id: Uuid,
    pub phase: ImportPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRowsRequest {
    pub job_id: Uuid,
    #[serde(default)]
    pub status: Option<RowFilter>,
    #[serde(default)]
    pub page: Page,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRowsResponse {
    pub rows: Vec<ImportRow>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveUiStateRequest {
    pub job_id: Uuid,
    pub ui_state: WizardState,
}

/// Acknowledgement of a state-changing call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
}

/// Result of the pre-commit duplicate check shown on the review step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicatePreview {
    pub valid: i64,
    pub invalid: i64,
    pub file_duplicates: i64,
    pub db_duplicates: i64,
    /// Rows the commit would create or update under the current strategy
    pub commit_eligible: i64,
}

/// Signed, time-limited retrieval URL for the uploaded file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUrlResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Reply to a progress subscription: the latest snapshot and the subject carrying
/// the following ones
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeProgressResponse {
    pub snapshot: ProgressSnapshot,
    /// Absent once the job is terminal; nothing further will be published
    pub subject: Option<String>,
}
