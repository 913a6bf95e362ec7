//! Import job lifecycle rules
//!
//! Pure guard and transition functions; every mutating operation checks here before
//! issuing its conditional write.

use crate::error::ImportError;
use crate::types::{ImportJobStatus, ImportPhase};

use ImportJobStatus::*;

/// Statuses in which mapping and options may change
pub const CONFIGURABLE: &[ImportJobStatus] = &[Pending, Validating, Ready];

/// Statuses from which parse may be (re)enqueued
pub const PARSE_ENQUEUEABLE: &[ImportJobStatus] = &[Pending, Failed, Validating, Parsing];

/// Statuses from which commit may be enqueued
pub const COMMIT_ENQUEUEABLE: &[ImportJobStatus] = &[Ready];

/// Statuses a cancel request applies to
pub const CANCELLABLE: &[ImportJobStatus] = &[Queued, Parsing, Importing];

/// Statuses in which workers may record a failure
pub const FAILABLE: &[ImportJobStatus] = &[Queued, Parsing, Importing];

/// Whether `from → to` is a legal lifecycle move
pub fn can_transition(from: ImportJobStatus, to: ImportJobStatus) -> bool {
    match (from, to) {
        (Pending, Queued) | (Validating, Queued) | (Failed, Queued) | (Parsing, Queued) => true,
        (Ready, Queued) | (Ready, Validating) => true,
        (Queued, Parsing) | (Queued, Importing) => true,
        (Parsing, Ready) => true,
        (Importing, Completed) => true,
        (Queued | Parsing | Importing, Failed) => true,
        (Queued | Parsing | Importing, Cancelled) => true,
        _ => false,
    }
}

/// Reject `operation` unless the job is in one of `allowed`
pub fn require(
    operation: &'static str,
    status: ImportJobStatus,
    allowed: &[ImportJobStatus],
) -> Result<(), ImportError> {
    if allowed.contains(&status) {
        Ok(())
    } else {
        Err(ImportError::invalid_state(operation, status))
    }
}

/// Re-parse from these statuses discards previously parsed rows
pub fn parse_starts_from_scratch(status: ImportJobStatus) -> bool {
    matches!(status, Pending | Validating)
}

/// Status after a configuration change. A ready job whose parsed rows no longer match
/// the configuration needs a re-parse before commit.
pub fn status_after_config_change(status: ImportJobStatus, invalidates_rows: bool) -> ImportJobStatus {
    if status == Ready && invalidates_rows {
        Validating
    } else {
        status
    }
}

/// Status a worker expects to pick up for `phase`; a redelivered message may find the
/// job already running that phase.
pub fn worker_start_states(phase: ImportPhase) -> &'static [ImportJobStatus] {
    match phase {
        ImportPhase::Parse => &[Queued, Parsing],
        ImportPhase::Commit => &[Queued, Importing],
    }
}

/// Running status of a phase
pub fn running_status(phase: ImportPhase) -> ImportJobStatus {
    match phase {
        ImportPhase::Parse => Parsing,
        ImportPhase::Commit => Importing,
    }
}
