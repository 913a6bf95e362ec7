//! Import row types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

use super::mapping::TargetField;

/// Raw cell values keyed by source column, verbatim from the file
pub type RawRecord = BTreeMap<String, String>;

/// Normalized values keyed by target field; `None` when the mapped cell was empty
pub type NormalizedRecord = BTreeMap<TargetField, Option<String>>;

/// Validation messages keyed by field name (or `_row` for row-level problems)
pub type FieldErrors = BTreeMap<String, String>;

/// Row lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_row_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Valid,
    Invalid,
    Imported,
    Skipped,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Valid => "valid",
            RowStatus::Invalid => "invalid",
            RowStatus::Imported => "imported",
            RowStatus::Skipped => "skipped",
        }
    }

    /// Legal moves: pending→{valid,invalid}, valid→{imported,skipped}
    pub fn can_transition(self, to: RowStatus) -> bool {
        matches!(
            (self, to),
            (RowStatus::Pending, RowStatus::Valid)
                | (RowStatus::Pending, RowStatus::Invalid)
                | (RowStatus::Valid, RowStatus::Imported)
                | (RowStatus::Valid, RowStatus::Skipped)
        )
    }
}

/// Duplicate classification; a routing decision, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "import_duplicate_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    None,
    FileDuplicate,
    DbDuplicate,
}

impl DuplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateKind::None => "none",
            DuplicateKind::FileDuplicate => "file_duplicate",
            DuplicateKind::DbDuplicate => "db_duplicate",
        }
    }
}

impl Default for DuplicateKind {
    fn default() -> Self {
        DuplicateKind::None
    }
}

/// Persisted row of an import job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRow {
    pub job_id: Uuid,
    /// 1-based data row position in the file
    pub row_number: i64,
    pub chunk_number: i64,
    pub status: RowStatus,
    pub raw: RawRecord,
    pub normalized: NormalizedRecord,
    pub errors: FieldErrors,
    pub duplicate: DuplicateKind,
    pub dedupe_key: Option<String>,
    /// Existing contact matched by the store duplicate check
    pub matched_contact_id: Option<Uuid>,
    /// Contact written by the commit; set once
    pub contact_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row produced by the parse worker, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct NewImportRow {
    pub row_number: i64,
    pub chunk_number: i64,
    pub status: RowStatus,
    pub raw: RawRecord,
    pub normalized: NormalizedRecord,
    pub errors: FieldErrors,
    pub duplicate: DuplicateKind,
    pub dedupe_key: Option<String>,
}

/// Filter for the review tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    Pending,
    Valid,
    Invalid,
    Imported,
    Skipped,
    FileDuplicate,
    DbDuplicate,
}

impl RowFilter {
    /// Row status and duplicate kind this filter selects on
    pub fn criteria(&self) -> (Option<RowStatus>, Option<DuplicateKind>) {
        match self {
            RowFilter::Pending => (Some(RowStatus::Pending), None),
            RowFilter::Valid => (Some(RowStatus::Valid), None),
            RowFilter::Invalid => (Some(RowStatus::Invalid), None),
            RowFilter::Imported => (Some(RowStatus::Imported), None),
            RowFilter::Skipped => (Some(RowStatus::Skipped), None),
            RowFilter::FileDuplicate => (None, Some(DuplicateKind::FileDuplicate)),
            RowFilter::DbDuplicate => (None, Some(DuplicateKind::DbDuplicate)),
        }
    }

    pub fn matches(&self, row: &ImportRow) -> bool {
        match self {
            RowFilter::Pending => row.status == RowStatus::Pending,
            RowFilter::Valid => row.status == RowStatus::Valid,
            RowFilter::Invalid => row.status == RowStatus::Invalid,
            RowFilter::Imported => row.status == RowStatus::Imported,
            RowFilter::Skipped => row.status == RowStatus::Skipped,
            RowFilter::FileDuplicate => row.duplicate == DuplicateKind::FileDuplicate,
            RowFilter::DbDuplicate => row.duplicate == DuplicateKind::DbDuplicate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_status_transitions() {
        assert!(RowStatus::Pending.can_transition(RowStatus::Valid));
        assert!(RowStatus::Pending.can_transition(RowStatus::Invalid));
        assert!(RowStatus::Valid.can_transition(RowStatus::Imported));
        assert!(RowStatus::Valid.can_transition(RowStatus::Skipped));

        assert!(!RowStatus::Invalid.can_transition(RowStatus::Imported));
        assert!(!RowStatus::Imported.can_transition(RowStatus::Valid));
        assert!(!RowStatus::Pending.can_transition(RowStatus::Imported));
        assert!(!RowStatus::Skipped.can_transition(RowStatus::Imported));
    }

    #[test]
    fn test_normalized_record_serializes_field_keys() {
        let mut normalized = NormalizedRecord::new();
        normalized.insert(TargetField::Email, Some("jan@example.cz".to_string()));
        normalized.insert(TargetField::Phone, None);
        let json = serde_json::to_string(&normalized).unwrap();
        assert_eq!(json, r#"{"email":"jan@example.cz","phone":null}"#);

        let back: NormalizedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, normalized);
    }

    #[test]
    fn test_row_filter_deserializes() {
        let filter: RowFilter = serde_json::from_str("\"file_duplicate\"").unwrap();
        assert_eq!(filter, RowFilter::FileDuplicate);
    }
}
