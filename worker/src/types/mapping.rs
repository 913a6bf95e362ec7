//! Column mapping types: canonical contact fields and header → field mappings

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Canonical contact field a source column can be mapped to.
///
/// This is the closed, versioned schema of normalized output; raw rows stay open maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    FirstName,
    LastName,
    Email,
    Phone,
    Company,
    JobTitle,
    Street,
    City,
    PostalCode,
    Country,
    Notes,
}

impl TargetField {
    pub const ALL: [TargetField; 11] = [
        TargetField::FirstName,
        TargetField::LastName,
        TargetField::Email,
        TargetField::Phone,
        TargetField::Company,
        TargetField::JobTitle,
        TargetField::Street,
        TargetField::City,
        TargetField::PostalCode,
        TargetField::Country,
        TargetField::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::FirstName => "first_name",
            TargetField::LastName => "last_name",
            TargetField::Email => "email",
            TargetField::Phone => "phone",
            TargetField::Company => "company",
            TargetField::JobTitle => "job_title",
            TargetField::Street => "street",
            TargetField::City => "city",
            TargetField::PostalCode => "postal_code",
            TargetField::Country => "country",
            TargetField::Notes => "notes",
        }
    }

    pub fn parse(s: &str) -> Option<TargetField> {
        TargetField::ALL.iter().copied().find(|f| f.as_str() == s)
    }

    /// Fields that identify a contact on their own. At least one must be mapped
    /// (and survive normalization) for a row to be importable.
    pub fn is_identity(&self) -> bool {
        matches!(
            self,
            TargetField::Email | TargetField::Phone | TargetField::FirstName | TargetField::LastName
        )
    }
}

impl std::fmt::Display for TargetField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ranked alternative target for a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCandidate {
    pub field: TargetField,
    pub confidence: f64,
}

/// Mapping of one source column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMappingEntry {
    pub source_column: String,
    pub source_index: usize,
    pub target_field: Option<TargetField>,
    /// Heuristic strength of match in [0, 1]; 1.0 for manual choices
    pub confidence: f64,
    #[serde(default)]
    pub is_manual: bool,
    #[serde(default)]
    pub sample_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<FieldCandidate>,
}

/// Ordered list of column mappings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(pub Vec<ColumnMappingEntry>);

/// Why a mapping was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingViolation {
    DuplicateTarget(TargetField),
    DuplicateSourceIndex(usize),
    ConfidenceOutOfRange(String),
}

impl std::fmt::Display for MappingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingViolation::DuplicateTarget(field) => {
                write!(f, "target field '{}' is mapped more than once", field)
            }
            MappingViolation::DuplicateSourceIndex(idx) => {
                write!(f, "source column index {} appears more than once", idx)
            }
            MappingViolation::ConfidenceOutOfRange(col) => {
                write!(f, "confidence for column '{}' must be within [0, 1]", col)
            }
        }
    }
}

impl ColumnMapping {
    pub fn entries(&self) -> &[ColumnMappingEntry] {
        &self.0
    }

    /// Check the structural invariants: unique non-null targets, unique source indexes,
    /// confidences within [0, 1].
    pub fn validate(&self) -> Result<(), MappingViolation> {
        let mut targets = HashSet::new();
        let mut indexes = HashSet::new();
        for entry in &self.0 {
            if !(0.0..=1.0).contains(&entry.confidence) || entry.confidence.is_nan() {
                return Err(MappingViolation::ConfidenceOutOfRange(entry.source_column.clone()));
            }
            if !indexes.insert(entry.source_index) {
                return Err(MappingViolation::DuplicateSourceIndex(entry.source_index));
            }
            if let Some(field) = entry.target_field {
                if !targets.insert(field) {
                    return Err(MappingViolation::DuplicateTarget(field));
                }
            }
        }
        Ok(())
    }

    /// Mapped target fields in column order
    pub fn mapped(&self) -> impl Iterator<Item = (&ColumnMappingEntry, TargetField)> {
        self.0
            .iter()
            .filter_map(|entry| entry.target_field.map(|field| (entry, field)))
    }

    /// Source column mapped to `field`, if any
    pub fn source_for(&self, field: TargetField) -> Option<&str> {
        self.mapped()
            .find(|(_, f)| *f == field)
            .map(|(entry, _)| entry.source_column.as_str())
    }

    pub fn has_identity_field(&self) -> bool {
        self.mapped().any(|(_, field)| field.is_identity())
    }

    pub fn summary(&self) -> MappingSummary {
        let total_columns = self.0.len();
        let mapped_columns = self.mapped().count();
        MappingSummary {
            total_columns,
            mapped_columns,
            mapped_ratio: if total_columns == 0 {
                0.0
            } else {
                mapped_columns as f64 / total_columns as f64
            },
            is_complete: self.has_identity_field(),
        }
    }
}

/// Completeness of a mapping, surfaced to the wizard instead of errors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSummary {
    pub total_columns: usize,
    pub mapped_columns: usize,
    pub mapped_ratio: f64,
    /// At least one contact-identity field is mapped
    pub is_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(col: &str, idx: usize, field: Option<TargetField>) -> ColumnMappingEntry {
        ColumnMappingEntry {
            source_column: col.to_string(),
            source_index: idx,
            target_field: field,
            confidence: if field.is_some() { 0.9 } else { 0.0 },
            is_manual: false,
            sample_values: vec![],
            alternatives: vec![],
        }
    }

    #[test]
    fn test_target_field_round_trips_through_str() {
        for field in TargetField::ALL {
            assert_eq!(TargetField::parse(field.as_str()), Some(field));
        }
        assert_eq!(TargetField::parse("fax"), None);
    }

    #[test]
    fn test_target_field_serializes_snake_case() {
        let json = serde_json::to_string(&TargetField::PostalCode).unwrap();
        assert_eq!(json, "\"postal_code\"");
    }

    #[test]
    fn test_validate_rejects_duplicate_target() {
        let mapping = ColumnMapping(vec![
            entry("E-mail", 0, Some(TargetField::Email)),
            entry("Mail", 1, Some(TargetField::Email)),
        ]);
        assert_eq!(
            mapping.validate(),
            Err(MappingViolation::DuplicateTarget(TargetField::Email))
        );
    }

    #[test]
    fn test_validate_allows_multiple_unmapped() {
        let mapping = ColumnMapping(vec![
            entry("A", 0, None),
            entry("B", 1, None),
            entry("Email", 2, Some(TargetField::Email)),
        ]);
        assert!(mapping.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let mut e = entry("Email", 0, Some(TargetField::Email));
        e.confidence = 1.5;
        assert!(matches!(
            ColumnMapping(vec![e]).validate(),
            Err(MappingViolation::ConfidenceOutOfRange(_))
        ));
    }

    #[test]
    fn test_summary_requires_identity_field() {
        let mapping = ColumnMapping(vec![
            entry("Firma", 0, Some(TargetField::Company)),
            entry("Mesto", 1, Some(TargetField::City)),
            entry("X", 2, None),
        ]);
        let summary = mapping.summary();
        assert_eq!(summary.mapped_columns, 2);
        assert!(!summary.is_complete);

        let mapping = ColumnMapping(vec![entry("Tel", 0, Some(TargetField::Phone))]);
        assert!(mapping.summary().is_complete);
    }

    #[test]
    fn test_mapping_serializes_as_plain_array() {
        let mapping = ColumnMapping(vec![entry("Email", 0, Some(TargetField::Email))]);
        let json = serde_json::to_string(&mapping).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains("sourceColumn"));
        assert!(json.contains("targetField"));
    }
}
