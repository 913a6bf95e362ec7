//! Import options: owner assignment and duplicate handling

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mapping::TargetField;

/// How committed contacts get an owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AssignmentConfig {
    /// Contacts stay unassigned
    None,
    /// Every contact goes to one user
    #[serde(rename_all = "camelCase")]
    Single { user_id: Uuid },
    /// Contacts cycle through a pool of users
    #[serde(rename_all = "camelCase")]
    RoundRobin { pool: Vec<Uuid> },
    /// Owner is looked up by display name from a source column
    #[serde(rename_all = "camelCase")]
    ByColumn { source_column: String },
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        AssignmentConfig::None
    }
}

impl AssignmentConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            AssignmentConfig::None => "none",
            AssignmentConfig::Single { .. } => "single",
            AssignmentConfig::RoundRobin { .. } => "round_robin",
            AssignmentConfig::ByColumn { .. } => "by_column",
        }
    }
}

/// What happens to rows that match an existing contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    Skip,
    Update,
    Create,
}

impl Default for DuplicateStrategy {
    fn default() -> Self {
        DuplicateStrategy::Skip
    }
}

/// Duplicate detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateConfig {
    #[serde(default)]
    pub strategy: DuplicateStrategy,
    #[serde(default = "default_check_fields")]
    pub check_fields: Vec<TargetField>,
    #[serde(default = "default_true")]
    pub check_database: bool,
    #[serde(default = "default_true")]
    pub check_within_file: bool,
}

fn default_check_fields() -> Vec<TargetField> {
    vec![TargetField::Email]
}

fn default_true() -> bool {
    true
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            strategy: DuplicateStrategy::default(),
            check_fields: default_check_fields(),
            check_database: true,
            check_within_file: true,
        }
    }
}

impl DuplicateConfig {
    /// True when switching from `self` to `other` invalidates duplicate flags written
    /// during parsing.
    pub fn affects_parse(&self, other: &DuplicateConfig) -> bool {
        self.check_fields != other.check_fields || self.check_within_file != other.check_within_file
    }
}

/// Options set together by the wizard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    #[serde(default)]
    pub assignment: AssignmentConfig,
    #[serde(default)]
    pub duplicates: DuplicateConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_config_round_robin_serializes_with_mode_tag() {
        let config = AssignmentConfig::RoundRobin {
            pool: vec![Uuid::nil(), Uuid::nil()],
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mode\":\"round_robin\""));
        assert!(json.contains("\"pool\""));
    }

    #[test]
    fn test_assignment_config_by_column_deserializes_camel_case() {
        let json = r#"{"mode":"by_column","sourceColumn":"Owner"}"#;
        let config: AssignmentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            AssignmentConfig::ByColumn {
                source_column: "Owner".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_config_defaults() {
        let config: DuplicateConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.strategy, DuplicateStrategy::Skip);
        assert_eq!(config.check_fields, vec![TargetField::Email]);
        assert!(config.check_database);
        assert!(config.check_within_file);
    }

    #[test]
    fn test_strategy_change_does_not_affect_parse() {
        let a = DuplicateConfig::default();
        let b = DuplicateConfig {
            strategy: DuplicateStrategy::Update,
            ..DuplicateConfig::default()
        };
        assert!(!a.affects_parse(&b));

        let c = DuplicateConfig {
            check_fields: vec![TargetField::Email, TargetField::Phone],
            ..DuplicateConfig::default()
        };
        assert!(a.affects_parse(&c));
    }
}
