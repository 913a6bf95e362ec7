//! Owner assignment for committed contacts

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::ImportError;
use crate::types::{AssignmentConfig, Owner, RawRecord};

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(name: &str) -> Owner {
        Owner {
            id: Uuid::new_v4(),
            display_name: name.to_string(),
            role: "sales".to_string(),
        }
    }

    #[test]
    fn test_round_robin_requires_two_distinct_users() {
        let a = owner("Alice");
        let owners = vec![a.clone()];
        let config = AssignmentConfig::RoundRobin { pool: vec![a.id, a.id] };
        assert!(validate_assignment(&config, &owners, &[]).is_err());
    }

    #[test]
    fn test_single_must_exist_in_directory() {
        let owners = vec![owner("Alice")];
        let config = AssignmentConfig::Single { user_id: Uuid::new_v4() };
        assert!(matches!(
            validate_assignment(&config, &owners, &[]),
            Err(ImportError::InvalidConfig(_))
        ));
        let config = AssignmentConfig::Single { user_id: owners[0].id };
        assert!(validate_assignment(&config, &owners, &[]).is_ok());
    }

    #[test]
    fn test_by_column_must_reference_header() {
        let headers = vec!["Owner".to_string()];
        let ok = AssignmentConfig::ByColumn { source_column: "Owner".to_string() };
        let bad = AssignmentConfig::ByColumn { source_column: "Salesperson".to_string() };
        assert!(validate_assignment(&ok, &[], &headers).is_ok());
        assert!(validate_assignment(&bad, &[], &headers).is_err());
    }

    #[test]
    fn test_round_robin_fairness() {
        let pool: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let config = AssignmentConfig::RoundRobin { pool: pool.clone() };
        let engine = AssignmentEngine::new(&config, &[]);
        let raw = RawRecord::new();

        for k in [0usize, 1, 2, 7, 10, 11] {
            let mut counts = vec![0usize; pool.len()];
            for i in 0..k {
                let id = engine.resolve(&raw, i as i64).unwrap();
                let pos = pool.iter().position(|p| *p == id).unwrap();
                counts[pos] += 1;
            }
            let floor = k / pool.len();
            let ceil = (k + pool.len() - 1) / pool.len();
            for c in counts {
                assert!(c >= floor && c <= ceil, "k={k} count={c}");
            }
        }
    }

    #[test]
    fn test_by_column_case_insensitive_lookup() {
        let alice = owner("Alice Nováková");
        let owners = vec![alice.clone(), owner("Bob")];
        let config = AssignmentConfig::ByColumn { source_column: "Owner".to_string() };
        let engine = AssignmentEngine::new(&config, &owners);

        let mut raw = RawRecord::new();
        raw.insert("Owner".to_string(), "  alice NOVÁKOVÁ ".to_string());
        assert_eq!(engine.resolve(&raw, 0), Some(alice.id));

        raw.insert("Owner".to_string(), "Carol".to_string());
        assert_eq!(engine.resolve(&raw, 0), None);

        assert_eq!(engine.resolve(&RawRecord::new(), 0), None);
    }

    #[test]
    fn test_none_and_single() {
        let id = Uuid::new_v4();
        let raw = RawRecord::new();
        assert_eq!(AssignmentEngine::new(&AssignmentConfig::None, &[]).resolve(&raw, 5), None);
        assert_eq!(
            AssignmentEngine::new(&AssignmentConfig::Single { user_id: id }, &[]).resolve(&raw, 5),
            Some(id)
        );
    }
}

/// Check an assignment config against the owner directory and the file headers
pub fn validate_assignment(
    config: &AssignmentConfig,
    owners: &[Owner],
    headers: &[String],
) -> Result<(), ImportError> {
    let known = |id: &Uuid| owners.iter().any(|o| o.id == *id);

    match config {
        AssignmentConfig::None => Ok(()),
        AssignmentConfig::Single { user_id } => {
            if known(user_id) {
                Ok(())
            } else {
                Err(ImportError::InvalidConfig(format!("Unknown user {}", user_id)))
            }
        }
        AssignmentConfig::RoundRobin { pool } => {
            let distinct: HashSet<&Uuid> = pool.iter().collect();
            if distinct.len() < 2 || distinct.len() != pool.len() {
                return Err(ImportError::InvalidConfig(
                    "Round robin needs at least two distinct users".to_string(),
                ));
            }
            if let Some(unknown) = pool.iter().find(|id| !known(id)) {
                return Err(ImportError::InvalidConfig(format!("Unknown user {}", unknown)));
            }
            Ok(())
        }
        AssignmentConfig::ByColumn { source_column } => {
            if headers.iter().any(|h| h == source_column) {
                Ok(())
            } else {
                Err(ImportError::InvalidConfig(format!(
                    "Column '{}' is not in the file",
                    source_column
                )))
            }
        }
    }
}

/// Resolves the owner of each committed row
pub struct AssignmentEngine {
    config: AssignmentConfig,
    by_name: Vec<(String, Uuid)>,
}

impl AssignmentEngine {
    pub fn new(config: &AssignmentConfig, owners: &[Owner]) -> Self {
        let by_name = owners
            .iter()
            .map(|o| (display_key(&o.display_name), o.id))
            .collect();
        Self {
            config: config.clone(),
            by_name,
        }
    }

    /// `committed_so_far` is the job's running count of committed rows
    pub fn resolve(&self, raw: &RawRecord, committed_so_far: i64) -> Option<Uuid> {
        match &self.config {
            AssignmentConfig::None => None,
            AssignmentConfig::Single { user_id } => Some(*user_id),
            AssignmentConfig::RoundRobin { pool } => {
                if pool.is_empty() {
                    return None;
                }
                let slot = committed_so_far.rem_euclid(pool.len() as i64) as usize;
                pool.get(slot).copied()
            }
            AssignmentConfig::ByColumn { source_column } => {
                let value = display_key(raw.get(source_column)?);
                if value.is_empty() {
                    return None;
                }
                self.by_name
                    .iter()
                    .find(|(name, _)| *name == value)
                    .map(|(_, id)| *id)
            }
        }
    }
}

fn display_key(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
