//! Duplicate detection
//!
//! Rows and stored contacts are compared through a composite key built from the
//! configured check fields. Within a file the first occurrence of a key is canonical
//! and later ones are file duplicates; against the store, a valid row whose key
//! matches an existing contact is a store duplicate.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use super::store::ImportStore;
use crate::types::{Contact, DuplicateKind, DuplicateStrategy, NormalizedRecord, TargetField};


/// Composite key over `fields`; `None` when every field is empty
pub fn dedupe_key(normalized: &NormalizedRecord, fields: &[TargetField]) -> Option<String> {
    compose(fields, |field| normalized.get(&field).and_then(|v| v.as_deref()))
}

/// Key of a stored contact, built the same way as a row key
pub fn contact_key(contact: &Contact, fields: &[TargetField]) -> Option<String> {
    compose(fields, |field| contact.value(field))
}

fn compose<'a>(fields: &[TargetField], value: impl Fn(TargetField) -> Option<&'a str>) -> Option<String> {
    let mut any = false;
    let parts: Vec<String> = fields
        .iter()
        .map(|&field| {
            let v = value(field).map(|v| key_value(field, v)).unwrap_or_default();
            if !v.is_empty() {
                any = true;
            }
            format!("{}={}", field.as_str(), v)
        })
        .collect();

    any.then(|| parts.join("|"))
}

fn key_value(field: TargetField, value: &str) -> String {
    match field {
        TargetField::Phone => value
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect(),
        _ => value.trim().to_lowercase(),
    }
}

// =============================================================================
// Within-file
// =============================================================================

/// Seen-key set for one parse run
#[derive(Debug, Default)]
pub struct WithinFileDetector {
    seen: HashSet<String>,
    enabled: bool,
}

impl WithinFileDetector {
    pub fn new(enabled: bool) -> Self {
        Self {
            seen: HashSet::new(),
            enabled,
        }
    }

    /// Resume a run with keys of rows already persisted
    pub fn from_keys(seen: HashSet<String>) -> Self {
        Self { seen, enabled: true }
    }

    pub fn classify(&mut self, key: Option<&str>) -> DuplicateKind {
        let Some(key) = key else {
            return DuplicateKind::None;
        };
        if !self.enabled {
            return DuplicateKind::None;
        }
        if self.seen.insert(key.to_string()) {
            DuplicateKind::None
        } else {
            DuplicateKind::FileDuplicate
        }
    }
}

// =============================================================================
// Against the store
// =============================================================================

/// Stored contacts keyed like the job's rows, restricted to keys the job contains
#[derive(Debug, Default)]
pub struct StoreDedupeIndex {
    matches: HashMap<String, Uuid>,
}

impl StoreDedupeIndex {
    /// Page through the tenant's contacts (keyset by id, `page_size` at a time).
    /// Contacts created by `job_id` itself are not considered.
    pub async fn build(
        store: &dyn ImportStore,
        owner_id: Uuid,
        job_id: Uuid,
        fields: &[TargetField],
        job_keys: &HashSet<String>,
        page_size: i64,
    ) -> Result<Self> {
        let mut matches = HashMap::new();
        if job_keys.is_empty() || fields.is_empty() {
            return Ok(Self { matches });
        }

        let page_size = page_size.max(1);
        let mut after = None;
        let mut scanned = 0usize;
        loop {
            let page = store.contacts_page(owner_id, after, page_size, job_id).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            scanned += page.len();

            for contact in &page {
                if let Some(key) = contact_key(contact, fields) {
                    if job_keys.contains(&key) {
                        matches.entry(key).or_insert(contact.id);
                    }
                }
            }

            if (page.len() as i64) < page_size {
                break;
            }
        }

        debug!(
            "Dedupe index for job {}: scanned {} contacts, {} matching keys",
            job_id,
            scanned,
            matches.len()
        );

        Ok(Self { matches })
    }

    pub fn lookup(&self, key: &str) -> Option<Uuid> {
        self.matches.get(key).copied()
    }

    pub fn matches(&self) -> &HashMap<String, Uuid> {
        &self.matches
    }
}

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitDecision {
    Create,
    Update(Uuid),
    Skip(String),
}

/// What the commit does with a valid row given its classification.
/// File duplicates are never created, whatever the strategy.
pub fn decide(duplicate: DuplicateKind, matched: Option<Uuid>, strategy: DuplicateStrategy) -> CommitDecision {
    match duplicate {
        DuplicateKind::None => CommitDecision::Create,
        DuplicateKind::FileDuplicate => CommitDecision::Skip("duplicate within file".to_string()),
        DuplicateKind::DbDuplicate => match (strategy, matched) {
            (DuplicateStrategy::Skip, _) => CommitDecision::Skip("matches an existing contact".to_string()),
            (DuplicateStrategy::Update, Some(id)) => CommitDecision::Update(id),
            (DuplicateStrategy::Update, None) => CommitDecision::Create,
            (DuplicateStrategy::Create, _) => CommitDecision::Create,
        },
    }
}
