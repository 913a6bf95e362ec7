//! Contact, owner and audit types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::import_row::NormalizedRecord;
use super::mapping::TargetField;

/// Contact entity (import target)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub assigned_to: Option<Uuid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub phone_raw: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub notes: Option<String>,
    pub source_import_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn value(&self, field: TargetField) -> Option<&str> {
        match field {
            TargetField::FirstName => self.first_name.as_deref(),
            TargetField::LastName => self.last_name.as_deref(),
            TargetField::Email => self.email.as_deref(),
            TargetField::Phone => self.phone.as_deref(),
            TargetField::Company => self.company.as_deref(),
            TargetField::JobTitle => self.job_title.as_deref(),
            TargetField::Street => self.street.as_deref(),
            TargetField::City => self.city.as_deref(),
            TargetField::PostalCode => self.postal_code.as_deref(),
            TargetField::Country => self.country.as_deref(),
            TargetField::Notes => self.notes.as_deref(),
        }
    }
}

/// Values written to a contact from one import row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactDraft {
    pub assigned_to: Option<Uuid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub phone_raw: Option<String>,
    pub company: Option<String>,
    pub job_title: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub notes: Option<String>,
}

impl ContactDraft {
    pub fn from_normalized(
        normalized: &NormalizedRecord,
        phone_raw: Option<String>,
        assigned_to: Option<Uuid>,
    ) -> Self {
        let get = |field: TargetField| normalized.get(&field).cloned().flatten();
        Self {
            assigned_to,
            first_name: get(TargetField::FirstName),
            last_name: get(TargetField::LastName),
            email: get(TargetField::Email),
            phone: get(TargetField::Phone),
            phone_raw,
            company: get(TargetField::Company),
            job_title: get(TargetField::JobTitle),
            street: get(TargetField::Street),
            city: get(TargetField::City),
            postal_code: get(TargetField::PostalCode),
            country: get(TargetField::Country),
            notes: get(TargetField::Notes),
        }
    }

    /// Fill gaps of an update: values present in the draft win, missing ones keep the stored value
    pub fn merge_into(&self, contact: &mut Contact) {
        fn pick(new: &Option<String>, old: &mut Option<String>) {
            if new.is_some() {
                *old = new.clone();
            }
        }
        pick(&self.first_name, &mut contact.first_name);
        pick(&self.last_name, &mut contact.last_name);
        pick(&self.email, &mut contact.email);
        pick(&self.phone, &mut contact.phone);
        pick(&self.phone_raw, &mut contact.phone_raw);
        pick(&self.company, &mut contact.company);
        pick(&self.job_title, &mut contact.job_title);
        pick(&self.street, &mut contact.street);
        pick(&self.city, &mut contact.city);
        pick(&self.postal_code, &mut contact.postal_code);
        pick(&self.country, &mut contact.country);
        pick(&self.notes, &mut contact.notes);
        if self.assigned_to.is_some() {
            contact.assigned_to = self.assigned_to;
        }
    }
}

/// Entry of the owner directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: Uuid,
    pub display_name: String,
    pub role: String,
}

/// Audit event types emitted by the commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "contact.imported")]
    ContactImported,
    #[serde(rename = "contact.updated")]
    ContactUpdated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ContactImported => "contact.imported",
            AuditEventType::ContactUpdated => "contact.updated",
        }
    }
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub entity_id: Uuid,
    pub job_id: Uuid,
    pub event_type: AuditEventType,
    pub actor_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            assigned_to: None,
            first_name: Some("Jana".to_string()),
            last_name: Some("Nováková".to_string()),
            email: Some("jana@example.cz".to_string()),
            phone: None,
            phone_raw: None,
            company: Some("Old s.r.o.".to_string()),
            job_title: None,
            street: None,
            city: Some("Brno".to_string()),
            postal_code: None,
            country: None,
            notes: None,
            source_import_job_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_draft_from_normalized_flattens_nulls() {
        let mut normalized = NormalizedRecord::new();
        normalized.insert(TargetField::Email, Some("a@b.cz".to_string()));
        normalized.insert(TargetField::City, None);
        let draft = ContactDraft::from_normalized(&normalized, None, None);
        assert_eq!(draft.email.as_deref(), Some("a@b.cz"));
        assert!(draft.city.is_none());
        assert!(draft.first_name.is_none());
    }

    #[test]
    fn test_merge_keeps_existing_when_draft_missing() {
        let mut existing = contact();
        let draft = ContactDraft {
            company: Some("New a.s.".to_string()),
            phone: Some("+420777123456".to_string()),
            ..Default::default()
        };
        draft.merge_into(&mut existing);
        assert_eq!(existing.company.as_deref(), Some("New a.s."));
        assert_eq!(existing.phone.as_deref(), Some("+420777123456"));
        assert_eq!(existing.city.as_deref(), Some("Brno"));
        assert_eq!(existing.first_name.as_deref(), Some("Jana"));
    }

    #[test]
    fn test_audit_event_type_serializes_dotted() {
        let json = serde_json::to_string(&AuditEventType::ContactUpdated).unwrap();
        assert_eq!(json, "\"contact.updated\"");
    }
}
