//! Row validator / normalizer
//!
//! Turns one raw row into canonical field values plus a per-field error map.
//! Pure and row-local: the same raw row and mapping always produce the same output.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{
    ColumnMapping, FieldErrors, NormalizedRecord, RawRecord, RowStatus, TargetField,
};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .expect("valid email regex")
});

static POSTAL_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9 \-]{1,8}[A-Z0-9]$").expect("valid postal code regex"));

const MAX_TEXT_LEN: usize = 255;
const MAX_NOTES_LEN: usize = 2000;
const MAX_EMAIL_LEN: usize = 254;

/// Error key for problems that are not tied to one field
pub const ROW_ERROR_KEY: &str = "_row";

/// Outcome of validating one row
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub status: RowStatus,
    pub normalized: NormalizedRecord,
    pub errors: FieldErrors,
}

impl ValidatedRow {
    pub fn is_valid(&self) -> bool {
        self.status == RowStatus::Valid
    }
}

#[derive(Debug, Clone)]
pub struct RowValidator {
    calling_code: String,
}

impl RowValidator {
    /// `calling_code` is applied to national phone numbers, digits only (e.g. "420")
    pub fn new(calling_code: impl Into<String>) -> Self {
        Self {
            calling_code: calling_code.into(),
        }
    }

    pub fn validate(&self, raw: &RawRecord, mapping: &ColumnMapping) -> ValidatedRow {
        let mut normalized = NormalizedRecord::new();
        let mut errors = FieldErrors::new();

        for (entry, field) in mapping.mapped() {
            let value = raw.get(&entry.source_column).map(String::as_str).unwrap_or("");
            match self.normalize_field(field, value) {
                Ok(v) => {
                    normalized.insert(field, v);
                }
                Err(message) => {
                    normalized.insert(field, None);
                    errors.insert(field.as_str().to_string(), message);
                }
            }
        }

        let has_identity = normalized
            .iter()
            .any(|(field, value)| field.is_identity() && value.is_some());
        if !has_identity {
            errors.insert(
                ROW_ERROR_KEY.to_string(),
                "Row has no email, phone, first name or last name".to_string(),
            );
        }

        let status = if errors.is_empty() {
            RowStatus::Valid
        } else {
            RowStatus::Invalid
        };

        ValidatedRow {
            status,
            normalized,
            errors,
        }
    }

    /// Canonicalize one value. `Ok(None)` means the cell was empty.
    pub fn normalize_field(&self, field: TargetField, value: &str) -> Result<Option<String>, String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        match field {
            TargetField::Email => normalize_email(trimmed).map(Some),
            TargetField::Phone => normalize_phone(trimmed, &self.calling_code).map(Some),
            TargetField::PostalCode => normalize_postal_code(trimmed).map(Some),
            TargetField::Country => Ok(Some(normalize_country(trimmed))),
            TargetField::Notes => Ok(Some(clean_text(trimmed, MAX_NOTES_LEN))),
            _ => Ok(Some(clean_text(trimmed, MAX_TEXT_LEN))),
        }
    }
}

fn normalize_email(value: &str) -> Result<String, String> {
    let email = value.to_lowercase();
    if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(&email) {
        return Err(format!("Invalid email address '{}'", value));
    }
    Ok(email)
}

/// Canonical `+<digits>` form; national numbers get `calling_code`
pub fn normalize_phone(value: &str, calling_code: &str) -> Result<String, String> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '/' | '\u{a0}'))
        .collect();

    let (international, rest) = if let Some(rest) = cleaned.strip_prefix('+') {
        (true, rest)
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        (true, rest)
    } else {
        (false, cleaned.as_str())
    };

    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("Invalid phone number '{}'", value));
    }

    let digits = if international {
        rest.to_string()
    } else {
        let national = rest.strip_prefix('0').unwrap_or(rest);
        if national.starts_with(calling_code) && national.len() >= calling_code.len() + 8 {
            national.to_string()
        } else {
            format!("{}{}", calling_code, national)
        }
    };

    if !(8..=15).contains(&digits.len()) {
        return Err(format!("Invalid phone number '{}'", value));
    }

    Ok(format!("+{}", digits))
}

fn normalize_postal_code(value: &str) -> Result<String, String> {
    let code = collapse_whitespace(value).to_uppercase();
    if !POSTAL_CODE_RE.is_match(&code) || !code.chars().any(|c| c.is_ascii_digit()) {
        return Err(format!("Invalid postal code '{}'", value));
    }
    Ok(code)
}

fn normalize_country(value: &str) -> String {
    if value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic()) {
        value.to_ascii_uppercase()
    } else {
        clean_text(value, MAX_TEXT_LEN)
    }
}

fn clean_text(value: &str, max_chars: usize) -> String {
    let collapsed = collapse_whitespace(value);
    if collapsed.chars().count() > max_chars {
        collapsed.chars().take(max_chars).collect::<String>().trim_end().to_string()
    } else {
        collapsed
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnMappingEntry;

    fn mapping(columns: &[(&str, TargetField)]) -> ColumnMapping {
        ColumnMapping(
            columns
                .iter()
                .enumerate()
                .map(|(idx, (col, field))| ColumnMappingEntry {
                    source_column: col.to_string(),
                    source_index: idx,
                    target_field: Some(*field),
                    confidence: 1.0,
                    is_manual: true,
                    sample_values: vec![],
                    alternatives: vec![],
                })
                .collect(),
        )
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn validator() -> RowValidator {
        RowValidator::new("420")
    }

    #[test]
    fn test_phone_national_gets_default_code() {
        assert_eq!(normalize_phone("777 123 456", "420").unwrap(), "+420777123456");
        assert_eq!(normalize_phone("(777) 123-456", "420").unwrap(), "+420777123456");
    }

    #[test]
    fn test_phone_international_forms() {
        assert_eq!(normalize_phone("+421 905 123 456", "420").unwrap(), "+421905123456");
        assert_eq!(normalize_phone("00420777123456", "420").unwrap(), "+420777123456");
        assert_eq!(normalize_phone("420777123456", "420").unwrap(), "+420777123456");
    }

    #[test]
    fn test_phone_trunk_zero_stripped() {
        assert_eq!(normalize_phone("030 1234567", "49").unwrap(), "+49301234567");
    }

    #[test]
    fn test_phone_rejects_letters_and_short_numbers() {
        assert!(normalize_phone("call me", "420").is_err());
        assert!(normalize_phone("12", "420").is_err());
        assert!(normalize_phone("+1234567890123456", "420").is_err());
    }

    #[test]
    fn test_email_lowercased_and_checked() {
        let v = validator();
        assert_eq!(
            v.normalize_field(TargetField::Email, "  Jan.Novak@Example.CZ ").unwrap(),
            Some("jan.novak@example.cz".to_string())
        );
        assert!(v.normalize_field(TargetField::Email, "not-an-email").is_err());
        assert!(v.normalize_field(TargetField::Email, "a@b").is_err());
    }

    #[test]
    fn test_postal_code_normalized() {
        let v = validator();
        assert_eq!(
            v.normalize_field(TargetField::PostalCode, " 602  00 ").unwrap(),
            Some("602 00".to_string())
        );
        assert_eq!(
            v.normalize_field(TargetField::PostalCode, "sw1a 1aa").unwrap(),
            Some("SW1A 1AA".to_string())
        );
        assert!(v.normalize_field(TargetField::PostalCode, "ABCDE").is_err());
        assert!(v.normalize_field(TargetField::PostalCode, "1").is_err());
    }

    #[test]
    fn test_country_code_uppercased_free_text_kept() {
        let v = validator();
        assert_eq!(v.normalize_field(TargetField::Country, "cz").unwrap(), Some("CZ".to_string()));
        assert_eq!(
            v.normalize_field(TargetField::Country, "Czech   Republic").unwrap(),
            Some("Czech Republic".to_string())
        );
    }

    #[test]
    fn test_free_text_collapsed_and_clamped() {
        let v = validator();
        assert_eq!(
            v.normalize_field(TargetField::Company, "  ACME \t  s.r.o. ").unwrap(),
            Some("ACME s.r.o.".to_string())
        );
        let long = "x".repeat(300);
        let clamped = v.normalize_field(TargetField::City, &long).unwrap().unwrap();
        assert_eq!(clamped.chars().count(), 255);
        let notes = v.normalize_field(TargetField::Notes, &long).unwrap().unwrap();
        assert_eq!(notes.chars().count(), 300);
    }

    #[test]
    fn test_empty_cell_is_null_not_error() {
        let v = validator();
        assert_eq!(v.normalize_field(TargetField::Email, "   ").unwrap(), None);
    }

    #[test]
    fn test_valid_row() {
        let m = mapping(&[("E-mail", TargetField::Email), ("Tel", TargetField::Phone)]);
        let row = validator().validate(&raw(&[("E-mail", "A@B.cz"), ("Tel", "777123456")]), &m);
        assert!(row.is_valid());
        assert_eq!(row.normalized[&TargetField::Email].as_deref(), Some("a@b.cz"));
        assert_eq!(row.normalized[&TargetField::Phone].as_deref(), Some("+420777123456"));
        assert!(row.errors.is_empty());
    }

    #[test]
    fn test_bad_field_makes_row_invalid() {
        let m = mapping(&[("Jméno", TargetField::FirstName), ("E-mail", TargetField::Email)]);
        let row = validator().validate(&raw(&[("Jméno", "Jan"), ("E-mail", "jan@")]), &m);
        assert_eq!(row.status, RowStatus::Invalid);
        assert!(row.errors.contains_key("email"));
        assert_eq!(row.normalized[&TargetField::Email], None);
        assert_eq!(row.normalized[&TargetField::FirstName].as_deref(), Some("Jan"));
    }

    #[test]
    fn test_row_without_identity_is_invalid() {
        let m = mapping(&[("Firma", TargetField::Company), ("E-mail", TargetField::Email)]);
        let row = validator().validate(&raw(&[("Firma", "ACME"), ("E-mail", "")]), &m);
        assert_eq!(row.status, RowStatus::Invalid);
        assert!(row.errors.contains_key(ROW_ERROR_KEY));
    }

    #[test]
    fn test_validation_is_pure() {
        let m = mapping(&[("E-mail", TargetField::Email), ("PSČ", TargetField::PostalCode)]);
        let r = raw(&[("E-mail", "x@y.cz"), ("PSČ", "bad!")]);
        let v = validator();
        let first = v.validate(&r, &m);
        let second = v.validate(&r, &m);
        assert_eq!(first, second);
        assert_eq!(first.status, RowStatus::Invalid);
    }

    #[test]
    fn test_missing_source_column_treated_as_empty() {
        let m = mapping(&[("E-mail", TargetField::Email), ("Tel", TargetField::Phone)]);
        let row = validator().validate(&raw(&[("E-mail", "x@y.cz")]), &m);
        assert!(row.is_valid());
        assert_eq!(row.normalized[&TargetField::Phone], None);
    }
}
