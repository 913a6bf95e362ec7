//! Column auto-mapper
//!
//! Suggests a target field for every source column from its header text and, when
//! available, its sample values.
//!
//! Pass 1 scores every column against the alias dictionary (exact match, then
//! substring with a length-ratio penalty) and adds content-derived candidates.
//! Pass 2 walks the columns by descending best confidence and greedily claims the best
//! still-free field above the threshold. There is no backtracking: a later column never
//! steals a field from an earlier, stronger one.

use std::collections::HashSet;

use crate::types::{ColumnMapping, ColumnMappingEntry, FieldCandidate, TargetField};

/// Built-in aliases: English, Czech, French, German
const BUILTIN_ALIASES: &[(&str, TargetField)] = &[
    // first name
    ("first name", TargetField::FirstName),
    ("firstname", TargetField::FirstName),
    ("given name", TargetField::FirstName),
    ("forename", TargetField::FirstName),
    ("jméno", TargetField::FirstName),
    ("křestní jméno", TargetField::FirstName),
    ("prénom", TargetField::FirstName),
    ("vorname", TargetField::FirstName),
    // last name
    ("last name", TargetField::LastName),
    ("lastname", TargetField::LastName),
    ("surname", TargetField::LastName),
    ("family name", TargetField::LastName),
    ("příjmení", TargetField::LastName),
    ("nom", TargetField::LastName),
    ("nom de famille", TargetField::LastName),
    ("nachname", TargetField::LastName),
    ("familienname", TargetField::LastName),
    // email
    ("email", TargetField::Email),
    ("e-mail", TargetField::Email),
    ("email address", TargetField::Email),
    ("mail", TargetField::Email),
    ("emailová adresa", TargetField::Email),
    ("courriel", TargetField::Email),
    ("adresse e-mail", TargetField::Email),
    ("e-mail-adresse", TargetField::Email),
    // phone
    ("phone", TargetField::Phone),
    ("phone number", TargetField::Phone),
    ("telephone", TargetField::Phone),
    ("mobile", TargetField::Phone),
    ("cell", TargetField::Phone),
    ("tel", TargetField::Phone),
    ("telefon", TargetField::Phone),
    ("mobil", TargetField::Phone),
    ("telefonní číslo", TargetField::Phone),
    ("téléphone", TargetField::Phone),
    ("portable", TargetField::Phone),
    ("telefonnummer", TargetField::Phone),
    ("handy", TargetField::Phone),
    // company
    ("company", TargetField::Company),
    ("organization", TargetField::Company),
    ("organisation", TargetField::Company),
    ("firma", TargetField::Company),
    ("společnost", TargetField::Company),
    ("société", TargetField::Company),
    ("entreprise", TargetField::Company),
    ("unternehmen", TargetField::Company),
    // job title
    ("job title", TargetField::JobTitle),
    ("title", TargetField::JobTitle),
    ("position", TargetField::JobTitle),
    ("role", TargetField::JobTitle),
    ("pozice", TargetField::JobTitle),
    ("funkce", TargetField::JobTitle),
    ("poste", TargetField::JobTitle),
    ("fonction", TargetField::JobTitle),
    ("berufsbezeichnung", TargetField::JobTitle),
    // street
    ("street", TargetField::Street),
    ("address", TargetField::Street),
    ("street address", TargetField::Street),
    ("ulice", TargetField::Street),
    ("adresa", TargetField::Street),
    ("rue", TargetField::Street),
    ("adresse", TargetField::Street),
    ("straße", TargetField::Street),
    // city
    ("city", TargetField::City),
    ("town", TargetField::City),
    ("město", TargetField::City),
    ("obec", TargetField::City),
    ("ville", TargetField::City),
    ("stadt", TargetField::City),
    ("ort", TargetField::City),
    // postal code
    ("postal code", TargetField::PostalCode),
    ("postcode", TargetField::PostalCode),
    ("zip", TargetField::PostalCode),
    ("zip code", TargetField::PostalCode),
    ("psč", TargetField::PostalCode),
    ("code postal", TargetField::PostalCode),
    ("postleitzahl", TargetField::PostalCode),
    ("plz", TargetField::PostalCode),
    // country
    ("country", TargetField::Country),
    ("země", TargetField::Country),
    ("stát", TargetField::Country),
    ("pays", TargetField::Country),
    ("land", TargetField::Country),
    // notes
    ("notes", TargetField::Notes),
    ("note", TargetField::Notes),
    ("comment", TargetField::Notes),
    ("poznámka", TargetField::Notes),
    ("poznámky", TargetField::Notes),
    ("remarque", TargetField::Notes),
    ("commentaire", TargetField::Notes),
    ("notiz", TargetField::Notes),
    ("bemerkung", TargetField::Notes),
];

/// Confidence of a content match on email-shaped samples
const EMAIL_CONTENT_CONFIDENCE: f64 = 0.9;
/// Confidence of a content match on phone-shaped samples
const PHONE_CONTENT_CONFIDENCE: f64 = 0.8;
/// Share of non-empty samples that must look alike
const CONTENT_MATCH_RATIO: f64 = 0.8;
/// Aliases shorter than this only match whole words
const SHORT_ALIAS_LEN: usize = 5;
const MAX_SAMPLE_VALUES: usize = 3;
const MAX_ALTERNATIVES: usize = 3;

struct Alias {
    words: Vec<String>,
    compact: String,
    field: TargetField,
}

pub struct AutoMapper {
    aliases: Vec<Alias>,
    min_confidence: f64,
}

impl AutoMapper {
    pub fn new(min_confidence: f64) -> Self {
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(alias, field)| Alias::new(alias, *field))
            .collect();
        Self {
            aliases,
            min_confidence,
        }
    }

    /// Add site-specific aliases on top of the built-in dictionary
    pub fn with_extra_aliases(mut self, extra: &[(String, TargetField)]) -> Self {
        self.aliases
            .extend(extra.iter().map(|(alias, field)| Alias::new(alias, *field)));
        self
    }

    /// Suggest a mapping for `headers`. `samples` are data rows in header order.
    pub fn suggest(&self, headers: &[String], samples: &[Vec<String>]) -> ColumnMapping {
        // Pass 1: raw candidates per column
        let columns: Vec<(Vec<FieldCandidate>, Vec<String>)> = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                let values: Vec<String> = samples
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                (self.candidates(header, &values), values)
            })
            .collect();

        // Pass 2: greedy claim in descending confidence order
        let mut order: Vec<usize> = (0..headers.len()).collect();
        order.sort_by(|&a, &b| {
            let best = |i: usize| columns[i].0.first().map_or(0.0, |c| c.confidence);
            best(b).total_cmp(&best(a)).then(a.cmp(&b))
        });

        let mut claimed: HashSet<TargetField> = HashSet::new();
        let mut chosen: Vec<Option<FieldCandidate>> = vec![None; headers.len()];
        for idx in order {
            let pick = columns[idx]
                .0
                .iter()
                .filter(|c| c.confidence >= self.min_confidence)
                .find(|c| !claimed.contains(&c.field));
            if let Some(candidate) = pick {
                claimed.insert(candidate.field);
                chosen[idx] = Some(candidate.clone());
            }
        }

        let entries = headers
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                let (candidates, values) = &columns[idx];
                let target = chosen[idx].as_ref();
                ColumnMappingEntry {
                    source_column: header.clone(),
                    source_index: idx,
                    target_field: target.map(|c| c.field),
                    confidence: target.map_or(0.0, |c| c.confidence),
                    is_manual: false,
                    sample_values: values.iter().take(MAX_SAMPLE_VALUES).cloned().collect(),
                    alternatives: candidates
                        .iter()
                        .filter(|c| Some(c.field) != target.map(|t| t.field))
                        .take(MAX_ALTERNATIVES)
                        .cloned()
                        .collect(),
                }
            })
            .collect();

        ColumnMapping(entries)
    }

    /// Ranked candidates for one column, best first, one per field
    fn candidates(&self, header: &str, values: &[String]) -> Vec<FieldCandidate> {
        let normalized = normalize_header(header);
        let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();
        let compact: String = words.concat();

        let mut best: Vec<FieldCandidate> = Vec::new();
        let mut offer = |field: TargetField, confidence: f64| {
            match best.iter_mut().find(|c| c.field == field) {
                Some(existing) if existing.confidence >= confidence => {}
                Some(existing) => existing.confidence = confidence,
                None => best.push(FieldCandidate { field, confidence }),
            }
        };

        if !compact.is_empty() {
            for alias in &self.aliases {
                if let Some(score) = alias.score(&words, &compact) {
                    offer(alias.field, score);
                }
            }
        }

        if let Some((field, confidence)) = content_candidate(values) {
            offer(field, confidence);
        }

        best.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        best
    }
}

impl Alias {
    fn new(alias: &str, field: TargetField) -> Self {
        let normalized = normalize_header(alias);
        let words: Vec<String> = normalized.split(' ').map(str::to_string).collect();
        Self {
            compact: words.concat(),
            words,
            field,
        }
    }

    fn score(&self, header_words: &[&str], header_compact: &str) -> Option<f64> {
        if self.compact == header_compact {
            return Some(1.0);
        }

        let (shorter, longer) = if self.compact.len() <= header_compact.len() {
            (self.compact.as_str(), header_compact)
        } else {
            (header_compact, self.compact.as_str())
        };
        if shorter.len() < 3 {
            return None;
        }

        let contained = if shorter.len() < SHORT_ALIAS_LEN {
            // short tokens like "tel" or "nom" must stand alone
            header_words.iter().any(|w| *w == self.compact)
                || self.words.iter().any(|w| w == header_compact)
        } else {
            longer.contains(shorter)
        };

        contained.then(|| 0.6 + 0.4 * (shorter.len() as f64 / longer.len() as f64))
    }
}

/// Candidate derived from what the values look like
fn content_candidate(values: &[String]) -> Option<(TargetField, f64)> {
    if values.is_empty() {
        return None;
    }
    let share = |pred: fn(&str) -> bool| {
        values.iter().filter(|v| pred(v.as_str())).count() as f64 / values.len() as f64
    };

    if share(looks_like_email) >= CONTENT_MATCH_RATIO {
        Some((TargetField::Email, EMAIL_CONTENT_CONFIDENCE))
    } else if share(looks_like_phone) >= CONTENT_MATCH_RATIO {
        Some((TargetField::Phone, PHONE_CONTENT_CONFIDENCE))
    } else {
        None
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !value.contains(' ')
        }
        None => false,
    }
}

fn looks_like_phone(value: &str) -> bool {
    let body = value.trim().strip_prefix('+').unwrap_or(value.trim());
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.' | '(' | ')' | '/'))
    {
        return false;
    }
    let digits = body.chars().filter(|c| c.is_ascii_digit()).count();
    (8..=15).contains(&digits)
}

/// Case-fold, strip diacritics and punctuation, collapse spaces
pub fn normalize_header(header: &str) -> String {
    let mut folded = String::with_capacity(header.len());
    for c in header.trim_start_matches('\u{feff}').chars().flat_map(char::to_lowercase) {
        match fold_char(c) {
            Folded::One(f) => folded.push(f),
            Folded::Two(a, b) => {
                folded.push(a);
                folded.push(b);
            }
        }
    }
    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

enum Folded {
    One(char),
    Two(char, char),
}

fn fold_char(c: char) -> Folded {
    let f = match c {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' => 'a',
        'č' | 'ç' | 'ć' => 'c',
        'ď' => 'd',
        'é' | 'ě' | 'è' | 'ê' | 'ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'ľ' | 'ĺ' => 'l',
        'ň' | 'ñ' => 'n',
        'ó' | 'ô' | 'ö' | 'ò' | 'õ' => 'o',
        'ř' => 'r',
        'š' => 's',
        'ť' => 't',
        'ú' | 'ů' | 'ü' | 'ù' | 'û' => 'u',
        'ý' | 'ÿ' => 'y',
        'ž' => 'z',
        'ß' => return Folded::Two('s', 's'),
        'æ' => return Folded::Two('a', 'e'),
        'œ' => return Folded::Two('o', 'e'),
        other => other,
    };
    Folded::One(f)
}
