//! Configuration management

use std::path::PathBuf;

use anyhow::{self, Context, Result};

use crate::defaults;
use crate::types::TargetField;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// JWT secret key for token validation
    pub jwt_secret: String,

    /// Root directory of the local object storage
    pub storage_root: PathBuf,

    /// Key used to sign file retrieval URLs
    pub storage_signing_key: String,

    /// Pipeline tunables
    pub import: ImportSettings,
}

/// Tunables of the parse and commit workers
#[derive(Debug, Clone, PartialEq)]
pub struct ImportSettings {
    pub chunk_size: usize,
    pub batch_size: usize,
    pub dedupe_page_size: i64,
    pub min_confidence: f64,
    pub phone_country_code: String,
    pub max_upload_bytes: usize,
    /// Site-specific header aliases on top of the built-in dictionary
    pub extra_aliases: Vec<(String, TargetField)>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            chunk_size: defaults::DEFAULT_CHUNK_SIZE,
            batch_size: defaults::DEFAULT_BATCH_SIZE,
            dedupe_page_size: defaults::DEFAULT_DEDUPE_PAGE_SIZE,
            min_confidence: defaults::DEFAULT_MIN_CONFIDENCE,
            phone_country_code: defaults::DEFAULT_PHONE_COUNTRY_CODE.to_string(),
            max_upload_bytes: defaults::DEFAULT_MAX_UPLOAD_BYTES,
            extra_aliases: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nats_url = var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let database_url = var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let jwt_secret = var("JWT_SECRET")
            .context("JWT_SECRET must be set; generate one with: openssl rand -base64 48")?;

        if jwt_secret.len() < 32 {
            anyhow::bail!(
                "JWT_SECRET must be at least 32 bytes (current: {} bytes). Generate one with: openssl rand -base64 48",
                jwt_secret.len()
            );
        }

        let storage_root = PathBuf::from(var("STORAGE_ROOT").unwrap_or_else(|| "../storage".to_string()));

        let storage_signing_key = match var("STORAGE_SIGNING_KEY") {
            Some(key) if !key.is_empty() => key,
            _ => {
                tracing::warn!("STORAGE_SIGNING_KEY not set, signing file URLs with JWT_SECRET");
                jwt_secret.clone()
            }
        };

        let mut import = ImportSettings::default();
        if let Some(v) = var("IMPORT_CHUNK_SIZE") {
            import.chunk_size = parse_positive(&v).context("IMPORT_CHUNK_SIZE must be a positive integer")?;
        }
        if let Some(v) = var("IMPORT_BATCH_SIZE") {
            import.batch_size = parse_positive(&v).context("IMPORT_BATCH_SIZE must be a positive integer")?;
        }
        if let Some(v) = var("IMPORT_DEDUPE_PAGE_SIZE") {
            import.dedupe_page_size = parse_positive(&v)
                .context("IMPORT_DEDUPE_PAGE_SIZE must be a positive integer")? as i64;
        }
        if let Some(v) = var("IMPORT_MIN_CONFIDENCE") {
            let value: f64 = v.trim().parse().context("IMPORT_MIN_CONFIDENCE must be a number")?;
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("IMPORT_MIN_CONFIDENCE must be within [0, 1], got {}", value);
            }
            import.min_confidence = value;
        }
        if let Some(v) = var("DEFAULT_PHONE_COUNTRY_CODE") {
            let code = v.trim().trim_start_matches('+').to_string();
            if code.is_empty() || code.len() > 3 || !code.chars().all(|c| c.is_ascii_digit()) {
                anyhow::bail!("DEFAULT_PHONE_COUNTRY_CODE must be 1-3 digits, got '{}'", v);
            }
            import.phone_country_code = code;
        }
        if let Some(v) = var("MAX_UPLOAD_BYTES") {
            import.max_upload_bytes = parse_positive(&v).context("MAX_UPLOAD_BYTES must be a positive integer")?;
        }
        if let Some(v) = var("IMPORT_EXTRA_ALIASES") {
            import.extra_aliases = parse_aliases(&v)?;
        }

        Ok(Self {
            nats_url,
            database_url,
            jwt_secret,
            storage_root,
            storage_signing_key,
            import,
        })
    }
}

fn parse_positive(value: &str) -> Result<usize> {
    let n: usize = value.trim().parse()?;
    if n == 0 {
        anyhow::bail!("value must be greater than zero");
    }
    Ok(n)
}

/// Parse `alias=field` pairs separated by commas, e.g. `mobil=phone,firma=company`
fn parse_aliases(value: &str) -> Result<Vec<(String, TargetField)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (alias, field) = pair
                .split_once('=')
                .with_context(|| format!("IMPORT_EXTRA_ALIASES entry '{}' must look like alias=field", pair))?;
            let field = TargetField::parse(field.trim())
                .with_context(|| format!("IMPORT_EXTRA_ALIASES: unknown target field '{}'", field.trim()))?;
            Ok((alias.trim().to_string(), field))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "test-secret-key-for-jwt-at-least-32-bytes-long";

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://test"), ("JWT_SECRET", SECRET)]).unwrap();
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.import, ImportSettings::default());
        assert_eq!(config.import.chunk_size, 500);
        assert_eq!(config.import.batch_size, 100);
        assert_eq!(config.import.phone_country_code, "420");
        // falls back to the JWT secret
        assert_eq!(config.storage_signing_key, SECRET);
    }

    #[test]
    fn test_config_requires_database_url() {
        assert!(load(&[("JWT_SECRET", SECRET)]).is_err());
    }

    #[test]
    fn test_config_rejects_short_jwt_secret() {
        let err = load(&[("DATABASE_URL", "postgres://test"), ("JWT_SECRET", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least 32 bytes"));
    }

    #[test]
    fn test_config_import_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://test"),
            ("JWT_SECRET", SECRET),
            ("IMPORT_CHUNK_SIZE", "50"),
            ("IMPORT_BATCH_SIZE", "10"),
            ("IMPORT_MIN_CONFIDENCE", "0.8"),
            ("DEFAULT_PHONE_COUNTRY_CODE", "+421"),
            ("IMPORT_EXTRA_ALIASES", "mobil=phone, firma=company"),
        ])
        .unwrap();
        assert_eq!(config.import.chunk_size, 50);
        assert_eq!(config.import.batch_size, 10);
        assert_eq!(config.import.min_confidence, 0.8);
        assert_eq!(config.import.phone_country_code, "421");
        assert_eq!(
            config.import.extra_aliases,
            vec![
                ("mobil".to_string(), TargetField::Phone),
                ("firma".to_string(), TargetField::Company),
            ]
        );
    }

    #[test]
    fn test_config_rejects_zero_chunk_size() {
        let result = load(&[
            ("DATABASE_URL", "postgres://test"),
            ("JWT_SECRET", SECRET),
            ("IMPORT_CHUNK_SIZE", "0"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_rejects_unknown_alias_field() {
        let result = load(&[
            ("DATABASE_URL", "postgres://test"),
            ("JWT_SECRET", SECRET),
            ("IMPORT_EXTRA_ALIASES", "fax=fax_number"),
        ]);
        assert!(result.is_err());
    }
}
