//! Tunables used when the environment does not override them

/// Rows per parse chunk (one checkpoint each)
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Valid rows per commit batch (one checkpoint each)
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Page size of the contact scan that builds the store dedupe index
pub const DEFAULT_DEDUPE_PAGE_SIZE: i64 = 1000;

/// Auto-mapper threshold below which a column stays unmapped
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.7;

/// Calling code applied to national phone numbers
pub const DEFAULT_PHONE_COUNTRY_CODE: &str = "420";

/// Upload size limit (25 MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Rows sampled from the file for auto-mapping and the wizard preview
pub const SAMPLE_ROWS: usize = 5;

/// Lifetime of signed file URLs
pub const FILE_URL_TTL_SECONDS: i64 = 15 * 60;
