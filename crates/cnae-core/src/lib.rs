//! Core record model, validation rules and batching for CNAE ingestion.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cnae-core";

/// Batch size used for one remote upsert call.
pub const DEFAULT_DELIVERY_BATCH_SIZE: usize = 100;

/// Number of `VALUES` rows rendered per flushed chunk of an upsert script.
pub const DEFAULT_SQL_CHUNK_SIZE: usize = 500;

/// Normalized classification triple. `code` is the natural key of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub code: String,
    pub sector: String,
    pub category: String,
}

impl Record {
    /// Builds a record from raw candidate fields, trimming each one.
    pub fn new(
        code: impl AsRef<str>,
        sector: impl AsRef<str>,
        category: impl AsRef<str>,
        mode: ValidationMode,
    ) -> Result<Self, RecordRejection> {
        let code = code.as_ref().trim();
        let sector = sector.as_ref().trim();
        let category = category.as_ref().trim();

        if code.is_empty() {
            return Err(RecordRejection::EmptyField("code"));
        }
        if sector.is_empty() {
            return Err(RecordRejection::EmptyField("sector"));
        }
        if category.is_empty() {
            return Err(RecordRejection::EmptyField("category"));
        }
        mode.check_code(code)?;

        Ok(Self {
            code: code.to_string(),
            sector: sector.to_string(),
            category: category.to_string(),
        })
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} / {})", self.code, self.sector, self.category)
    }
}

/// How much structure a code must show before a record is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Non-empty fields only.
    #[default]
    Lenient,
    /// Code must contain a `-` or `/` separator.
    Strict,
    /// Code must have the CNAE subclass shape `DDDD-D/DD`.
    Structural,
}

impl ValidationMode {
    pub fn check_code(self, code: &str) -> Result<(), RecordRejection> {
        match self {
            ValidationMode::Lenient => Ok(()),
            ValidationMode::Strict => {
                if code.contains(['-', '/']) {
                    Ok(())
                } else {
                    Err(RecordRejection::MissingSeparator(code.to_string()))
                }
            }
            ValidationMode::Structural => {
                if is_subclass_shape(code) {
                    Ok(())
                } else {
                    Err(RecordRejection::BadShape(code.to_string()))
                }
            }
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" | "permissive" => Ok(ValidationMode::Lenient),
            "strict" => Ok(ValidationMode::Strict),
            "structural" => Ok(ValidationMode::Structural),
            other => Err(IngestError::Configuration(format!(
                "unknown validation mode `{other}` (expected lenient, strict or structural)"
            ))),
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::Lenient => write!(f, "lenient"),
            ValidationMode::Strict => write!(f, "strict"),
            ValidationMode::Structural => write!(f, "structural"),
        }
    }
}

fn is_subclass_shape(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 9
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5].is_ascii_digit()
        && bytes[6] == b'/'
        && bytes[7..].iter().all(u8::is_ascii_digit)
}

/// Why a candidate line could not become a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RecordRejection {
    #[error("{0} field is empty")]
    EmptyField(&'static str),
    #[error("expected at least 3 fields, found {0}")]
    TooFewFields(usize),
    #[error("code `{0}` has no '-' or '/' separator")]
    MissingSeparator(String),
    #[error("code `{0}` does not match DDDD-D/DD")]
    BadShape(String),
}

/// Error taxonomy of an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("line {line}: {reason}")]
    MalformedLine { line: usize, reason: RecordRejection },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("batch {batch} failed: {message}")]
    BatchDelivery { batch: usize, message: String },
    #[error("record {code} failed: {message}")]
    RecordDelivery { code: String, message: String },
    #[error("no valid records found in input")]
    EmptyInput,
    #[error("record sink unreachable: {0}")]
    SinkUnreachable(String),
}

/// Contiguous slice of records handed to one persistence call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch<'a> {
    pub index: usize,
    pub records: &'a [Record],
}

impl<'a> Batch<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Partitions records into order-preserving batches of `size`; the last batch may be shorter.
pub fn batch(records: &[Record], size: usize) -> Result<Vec<Batch<'_>>, IngestError> {
    if size == 0 {
        return Err(IngestError::Configuration(
            "batch size must be at least 1".to_string(),
        ));
    }
    Ok(records
        .chunks(size)
        .enumerate()
        .map(|(index, records)| Batch { index, records })
        .collect())
}

/// One record per code, borrowed: the values of the last occurrence at the position of the first.
///
/// Also returns how many duplicates were folded away.
pub fn latest_by_code(records: &[Record]) -> (Vec<&Record>, usize) {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&Record> = Vec::with_capacity(records.len());
    let mut collapsed = 0usize;

    for record in records {
        match positions.get(record.code.as_str()) {
            Some(&idx) => {
                debug!(code = %record.code, "later duplicate overrides earlier record");
                out[idx] = record;
                collapsed += 1;
            }
            None => {
                positions.insert(record.code.as_str(), out.len());
                out.push(record);
            }
        }
    }

    (out, collapsed)
}

/// Owned variant of [`latest_by_code`].
pub fn collapse_duplicates(records: Vec<Record>) -> (Vec<Record>, usize) {
    let folded = match latest_by_code(&records) {
        (_, 0) => None,
        (latest, collapsed) => Some((latest.into_iter().cloned().collect(), collapsed)),
    };
    folded.unwrap_or((records, 0))
}
