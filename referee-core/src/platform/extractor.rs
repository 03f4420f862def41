use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::browser::{BrowserError, BrowserSession, ErrorCategorizer};
use crate::failure::{ErrorKind, ExtractionError};

use super::PlatformSpec;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("malformed extraction payload: {0}")]
    Malformed(String),
    #[error("extraction did not finish within {0}s")]
    Timeout(u64),
}

pub type ExtractorResult<T> = Result<T, ExtractorError>;

impl ExtractorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractorError::Browser(err) => ErrorCategorizer::categorize(err),
            ExtractorError::Malformed(_) => ErrorKind::UnexpectedPageState,
            ExtractorError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_engine_failure(&self) -> bool {
        matches!(self, ExtractorError::Browser(err) if err.is_engine_failure())
    }

    pub fn to_extraction_error(&self, step: &str) -> ExtractionError {
        ExtractionError::new(self.kind(), self.to_string()).at_step(step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Manuscript,
    Referee,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Manuscript => "manuscript",
            RecordKind::Referee => "referee",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record as scraped; field semantics belong to the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub external_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Turns an authenticated context into raw records.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        session: &mut dyn BrowserSession,
        platform: &PlatformSpec,
    ) -> ExtractorResult<Vec<RawRecord>>;
}

/// Navigates to the platform's listing page and evaluates its configured
/// script, which must return an array of records.
#[derive(Debug, Clone, Default)]
pub struct ScriptExtractor;

impl ScriptExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_payload(payload: Value) -> ExtractorResult<Vec<RawRecord>> {
        let items = match payload {
            Value::Array(items) => items,
            other => {
                return Err(ExtractorError::Malformed(format!(
                    "expected an array, got {}",
                    value_type(&other)
                )))
            }
        };
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let record: RawRecord = serde_json::from_value(item).map_err(|err| {
                    ExtractorError::Malformed(format!("record {index}: {err}"))
                })?;
                if record.external_id.trim().is_empty() {
                    return Err(ExtractorError::Malformed(format!(
                        "record {index} has an empty external_id"
                    )));
                }
                Ok(record)
            })
            .collect()
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl Extractor for ScriptExtractor {
    async fn extract(
        &self,
        session: &mut dyn BrowserSession,
        platform: &PlatformSpec,
    ) -> ExtractorResult<Vec<RawRecord>> {
        session.navigate(&platform.extraction.url).await?;
        let payload = session.evaluate_json(&platform.extraction.script).await?;
        let records = Self::parse_payload(payload)?;
        debug!(platform = %platform.id, records = records.len(), "extraction script finished");
        Ok(records)
    }
}
