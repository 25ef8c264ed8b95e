use super::DatabaseError;
use crate::core::annotate::AnnotationResult;
use crate::storage::ObjectStore;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Image models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub owner_id: String,
    pub filename: String,
    pub original_path: String,
    pub thumbnail_path: Option<String>,
    pub file_size: i64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub owner_id: String,
    pub filename: String,
    pub original_path: String,
    pub thumbnail_path: Option<String>,
    pub file_size: i64,
    pub mime_type: String,
}

// Annotation models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    /// Status only moves forward. Rewriting the current status is allowed and a
    /// failed annotation may be completed by a later run.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;

        match (self, next) {
            (current, next) if *current == next => true,
            (Pending, Processing | Completed | Failed) => true,
            (Processing, Completed | Failed) => true,
            (Failed, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(DatabaseError::InvalidData(format!(
                "unknown processing status '{}'",
                other
            ))),
        }
    }
}

impl ToSql for ProcessingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProcessingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: DatabaseError| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub image_id: i64,
    pub owner_id: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub colors: Vec<String>,
    pub status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full replacement of an annotation row, keyed by image id.
#[derive(Debug, Clone)]
pub struct AnnotationUpdate {
    pub image_id: i64,
    pub owner_id: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub colors: Vec<String>,
    pub status: ProcessingStatus,
}

impl AnnotationUpdate {
    pub fn completed(image_id: i64, owner_id: &str, result: &AnnotationResult) -> Self {
        Self {
            image_id,
            owner_id: owner_id.to_string(),
            description: Some(result.description.clone()),
            tags: result.tags.clone(),
            colors: result.colors.clone(),
            status: ProcessingStatus::Completed,
        }
    }
}

/// An image joined with its annotation, if it has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image: Image,
    pub annotation: Option<Annotation>,
}

impl ImageRecord {
    pub fn tags(&self) -> &[String] {
        self.annotation
            .as_ref()
            .map(|a| a.tags.as_slice())
            .unwrap_or_default()
    }

    pub fn colors(&self) -> &[String] {
        self.annotation
            .as_ref()
            .map(|a| a.colors.as_slice())
            .unwrap_or_default()
    }
}

/// Read model handed to callers: the record plus publicly fetchable URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageView {
    #[serde(flatten)]
    pub image: Image,
    pub annotation: Option<Annotation>,
    pub original_url: String,
    pub thumbnail_url: Option<String>,
}

impl ImageView {
    pub fn resolve(record: ImageRecord, store: &dyn ObjectStore) -> Self {
        let original_url = store.public_url(&record.image.original_path);
        let thumbnail_url = record
            .image
            .thumbnail_path
            .as_deref()
            .map(|path| store.public_url(path));

        Self {
            image: record.image,
            annotation: record.annotation,
            original_url,
            thumbnail_url,
        }
    }

    pub fn resolve_all(records: Vec<ImageRecord>, store: &dyn ObjectStore) -> Vec<Self> {
        records
            .into_iter()
            .map(|record| Self::resolve(record, store))
            .collect()
    }
}

pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("bad timestamp '{}': {}", raw, e)))
}
