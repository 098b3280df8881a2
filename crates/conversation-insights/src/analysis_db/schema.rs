//! Record types persisted by the analysis database
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one queued analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Which responses the Embedding stage covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Full,
    Incremental,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Conversation-level progress as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    NotStarted,
    Embedding,
    Analyzing,
    Ready,
    Error,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Embedding => "embedding",
            Self::Analyzing => "analyzing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "embedding" => Ok(Self::Embedding),
            "analyzing" => Ok(Self::Analyzing),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown analysis status '{}'", other)),
        }
    }
}

macro_rules! text_enum_sql {
    ($($ty:ty),*) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

text_enum_sql!(JobStatus, Strategy, AnalysisStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Input row for response import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResponse {
    pub text: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// One submitted opinion, with the columns each stage fills in.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub tag: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub cluster_index: Option<u32>,
    pub is_outlier: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: String,
    pub conversation_id: String,
    pub status: JobStatus,
    pub strategy: Strategy,
    pub attempts: u32,
    pub lock_owner: Option<String>,
    pub lock_heartbeat_ms: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationAnalysisState {
    pub conversation_id: String,
    pub status: AnalysisStatus,
    pub error: Option<String>,
    pub analyzed_response_count: u64,
    pub last_analyzed_at: Option<DateTime<Utc>>,
}

impl ConversationAnalysisState {
    pub fn not_started(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            status: AnalysisStatus::NotStarted,
            error: None,
            analyzed_response_count: 0,
            last_analyzed_at: None,
        }
    }

    pub fn has_successful_run(&self) -> bool {
        self.last_analyzed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub cluster_index: u32,
    pub name: String,
    pub description: String,
    pub size: usize,
    pub avg_cohesion: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityGroup {
    pub id: String,
    pub cluster_index: u32,
    pub representative_response_id: String,
    pub member_ids: Vec<String>,
    pub consolidated_statement: String,
    pub combined_text: String,
}

/// Per-response output of the Projection + Clustering stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePlacement {
    pub response_id: String,
    pub x: f32,
    pub y: f32,
    pub cluster_index: u32,
    pub is_outlier: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub total_responses: i64,
    pub total_jobs: i64,
    pub total_themes: i64,
    pub total_similarity_groups: i64,
    pub database_size_bytes: i64,
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn encode_embedding(embedding: &[f32]) -> bincode::Result<Vec<u8>> {
    bincode::serialize(embedding)
}

pub(crate) fn decode_embedding(idx: usize, bytes: &[u8]) -> rusqlite::Result<Vec<f32>> {
    bincode::deserialize(bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            AnalysisStatus::NotStarted,
            AnalysisStatus::Embedding,
            AnalysisStatus::Analyzing,
            AnalysisStatus::Ready,
            AnalysisStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<AnalysisStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_job_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn embedding_blob_decodes() {
        let bytes = encode_embedding(&[0.25, -1.0, 3.5]).unwrap();
        assert_eq!(decode_embedding(0, &bytes).unwrap(), vec![0.25, -1.0, 3.5]);
    }
}
