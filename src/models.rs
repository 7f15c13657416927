use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codes::SystemCode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOptions {
    #[serde(default)]
    pub r#async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_column: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A GeoJSON FeatureCollection with the analysis options attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
    #[serde(default)]
    pub analysis_options: AnalysisOptions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisRequest {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.kind != "FeatureCollection" {
            errors.push(format!(
                "- Expected type \"FeatureCollection\", got \"{}\"",
                self.kind
            ));
        }
        for (idx, feature) in self.features.iter().enumerate() {
            if feature.kind != "Feature" {
                errors.push(format!("- Feature {idx} must have type \"Feature\""));
            }
            if !feature.geometry.is_object() {
                errors.push(format!("- Feature {idx} is missing a geometry object"));
            }
        }
        errors
    }

    /// Property names present on every feature, sorted.
    pub fn common_property_names(&self) -> Vec<String> {
        let mut features = self.features.iter();
        let Some(first) = features.next() else {
            return Vec::new();
        };
        let mut common: BTreeSet<String> = first.properties.keys().cloned().collect();
        for feature in features {
            common.retain(|key| feature.properties.contains_key(key));
        }
        common.into_iter().collect()
    }

    pub fn has_common_property(&self, column: &str) -> bool {
        !self.features.is_empty()
            && self
                .features
                .iter()
                .all(|feature| feature.properties.contains_key(column))
    }
}

/// Durable lifecycle status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "analysis_processing")]
    Processing,
    #[serde(rename = "analysis_completed")]
    Completed,
    #[serde(rename = "analysis_error")]
    Error,
    #[serde(rename = "analysis_timeout")]
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn code(&self) -> SystemCode {
        match self {
            Self::Processing => SystemCode::AnalysisProcessing,
            Self::Completed => SystemCode::AnalysisCompleted,
            Self::Error => SystemCode::AnalysisError,
            Self::Timeout => SystemCode::AnalysisTimeout,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "analysis_processing" => Some(Self::Processing),
            "analysis_completed" => Some(Self::Completed),
            "analysis_error" => Some(Self::Error),
            "analysis_timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

/// Identity attached to a request through its API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub owner: String,
    pub max_concurrent_analyses: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub token: String,
    pub owner: Option<String>,
    pub status: JobStatus,
    pub feature_count: u64,
    pub analysis_options: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysisJob {
    pub token: String,
    pub owner: String,
    pub feature_count: u64,
    pub analysis_options: Option<Value>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a durable job row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
    pub error_message: Option<String>,
    pub feature_count: Option<u64>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.timeout_ms.is_none()
            && self.error_message.is_none()
            && self.feature_count.is_none()
    }
}

/// Volatile progress detail kept in the job cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    pub feature_count: u64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub process_status_messages: Vec<String>,
}

/// Payload pushed on the notification bus and written as SSE `data:` lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEvent {
    pub code: SystemCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

impl StatusEvent {
    pub fn progress(data: Option<Value>) -> Self {
        Self {
            code: SystemCode::AnalysisProcessing,
            message: Some(SystemCode::AnalysisProcessing.message()),
            data,
            is_final: false,
        }
    }

    pub fn terminal(reply: StatusReply) -> Self {
        Self {
            code: reply.code,
            message: Some(reply.message),
            data: reply.data,
            is_final: true,
        }
    }

    pub fn into_reply(self) -> StatusReply {
        let message = self.message.unwrap_or_else(|| self.code.message());
        StatusReply {
            code: self.code,
            message,
            data: self.data,
        }
    }
}

/// Body of `GET /api/status/{token}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReply {
    pub code: SystemCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StatusReply {
    pub fn new(code: SystemCode, data: Option<Value>) -> Self {
        Self {
            code,
            message: code.message(),
            data,
        }
    }
}

/// Contents of `<token>-error.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorArtifact {
    pub code: SystemCode,
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorArtifact {
    pub fn to_reply(&self) -> StatusReply {
        let message = if self.format_args.is_empty() {
            self.code.message()
        } else {
            self.code.format(self.format_args.as_slice())
        };
        StatusReply {
            code: self.code,
            message,
            data: self
                .cause
                .as_ref()
                .map(|cause| serde_json::json!({ "cause": cause })),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub token: String,
    pub status_url: String,
    pub feature_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total: u64,
    pub last24h: u64,
    pub last7d: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsTimings {
    pub avg_run_ms: Option<f64>,
    pub p50_run_ms: Option<f64>,
    pub avg_queue_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecentJob {
    pub token: String,
    pub status: JobStatus,
    pub feature_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub results_available: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub summary: StatsSummary,
    pub status_counts: StatusCounts,
    pub timings: StatsTimings,
    pub recent_jobs: Vec<RecentJob>,
}
