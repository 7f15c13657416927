use axum::{
    http::{header::RETRY_AFTER, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{codes::SystemCode, models::ErrorArtifact};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing or invalid request body")]
    MissingBody,
    #[error("API key is required")]
    MissingApiKey,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid GeoJSON: {}", .0.join("; "))]
    InvalidGeoJson(Vec<String>),
    #[error("too many concurrent analyses (limit {limit})")]
    TooManyConcurrent { limit: u32 },
    #[error("too many geometries: {count} exceeds limit {limit}")]
    TooManyGeometries { count: usize, limit: usize },
    #[error("external id column `{column}` not found")]
    InvalidExternalIdColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("analysis failed: {0}")]
    Execution(String),
    #[error("analysis timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AnalysisError {
    pub fn code(&self) -> SystemCode {
        match self {
            Self::MissingBody => SystemCode::SystemMissingRequestBody,
            Self::MissingApiKey => SystemCode::AuthMissingApiKey,
            Self::InvalidApiKey => SystemCode::AuthInvalidApiKey,
            Self::RateLimited { .. } => SystemCode::AuthRateLimitExceeded,
            Self::InvalidGeoJson(_) => SystemCode::ValidationInvalidGeojson,
            Self::TooManyConcurrent { .. } => SystemCode::AnalysisTooManyConcurrent,
            Self::TooManyGeometries { .. } => SystemCode::ValidationTooManyGeometries,
            Self::InvalidExternalIdColumn { .. } => SystemCode::ValidationInvalidExternalIdColumn,
            Self::Execution(_) => SystemCode::AnalysisError,
            Self::Timeout { .. } => SystemCode::AnalysisTimeout,
            Self::Internal(_) => SystemCode::SystemInternalServerError,
        }
    }

    pub fn format_args(&self) -> Vec<String> {
        match self {
            Self::RateLimited { retry_after_secs } => vec![retry_after_secs.to_string()],
            Self::InvalidGeoJson(errors) => vec![errors.join("\n")],
            Self::TooManyGeometries { limit, .. } => vec![limit.to_string()],
            Self::InvalidExternalIdColumn { column, available } => {
                vec![column.clone(), available.join(", ")]
            }
            Self::Timeout { timeout_ms } => vec![(timeout_ms / 1000).to_string()],
            _ => Vec::new(),
        }
    }

    fn cause(&self) -> Option<String> {
        match self {
            Self::Execution(detail) => Some(detail.clone()),
            Self::Internal(err) => Some(format!("{err:#}")),
            _ => None,
        }
    }

    /// Public message: the code's template filled with this error's arguments.
    pub fn public_message(&self) -> String {
        self.code().format(self.format_args().as_slice())
    }

    pub fn to_artifact(&self) -> ErrorArtifact {
        let code = match self.code() {
            SystemCode::AnalysisTimeout => SystemCode::AnalysisTimeout,
            _ => SystemCode::AnalysisError,
        };
        ErrorArtifact {
            code,
            error: code.message(),
            format_args: if code == SystemCode::AnalysisTimeout {
                self.format_args()
            } else {
                Vec::new()
            },
            cause: self.cause().or_else(|| Some(self.to_string())),
        }
    }
}

impl IntoResponse for AnalysisError {
    fn into_response(self) -> Response {
        if let Self::Internal(err) = &self {
            error!("Internal error: {err:#}");
        }

        let code = self.code();
        let body = Json(json!({
            "code": code,
            "message": self.public_message(),
        }));
        let mut response = (code.http_status(), body).into_response();
        if let Self::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}
