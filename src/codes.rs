use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Machine-readable outcome codes shared by every response body, status
/// event and error artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemCode {
    SystemInternalServerError,
    SystemMissingRequestBody,
    AuthInvalidApiKey,
    AuthMissingApiKey,
    AuthRateLimitExceeded,
    ValidationInvalidGeojson,
    ValidationTooManyGeometries,
    ValidationInvalidExternalIdColumn,
    AnalysisProcessing,
    AnalysisCompleted,
    AnalysisError,
    AnalysisTimeout,
    AnalysisJobNotFound,
    AnalysisTooManyConcurrent,
}

impl SystemCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemInternalServerError => "system_internal_server_error",
            Self::SystemMissingRequestBody => "system_missing_request_body",
            Self::AuthInvalidApiKey => "auth_invalid_api_key",
            Self::AuthMissingApiKey => "auth_missing_api_key",
            Self::AuthRateLimitExceeded => "auth_rate_limit_exceeded",
            Self::ValidationInvalidGeojson => "validation_invalid_geojson",
            Self::ValidationTooManyGeometries => "validation_too_many_geometries",
            Self::ValidationInvalidExternalIdColumn => "validation_invalid_external_id_column",
            Self::AnalysisProcessing => "analysis_processing",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisError => "analysis_error",
            Self::AnalysisTimeout => "analysis_timeout",
            Self::AnalysisJobNotFound => "analysis_job_not_found",
            Self::AnalysisTooManyConcurrent => "analysis_too_many_concurrent",
        }
    }

    /// Message template; `{0}`, `{1}` are replaced by [`SystemCode::format`].
    pub fn template(&self) -> &'static str {
        match self {
            Self::SystemInternalServerError => {
                "An internal server error occurred. Please try again later."
            }
            Self::SystemMissingRequestBody => "Missing or invalid request body.",
            Self::AuthInvalidApiKey => "Invalid or expired API key.",
            Self::AuthMissingApiKey => "API key is required for this request.",
            Self::AuthRateLimitExceeded => "Rate limit exceeded. Try again in {0} seconds.",
            Self::ValidationInvalidGeojson => {
                "The body does not contain a valid GeoJSON. Errors:\n{0}"
            }
            Self::ValidationTooManyGeometries => {
                "Too many geometries provided. Maximum allowed is {0}."
            }
            Self::ValidationInvalidExternalIdColumn => {
                "The external ID column \"{0}\" does not exist in your GeoJSON features. Available columns: {1}"
            }
            Self::AnalysisProcessing => "Analysis in progress...",
            Self::AnalysisCompleted => "Analysis completed successfully",
            Self::AnalysisError => "Analysis service encountered an error. Please try again.",
            Self::AnalysisTimeout => {
                "Analysis timed out after {0} seconds. Please try with a smaller dataset or contact support."
            }
            Self::AnalysisJobNotFound => "Analysis job not found.",
            Self::AnalysisTooManyConcurrent => {
                "Too many concurrent analyses. Please wait for existing analyses to finish."
            }
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::SystemInternalServerError | Self::AnalysisError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::SystemMissingRequestBody
            | Self::ValidationInvalidGeojson
            | Self::ValidationTooManyGeometries
            | Self::ValidationInvalidExternalIdColumn => StatusCode::BAD_REQUEST,
            Self::AuthInvalidApiKey | Self::AuthMissingApiKey => StatusCode::UNAUTHORIZED,
            Self::AuthRateLimitExceeded | Self::AnalysisTooManyConcurrent => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::AnalysisProcessing | Self::AnalysisCompleted => StatusCode::OK,
            Self::AnalysisTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::AnalysisJobNotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn message(&self) -> String {
        self.template().to_string()
    }

    pub fn format<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut message = self.template().to_string();
        for (idx, arg) in args.iter().enumerate() {
            message = message.replace(&format!("{{{idx}}}"), arg.as_ref());
        }
        message
    }

    /// Codes a job can end in; anything else on a status channel means
    /// "keep waiting".
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AnalysisProcessing)
    }
}

impl std::fmt::Display for SystemCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
