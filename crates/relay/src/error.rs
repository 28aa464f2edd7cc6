use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::claude;

pub type RelayResult<T> = std::result::Result<T, RelayError>;
pub type TransformResult<T> = std::result::Result<T, TransformError>;

/// Failures of the format conversion layer.
///
/// Only some of these reach the client. Malformed chunks, schema cleaning
/// failures and late tool call fragments are handled where they occur, and a
/// connection abort ends the stream silently.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A single upstream chunk could not be parsed.
    #[error("malformed upstream chunk: {0}")]
    MalformedUpstreamChunk(String),

    /// A transformer was handed a payload it does not own.
    #[error("unsupported source format: {0}")]
    UnsupportedSourceFormat(String),

    /// The unimplemented half of a transformer was invoked.
    #[error("the {transformer} transformer does not implement {operation}")]
    UnsupportedDirection {
        transformer: &'static str,
        operation: &'static str,
    },

    /// A tool schema could not be walked.
    #[error("failed to clean tool schema: {0}")]
    SchemaCleaningFailure(String),

    /// The client or the upstream went away mid-stream.
    #[error("connection aborted")]
    ConnectionAbort,

    /// A tool call fragment arrived after the terminal sequence was emitted.
    #[error("dropping tool call fragment for index {0}, the stream is already finished")]
    ToolCallAmbiguity(u32),

    /// The response body has neither `choices` nor `candidates`.
    #[error("response body matches neither the OpenAI nor the Gemini shape")]
    AmbiguousResponseShape,

    /// The request violates a structural invariant.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransformError {
    pub(crate) fn unsupported(transformer: &'static str, operation: &'static str) -> Self {
        Self::UnsupportedDirection { transformer, operation }
    }
}

/// Relay errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No provider serves the requested model.
    #[error("No provider is configured for model '{0}'")]
    ModelNotFound(String),

    /// Invalid request parameters.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The content moderator rejected the request.
    #[error("Content policy violation: {reason}")]
    ContentPolicy { reason: String, code: String },

    /// Authentication with the upstream failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Upstream rate limit exceeded.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded { message: String },

    /// Insufficient quota or credits at the upstream.
    #[error("Insufficient quota: {0}")]
    InsufficientQuota(String),

    /// Upstream API returned an error.
    #[error("Provider API error ({status}): {message}")]
    ProviderApiError { status: u16, message: String },

    /// Network or connection error towards the upstream.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Format conversion failed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Internal server error.
    /// If Some(message), it came from a provider and can be shown.
    /// If None, it's an internal error and should not leak details.
    #[error("Internal server error")]
    InternalError(Option<String>),
}

impl RelayError {
    /// Maps a non-success upstream status to an error.
    pub(crate) fn from_upstream_status(status: u16, message: String) -> Self {
        match status {
            401 => Self::AuthenticationFailed(message),
            403 => Self::InsufficientQuota(message),
            404 => Self::ModelNotFound(message),
            429 => Self::RateLimitExceeded { message },
            400 => Self::InvalidRequest(message),
            500 => Self::InternalError(Some(message)),
            _ => Self::ProviderApiError { status, message },
        }
    }

    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::ContentPolicy { .. } => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::InsufficientQuota(_) => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderApiError { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Transform(error) => match error {
                TransformError::InvalidRequest(_) | TransformError::UnsupportedSourceFormat(_) => {
                    StatusCode::BAD_REQUEST
                }
                TransformError::MalformedUpstreamChunk(_) | TransformError::AmbiguousResponseShape => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string for the response.
    pub fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::ContentPolicy { .. } => "content_policy_violation",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::InsufficientQuota(_) => "insufficient_quota",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::ConnectionError(_) | Self::ProviderApiError { .. } => "api_error",
            Self::Transform(error) => match error {
                TransformError::InvalidRequest(_) | TransformError::UnsupportedSourceFormat(_) => {
                    "invalid_request_error"
                }
                TransformError::MalformedUpstreamChunk(_) | TransformError::AmbiguousResponseShape => "api_error",
                _ => "internal_error",
            },
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::InternalError(Some(provider_msg)) => provider_msg.clone(),
            Self::InternalError(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Error response format compatible with OpenAI API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let code = match &self {
            Self::ContentPolicy { code, .. } => code.clone(),
            _ => status.as_u16().to_string(),
        };

        let error_response = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// A [`RelayError`] rendered in the Claude Messages error envelope.
pub struct ClaudeErrorResponse {
    status: StatusCode,
    body: claude::ClaudeError,
}

impl From<RelayError> for ClaudeErrorResponse {
    fn from(error: RelayError) -> Self {
        let status = error.status_code();
        let body = claude::ClaudeError::new(error.error_type(), error.client_message());

        Self { status, body }
    }
}

impl From<TransformError> for ClaudeErrorResponse {
    fn from(error: TransformError) -> Self {
        Self::from(RelayError::from(error))
    }
}

impl IntoResponse for ClaudeErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ClaudeResult<T> = std::result::Result<T, ClaudeErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_statuses_map_to_errors() {
        let cases = [401, 403, 404, 429, 400, 500, 503]
            .map(|status| RelayError::from_upstream_status(status, "boom".to_string()).status_code().as_u16());

        assert_eq!(cases, [401, 403, 404, 429, 400, 500, 502]);
    }

    #[test]
    fn internal_errors_hide_details() {
        assert_eq!(RelayError::InternalError(None).client_message(), "Internal server error");
        assert_eq!(
            RelayError::InternalError(Some("upstream exploded".to_string())).client_message(),
            "upstream exploded"
        );
    }

    #[test]
    fn transform_errors_are_classified() {
        let ambiguous = RelayError::from(TransformError::AmbiguousResponseShape);
        assert_eq!(ambiguous.status_code(), StatusCode::BAD_GATEWAY);

        let direction = RelayError::from(TransformError::unsupported("gemini", "request_out"));
        assert_eq!(direction.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        insta::assert_snapshot!(direction, @"the gemini transformer does not implement request_out");

        let invalid = RelayError::from(TransformError::InvalidRequest("messages must not be empty".to_string()));
        assert_eq!(invalid.error_type(), "invalid_request_error");
    }

    #[test]
    fn moderation_rejection_is_a_client_error() {
        let error = RelayError::ContentPolicy {
            reason: "blocked term".to_string(),
            code: "blocked_term".to_string(),
        };

        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error_type(), "content_policy_violation");
    }
}
