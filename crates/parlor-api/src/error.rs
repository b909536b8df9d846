use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use parlor_types::api::ApiResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Room,
    Images,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Empty,
    TooLong { max: usize },
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Room => f.write_str("chat room is closed"),
            Self::Images => f.write_str("image uploads are disabled"),
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("message content cannot be empty"),
            Self::TooLong { max } => write!(f, "message is too long (limit {max} characters)"),
        }
    }
}

/// Everything a chat request or `send` frame can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    FeatureDisabled(Feature),

    #[error("{0}")]
    ValidationFailed(Validation),

    #[error("invalid request parameters")]
    InvalidRequest,

    #[error("failed to save message")]
    PersistenceFailed(anyhow::Error),

    #[error("attachment larger than {limit} bytes")]
    AttachmentTooLarge { limit: u64 },

    #[error("unsupported attachment, expected {expected}")]
    AttachmentTypeUnsupported { expected: &'static str },

    #[error("failed to store attachment")]
    AttachmentIoFailed(#[source] std::io::Error),

    #[error("path rejected")]
    PathTraversalRejected,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("authentication required")]
    Unauthorized,
}

impl ChatError {
    /// Whether a rejected `send` frame should be reported to its sender.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            Self::FeatureDisabled(_) | Self::ValidationFailed(Validation::TooLong { .. })
        )
    }

    /// Only authorization and attachment retrieval use real status codes;
    /// everything else is a 200 with `success: false`.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PathTraversalRejected | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::OK,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match &self {
            Self::PersistenceFailed(e) => error!("Persistence failure: {:#}", e),
            Self::AttachmentIoFailed(e) => error!("Attachment I/O failure: {}", e),
            _ => {}
        }

        (self.status(), Json(ApiResponse::<()>::failure(self.to_string()))).into_response()
    }
}
