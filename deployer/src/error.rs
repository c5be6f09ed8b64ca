use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Failure classes the core distinguishes. The kind decides both the HTTP
/// status surfaced to callers and whether a worker step may retry.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("project not found")]
    ProjectNotFound,
    #[error("deployment not found")]
    DeploymentNotFound,
    #[error("environment not found")]
    EnvironmentNotFound,
    #[error("alias not found")]
    AliasNotFound,
    #[error("no environment matches this branch")]
    NoEnvironmentForBranch,
    #[error("no previous deployment to roll back to")]
    NoPreviousDeployment,
    #[error("operation not valid in the current state")]
    InvalidState,
    #[error("validation failed")]
    ValidationFailed,
    #[error("deployment runtime failure")]
    RuntimeFailed,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("transient backend failure")]
    Transient,
    #[error("integrity check failed")]
    Integrity,
    #[error("internal error")]
    Internal,
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl ErrorKind {
    fn status(&self) -> StatusCode {
        match self {
            ErrorKind::ProjectNotFound
            | ErrorKind::DeploymentNotFound
            | ErrorKind::EnvironmentNotFound
            | ErrorKind::AliasNotFound => StatusCode::NOT_FOUND,
            ErrorKind::NoEnvironmentForBranch | ErrorKind::ValidationFailed => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::NoPreviousDeployment | ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::Integrity => StatusCode::UNAUTHORIZED,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RuntimeFailed
            | ErrorKind::Cancelled
            | ErrorKind::Transient
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// All deployer errors carry an [`ErrorKind`] and an optional source. The
/// [`IntoResponse`] implementation only ever exposes the kind, never the
/// source, so it is safe as an axum handler error.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Self::source(ErrorKind::Internal, error)
    }
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Self::source(ErrorKind::Transient, error)
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(error: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;

        // Daemon hiccups are retryable; definite answers from the daemon
        // (not found, conflict, bad request) are not.
        let kind = match &error {
            DockerError::DockerResponseServerError { status_code, .. } if *status_code >= 500 => {
                ErrorKind::Transient
            }
            DockerError::HyperResponseError { .. }
            | DockerError::IOError { .. }
            | DockerError::RequestTimeoutError => ErrorKind::Transient,
            _ => ErrorKind::RuntimeFailed,
        };

        Self::source(kind, error)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::source(ErrorKind::Transient, error)
    }
}

impl From<runway_common::secret::Error> for Error {
    fn from(error: runway_common::secret::Error) -> Self {
        Self::source(ErrorKind::Integrity, error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::source(ErrorKind::Internal, error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::source(ErrorKind::Internal, error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!(error = %self, "request had an error");

        (
            self.kind.status(),
            Json(json!({ "message": self.kind.to_string() })),
        )
            .into_response()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_the_source_chain() {
        let err = Error::custom(ErrorKind::InvalidState, "deployment already settled");
        assert_eq!(
            err.to_string(),
            "operation not valid in the current state: deployment already settled"
        );
    }

    #[test]
    fn kinds_map_to_stable_status_codes() {
        assert_eq!(ErrorKind::DeploymentNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::NoPreviousDeployment.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::Integrity.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ErrorKind::NoEnvironmentForBranch.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
