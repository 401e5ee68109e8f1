//! Errors surfaced by the client handle and the helpers built on it.

use holdfast_manager::api::error::ProblemDetails;
use holdfast_reconcile::ReconcileError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport or body decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The manager answered with a problem document.
    #[error("{} ({}): {}", .problem.code, .problem.status, .problem.detail)]
    Api { problem: ProblemDetails },

    /// The manager answered with an error status and no problem document.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// A wait gave up or observed progress going backwards.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The manager reported something other than what the helper expected.
    #[error("check failed: {0}")]
    Check(String),
}

impl ClientError {
    pub(crate) fn check(message: impl Into<String>) -> Self {
        Self::Check(message.into())
    }

    /// HTTP status of an API error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { problem } => Some(problem.status),
            Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Machine-readable problem code of an API error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { problem } => Some(&problem.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Reconcile(ReconcileError::Timeout { .. }))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
