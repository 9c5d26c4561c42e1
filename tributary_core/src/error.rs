use crate::sources::models::DsRefs;
use serde::Serialize;
use std::error::Error as StdError;

/// Common error type for `tributary_core`.
///
/// Storage and HTTP failures should preserve the underlying error chain via
/// `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A destructive operation blocked by blueprints/projects that still reference the target.
    #[error("conflict: {message} (blueprints: {}, projects: {})", refs.blueprints.join(", "), refs.projects.join(", "))]
    Referenced { message: String, refs: DsRefs },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

/// Coarse classification surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadInput,
    NotFound,
    Conflict,
    Unauthorized,
    Cancelled,
    Internal,
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tributary.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::BadInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) | Error::Referenced { .. } => ErrorKind::Conflict,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::HttpStatus { .. } | Error::Backend { .. } | Error::BackendMessage(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Prefix the message with extra context while keeping the error kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Error::InvalidInput(m) => Error::InvalidInput(format!("{ctx}: {m}")),
            Error::NotFound(m) => Error::NotFound(format!("{ctx}: {m}")),
            Error::Conflict(m) => Error::Conflict(format!("{ctx}: {m}")),
            Error::Referenced { message, refs } => Error::Referenced {
                message: format!("{ctx}: {message}"),
                refs,
            },
            Error::Unauthorized(m) => Error::Unauthorized(format!("{ctx}: {m}")),
            Error::Cancelled(m) => Error::Cancelled(format!("{ctx}: {m}")),
            Error::HttpStatus { status, message } => Error::HttpStatus {
                status,
                message: format!("{ctx}: {message}"),
            },
            Error::Backend { context, source } => Error::Backend {
                context: format!("{ctx}: {context}"),
                source,
            },
            Error::BackendMessage(m) => Error::BackendMessage(format!("{ctx}: {m}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let e = Error::Conflict("at least one pipeline is running".into()).context("delete scope");
        assert_eq!(e.kind(), ErrorKind::Conflict);
        assert_eq!(
            e.to_string(),
            "conflict: delete scope: at least one pipeline is running"
        );
    }

    #[test]
    fn referenced_lists_blocking_names() {
        let e = Error::Referenced {
            message: "scope is in use".into(),
            refs: DsRefs {
                blueprints: vec!["nightly".into()],
                projects: vec!["checkout".into()],
            },
        };
        assert_eq!(e.kind(), ErrorKind::Conflict);
        let msg = e.to_string();
        assert!(msg.contains("nightly"));
        assert!(msg.contains("checkout"));
    }
}
