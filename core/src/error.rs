//! Error types for command execution.
//!
//! # Design
//! `HttpError` is what a caller sees when a command terminates without a
//! usable response. Status-coded failures that providers agree on get their
//! own variants (`Authorization`, `ResourceNotFound`, `IllegalState`) so that
//! callers can branch on them; every other non-2xx response lands in
//! `Response` with the status and body for debugging. Transport failures are
//! reported separately through `TransportError` and wrapped into
//! `HttpError::Transport` or `HttpError::Authorization` by the executor.

use std::io;

use thiserror::Error;

/// Status and body of the response that caused an error, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
    pub body: Option<String>,
}

/// Terminal failure of an `HttpCommand`.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request violates a precondition and was never sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// 401/403, a provider-specific auth code, or a TLS failure.
    #[error("authorization failed: {message}")]
    Authorization {
        message: String,
        response: Option<ErrorResponse>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// 404 or a provider-specific "does not exist" code.
    #[error("resource not found: {message}")]
    ResourceNotFound {
        message: String,
        response: Option<ErrorResponse>,
    },

    /// 409 or a provider-specific conflict code.
    #[error("illegal state: {message}")]
    IllegalState {
        message: String,
        response: Option<ErrorResponse>,
    },

    /// Any other non-retryable status.
    #[error("command: {request_line} failed with response: HTTP/1.1 {} {}", .response.status, .response.message)]
    Response {
        request_line: String,
        response: ErrorResponse,
    },

    /// IO failure that the retry policy gave up on.
    #[error("{source} connecting to {request_line}")]
    Transport {
        request_line: String,
        #[source]
        source: io::Error,
    },

    /// The pooled worker running the command panicked or was cancelled.
    #[error("command worker failed: {0}")]
    Worker(String),
}

impl HttpError {
    /// Status code of the response behind this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|r| r.status)
    }

    pub fn response(&self) -> Option<&ErrorResponse> {
        match self {
            HttpError::Authorization { response, .. }
            | HttpError::ResourceNotFound { response, .. }
            | HttpError::IllegalState { response, .. } => response.as_ref(),
            HttpError::Response { response, .. } => Some(response),
            HttpError::InvalidRequest(_) | HttpError::Transport { .. } | HttpError::Worker(_) => None,
        }
    }

    /// True for `ResourceNotFound` and for any error carrying a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HttpError::ResourceNotFound { .. }) || self.status() == Some(404)
    }
}

/// Failure reported by an `HttpTransport` before a response was received.
#[derive(Debug, Error)]
pub enum TransportError {
    /// TLS negotiation or certificate validation failed.
    #[error("TLS failure: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16) -> ErrorResponse {
        ErrorResponse {
            status,
            message: "msg".to_string(),
            body: None,
        }
    }

    #[test]
    fn status_is_exposed_for_response_errors() {
        let err = HttpError::Response {
            request_line: "GET http://localhost/ HTTP/1.1".to_string(),
            response: response(500),
        };
        assert_eq!(err.status(), Some(500));
        assert_eq!(
            err.to_string(),
            "command: GET http://localhost/ HTTP/1.1 failed with response: HTTP/1.1 500 msg"
        );
    }

    #[test]
    fn not_found_detection() {
        let err = HttpError::ResourceNotFound {
            message: "gone".to_string(),
            response: None,
        };
        assert!(err.is_not_found());

        let err = HttpError::Response {
            request_line: "DELETE http://localhost/a HTTP/1.1".to_string(),
            response: response(404),
        };
        assert!(err.is_not_found());

        let err = HttpError::InvalidRequest("nope".to_string());
        assert!(!err.is_not_found());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn transport_error_wraps_io() {
        let err: TransportError = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(err.to_string(), "refused");
    }
}
