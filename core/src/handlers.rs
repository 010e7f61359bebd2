//! Error handlers: turn a final non-2xx response into an `HttpError`.
//!
//! # Design
//! The executor calls an error handler once, after the retry handler has
//! declined to resubmit. The handler owns the response, records exactly one
//! error on the command, and releases the payload. Provider conventions are
//! layered on top of the generic status mapping: `CodedErrorHandler` looks
//! for an error code in the body and hands anything it does not recognise to
//! the handler it wraps.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::command::HttpCommand;
use crate::error::{ErrorResponse, HttpError};
use crate::http::{HttpMethod, HttpResponse};

pub trait HttpErrorHandler: Send + Sync {
    fn handle_error(&self, command: &mut HttpCommand, response: HttpResponse);
}

/// Buffer the body into an `ErrorResponse` and release the payload.
fn capture(response: &mut HttpResponse) -> ErrorResponse {
    let body = response.payload_as_string().filter(|b| !b.is_empty());
    response.release_payload();
    ErrorResponse {
        status: response.status,
        message: response.message.clone(),
        body,
    }
}

fn describe(command: &HttpCommand, response: &HttpResponse) -> String {
    format!(
        "{} -> {}",
        command.current_request().request_line(),
        response.status_line()
    )
}

/// Generic mapping for client errors: 400, 401/403, 404 (except DELETE),
/// 409. Everything else becomes `HttpError::Response`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapHttp4xxCodesToErrors;

impl HttpErrorHandler for MapHttp4xxCodesToErrors {
    fn handle_error(&self, command: &mut HttpCommand, mut response: HttpResponse) {
        let message = describe(command, &response);
        let captured = capture(&mut response);
        let error = match response.status {
            400 => HttpError::InvalidRequest(match &captured.body {
                Some(body) => format!("{message}: {body}"),
                None => message,
            }),
            401 | 403 => HttpError::Authorization {
                message,
                response: Some(captured),
                source: None,
            },
            404 if command.current_request().method != HttpMethod::Delete => HttpError::ResourceNotFound {
                message,
                response: Some(captured),
            },
            409 => HttpError::IllegalState {
                message,
                response: Some(captured),
            },
            _ => HttpError::Response {
                request_line: command.current_request().request_line(),
                response: captured,
            },
        };
        command.set_error(error);
    }
}

/// Records `HttpError::Response` with the status and body.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseContentAndSetError;

impl HttpErrorHandler for CloseContentAndSetError {
    fn handle_error(&self, command: &mut HttpCommand, mut response: HttpResponse) {
        let captured = capture(&mut response);
        command.set_error(HttpError::Response {
            request_line: command.current_request().request_line(),
            response: captured,
        });
    }
}

/// What a provider error code means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Authorization,
    IllegalState,
}

/// Maps error codes found in a JSON body, such as
/// `{"code": "NoSuchKey", "message": "..."}` or
/// `{"Error": {"Code": "AccessDenied"}}`, to typed errors. Unknown codes
/// and bodies that are not error documents go to the wrapped handler.
#[derive(Debug, Clone)]
pub struct CodedErrorHandler<F> {
    codes: HashMap<String, ErrorKind>,
    fallback: F,
}

impl<F: HttpErrorHandler> CodedErrorHandler<F> {
    pub fn new(fallback: F) -> Self {
        let codes = [
            ("NoSuchKey", ErrorKind::NotFound),
            ("NoSuchBucket", ErrorKind::NotFound),
            ("NotFound", ErrorKind::NotFound),
            ("AccessDenied", ErrorKind::Authorization),
            ("InvalidAccessKeyId", ErrorKind::Authorization),
            ("SignatureDoesNotMatch", ErrorKind::Authorization),
            ("AuthFailure", ErrorKind::Authorization),
            ("BucketAlreadyExists", ErrorKind::IllegalState),
            ("BucketNotEmpty", ErrorKind::IllegalState),
            ("Conflict", ErrorKind::IllegalState),
        ]
        .into_iter()
        .map(|(code, kind)| (code.to_string(), kind))
        .collect();
        Self { codes, fallback }
    }

    pub fn with_code(mut self, code: impl Into<String>, kind: ErrorKind) -> Self {
        self.codes.insert(code.into(), kind);
        self
    }
}

/// `(code, message)` from a JSON error document.
pub fn parse_error_document(body: &str) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let doc = value.get("error").or_else(|| value.get("Error")).unwrap_or(&value);
    let field = |lower: &str, upper: &str| {
        doc.get(lower)
            .or_else(|| doc.get(upper))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let code = field("code", "Code")?;
    Some((code, field("message", "Message")))
}

impl<F: HttpErrorHandler> HttpErrorHandler for CodedErrorHandler<F> {
    fn handle_error(&self, command: &mut HttpCommand, mut response: HttpResponse) {
        let document = response.payload_as_string().and_then(|b| parse_error_document(&b));
        let Some((code, detail)) = document else {
            return self.fallback.handle_error(command, response);
        };
        let Some(kind) = self.codes.get(&code).copied() else {
            debug!(command = %command.id(), code = %code, "unmapped provider error code");
            return self.fallback.handle_error(command, response);
        };
        let message = detail.unwrap_or_else(|| code.clone());
        let captured = capture(&mut response);
        let error = match kind {
            ErrorKind::NotFound => HttpError::ResourceNotFound {
                message,
                response: Some(captured),
            },
            ErrorKind::Authorization => HttpError::Authorization {
                message,
                response: Some(captured),
                source: None,
            },
            ErrorKind::IllegalState => HttpError::IllegalState {
                message,
                response: Some(captured),
            },
        };
        command.set_error(error);
    }
}

/// Dispatches by status class: 3xx, 4xx, 5xx. Anything else is recorded
/// as a generic response error.
#[derive(Clone)]
pub struct DelegatingErrorHandler {
    redirection: Arc<dyn HttpErrorHandler>,
    client_error: Arc<dyn HttpErrorHandler>,
    server_error: Arc<dyn HttpErrorHandler>,
}

impl DelegatingErrorHandler {
    pub fn new(
        redirection: Arc<dyn HttpErrorHandler>,
        client_error: Arc<dyn HttpErrorHandler>,
        server_error: Arc<dyn HttpErrorHandler>,
    ) -> Self {
        Self {
            redirection,
            client_error,
            server_error,
        }
    }
}

impl Default for DelegatingErrorHandler {
    fn default() -> Self {
        Self::new(
            Arc::new(CloseContentAndSetError),
            Arc::new(CodedErrorHandler::new(MapHttp4xxCodesToErrors)),
            Arc::new(CodedErrorHandler::new(CloseContentAndSetError)),
        )
    }
}

impl HttpErrorHandler for DelegatingErrorHandler {
    fn handle_error(&self, command: &mut HttpCommand, response: HttpResponse) {
        match response.status {
            300..=399 => self.redirection.handle_error(command, response),
            400..=499 => self.client_error.handle_error(command, response),
            500..=599 => self.server_error.handle_error(command, response),
            _ => CloseContentAndSetError.handle_error(command, response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;
    use crate::payload::Payload;
    use std::io::Cursor;

    fn command(method: HttpMethod) -> HttpCommand {
        HttpCommand::new(HttpRequest::new(method, "https://api.example.com/v1/things/1"))
    }

    fn handle(handler: &dyn HttpErrorHandler, method: HttpMethod, response: HttpResponse) -> HttpError {
        let mut cmd = command(method);
        handler.handle_error(&mut cmd, response);
        cmd.into_result().unwrap_err()
    }

    #[test]
    fn forbidden_is_authorization() {
        let err = handle(&MapHttp4xxCodesToErrors, HttpMethod::Get, HttpResponse::new(403, "Forbidden"));
        match err {
            HttpError::Authorization { message, response, .. } => {
                assert_eq!(
                    message,
                    "GET https://api.example.com/v1/things/1 HTTP/1.1 -> HTTP/1.1 403 Forbidden"
                );
                assert_eq!(response.unwrap().status, 403);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn not_found_except_for_delete() {
        let err = handle(&MapHttp4xxCodesToErrors, HttpMethod::Get, HttpResponse::new(404, "Not Found"));
        assert!(matches!(err, HttpError::ResourceNotFound { .. }));

        let err = handle(&MapHttp4xxCodesToErrors, HttpMethod::Delete, HttpResponse::new(404, "Not Found"));
        assert!(matches!(err, HttpError::Response { .. }));
        assert!(err.is_not_found());
    }

    #[test]
    fn conflict_and_bad_request() {
        let err = handle(&MapHttp4xxCodesToErrors, HttpMethod::Put, HttpResponse::new(409, "Conflict"));
        assert!(matches!(err, HttpError::IllegalState { .. }));

        let resp = HttpResponse::new(400, "Bad Request").with_payload("missing name");
        let err = handle(&MapHttp4xxCodesToErrors, HttpMethod::Post, resp);
        match err {
            HttpError::InvalidRequest(message) => assert!(message.ends_with(": missing name")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn generic_error_keeps_body() {
        let resp = HttpResponse::new(500, "Internal Server Error")
            .with_payload(Payload::from_reader(Cursor::new(b"boom".to_vec()), None));
        let err = handle(&CloseContentAndSetError, HttpMethod::Get, resp);
        let response = err.response().unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body.as_deref(), Some("boom"));
    }

    #[test]
    fn error_documents_in_both_casings() {
        assert_eq!(
            parse_error_document(r#"{"code":"NoSuchKey","message":"gone"}"#),
            Some(("NoSuchKey".to_string(), Some("gone".to_string())))
        );
        assert_eq!(
            parse_error_document(r#"{"Error":{"Code":"AccessDenied"}}"#),
            Some(("AccessDenied".to_string(), None))
        );
        assert_eq!(parse_error_document("<Error/>"), None);
        assert_eq!(parse_error_document(r#"{"message":"no code"}"#), None);
    }

    #[test]
    fn provider_code_overrides_status() {
        let handler = CodedErrorHandler::new(CloseContentAndSetError);
        let resp = HttpResponse::new(500, "Internal Server Error")
            .with_payload(r#"{"code":"NoSuchBucket","message":"bucket b does not exist"}"#);
        match handle(&handler, HttpMethod::Get, resp) {
            HttpError::ResourceNotFound { message, response } => {
                assert_eq!(message, "bucket b does not exist");
                assert_eq!(response.unwrap().status, 500);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_code_falls_back_with_body_intact() {
        let handler = CodedErrorHandler::new(MapHttp4xxCodesToErrors);
        let body = r#"{"code":"SlowDown"}"#;
        let resp = HttpResponse::new(418, "I'm a teapot")
            .with_payload(Payload::from_reader(Cursor::new(body.as_bytes().to_vec()), None));
        let err = handle(&handler, HttpMethod::Get, resp);
        assert_eq!(err.response().unwrap().body.as_deref(), Some(body));
    }

    #[test]
    fn custom_codes() {
        let handler = CodedErrorHandler::new(CloseContentAndSetError).with_code("ZoneNotFound", ErrorKind::NotFound);
        let resp = HttpResponse::new(500, "Internal Server Error").with_payload(r#"{"code":"ZoneNotFound"}"#);
        match handle(&handler, HttpMethod::Get, resp) {
            HttpError::ResourceNotFound { message, .. } => assert_eq!(message, "ZoneNotFound"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn delegation_by_status_class() {
        let handler = DelegatingErrorHandler::default();
        let err = handle(&handler, HttpMethod::Get, HttpResponse::new(302, "Found"));
        assert!(matches!(err, HttpError::Response { .. }));
        let err = handle(&handler, HttpMethod::Get, HttpResponse::new(401, "Unauthorized"));
        assert!(matches!(err, HttpError::Authorization { .. }));
        let err = handle(&handler, HttpMethod::Get, HttpResponse::new(503, "Service Unavailable"));
        assert_eq!(err.status(), Some(503));
    }
}
