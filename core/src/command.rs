//! A single logical request and its outcome.
//!
//! # Design
//! `HttpCommand` is the unit the executor works on. It starts with the
//! caller's request; retry handlers may swap in a new current request (a
//! redirect target, for example) and bump the command's private failure and
//! redirect counters. When execution ends exactly one of response or error
//! is stored.

use tracing::warn;
use uuid::Uuid;

use crate::error::HttpError;
use crate::http::{HttpRequest, HttpResponse};

#[derive(Debug)]
enum Outcome {
    Response(HttpResponse),
    Failed(HttpError),
}

#[derive(Debug)]
pub struct HttpCommand {
    id: Uuid,
    current_request: HttpRequest,
    failure_count: u32,
    redirect_count: u32,
    outcome: Option<Outcome>,
}

impl HttpCommand {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            current_request: request,
            failure_count: 0,
            redirect_count: 0,
            outcome: None,
        }
    }

    /// Correlates log lines of one command across attempts.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn current_request(&self) -> &HttpRequest {
        &self.current_request
    }

    pub fn set_current_request(&mut self, request: HttpRequest) {
        self.current_request = request;
    }

    pub fn increment_failure_count(&mut self) -> u32 {
        self.failure_count += 1;
        self.failure_count
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn increment_redirect_count(&mut self) -> u32 {
        self.redirect_count += 1;
        self.redirect_count
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    /// A command can be resent when its payload, if any, can be read again.
    pub fn is_replayable(&self) -> bool {
        self.current_request
            .payload
            .as_ref()
            .is_none_or(|p| p.is_repeatable())
    }

    pub fn set_response(&mut self, response: HttpResponse) {
        if self.outcome.is_some() {
            warn!(command = %self.id, "ignoring response for a command that already finished");
            return;
        }
        self.outcome = Some(Outcome::Response(response));
    }

    /// Record the terminal error. The first error wins.
    pub fn set_error(&mut self, error: HttpError) {
        if let Some(existing) = &self.outcome {
            warn!(command = %self.id, ?existing, dropped = %error, "command already finished");
            return;
        }
        self.outcome = Some(Outcome::Failed(error));
    }

    pub fn error(&self) -> Option<&HttpError> {
        match &self.outcome {
            Some(Outcome::Failed(err)) => Some(err),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match &self.outcome {
            Some(Outcome::Response(resp)) => Some(resp),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// Consume the command. An unfinished command yields a `Worker` error.
    pub fn into_result(self) -> Result<HttpResponse, HttpError> {
        match self.outcome {
            Some(Outcome::Response(resp)) => Ok(resp),
            Some(Outcome::Failed(err)) => Err(err),
            None => Err(HttpError::Worker(format!(
                "command {} finished without an outcome",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpMethod;
    use crate::payload::Payload;
    use std::io::Cursor;

    fn command() -> HttpCommand {
        HttpCommand::new(HttpRequest::new(HttpMethod::Get, "http://localhost/a"))
    }

    #[test]
    fn counters_are_independent() {
        let mut cmd = command();
        assert_eq!(cmd.increment_failure_count(), 1);
        assert_eq!(cmd.increment_failure_count(), 2);
        assert_eq!(cmd.increment_redirect_count(), 1);
        assert_eq!(cmd.failure_count(), 2);
        assert_eq!(cmd.redirect_count(), 1);
    }

    #[test]
    fn first_error_wins() {
        let mut cmd = command();
        cmd.set_error(HttpError::InvalidRequest("first".to_string()));
        cmd.set_error(HttpError::InvalidRequest("second".to_string()));
        cmd.set_response(HttpResponse::new(200, "OK"));
        assert!(cmd.response().is_none());
        assert_eq!(cmd.error().unwrap().to_string(), "invalid request: first");
    }

    #[test]
    fn response_outcome() {
        let mut cmd = command();
        assert!(!cmd.is_done());
        cmd.set_response(HttpResponse::new(204, "No Content"));
        assert!(cmd.error().is_none());
        assert_eq!(cmd.into_result().unwrap().status, 204);
    }

    #[test]
    fn unfinished_command_is_a_worker_error() {
        assert!(matches!(command().into_result(), Err(HttpError::Worker(_))));
    }

    #[test]
    fn replayability_follows_payload() {
        let cmd = command();
        assert!(cmd.is_replayable());

        let req = HttpRequest::new(HttpMethod::Put, "http://localhost/a").with_payload("hi");
        assert!(HttpCommand::new(req).is_replayable());

        let req = HttpRequest::new(HttpMethod::Put, "http://localhost/a")
            .with_payload(Payload::from_reader(Cursor::new(vec![1]), Some(1)));
        assert!(!HttpCommand::new(req).is_replayable());
    }
}
