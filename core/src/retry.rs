//! Retry policies.
//!
//! # Design
//! A retry handler is a decision function over a failed attempt. It may
//! mutate the command (bump counters, swap in a redirect target) and may
//! block to back off, but it never sends anything itself: returning `true`
//! tells the executor to run the loop again with the command's current
//! request. Counters live on the command, so handlers are shared freely
//! between commands.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use crate::command::HttpCommand;
use crate::config::ExecutorConfig;
use crate::http::{HttpMessage, HttpMethod, HttpResponse, AUTHORIZATION, HOST, LOCATION, RETRY_AFTER};

/// Decides whether a non-2xx response should be retried.
pub trait HttpRetryHandler: Send + Sync {
    fn should_retry_request(&self, command: &mut HttpCommand, response: &HttpResponse) -> bool;
}

/// Decides whether a transport IO failure should be retried.
pub trait IoRetryHandler: Send + Sync {
    fn should_retry_request(&self, command: &mut HttpCommand, error: &io::Error) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl HttpRetryHandler for NeverRetry {
    fn should_retry_request(&self, _command: &mut HttpCommand, _response: &HttpResponse) -> bool {
        false
    }
}

impl IoRetryHandler for NeverRetry {
    fn should_retry_request(&self, _command: &mut HttpCommand, _error: &io::Error) -> bool {
        false
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retries replayable commands up to a limit, sleeping between attempts.
///
/// The n-th failure waits `delay_start * n²`, capped at `delay_start * 10`.
/// A numeric `Retry-After` header replaces the computed delay, under the
/// same cap.
#[derive(Clone)]
pub struct BackoffLimitedRetryHandler {
    retry_count_limit: u32,
    delay_start: Duration,
    sleeper: Sleeper,
}

impl BackoffLimitedRetryHandler {
    pub fn new(retry_count_limit: u32, delay_start: Duration) -> Self {
        Self {
            retry_count_limit,
            delay_start,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay_start())
    }

    /// Replace the blocking sleep, e.g. to record delays in tests.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    fn max_delay(&self) -> Duration {
        self.delay_start.saturating_mul(10)
    }

    pub fn backoff_delay(&self, failure_count: u32) -> Duration {
        self.delay_start
            .saturating_mul(failure_count.saturating_pow(2))
            .min(self.max_delay())
    }

    fn retry(&self, command: &mut HttpCommand, retry_after: Option<Duration>, cause: &str) -> bool {
        if !command.is_replayable() {
            warn!(command = %command.id(), cause, "cannot retry: payload is not repeatable");
            return false;
        }
        let failures = command.increment_failure_count();
        if failures > self.retry_count_limit {
            warn!(
                command = %command.id(),
                failures,
                limit = self.retry_count_limit,
                cause,
                "giving up on {}",
                command.current_request().request_line()
            );
            return false;
        }
        let delay = retry_after
            .map(|d| d.min(self.max_delay()))
            .unwrap_or_else(|| self.backoff_delay(failures));
        debug!(
            command = %command.id(),
            failures,
            delay_ms = delay.as_millis() as u64,
            cause,
            "retrying {}",
            command.current_request().request_line()
        );
        (self.sleeper)(delay);
        true
    }
}

impl HttpRetryHandler for BackoffLimitedRetryHandler {
    fn should_retry_request(&self, command: &mut HttpCommand, response: &HttpResponse) -> bool {
        let retry_after = response
            .first_header(RETRY_AFTER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        self.retry(command, retry_after, &response.status_line())
    }
}

/// IO failures that another attempt can plausibly get past. Anything else
/// (a malformed URI, an unknown host, a request sent twice) is final.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

impl IoRetryHandler for BackoffLimitedRetryHandler {
    fn should_retry_request(&self, command: &mut HttpCommand, error: &io::Error) -> bool {
        if !is_transient(error) {
            debug!(command = %command.id(), error = %error, kind = ?error.kind(), "not retrying permanent IO failure");
            return false;
        }
        self.retry(command, None, &error.to_string())
    }
}

/// Follows `Location` on 301, 302, 303, 307 and 308.
#[derive(Debug, Clone, Copy)]
pub struct RedirectionRetryHandler {
    retry_count_limit: u32,
}

impl RedirectionRetryHandler {
    pub fn new(retry_count_limit: u32) -> Self {
        Self { retry_count_limit }
    }
}

impl HttpRetryHandler for RedirectionRetryHandler {
    fn should_retry_request(&self, command: &mut HttpCommand, response: &HttpResponse) -> bool {
        if !matches!(response.status, 301 | 302 | 303 | 307 | 308) {
            return false;
        }
        let Some(location) = response.first_header(LOCATION) else {
            return false;
        };
        if !command.is_replayable() {
            warn!(command = %command.id(), location, "cannot follow redirect: payload is not repeatable");
            return false;
        }
        if command.increment_redirect_count() > self.retry_count_limit {
            warn!(command = %command.id(), location, limit = self.retry_count_limit, "too many redirects");
            return false;
        }

        let current = command.current_request();
        let Ok(base) = Url::parse(&current.endpoint) else {
            return false;
        };
        let target = match base.join(location) {
            Ok(target) => target,
            Err(err) => {
                warn!(command = %command.id(), location, error = %err, "unusable redirect location");
                return false;
            }
        };

        let mut next = current.clone().with_endpoint(target.as_str());
        if response.status == 303 && !matches!(current.method, HttpMethod::Get | HttpMethod::Head) {
            next = next.with_method(HttpMethod::Get).without_payload();
        }
        let same_authority =
            base.host_str() == target.host_str() && base.port_or_known_default() == target.port_or_known_default();
        if !same_authority {
            next = next.remove_header(AUTHORIZATION).without_credential_filters();
            if next.first_header(HOST).is_some() {
                next = next.replace_header(HOST, authority(&target));
            }
        }
        debug!(command = %command.id(), from = %base, to = %target, status = response.status, "following redirect");
        command.set_current_request(next);
        true
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Routes a response to the policy for its status class: redirects,
/// 401, and throttling or server errors. Other 4xx are final.
#[derive(Clone)]
pub struct DelegatingRetryHandler {
    redirection: Arc<dyn HttpRetryHandler>,
    client_error: Arc<dyn HttpRetryHandler>,
    server_error: Arc<dyn HttpRetryHandler>,
}

impl DelegatingRetryHandler {
    pub fn new(
        redirection: Arc<dyn HttpRetryHandler>,
        client_error: Arc<dyn HttpRetryHandler>,
        server_error: Arc<dyn HttpRetryHandler>,
    ) -> Self {
        Self {
            redirection,
            client_error,
            server_error,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            Arc::new(RedirectionRetryHandler::new(config.max_redirects)),
            Arc::new(NeverRetry),
            Arc::new(BackoffLimitedRetryHandler::from_config(config)),
        )
    }
}

impl HttpRetryHandler for DelegatingRetryHandler {
    fn should_retry_request(&self, command: &mut HttpCommand, response: &HttpResponse) -> bool {
        match response.status {
            300..=399 => self.redirection.should_retry_request(command, response),
            401 => self.client_error.should_retry_request(command, response),
            429 | 500..=599 => self.server_error.should_retry_request(command, response),
            _ => false,
        }
    }
}
