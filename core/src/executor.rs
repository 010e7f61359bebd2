//! Command execution: filters, transport, retries and error dispatch.
//!
//! # Design
//! `HttpCommandExecutor::execute` runs one command to completion on the
//! calling thread. Each pass of the loop:
//!
//! 1. validates the command's current request and runs its filters in order,
//! 2. re-checks the content-length/chunked invariant after filtering,
//! 3. tees the payload to the wire log (and re-checks the invariant),
//! 4. converts the request to the transport's native form and invokes it
//!    (a failure to tee the response counts as an IO failure of the pass),
//! 5. on a status of 300 or more asks the retry handler whether to go
//!    again, and otherwise hands the response to the error handler,
//! 6. on an IO failure asks the IO retry handler, except for TLS failures
//!    which end the command as an authorization error right away.
//!
//! Every native request is released exactly once, at the end of the pass
//! that created it, whatever the outcome. `submit` runs `execute` on the
//! tokio blocking pool behind a semaphore sized by `io_worker_threads`.

use std::future::Future;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::command::HttpCommand;
use crate::config::ExecutorConfig;
use crate::error::{ErrorResponse, HttpError, TransportError};
use crate::handlers::{DelegatingErrorHandler, HttpErrorHandler};
use crate::http::{check_content_length_or_chunked, check_required_properties, HttpRequest, HttpResponse};
use crate::retry::{BackoffLimitedRetryHandler, DelegatingRetryHandler, HttpRetryHandler, IoRetryHandler};
use crate::wire::{log_request, log_response, Wire};

/// The underlying HTTP client.
pub trait HttpTransport: Send + Sync + 'static {
    type NativeRequest: Send;

    fn convert(&self, request: &HttpRequest) -> Result<Self::NativeRequest, TransportError>;

    fn invoke(&self, native: &mut Self::NativeRequest) -> Result<HttpResponse, TransportError>;

    /// Release whatever `convert` acquired.
    fn cleanup(&self, native: Self::NativeRequest);
}

/// Releases the native request when the pass ends.
struct NativeGuard<'a, T: HttpTransport> {
    transport: &'a T,
    native: Option<T::NativeRequest>,
}

impl<T: HttpTransport> Drop for NativeGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            self.transport.cleanup(native);
        }
    }
}

struct Inner<T> {
    transport: T,
    retry_handler: Arc<dyn HttpRetryHandler>,
    io_retry_handler: Arc<dyn IoRetryHandler>,
    error_handler: Arc<dyn HttpErrorHandler>,
    wire: Wire,
    pool: Arc<Semaphore>,
}

/// Cloneable handle; clones share transport, handlers and pool.
pub struct HttpCommandExecutor<T: HttpTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: HttpTransport> Clone for HttpCommandExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: HttpTransport> HttpCommandExecutor<T> {
    pub fn new(transport: T) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: T) -> HttpCommandExecutorBuilder<T> {
        HttpCommandExecutorBuilder {
            transport,
            config: ExecutorConfig::default(),
            retry_handler: None,
            io_retry_handler: None,
            error_handler: None,
            wire: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Run `command` to completion on this thread. Afterwards the command
    /// holds either a response or an error.
    pub fn execute(&self, command: &mut HttpCommand) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.attempt(command, attempt).is_break() {
                break;
            }
        }
    }

    /// Build a command around `request` and run it on this thread.
    pub fn execute_request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut command = HttpCommand::new(request);
        self.execute(&mut command);
        command.into_result()
    }

    /// Run the command on a pooled worker and resolve to its outcome.
    pub fn submit(&self, command: HttpCommand) -> impl Future<Output = Result<HttpResponse, HttpError>> + Send + 'static {
        let finished = self.submit_command(command);
        async move { finished.await?.into_result() }
    }

    /// Like `submit`, but resolves to the finished command itself.
    pub fn submit_command(
        &self,
        mut command: HttpCommand,
    ) -> impl Future<Output = Result<HttpCommand, HttpError>> + Send + 'static {
        let executor = self.clone();
        async move {
            let permit = executor
                .inner
                .pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| HttpError::Worker(e.to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                executor.execute(&mut command);
                command
            })
            .await
            .map_err(|e| HttpError::Worker(e.to_string()))
        }
    }

    fn attempt(&self, command: &mut HttpCommand, attempt: u32) -> ControlFlow<()> {
        let inner = &*self.inner;
        let mut request = command.current_request().clone();

        if let Err(err) = check_required_properties(&request) {
            command.set_error(err);
            return ControlFlow::Break(());
        }
        for filter in request.filters.clone() {
            request = match filter.filter(request) {
                Ok(filtered) => filtered,
                Err(err) => {
                    command.set_error(err);
                    return ControlFlow::Break(());
                }
            };
        }
        if let Err(err) = check_content_length_or_chunked(&request, "after filtering") {
            command.set_error(err);
            return ControlFlow::Break(());
        }

        debug!(command = %command.id(), attempt, "sending request: {}", request.request_line());
        if inner.wire.enabled() {
            if let Err(err) = inner.wire.output(&mut request) {
                return self.on_io_error(command, &request, err);
            }
            if let Err(err) = check_content_length_or_chunked(&request, "after wiring") {
                command.set_error(err);
                return ControlFlow::Break(());
            }
        }
        log_request(&request);

        let native = match inner.transport.convert(&request) {
            Ok(native) => native,
            Err(err) => return self.on_transport_error(command, &request, err),
        };
        let mut guard = NativeGuard {
            transport: &inner.transport,
            native: Some(native),
        };
        let result = match guard.native.as_mut() {
            Some(native) => inner.transport.invoke(native),
            None => Err(TransportError::Io(io::Error::other("native request already released"))),
        };

        let mut response = match result {
            Ok(response) => response,
            Err(err) => return self.on_transport_error(command, &request, err),
        };
        debug!(command = %command.id(), attempt, "receiving response: {}", response.status_line());
        log_response(&response);
        if let Err(err) = inner.wire.input(&mut response) {
            warn!(command = %command.id(), error = %err, "could not read response payload for the wire log");
            response.release_payload();
            return self.on_io_error(command, &request, err);
        }

        if response.status < 300 {
            command.set_response(response);
            return ControlFlow::Break(());
        }
        if inner.retry_handler.should_retry_request(command, &response) {
            response.release_payload();
            return ControlFlow::Continue(());
        }

        let fallback = ErrorResponse {
            status: response.status,
            message: response.message.clone(),
            body: None,
        };
        inner.error_handler.handle_error(command, response);
        if !command.is_done() {
            command.set_error(HttpError::Response {
                request_line: command.current_request().request_line(),
                response: fallback,
            });
        }
        ControlFlow::Break(())
    }

    fn on_transport_error(&self, command: &mut HttpCommand, request: &HttpRequest, err: TransportError) -> ControlFlow<()> {
        match err {
            TransportError::Tls(message) => {
                warn!(command = %command.id(), "TLS failure connecting to {}: {message}", request.request_line());
                command.set_error(HttpError::Authorization {
                    message: format!("{message} connecting to {}", request.request_line()),
                    response: None,
                    source: None,
                });
                ControlFlow::Break(())
            }
            TransportError::Io(err) => self.on_io_error(command, request, err),
        }
    }

    fn on_io_error(&self, command: &mut HttpCommand, request: &HttpRequest, err: io::Error) -> ControlFlow<()> {
        if self.inner.io_retry_handler.should_retry_request(command, &err) {
            return ControlFlow::Continue(());
        }
        command.set_error(HttpError::Transport {
            request_line: request.request_line(),
            source: err,
        });
        ControlFlow::Break(())
    }
}

pub struct HttpCommandExecutorBuilder<T: HttpTransport> {
    transport: T,
    config: ExecutorConfig,
    retry_handler: Option<Arc<dyn HttpRetryHandler>>,
    io_retry_handler: Option<Arc<dyn IoRetryHandler>>,
    error_handler: Option<Arc<dyn HttpErrorHandler>>,
    wire: Option<Wire>,
}

impl<T: HttpTransport> HttpCommandExecutorBuilder<T> {
    /// Defaults for every handler not set explicitly are derived from this.
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_handler(mut self, handler: Arc<dyn HttpRetryHandler>) -> Self {
        self.retry_handler = Some(handler);
        self
    }

    pub fn io_retry_handler(mut self, handler: Arc<dyn IoRetryHandler>) -> Self {
        self.io_retry_handler = Some(handler);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn HttpErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn wire(mut self, wire: Wire) -> Self {
        self.wire = Some(wire);
        self
    }

    pub fn build(self) -> HttpCommandExecutor<T> {
        let config = self.config;
        let wire = self.wire.unwrap_or_else(|| {
            let wire = Wire::from_config(&config);
            match Handle::try_current() {
                Ok(handle) => wire.with_runtime(handle),
                Err(_) => wire,
            }
        });
        HttpCommandExecutor {
            inner: Arc::new(Inner {
                transport: self.transport,
                retry_handler: self
                    .retry_handler
                    .unwrap_or_else(|| Arc::new(DelegatingRetryHandler::from_config(&config))),
                io_retry_handler: self
                    .io_retry_handler
                    .unwrap_or_else(|| Arc::new(BackoffLimitedRetryHandler::from_config(&config))),
                error_handler: self
                    .error_handler
                    .unwrap_or_else(|| Arc::new(DelegatingErrorHandler::default())),
                wire,
                pool: Arc::new(Semaphore::new(config.io_worker_threads.max(1))),
            }),
        }
    }
}
