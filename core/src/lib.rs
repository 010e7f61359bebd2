//! Retrying HTTP command execution for cloud storage style APIs.
//!
//! # Overview
//! A caller describes a request as plain data (`HttpRequest`), wraps it in
//! an `HttpCommand` and hands it to an `HttpCommandExecutor`. The executor
//! signs and decorates the request through its filters, sends it through an
//! `HttpTransport`, follows redirects, backs off on throttling and server
//! errors, and turns final failures into typed `HttpError`s.
//!
//! # Design
//! - The transport is a trait; `UreqTransport` is the blocking default and
//!   tests substitute scripted transports.
//! - Retry and error policies are trait objects chosen per executor, with
//!   defaults derived from `ExecutorConfig`.
//! - Commands run synchronously via `execute`, or on a bounded pool of
//!   blocking workers via `submit`.
//! - Payloads declare their length up front or travel chunked; the
//!   executor refuses anything else before it reaches the wire.
//! - Wire and header logging go through `tracing` on the
//!   `cloudhttp::wire` and `cloudhttp::headers` targets.

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod filter;
pub mod handlers;
pub mod http;
pub mod payload;
pub mod retry;
pub mod transport;
pub mod wire;

pub use client::CloudClient;
pub use command::HttpCommand;
pub use config::ExecutorConfig;
pub use error::{ErrorResponse, HttpError, TransportError};
pub use executor::{HttpCommandExecutor, HttpCommandExecutorBuilder, HttpTransport};
pub use filter::{AddDefaultHeaders, BasicAuthentication, HttpRequestFilter, SharedKeySignature};
pub use handlers::{DelegatingErrorHandler, HttpErrorHandler};
pub use http::{HttpMessage, HttpMethod, HttpRequest, HttpResponse};
pub use payload::{ContentMetadata, Payload};
pub use retry::{BackoffLimitedRetryHandler, DelegatingRetryHandler, HttpRetryHandler, IoRetryHandler};
pub use transport::UreqTransport;
pub use wire::Wire;
