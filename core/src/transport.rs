//! Blocking transport backed by ureq.
//!
//! ureq is configured so that every status comes back as a response and no
//! redirect is followed; both are the executor's business.

use std::io;

use tracing::trace;
use ureq::http;
use ureq::{Agent, SendBody};

use crate::config::ExecutorConfig;
use crate::error::TransportError;
use crate::executor::HttpTransport;
use crate::http::{filter_out_content_headers, HttpMethod, HttpRequest, HttpResponse, TRANSFER_ENCODING};
use crate::payload::{BoxedReader, ContentMetadata, Payload, CONTENT_LENGTH};

const USER_AGENT: &str = "User-Agent";

/// A request ready for ureq. The body reader is opened at conversion time
/// and dropped on cleanup.
pub struct UreqRequest {
    request: Option<http::Request<()>>,
    body: Option<BoxedReader>,
}

#[derive(Clone)]
pub struct UreqTransport {
    agent: Agent,
    user_agent: String,
}

impl UreqTransport {
    pub fn new(config: &ExecutorConfig) -> Self {
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(0)
            .timeout_connect(Some(config.connection_timeout()))
            .timeout_recv_response(Some(config.so_timeout()))
            .timeout_recv_body(Some(config.so_timeout()))
            .build()
            .into();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(&ExecutorConfig::default())
    }
}

fn invalid(err: impl std::fmt::Display) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
}

/// rustls reports handshake and certificate failures as IO errors wrapping
/// a `rustls::Error`.
fn is_tls_failure(err: &io::Error) -> bool {
    let mut source = err.get_ref().map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(e) = source {
        if e.is::<rustls::Error>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn map_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Io(e) if is_tls_failure(&e) => TransportError::Tls(format!("tls handshake failed: {e}")),
        ureq::Error::Io(e) => TransportError::Io(e),
        ureq::Error::Tls(message) => TransportError::Tls(message.to_string()),
        ureq::Error::Rustls(e) => TransportError::Tls(format!("rustls: {e}")),
        ureq::Error::Timeout(t) => TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, t.to_string())),
        ureq::Error::HostNotFound => TransportError::Io(io::Error::new(io::ErrorKind::NotFound, "host not found")),
        ureq::Error::ConnectionFailed => {
            TransportError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "connection failed"))
        }
        other => {
            let message = other.to_string();
            let lower = message.to_ascii_lowercase();
            if ["tls", "ssl", "certificate"].iter().any(|k| lower.contains(k)) {
                TransportError::Tls(message)
            } else {
                TransportError::Io(io::Error::other(message))
            }
        }
    }
}

impl HttpTransport for UreqTransport {
    type NativeRequest = UreqRequest;

    fn convert(&self, request: &HttpRequest) -> Result<UreqRequest, TransportError> {
        let mut builder = http::Request::builder()
            .method(request.method.as_str())
            .uri(request.endpoint.as_str());
        let mut has_user_agent = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case(TRANSFER_ENCODING) {
                continue;
            }
            has_user_agent |= name.eq_ignore_ascii_case(USER_AGENT);
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_user_agent {
            builder = builder.header(USER_AGENT, self.user_agent.as_str());
        }

        let mut body = None;
        if let Some(payload) = &request.payload {
            for (name, value) in payload.metadata_headers() {
                builder = builder.header(name, value);
            }
            body = Some(payload.open()?);
        } else if matches!(request.method, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch) {
            builder = builder.header(CONTENT_LENGTH, "0");
        }

        Ok(UreqRequest {
            request: Some(builder.body(()).map_err(invalid)?),
            body,
        })
    }

    fn invoke(&self, native: &mut UreqRequest) -> Result<HttpResponse, TransportError> {
        let request = native
            .request
            .take()
            .ok_or_else(|| invalid("request was already sent"))?;
        let is_head = request.method() == http::Method::HEAD;
        let response = match native.body.as_mut() {
            Some(reader) => {
                let (parts, ()) = request.into_parts();
                self.agent
                    .run(http::Request::from_parts(parts, SendBody::from_reader(reader)))
            }
            None => self.agent.run(request),
        }
        .map_err(map_error)?;

        let status = response.status();
        let message = status.canonical_reason().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();

        let mut out = HttpResponse::new(status.as_u16(), message);
        let with_body = !is_head && has_body(&headers, status.as_u16());
        let metadata = ContentMetadata::from_headers(&headers);
        if with_body {
            out.headers = filter_out_content_headers(&headers);
            let mut payload = Payload::from_reader(response.into_body().into_reader(), metadata.content_length);
            *payload.metadata_mut() = metadata;
            out.payload = Some(payload);
        } else {
            out.headers = headers;
        }
        Ok(out)
    }

    fn cleanup(&self, native: UreqRequest) {
        trace!(sent = native.request.is_none(), "releasing native request");
        drop(native);
    }
}

/// Whether a response with these headers and status carries a body.
fn has_body(headers: &[(String, String)], status: u16) -> bool {
    if matches!(status, 204 | 304) || (100..200).contains(&status) {
        return false;
    }
    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(CONTENT_LENGTH))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok());
    let chunked = headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case(TRANSFER_ENCODING) && value.to_ascii_lowercase().contains("chunked"));
    chunked || length.is_some_and(|len| len > 0)
}
