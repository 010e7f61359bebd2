//! HTTP messages as plain data.
//!
//! # Design
//! `HttpRequest` and `HttpResponse` describe a message independently of the
//! transport that eventually carries it. The executor converts a request to
//! the transport's native form only after every filter has run, so filters
//! see and return these types.
//!
//! Headers are an ordered list of `(name, value)` pairs. Lookup is
//! case-insensitive and a name may appear more than once. Content headers are
//! not stored here: they belong to the payload's `ContentMetadata`.

use std::fmt;
use std::sync::Arc;

use crate::error::HttpError;
use crate::filter::HttpRequestFilter;
use crate::payload::{Payload, CONTENT_HEADERS};

pub const AUTHORIZATION: &str = "Authorization";
pub const HOST: &str = "Host";
pub const LOCATION: &str = "Location";
pub const RETRY_AFTER: &str = "Retry-After";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CONTENT_RANGE: &str = "Content-Range";

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        let method = match method.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "OPTIONS" => HttpMethod::Options,
            _ => return None,
        };
        Some(method)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something with headers and an optional payload.
pub trait HttpMessage {
    fn headers(&self) -> &[(String, String)];
    fn payload(&self) -> Option<&Payload>;

    fn first_header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_values<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a str> + 'a> {
        Box::new(
            self.headers()
                .iter()
                .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
        )
    }

    fn is_chunked(&self) -> bool {
        self.first_header(TRANSFER_ENCODING)
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }
}

/// An HTTP request described as plain data.
///
/// The `filters` run in order right before each send attempt. They are
/// carried by the request so that a redirect keeps signing the new target,
/// unless the target is on another host.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Payload>,
    pub filters: Vec<Arc<dyn HttpRequestFilter>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: Vec::new(),
            payload: None,
            filters: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace every value of `name` with a single `value`.
    pub fn replace_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn without_payload(mut self) -> Self {
        self.payload = None;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn HttpRequestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = Arc<dyn HttpRequestFilter>>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Drop every filter that would attach credentials.
    pub fn without_credential_filters(mut self) -> Self {
        self.filters.retain(|f| !f.carries_credentials());
        self
    }

    /// `GET https://host/path HTTP/1.1`
    pub fn request_line(&self) -> String {
        format!("{} {} HTTP/1.1", self.method, self.endpoint)
    }
}

impl HttpMessage for HttpRequest {
    fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.request_line())
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub message: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Payload>,
}

impl HttpResponse {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: Vec::new(),
            payload: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// `HTTP/1.1 404 Not Found`
    pub fn status_line(&self) -> String {
        format!("HTTP/1.1 {} {}", self.status, self.message)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the payload as UTF-8 (lossy). The payload is buffered first so
    /// the body stays readable for later consumers.
    pub fn payload_as_string(&mut self) -> Option<String> {
        let payload = self.payload.as_mut()?;
        let bytes = payload.buffer().ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn release_payload(&self) {
        if let Some(payload) = &self.payload {
            payload.release();
        }
    }
}

impl HttpMessage for HttpResponse {
    fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }
}

/// A message with a payload must declare a length or be chunked.
pub fn check_content_length_or_chunked(message: &impl HttpMessage, context: &str) -> Result<(), HttpError> {
    let Some(payload) = message.payload() else {
        return Ok(());
    };
    if payload.metadata().content_length.is_some() || message.is_chunked() {
        return Ok(());
    }
    Err(HttpError::InvalidRequest(format!(
        "{context}: the request has neither chunked encoding nor content length"
    )))
}

/// Content headers must travel in the payload metadata, never as raw headers.
pub fn check_required_properties(request: &HttpRequest) -> Result<(), HttpError> {
    if request.payload.is_none() {
        return Ok(());
    }
    for name in CONTENT_HEADERS {
        if request.first_header(name).is_some() {
            return Err(HttpError::InvalidRequest(format!(
                "configuration error: set {name} on the payload metadata rather than as a header: {}",
                request.request_line()
            )));
        }
    }
    check_content_length_or_chunked(request, "before filtering")
}

/// Total object size, from `Content-Range: bytes a-b/total` when present,
/// otherwise the payload length.
pub fn parse_size_from_headers(message: &impl HttpMessage) -> Result<Option<u64>, HttpError> {
    match message.first_header(CONTENT_RANGE) {
        Some(range) => {
            let total = range.rsplit('/').next().unwrap_or_default().trim();
            total.parse().map(Some).map_err(|_| {
                HttpError::InvalidRequest(format!("could not parse size from Content-Range: {range}"))
            })
        }
        None => Ok(message.payload().and_then(|p| p.metadata().content_length)),
    }
}

/// Drop headers that are represented by `ContentMetadata`.
pub fn filter_out_content_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(k, _)| !CONTENT_HEADERS.iter().any(|c| k.eq_ignore_ascii_case(c)))
        .cloned()
        .collect()
}
