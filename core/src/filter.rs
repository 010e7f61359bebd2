//! Request filters: rewrite a request right before it is sent.
//!
//! Filters run on every attempt, including attempts against a redirect
//! target, so signatures and dates are always fresh. A redirect to another
//! host sheds the filters that attach credentials.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::error::HttpError;
use crate::http::{HttpMessage, HttpRequest, AUTHORIZATION};

pub const DATE: &str = "Date";

pub trait HttpRequestFilter: Send + Sync {
    fn filter(&self, request: HttpRequest) -> Result<HttpRequest, HttpError>;

    /// Filters that attach credentials are dropped when a redirect leaves
    /// the original host.
    fn carries_credentials(&self) -> bool {
        false
    }
}

impl<F> HttpRequestFilter for F
where
    F: Fn(HttpRequest) -> Result<HttpRequest, HttpError> + Send + Sync,
{
    fn filter(&self, request: HttpRequest) -> Result<HttpRequest, HttpError> {
        self(request)
    }
}

/// `Authorization: Basic base64(user:password)`
#[derive(Debug, Clone)]
pub struct BasicAuthentication {
    header: String,
}

impl BasicAuthentication {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            header: format!("Basic {}", STANDARD.encode(format!("{user}:{password}"))),
        }
    }
}

impl HttpRequestFilter for BasicAuthentication {
    fn filter(&self, request: HttpRequest) -> Result<HttpRequest, HttpError> {
        Ok(request.replace_header(AUTHORIZATION, self.header.clone()))
    }

    fn carries_credentials(&self) -> bool {
        true
    }
}

/// Adds headers the request does not already carry, e.g. `User-Agent`.
#[derive(Debug, Clone, Default)]
pub struct AddDefaultHeaders {
    headers: Vec<(String, String)>,
}

impl AddDefaultHeaders {
    pub fn new(headers: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            headers: headers.into_iter().collect(),
        }
    }
}

impl HttpRequestFilter for AddDefaultHeaders {
    fn filter(&self, mut request: HttpRequest) -> Result<HttpRequest, HttpError> {
        for (name, value) in &self.headers {
            if request.first_header(name).is_none() {
                request = request.with_header(name.clone(), value.clone());
            }
        }
        Ok(request)
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared-key request signing in the style of S3.
///
/// The string to sign is:
///
/// ```text
/// METHOD\n
/// Content-MD5\n
/// Content-Type\n
/// Date\n
/// x-vendor-header:value\n   (lower-cased, sorted, one per line)
/// /path
/// ```
///
/// and the request gets `Authorization: <scheme> <identity>:<signature>`
/// where the signature is base64(HMAC-SHA256(secret, string-to-sign)).
#[derive(Clone)]
pub struct SharedKeySignature {
    scheme: String,
    identity: String,
    secret: Vec<u8>,
    clock: Clock,
}

impl SharedKeySignature {
    pub fn new(scheme: impl Into<String>, identity: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.into(),
            identity: identity.into(),
            secret: secret.into(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn string_to_sign(&self, request: &HttpRequest) -> Result<String, HttpError> {
        let url = Url::parse(&request.endpoint)
            .map_err(|e| HttpError::InvalidRequest(format!("bad endpoint {}: {e}", request.endpoint)))?;
        let metadata = request.payload.as_ref().map(|p| p.metadata());
        let md5 = metadata
            .and_then(|m| m.content_md5)
            .map(|md5| STANDARD.encode(md5))
            .unwrap_or_default();
        let content_type = metadata
            .and_then(|m| m.content_type.clone())
            .unwrap_or_default();
        let date = request.first_header(DATE).unwrap_or_default();

        let mut out = format!("{}\n{md5}\n{content_type}\n{date}\n", request.method);

        let mut vendor: Vec<(String, &str)> = request
            .headers
            .iter()
            .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-"))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();
        vendor.sort();
        for (name, value) in vendor {
            out.push_str(&format!("{name}:{value}\n"));
        }
        out.push_str(url.path());
        Ok(out)
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, HttpError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| HttpError::InvalidRequest(format!("unusable signing key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl HttpRequestFilter for SharedKeySignature {
    fn filter(&self, request: HttpRequest) -> Result<HttpRequest, HttpError> {
        let date = (self.clock)().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let request = request.replace_header(DATE, date);
        let signature = self.sign(&self.string_to_sign(&request)?)?;
        Ok(request.replace_header(
            AUTHORIZATION,
            format!("{} {}:{signature}", self.scheme, self.identity),
        ))
    }

    fn carries_credentials(&self) -> bool {
        true
    }
}
