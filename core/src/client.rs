//! Blob-store style facade over the executor.
//!
//! # Design
//! `CloudClient` binds an endpoint, a list of filters and an executor. Each
//! operation is split into building an `HttpRequest` and running it, so a
//! request can be inspected or adjusted before it is sent. Paths are joined
//! onto the endpoint without further escaping.

use std::future::Future;
use std::sync::Arc;

use crate::command::HttpCommand;
use crate::error::HttpError;
use crate::executor::{HttpCommandExecutor, HttpTransport};
use crate::filter::HttpRequestFilter;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::payload::{ContentMetadata, Payload};

pub struct CloudClient<T: HttpTransport> {
    endpoint: String,
    filters: Vec<Arc<dyn HttpRequestFilter>>,
    executor: HttpCommandExecutor<T>,
}

impl<T: HttpTransport> Clone for CloudClient<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            filters: self.filters.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<T: HttpTransport> CloudClient<T> {
    pub fn new(endpoint: &str, executor: HttpCommandExecutor<T>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            filters: Vec::new(),
            executor,
        }
    }

    /// Attach a filter to every request this client builds.
    pub fn with_filter(mut self, filter: Arc<dyn HttpRequestFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn executor(&self) -> &HttpCommandExecutor<T> {
        &self.executor
    }

    pub fn build_request(&self, method: HttpMethod, path: &str, payload: Option<Payload>) -> HttpRequest {
        let mut request = HttpRequest::new(method, format!("{}/{}", self.endpoint, path.trim_start_matches('/')))
            .with_filters(self.filters.iter().cloned());
        request.payload = payload;
        request
    }

    /// Run `request` on the calling thread.
    pub fn invoke(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.executor.execute_request(request)
    }

    /// Run `request` on the executor's worker pool.
    pub fn submit(&self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse, HttpError>> + Send + 'static {
        self.executor.submit(HttpCommand::new(request))
    }

    pub fn get(&self, path: &str) -> Result<HttpResponse, HttpError> {
        self.invoke(self.build_request(HttpMethod::Get, path, None))
    }

    /// Content metadata of the object at `path`.
    pub fn head(&self, path: &str) -> Result<ContentMetadata, HttpError> {
        let response = self.invoke(self.build_request(HttpMethod::Head, path, None))?;
        let mut headers = response.headers.clone();
        if let Some(payload) = &response.payload {
            headers.extend(payload.metadata_headers());
        }
        Ok(ContentMetadata::from_headers(&headers))
    }

    pub fn put(&self, path: &str, payload: impl Into<Payload>) -> Result<HttpResponse, HttpError> {
        self.invoke(self.build_request(HttpMethod::Put, path, Some(payload.into())))
    }

    /// Delete the object at `path`. A missing object is not an error;
    /// `Ok(false)` reports that nothing was there.
    pub fn delete(&self, path: &str) -> Result<bool, HttpError> {
        match self.invoke(self.build_request(HttpMethod::Delete, path, None)) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}
