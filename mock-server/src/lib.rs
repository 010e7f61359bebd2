use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, RwLock},
};
use tracing::info;
use uuid::Uuid;

/// A stored object.
#[derive(Clone, Debug)]
pub struct Blob {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
    pub etag: String,
}

/// Body of every error response, in the shape blob stores commonly use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDocument {
    pub code: String,
    pub message: String,
}

#[derive(Deserialize)]
pub struct FlakyParams {
    #[serde(default)]
    pub failures: u32,
    pub status: Option<u16>,
}

#[derive(Clone, Default)]
pub struct AppState {
    pub blobs: Arc<RwLock<HashMap<(String, String), Blob>>>,
    pub calls: Arc<Mutex<HashMap<String, u32>>>,
}

pub fn app() -> Router {
    Router::new()
        .route("/buckets/{bucket}/{*key}", get(get_blob).put(put_blob).delete(delete_blob))
        .route("/moved/{bucket}/{*key}", get(moved))
        .route("/flaky/{id}", get(flaky))
        .route("/private/{*key}", get(private))
        .with_state(AppState::default())
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let doc = ErrorDocument {
        code: code.to_string(),
        message: message.into(),
    };
    (status, Json(doc)).into_response()
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn put_blob(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    data: Bytes,
) -> Response {
    let blob = Blob {
        data,
        content_type: header_string(&headers, header::CONTENT_TYPE),
        content_md5: header_string(&headers, header::HeaderName::from_static("content-md5")),
        etag: format!("\"{}\"", Uuid::new_v4().simple()),
    };
    info!(%bucket, %key, size = blob.data.len(), "stored blob");
    let etag = blob.etag.clone();
    let md5 = blob.content_md5.clone();
    state.blobs.write().await.insert((bucket, key), blob);

    let mut response = (StatusCode::CREATED, [(header::ETAG, etag)]).into_response();
    if let Some(md5) = md5.and_then(|v| HeaderValue::from_str(&v).ok()) {
        response.headers_mut().insert("content-md5", md5);
    }
    response
}

async fn get_blob(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>) -> Response {
    let blobs = state.blobs.read().await;
    let Some(blob) = blobs.get(&(bucket, key.clone())) else {
        return error(StatusCode::NOT_FOUND, "NoSuchKey", format!("no such key: {key}"));
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(blob.data.len()));
    if let Ok(etag) = HeaderValue::from_str(&blob.etag) {
        headers.insert(header::ETAG, etag);
    }
    if let Some(value) = blob.content_type.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(value) = blob.content_md5.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert("content-md5", value);
    }
    (StatusCode::OK, headers, blob.data.clone()).into_response()
}

async fn delete_blob(State(state): State<AppState>, Path((bucket, key)): Path<(String, String)>) -> Response {
    match state.blobs.write().await.remove(&(bucket, key.clone())) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "NoSuchKey", format!("no such key: {key}")),
    }
}

async fn moved(Path((bucket, key)): Path<(String, String)>) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, format!("/buckets/{bucket}/{key}"))]).into_response()
}

async fn flaky(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FlakyParams>,
) -> Response {
    let mut calls = state.calls.lock().await;
    let count = calls.entry(id.clone()).or_insert(0);
    *count += 1;
    if *count <= params.failures {
        let status = StatusCode::from_u16(params.status.unwrap_or(503)).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        info!(%id, call = *count, status = status.as_u16(), "failing on purpose");
        return error(status, "ServiceUnavailable", format!("call {} of {id} fails", *count));
    }
    (StatusCode::OK, format!("ok after {} calls", *count)).into_response()
}

async fn private(Path(key): Path<String>, headers: HeaderMap) -> Response {
    if headers.contains_key(header::AUTHORIZATION) {
        return (StatusCode::OK, format!("secret:{key}")).into_response();
    }
    error(StatusCode::FORBIDDEN, "AccessDenied", "missing credentials")
}
