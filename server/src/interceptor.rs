//! HTTP traffic interceptor – sits in front of the API namespace.
//!
//! Depending on the shared session state a request is either forwarded
//! untouched, forwarded and captured into the live recording, or answered
//! from the queue of responses recorded earlier.

use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{debug, error};

use rewind_common::recording::{
    HeaderSnapshot, HeaderValues, ResponseHead, ResponseMeta, XhrResponse,
};

use crate::sessions::{Sessions, Traffic};

/// Largest request body forwarded to the API server.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("replay queue exhausted: the client made more API calls than were recorded")]
    ReplayExhausted,
    #[error("recorded response is malformed: {0}")]
    MalformedRecord(#[from] serde_json::Error),
    #[error("recorded status code {0} is invalid")]
    InvalidStatus(u16),
    #[error("cannot read request body: {0}")]
    RequestBody(#[from] axum::Error),
    #[error("API server request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

impl IntoResponse for InterceptError {
    fn into_response(self) -> Response {
        error!("API interception failed: {self}");
        let status = match self {
            InterceptError::RequestBody(_) => StatusCode::BAD_REQUEST,
            InterceptError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub struct Interceptor {
    client: reqwest::Client,
    upstream: String,
    sessions: Arc<Sessions>,
}

/// A fully buffered response from the API server.
struct Upstream {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Interceptor {
    pub fn new(upstream: &str, timeout: Duration, sessions: Arc<Sessions>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Cannot build HTTP client")?;
        Ok(Interceptor {
            client,
            upstream: upstream.trim_end_matches('/').to_string(),
            sessions,
        })
    }

    pub async fn handle(&self, request: Request) -> Result<Response, InterceptError> {
        match self.sessions.route_response() {
            Traffic::PassThrough => {
                let upstream = self.forward(request).await?;
                Ok(build_response(upstream.status, upstream.headers, upstream.body))
            }
            Traffic::Record => self.record(request).await,
            Traffic::Replay(Some(entry)) => replay(entry),
            Traffic::Replay(None) => Err(InterceptError::ReplayExhausted),
        }
    }

    async fn record(&self, request: Request) -> Result<Response, InterceptError> {
        let upstream = self.forward(request).await?;
        let head = ResponseHead {
            status_code: upstream.status.as_u16(),
            status_message: upstream.status.canonical_reason().map(String::from),
            headers: snapshot(&upstream.headers),
        };
        let body = parse_body(&upstream.body, is_json(&head.headers));

        let response = build_response(upstream.status, upstream.headers, upstream.body);

        let captured = XhrResponse {
            headers: head,
            body,
            get_headers: snapshot(response.headers()),
            meta: ResponseMeta {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };
        if !self.sessions.push_xhr_response(captured.to_value()?) {
            debug!("Recording stopped before the API response finished – not captured");
        }
        Ok(response)
    }

    async fn forward(&self, request: Request) -> Result<Upstream, InterceptError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY).await?;

        let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = format!("{}{}", self.upstream, path);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(axum::http::header::HOST);
        // Bodies are captured as JSON, so ask for them uncompressed.
        headers.remove(axum::http::header::ACCEPT_ENCODING);

        debug!("{} {url}", parts.method);
        let resp = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(Upstream {
            status,
            headers,
            body,
        })
    }
}

/// Answer from a recorded entry without contacting the API server.
fn replay(entry: Value) -> Result<Response, InterceptError> {
    let recorded = XhrResponse::from_value(entry)?;
    let status = StatusCode::from_u16(recorded.headers.status_code)
        .map_err(|_| InterceptError::InvalidStatus(recorded.headers.status_code))?;

    let source = if recorded.headers.headers.is_empty() {
        &recorded.get_headers
    } else {
        &recorded.headers.headers
    };
    let mut headers = HeaderMap::new();
    for (name, values) in source {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values.iter() {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    let body = replay_body(&recorded.body, is_json(source));
    Ok(build_response(status, headers, body))
}

fn build_response(status: StatusCode, mut headers: HeaderMap, body: Bytes) -> Response {
    strip_hop_by_hop(&mut headers);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn snapshot(headers: &HeaderMap) -> HeaderSnapshot {
    let mut snapshot = HeaderSnapshot::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match snapshot.entry(name.as_str().to_string()) {
            Entry::Occupied(mut existing) => existing.get_mut().push(value),
            Entry::Vacant(slot) => {
                slot.insert(HeaderValues::One(value));
            }
        }
    }
    snapshot
}

/// Body as a structured value: parsed when the response is declared JSON
/// and parses, the raw text otherwise, null when empty.
fn parse_body(body: &[u8], json: bool) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    let text = || Value::String(String::from_utf8_lossy(body).into_owned());
    if json {
        serde_json::from_slice(body).unwrap_or_else(|_| text())
    } else {
        text()
    }
}

fn replay_body(body: &Value, json: bool) -> Bytes {
    match body {
        Value::Null if !json => Bytes::new(),
        Value::String(text) if !json => Bytes::from(text.clone()),
        body => Bytes::from(body.to_string()),
    }
}

fn is_json(headers: &HeaderSnapshot) -> bool {
    headers
        .get(CONTENT_TYPE.as_str())
        .is_some_and(|values| values.iter().any(|v| v.contains("json")))
}
