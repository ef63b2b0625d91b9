use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ViewerError;

pub const MAX_URL_LENGTH: usize = 2048;

/// A request target: either a path relative to the hosting page or an
/// absolute `http(s)` URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath(String);

impl ResourcePath {
    pub fn new(path: impl Into<String>) -> Result<Self, ViewerError> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(path: &str) -> Result<(), ViewerError> {
        if path.trim().is_empty() {
            return Err(ViewerError::validation("resource path cannot be empty"));
        }
        if path.len() > MAX_URL_LENGTH {
            return Err(ViewerError::validation(format!(
                "resource path exceeds maximum length of {MAX_URL_LENGTH} bytes"
            )));
        }
        if path.chars().any(char::is_control) {
            return Err(ViewerError::validation(
                "resource path contains control characters",
            ));
        }
        if let Some((scheme, _)) = path.split_once(':') {
            let scheme = scheme.to_ascii_lowercase();
            let looks_like_scheme = !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
            if looks_like_scheme && scheme != "http" && scheme != "https" {
                return Err(ViewerError::validation(format!(
                    "invalid scheme '{scheme}', only 'http' and 'https' are allowed"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: HttpMethod,
    path: ResourcePath,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: ResourcePath) -> Self {
        Self { method, path }
    }

    pub fn get(path: ResourcePath) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn head(path: ResourcePath) -> Self {
        Self::new(HttpMethod::Head, path)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    status: u16,
    body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Transport-level failures reported by the host's fetch facility. HTTP
/// statuses are not errors at this level; see [`classify_status`].
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpError {
    #[error("DNS resolution failed for {host}: {message}")]
    DnsError { host: String, message: String },

    #[error("connection failed: {message}")]
    ConnectionError { message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },
}

impl HttpError {
    pub fn into_viewer_error(self, method: HttpMethod, path: &ResourcePath) -> ViewerError {
        match self {
            HttpError::Timeout { timeout_ms } => ViewerError::Timeout {
                operation: format!("{} {path}", method.as_str()),
                timeout_ms,
            },
            HttpError::InvalidResponse { reason } => ViewerError::corrupt(path.as_str(), reason),
            other => ViewerError::network(format!("{} {path}: {other}", method.as_str())),
        }
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Maps an HTTP status onto the crate's error kinds at the point it is
/// received.
pub fn classify_status(status: u16, path: &ResourcePath) -> Result<(), ViewerError> {
    match status {
        200..=299 => Ok(()),
        404 | 410 => Err(ViewerError::not_found(path.as_str())),
        401 | 403 => Err(ViewerError::Forbidden {
            resource: path.to_string(),
        }),
        408 => Err(ViewerError::Timeout {
            operation: format!("GET {path}"),
            timeout_ms: 0,
        }),
        429 => Err(ViewerError::network(format!("rate limited fetching {path}"))),
        500..=599 => Err(ViewerError::Server {
            status,
            resource: path.to_string(),
        }),
        400..=499 => Err(ViewerError::validation(format!(
            "request for {path} rejected with HTTP {status}"
        ))),
        _ => Err(ViewerError::network(format!(
            "unexpected HTTP {status} for {path}"
        ))),
    }
}

/// HEAD-style existence check. Servers that refuse HEAD (405/501) are
/// treated as inconclusive and let the full fetch decide.
pub async fn probe(client: &dyn HttpClient, path: &ResourcePath) -> Result<(), ViewerError> {
    let response = client
        .send(HttpRequest::head(path.clone()))
        .await
        .map_err(|e| e.into_viewer_error(HttpMethod::Head, path))?;

    match response.status() {
        405 | 501 => {
            debug!(%path, status = response.status(), "HEAD not supported, skipping probe");
            Ok(())
        }
        status => classify_status(status, path),
    }
}

pub async fn fetch_bytes(client: &dyn HttpClient, path: &ResourcePath) -> Result<Bytes, ViewerError> {
    let response = client
        .send(HttpRequest::get(path.clone()))
        .await
        .map_err(|e| e.into_viewer_error(HttpMethod::Get, path))?;
    classify_status(response.status(), path)?;
    Ok(response.into_body())
}
