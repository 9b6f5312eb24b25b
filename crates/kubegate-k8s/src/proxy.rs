//! Single REST calls against a cluster on behalf of the client

use std::fmt;
use std::str::FromStr;

use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use kube::client::Body;
use thiserror::Error;

use crate::client::ClusterClient;

/// Errors from a proxied REST call
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unsupported request method {0:?}")]
    UnsupportedMethod(String),

    #[error("invalid request URL {0:?}")]
    InvalidUrl(String),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("Unauthorized")]
    Unauthorized,

    /// The verbatim response body of a non-2xx answer
    #[error("{body}")]
    Upstream { status: StatusCode, body: String },

    #[error(transparent)]
    Transport(kube::Error),

    #[error("could not read response body: {0}")]
    Body(String),
}

/// The verbs the proxy forwards
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl ProxyMethod {
    fn http_method(self) -> Method {
        match self {
            Self::Get => Method::GET,
            Self::Post => Method::POST,
            Self::Patch => Method::PATCH,
            Self::Delete => Method::DELETE,
        }
    }

    /// Content type of the request body, `None` when no body is sent
    fn content_type(self) -> Option<&'static str> {
        match self {
            Self::Get => None,
            Self::Post | Self::Delete => Some("application/json"),
            // JSON-Patch, not merge or strategic-merge patch
            Self::Patch => Some("application/json-patch+json"),
        }
    }
}

impl FromStr for ProxyMethod {
    type Err = ProxyError;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        match method {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(ProxyError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for ProxyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.http_method().as_str())
    }
}

/// Prefix an in-cluster path with the server origin
pub fn resolve_url(server: &str, path: &str) -> String {
    format!("{}{}", server.trim_end_matches('/'), request_path(path))
}

/// The path-and-query sent to the client, always rooted
fn request_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Issues REST calls through a factory-built client
pub struct ProxyExecutor {
    client: kube::Client,
    server: String,
}

impl ProxyExecutor {
    pub fn new(cluster: &ClusterClient, server: &str) -> Self {
        Self {
            client: cluster.client.clone(),
            server: server.to_string(),
        }
    }

    /// Execute one call and return the raw response body.
    ///
    /// Non-2xx answers become errors carrying the upstream body verbatim;
    /// 401 is always reported as `ProxyError::Unauthorized`.
    pub async fn execute(
        &self,
        method: ProxyMethod,
        path: &str,
        body: &str,
    ) -> Result<Vec<u8>, ProxyError> {
        let url = resolve_url(&self.server, path);
        // The client adds scheme, authority and any base path of the server
        let uri: http::Uri = request_path(path)
            .parse()
            .map_err(|_| ProxyError::InvalidUrl(url.clone()))?;

        let mut builder = Request::builder().method(method.http_method()).uri(uri);
        let payload = match method.content_type() {
            Some(content_type) => {
                builder = builder.header(CONTENT_TYPE, content_type);
                body.as_bytes().to_vec()
            }
            None => Vec::new(),
        };
        let request = builder.body(Body::from(payload))?;

        tracing::debug!(%method, %url, "proxying request");

        let response = self
            .client
            .send(request)
            .await
            .map_err(ProxyError::Transport)?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?
            .to_bytes();

        into_result(status, body.to_vec())
    }
}

/// Map an upstream status and body to the executor's result
fn into_result(status: StatusCode, body: Vec<u8>) -> Result<Vec<u8>, ProxyError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ProxyError::Unauthorized);
    }

    if !status.is_success() {
        return Err(ProxyError::Upstream {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(body)
}
