use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use kubegate_k8s::{CredentialError, K8sError, ProxyError};
use kubegate_session::PortForwardError;
use kubegate_types::ErrorResponse;

/// An HTTP error rendered as `{ "error": message }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Map a failure to build a client for the request's credentials
    pub fn client(err: K8sError) -> Self {
        let message = format!("Could not create Kubernetes API client: {}", err);
        if err.is_construction() {
            Self::bad_request(message)
        } else {
            Self::internal(message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::warn!(status = %self.status, error = %self.message, "request failed");
        } else {
            tracing::debug!(status = %self.status, error = %self.message, "request rejected");
        }

        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!(
            "Could not decode request body: {}",
            rejection.body_text()
        ))
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        Self::client(K8sError::Credentials(err))
    }
}

impl From<PortForwardError> for ApiError {
    fn from(err: PortForwardError) -> Self {
        match err {
            PortForwardError::MissingField(_) => Self::bad_request(err.to_string()),
            PortForwardError::Backend(e) if e.is_construction() => Self::client(e),
            err => Self::internal(format!(
                "Could not establish port forwarding connection: {}",
                err
            )),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::UnsupportedMethod(_) | ProxyError::InvalidUrl(_) | ProxyError::Request(_) => {
                Self::bad_request(err.to_string())
            }
            ProxyError::Unauthorized => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            ProxyError::Upstream { status, body } => Self::new(status, body),
            ProxyError::Transport(_) | ProxyError::Body(_) => Self::internal(err.to_string()),
        }
    }
}
