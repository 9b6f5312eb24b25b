use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt, future};
use serde::Deserialize;

use kubegate_k8s::{ClusterClient, Credentials, ProxyExecutor, ProxyMethod, parse_bool_flag};
use kubegate_session::{Frame, SessionOrigin};
use kubegate_types::{
    CredentialBundle, PodTarget, PortForwardCreateRequest, PortForwardCreateResponse,
    PortForwardDeleteRequest, PortForwardListResponse, ProxyRequest,
};

use super::AppState;
use super::error::ApiError;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

// ============================================================================
// Port Forwarding
// ============================================================================

/// `GET /portforwarding`: sessions created through this endpoint, oldest first
pub async fn list_port_forwards(State(state): State<AppState>) -> Json<PortForwardListResponse> {
    let mut sessions = state.port_forwards.list(SessionOrigin::User);
    sessions.sort_by_key(|session| session.created_at());

    Json(PortForwardListResponse {
        sessions: sessions.iter().map(|session| session.info()).collect(),
    })
}

/// `POST /portforwarding`
pub async fn create_port_forward(
    State(state): State<AppState>,
    payload: Result<Json<PortForwardCreateRequest>, JsonRejection>,
) -> Result<Json<PortForwardCreateResponse>, ApiError> {
    let Json(request) = payload?;
    let credentials = Credentials::try_from(&request.credentials)?;
    let backend = state
        .backends
        .connect(&credentials)
        .await
        .map_err(ApiError::client)?;

    let session = state
        .port_forwards
        .start(
            SessionOrigin::User,
            request.target(),
            request.pod_port,
            backend,
        )
        .await?;

    Ok(Json(PortForwardCreateResponse {
        session_id: session.id().to_string(),
        local_port: session.local_port(),
    }))
}

/// `DELETE /portforwarding`: succeeds whether or not the session exists
pub async fn delete_port_forward(
    State(state): State<AppState>,
    payload: Result<Json<PortForwardDeleteRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) = payload?;

    if state.port_forwards.stop(&request.session_id) {
        tracing::info!(session = %request.session_id, "port forwarding deleted");
    } else {
        tracing::debug!(session = %request.session_id, "delete of unknown session");
    }

    Ok(Json(serde_json::Value::Null))
}

// ============================================================================
// REST Proxy
// ============================================================================

/// `POST /request`: one REST call against the cluster, body returned verbatim
pub async fn proxy_request(
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let method: ProxyMethod = request.request_method.parse()?;
    let credentials = Credentials::try_from(&request.credentials)?;
    let cluster = ClusterClient::build(&credentials)
        .await
        .map_err(ApiError::client)?;

    let body = ProxyExecutor::new(&cluster, credentials.server())
        .execute(method, &request.request_url, &request.request_body)
        .await?;

    Ok(([(CONTENT_TYPE, "application/json")], body).into_response())
}

// ============================================================================
// Terminal
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TerminalQuery {
    pub name: String,
    pub namespace: String,
    pub container: String,
    pub shell: String,
}

/// Read the credential bundle from the `X-CLUSTER-*` and `X-USER-*` headers
fn credential_headers(headers: &HeaderMap) -> CredentialBundle {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    CredentialBundle {
        cluster_server: header("x-cluster-server"),
        cluster_certificate_authority_data: header("x-cluster-certificate-authority-data"),
        cluster_insecure_skip_tls_verify: parse_bool_flag(&header(
            "x-cluster-insecure-skip-tls-verify",
        )),
        user_client_certificate_data: header("x-user-client-certificate-data"),
        user_client_key_data: header("x-user-client-key-data"),
        user_token: header("x-user-token"),
        user_username: header("x-user-username"),
        user_password: header("x-user-password"),
    }
}

/// `GET /terminal`: WebSocket exec session.
///
/// Validation and client construction fail as HTTP errors before the upgrade.
/// Once upgraded, failures are reported as in-band messages. Origins are not
/// checked: the only client is the first-party app.
pub async fn terminal(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    if query.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    if query.namespace.is_empty() {
        return Err(ApiError::bad_request("namespace is required"));
    }

    let credentials = Credentials::try_from(credential_headers(&headers))?;
    let backend = state
        .backends
        .connect(&credentials)
        .await
        .map_err(ApiError::client)?;

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let target = PodTarget::new(query.name, query.namespace, Some(query.container));
    let shell = query.shell;
    let terminals = state.terminals.clone();

    Ok(upgrade.on_upgrade(move |socket: WebSocket| async move {
        let (sink, stream) = socket.split();
        let tx = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
        let rx = stream.map(|message| message.map(from_message));
        terminals.serve(backend, target, &shell, tx, rx).await;
    }))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}
