//! HTTP/WebSocket front door

mod error;
mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use kubegate_k8s::BackendFactory;
use kubegate_session::{PortForwardManager, Session, SessionRegistry, TerminalManager};

use crate::config::ServerConfig;

/// Shared state of every handler. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry<Session>,
    pub port_forwards: PortForwardManager,
    pub terminals: TerminalManager,
    pub backends: Arc<dyn BackendFactory>,
}

impl AppState {
    pub fn new(config: &ServerConfig, backends: Arc<dyn BackendFactory>) -> Self {
        let registry = SessionRegistry::new();
        Self {
            port_forwards: PortForwardManager::new(registry.clone(), config.port_forward()),
            terminals: TerminalManager::new(registry.clone(), config.terminal()),
            registry,
            backends,
        }
    }

    /// Stop every running session
    pub fn shutdown(&self) {
        let sessions = self.registry.list();
        tracing::info!(count = sessions.len(), "stopping sessions");
        for session in sessions {
            session.stop();
            self.registry.delete(session.id());
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/portforwarding",
            get(handlers::list_port_forwards)
                .post(handlers::create_port_forward)
                .delete(handlers::delete_port_forward),
        )
        .route("/terminal", get(handlers::terminal))
        .route("/request", post(handlers::proxy_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{HeaderMap, Method, Request, StatusCode};
    use axum::response::Response;
    use kubegate_k8s::{BoxedStream, ClusterBackend, Credentials, ExecStreams, K8sError};
    use kubegate_types::{PodTarget, PortForwardCreateResponse, PortForwardListResponse};
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tower::ServiceExt;

    /// Pods whose ports echo and whose exec always fails
    struct EchoBackend;

    #[async_trait]
    impl ClusterBackend for EchoBackend {
        async fn probe_pod(&self, pod: &PodTarget) -> Result<(), K8sError> {
            if pod.name == "missing" {
                return Err(K8sError::RemoteCommand(
                    "pods \"missing\" not found".to_string(),
                ));
            }
            Ok(())
        }

        async fn open_port(&self, _pod: &PodTarget, _port: u16) -> Result<BoxedStream, K8sError> {
            let (near, far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            Ok(Box::new(near))
        }

        async fn exec(
            &self,
            _pod: &PodTarget,
            _command: Vec<String>,
        ) -> Result<ExecStreams, K8sError> {
            Err(K8sError::RemoteCommand("exec is not supported".to_string()))
        }
    }

    struct EchoFactory;

    #[async_trait]
    impl BackendFactory for EchoFactory {
        async fn connect(
            &self,
            _credentials: &Credentials,
        ) -> Result<Arc<dyn ClusterBackend>, K8sError> {
            Ok(Arc::new(EchoBackend))
        }
    }

    fn app() -> (Router, AppState) {
        let state = AppState::new(&ServerConfig::default(), Arc::new(EchoFactory));
        (router(state.clone()), state)
    }

    fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn create_body(pod: &str) -> Value {
        json!({
            "clusterServer": "https://10.0.0.1:6443/",
            "clusterInsecureSkipTLSVerify": true,
            "userToken": "abc",
            "podName": pod,
            "podNamespace": "default",
            "podContainer": "nginx",
            "podPort": 80
        })
    }

    /// Serve a stand-in API server whose routes answer with the method,
    /// content type and body they received
    async fn upstream() -> String {
        async fn echo(method: Method, headers: HeaderMap, body: String) -> String {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            serde_json::json!({
                "method": method.as_str(),
                "contentType": content_type,
                "body": body,
            })
            .to_string()
        }

        let api = Router::new()
            .route("/api/v1/namespaces/default/configmaps", post(echo))
            .route(
                "/api/v1/namespaces/default/configmaps/settings",
                axum::routing::delete(echo),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, api).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn proxy(app: Router, server: &str, method: &str, url: &str, body: &str) -> Response {
        let request = json!({
            "clusterServer": server,
            "userToken": "abc",
            "requestMethod": method,
            "requestURL": url,
            "requestBody": body
        });
        app.oneshot(json_request(Method::POST, "/request", &request))
            .await
            .unwrap()
    }

    async fn list(app: &Router) -> PortForwardListResponse {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/portforwarding")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_value(json_body(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_port_forward_lifecycle() {
        let (app, state) = app();

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/portforwarding",
                &create_body("web-0"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created: PortForwardCreateResponse =
            serde_json::from_value(json_body(response).await).unwrap();
        assert!(created.session_id.starts_with("user_"));
        // OS-assigned, never a privileged or requested port
        assert!(created.local_port >= 1024);

        // The tunnel relays to the pod port
        let mut conn = TcpStream::connect(("127.0.0.1", created.local_port))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let listed = list(&app).await;
        assert_eq!(listed.sessions.len(), 1);
        let info = &listed.sessions[0];
        assert_eq!(info.id, created.session_id);
        assert_eq!(info.name, "web-0");
        assert_eq!(info.namespace, "default");
        assert_eq!(info.container, "nginx");
        assert_eq!(info.remote_port, 80);
        assert_eq!(info.local_port, created.local_port);

        let response = app
            .clone()
            .oneshot(json_request(
                Method::DELETE,
                "/portforwarding",
                &json!({ "sessionID": created.session_id }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(list(&app).await.sessions.is_empty());
        assert!(state.registry.get(&created.session_id).is_none());
    }

    #[tokio::test]
    async fn test_listing_is_empty_array_without_sessions() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/portforwarding")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(json_body(response).await, json!({ "sessions": [] }));
    }

    #[tokio::test]
    async fn test_delete_unknown_session_succeeds() {
        let (app, _) = app();
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(json_request(
                    Method::DELETE,
                    "/portforwarding",
                    &json!({ "sessionID": "user_does-not-exist" }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_missing_auth_is_bad_request() {
        let (app, state) = app();
        let mut body = create_body("web-0");
        body["userToken"] = json!("");

        let response = app
            .oneshot(json_request(Method::POST, "/portforwarding", &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert!(
            error["error"]
                .as_str()
                .unwrap()
                .starts_with("Could not create Kubernetes API client:")
        );
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/portforwarding")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert!(
            error["error"]
                .as_str()
                .unwrap()
                .starts_with("Could not decode request body:")
        );
    }

    #[tokio::test]
    async fn test_setup_failure_leaves_no_session() {
        let (app, state) = app();
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/portforwarding",
                &create_body("missing"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = json_body(response).await;
        assert!(error["error"].as_str().unwrap().contains("not found"));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_rejects_unknown_method() {
        let (app, _) = app();
        let body = json!({
            "clusterServer": "https://10.0.0.1:6443",
            "userToken": "abc",
            "requestMethod": "PUT",
            "requestURL": "/api/v1/namespaces",
            "requestBody": ""
        });

        let response = app
            .oneshot(json_request(Method::POST, "/request", &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert!(error["error"].as_str().unwrap().contains("PUT"));
    }

    #[tokio::test]
    async fn test_terminal_without_pod_is_bad_request() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/terminal?namespace=default")
                    .header("x-user-token", "abc")
                    .header("x-cluster-server", "https://10.0.0.1:6443")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_terminal_without_credentials_is_bad_request() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/terminal?name=web-0&namespace=default&shell=bash")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected_by_router() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri("/portforwarding")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sessions() {
        let (app, state) = app();
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/portforwarding",
                &create_body("web-0"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.registry.len(), 1);

        state.shutdown();
        assert!(state.registry.is_empty());
        assert!(list(&app).await.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_post_forwards_body() {
        let (app, _) = app();
        let server = upstream().await;
        let configmap = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings"}}"#;

        let response = proxy(
            app,
            &server,
            "POST",
            "/api/v1/namespaces/default/configmaps",
            configmap,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            json_body(response).await,
            json!({
                "method": "POST",
                "contentType": "application/json",
                "body": configmap
            })
        );
    }

    #[tokio::test]
    async fn test_proxy_delete_forwards_body() {
        let (app, _) = app();
        let server = upstream().await;
        let options = r#"{"kind":"DeleteOptions","propagationPolicy":"Background"}"#;

        let response = proxy(
            app,
            &server,
            "DELETE",
            "/api/v1/namespaces/default/configmaps/settings",
            options,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            json_body(response).await,
            json!({
                "method": "DELETE",
                "contentType": "application/json",
                "body": options
            })
        );
    }
}
