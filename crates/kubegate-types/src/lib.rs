//! Shared types for kubegate
//!
//! This crate contains the wire types exchanged with the mobile client and the
//! small value types passed between the gateway crates.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Credentials
// ============================================================================

/// Inline cluster and user authentication material, exactly as the client
/// sends it. Empty strings mean "not provided".
///
/// Validation happens in `kubegate-k8s`; this type only carries the raw fields.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialBundle {
    #[serde(rename = "clusterServer")]
    pub cluster_server: String,
    #[serde(rename = "clusterCertificateAuthorityData")]
    pub cluster_certificate_authority_data: String,
    #[serde(rename = "clusterInsecureSkipTLSVerify")]
    pub cluster_insecure_skip_tls_verify: bool,
    #[serde(rename = "userClientCertificateData")]
    pub user_client_certificate_data: String,
    #[serde(rename = "userClientKeyData")]
    pub user_client_key_data: String,
    #[serde(rename = "userToken")]
    pub user_token: String,
    #[serde(rename = "userUsername")]
    pub user_username: String,
    #[serde(rename = "userPassword")]
    pub user_password: String,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn presence(value: &str) -> &'static str {
            if value.is_empty() { "<empty>" } else { "<redacted>" }
        }

        f.debug_struct("CredentialBundle")
            .field("cluster_server", &self.cluster_server)
            .field(
                "cluster_certificate_authority_data",
                &presence(&self.cluster_certificate_authority_data),
            )
            .field(
                "cluster_insecure_skip_tls_verify",
                &self.cluster_insecure_skip_tls_verify,
            )
            .field(
                "user_client_certificate_data",
                &presence(&self.user_client_certificate_data),
            )
            .field("user_client_key_data", &presence(&self.user_client_key_data))
            .field("user_token", &presence(&self.user_token))
            .field("user_username", &self.user_username)
            .field("user_password", &presence(&self.user_password))
            .finish()
    }
}

// ============================================================================
// Pod Targets
// ============================================================================

/// A pod (and optionally one of its containers) that a session talks to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodTarget {
    pub name: String,
    pub namespace: String,
    pub container: Option<String>,
}

impl PodTarget {
    pub fn new(name: String, namespace: String, container: Option<String>) -> Self {
        Self {
            name,
            namespace,
            // Empty container means "let the API server pick the default container"
            container: container.filter(|c| !c.is_empty()),
        }
    }

    /// Container name for display, empty when none was requested
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or_default()
    }
}

/// Terminal dimensions in character cells
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

// ============================================================================
// Port Forwarding
// ============================================================================

/// Body of `POST /portforwarding`
#[derive(Clone, Debug, Deserialize)]
pub struct PortForwardCreateRequest {
    #[serde(flatten)]
    pub credentials: CredentialBundle,
    #[serde(rename = "podName", default)]
    pub pod_name: String,
    #[serde(rename = "podNamespace", default)]
    pub pod_namespace: String,
    #[serde(rename = "podContainer", default)]
    pub pod_container: String,
    #[serde(rename = "podPort", default)]
    pub pod_port: u16,
}

impl PortForwardCreateRequest {
    pub fn target(&self) -> PodTarget {
        PodTarget::new(
            self.pod_name.clone(),
            self.pod_namespace.clone(),
            Some(self.pod_container.clone()),
        )
    }
}

/// Response of a successful `POST /portforwarding`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardCreateResponse {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "localPort")]
    pub local_port: u16,
}

/// Body of `DELETE /portforwarding`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortForwardDeleteRequest {
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
}

/// One entry of the `GET /portforwarding` listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardSessionInfo {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub container: String,
    #[serde(rename = "remotePort")]
    pub remote_port: u16,
    #[serde(rename = "localPort")]
    pub local_port: u16,
}

/// Response of `GET /portforwarding`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortForwardListResponse {
    pub sessions: Vec<PortForwardSessionInfo>,
}

// ============================================================================
// REST Proxy
// ============================================================================

/// Body of `POST /request`
#[derive(Clone, Debug, Deserialize)]
pub struct ProxyRequest {
    #[serde(flatten)]
    pub credentials: CredentialBundle,
    #[serde(rename = "requestMethod", default)]
    pub request_method: String,
    #[serde(rename = "requestURL", default)]
    pub request_url: String,
    #[serde(rename = "requestBody", default)]
    pub request_body: String,
}

/// Error envelope returned for every failed HTTP request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Terminal Messages
// ============================================================================

/// In-band terminal message carried in WebSocket text frames
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum TerminalMessage {
    /// Keyboard input from the client
    Stdin { data: String },
    /// Process output to the client
    Stdout { data: String },
    /// Process error output to the client
    Stderr { data: String },
    /// Terminal resize from the client
    Resize { cols: u16, rows: u16 },
}

impl TerminalMessage {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self::Stdout { data: data.into() }
    }

    /// Encode as the JSON text of a WebSocket frame
    pub fn to_json(&self) -> String {
        // A tagged enum of strings and integers always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}
