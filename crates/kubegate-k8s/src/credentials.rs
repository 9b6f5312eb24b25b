//! Validated credential material
//!
//! A `CredentialBundle` arrives as loose strings on every request. It is turned
//! into `Credentials` exactly once, and everything downstream works with the
//! validated value.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::CredentialError;
use kubegate_types::CredentialBundle;

/// The single user authentication mode of a request
#[derive(Clone, PartialEq, Eq)]
pub enum UserAuth {
    /// Base64 encoded PEM client certificate and key
    ClientCertificate {
        certificate_data: String,
        key_data: String,
    },
    /// Bearer token
    Token(String),
    /// HTTP basic auth
    Basic { username: String, password: String },
}

impl UserAuth {
    /// Short mode name, safe to log
    pub fn mode(&self) -> &'static str {
        match self {
            Self::ClientCertificate { .. } => "client-certificate",
            Self::Token(_) => "token",
            Self::Basic { .. } => "basic",
        }
    }
}

impl fmt::Debug for UserAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            other => f.write_str(other.mode()),
        }
    }
}

/// Validated credential material for one request or session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    server: String,
    certificate_authority_data: Option<String>,
    insecure_skip_tls_verify: bool,
    auth: UserAuth,
}

impl Credentials {
    /// Cluster server URL without trailing slashes
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn certificate_authority_data(&self) -> Option<&str> {
        self.certificate_authority_data.as_deref()
    }

    pub fn insecure_skip_tls_verify(&self) -> bool {
        self.insecure_skip_tls_verify
    }

    pub fn auth(&self) -> &UserAuth {
        &self.auth
    }
}

impl TryFrom<&CredentialBundle> for Credentials {
    type Error = CredentialError;

    fn try_from(bundle: &CredentialBundle) -> Result<Self, Self::Error> {
        let server = normalize_server(&bundle.cluster_server)?;

        let certificate_authority_data = non_empty(&bundle.cluster_certificate_authority_data)
            .map(|data| check_base64("cluster certificate authority data", data))
            .transpose()?;

        let auth = user_auth(bundle)?;

        Ok(Self {
            server,
            certificate_authority_data,
            insecure_skip_tls_verify: bundle.cluster_insecure_skip_tls_verify,
            auth,
        })
    }
}

impl TryFrom<CredentialBundle> for Credentials {
    type Error = CredentialError;

    fn try_from(bundle: CredentialBundle) -> Result<Self, Self::Error> {
        Self::try_from(&bundle)
    }
}

/// Pick the one populated auth mode, rejecting missing or ambiguous input
fn user_auth(bundle: &CredentialBundle) -> Result<UserAuth, CredentialError> {
    let certificate = non_empty(&bundle.user_client_certificate_data);
    let key = non_empty(&bundle.user_client_key_data);
    let token = non_empty(&bundle.user_token);
    let username = non_empty(&bundle.user_username);
    let password = non_empty(&bundle.user_password);

    let mut modes = Vec::new();
    if certificate.is_some() || key.is_some() {
        modes.push("client certificate");
    }
    if token.is_some() {
        modes.push("token");
    }
    if username.is_some() || password.is_some() {
        modes.push("username/password");
    }

    if modes.len() > 1 {
        return Err(CredentialError::AmbiguousAuth(modes));
    }

    if let Some(token) = token {
        return Ok(UserAuth::Token(token.to_string()));
    }

    match (certificate, key, username, password) {
        (Some(certificate), Some(key), _, _) => Ok(UserAuth::ClientCertificate {
            certificate_data: check_base64("user client certificate data", certificate)?,
            key_data: check_base64("user client key data", key)?,
        }),
        (Some(_), None, _, _) | (None, Some(_), _, _) => {
            Err(CredentialError::IncompleteClientCertificate)
        }
        (_, _, Some(username), Some(password)) => Ok(UserAuth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }),
        (_, _, Some(_), None) | (_, _, None, Some(_)) => Err(CredentialError::IncompleteBasicAuth),
        (None, None, None, None) => Err(CredentialError::MissingAuth),
    }
}

fn normalize_server(server: &str) -> Result<String, CredentialError> {
    let trimmed = server.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(CredentialError::MissingServer);
    }

    let uri: http::Uri = trimmed
        .parse()
        .map_err(|_| CredentialError::InvalidServer(server.to_string()))?;
    let has_http_scheme = matches!(uri.scheme_str(), Some("http") | Some("https"));
    if !has_http_scheme || uri.authority().is_none() {
        return Err(CredentialError::InvalidServer(server.to_string()));
    }

    Ok(trimmed.to_string())
}

fn check_base64(field: &'static str, data: &str) -> Result<String, CredentialError> {
    let data = data.trim();
    STANDARD
        .decode(data)
        .map_err(|_| CredentialError::InvalidBase64(field))?;
    Ok(data.to_string())
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

/// Lenient boolean parsing for header values.
///
/// Accepts `1`, `t`, `T`, `TRUE`, `true` and `True`; everything else,
/// including malformed input, is `false`.
pub fn parse_bool_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "t" | "T" | "TRUE" | "true" | "True")
}
