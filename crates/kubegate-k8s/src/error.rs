use thiserror::Error;

/// Malformed or missing credential material. Always detected before any
/// network I/O happens.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("cluster server is required")]
    MissingServer,

    #[error("invalid cluster server {0:?}: expected an http or https URL")]
    InvalidServer(String),

    #[error("{0} is not valid base64")]
    InvalidBase64(&'static str),

    #[error(
        "no user authentication provided: set a client certificate and key, a token, or a username and password"
    )]
    MissingAuth,

    #[error("ambiguous user authentication: {} are set, provide exactly one", .0.join(", "))]
    AmbiguousAuth(Vec<&'static str>),

    #[error("client certificate authentication needs both certificate and key data")]
    IncompleteClientCertificate,

    #[error("basic authentication needs both username and password")]
    IncompleteBasicAuth,
}

/// Errors from building clients and talking to a cluster
#[derive(Debug, Error)]
pub enum K8sError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("invalid client configuration: {0}")]
    Config(#[from] kube::config::KubeconfigError),

    #[error("could not create Kubernetes API client: {0}")]
    Client(#[source] kube::Error),

    #[error(transparent)]
    Api(#[from] kube::Error),

    #[error("port {port} of pod {pod} has no forwarded stream")]
    MissingStream { pod: String, port: u16 },

    #[error("exec {0} stream is not available")]
    MissingExecStream(&'static str),

    #[error("remote command failed: {0}")]
    RemoteCommand(String),
}

impl K8sError {
    /// Whether the error came from the request's own credential material
    /// rather than from talking to the cluster
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Self::Credentials(_) | Self::Config(_) | Self::Client(_)
        )
    }
}
