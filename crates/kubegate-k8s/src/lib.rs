//! Kubernetes access for kubegate
//!
//! This crate turns per-request credential material into Kubernetes clients,
//! proxies single REST calls, and opens the pod streams (port-forward and
//! exec) that long-lived sessions are built on.

mod backend;
mod client;
mod credentials;
mod error;
mod proxy;

pub use backend::{
    BackendFactory, BoxedStream, ClusterBackend, DuplexStream, ExecStreams, KubeBackend,
    KubeBackendFactory,
};
pub use client::ClusterClient;
pub use credentials::{Credentials, UserAuth, parse_bool_flag};
pub use error::{CredentialError, K8sError};
pub use proxy::{ProxyError, ProxyExecutor, ProxyMethod, resolve_url};

// Re-export types used in our public API
pub use kubegate_types::{CredentialBundle, PodTarget, TerminalSize};
