//! Pod streams for long-lived sessions
//!
//! Sessions never talk to `kube` directly. They go through `ClusterBackend`,
//! which hands out plain byte streams, so the relay loops above it can be
//! exercised with in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::SinkExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{AttachParams, TerminalSize as KubeTerminalSize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::client::ClusterClient;
use crate::credentials::Credentials;
use crate::error::K8sError;
use kubegate_types::{PodTarget, TerminalSize};

/// Pending resize events per exec session
const RESIZE_BUFFER: usize = 16;

/// A bidirectional byte stream
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// The streams of one running remote command
pub struct ExecStreams {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// `None` when stderr is merged into stdout (tty sessions)
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub resize: mpsc::Sender<TerminalSize>,
    /// Resolves when the remote command has exited
    pub exit: BoxFuture<'static, Result<(), K8sError>>,
}

/// Stream-level access to the pods of one cluster
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Check that the pod exists and the credentials are accepted
    async fn probe_pod(&self, pod: &PodTarget) -> Result<(), K8sError>;

    /// Open a byte stream to a port of the pod
    async fn open_port(&self, pod: &PodTarget, port: u16) -> Result<BoxedStream, K8sError>;

    /// Start an interactive command with a tty in the pod
    async fn exec(&self, pod: &PodTarget, command: Vec<String>) -> Result<ExecStreams, K8sError>;
}

/// Builds a backend from validated credentials
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn connect(&self, credentials: &Credentials)
    -> Result<Arc<dyn ClusterBackend>, K8sError>;
}

/// Backend factory that builds real Kubernetes clients
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeBackendFactory;

#[async_trait]
impl BackendFactory for KubeBackendFactory {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ClusterBackend>, K8sError> {
        let cluster = ClusterClient::build(credentials).await?;
        Ok(Arc::new(KubeBackend::new(cluster.client)))
    }
}

/// `ClusterBackend` over the pod `portforward` and `exec` subresources
#[derive(Clone)]
pub struct KubeBackend {
    client: kube::Client,
}

impl KubeBackend {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn probe_pod(&self, pod: &PodTarget) -> Result<(), K8sError> {
        self.pods(&pod.namespace).get(&pod.name).await?;
        Ok(())
    }

    async fn open_port(&self, pod: &PodTarget, port: u16) -> Result<BoxedStream, K8sError> {
        let mut forwarder = self
            .pods(&pod.namespace)
            .portforward(&pod.name, &[port])
            .await?;

        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| K8sError::MissingStream {
                pod: pod.name.clone(),
                port,
            })?;

        // The forwarder task lives until both directions of the stream are closed
        let pod_name = pod.name.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                tracing::debug!(pod = %pod_name, port, error = %e, "port-forward stream ended with error");
            }
        });

        Ok(Box::new(stream))
    }

    async fn exec(&self, pod: &PodTarget, command: Vec<String>) -> Result<ExecStreams, K8sError> {
        // stdin, stdout and tty; the API server merges stderr into stdout for tty sessions
        let mut params = AttachParams::interactive_tty();
        if let Some(container) = &pod.container {
            params = params.container(container.clone());
        }

        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.name, command, &params)
            .await?;

        let stdin = attached
            .stdin()
            .ok_or(K8sError::MissingExecStream("stdin"))?;
        let stdout = attached
            .stdout()
            .ok_or(K8sError::MissingExecStream("stdout"))?;
        let stderr = attached
            .stderr()
            .map(|reader| Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>);

        let (resize, mut resize_rx) = mpsc::channel::<TerminalSize>(RESIZE_BUFFER);
        if let Some(mut remote) = attached.terminal_size() {
            tokio::spawn(async move {
                while let Some(size) = resize_rx.recv().await {
                    let size = KubeTerminalSize {
                        width: size.cols,
                        height: size.rows,
                    };
                    if remote.send(size).await.is_err() {
                        break;
                    }
                }
            });
        }

        let exit = Box::pin(async move {
            attached
                .join()
                .await
                .map_err(|e| K8sError::RemoteCommand(e.to_string()))
        });

        Ok(ExecStreams {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            resize,
            exit,
        })
    }
}
