//! Port-forward sessions
//!
//! Each session owns a local listener. Every accepted connection gets its own
//! upstream stream to the pod port and bytes are relayed until either side
//! closes. The session's stop token is the only cancellation primitive: once
//! it fires the accept loop and every relay exit, the listener is dropped and
//! the registry entry removed.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use kubegate_k8s::{ClusterBackend, K8sError};
use kubegate_types::{PodTarget, PortForwardSessionInfo};

use crate::registry::{SessionOrigin, SessionRegistry};
use crate::relay;
use crate::session::Session;

#[derive(Debug, Error)]
pub enum PortForwardError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("could not listen on a local port: {0}")]
    Listen(#[source] io::Error),

    #[error(transparent)]
    Backend(#[from] K8sError),

    #[error("port forwarding was not ready after {0:?}")]
    Timeout(Duration),

    #[error("port forwarding stopped before it was ready")]
    Aborted,
}

/// Lifecycle of a port-forward session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortForwardState {
    Created,
    Starting,
    Ready,
    /// At least one local connection has been relayed
    Active,
    Stopped,
    Failed,
}

/// One port-forward tunnel
pub struct PortForwardSession {
    id: String,
    target: PodTarget,
    remote_port: u16,
    local_port: AtomicU16,
    created_at: DateTime<Utc>,
    state: Mutex<PortForwardState>,
    stop: CancellationToken,
}

impl PortForwardSession {
    /// Allocate a session with a fresh id, validating its inputs
    fn new(
        origin: SessionOrigin,
        target: PodTarget,
        remote_port: u16,
    ) -> Result<Self, PortForwardError> {
        if target.name.is_empty() {
            return Err(PortForwardError::MissingField("pod name"));
        }
        if target.namespace.is_empty() {
            return Err(PortForwardError::MissingField("pod namespace"));
        }
        if remote_port == 0 {
            return Err(PortForwardError::MissingField("pod port"));
        }

        Ok(Self {
            id: origin.new_id(),
            target,
            remote_port,
            local_port: AtomicU16::new(0),
            created_at: Utc::now(),
            state: Mutex::new(PortForwardState::Created),
            stop: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Local port the listener is bound to, 0 before it is bound
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> PortForwardState {
        *self.state.lock()
    }

    /// Fire the stop signal
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn info(&self) -> PortForwardSessionInfo {
        PortForwardSessionInfo {
            id: self.id.clone(),
            name: self.target.name.clone(),
            namespace: self.target.namespace.clone(),
            container: self.target.container_name().to_string(),
            remote_port: self.remote_port,
            local_port: self.local_port(),
        }
    }

    fn set_state(&self, state: PortForwardState) {
        *self.state.lock() = state;
    }

    /// Ready -> Active on the first relayed connection
    fn mark_active(&self) {
        let mut state = self.state.lock();
        if *state == PortForwardState::Ready {
            *state = PortForwardState::Active;
        }
    }
}

/// Settings shared by all port-forward sessions
#[derive(Clone, Debug)]
pub struct PortForwardConfig {
    /// Address the local listeners bind to
    pub bind_address: IpAddr,
    /// How long session setup may take before it is abandoned
    pub ready_timeout: Duration,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Starts, lists and stops port-forward sessions
#[derive(Clone)]
pub struct PortForwardManager {
    registry: SessionRegistry<Session>,
    config: PortForwardConfig,
}

impl PortForwardManager {
    pub fn new(registry: SessionRegistry<Session>, config: PortForwardConfig) -> Self {
        Self { registry, config }
    }

    /// Start a session and wait until it is ready.
    ///
    /// On success the session is registered and its local port is bound. On
    /// failure nothing is left in the registry.
    pub async fn start(
        &self,
        origin: SessionOrigin,
        target: PodTarget,
        remote_port: u16,
        backend: Arc<dyn ClusterBackend>,
    ) -> Result<Arc<PortForwardSession>, PortForwardError> {
        let session = Arc::new(PortForwardSession::new(origin, target, remote_port)?);

        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_address, 0))
            .await
            .map_err(PortForwardError::Listen)?;
        let local_port = listener
            .local_addr()
            .map_err(PortForwardError::Listen)?
            .port();
        session.local_port.store(local_port, Ordering::SeqCst);
        session.set_state(PortForwardState::Starting);

        tracing::info!(
            session = %session.id,
            pod = %session.target.name,
            namespace = %session.target.namespace,
            remote_port,
            local_port,
            "starting port forwarding"
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_forwarder(
            Arc::clone(&session),
            listener,
            backend,
            self.registry.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(self.config.ready_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(session),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(PortForwardError::Aborted),
            Err(_) => {
                session.stop();
                Err(PortForwardError::Timeout(self.config.ready_timeout))
            }
        }
    }

    /// Stop a session and remove it from the registry.
    ///
    /// Returns whether a port-forward session with that id existed; stopping an
    /// unknown id is not an error.
    pub fn stop(&self, id: &str) -> bool {
        let Some(Session::PortForward(session)) = self.registry.get(id) else {
            return false;
        };

        session.stop();
        self.registry.delete(id);
        true
    }

    /// Snapshot of the port-forward sessions created by `origin`
    pub fn list(&self, origin: SessionOrigin) -> Vec<Arc<PortForwardSession>> {
        self.registry
            .list_by_origin(origin)
            .into_iter()
            .filter_map(|session| session.as_port_forward().cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<PortForwardSession>> {
        self.registry
            .get(id)
            .and_then(|session| session.as_port_forward().cloned())
    }
}

/// Background task owning the session from `Starting` to `Stopped`
async fn run_forwarder(
    session: Arc<PortForwardSession>,
    listener: TcpListener,
    backend: Arc<dyn ClusterBackend>,
    registry: SessionRegistry<Session>,
    ready_tx: oneshot::Sender<Result<(), PortForwardError>>,
) {
    let stop = session.stop.clone();

    let probe = tokio::select! {
        result = backend.probe_pod(&session.target) => result,
        _ = stop.cancelled() => {
            session.set_state(PortForwardState::Failed);
            return;
        }
    };

    if let Err(e) = probe {
        tracing::warn!(session = %session.id, error = %e, "port forwarding failed to start");
        session.set_state(PortForwardState::Failed);
        let _ = ready_tx.send(Err(e.into()));
        return;
    }

    // Registered before readiness is announced, so a ready session is always listed
    registry.put(session.id.clone(), Session::PortForward(Arc::clone(&session)));
    session.set_state(PortForwardState::Ready);

    if ready_tx.send(Ok(())).is_err() {
        // The caller gave up waiting
        registry.delete(&session.id);
        session.set_state(PortForwardState::Failed);
        return;
    }

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    session.mark_active();
                    tokio::spawn(forward_connection(
                        Arc::clone(&session),
                        socket,
                        peer,
                        Arc::clone(&backend),
                    ));
                }
                Err(e) => {
                    tracing::warn!(session = %session.id, error = %e, "accepting local connection failed");
                    stop.cancel();
                    break;
                }
            }
        }
    }

    drop(listener);
    registry.delete(&session.id);
    session.set_state(PortForwardState::Stopped);

    tracing::info!(
        session = %session.id,
        uptime_secs = (Utc::now() - session.created_at).num_seconds(),
        "port forwarding stopped"
    );
}

/// Relay one local connection to a fresh upstream stream
async fn forward_connection(
    session: Arc<PortForwardSession>,
    mut socket: TcpStream,
    peer: SocketAddr,
    backend: Arc<dyn ClusterBackend>,
) {
    let stop = session.stop.clone();

    let upstream = tokio::select! {
        result = backend.open_port(&session.target, session.remote_port) => result,
        _ = stop.cancelled() => return,
    };

    let mut upstream = match upstream {
        Ok(stream) => stream,
        Err(e) => {
            // The pod is gone or unreachable; the tunnel is dead for everyone
            tracing::error!(session = %session.id, %peer, error = %e, "could not open port-forward stream");
            stop.cancel();
            return;
        }
    };

    match relay::pipe(&mut socket, &mut upstream, &stop).await {
        Ok(Some((sent, received))) => {
            tracing::debug!(session = %session.id, %peer, sent, received, "connection closed");
        }
        Ok(None) => {
            tracing::debug!(session = %session.id, %peer, "connection closed by session stop");
        }
        Err(e) => {
            tracing::debug!(session = %session.id, %peer, error = %e, "connection ended with error");
        }
    }
}
