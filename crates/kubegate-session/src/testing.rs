//! In-memory stand-ins for a cluster

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kubegate_k8s::{BoxedStream, ClusterBackend, ExecStreams, K8sError};
use parking_lot::Mutex;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::{mpsc, oneshot};

use kubegate_types::{PodTarget, TerminalSize};

/// A `ClusterBackend` whose pods echo every forwarded byte back
#[derive(Default)]
pub struct FakeBackend {
    pub probe_error: Option<String>,
    pub probe_hangs: bool,
    pub open_error: Option<String>,
    pub exec_error: Option<String>,
    pub exec: Mutex<Option<ExecStreams>>,
    pub commands: Mutex<Vec<Vec<String>>>,
    pub opened: AtomicUsize,
}

impl FakeBackend {
    pub fn with_exec(streams: ExecStreams) -> Self {
        Self {
            exec: Mutex::new(Some(streams)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    async fn probe_pod(&self, _pod: &PodTarget) -> Result<(), K8sError> {
        if self.probe_hangs {
            futures::future::pending::<()>().await;
        }
        match &self.probe_error {
            Some(message) => Err(K8sError::RemoteCommand(message.clone())),
            None => Ok(()),
        }
    }

    async fn open_port(&self, pod: &PodTarget, port: u16) -> Result<BoxedStream, K8sError> {
        if self.open_error.is_some() {
            return Err(K8sError::MissingStream {
                pod: pod.name.clone(),
                port,
            });
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let (near, far) = duplex(1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }

    async fn exec(&self, _pod: &PodTarget, command: Vec<String>) -> Result<ExecStreams, K8sError> {
        self.commands.lock().push(command);
        if let Some(message) = &self.exec_error {
            return Err(K8sError::RemoteCommand(message.clone()));
        }
        self.exec
            .lock()
            .take()
            .ok_or(K8sError::MissingExecStream("stdin"))
    }
}

/// The remote side of a fake exec session
pub struct FakeProcess {
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
    pub resize: mpsc::Receiver<TerminalSize>,
    /// Resolves the remote command's exit with the sent result
    pub exit: oneshot::Sender<Result<(), K8sError>>,
}

pub fn fake_exec() -> (ExecStreams, FakeProcess) {
    let (stdin_writer, stdin_reader) = duplex(1024);
    let (stdout_writer, stdout_reader) = duplex(1024);
    let (resize_tx, resize_rx) = mpsc::channel(4);
    let (exit_tx, exit_rx) = oneshot::channel::<Result<(), K8sError>>();

    let streams = ExecStreams {
        stdin: Box::new(stdin_writer),
        stdout: Box::new(stdout_reader),
        stderr: None,
        resize: resize_tx,
        exit: Box::pin(async move { exit_rx.await.unwrap_or(Ok(())) }),
    };

    let process = FakeProcess {
        stdin: stdin_reader,
        stdout: stdout_writer,
        resize: resize_rx,
        exit: exit_tx,
    };

    (streams, process)
}
