//! Interactive exec sessions bridged over a message channel
//!
//! The bridge does not know about WebSockets. It speaks `Frame`s over any
//! `Sink`/`Stream` pair, so the front door adapts its socket type and tests
//! use plain channels.
//!
//! Per session there is one writer task that owns the sink, one reader task
//! feeding stdin and resize events, one output pump per output stream and a
//! keepalive ticker. They all watch the session's stop token. The writer is
//! the only task that sends `Frame::Close`, so the socket is closed once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kubegate_k8s::{ClusterBackend, ExecStreams};
use kubegate_types::{PodTarget, TerminalMessage, TerminalSize};

use crate::registry::{SessionOrigin, SessionRegistry};
use crate::session::Session;

/// Shell used when the requested one is missing or not allowed
pub const DEFAULT_SHELL: &str = "sh";

/// Frames queued for the client before output pumps block
const OUTPUT_BUFFER: usize = 64;

const READ_BUFFER: usize = 4096;

/// How long output may keep flowing after the remote command exits
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How long a stopping session waits on a client that is not reading
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A transport-neutral WebSocket frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    fn message(message: &TerminalMessage) -> Self {
        Self::Text(message.to_json())
    }
}

/// Allow-list of shells a client may request
#[derive(Clone, Debug)]
pub struct ShellPolicy {
    allowed: Vec<String>,
    fallback: String,
}

impl ShellPolicy {
    pub fn new(allowed: Vec<String>, fallback: impl Into<String>) -> Self {
        Self {
            allowed,
            fallback: fallback.into(),
        }
    }

    /// The requested shell if it is allowed, the fallback otherwise
    pub fn resolve(&self, requested: &str) -> String {
        if self.allowed.iter().any(|shell| shell == requested) {
            requested.to_string()
        } else {
            self.fallback.clone()
        }
    }
}

impl Default for ShellPolicy {
    fn default() -> Self {
        Self::new(
            ["bash", "sh", "powershell", "cmd"]
                .into_iter()
                .map(String::from)
                .collect(),
            DEFAULT_SHELL,
        )
    }
}

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub shells: ShellPolicy,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// How long starting the remote command may take
    pub exec_timeout: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shells: ShellPolicy::default(),
            keepalive_interval: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(10),
        }
    }
}

/// One running exec session
pub struct TerminalSession {
    id: String,
    target: PodTarget,
    shell: String,
    created_at: DateTime<Utc>,
    stop: CancellationToken,
}

impl TerminalSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &PodTarget {
        &self.target
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Runs exec sessions and tracks them in the registry
#[derive(Clone)]
pub struct TerminalManager {
    registry: SessionRegistry<Session>,
    config: TerminalConfig,
}

impl TerminalManager {
    pub fn new(registry: SessionRegistry<Session>, config: TerminalConfig) -> Self {
        Self { registry, config }
    }

    pub fn shells(&self) -> &ShellPolicy {
        &self.config.shells
    }

    /// Start a shell in the pod and bridge it to the client until either side
    /// goes away.
    ///
    /// Start failures are reported in-band as a stdout message followed by a
    /// close frame.
    pub async fn serve<Tx, Rx, E>(
        &self,
        backend: Arc<dyn ClusterBackend>,
        target: PodTarget,
        requested_shell: &str,
        mut tx: Tx,
        rx: Rx,
    ) where
        Tx: Sink<Frame> + Send + Unpin + 'static,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let shell = self.config.shells.resolve(requested_shell);
        if shell != requested_shell {
            tracing::debug!(requested = requested_shell, shell = %shell, "falling back to default shell");
        }

        let started = tokio::time::timeout(
            self.config.exec_timeout,
            backend.exec(&target, vec![shell.clone()]),
        )
        .await;

        let streams = match started {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                tracing::warn!(pod = %target.name, namespace = %target.namespace, error = %e, "could not start terminal");
                reject(&mut tx, &format!("Could not create terminal: {}", e)).await;
                return;
            }
            Err(_) => {
                tracing::warn!(pod = %target.name, namespace = %target.namespace, "terminal start timed out");
                let message = format!(
                    "Could not create terminal: no response after {:?}",
                    self.config.exec_timeout
                );
                reject(&mut tx, &message).await;
                return;
            }
        };

        let session = Arc::new(TerminalSession {
            id: SessionOrigin::Internal.new_id(),
            target,
            shell,
            created_at: Utc::now(),
            stop: CancellationToken::new(),
        });
        self.registry
            .put(session.id.clone(), Session::Terminal(Arc::clone(&session)));

        tracing::info!(
            session = %session.id,
            pod = %session.target.name,
            namespace = %session.target.namespace,
            container = session.target.container_name(),
            shell = %session.shell,
            "terminal started"
        );

        bridge(&session, self.config.keepalive_interval, tx, rx, streams).await;

        self.registry.delete(&session.id);
        tracing::info!(
            session = %session.id,
            uptime_secs = (Utc::now() - session.created_at).num_seconds(),
            "terminal closed"
        );
    }
}

/// Report a start failure in-band and close the channel
async fn reject<Tx>(tx: &mut Tx, message: &str)
where
    Tx: Sink<Frame> + Unpin,
{
    let report = async {
        let _ = tx
            .send(Frame::message(&TerminalMessage::stdout(message)))
            .await;
        let _ = tx.send(Frame::Close).await;
        let _ = tx.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, report).await.is_err() {
        tracing::debug!("client did not accept the start failure report");
    }
}

async fn bridge<Tx, Rx, E>(
    session: &TerminalSession,
    keepalive_interval: Duration,
    tx: Tx,
    rx: Rx,
    streams: ExecStreams,
) where
    Tx: Sink<Frame> + Send + Unpin + 'static,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Frame, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
{
    let ExecStreams {
        stdin,
        stdout,
        stderr,
        resize,
        exit,
    } = streams;
    let stop = session.stop.clone();
    let (frames_tx, frames_rx) = mpsc::channel(OUTPUT_BUFFER);

    let writer = tokio::spawn(write_frames(tx, frames_rx, stop.clone()));
    let keepalive = tokio::spawn(keepalive(
        frames_tx.clone(),
        keepalive_interval,
        stop.clone(),
    ));
    let reader = tokio::spawn(read_frames(rx, stdin, resize, stop.clone()));

    let mut outputs = vec![tokio::spawn(pump_output(
        stdout,
        OutputKind::Stdout,
        frames_tx.clone(),
        stop.clone(),
    ))];
    if let Some(stderr) = stderr {
        outputs.push(tokio::spawn(pump_output(
            stderr,
            OutputKind::Stderr,
            frames_tx.clone(),
            stop.clone(),
        )));
    }

    let failure = tokio::select! {
        result = exit => match result {
            Ok(()) => {
                tracing::debug!(session = %session.id, "remote command exited");
                None
            }
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "remote command failed");
                Some(e)
            }
        },
        _ = stop.cancelled() => {
            tracing::debug!(session = %session.id, "terminal stopped");
            None
        }
    };

    // Let the last output of the command reach the client
    let drained = async {
        for output in outputs {
            let _ = output.await;
        }
    };
    let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, drained).await;

    // A shell that cannot be started only fails once the stream is joined
    if let Some(e) = failure {
        let report = Frame::message(&TerminalMessage::stdout(format!(
            "Could not create terminal: {}",
            e
        )));
        let _ = tokio::time::timeout(CLOSE_GRACE, frames_tx.send(report)).await;
    }
    drop(frames_tx);

    stop.cancel();
    let _ = reader.await;
    let _ = keepalive.await;
    let _ = writer.await;
}

/// Owns the sink: forwards queued frames, then closes it exactly once.
///
/// After the stop signal, sending is bounded by `CLOSE_GRACE` so a client
/// that stopped reading cannot keep the session alive.
async fn write_frames<Tx>(mut tx: Tx, mut frames: mpsc::Receiver<Frame>, stop: CancellationToken)
where
    Tx: Sink<Frame> + Unpin,
    Tx::Error: fmt::Display,
{
    let stopped = async {
        stop.cancelled().await;
        tokio::time::sleep(CLOSE_GRACE).await;
    };
    tokio::pin!(stopped);

    loop {
        let frame = tokio::select! {
            frame = frames.recv() => frame,
            _ = stop.cancelled() => break,
        };
        let Some(frame) = frame else {
            break;
        };

        tokio::select! {
            sent = tx.send(frame) => {
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "terminal write failed");
                    break;
                }
            }
            _ = &mut stopped => {
                tracing::debug!("client stopped reading, dropping terminal output");
                break;
            }
        }
    }

    stop.cancel();

    // Flush what was queued before the stop
    let finish = async {
        while let Ok(frame) = frames.try_recv() {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = tx.send(Frame::Close).await;
        let _ = tx.close().await;
    };
    if tokio::time::timeout(CLOSE_GRACE, finish).await.is_err() {
        tracing::debug!("client did not accept the close frame");
    }
}

/// Feeds client frames to stdin and resize events to the resize channel
async fn read_frames<Rx, E>(
    mut rx: Rx,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    resize: mpsc::Sender<TerminalSize>,
    stop: CancellationToken,
) where
    Rx: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            frame = rx.next() => frame,
            _ = stop.cancelled() => break,
        };

        let input = match frame {
            Some(Ok(Frame::Text(text))) => match serde_json::from_str::<TerminalMessage>(&text) {
                Ok(TerminalMessage::Stdin { data }) => data.into_bytes(),
                Ok(TerminalMessage::Resize { cols, rows }) => {
                    tokio::select! {
                        _ = resize.send(TerminalSize { cols, rows }) => continue,
                        _ = stop.cancelled() => break,
                    }
                }
                Ok(other) => {
                    tracing::debug!(?other, "ignoring terminal message");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed terminal message");
                    continue;
                }
            },
            Some(Ok(Frame::Binary(data))) => data,
            // Pongs are accepted as-is; pings are answered by the socket layer
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => continue,
            Some(Ok(Frame::Close)) | None => break,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "terminal read failed");
                break;
            }
        };

        let written = tokio::select! {
            written = write_input(&mut stdin, &input) => written,
            _ = stop.cancelled() => break,
        };
        if let Err(e) = written {
            tracing::debug!(error = %e, "writing to remote stdin failed");
            break;
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, stdin.shutdown()).await;
    stop.cancel();
}

async fn write_input(
    stdin: &mut Box<dyn AsyncWrite + Send + Unpin>,
    input: &[u8],
) -> std::io::Result<()> {
    stdin.write_all(input).await?;
    stdin.flush().await
}

/// Queue a frame for the writer unless the session stops first
async fn queue(frames: &mpsc::Sender<Frame>, frame: Frame, stop: &CancellationToken) -> bool {
    tokio::select! {
        sent = frames.send(frame) => sent.is_ok(),
        _ = stop.cancelled() => false,
    }
}

async fn keepalive(frames: mpsc::Sender<Frame>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !queue(&frames, Frame::Ping(Vec::new()), &stop).await {
                    break;
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    fn message(self, data: String) -> TerminalMessage {
        match self {
            Self::Stdout => TerminalMessage::Stdout { data },
            Self::Stderr => TerminalMessage::Stderr { data },
        }
    }
}

/// Forwards one output stream to the client as terminal messages
async fn pump_output(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    kind: OutputKind,
    frames: mpsc::Sender<Frame>,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut decoder = Utf8Decoder::default();

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = stop.cancelled() => break,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(?kind, error = %e, "reading remote output failed");
                break;
            }
        };

        let data = decoder.decode(&buf[..n]);
        if data.is_empty() {
            continue;
        }
        if !queue(&frames, Frame::message(&kind.message(data)), &stop).await {
            return;
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        queue(&frames, Frame::message(&kind.message(rest)), &stop).await;
    }
}

/// Decodes UTF-8 across read boundaries, holding back incomplete sequences
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
