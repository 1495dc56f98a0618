//! Child process supervision over stdio.
//!
//! Spawns a child, runs the two-phase handshake (`initialize`, then
//! `notifications/initialized` + `tools/list` once the child acknowledges),
//! and forwards every other classified message to the gateway as a
//! [`ChildEvent`].

use crate::config::ChildSpec;
use crate::correlator::RequestSink;
use crate::error::MuxError;
use crate::framer::LineFramer;
use crate::jsonrpc::{
    CATALOG_ID, ChildMessage, ErrorObject, HANDSHAKE_ID, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, PROTOCOL_VERSION, RequestId, error_codes,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// How long `terminate` waits for the process to be reaped.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long stdout may stay open after the process has exited, e.g. when a
/// grandchild inherited it.
const EXIT_DRAIN: Duration = Duration::from_secs(2);

/// Lifecycle of a child. Ordered so that states only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChildState {
    Spawning,
    Initializing,
    Ready,
    Terminating,
    Terminated,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

/// Something a child did that the gateway needs to react to.
#[derive(Debug)]
pub enum ChildEvent {
    Message { child: String, message: ChildMessage },
    Exited { child: String, status: String },
}

/// Identity sent in the handshake's `clientInfo`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Write half shared by the supervisor and its background tasks.
#[derive(Clone)]
struct Outbox {
    child: String,
    write_tx: mpsc::UnboundedSender<String>,
    state: Arc<watch::Sender<ChildState>>,
}

impl Outbox {
    fn send<T: Serialize>(&self, message: &T) -> Result<(), MuxError> {
        if *self.state.borrow() >= ChildState::Terminating {
            return Err(MuxError::ChildNotRunning {
                name: self.child.clone(),
            });
        }
        let line = serde_json::to_string(message)?;
        self.write_tx
            .send(line)
            .map_err(|_| MuxError::ChildNotRunning {
                name: self.child.clone(),
            })
    }

    /// Move to `next` if it is ahead of the current state.
    fn advance(&self, next: ChildState) -> bool {
        advance_state(&self.state, next)
    }
}

fn advance_state(state: &watch::Sender<ChildState>, next: ChildState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Owns one child process and its stdio.
pub struct ChildSupervisor {
    spec: ChildSpec,
    outbox: Outbox,
    kill: CancellationToken,
}

impl ChildSupervisor {
    /// Launch the child described by `spec` and send the handshake.
    ///
    /// Classified messages and the eventual exit are reported on `events`.
    pub fn spawn(
        spec: ChildSpec,
        client: &ClientInfo,
        handshake_timeout: Duration,
        events: mpsc::UnboundedSender<ChildEvent>,
    ) -> Result<Arc<Self>, MuxError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| MuxError::SpawnFailed {
            name: spec.name.clone(),
            source: e,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MuxError::Protocol(format!("stdin of '{}' not captured", spec.name)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MuxError::Protocol(format!("stdout of '{}' not captured", spec.name)))?;

        let (state, _) = watch::channel(ChildState::Spawning);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let outbox = Outbox {
            child: spec.name.clone(),
            write_tx,
            state: Arc::new(state),
        };
        let kill = CancellationToken::new();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(write_loop(spec.name.clone(), stdin, write_rx));
        tokio::spawn(read_loop(outbox.clone(), stdout, ack_tx, exit_rx, events));

        let handshake = JsonRpcRequest::new(
            HANDSHAKE_ID,
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "clientInfo": { "name": client.name, "version": client.version }
            })),
        );
        // Queue the handshake before an early exit can mark the child dead.
        let sent = outbox.send(&handshake);
        tokio::spawn(watch_exit(spec.name.clone(), child, kill.clone(), exit_tx));
        if let Err(e) = sent {
            kill.cancel();
            return Err(e);
        }
        outbox.advance(ChildState::Initializing);
        tokio::spawn(finish_handshake(outbox.clone(), ack_rx, handshake_timeout));

        tracing::info!(
            "Spawned child '{}' ({} {})",
            spec.name,
            spec.command,
            spec.args.join(" ")
        );

        Ok(Arc::new(Self { spec, outbox, kill }))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> ChildState {
        *self.outbox.state.borrow()
    }

    /// Wait until the state reaches at least `target`. Returns `false` on
    /// timeout.
    pub async fn wait_for_state(&self, target: ChildState, timeout: Duration) -> bool {
        let mut rx = self.outbox.state.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|state| *state >= target)).await,
            Ok(Ok(_))
        )
    }

    /// Record that the child's first catalog report has been processed.
    pub fn mark_ready(&self) -> bool {
        self.outbox.advance(ChildState::Ready)
    }

    /// Serialize `message` and write it to the child's stdin.
    pub fn write<T: Serialize>(&self, message: &T) -> Result<(), MuxError> {
        self.outbox.send(message)
    }

    /// Ask the child for its tool catalog.
    pub fn request_catalog(&self) -> Result<(), MuxError> {
        self.write(&catalog_request())
    }

    /// Kill the child and wait (bounded) for it to be reaped. Idempotent.
    pub async fn terminate(&self) {
        if self.outbox.advance(ChildState::Terminating) {
            tracing::info!("Stopping child '{}'", self.spec.name);
        }
        self.kill.cancel();
        if !self
            .wait_for_state(ChildState::Terminated, TERMINATE_GRACE)
            .await
        {
            tracing::warn!(
                "Child '{}' not reaped within {}s",
                self.spec.name,
                TERMINATE_GRACE.as_secs()
            );
        }
    }
}

impl RequestSink for ChildSupervisor {
    fn child_name(&self) -> &str {
        &self.spec.name
    }

    fn write_request(&self, request: &JsonRpcRequest) -> Result<(), MuxError> {
        self.write(request)
    }
}

impl Drop for ChildSupervisor {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn catalog_request() -> JsonRpcRequest {
    JsonRpcRequest::new(CATALOG_ID, "tools/list", Some(serde_json::json!({})))
}

/// Drain the write channel into the child's stdin, one line per message.
async fn write_loop(child: String, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!("Stdin of child '{child}' closed: {e}");
            break;
        }
    }
}

/// Frame and classify stdout; handle handshake acks and child requests here,
/// forward everything else.
///
/// `Exited` is reported from here, once stdout is drained and the exit status
/// is known, so it always follows the child's last message.
async fn read_loop(
    outbox: Outbox,
    stdout: ChildStdout,
    ack_tx: oneshot::Sender<Result<Value, ErrorObject>>,
    mut exit_rx: oneshot::Receiver<String>,
    events: mpsc::UnboundedSender<ChildEvent>,
) {
    let mut ack_tx = Some(ack_tx);
    let mut frames = FramedRead::new(stdout, LineFramer::new(outbox.child.clone()));
    let mut status: Option<String> = None;
    let mut forwarding = true;

    loop {
        let frame = if status.is_none() {
            tokio::select! {
                frame = frames.next() => frame,
                exited = &mut exit_rx => {
                    status = Some(exit_status(exited));
                    continue;
                }
            }
        } else {
            match tokio::time::timeout(EXIT_DRAIN, frames.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    tracing::warn!(
                        "Stdout of child '{}' still open {}s after exit, abandoning it",
                        outbox.child,
                        EXIT_DRAIN.as_secs()
                    );
                    break;
                }
            }
        };
        let Some(frame) = frame else {
            break;
        };
        let value = match frame {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed reading stdout of child '{}': {e}", outbox.child);
                break;
            }
        };
        if !forwarding {
            continue;
        }
        let Some(message) = ChildMessage::classify(value) else {
            tracing::debug!("Ignoring unrecognised message from '{}'", outbox.child);
            continue;
        };

        match message {
            ChildMessage::HandshakeAck(result) => {
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(Ok(result));
                }
            }
            ChildMessage::HandshakeRejected(error) => {
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(Err(error));
                }
            }
            ChildMessage::Request { id, method } => answer_child_request(&outbox, id, &method),
            message => {
                let event = ChildEvent::Message {
                    child: outbox.child.clone(),
                    message,
                };
                forwarding = events.send(event).is_ok();
            }
        }
    }
    tracing::debug!("Stdout of child '{}' closed", outbox.child);

    let status = match status {
        Some(status) => status,
        None => exit_status(exit_rx.await),
    };
    tracing::info!("Child '{}' exited: {status}", outbox.child);
    let _ = events.send(ChildEvent::Exited {
        child: outbox.child.clone(),
        status,
    });
    outbox.advance(ChildState::Terminated);
}

fn exit_status(received: Result<String, oneshot::error::RecvError>) -> String {
    received.unwrap_or_else(|_| "unknown (exit watcher gone)".to_string())
}

fn answer_child_request(outbox: &Outbox, id: RequestId, method: &str) {
    let response = if method == "ping" {
        JsonRpcResponse::success(id, serde_json::json!({}))
    } else {
        tracing::debug!(
            "Child '{}' sent unsupported request '{method}'",
            outbox.child
        );
        JsonRpcResponse::failure(
            Some(id),
            ErrorObject::new(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        )
    };
    if let Err(e) = outbox.send(&response) {
        tracing::debug!("Could not answer child '{}': {e}", outbox.child);
    }
}

/// Second phase of the handshake: runs once the child acknowledges.
async fn finish_handshake(
    outbox: Outbox,
    ack_rx: oneshot::Receiver<Result<Value, ErrorObject>>,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, ack_rx).await {
        Ok(Ok(Ok(result))) => {
            let version = result
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            tracing::debug!(
                "Child '{}' acknowledged handshake (protocol {version})",
                outbox.child
            );
            let sent = outbox
                .send(&JsonRpcNotification::new("notifications/initialized", None))
                .and_then(|()| outbox.send(&catalog_request()));
            if let Err(e) = sent {
                tracing::warn!("Could not request catalog from '{}': {e}", outbox.child);
            }
        }
        Ok(Ok(Err(error))) => {
            tracing::warn!(
                "Child '{}' rejected the handshake: {}; it will contribute no tools",
                outbox.child,
                error.message
            );
        }
        Ok(Err(_)) => {
            tracing::debug!("Child '{}' closed before acknowledging handshake", outbox.child);
        }
        Err(_) => {
            tracing::warn!(
                "Child '{}' did not acknowledge the handshake within {}ms; it will contribute no tools",
                outbox.child,
                timeout.as_millis()
            );
        }
    }
}

/// Own the process handle: reap it when it exits or kill it on request, then
/// hand the exit status to the reader.
async fn watch_exit(
    child_name: String,
    mut child: Child,
    kill: CancellationToken,
    exit_tx: oneshot::Sender<String>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Kill of child '{child_name}' failed: {e}");
            }
            child.wait().await
        }
    };
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown ({e})"),
    };
    tracing::debug!("Child '{child_name}' reaped: {status}");
    let _ = exit_tx.send(status);
}
