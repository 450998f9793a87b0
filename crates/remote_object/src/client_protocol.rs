//! The client side of the protocol: sends `MethodCall`s, tracks the
//! pending-response table keyed by correlation id, and enforces the
//! deferred-response timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::codec::{self, Value};
use crate::config::ClientProtocolConfig;
use crate::error::{CallFailure, MethodCallError, TransportError};
use crate::frame::{self, Frame};

/// The `MethodCall` reply shape: exactly one of `result` being the real
/// value, or `deferred` being present, holds.
#[derive(Debug, Clone)]
pub struct MethodCallReply {
    pub result: Value,
    pub deferred: Option<String>,
}

type PendingCall = oneshot::Sender<Result<MethodCallReply, CallFailure>>;

struct PendingDeferred {
    tx: oneshot::Sender<Result<Value, MethodCallError>>,
    timeout: JoinHandle<()>,
}

/// A connected client protocol instance, bound to one live connection.
///
/// Always used behind an `Arc` (see [`ClientProtocol::connect`]) since the
/// deferred-response timeout and the reader task both need to reach back
/// into the pending-response table after this value is constructed.
pub struct ClientProtocol {
    outbound_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU64,
    pending_calls: Mutex<HashMap<u64, PendingCall>>,
    pending_responses: Mutex<HashMap<String, PendingDeferred>>,
    deferred_response_timeout: Duration,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    writer_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: Notify,
}

impl ClientProtocol {
    /// Bind a protocol instance to an already-connected stream, spawning its
    /// reader and writer tasks.
    pub fn connect<S>(stream: S, config: ClientProtocolConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

        let protocol = Arc::new(Self {
            outbound_tx,
            next_id: AtomicU64::new(1),
            pending_calls: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            deferred_response_timeout: config.deferred_response_timeout,
            reader_task: std::sync::Mutex::new(None),
            writer_task: std::sync::Mutex::new(None),
            closed: Notify::new(),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if frame::write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_protocol = Arc::clone(&protocol);
        let reader = tokio::spawn(async move {
            reader_loop(reader_protocol, &mut read_half).await;
        });

        *protocol.reader_task.lock().unwrap() = Some(reader);
        *protocol.writer_task.lock().unwrap() = Some(writer);
        protocol
    }

    /// Send a `MethodCall` and await its immediate reply. The
    /// returned reply may itself carry a `deferred` id; pass it to
    /// [`Self::handle_response`] (or just call [`Self::call`]) to wait for
    /// the eventual value.
    pub async fn send_method_call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<MethodCallReply, CallFailure> {
        let args_bytes = codec::encode(&Value::List(args))
            .map_err(|err| CallFailure::Protocol(MethodCallError::new(err.to_string())))?;
        let kwargs_bytes = codec::encode(&Value::Dict(kwargs))
            .map_err(|err| CallFailure::Protocol(MethodCallError::new(err.to_string())))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(id, tx);

        let frame = Frame::MethodCallRequest {
            id,
            method: method.to_string(),
            args: args_bytes,
            kwargs: kwargs_bytes,
        };
        if self.outbound_tx.send(frame).is_err() {
            self.pending_calls.lock().await.remove(&id);
            return Err(CallFailure::Transport(TransportError::Disconnected));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallFailure::Transport(TransportError::ChannelClosed)),
        }
    }

    /// Send a `MethodCall` and resolve to its final value, transparently
    /// awaiting a `DeferredResponse` if the server deferred the reply.
    pub async fn call(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, CallFailure> {
        let reply = self.send_method_call(method, args, kwargs).await?;
        self.handle_response(reply).await
    }

    /// `handle_response`: if the reply carries a `deferred` id, register
    /// a pending entry (with its own timeout) and wait for the matching
    /// `DeferredResponse`; otherwise the reply already carries the value.
    pub async fn handle_response(
        self: &Arc<Self>,
        reply: MethodCallReply,
    ) -> Result<Value, CallFailure> {
        let Some(uuid) = reply.deferred else {
            return Ok(reply.result);
        };

        let (tx, rx) = oneshot::channel();
        let timeout_protocol = Arc::clone(self);
        let timeout_uuid = uuid.clone();
        let timeout_duration = self.deferred_response_timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(timeout_duration).await;
            timeout_protocol
                .fire_pending_response(&timeout_uuid, None, Some(MethodCallError::timeout().0))
                .await;
        });

        self.pending_responses
            .lock()
            .await
            .insert(uuid, PendingDeferred { tx, timeout });

        match rx.await {
            Ok(result) => result.map_err(CallFailure::Protocol),
            Err(_) => Err(CallFailure::Transport(TransportError::ChannelClosed)),
        }
    }

    /// `fire_pending_response`: pop the entry for `uuid`, cancel its
    /// timeout, and resolve its caller. A missing entry (already timed out,
    /// or a duplicate `DeferredResponse`) is silently dropped.
    async fn fire_pending_response(&self, uuid: &str, result: Option<Value>, failure: Option<String>) {
        let entry = self.pending_responses.lock().await.remove(uuid);
        let Some(entry) = entry else {
            return;
        };
        entry.timeout.abort();
        let outcome = match failure {
            Some(message) => Err(MethodCallError::new(message)),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = entry.tx.send(outcome);
    }

    /// Number of deferred calls still awaiting a `DeferredResponse`. Used by
    /// tests to check the pending tables drain fully after every call.
    pub async fn pending_response_count(&self) -> usize {
        self.pending_responses.lock().await.len()
    }

    /// Number of in-flight `MethodCall`s awaiting their immediate reply.
    pub async fn pending_call_count(&self) -> usize {
        self.pending_calls.lock().await.len()
    }

    /// Resolves once the underlying connection's reader loop has exited,
    /// i.e. the peer disconnected or a read error occurred. Used by
    /// [`crate::reconnect::ReconnectingClientFactory`] to notice connection
    /// loss without polling.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    /// Tear down this connection: abort the reader/writer tasks, fail every
    /// pending call and deferred wait, and wake anyone blocked on
    /// [`Self::closed`]. Used by
    /// [`crate::reconnect::ReconnectingClientFactory::disconnect`] for an
    /// orderly shutdown rather than relying on `Drop` alone.
    pub async fn close(self: &Arc<Self>) {
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().unwrap().take() {
            handle.abort();
        }
        drain_pending_calls(self).await;
        drain_pending_responses(self).await;
        self.closed.notify_waiters();
    }
}

async fn reader_loop<R>(protocol: Arc<ClientProtocol>, read_half: &mut R)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frame::read_frame(read_half).await {
            Ok(Some(Frame::MethodCallOk { id, result, deferred })) => {
                if let Some(tx) = protocol.pending_calls.lock().await.remove(&id) {
                    let result = codec::decode(&result)
                        .map(|value| MethodCallReply { result: value, deferred })
                        .map_err(|err| CallFailure::Transport(TransportError::Codec(err)));
                    let _ = tx.send(result);
                }
            }
            Ok(Some(Frame::MethodCallErr { id, message })) => {
                if let Some(tx) = protocol.pending_calls.lock().await.remove(&id) {
                    let _ = tx.send(Err(CallFailure::Protocol(MethodCallError::new(message))));
                }
            }
            Ok(Some(Frame::DeferredResponse { uuid, result, failure })) => {
                let decoded = result.and_then(|bytes| codec::decode(&bytes).ok());
                protocol.fire_pending_response(&uuid, decoded, failure).await;
            }
            Ok(Some(other)) => {
                warn!("client protocol received unexpected frame: {other:?}");
            }
            Ok(None) => break,
            Err(err) => {
                warn!("client protocol read error: {err}");
                break;
            }
        }
    }

    drain_pending_calls(&protocol).await;
    drain_pending_responses(&protocol).await;
    protocol.closed.notify_waiters();
}

async fn drain_pending_calls(protocol: &Arc<ClientProtocol>) {
    let mut pending = protocol.pending_calls.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CallFailure::Transport(TransportError::Disconnected)));
    }
}

/// Drop every pending deferred-call sender without sending a value, so the
/// waiting [`ClientProtocol::handle_response`] sees a closed channel and
/// classifies the failure as transport-level.
async fn drain_pending_responses(protocol: &Arc<ClientProtocol>) {
    let mut pending = protocol.pending_responses.lock().await;
    for (_, entry) in pending.drain() {
        entry.timeout.abort();
        drop(entry.tx);
    }
}

impl Drop for ClientProtocol {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
