//! The server side of the protocol: whitelist enforcement, method
//! dispatch against the exposed object, and immediate vs. deferred replies.
//!
//! Each inbound call gets its own spawned task, so a slow or never-resolving
//! deferred method never blocks other calls on the same connection or the
//! connection's receive loop.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use crate::codec::{self, Value};
use crate::frame::{self, Frame};

/// Outcome of invoking a method: either already resolved, or a future the
/// caller is expected to drive to completion without blocking the dispatch
/// loop or holding the original request open waiting for it.
pub enum MethodOutcome {
    Ready(Result<Value, String>),
    Deferred(Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>),
}

impl MethodOutcome {
    pub fn ready_ok(value: Value) -> Self {
        MethodOutcome::Ready(Ok(value))
    }

    pub fn ready_err(message: impl Into<String>) -> Self {
        MethodOutcome::Ready(Err(message.into()))
    }

    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Value, String>> + Send + 'static,
    {
        MethodOutcome::Deferred(Box::pin(fut))
    }
}

/// The single server-local object whose named methods are invoked by string
/// lookup. Implementations are never asked about methods outside their own
/// whitelist — that is enforced by [`serve_connection`] before `call` is
/// invoked.
pub trait RemoteMethods: Send + Sync {
    fn call(&self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>)
        -> MethodOutcome;
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic in remote method".to_string()
    }
}

/// Drive one accepted connection to completion: splits `stream` into
/// read/write halves, runs a writer task draining outbound frames and a
/// reader loop dispatching inbound `MethodCallRequest` frames against
/// `methods` (subject to `whitelist`), and returns once the peer
/// disconnects.
pub async fn serve_connection<S>(
    methods: Arc<dyn RemoteMethods>,
    whitelist: Arc<HashSet<String>>,
    stream: S,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if frame::write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        match frame::read_frame(&mut read_half).await {
            Ok(Some(Frame::MethodCallRequest {
                id,
                method,
                args,
                kwargs,
            })) => {
                let methods = Arc::clone(&methods);
                let whitelist = Arc::clone(&whitelist);
                let outbound_tx = outbound_tx.clone();
                tokio::spawn(async move {
                    dispatch(methods, whitelist, outbound_tx, id, method, args, kwargs).await;
                });
            }
            Ok(Some(other)) => {
                warn!("server connection received unexpected frame: {other:?}");
            }
            Ok(None) => break,
            Err(err) => {
                warn!("server connection read error: {err}");
                break;
            }
        }
    }

    drop(outbound_tx);
    let _ = writer.await;
}

async fn dispatch(
    methods: Arc<dyn RemoteMethods>,
    whitelist: Arc<HashSet<String>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    id: u64,
    method: String,
    args_bytes: Vec<u8>,
    kwargs_bytes: Vec<u8>,
) {
    if !whitelist.contains(&method) {
        let _ = outbound_tx.send(Frame::MethodCallErr {
            id,
            message: format!("Forbidden method '{method}'"),
        });
        return;
    }

    let args = match decode_args(&args_bytes) {
        Ok(args) => args,
        Err(message) => {
            let _ = outbound_tx.send(Frame::MethodCallErr { id, message });
            return;
        }
    };
    let kwargs = match decode_kwargs(&kwargs_bytes) {
        Ok(kwargs) => kwargs,
        Err(message) => {
            let _ = outbound_tx.send(Frame::MethodCallErr { id, message });
            return;
        }
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        methods.call(&method, args, kwargs)
    }));
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => MethodOutcome::Ready(Err(panic_message(panic))),
    };

    match outcome {
        MethodOutcome::Ready(Ok(value)) => reply_immediate(&outbound_tx, id, value),
        MethodOutcome::Ready(Err(message)) => {
            let _ = outbound_tx.send(Frame::MethodCallErr { id, message });
        }
        MethodOutcome::Deferred(fut) => {
            let uuid = uuid::Uuid::new_v4().to_string();
            let _ = outbound_tx.send(Frame::MethodCallOk {
                id,
                result: codec::encode(&Value::Null).unwrap_or_default(),
                deferred: Some(uuid.clone()),
            });

            let handle = tokio::spawn(fut);
            tokio::spawn(async move {
                let outcome = match handle.await {
                    Ok(result) => result,
                    Err(join_err) => Err(join_err.to_string()),
                };
                let frame = match outcome {
                    Ok(value) if codec::is_serializable(&value) => Frame::DeferredResponse {
                        uuid,
                        result: codec::encode(&value).ok(),
                        failure: None,
                    },
                    Ok(_) => Frame::DeferredResponse {
                        uuid,
                        result: None,
                        failure: Some("Non-serializable result".to_string()),
                    },
                    Err(message) => Frame::DeferredResponse {
                        uuid,
                        result: None,
                        failure: Some(message),
                    },
                };
                let _ = outbound_tx.send(frame);
            });
        }
    }
}

fn reply_immediate(outbound_tx: &mpsc::UnboundedSender<Frame>, id: u64, value: Value) {
    if !codec::is_serializable(&value) {
        let _ = outbound_tx.send(Frame::MethodCallErr {
            id,
            message: "Non-serializable result".to_string(),
        });
        return;
    }
    let result = match codec::encode(&value) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = outbound_tx.send(Frame::MethodCallErr {
                id,
                message: err.to_string(),
            });
            return;
        }
    };
    let _ = outbound_tx.send(Frame::MethodCallOk {
        id,
        result,
        deferred: None,
    });
}

fn decode_args(bytes: &[u8]) -> Result<Vec<Value>, String> {
    match codec::decode(bytes) {
        Ok(Value::List(items)) => Ok(items),
        Ok(_) => Err("malformed args: expected a list".to_string()),
        Err(err) => Err(format!("malformed args: {err}")),
    }
}

fn decode_kwargs(bytes: &[u8]) -> Result<BTreeMap<String, Value>, String> {
    match codec::decode(bytes) {
        Ok(Value::Dict(map)) => Ok(map),
        Ok(_) => Err("malformed kwargs: expected a dict".to_string()),
        Err(err) => Err(format!("malformed kwargs: {err}")),
    }
}
