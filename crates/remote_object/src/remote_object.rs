//! The client-facing proxy: issues calls against whatever connection
//! is currently live, and optionally re-issues calls lost to a dropped
//! connection once a new one is established.
//!
//! The pending-request table is keyed by a locally-minted [`RequestToken`]
//! per in-flight call, since futures have no stable identity to hash on.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::client_protocol::ClientProtocol;
use crate::codec::Value;
use crate::config::RemoteObjectConfig;
use crate::error::{CallFailure, MethodCallError};
use crate::reconnect::{ConnectEvent, ReconnectingClientFactory};

/// Opaque key into the pending-request table, minted per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

struct PendingRequest {
    method: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    tx: oneshot::Sender<Result<Value, MethodCallError>>,
}

struct Inner {
    factory: Arc<ReconnectingClientFactory>,
    config: RemoteObjectConfig,
    next_token: AtomicU64,
    pending: Mutex<HashMap<RequestToken, PendingRequest>>,
}

/// A proxy for the single object exposed by a `MethodCallServer`, bound to a
/// [`ReconnectingClientFactory`] rather than one connection.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<Inner>,
}

impl RemoteObject {
    /// Wrap a reconnecting factory. Registers a notifier on the factory so
    /// that when `retry_on_reconnect` is set, calls lost to a dropped
    /// connection are replayed against the next one.
    pub async fn new(factory: Arc<ReconnectingClientFactory>, config: RemoteObjectConfig) -> Self {
        let inner = Arc::new(Inner {
            factory: Arc::clone(&factory),
            config,
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        });

        let retry_inner = Arc::clone(&inner);
        factory
            .add_notifier(move |event| {
                if let ConnectEvent::Connected(protocol) = event {
                    let inner = Arc::clone(&retry_inner);
                    tokio::spawn(async move {
                        retry_pending(inner, protocol).await;
                    });
                }
            })
            .await;

        Self { inner }
    }

    /// Call `method` with `args`/`kwargs` against the current connection.
    ///
    /// If no connection is currently live, or the call fails with a
    /// transport-level error, the behavior depends on
    /// [`RemoteObjectConfig::retry_on_reconnect`]: when enabled the call is
    /// parked in the pending-request table and retried against the next
    /// connection (possibly more than once); when disabled the transport
    /// failure is returned immediately. A protocol-level
    /// [`MethodCallError`] (the server answered with a failure) is never
    /// retried either way.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, MethodCallError> {
        let deadline = self.inner.config.timeout.map(|t| tokio::time::Instant::now() + t);
        let outcome = self.try_call(method, args.clone(), kwargs.clone()).await;

        match outcome {
            Ok(value) => Ok(value),
            Err(failure) => self.handle_failure(method, args, kwargs, failure, deadline).await,
        }
    }

    async fn try_call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, CallFailure> {
        let Some(protocol) = self.inner.factory.current().await else {
            return Err(CallFailure::Transport(crate::error::TransportError::Disconnected));
        };
        protocol.call(method, args, kwargs).await
    }

    /// `_handle_failure`: protocol errors propagate immediately;
    /// transport errors are parked for retry if enabled, else propagated.
    async fn handle_failure(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        failure: CallFailure,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Value, MethodCallError> {
        if failure.is_protocol() || !self.inner.config.retry_on_reconnect {
            return Err(failure.into_method_call_error());
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(failure.into_method_call_error());
            }
        }

        let token = RequestToken(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            token,
            PendingRequest {
                method: method.to_string(),
                args,
                kwargs,
                tx,
            },
        );
        debug!(method, token = token.value(), "parked call for retry on reconnect");

        let result = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout(remaining, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => return Err(MethodCallError::new("connection closed before retry")),
                    Err(_) => {
                        self.inner.pending.lock().await.remove(&token);
                        return Err(MethodCallError::timeout());
                    }
                }
            }
            None => match rx.await {
                Ok(result) => result,
                Err(_) => return Err(MethodCallError::new("connection closed before retry")),
            },
        };
        result
    }

    /// Number of calls currently parked for retry against the next
    /// connection. Used by tests to check the table drains fully once every
    /// call has either succeeded or given up.
    pub async fn pending_request_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

/// Reconnect-retry path: snapshot the pending-request table and clear it
/// before iterating, since a retried call that itself fails and reparks
/// would otherwise insert into the table while it is still being drained.
async fn retry_pending(inner: Arc<Inner>, protocol: Arc<ClientProtocol>) {
    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };

    if pending.is_empty() {
        return;
    }
    debug!(count = pending.len(), "retrying parked calls against new connection");

    for (token, request) in pending {
        let protocol = Arc::clone(&protocol);
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let result = protocol.call(&request.method, request.args.clone(), request.kwargs.clone()).await;
            match result {
                Ok(value) => {
                    let _ = request.tx.send(Ok(value));
                }
                Err(failure) if failure.is_protocol() => {
                    let _ = request.tx.send(Err(failure.into_method_call_error()));
                }
                Err(_) => {
                    warn!(token = token.value(), "retry failed again, re-parking");
                    inner.pending.lock().await.insert(token, request);
                }
            }
        });
    }
}

/// Exposed so callers can correlate a parked call with logs if needed.
impl RequestToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}
