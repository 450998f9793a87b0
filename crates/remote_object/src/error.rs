//! Error taxonomy: one application-visible error kind (`MethodCallError`),
//! plus the lower transport/codec failures the application kind wraps.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

/// The single application-visible error kind, `METHOD_CALL_ERROR` on the wire.
///
/// Carries only a human-readable message, never a backtrace or error chain —
/// the server collapses every method failure (forbidden method, bad
/// arguments, a raising method body, a deferred/overall timeout) to its
/// string form before it ever reaches the wire.
///
/// Note on ambiguity: a deferred-response timeout produces the literal
/// message `"timeout"`, which is indistinguishable from a server-side method
/// that itself fails with the string `"timeout"`. This is intentional — see
/// the design notes on why a dedicated failure kind was not introduced.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct MethodCallError(pub String);

impl MethodCallError {
    pub fn new(message: impl Into<String>) -> Self {
        MethodCallError(message.into())
    }

    pub fn forbidden_method(method: &str) -> Self {
        MethodCallError(format!("Forbidden method '{method}'"))
    }

    pub fn non_serializable_result() -> Self {
        MethodCallError("Non-serializable result".to_string())
    }

    pub fn timeout() -> Self {
        MethodCallError("timeout".to_string())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Failures from the framing/transport layer, distinct from an
/// application-level `MethodCallError` because the server never answered.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error on the underlying connection: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Disconnected,
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("received a frame that does not match any pending request")]
    UnsolicitedFrame,
    #[error("transport task's receiver was dropped")]
    ChannelClosed,
}

/// Classification of a `RemoteObject` call failure, used by `handle_failure`
/// to decide whether a request is retry-eligible.
#[derive(Debug)]
pub enum CallFailure {
    /// The server answered with a `METHOD_CALL_ERROR`. Never retried.
    Protocol(MethodCallError),
    /// The framing/transport layer failed before an answer arrived. Retried
    /// only when `retry_on_reconnect` is enabled.
    Transport(TransportError),
}

impl CallFailure {
    pub fn is_protocol(&self) -> bool {
        matches!(self, CallFailure::Protocol(_))
    }

    pub fn into_method_call_error(self) -> MethodCallError {
        match self {
            CallFailure::Protocol(err) => err,
            CallFailure::Transport(err) => MethodCallError::new(err.to_string()),
        }
    }
}

impl From<MethodCallError> for CallFailure {
    fn from(err: MethodCallError) -> Self {
        CallFailure::Protocol(err)
    }
}

impl From<TransportError> for CallFailure {
    fn from(err: TransportError) -> Self {
        CallFailure::Transport(err)
    }
}
