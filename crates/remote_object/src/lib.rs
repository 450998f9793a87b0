#![forbid(unsafe_code)]
//! Reconnecting remote-method-call transport over a framed Unix domain socket.
//!
//! A server exposes a single object's whitelisted methods by name; clients
//! call them by name with positional/keyword arguments and get back either
//! an immediate value or, for methods that can't answer synchronously, a
//! deferred value delivered later on the same connection. On top of that,
//! [`RemoteObject`] adds reconnect-with-backoff and, optionally, transparent
//! replay of calls lost to a dropped connection.
//!
//! ## Layers
//! - [`codec`] — the closed [`Value`] type and its wire encoding.
//! - [`server`] / [`listener`] — expose an object via [`RemoteMethods`],
//!   bind it to a socket with [`MethodCallServer`].
//! - [`client_protocol`] — [`ClientProtocol`], one live connection's call
//!   table and deferred-response bookkeeping.
//! - [`reconnect`] — [`ReconnectingClientFactory`], golden-ratio backoff.
//! - [`remote_object`] / [`creator`] — [`RemoteObject`] and
//!   [`RemoteObjectCreator`], the client-facing API most callers want.
//!
//! ```rust,no_run
//! use remote_object::{RemoteObjectCreator, Value};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (remote, _factory) = RemoteObjectCreator::new("/tmp/app.sock").connect().await?;
//! let sum = remote.call("add", vec![Value::Int(2), Value::Int(3)], Default::default()).await?;
//! println!("{sum:?}");
//! # Ok(()) }
//! ```

pub mod client_protocol;
pub mod codec;
pub mod config;
pub mod creator;
pub mod error;
pub mod frame;
pub mod listener;
pub mod reconnect;
pub mod remote_object;
pub mod server;

pub use client_protocol::{ClientProtocol, MethodCallReply};
pub use codec::Value;
pub use config::{ClientProtocolConfig, ReconnectConfig, RemoteObjectConfig, GOLDEN_RATIO};
pub use creator::{ConnectError, RemoteObjectCreator};
pub use error::{CallFailure, MethodCallError, TransportError};
pub use frame::Frame;
pub use listener::{ListenError, MethodCallServer};
pub use reconnect::{ConnectEvent, ReconnectingClientFactory};
pub use remote_object::{RemoteObject, RequestToken};
pub use server::{MethodOutcome, RemoteMethods};
