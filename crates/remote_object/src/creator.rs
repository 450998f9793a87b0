//! Top-level entry point: binds a socket path and configuration,
//! connects, and hands back a ready-to-use [`RemoteObject`].
//!
//! `connect()` waits for either a first successful connection or a give-up,
//! whichever comes first, then stops listening for further first-connection
//! notifications.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::{ClientProtocolConfig, ReconnectConfig, RemoteObjectConfig};
use crate::reconnect::{ConnectEvent, ReconnectingClientFactory};
use crate::remote_object::RemoteObject;

/// Failure to establish the first connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("exhausted reconnect attempts without establishing a connection")]
    GaveUp,
}

/// Builds a [`ReconnectingClientFactory`] bound to a socket path and drives
/// it to its first connection.
///
/// `connect()` hands back the factory alongside the [`RemoteObject`]; call
/// [`ReconnectingClientFactory::disconnect`] on it for an orderly shutdown
/// (stop reconnecting, close the live transport) since the creator itself
/// is consumed by `connect()`.
pub struct RemoteObjectCreator {
    socket_path: PathBuf,
    reconnect: ReconnectConfig,
    client_config: ClientProtocolConfig,
    object_config: RemoteObjectConfig,
}

impl RemoteObjectCreator {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            reconnect: ReconnectConfig::default(),
            client_config: ClientProtocolConfig::default(),
            object_config: RemoteObjectConfig::default(),
        }
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn client_config(mut self, client_config: ClientProtocolConfig) -> Self {
        self.client_config = client_config;
        self
    }

    pub fn object_config(mut self, object_config: RemoteObjectConfig) -> Self {
        self.object_config = object_config;
        self
    }

    /// Start the underlying factory and await its first connection (or its
    /// give-up, if `max_retries` is set on the reconnect config).
    pub async fn connect(self) -> Result<(RemoteObject, Arc<ReconnectingClientFactory>), ConnectError> {
        let factory = ReconnectingClientFactory::new(
            self.socket_path,
            self.reconnect,
            self.client_config,
        );

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        factory
            .add_notifier(move |event| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let outcome = match event {
                        ConnectEvent::Connected(_) => Ok(()),
                        ConnectEvent::GaveUp => Err(ConnectError::GaveUp),
                    };
                    let _ = tx.send(outcome);
                }
            })
            .await;

        factory.start();

        match rx.await {
            Ok(Ok(())) => {
                let object = RemoteObject::new(Arc::clone(&factory), self.object_config).await;
                Ok((object, factory))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ConnectError::GaveUp),
        }
    }
}
