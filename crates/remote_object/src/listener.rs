//! The server factory: holds the single exposed object and mints a
//! [`crate::server::serve_connection`] task per accepted connection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::{serve_connection, RemoteMethods};

/// Errors raised while starting the listener.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind Unix socket at {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts connections on a Unix domain socket and serves each one against a
/// single shared exposed object. The object is shared across all concurrent
/// connections; serializing access to it, if needed, is the host's job.
pub struct MethodCallServer {
    listener: UnixListener,
    methods: Arc<dyn RemoteMethods>,
    whitelist: Arc<HashSet<String>>,
}

impl MethodCallServer {
    /// Bind a new server at `socket_path`, exposing `methods` restricted to
    /// `whitelist`.
    pub fn bind(
        socket_path: impl AsRef<Path>,
        methods: Arc<dyn RemoteMethods>,
        whitelist: HashSet<String>,
    ) -> Result<Self, ListenError> {
        let path = socket_path.as_ref();
        let listener = UnixListener::bind(path).map_err(|source| ListenError::Bind {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            listener,
            methods,
            whitelist: Arc::new(whitelist),
        })
    }

    /// Accept connections forever, spawning one task per connection. Returns
    /// only on a listener-level I/O error (the bound socket going away).
    pub async fn run(&self) -> std::io::Error {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("accepted method-call connection");
                    let methods = Arc::clone(&self.methods);
                    let whitelist = Arc::clone(&self.whitelist);
                    tokio::spawn(async move {
                        serve_connection(methods, whitelist, stream).await;
                        debug!("method-call connection closed");
                    });
                }
                Err(err) => return err,
            }
        }
    }

    /// Spawn [`Self::run`] as a background task and return its handle.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<std::io::Error> {
        info!("method-call server accepting connections");
        tokio::spawn(async move { self.run().await })
    }
}
