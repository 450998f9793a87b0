//! Reconnection with golden-ratio exponential backoff.
//!
//! A delay that starts at `initial_delay`, multiplies by `factor` on each
//! failed attempt up to `max_delay`, and resets to `initial_delay` after a
//! successful connection. Subscribers learn about connect/give-up events
//! through a plain callback list rather than polling.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client_protocol::ClientProtocol;
use crate::config::{ClientProtocolConfig, ReconnectConfig};

/// An event fired to every registered notifier.
#[derive(Clone)]
pub enum ConnectEvent {
    /// A new connection was established; `RemoteObject`s should retry their
    /// pending requests against it.
    Connected(Arc<ClientProtocol>),
    /// The retry budget (`max_retries`) was exhausted; no further connection
    /// attempts will be made.
    GaveUp,
}

type Notifier = Box<dyn Fn(ConnectEvent) + Send + Sync>;

/// Reconnects to a Unix socket with golden-ratio backoff, notifying
/// registered listeners of each new connection or final give-up.
pub struct ReconnectingClientFactory {
    socket_path: PathBuf,
    reconnect: ReconnectConfig,
    client_config: ClientProtocolConfig,
    notifiers: Mutex<Vec<Notifier>>,
    current: Mutex<Option<Arc<ClientProtocol>>>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingClientFactory {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        reconnect: ReconnectConfig,
        client_config: ClientProtocolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket_path: socket_path.into(),
            reconnect,
            client_config,
            notifiers: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Register a callback invoked on every [`ConnectEvent`]. Always invoked
    /// from a spawned task, never synchronously from inside `register` or
    /// from the connect loop itself, so a notifier can safely call back into
    /// the factory.
    pub async fn add_notifier<F>(&self, notifier: F)
    where
        F: Fn(ConnectEvent) + Send + Sync + 'static,
    {
        self.notifiers.lock().await.push(Box::new(notifier));
    }

    /// The most recently established connection, if any.
    pub async fn current(&self) -> Option<Arc<ClientProtocol>> {
        self.current.lock().await.clone()
    }

    /// Start the connect loop as a background task. Calling this more than
    /// once replaces the previous loop's task handle without stopping it;
    /// callers are expected to call this exactly once per factory.
    pub fn start(self: &Arc<Self>) {
        let factory = Arc::clone(self);
        let handle = tokio::spawn(async move { factory.run().await });
        if let Ok(mut task) = self.task.try_lock() {
            *task = Some(handle);
        }
    }

    /// Stop retrying. Any connection already established stays open; no new
    /// connection attempts are made once the in-flight delay elapses.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// `disconnect`: stop further reconnection attempts and close the
    /// transport of whatever connection is currently live, if any.
    pub async fn disconnect(&self) {
        self.stop();
        if let Some(protocol) = self.current.lock().await.take() {
            protocol.close().await;
        }
    }

    async fn run(self: Arc<Self>) {
        let mut delay = self.reconnect.initial_delay;
        let mut retries: u32 = 0;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    info!(path = %self.socket_path.display(), "connected");
                    delay = self.reconnect.initial_delay;
                    retries = 0;

                    let protocol = ClientProtocol::connect(stream, self.client_config.clone());
                    *self.current.lock().await = Some(Arc::clone(&protocol));
                    self.notify(ConnectEvent::Connected(Arc::clone(&protocol))).await;

                    protocol.closed().await;
                    *self.current.lock().await = None;
                }
                Err(err) => {
                    retries += 1;
                    if let Some(max_retries) = self.reconnect.max_retries {
                        if retries > max_retries {
                            warn!(path = %self.socket_path.display(), %err, "giving up reconnecting");
                            self.notify(ConnectEvent::GaveUp).await;
                            return;
                        }
                    }
                    warn!(
                        path = %self.socket_path.display(),
                        %err,
                        attempt = retries,
                        delay_secs = delay.as_secs_f64(),
                        "connection attempt failed, backing off",
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, self.reconnect.factor, self.reconnect.max_delay);
                }
            }
        }
    }

    /// Fire `event` to every registered notifier from its own spawned task,
    /// so a notifier that calls back into the factory never deadlocks
    /// against `self.notifiers` or `self.current`.
    async fn notify(self: &Arc<Self>, event: ConnectEvent) {
        let factory = Arc::clone(self);
        let event = event.clone();
        tokio::spawn(async move {
            let notifiers = factory.notifiers.lock().await;
            for notifier in notifiers.iter() {
                notifier(event.clone());
            }
        });
    }
}

fn next_delay(current: std::time::Duration, factor: f64, max: std::time::Duration) -> std::time::Duration {
    let scaled = current.mul_f64(factor);
    scaled.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GOLDEN_RATIO;

    #[test]
    fn successive_delays_scale_by_the_golden_ratio_up_to_the_cap() {
        let max = std::time::Duration::from_secs(10);
        let mut delay = std::time::Duration::from_millis(100);
        for _ in 0..3 {
            let next = next_delay(delay, GOLDEN_RATIO, max);
            assert_eq!(next, delay.mul_f64(GOLDEN_RATIO).min(max));
            assert!(next > delay, "backoff must grow on each failed attempt");
            delay = next;
        }
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let max = std::time::Duration::from_millis(500);
        let mut delay = std::time::Duration::from_millis(400);
        for _ in 0..10 {
            delay = next_delay(delay, GOLDEN_RATIO, max);
            assert!(delay <= max);
        }
        assert_eq!(delay, max);
    }
}
