//! Per-endpoint Docker event watcher
//!
//! Each configured endpoint (leader and followers) gets its own
//! [`SourceWatcher`] task. A watcher connects with backoff, listens for
//! events, forwards the relevant ones as change signals and reconnects
//! whenever the stream ends, a ping fails or the listener goes stale.

use crate::debounce::SignalSender;
use crate::runtime::{connect_with_backoff, Connector, ContainerRuntime, RuntimeEvent};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Event actions that can change the routing table
pub const TRACKED_EVENTS: [&str; 8] = [
    "create",
    "destroy",
    "start",
    "stop",
    "die",
    "restart",
    "connect",
    "disconnect",
];

/// Whether an event should trigger recomputation
pub fn is_tracked(event: &RuntimeEvent) -> bool {
    TRACKED_EVENTS.contains(&event.action.as_str())
}

/// Timing knobs for a watcher
#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    /// Ping after this long without events
    pub ping_interval: Duration,
    /// Reconnect after this long without events
    pub stale_after: Duration,
    /// Upper bound for the connection backoff
    pub backoff_cap: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(3600),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Why a listen session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenOutcome {
    /// Tear down and connect again. `attached` is set once the listener was
    /// confirmed by an event or a liveness ping.
    Reconnect { attached: bool },
    Shutdown,
}

/// Watches a single endpoint until shutdown
pub struct SourceWatcher {
    addr: String,
    connector: Arc<dyn Connector>,
    signals: SignalSender,
    config: WatcherConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SourceWatcher {
    pub fn new(
        addr: impl Into<String>,
        connector: Arc<dyn Connector>,
        signals: SignalSender,
        config: WatcherConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            addr: addr.into(),
            connector,
            signals,
            config,
            shutdown_rx,
        }
    }

    /// Run the connect/listen loop. Only returns on shutdown.
    pub async fn run(mut self) {
        let mut tries: u32 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            debug!(host = %self.addr, tries, "Connecting");
            let attempt = connect_with_backoff(
                self.connector.as_ref(),
                &self.addr,
                tries,
                self.config.backoff_cap,
            );
            let client = tokio::select! {
                result = attempt => result,
                _ = self.shutdown_rx.changed() => break,
            };
            tries = tries.saturating_add(1);

            let client = match client {
                Ok(client) => client,
                Err(e) => {
                    error!(host = %self.addr, tries, error = %e, "Error connecting to Docker");
                    continue;
                }
            };

            info!(host = %self.addr, "Listening for events");
            match self.listen(client.as_ref()).await {
                ListenOutcome::Shutdown => break,
                ListenOutcome::Reconnect { attached } => {
                    // A listener refused before it ever delivered keeps backing off
                    if attached {
                        tries = 0;
                    }
                    info!(host = %self.addr, attached, tries, "Reconnecting");
                }
            }
        }

        info!(host = %self.addr, "Watcher stopped");
    }

    async fn listen(&mut self, client: &dyn ContainerRuntime) -> ListenOutcome {
        let mut events = client.events();
        let mut last_event = Instant::now();
        let mut attached = false;

        loop {
            let stale_at = last_event + self.config.stale_after;

            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(event)) => {
                        last_event = Instant::now();
                        attached = true;
                        self.handle_event(&event);
                    }
                    Some(Err(e)) => {
                        error!(host = %self.addr, error = %e, "Listener error");
                        return ListenOutcome::Reconnect { attached };
                    }
                    None => {
                        info!(host = %self.addr, "Listener closed");
                        return ListenOutcome::Reconnect { attached };
                    }
                },
                _ = self.shutdown_rx.changed() => return ListenOutcome::Shutdown,
                _ = tokio::time::sleep_until(stale_at) => {
                    info!(host = %self.addr, idle_secs = self.config.stale_after.as_secs(), "Listener stale");
                    return ListenOutcome::Reconnect { attached };
                }
                _ = tokio::time::sleep(self.config.ping_interval) => {
                    let ping = tokio::select! {
                        result = client.ping() => result,
                        _ = self.shutdown_rx.changed() => return ListenOutcome::Shutdown,
                    };
                    if let Err(e) = ping {
                        error!(host = %self.addr, error = %e, "Listener error");
                        return ListenOutcome::Reconnect { attached };
                    }
                    attached = true;
                    debug!(host = %self.addr, "Ping ok");
                }
            }
        }
    }

    fn handle_event(&self, event: &RuntimeEvent) {
        debug!(
            host = %self.addr,
            action = %event.action,
            kind = %event.kind,
            actor = %event.actor_id,
            attributes = ?event.attributes,
            "Received event"
        );
        if is_tracked(event) {
            info!(host = %self.addr, action = %event.action, "Sending update");
            if self.signals.send(()).is_err() {
                warn!(host = %self.addr, "Update channel closed");
            }
        }
    }
}
