//! Orchestration of watchers, poller, debounce gate and convergence loop
//!
//! ```text
//!  watcher(leader) ─┐
//!  watcher(follower)┤
//!  poller ──────────┼─> signal input ─> debounce ─> convergence loop ─> observers
//!  SIGHUP/trigger ──┘
//! ```

use crate::config::Config;
use crate::debounce::{debounce, SignalSender};
use crate::error::{Error, Result};
use crate::mapping::{current_container_id, map_containers, RoutingTable, SelfContainer};
use crate::observer::Observer;
use crate::runtime::{connect_with_backoff, Connector};
use crate::watcher::SourceWatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Everything a convergence cycle needs, shared with the loop task
struct Converger {
    config: Config,
    connector: Arc<dyn Connector>,
    observers: Vec<Arc<dyn Observer>>,
}

impl Converger {
    async fn run_cycle(&self) -> Result<RoutingTable> {
        info!("Updating");
        let client = self.connector.connect(&self.config.docker.leader)?;

        let my_id = current_container_id(self.config.manager.container_id.as_deref())?;
        let me = match client.inspect(&my_id).await {
            Ok(record) => SelfContainer::from_record(&record),
            Err(e) => {
                return Err(Error::SelfIdentity(format!(
                    "cannot inspect own container {}: {}",
                    my_id, e
                )))
            }
        };
        debug!(id = %me.id, networks = ?me.networks, "Resolved own container");

        let inventory = client.list_running().await?;
        let sites: RoutingTable = map_containers(&inventory, &me).into();
        info!(containers = inventory.len(), sites = sites.len(), "Sites found");

        for observer in &self.observers {
            match observer.update(Arc::clone(&sites)).await {
                Ok(()) => debug!(observer = observer.name(), "Observer updated"),
                Err(e) => error!(observer = observer.name(), error = %e, "Observer update failed"),
            }
        }

        Ok(sites)
    }
}

/// Owns the signal input and the registered observers
pub struct Manager {
    config: Config,
    connector: Arc<dyn Connector>,
    observers: Vec<Arc<dyn Observer>>,
    signal_tx: SignalSender,
    signal_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl Manager {
    /// Create a manager after checking that the leader endpoint answers.
    ///
    /// Unlike the watchers, which retry forever, a leader that cannot be
    /// reached here is a startup error.
    pub async fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        let leader = config.docker.leader.clone();
        info!(host = %leader, "Checking leader connectivity");
        connect_with_backoff(
            connector.as_ref(),
            &leader,
            0,
            config.manager.watcher().backoff_cap,
        )
        .await?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            connector,
            observers: Vec::new(),
            signal_tx,
            signal_rx: Some(signal_rx),
        })
    }

    /// Add an observer. Observers are notified in registration order.
    pub fn register(&mut self, observer: Arc<dyn Observer>) {
        info!(observer = observer.name(), "Registered observer");
        self.observers.push(observer);
    }

    /// Request a convergence cycle (subject to debouncing)
    pub fn trigger(&self) {
        if self.signal_tx.send(()).is_err() {
            warn!("Update channel closed");
        }
    }

    /// A producer handle for the debounce input, usable after `start`
    pub fn signal_sender(&self) -> SignalSender {
        self.signal_tx.clone()
    }

    /// Run one full cycle now: inventory, mapping, observers.
    pub async fn converge(&self) -> Result<RoutingTable> {
        let converger = Converger {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            observers: self.observers.clone(),
        };
        converger.run_cycle().await
    }

    /// Spawn every task. Returns their handles; all of them finish once
    /// `shutdown_rx` flips to `true`.
    pub fn start(&mut self, shutdown_rx: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let signal_rx = self
            .signal_rx
            .take()
            .ok_or_else(|| Error::Runtime("manager already started".to_string()))?;

        let mut handles = Vec::new();
        let watcher_config = self.config.manager.watcher();

        for addr in self.config.docker.endpoints() {
            let watcher = SourceWatcher::new(
                addr,
                Arc::clone(&self.connector),
                self.signal_tx.clone(),
                watcher_config,
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(watcher.run()));
        }

        handles.push(tokio::spawn(poll_loop(
            self.config.manager.poll_interval(),
            self.signal_tx.clone(),
            shutdown_rx.clone(),
        )));

        let triggers = debounce(self.config.manager.debounce(), signal_rx);
        let converger = Arc::new(Converger {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            observers: self.observers.clone(),
        });
        handles.push(tokio::spawn(convergence_loop(converger, triggers, shutdown_rx)));

        // First cycle without waiting for an event or the poller
        self.trigger();

        info!(
            sources = self.config.docker.followers.len() + 1,
            observers = self.observers.len(),
            "Manager started"
        );
        Ok(handles)
    }
}

async fn poll_loop(interval: Duration, signals: SignalSender, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Poll interval elapsed");
                if signals.send(()).is_err() {
                    break;
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn convergence_loop(
    converger: Arc<Converger>,
    mut triggers: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                tokio::select! {
                    result = converger.run_cycle() => {
                        if let Err(e) = result {
                            error!(error = %e, "Update failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    info!("Convergence loop stopped");
}
