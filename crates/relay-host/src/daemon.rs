//! Long-lived composition root.
//!
//! The daemon owns the registry and scheduler and runs a select loop over:
//! 1. wallet connection events from the protocol client
//! 2. registry events (first session starts the timers, empty store stops them)
//! 3. the shutdown signal

use std::sync::Arc;

use relay_store::SessionRepository;
use tokio::sync::{broadcast, mpsc};

use crate::adapters::{ApprovalCapability, ConnectionEvent, PayloadBuilder};
use crate::clock::DynClock;
use crate::config::HostConfig;
use crate::dispatcher::Dispatcher;
use crate::identity::IdentifierPolicy;
use crate::metrics::Reporter;
use crate::monitor::ConfirmationMonitor;
use crate::oracle::ChainOracle;
use crate::registry::{SessionRegistry, StoreEvent};
use crate::scheduler::Scheduler;

/// Collaborators the daemon is built from.
pub struct RelayParts {
    pub repository: Arc<dyn SessionRepository>,
    pub capability: Arc<dyn ApprovalCapability>,
    pub payloads: Arc<dyn PayloadBuilder>,
    pub oracle: Arc<dyn ChainOracle>,
    pub clock: DynClock,
    pub policy: IdentifierPolicy,
}

pub struct RelayDaemon {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<Scheduler>,
    reporter: Arc<Reporter>,
    store_events: broadcast::Receiver<StoreEvent>,
}

impl RelayDaemon {
    pub fn new(parts: RelayParts, config: HostConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            parts.repository,
            parts.policy,
            parts.clock,
            &config.persistence,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            parts.capability,
            parts.payloads,
            config.dispatch.clone(),
        ));
        let monitor = Arc::new(ConfirmationMonitor::new(registry.clone(), parts.oracle));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            dispatcher,
            monitor,
            config.scheduler.clone(),
        ));
        let reporter = Arc::new(Reporter::new(
            registry.clone(),
            scheduler.clone(),
            config.health.clone(),
        ));
        let store_events = registry.subscribe();
        Self {
            registry,
            scheduler,
            reporter,
            store_events,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Reloads persisted sessions and starts the timers if any exist.
    pub fn startup(&self) -> usize {
        let loaded = self.registry.load();
        if loaded > 0 {
            self.scheduler.start();
        }
        loaded
    }

    pub fn handle_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected(id) => {
                // Invalid ids are logged by the registry and otherwise ignored.
                let _ = self.registry.upsert(&id);
            }
            ConnectionEvent::Disconnected => {
                tracing::debug!("wallet disconnected; existing sessions are kept");
            }
        }
    }

    fn handle_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::SessionCreated(_) => self.scheduler.start(),
            StoreEvent::Emptied => {
                if self.registry.is_empty() {
                    self.scheduler.stop();
                }
            }
        }
    }

    pub async fn run(
        &mut self,
        mut connections: mpsc::Receiver<ConnectionEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!("relay daemon started");
        self.startup();
        let mut connections_open = true;

        loop {
            tokio::select! {
                event = connections.recv(), if connections_open => {
                    match event {
                        Some(event) => self.handle_connection(event),
                        None => {
                            tracing::debug!("connection channel closed");
                            connections_open = false;
                        }
                    }
                }

                event = self.store_events.recv() => {
                    match event {
                        Ok(event) => self.handle_store_event(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "store events lagged; resyncing timers");
                            if self.registry.is_empty() {
                                self.scheduler.stop();
                            } else {
                                self.scheduler.start();
                            }
                        }
                        // The daemon holds the registry, so the sender cannot close first.
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.scheduler.stop();
        self.registry.persist();
        tracing::info!("relay daemon stopped");
    }
}
