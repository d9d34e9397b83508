//! Background refresh of the durable stores.
//!
//! The scheduler waits on three things at once: change events from the
//! [`DirectoryWatcher`](crate::DirectoryWatcher), a fixed timer, and a
//! shutdown signal. Either trigger starts a refresh of the affected stores
//! on its own task, so a refresh that is still running when the next trigger
//! arrives makes the new one come back as
//! [`RefreshOutcome::Suppressed`]. A change-driven refresh restarts the
//! timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::store::{KnowledgeStore, RefreshOutcome};
use crate::watch::ChangeEvent;

/// Drives store refreshes from change events and a periodic timer.
pub struct RefreshScheduler {
    stores: Vec<Arc<dyn KnowledgeStore>>,
    period: Duration,
}

impl RefreshScheduler {
    pub fn new(period: Duration) -> Self {
        Self { stores: Vec::new(), period }
    }

    /// Register a store for refreshes.
    pub fn store(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Start a background refresh of `store` and return its handle.
    fn trigger(
        store: &Arc<dyn KnowledgeStore>,
        cause: &'static str,
    ) -> JoinHandle<Option<RefreshOutcome>> {
        let store = Arc::clone(store);
        tokio::spawn(async move {
            match store.refresh().await {
                Ok(outcome) => {
                    match outcome {
                        RefreshOutcome::Refreshed { generation } => {
                            info!(store = store.name(), generation, cause, "store refreshed")
                        }
                        RefreshOutcome::Unchanged { generation } => {
                            debug!(store = store.name(), generation, cause, "store unchanged")
                        }
                        RefreshOutcome::Suppressed => {
                            debug!(
                                store = store.name(),
                                cause,
                                "refresh suppressed, one is already running"
                            )
                        }
                    }
                    Some(outcome)
                }
                Err(e) => {
                    // the store keeps serving its previous generation
                    warn!(
                        store = store.name(),
                        cause,
                        error = %e,
                        "refresh failed, will retry next cycle"
                    );
                    None
                }
            }
        })
    }

    /// Refresh the stores named by `event`.
    pub fn on_change(&self, event: &ChangeEvent) -> Vec<JoinHandle<Option<RefreshOutcome>>> {
        debug!(store = %event.store, path = %event.path.display(), "change event");
        self.stores
            .iter()
            .filter(|s| s.name() == event.store)
            .map(|s| Self::trigger(s, "change"))
            .collect()
    }

    /// Refresh every registered store.
    pub fn on_timer(&self) -> Vec<JoinHandle<Option<RefreshOutcome>>> {
        self.stores.iter().map(|s| Self::trigger(s, "timer")).collect()
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        info!(stores = self.stores.len(), period = ?self.period, "refresh scheduler started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            self.on_change(&event);
                            // the periodic refresh counts from the latest one
                            timer.reset();
                        }
                        None => {
                            debug!("change channel closed, continuing on timer only");
                            events_open = false;
                        }
                    }
                }
                _ = timer.tick() => {
                    self.on_timer();
                }
            }
        }
        info!("refresh scheduler stopped");
    }

    pub fn spawn(
        self,
        events: mpsc::Receiver<ChangeEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, shutdown))
    }
}
