//! Polling watcher for store source directories.
//!
//! Each poll rescans the watched directories and compares file paths, sizes
//! and modification times with the previous scan. A difference becomes one
//! [`ChangeEvent`] on a bounded channel. Delivery is best effort: when the
//! queue is full the event is dropped, and the periodic refresh timer picks
//! the change up instead.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::sources::{SourceFile, SourceSet};

/// A detected change in the sources of one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Name of the store whose sources changed.
    pub store: String,
    /// The first changed file, or the directory when a file disappeared.
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
struct WatchTarget {
    store: String,
    dir: PathBuf,
    extensions: Vec<String>,
    last: Option<SourceSet>,
}

/// Watches store source directories by polling.
#[derive(Debug, Clone)]
pub struct DirectoryWatcher {
    targets: Vec<WatchTarget>,
    poll_interval: Duration,
}

impl DirectoryWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { targets: Vec::new(), poll_interval }
    }

    /// Watch the reference and checklist directories named in `config`.
    pub fn from_config(config: &AuditConfig) -> Self {
        let reference_extensions = config.workflow.reference_extensions.clone();
        Self::new(config.refresh.watch_poll())
            .watch("reference", &config.paths.reference_dir, reference_extensions)
            .watch("checklist", &config.paths.checklist_dir, vec!["csv".to_string()])
    }

    /// Add a directory whose changes are reported for `store`.
    pub fn watch(
        mut self,
        store: impl Into<String>,
        dir: impl Into<PathBuf>,
        extensions: Vec<String>,
    ) -> Self {
        self.targets.push(WatchTarget {
            store: store.into(),
            dir: dir.into(),
            extensions,
            last: None,
        });
        self
    }

    /// Rescan every target and report the ones that changed since the last
    /// poll. The first poll only records a baseline.
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for target in &mut self.targets {
            let current = match SourceSet::scan(&target.dir, &target.extensions) {
                Ok(set) => set,
                Err(e) => {
                    warn!(
                        store = %target.store,
                        dir = %target.dir.display(),
                        error = %e,
                        "watch scan failed"
                    );
                    continue;
                }
            };
            if let Some(previous) = &target.last {
                if let Some(path) = first_difference(previous, &current, &target.dir) {
                    debug!(store = %target.store, path = %path.display(), "source change detected");
                    events.push(ChangeEvent { store: target.store.clone(), path });
                }
            }
            target.last = Some(current);
        }
        events
    }

    /// Run the polling loop on a background task until `shutdown` turns
    /// `true`. Events go to the returned bounded receiver.
    pub fn spawn(
        mut self,
        capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<ChangeEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(self.poll_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                targets = self.targets.len(),
                poll = ?self.poll_interval,
                "directory watcher started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        for event in self.poll() {
                            match tx.try_send(event) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(event)) => {
                                    warn!(store = %event.store, "change queue full, event dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return,
                            }
                        }
                    }
                }
            }
            info!("directory watcher stopped");
        });
        (rx, handle)
    }
}

fn first_difference(
    previous: &SourceSet,
    current: &SourceSet,
    dir: &std::path::Path,
) -> Option<PathBuf> {
    if previous == current {
        return None;
    }
    let changed = |file: &SourceFile, other: &SourceSet| !other.files.contains(file);
    current
        .files
        .iter()
        .find(|f| changed(f, previous))
        .map(|f| f.path.clone())
        .or_else(|| Some(dir.to_path_buf()))
}
