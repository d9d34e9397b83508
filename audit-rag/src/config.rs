//! Configuration for the audit engine.
//!
//! Every section carries `#[serde(default)]`, so a JSON file only needs the
//! keys it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

/// Retries allowed per criterion after the initial evaluation.
pub const MAX_RETRIES: u8 = 1;

/// Top-level configuration consumed by the stores, governor, and coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub paths: PathsConfig,
    pub resources: ResourceConfig,
    pub refresh: RefreshConfig,
    pub retrieval: RetrievalConfig,
    pub workflow: WorkflowConfig,
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Source files for the reference (standards/rules) store.
    pub reference_dir: PathBuf,
    /// One CSV per checklist.
    pub checklist_dir: PathBuf,
    /// Persisted generations of the durable stores.
    pub index_dir: PathBuf,
    /// Per-run subject store artifacts.
    pub scratch_dir: PathBuf,
    /// Where result sets are written.
    pub output_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            reference_dir: data.join("standards"),
            checklist_dir: data.join("checklists"),
            index_dir: data.join("index"),
            scratch_dir: data.join("scratch"),
            output_dir: data.join("output"),
        }
    }
}

/// Which resource budget applies.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProfile {
    /// A workstation shared with other work.
    #[default]
    Local,
    /// A dedicated host.
    Server,
}

impl std::str::FromStr for ResourceProfile {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "server" => Ok(Self::Server),
            other => Err(AuditError::ConfigError(format!("unknown resource profile '{other}'"))),
        }
    }
}

/// Usage ceilings, as percentages of the available total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceBudget {
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub profile: ResourceProfile,
    pub local: ResourceBudget,
    pub server: ResourceBudget,
    /// Memory assumed per concurrent extraction worker.
    pub memory_per_worker_mb: u64,
    /// Upper bound on concurrent extraction workers.
    pub max_workers: usize,
    /// How often the governor re-samples while throttling.
    pub poll_interval_ms: u64,
    /// Disk allowance for everything under the data root.
    pub disk_quota_bytes: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            profile: ResourceProfile::Local,
            local: ResourceBudget { memory_percent: 45.0, disk_percent: 45.0 },
            server: ResourceBudget { memory_percent: 80.0, disk_percent: 80.0 },
            memory_per_worker_mb: 512,
            max_workers: 10,
            poll_interval_ms: 250,
            disk_quota_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl ResourceConfig {
    /// The budget for the selected profile.
    pub fn active_budget(&self) -> ResourceBudget {
        match self.profile {
            ResourceProfile::Local => self.local,
            ResourceProfile::Server => self.server,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    /// Timer-driven refresh period for the durable stores.
    pub interval_secs: u64,
    /// Polling period of the directory watcher.
    pub watch_poll_secs: u64,
    /// Capacity of the change-event queue.
    pub event_capacity: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { interval_secs: 30 * 60, watch_poll_secs: 5, event_capacity: 64 }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_secs(self.watch_poll_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched for the initial extraction.
    pub top_k: usize,
    /// Candidates fetched for the retry extraction.
    pub retry_top_k: usize,
    /// Reference passages fetched per criterion.
    pub reference_top_k: usize,
    /// Hits farther than this count as "no match".
    pub max_match_distance: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 5, retry_top_k: 10, reference_top_k: 3, max_match_distance: 1.25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Abort a document's workflow after this long.
    pub document_timeout_secs: Option<u64>,
    /// File extensions indexed into the reference store.
    pub reference_extensions: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            document_timeout_secs: None,
            reference_extensions: vec!["txt".to_string(), "md".to_string()],
        }
    }
}

impl WorkflowConfig {
    pub fn document_timeout(&self) -> Option<Duration> {
        self.document_timeout_secs.map(Duration::from_secs)
    }
}

impl AuditConfig {
    /// Create a new builder for constructing an [`AuditConfig`].
    pub fn builder() -> AuditConfigBuilder {
        AuditConfigBuilder::default()
    }

    /// Read a JSON configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AuditError::ConfigError(format!("cannot read config '{}': {e}", path.display()))
        })?;
        let config: AuditConfig = serde_json::from_str(&raw).map_err(|e| {
            AuditError::ConfigError(format!("invalid config '{}': {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ConfigError`] if:
    /// - `top_k == 0` or `retry_top_k < top_k`
    /// - `reference_top_k == 0`
    /// - `max_match_distance <= 0`
    /// - `max_workers == 0`
    /// - a budget percentage is outside `(0, 100]`
    /// - `interval_secs == 0` or `event_capacity == 0`
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.top_k == 0 {
            return Err(AuditError::ConfigError("top_k must be greater than zero".to_string()));
        }
        if r.retry_top_k < r.top_k {
            return Err(AuditError::ConfigError(format!(
                "retry_top_k ({}) must be at least top_k ({})",
                r.retry_top_k, r.top_k
            )));
        }
        if r.reference_top_k == 0 {
            return Err(AuditError::ConfigError(
                "reference_top_k must be greater than zero".to_string(),
            ));
        }
        if !(r.max_match_distance > 0.0) {
            return Err(AuditError::ConfigError(
                "max_match_distance must be positive".to_string(),
            ));
        }
        if self.resources.max_workers == 0 {
            return Err(AuditError::ConfigError(
                "max_workers must be greater than zero".to_string(),
            ));
        }
        for (name, budget) in [("local", self.resources.local), ("server", self.resources.server)] {
            for value in [budget.memory_percent, budget.disk_percent] {
                if !(value > 0.0 && value <= 100.0) {
                    return Err(AuditError::ConfigError(format!(
                        "{name} budget percentages must be in (0, 100], got {value}"
                    )));
                }
            }
        }
        if self.refresh.interval_secs == 0 {
            return Err(AuditError::ConfigError("refresh interval must be non-zero".to_string()));
        }
        if self.refresh.event_capacity == 0 {
            return Err(AuditError::ConfigError("event_capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`AuditConfig`].
#[derive(Debug, Clone, Default)]
pub struct AuditConfigBuilder {
    config: AuditConfig,
}

impl AuditConfigBuilder {
    /// Start from an existing configuration, e.g. one read from a file.
    pub fn from_config(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Put every data directory under `root`.
    pub fn data_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.config.paths = PathsConfig {
            reference_dir: root.join("standards"),
            checklist_dir: root.join("checklists"),
            index_dir: root.join("index"),
            scratch_dir: root.join("scratch"),
            output_dir: root.join("output"),
        };
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.output_dir = dir.into();
        self
    }

    pub fn profile(mut self, profile: ResourceProfile) -> Self {
        self.config.resources.profile = profile;
        self
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.resources.max_workers = workers;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.retrieval.top_k = k;
        self
    }

    pub fn retry_top_k(mut self, k: usize) -> Self {
        self.config.retrieval.retry_top_k = k;
        self
    }

    pub fn reference_top_k(mut self, k: usize) -> Self {
        self.config.retrieval.reference_top_k = k;
        self
    }

    pub fn max_match_distance(mut self, distance: f32) -> Self {
        self.config.retrieval.max_match_distance = distance;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh.interval_secs = interval.as_secs();
        self
    }

    pub fn document_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.workflow.document_timeout_secs = timeout.map(|t| t.as_secs());
        self
    }

    /// Build the [`AuditConfig`], validating that parameters are consistent.
    pub fn build(self) -> Result<AuditConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
