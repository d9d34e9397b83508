//! Resource sampling, concurrency budgeting and back-pressure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{AuditConfig, ResourceBudget, ResourceConfig};
use crate::error::{AuditError, Result};

const MIB: u64 = 1024 * 1024;

/// A point-in-time reading of memory and disk usage.
///
/// `None` means the metric could not be read; unknown metrics count as
/// within budget.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_total_bytes: Option<u64>,
    pub memory_available_bytes: Option<u64>,
    pub disk_used_bytes: Option<u64>,
    pub disk_quota_bytes: u64,
}

impl ResourceSample {
    pub fn memory_used_percent(&self) -> Option<f64> {
        let total = self.memory_total_bytes.filter(|t| *t > 0)?;
        let available = self.memory_available_bytes?.min(total);
        Some((total - available) as f64 / total as f64 * 100.0)
    }

    pub fn disk_used_percent(&self) -> Option<f64> {
        if self.disk_quota_bytes == 0 {
            return None;
        }
        Some(self.disk_used_bytes? as f64 / self.disk_quota_bytes as f64 * 100.0)
    }
}

/// Source of [`ResourceSample`]s.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}

/// Reads `/proc/meminfo` and sums file sizes under the engine's data
/// directories.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    data_dirs: Vec<PathBuf>,
    disk_quota_bytes: u64,
}

impl SystemProbe {
    pub fn new(data_dirs: Vec<PathBuf>, disk_quota_bytes: u64) -> Self {
        Self { data_dirs, disk_quota_bytes }
    }

    /// Probe the directories the engine writes to.
    pub fn from_config(config: &AuditConfig) -> Self {
        let paths = &config.paths;
        Self::new(
            vec![paths.index_dir.clone(), paths.scratch_dir.clone(), paths.output_dir.clone()],
            config.resources.disk_quota_bytes,
        )
    }
}

/// `(MemTotal, MemAvailable)` in bytes from the text of `/proc/meminfo`.
pub(crate) fn parse_meminfo(text: &str) -> (Option<u64>, Option<u64>) {
    let field = |name: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    (field("MemTotal"), field("MemAvailable"))
}

fn directory_bytes(dirs: &[PathBuf]) -> u64 {
    dirs.iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(std::result::Result::ok))
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn sample(&self) -> ResourceSample {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await;
        let (memory_total_bytes, memory_available_bytes) = match meminfo {
            Ok(text) => parse_meminfo(&text),
            Err(e) => {
                debug!(error = %e, "memory metrics unavailable");
                (None, None)
            }
        };
        let dirs = self.data_dirs.clone();
        let disk_used_bytes =
            tokio::task::spawn_blocking(move || directory_bytes(&dirs)).await.ok();
        ResourceSample {
            memory_total_bytes,
            memory_available_bytes,
            disk_used_bytes,
            disk_quota_bytes: self.disk_quota_bytes,
        }
    }
}

/// Applies the active resource budget to probe readings.
pub struct ResourceGovernor {
    probe: Arc<dyn ResourceProbe>,
    budget: ResourceBudget,
    memory_per_worker_bytes: u64,
    max_workers: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("budget", &self.budget)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl ResourceGovernor {
    pub fn new(config: &ResourceConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            budget: config.active_budget(),
            memory_per_worker_bytes: config.memory_per_worker_mb.max(1) * MIB,
            max_workers: config.max_workers.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    /// A governor over the real system.
    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(&config.resources, Arc::new(SystemProbe::from_config(config)))
    }

    pub fn budget(&self) -> ResourceBudget {
        self.budget
    }

    pub async fn sample(&self) -> ResourceSample {
        self.probe.sample().await
    }

    /// Check a sample against the budget.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ResourceBudgetExceeded`] naming the first metric
    /// over its ceiling.
    pub fn check(&self, sample: &ResourceSample) -> Result<()> {
        if let Some(used) = sample.memory_used_percent() {
            if used > self.budget.memory_percent {
                return Err(AuditError::ResourceBudgetExceeded {
                    detail: format!(
                        "memory at {used:.1}% (limit {:.1}%)",
                        self.budget.memory_percent
                    ),
                });
            }
        }
        if let Some(used) = sample.disk_used_percent() {
            if used > self.budget.disk_percent {
                return Err(AuditError::ResourceBudgetExceeded {
                    detail: format!(
                        "disk at {used:.1}% of quota (limit {:.1}%)",
                        self.budget.disk_percent
                    ),
                });
            }
        }
        Ok(())
    }

    pub async fn within_budget(&self) -> bool {
        self.check(&self.sample().await).is_ok()
    }

    /// Number of extraction workers that fit in available memory, between 1
    /// and `max_workers`.
    pub async fn concurrency_budget(&self) -> usize {
        let sample = self.sample().await;
        let budget = match sample.memory_available_bytes {
            Some(available) => {
                let fit = (available / self.memory_per_worker_bytes) as usize;
                fit.clamp(1, self.max_workers)
            }
            None => self.max_workers,
        };
        debug!(budget, available = ?sample.memory_available_bytes, "concurrency budget");
        budget
    }

    /// Wait until usage is back under budget. Returns immediately when it
    /// already is.
    pub async fn wait_for_capacity(&self) {
        let mut throttled = false;
        loop {
            match self.check(&self.sample().await) {
                Ok(()) => {
                    if throttled {
                        debug!("resource usage back under budget, resuming");
                    }
                    return;
                }
                Err(e) => {
                    if !throttled {
                        warn!(error = %e, "pausing new work until usage drops");
                        throttled = true;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<ResourceSample>>);

    #[async_trait]
    impl ResourceProbe for Scripted {
        async fn sample(&self) -> ResourceSample {
            let mut samples = self.0.lock().unwrap();
            if samples.len() > 1 { samples.remove(0) } else { samples[0] }
        }
    }

    fn memory(total_mb: u64, available_mb: u64) -> ResourceSample {
        ResourceSample {
            memory_total_bytes: Some(total_mb * MIB),
            memory_available_bytes: Some(available_mb * MIB),
            disk_used_bytes: Some(0),
            disk_quota_bytes: 100,
        }
    }

    fn governor(samples: Vec<ResourceSample>) -> (ResourceGovernor, Arc<Scripted>) {
        let probe = Arc::new(Scripted(Mutex::new(samples)));
        (ResourceGovernor::new(&ResourceConfig::default(), probe.clone()), probe)
    }

    #[test]
    fn parses_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:  100 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo(text), (Some(16_000_000 * 1024), Some(8_000_000 * 1024)));
        assert_eq!(parse_meminfo("garbage"), (None, None));
    }

    #[tokio::test]
    async fn budget_follows_available_memory() {
        let (gov, _) = governor(vec![memory(16_384, 1_600)]);
        assert_eq!(gov.concurrency_budget().await, 3);

        let (gov, _) = governor(vec![memory(65_536, 60_000)]);
        assert_eq!(gov.concurrency_budget().await, 10);

        let (gov, _) = governor(vec![memory(1_024, 100)]);
        assert_eq!(gov.concurrency_budget().await, 1);

        let (gov, _) = governor(vec![ResourceSample::default()]);
        assert_eq!(gov.concurrency_budget().await, 10);
    }

    #[test]
    fn check_applies_profile_budget() {
        let (gov, _) = governor(vec![ResourceSample::default()]);
        // local profile: 45%
        assert!(gov.check(&memory(1_000, 600)).is_ok());
        assert!(matches!(
            gov.check(&memory(1_000, 400)),
            Err(AuditError::ResourceBudgetExceeded { .. })
        ));

        let disk = ResourceSample {
            disk_used_bytes: Some(50),
            disk_quota_bytes: 100,
            ..Default::default()
        };
        assert!(gov.check(&disk).is_err());
        assert!(gov.check(&ResourceSample::default()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_capacity_polls_until_under_budget() {
        let (gov, probe) =
            governor(vec![memory(1_000, 100), memory(1_000, 200), memory(1_000, 900)]);
        gov.wait_for_capacity().await;
        assert_eq!(probe.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn system_probe_measures_data_dirs() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("blob"), vec![0u8; 2048]).unwrap();
        let dirs = vec![temp.path().to_path_buf(), temp.path().join("missing")];
        let probe = SystemProbe::new(dirs, 4096);
        let sample = probe.sample().await;
        assert_eq!(sample.disk_used_bytes, Some(2048));
        assert_eq!(sample.disk_used_percent(), Some(50.0));
    }
}
