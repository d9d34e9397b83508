//! Persisting finalized result sets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::document::AuditReport;
use crate::error::{AuditError, Result};
use crate::store::write_atomic;

/// Receives one finalized [`AuditReport`] per completed workflow run.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write(&self, report: &AuditReport) -> Result<()>;
}

/// Writes each report as pretty JSON to `<output_dir>/results.json`,
/// replacing the previous run's file atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self { path: output_dir.as_ref().join("results.json") }
    }

    /// Where reports are written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn write(&self, report: &AuditReport) -> Result<()> {
        let data = serde_json::to_vec_pretty(report)?;
        write_atomic(&self.path, &data).await.map_err(|e| {
            AuditError::SinkError(format!("cannot write '{}': {e}", self.path.display()))
        })?;
        info!(
            path = %self.path.display(),
            run_id = %report.run_id,
            results = report.results.len(),
            "results written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_pretty_json() {
        let temp = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(temp.path().join("out"));
        let report = AuditReport {
            run_id: "run-1".to_string(),
            document_name: "report.txt".to_string(),
            checklist_name: "unctad".to_string(),
            standard: None,
            started_at: Utc::now(),
            processing_time_secs: 0.5,
            results: Vec::new(),
        };
        sink.write(&report).await.unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let parsed: AuditReport = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, report);
        assert!(raw.contains("\n  \"run_id\""));
    }
}
