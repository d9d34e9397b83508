//! Command-line launcher for the audit engine.
//!
//! Opens the durable stores, keeps them fresh in the background, runs one
//! workflow for one report and writes the result set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};

use audit_rag::{
    AuditConfig, AuditConfigBuilder, AuditReport, AuditRequest, ChecklistStore, DirectoryWatcher,
    Ingestor, JsonFileSink, KeywordReasoner, Reasoner, ReferenceStore, RefreshScheduler,
    ResourceGovernor, ResourceProfile, WorkflowCoordinator,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "audit", version, about = "Audit a report against a compliance checklist")]
pub struct Cli {
    /// The report to audit.
    #[arg(long)]
    pub report: PathBuf,

    /// Checklist identifier (file stem of its CSV).
    #[arg(long)]
    pub checklist: String,

    /// Restrict reference lookups to this rule.
    #[arg(long)]
    pub standard: Option<String>,

    /// JSON configuration file; omitted keys keep their defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub profile: Option<Profile>,

    /// Abort the workflow after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Log one JSON object per line.
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,

    /// Judge and summarize with the OpenAI API (reads `OPENAI_API_KEY`).
    #[cfg(feature = "openai")]
    #[arg(long, default_value_t = false)]
    pub openai: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Local,
    Server,
}

impl From<Profile> for ResourceProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::Local => ResourceProfile::Local,
            Profile::Server => ResourceProfile::Server,
        }
    }
}

/// Defaults, then the `--config` file, then command-line overrides.
pub fn resolve_config(cli: &Cli) -> Result<AuditConfig> {
    let base = match &cli.config {
        Some(path) => AuditConfig::from_file(path)?,
        None => AuditConfig::default(),
    };
    let mut builder = AuditConfigBuilder::from_config(base);
    if let Some(profile) = cli.profile {
        builder = builder.profile(profile.into());
    }
    if let Some(secs) = cli.timeout_secs {
        builder = builder.document_timeout(Some(std::time::Duration::from_secs(secs)));
    }
    if let Some(dir) = &cli.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    Ok(builder.build()?)
}

/// What one invocation produced.
#[derive(Debug)]
pub struct Outcome {
    pub report: AuditReport,
    pub results_path: PathBuf,
}

#[cfg(feature = "openai")]
fn reasoner(cli: &Cli) -> Result<Arc<dyn Reasoner>> {
    if cli.openai {
        return Ok(Arc::new(audit_rag::openai::OpenAIReasoner::from_env()?));
    }
    Ok(Arc::new(KeywordReasoner::default()))
}

#[cfg(not(feature = "openai"))]
fn reasoner(_cli: &Cli) -> Result<Arc<dyn Reasoner>> {
    Ok(Arc::new(KeywordReasoner::default()))
}

/// Run one audit as described by `cli`.
pub async fn run(cli: Cli) -> Result<Outcome> {
    let started = Instant::now();
    let config = resolve_config(&cli)?;
    let ingestor = Ingestor::default();

    let references = Arc::new(
        ReferenceStore::open(&config, ingestor.clone())
            .await
            .context("failed to open the reference store")?,
    );
    let checklists = Arc::new(
        ChecklistStore::open(&config, ingestor.clone())
            .await
            .context("failed to open the checklist store")?,
    );
    if let Some(standard) = &cli.standard {
        if !references.rules().contains(standard) {
            warn!(
                standard = %standard,
                "no reference source with this name; lookups will return nothing"
            );
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events, watcher) = DirectoryWatcher::from_config(&config)
        .spawn(config.refresh.event_capacity, shutdown_rx.clone());
    let scheduler = RefreshScheduler::new(config.refresh.interval())
        .store(references.clone())
        .store(checklists.clone())
        .spawn(events, shutdown_rx);

    let sink = JsonFileSink::new(&config.paths.output_dir);
    let results_path = sink.path().to_path_buf();
    let coordinator = WorkflowCoordinator::builder()
        .governor(Arc::new(ResourceGovernor::from_config(&config)))
        .ingestor(ingestor)
        .checklists(checklists)
        .references(references)
        .reasoner(reasoner(&cli)?)
        .sink(Arc::new(sink))
        .config(config)
        .build()?;

    let mut request = AuditRequest::from_path(&cli.report, &cli.checklist).await?;
    if let Some(standard) = cli.standard {
        request = request.with_standard(standard);
    }
    let outcome = coordinator.run(request).await;

    // a closed channel also stops both loops
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(watcher, scheduler);

    let report = outcome?;
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        results = report.results.len(),
        "audit complete"
    );
    Ok(Outcome { report, results_path })
}
