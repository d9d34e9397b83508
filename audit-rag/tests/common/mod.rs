//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use audit_rag::{
    AuditConfig, ChecklistStore, EmbeddingProvider, Ingestor, JsonFileSink, JudgeRequest, Judgment,
    KeywordReasoner, Reasoner, ReferenceStore, ResourceGovernor, ResourceProbe, ResourceSample,
    Result, Sufficiency, SummaryRequest, WorkflowCoordinator,
};

pub const CHECKLIST: &str = "unctad";
pub const STANDARD: &str = "ghg_protocol";

pub const CHECKLIST_CSV: &str = "\
category,criterion,description
Environment,Emissions,CO2 disclosure
Environment,Water usage,Total water withdrawal
";

pub const REFERENCE_TEXT: &str =
    "Companies shall disclose annual Scope 1 emissions in tonnes of CO2e.";

pub const REPORT: &str =
    "Our company grew revenue. We emitted 9500 MT CO2e in 2023. The board met four times.";

const CONCEPTS: &[&[&str]] = &[
    &["emission", "emissions", "emitted", "co2", "co2e", "scope", "ghg", "greenhouse"],
    &["training", "trained", "employee", "employees", "hours"],
    &["board", "directors", "governance"],
    &["water", "withdrawal"],
    &["waste", "recycled", "landfill"],
];
const OTHER: usize = 7;

/// Embeds text onto a handful of concept axes so that related vocabulary
/// ("Emissions", "emitted", "CO2e") lands on the same unit vector. Text with
/// no concept word maps to a dedicated "other" axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConceptEmbedder;

impl ConceptEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; OTHER + 1];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let token = token.to_lowercase();
            if let Some(axis) = CONCEPTS.iter().position(|words| words.contains(&token.as_str())) {
                v[axis] += 1.0;
            }
        }
        if v.iter().all(|x| *x == 0.0) {
            v[OTHER] = 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for ConceptEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::vector(text))
    }

    fn dimensions(&self) -> usize {
        OTHER + 1
    }
}

/// [`ConceptEmbedder`] that sleeps a text-dependent few milliseconds per
/// call, so concurrent extractions finish out of order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterEmbedder;

#[async_trait]
impl EmbeddingProvider for JitterEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let hash = text.bytes().fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let jitter = hash % 25;
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        Ok(ConceptEmbedder::vector(text))
    }

    fn dimensions(&self) -> usize {
        ConceptEmbedder.dimensions()
    }
}

/// Always reports unknown usage, which the governor treats as within
/// budget with the full worker count.
pub struct IdleProbe;

#[async_trait]
impl ResourceProbe for IdleProbe {
    async fn sample(&self) -> ResourceSample {
        ResourceSample::default()
    }
}

const MIB: u64 = 1024 * 1024;

/// 40% of 2000 MiB in use, with room for two 512 MiB workers.
pub fn calm_sample() -> ResourceSample {
    ResourceSample {
        memory_total_bytes: Some(2_000 * MIB),
        memory_available_bytes: Some(1_200 * MIB),
        disk_used_bytes: None,
        disk_quota_bytes: 0,
    }
}

/// 90% of memory in use.
pub fn strained_sample() -> ResourceSample {
    ResourceSample { memory_available_bytes: Some(200 * MIB), ..calm_sample() }
}

/// Reports a calm system on the first sample, then `strained` samples over
/// budget, then calm again.
pub struct MemoryPressure {
    strained: usize,
    samples: Arc<AtomicUsize>,
}

impl MemoryPressure {
    pub fn new(strained: usize) -> Self {
        Self { strained, samples: Arc::new(AtomicUsize::new(0)) }
    }

    /// Shared count of samples taken so far.
    pub fn samples(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.samples)
    }
}

#[async_trait]
impl ResourceProbe for MemoryPressure {
    async fn sample(&self) -> ResourceSample {
        let n = self.samples.fetch_add(1, Ordering::SeqCst);
        if (1..=self.strained).contains(&n) { strained_sample() } else { calm_sample() }
    }
}

/// [`ConceptEmbedder`] that holds each call for a few milliseconds and
/// records how many calls overlap. Calls made after the first sample but
/// before the pressure lifts are counted as early.
pub struct GaugedEmbedder {
    samples_taken: Arc<AtomicUsize>,
    strained: usize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub early: AtomicUsize,
}

impl GaugedEmbedder {
    pub fn new(pressure: &MemoryPressure) -> Self {
        Self {
            samples_taken: pressure.samples(),
            strained: pressure.strained,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            early: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GaugedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let sampled = self.samples_taken.load(Ordering::SeqCst);
        if sampled > 0 && sampled <= self.strained + 1 {
            self.early.fetch_add(1, Ordering::SeqCst);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ConceptEmbedder::vector(text))
    }

    fn dimensions(&self) -> usize {
        ConceptEmbedder.dimensions()
    }
}

/// Wraps another reasoner and counts its calls.
pub struct CountingReasoner<R> {
    inner: R,
    pub judged: AtomicUsize,
    pub summarized: AtomicUsize,
}

impl<R> CountingReasoner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, judged: AtomicUsize::new(0), summarized: AtomicUsize::new(0) }
    }

    pub fn judged(&self) -> usize {
        self.judged.load(Ordering::SeqCst)
    }

    pub fn summarized(&self) -> usize {
        self.summarized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Reasoner> Reasoner for CountingReasoner<R> {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment> {
        self.judged.fetch_add(1, Ordering::SeqCst);
        self.inner.judge(request).await
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        self.summarized.fetch_add(1, Ordering::SeqCst);
        self.inner.summarize(request).await
    }
}

/// Judges every passage insufficient.
pub struct Skeptic;

#[async_trait]
impl Reasoner for Skeptic {
    async fn judge(&self, _request: &JudgeRequest) -> Result<Judgment> {
        Ok(Judgment {
            verdict: Sufficiency::Insufficient,
            rationale: "not specific enough".to_string(),
        })
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        Ok(format!("{} not demonstrated", request.criterion))
    }
}

/// Never answers a judgment within any reasonable deadline.
pub struct Stalled;

#[async_trait]
impl Reasoner for Stalled {
    async fn judge(&self, _request: &JudgeRequest) -> Result<Judgment> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Judgment { verdict: Sufficiency::Sufficient, rationale: "late".to_string() })
    }

    async fn summarize(&self, _request: &SummaryRequest) -> Result<String> {
        Ok("late".to_string())
    }
}

/// A data root with one checklist and one reference rule, and the two
/// durable stores opened over it.
pub struct Fixture {
    pub temp: tempfile::TempDir,
    pub config: AuditConfig,
    pub ingestor: Ingestor,
    pub checklists: Arc<ChecklistStore>,
    pub references: Arc<ReferenceStore>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with(CHECKLIST_CSV, Arc::new(ConceptEmbedder)).await
    }

    pub async fn with(checklist_csv: &str, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = AuditConfig::builder().data_root(temp.path()).build().unwrap();

        std::fs::create_dir_all(&config.paths.reference_dir).unwrap();
        std::fs::create_dir_all(&config.paths.checklist_dir).unwrap();
        let reference_path = config.paths.reference_dir.join(format!("{STANDARD}.txt"));
        std::fs::write(reference_path, REFERENCE_TEXT).unwrap();
        let checklist_path = config.paths.checklist_dir.join(format!("{CHECKLIST}.csv"));
        std::fs::write(checklist_path, checklist_csv).unwrap();

        let ingestor = Ingestor::default().with_embedder(embedder);
        let checklists = Arc::new(ChecklistStore::open(&config, ingestor.clone()).await.unwrap());
        let references = Arc::new(ReferenceStore::open(&config, ingestor.clone()).await.unwrap());
        Self { temp, config, ingestor, checklists, references }
    }

    pub fn coordinator(&self, reasoner: Arc<dyn Reasoner>) -> WorkflowCoordinator {
        self.coordinator_with(self.config.clone(), reasoner)
    }

    pub fn coordinator_with(
        &self,
        config: AuditConfig,
        reasoner: Arc<dyn Reasoner>,
    ) -> WorkflowCoordinator {
        self.governed(config, Arc::new(IdleProbe), reasoner)
    }

    pub fn governed(
        &self,
        config: AuditConfig,
        probe: Arc<dyn ResourceProbe>,
        reasoner: Arc<dyn Reasoner>,
    ) -> WorkflowCoordinator {
        WorkflowCoordinator::builder()
            .governor(Arc::new(ResourceGovernor::new(&config.resources, probe)))
            .sink(Arc::new(JsonFileSink::new(&config.paths.output_dir)))
            .config(config)
            .ingestor(self.ingestor.clone())
            .checklists(self.checklists.clone())
            .references(self.references.clone())
            .reasoner(reasoner)
            .build()
            .unwrap()
    }

    pub fn keyword_coordinator(&self) -> WorkflowCoordinator {
        self.coordinator(Arc::new(KeywordReasoner::default()))
    }

    /// Entries left under the scratch directory.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(&self.config.paths.scratch_dir).map(|d| d.count()).unwrap_or(0)
    }
}
