//! End-to-end workflow runs against a small on-disk data root.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use audit_rag::{
    AuditError, AuditReport, AuditRequest, CriterionState, KeywordReasoner, SubjectStore,
    VerdictStatus,
};
use audit_telemetry::SpanCapture;
use common::*;
use tracing_subscriber::layer::SubscriberExt;

fn request(document: &str) -> AuditRequest {
    AuditRequest::new("acme_2023.txt", document.as_bytes().to_vec(), CHECKLIST)
        .with_standard(STANDARD)
}

const SIX_CRITERIA: &str = "\
category,criterion,description
Environment,Emissions,CO2 disclosure
Governance,Board oversight,Directors responsible for governance
Environment,Water usage,Total water withdrawal
Social,Employee training hours,Average hours per employee
Environment,Waste,Share of waste recycled
Environment,Scope 3 emissions,Greenhouse gas emissions in the value chain
";

const SIX_TOPIC_REPORT: &str = "Employees trained 31 hours on average. \
    The board of directors oversees climate risk. \
    We emitted 9500 MT CO2e in 2023. \
    Most waste is recycled.";

#[tokio::test]
async fn disclosed_emissions_are_validated_and_missing_topics_flagged() {
    let fixture = Fixture::new().await;
    let reasoner = Arc::new(CountingReasoner::new(KeywordReasoner::default()));
    let coordinator = fixture.coordinator(reasoner.clone());

    let report = coordinator.run(request(REPORT)).await.unwrap();
    assert_eq!(report.checklist_name, CHECKLIST);
    assert_eq!(report.results.len(), 2);

    let emissions = &report.results[0];
    assert_eq!(emissions.item.criterion, "Emissions");
    assert_eq!(emissions.verdict.status, VerdictStatus::Validated);
    assert_eq!(emissions.attempts, 1);
    assert_eq!(emissions.state, CriterionState::Summarized);
    let extraction = &emissions.extractions[0];
    assert_eq!(extraction.matched_text, "We emitted 9500 MT CO2e in 2023.");
    assert_eq!(extraction.context_before.as_deref(), Some("Our company grew revenue."));
    assert_eq!(extraction.context_after.as_deref(), Some("The board met four times."));
    assert_eq!(emissions.references.len(), 1);
    assert_eq!(emissions.references[0].rule, STANDARD);
    assert!(emissions.summary_text.starts_with("Emissions (Environment): disclosed."));
    assert!(emissions.item.embedding.is_none());

    let water = &report.results[1];
    assert_eq!(water.item.criterion, "Water usage");
    assert_eq!(water.verdict.status, VerdictStatus::Flagged);
    assert_eq!(water.verdict.reason, "no content");
    assert_eq!(water.attempts, 2);
    assert!(water.extractions.is_empty());
    assert!(water.summary_text.starts_with("Unresolved: no content. "));

    // one judgment for the passage found, none for the empty attempts
    assert_eq!(reasoner.judged(), 1);
    assert_eq!(reasoner.summarized(), 2);
    assert_eq!(fixture.scratch_entries(), 0);
}

#[tokio::test]
async fn results_are_written_to_the_sink() {
    let fixture = Fixture::new().await;
    let report = fixture.keyword_coordinator().run(request(REPORT)).await.unwrap();

    let results_path = fixture.config.paths.output_dir.join("results.json");
    let raw = std::fs::read_to_string(results_path).unwrap();
    let written: AuditReport = serde_json::from_str(&raw).unwrap();
    assert_eq!(written.run_id, report.run_id);
    assert_eq!(written.count(VerdictStatus::Validated), 1);
    assert_eq!(written.count(VerdictStatus::Flagged), 1);
}

#[tokio::test]
async fn a_criterion_is_judged_at_most_twice() {
    let fixture = Fixture::new().await;
    let reasoner = Arc::new(CountingReasoner::new(Skeptic));
    let coordinator = fixture.coordinator(reasoner.clone());
    let document = "We emitted 9500 MT CO2e in 2023. Scope 2 emissions were 1200 MT CO2e. \
        The board met four times.";

    let report = coordinator.run(request(document)).await.unwrap();
    let emissions = &report.results[0];
    assert_eq!(emissions.verdict.status, VerdictStatus::Flagged);
    assert!(emissions.verdict.reason.starts_with("insufficient: "));
    assert_eq!(emissions.attempts, 2);

    // the retry moved on to the second passage instead of re-judging the first
    let indexes: Vec<u32> = emissions.extractions.iter().map(|e| e.local_index).collect();
    assert_eq!(indexes, [0, 1]);

    assert_eq!(reasoner.judged(), 2);
    assert_eq!(reasoner.summarized(), 2);
    for result in &report.results {
        assert!(result.attempts <= 1 + audit_rag::MAX_RETRIES);
        assert_eq!(result.state, CriterionState::Summarized);
    }
}

#[tokio::test]
async fn results_follow_checklist_order_under_concurrency() {
    let fixture = Fixture::with(SIX_CRITERIA, Arc::new(JitterEmbedder)).await;
    let coordinator = fixture.keyword_coordinator();

    let report = coordinator.run(request(SIX_TOPIC_REPORT)).await.unwrap();
    let criteria: Vec<&str> = report.results.iter().map(|r| r.item.criterion.as_str()).collect();
    assert_eq!(
        criteria,
        [
            "Emissions",
            "Board oversight",
            "Water usage",
            "Employee training hours",
            "Waste",
            "Scope 3 emissions"
        ]
    );
    for result in &report.results {
        for extraction in &result.extractions {
            assert_eq!(extraction.criterion, result.item.criterion);
        }
    }
    assert_eq!(report.results[2].verdict.status, VerdictStatus::Flagged);
}

#[tokio::test]
async fn extraction_waits_out_resource_pressure_within_the_worker_budget() {
    let strained = 3;
    let pressure = Arc::new(MemoryPressure::new(strained));
    let samples = pressure.samples();
    let embedder = Arc::new(GaugedEmbedder::new(&pressure));
    let fixture = Fixture::with(SIX_CRITERIA, embedder.clone()).await;
    let mut config = fixture.config.clone();
    config.resources.poll_interval_ms = 10;
    let coordinator = fixture.governed(config, pressure, Arc::new(KeywordReasoner::default()));

    let report = coordinator.run(request(SIX_TOPIC_REPORT)).await.unwrap();

    // one sample sizes the pool, the strained ones hold back the first
    // spawn, then one calm sample per spawn
    assert_eq!(samples.load(Ordering::SeqCst), 1 + strained + 6);
    assert_eq!(embedder.early.load(Ordering::SeqCst), 0);
    assert_eq!(embedder.max_in_flight.load(Ordering::SeqCst), 2);

    assert_eq!(report.results.len(), 6);
    for result in &report.results {
        assert_eq!(result.state, CriterionState::Summarized);
        assert_ne!(result.verdict.reason, "timeout");
        assert!(result.attempts >= 1);
    }
    assert_eq!(report.results[0].verdict.status, VerdictStatus::Validated);
}

#[tokio::test]
async fn empty_document_flags_every_criterion() {
    let fixture = Fixture::new().await;
    let reasoner = Arc::new(CountingReasoner::new(KeywordReasoner::default()));
    let report = fixture.coordinator(reasoner.clone()).run(request("  \n\n   ")).await.unwrap();

    for result in &report.results {
        assert_eq!(result.verdict.status, VerdictStatus::Flagged);
        assert_eq!(result.verdict.reason, "no content");
        assert_eq!(result.attempts, 0);
        assert_eq!(result.state, CriterionState::Summarized);
    }
    assert_eq!(reasoner.judged(), 0);
    assert_eq!(fixture.scratch_entries(), 0);
}

#[tokio::test]
async fn unreadable_document_is_an_error_and_leaves_no_scratch() {
    let fixture = Fixture::new().await;
    let coordinator = fixture.keyword_coordinator();
    let request = AuditRequest::new("scan.pdf", vec![0xff, 0xfe, 0x00, 0x01], CHECKLIST);

    let err = coordinator.run(request).await.unwrap_err();
    assert!(matches!(
        err,
        AuditError::UnreadableDocument { ref document, .. } if document == "scan.pdf"
    ));
    assert_eq!(fixture.scratch_entries(), 0);
    assert!(!fixture.config.paths.output_dir.join("results.json").exists());
}

#[tokio::test]
async fn unknown_checklist_is_an_error() {
    let fixture = Fixture::new().await;
    let request = AuditRequest::new("acme_2023.txt", REPORT.as_bytes().to_vec(), "gri");
    let err = fixture.keyword_coordinator().run(request).await.unwrap_err();
    assert!(matches!(err, AuditError::UnknownChecklist(name) if name == "gri"));
}

#[tokio::test]
async fn subject_store_is_cleared_after_success() {
    let fixture = Fixture::new().await;
    let scratch = fixture.temp.path().join("run-under-test");
    let subject = Arc::new(SubjectStore::new(&scratch, fixture.ingestor.clone()));

    fixture.keyword_coordinator().run_in(subject.clone(), request(REPORT)).await.unwrap();
    assert!(!scratch.exists());
    assert!(subject.is_empty().await);
}

#[tokio::test]
async fn timeout_flags_unfinished_criteria_and_still_cleans_up() {
    let fixture = Fixture::new().await;
    let mut config = fixture.config.clone();
    config.workflow.document_timeout_secs = Some(1);
    let coordinator = fixture.coordinator_with(config, Arc::new(Stalled));
    let scratch = fixture.temp.path().join("slow-run");
    let subject = Arc::new(SubjectStore::new(&scratch, fixture.ingestor.clone()));

    let report = coordinator.run_in(subject, request(REPORT)).await.unwrap();
    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert_eq!(result.verdict.status, VerdictStatus::Flagged);
        assert_eq!(result.verdict.reason, "timeout");
        assert_eq!(result.summary_text, "Unresolved: timeout");
        assert_eq!(result.state, CriterionState::Summarized);
    }
    assert!(report.processing_time_secs < 30.0);
    assert!(!scratch.exists());
}

#[tokio::test]
async fn dropped_run_still_clears_the_subject_store() {
    let fixture = Fixture::new().await;
    let coordinator = fixture.coordinator(Arc::new(Stalled));
    let scratch = fixture.temp.path().join("abandoned-run");
    let subject = Arc::new(SubjectStore::new(&scratch, fixture.ingestor.clone()));

    let run = coordinator.run_in(subject.clone(), request(REPORT));
    let abandoned = tokio::time::timeout(std::time::Duration::from_millis(500), run).await;
    assert!(abandoned.is_err());

    // cleanup runs on a spawned task once the run future is dropped
    for _ in 0..100 {
        if !scratch.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!scratch.exists());
}

#[tokio::test]
async fn workflow_runs_inside_an_audit_run_span() {
    let capture = SpanCapture::new();
    let subscriber = tracing_subscriber::registry().with(capture.layer());
    let _guard = tracing::subscriber::set_default(subscriber);
    let fixture = Fixture::new().await;

    let report = fixture.keyword_coordinator().run(request(REPORT)).await.unwrap();
    let runs = capture.spans_named("audit_run");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].field_str("run_id"), Some(report.run_id.as_str()));
    assert_eq!(runs[0].field_str("document"), Some("acme_2023.txt"));
}
