mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tempfile::TempDir;

use jobtrail::config::Config;
use jobtrail::email_store::EmailStore;
use jobtrail::models::{Category, ClassificationSource};
use jobtrail::normalize::{normalize, ExportFormat};
use jobtrail::pipeline::{IngestOptions, Pipeline};

use common::{api_message, export, memory_index, ScriptedGenerator};

const ACCOUNT: &str = "me@example.com";

async fn setup(tmp: &TempDir) -> (Pipeline, Arc<ScriptedGenerator>) {
    let config = Config::minimal(tmp.path().join("jobtrail.sqlite"));
    let store = EmailStore::open(&config).await.unwrap();
    let generator = Arc::new(ScriptedGenerator::default());
    let pipeline = Pipeline::new(
        store,
        common::chain(generator.clone()),
        Some(memory_index()),
        2,
    );
    (pipeline, generator)
}

fn sample_export() -> Vec<u8> {
    let interview = api_message(
        "m1",
        "Interview invitation: Backend Engineer",
        "Jane Recruiter <jane@initech.com>",
        "Mon, 4 Mar 2024 10:00:00 +0000",
        "Are you free for an interview call on Tuesday?",
    );
    export(vec![
        interview.clone(),
        api_message(
            "m2",
            "Your offer from Globex",
            "Talent <talent@globex.com>",
            "Tue, 5 Mar 2024 10:00:00 +0000",
            "We are pleased to extend an offer for the role.",
        ),
        api_message(
            "m3",
            "Weekly newsletter",
            "News <news@digest.io>",
            "Wed, 6 Mar 2024 10:00:00 +0000",
            "Top stories this week in gardening.",
        ),
        interview,
    ])
}

#[tokio::test]
async fn ingest_classifies_in_background_and_answers_queries() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, _) = setup(&tmp).await;

    let ingestion = pipeline
        .ingest(&sample_export(), ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(ingestion.report.parsed, 4);
    assert_eq!(ingestion.report.duplicates, 1);
    assert_eq!(ingestion.report.accepted, 3);

    let processed = ingestion.task.expect("background task").await.unwrap();
    assert_eq!(processed.classified, 3);
    assert_eq!(processed.fallback, 1);
    assert_eq!(processed.failed, 0);
    assert_eq!(processed.indexed, 3);

    let emails = pipeline.emails();
    let interview = emails.get_by_external_id(ACCOUNT, "m1").await.unwrap().unwrap();
    let c = interview.classification.as_ref().unwrap();
    assert_eq!(c.category, Category::Interview);
    assert_eq!(c.source, ClassificationSource::Model);
    assert_eq!(interview.email.company, "Initech");
    assert_eq!(interview.embedding_id.as_deref(), Some("me@example.com_m1"));

    let offer = emails.get_by_external_id(ACCOUNT, "m2").await.unwrap().unwrap();
    let c = offer.classification.unwrap();
    assert_eq!(c.category, Category::Offer);
    assert_eq!(c.source, ClassificationSource::KeywordFallback);
    assert!((c.confidence - 0.3).abs() < 1e-9);

    let answer = pipeline.query("interview on Tuesday", 2).await.unwrap();
    assert_eq!(answer.sources.len(), 2);
    assert_eq!(answer.sources[0].metadata["email_id"], "m1");
    assert_eq!(answer.sources[0].metadata["category"], "Interview");
    assert_eq!(answer.answer, "You have 2 relevant emails.");

    let stats = emails.pipeline_stats().await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.indexed, 3);
}

#[tokio::test]
async fn reingest_accepts_nothing_new() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, generator) = setup(&tmp).await;

    let first = pipeline
        .ingest(&sample_export(), ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    first.task.unwrap().await.unwrap();
    let calls = generator.calls.load(Ordering::SeqCst);

    let second = pipeline
        .ingest(&sample_export(), ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(second.report.accepted, 0);
    assert_eq!(second.report.already_stored, 3);
    assert!(second.task.is_none());
    assert_eq!(generator.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn relevance_filter_drops_newsletters() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, _) = setup(&tmp).await;

    let ingestion = pipeline
        .ingest(
            &sample_export(),
            ExportFormat::Json,
            ACCOUNT,
            IngestOptions { relevant_only: true },
        )
        .await
        .unwrap();
    assert_eq!(ingestion.report.filtered_out, 1);
    assert_eq!(ingestion.report.accepted, 2);
    ingestion.task.unwrap().await.unwrap();

    assert!(pipeline
        .emails()
        .get_by_external_id(ACCOUNT, "m3")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn failed_generation_is_recorded_not_raised() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, _) = setup(&tmp).await;

    let raw = export(vec![api_message(
        "boom",
        "Status update",
        "Ops <ops@example.org>",
        "Thu, 7 Mar 2024 10:00:00 +0000",
        "EXPLODE",
    )]);
    let ingestion = pipeline
        .ingest(&raw, ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    let processed = ingestion.task.unwrap().await.unwrap();
    assert_eq!(processed.failed, 1);
    assert_eq!(processed.classified, 1);

    let row = pipeline
        .emails()
        .get_by_external_id(ACCOUNT, "boom")
        .await
        .unwrap()
        .unwrap();
    assert!(row.is_processed);
    let c = row.classification.unwrap();
    assert_eq!(c.category, Category::Other);
    assert_eq!(c.confidence, 0.0);
    assert_eq!(c.source, ClassificationSource::Failed);
    assert!(c.summary.starts_with("Classification error"));
}

#[tokio::test]
async fn process_pending_picks_up_stored_rows() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, _) = setup(&tmp).await;

    for email in normalize(&sample_export(), ExportFormat::Json, ACCOUNT) {
        pipeline.emails().upsert_email(&email).await.unwrap();
    }
    assert_eq!(pipeline.emails().unprocessed(10).await.unwrap().len(), 3);

    let report = pipeline.process_pending(10).await.unwrap();
    assert_eq!(report.classified, 3);
    assert!(pipeline.emails().unprocessed(10).await.unwrap().is_empty());

    let again = pipeline.process_pending(10).await.unwrap();
    assert_eq!(again.classified, 0);
}

#[tokio::test]
async fn delete_removes_row_and_index_entry() {
    let tmp = TempDir::new().unwrap();
    let (pipeline, _) = setup(&tmp).await;

    let ingestion = pipeline
        .ingest(&sample_export(), ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    ingestion.task.unwrap().await.unwrap();

    let index = pipeline.index().unwrap();
    assert_eq!(index.count().await.unwrap(), 3);

    let row = pipeline
        .emails()
        .get_by_external_id(ACCOUNT, "m2")
        .await
        .unwrap()
        .unwrap();
    let deleted = pipeline.delete_email(row.row_id).await.unwrap();
    assert!(deleted.is_some());
    assert_eq!(index.count().await.unwrap(), 2);
    assert_eq!(pipeline.emails().count().await.unwrap(), 2);

    assert!(pipeline.delete_email(row.row_id).await.unwrap().is_none());
}

#[tokio::test]
async fn pipeline_without_index_still_classifies() {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path().join("jobtrail.sqlite"));
    let store = EmailStore::open(&config).await.unwrap();
    let pipeline = Pipeline::new(
        store,
        common::chain(Arc::new(ScriptedGenerator::default())),
        None,
        10,
    );

    let ingestion = pipeline
        .ingest(&sample_export(), ExportFormat::Json, ACCOUNT, IngestOptions::default())
        .await
        .unwrap();
    let processed = ingestion.task.unwrap().await.unwrap();
    assert_eq!(processed.classified, 3);
    assert_eq!(processed.indexed, 0);

    assert!(pipeline.query("anything", 3).await.is_err());
    let health = pipeline.health().await.unwrap();
    assert!(health.inference_healthy);
    assert_eq!(health.current_model, "phi3:mini");
    assert!(health.index.is_none());
}
