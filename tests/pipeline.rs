//! End-to-end pipeline tests over scripted model clients.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use common::{context, pac_page_json, ScriptedChat, ScriptedVision, PAC_TEXT};
use medical_rag::error::PipelineError;
use medical_rag::index::collection_name;
use medical_rag::pipeline::PipelineContext;
use medical_rag::progress::{ChannelProgress, NoProgress, Severity, Stage};
use medical_rag::rasterize::{MockRasterizer, RasterizeError};
use medical_rag::store::InMemoryVectorStore;

fn doc(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, b"%PDF-1.4").unwrap();
    path
}

fn drain(tokens: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(t) = tokens.try_recv() {
        out.push(t);
    }
    out
}

#[tokio::test]
async fn one_page_guideline_is_indexed_and_retrieved() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json())]));
    let chat = Arc::new(ScriptedChat::new("Amoxicilline 1g x3/j pendant 7 jours.", &[]));
    let ctx = context(1, vision, chat.clone());

    let report = ctx
        .analyze_document("doc1", &doc(&dir, "reco.pdf"), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.collection_name, "medical_doc_doc1");
    assert_eq!(report.pages, 1);
    assert_eq!(report.total_chunks, 1);
    assert!(report.degraded_pages.is_empty());

    let info = ctx
        .index_manager()
        .unwrap()
        .info(&collection_name("doc1"))
        .await
        .unwrap();
    assert_eq!(info.points_count, 1);
    assert_eq!(info.vector_size, 1536);

    let hits = ctx
        .retriever()
        .unwrap()
        .search("quelle posologie pour PAC non grave ?", &collection_name("doc1"), 6)
        .await;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains(PAC_TEXT));
    assert_eq!(hits[0].metadata["page"], 0);
    assert_eq!(hits[0].metadata["medical_entities"], serde_json::json!(["amoxicilline"]));

    let answer = ctx
        .ask("doc1", "quelle posologie pour PAC non grave ?", &NoProgress)
        .await
        .unwrap();
    assert_eq!(answer.response, "Amoxicilline 1g x3/j pendant 7 jours.");
    assert_eq!(answer.sources.len(), 1);
    let prompt = chat.last_prompt().unwrap();
    assert!(prompt.contains(PAC_TEXT));
    assert!(prompt.contains("quelle posologie pour PAC non grave ?"));
}

#[tokio::test]
async fn analysis_reports_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json())]));
    let ctx = context(1, vision, Arc::new(ScriptedChat::new("ok", &[])));
    let (reporter, mut events) = ChannelProgress::channel();

    ctx.analyze_document("doc1", &doc(&dir, "reco.pdf"), &reporter)
        .await
        .unwrap();

    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        stages.push(event.stage);
    }
    for stage in [Stage::Conversion, Stage::Vision, Stage::Chunking, Stage::Indexing, Stage::Complete] {
        assert!(stages.contains(&stage), "missing {:?} in {:?}", stage, stages);
    }
    assert_eq!(stages.last(), Some(&Stage::Complete));
}

#[tokio::test]
async fn unreadable_page_degrades_instead_of_failing() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json()), None]));
    let ctx = context(2, vision, Arc::new(ScriptedChat::new("ok", &[])));
    let (reporter, mut events) = ChannelProgress::channel();

    let report = ctx
        .analyze_document("doc2", &doc(&dir, "reco.pdf"), &reporter)
        .await
        .unwrap();
    assert_eq!(report.pages, 2);
    assert_eq!(report.total_chunks, 1);
    assert_eq!(report.degraded_pages.len(), 1);
    assert_eq!(report.degraded_pages[0].0, 1);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        warned |= event.stage == Stage::Vision && event.severity == Severity::Warning;
    }
    assert!(warned);
}

#[tokio::test]
async fn no_text_on_any_page_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![None, None]));
    let ctx = context(2, vision, Arc::new(ScriptedChat::new("ok", &[])));

    let err = ctx
        .analyze_document("doc3", &doc(&dir, "blank.pdf"), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoContentExtracted));
    assert!(ctx
        .index_manager()
        .unwrap()
        .info(&collection_name("doc3"))
        .await
        .is_none());
}

#[tokio::test]
async fn unsupported_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json())]));
    let ctx = context(1, vision, Arc::new(ScriptedChat::new("ok", &[])));

    let err = ctx
        .analyze_document("doc4", &doc(&dir, "notes.odt"), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Rasterize(RasterizeError::UnsupportedInput(_))
    ));
    assert_eq!(err.code(), "unsupported_input");
}

#[tokio::test]
async fn missing_clients_fail_before_any_work() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = PipelineContext::new(
        common::test_config(),
        Arc::new(MockRasterizer { pages: 1 }),
        Arc::new(InMemoryVectorStore::new()),
    );

    let err = ctx
        .analyze_document("doc5", &doc(&dir, "notes.odt"), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingCredentials { env_var: "ANTHROPIC_API_KEY", .. }));

    let err = ctx.ask("doc5", "posologie ?", &NoProgress).await.unwrap_err();
    assert!(matches!(err, PipelineError::MissingCredentials { env_var: "OPENAI_API_KEY", .. }));
    assert!(ctx.index_manager().is_err());
}

#[tokio::test]
async fn reanalysis_overwrites_points_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![
        Some(pac_page_json()),
        Some(pac_page_json()),
    ]));
    let ctx = context(1, vision, Arc::new(ScriptedChat::new("ok", &[])));
    let path = doc(&dir, "reco.pdf");

    ctx.analyze_document("doc6", &path, &NoProgress).await.unwrap();
    let again = ctx.analyze_document("doc6", &path, &NoProgress).await.unwrap();

    let info = ctx
        .index_manager()
        .unwrap()
        .info(&again.collection_name)
        .await
        .unwrap();
    assert_eq!(info.points_count, again.total_chunks);
}

#[tokio::test]
async fn streamed_answer_forwards_tokens_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json())]));
    let chat = Arc::new(ScriptedChat::new("unused", &["Amoxi", "cilline ", "1g"]));
    let ctx = context(1, vision, chat);
    ctx.analyze_document("doc7", &doc(&dir, "reco.pdf"), &NoProgress)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = ctx
        .ask_streaming("doc7", "posologie ?", &tx, &NoProgress)
        .await
        .unwrap();

    assert!(!outcome.is_degraded());
    assert_eq!(drain(&mut rx), ["Amoxi", "cilline ", "1g"]);
    let answer = outcome.into_value();
    assert_eq!(answer.response, "Amoxicilline 1g");
    assert_eq!(answer.sources.len(), 1);
}

#[tokio::test]
async fn broken_stream_replays_the_blocking_answer() {
    let dir = tempfile::tempdir().unwrap();
    let vision = Arc::new(ScriptedVision::new(vec![Some(pac_page_json())]));
    let chat = Arc::new(ScriptedChat::broken("Amoxicilline 1g x3/j", &["Amoxi"]));
    let ctx = context(1, vision, chat);
    ctx.analyze_document("doc8", &doc(&dir, "reco.pdf"), &NoProgress)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (reporter, mut events) = ChannelProgress::channel();
    let outcome = ctx
        .ask_streaming("doc8", "posologie ?", &tx, &reporter)
        .await
        .unwrap();

    assert_eq!(outcome.degradation(), Some("connection reset"));
    assert_eq!(
        drain(&mut rx),
        ["Amoxi", "Amoxicilline ", "1g ", "x3/j"]
    );
    assert_eq!(outcome.into_value().response, "Amoxicilline 1g x3/j");

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        warned |= event.stage == Stage::Generation && event.severity == Severity::Warning;
    }
    assert!(warned);
}

#[tokio::test]
async fn question_about_unknown_document_has_no_sources() {
    let vision = Arc::new(ScriptedVision::new(vec![]));
    let chat = Arc::new(ScriptedChat::new(medical_rag::answer::REFUSAL, &[]));
    let ctx = context(1, vision, chat);

    let answer = ctx.ask("missing", "posologie ?", &NoProgress).await.unwrap();
    assert!(answer.sources.is_empty());
    assert_eq!(answer.response, medical_rag::answer::REFUSAL);
}
