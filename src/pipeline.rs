//! End-to-end operations over an explicit [`PipelineContext`].
//!
//! ```text
//! analyze_document:  rasterize ─▶ vision (page by page) ─▶ chunk ─▶ ensure collection ─▶ embed + upsert
//! ask:               retrieve top-k ─▶ prompt ─▶ chat completion (blocking or streamed)
//! ```
//!
//! The context owns every client. Clients whose credentials are absent are
//! left unset; an operation that needs one fails with
//! [`PipelineError::MissingCredentials`] before doing any work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::answer::{AnswerComposer, ChatModel, OpenAIChat};
use crate::chunk::chunk_pages;
use crate::config::{Config, ANTHROPIC_API_KEY_ENV, OPENAI_API_KEY_ENV};
use crate::embedding::{EmbeddingProvider, OpenAIEmbeddings};
use crate::error::PipelineError;
use crate::index::{collection_name, IndexManager};
use crate::models::ScoredPassage;
use crate::outcome::Outcome;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::rasterize::{PageRasterizer, PdfiumRasterizer};
use crate::search::Retriever;
use crate::store::{InMemoryVectorStore, VectorStore};
use crate::vision::{AnthropicVisionClient, VisionClient, VisionExtractor};

/// Everything a pipeline run needs. Cheap to share behind an `Arc`.
pub struct PipelineContext {
    pub config: Config,
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub vision: Option<Arc<dyn VisionClient>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub chat: Option<Arc<dyn ChatModel>>,
    pub store: Arc<dyn VectorStore>,
}

/// Result of indexing one document.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub collection_name: String,
    pub pages: usize,
    pub total_chunks: usize,
    /// `(page_index, reason)` for every page that fell back to an empty analysis.
    pub degraded_pages: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub response: String,
    pub sources: Vec<ScoredPassage>,
}

impl PipelineContext {
    /// Production wiring: PDFium, Anthropic vision, OpenAI embeddings and
    /// chat, in-memory store. Clients are built only when their key is set.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let vision: Option<Arc<dyn VisionClient>> = match Config::anthropic_api_key() {
            Some(key) => Some(Arc::new(
                AnthropicVisionClient::new(&config.vision, key)
                    .map_err(|e| PipelineError::Task(e.to_string()))?,
            )),
            None => {
                tracing::warn!("{} not set, document analysis disabled", ANTHROPIC_API_KEY_ENV);
                None
            }
        };

        let (embedder, chat): (Option<Arc<dyn EmbeddingProvider>>, Option<Arc<dyn ChatModel>>) =
            match Config::openai_api_key() {
                Some(key) => (
                    Some(Arc::new(OpenAIEmbeddings::new(&config.embedding, key.clone()))),
                    Some(Arc::new(OpenAIChat::new(&config.chat, key))),
                ),
                None => {
                    tracing::warn!("{} not set, indexing and chat disabled", OPENAI_API_KEY_ENV);
                    (None, None)
                }
            };

        Ok(Self {
            config,
            rasterizer: Arc::new(PdfiumRasterizer::new()),
            vision,
            embedder,
            chat,
            store: Arc::new(InMemoryVectorStore::new()),
        })
    }

    /// A context with no model clients; attach them with the `with_*` methods.
    pub fn new(config: Config, rasterizer: Arc<dyn PageRasterizer>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            config,
            rasterizer,
            vision: None,
            embedder: None,
            chat: None,
            store,
        }
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionClient>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }

    fn vision_client(&self) -> Result<Arc<dyn VisionClient>, PipelineError> {
        self.vision.clone().ok_or(PipelineError::MissingCredentials {
            component: "vision model",
            env_var: ANTHROPIC_API_KEY_ENV,
        })
    }

    fn embedding_client(&self) -> Result<Arc<dyn EmbeddingProvider>, PipelineError> {
        self.embedder.clone().ok_or(PipelineError::MissingCredentials {
            component: "embedding model",
            env_var: OPENAI_API_KEY_ENV,
        })
    }

    fn chat_client(&self) -> Result<Arc<dyn ChatModel>, PipelineError> {
        self.chat.clone().ok_or(PipelineError::MissingCredentials {
            component: "chat model",
            env_var: OPENAI_API_KEY_ENV,
        })
    }

    pub fn index_manager(&self) -> Result<IndexManager, PipelineError> {
        Ok(IndexManager::new(self.store.clone(), self.embedding_client()?))
    }

    pub fn retriever(&self) -> Result<Retriever, PipelineError> {
        Ok(Retriever::new(self.store.clone(), self.embedding_client()?))
    }

    pub fn composer(&self) -> Result<AnswerComposer, PipelineError> {
        Ok(AnswerComposer::new(
            self.chat_client()?,
            Duration::from_millis(self.config.chat.fallback_word_delay_ms),
        ))
    }

    /// Turns the file at `path` into an indexed collection for `document_id`.
    pub async fn analyze_document(
        &self,
        document_id: &str,
        path: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<AnalysisReport, PipelineError> {
        let extractor = VisionExtractor::new(self.vision_client()?);
        let index = self.index_manager()?;

        tracing::info!(document_id, path = %path.display(), "analysis started");
        progress.report(ProgressEvent::info(
            Stage::Conversion,
            "converting document to page images",
        ));

        let rasterizer = self.rasterizer.clone();
        let owned_path = path.to_path_buf();
        let dpi = self.config.vision.dpi;
        let images = tokio::task::spawn_blocking(move || rasterizer.rasterize(&owned_path, dpi))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;

        let page_count = images.len();
        progress.report(
            ProgressEvent::success(
                Stage::Conversion,
                format!("document converted: {} pages to analyze", page_count),
            )
            .with_details(json!({ "pages": page_count, "dpi": dpi })),
        );

        let mut pages = Vec::with_capacity(page_count);
        let mut degraded_pages = Vec::new();
        for image in &images {
            match extractor.extract(image, page_count, progress).await {
                Outcome::Complete(page) => pages.push(page),
                Outcome::Degraded(page, reason) => {
                    degraded_pages.push((image.index, reason));
                    pages.push(page);
                }
            }
        }

        let passages = chunk_pages(&pages, &self.config.chunking, progress);
        if passages.is_empty() {
            tracing::error!(document_id, pages = page_count, "no content extracted");
            progress.report(ProgressEvent::error(
                Stage::Chunking,
                "no content extracted from the document",
            ));
            return Err(PipelineError::NoContentExtracted);
        }

        let name = collection_name(document_id);
        let ready = if self.config.indexing.reset_on_reanalyze {
            index.reset_collection(&name).await
        } else {
            index.ensure_collection(&name).await
        };
        if !ready {
            return Err(PipelineError::Collection(name));
        }

        progress.report(ProgressEvent::info(
            Stage::Indexing,
            format!("embedding and indexing {} passages", passages.len()),
        ));
        let total_chunks = index
            .upsert(&name, &passages)
            .await
            .map_err(|e| PipelineError::Indexing(e.to_string()))?;

        progress.report(
            ProgressEvent::success(
                Stage::Complete,
                format!("document ready: {} passages indexed", total_chunks),
            )
            .with_details(json!({
                "collection": name,
                "total_chunks": total_chunks,
                "degraded_pages": degraded_pages.len(),
            })),
        );
        tracing::info!(
            document_id,
            collection = %name,
            total_chunks,
            degraded = degraded_pages.len(),
            "analysis complete"
        );

        Ok(AnalysisReport {
            collection_name: name,
            pages: page_count,
            total_chunks,
            degraded_pages,
        })
    }

    async fn retrieve(
        &self,
        document_id: &str,
        question: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<Vec<ScoredPassage>, PipelineError> {
        let retriever = self.retriever()?;
        let k = self.config.retrieval.k;
        progress.report(ProgressEvent::info(
            Stage::Retrieval,
            format!("searching the {} most relevant passages", k),
        ));

        let sources = retriever
            .search(question, &collection_name(document_id), k)
            .await;

        for (i, source) in sources.iter().enumerate() {
            let page = source.metadata.get("page").cloned().unwrap_or(json!(null));
            progress.report(
                ProgressEvent::info(
                    Stage::Retrieval,
                    format!(
                        "passage {}: score {:.3}, page {}",
                        i + 1,
                        source.similarity_score,
                        page
                    ),
                )
                .with_details(json!({
                    "rank": i + 1,
                    "score": source.similarity_score,
                    "page": page,
                })),
            );
        }
        progress.report(ProgressEvent::success(
            Stage::Retrieval,
            format!("{} passages retrieved", sources.len()),
        ));
        Ok(sources)
    }

    /// Answers `question` from the document's passages with one blocking call.
    pub async fn ask(
        &self,
        document_id: &str,
        question: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<Answer, PipelineError> {
        let composer = self.composer()?;
        let sources = self.retrieve(document_id, question, progress).await?;

        progress.report(ProgressEvent::info(Stage::Generation, "generating answer"));
        let response = composer.answer(question, &sources).await?;
        progress.report(ProgressEvent::success(Stage::Generation, "answer generated"));

        Ok(Answer { response, sources })
    }

    /// Like [`ask`](Self::ask), forwarding answer increments onto `tokens`.
    pub async fn ask_streaming(
        &self,
        document_id: &str,
        question: &str,
        tokens: &mpsc::UnboundedSender<String>,
        progress: &dyn ProgressReporter,
    ) -> Result<Outcome<Answer>, PipelineError> {
        let composer = self.composer()?;
        let sources = self.retrieve(document_id, question, progress).await?;

        progress.report(ProgressEvent::info(Stage::Generation, "streaming answer"));
        let outcome = composer.answer_streaming(question, &sources, tokens).await?;
        match outcome.degradation() {
            Some(reason) => progress.report(ProgressEvent::warning(
                Stage::Generation,
                format!("streaming unavailable, answer replayed: {}", reason),
            )),
            None => progress.report(ProgressEvent::success(Stage::Generation, "answer streamed")),
        }

        Ok(outcome.map(|response| Answer { response, sources }))
    }
}
