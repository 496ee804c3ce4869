//! Scripted model clients shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use medical_rag::answer::{ChatModel, TokenStream};
use medical_rag::config::Config;
use medical_rag::embedding::{EmbeddingProvider, HashEmbeddings};
use medical_rag::pipeline::PipelineContext;
use medical_rag::rasterize::MockRasterizer;
use medical_rag::store::{InMemoryVectorStore, VectorStore};
use medical_rag::vision::{VisionClient, VisionError};

pub const PAC_TEXT: &str =
    "Amoxicilline 1g x3/j pendant 7 jours pour PAC non grave sans comorbidité.";

/// Vision response for a page that reads [`PAC_TEXT`].
pub fn pac_page_json() -> String {
    serde_json::json!({
        "page_type": "dosage_table",
        "full_text": PAC_TEXT,
        "sections": [{
            "title": "PAC non grave",
            "type": "dosage",
            "text_content": PAC_TEXT,
            "medical_entities": ["amoxicilline"],
            "confidence": 0.95
        }]
    })
    .to_string()
}

/// Answers page by page from a queue; `None` entries fail the call.
/// Once the queue is empty every call fails.
pub struct ScriptedVision {
    replies: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedVision {
    pub fn new(replies: Vec<Option<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }
}

#[async_trait]
impl VisionClient for ScriptedVision {
    async fn describe_image(&self, _png: &[u8], _instruction: &str) -> Result<String, VisionError> {
        let reply = self.replies.lock().unwrap().pop_front().flatten();
        reply.ok_or(VisionError::EmptyResponse)
    }
}

/// Returns `answer` from `complete`; `stream` yields `tokens` and then,
/// when `break_stream` is set, an error.
pub struct ScriptedChat {
    pub answer: String,
    pub tokens: Vec<String>,
    pub break_stream: bool,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new(answer: &str, tokens: &[&str]) -> Self {
        Self {
            answer: answer.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            break_stream: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn broken(answer: &str, tokens: &[&str]) -> Self {
        Self {
            break_stream: true,
            ..Self::new(answer, tokens)
        }
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer.clone())
    }

    async fn stream(&self, prompt: &str) -> anyhow::Result<TokenStream> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut items: Vec<anyhow::Result<String>> =
            self.tokens.iter().map(|t| Ok(t.clone())).collect();
        if self.break_stream {
            items.push(Err(anyhow::anyhow!("connection reset")));
        }
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

pub fn test_config() -> Config {
    let mut config = Config::minimal();
    config.chat.fallback_word_delay_ms = 0;
    config
}

/// A fully wired context: mock rasterizer, scripted vision and chat,
/// hashed embeddings, in-memory store.
pub fn context(
    pages: usize,
    vision: Arc<ScriptedVision>,
    chat: Arc<ScriptedChat>,
) -> PipelineContext {
    context_with(test_config(), pages, vision, chat)
}

pub fn context_with(
    config: Config,
    pages: usize,
    vision: Arc<ScriptedVision>,
    chat: Arc<ScriptedChat>,
) -> PipelineContext {
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(HashEmbeddings::new("text-embedding-3-small"));
    PipelineContext::new(config, Arc::new(MockRasterizer { pages }), store)
        .with_vision(vision)
        .with_embedder(embedder)
        .with_chat(chat)
}
