//! Answer composition: prompt assembly and chat-completion calls.
//!
//! The prompt wraps the retrieved passages (most similar first) in a
//! `CONTEXTE` block and constrains the model to answer from them alone,
//! with a fixed refusal sentence when the context does not support an
//! answer.
//!
//! Streaming degrades instead of failing: if the streamed call breaks,
//! before or while tokens flow, the answer is fetched with one blocking
//! call and replayed word by word. Only a failure of that call is an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ChatConfig;
use crate::error::PipelineError;
use crate::models::ScoredPassage;
use crate::outcome::Outcome;

pub const REFUSAL: &str = "Je ne trouve pas cette information dans le document fourni.";
pub const NO_PRECAUTIONS: &str = "Aucune précaution particulière mentionnée dans le document.";

/// Incremental text pieces from a streamed completion.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    async fn stream(&self, prompt: &str) -> Result<TokenStream>;
}

/// Builds the full prompt for one question.
pub fn build_prompt(question: &str, passages: &[ScoredPassage]) -> String {
    let context = passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Tu es un assistant médical expert chargé d'analyser des recommandations cliniques. \
Tu réponds uniquement à partir du document fourni.

CONTEXTE:
{context}

QUESTION: {question}

INSTRUCTIONS:
1. Réponds uniquement en français, en te fondant exclusivement sur le CONTEXTE ci-dessus.
2. Si le CONTEXTE ne permet pas de répondre, réponds exactement : \"{refusal}\"
3. Sinon, structure ta réponse ainsi :
   - Réponse directe : la réponse en une ou deux phrases.
   - Détails cliniques : posologies, durées, critères, en citant les valeurs exactes du document, sans jamais extrapoler.
   - Précautions : contre-indications et mises en garde du document, ou à défaut : \"{none}\"

RÉPONSE:",
        context = context,
        question = question,
        refusal = REFUSAL,
        none = NO_PRECAUTIONS,
    )
}

/// Splits `text` on whitespace; every word but the last keeps one trailing space.
pub fn replay_words(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, w)| {
            if i < last {
                format!("{} ", w)
            } else {
                w.to_string()
            }
        })
        .collect()
}

pub struct AnswerComposer {
    chat: Arc<dyn ChatModel>,
    word_delay: Duration,
}

impl AnswerComposer {
    pub fn new(chat: Arc<dyn ChatModel>, word_delay: Duration) -> Self {
        Self { chat, word_delay }
    }

    pub async fn answer(
        &self,
        question: &str,
        passages: &[ScoredPassage],
    ) -> Result<String, PipelineError> {
        let prompt = build_prompt(question, passages);
        self.chat
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::Generation(e.to_string()))
    }

    /// Streams the answer onto `tokens` and returns the full text.
    ///
    /// A closed `tokens` receiver does not stop generation.
    pub async fn answer_streaming(
        &self,
        question: &str,
        passages: &[ScoredPassage],
        tokens: &mpsc::UnboundedSender<String>,
    ) -> Result<Outcome<String>, PipelineError> {
        let prompt = build_prompt(question, passages);

        let failure = match self.chat.stream(&prompt).await {
            Ok(mut stream) => {
                let mut full = String::new();
                let mut failure = None;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(token) => {
                            full.push_str(&token);
                            let _ = tokens.send(token);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    None => return Ok(Outcome::Complete(full)),
                    Some(e) => e,
                }
            }
            Err(e) => e,
        };

        tracing::warn!(error = %failure, "streaming failed, falling back to blocking answer");
        let answer = self
            .chat
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::Generation(e.to_string()))?;

        let words = replay_words(&answer);
        let last = words.len().saturating_sub(1);
        for (i, word) in words.into_iter().enumerate() {
            let _ = tokens.send(word);
            if i < last && !self.word_delay.is_zero() {
                tokio::time::sleep(self.word_delay).await;
            }
        }

        Ok(Outcome::Degraded(answer, failure.to_string()))
    }
}

// ============ OpenAI ============

/// OpenAI chat completions (`POST {url}/v1/chat/completions`).
pub struct OpenAIChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    temperature: f32,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
        }
    }

    async fn post(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "stream": stream,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI chat error {}: {}", status, body_text);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let json: serde_json::Value = self.post(prompt, false).await?.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let mut bytes = self.post(prompt, true).await?.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::from(e));
                        break 'read;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(String::from_utf8_lossy(&line).trim()) {
                        SseLine::Token(token) => yield Ok(token),
                        SseLine::Done => break 'read,
                        SseLine::Skip => {}
                        SseLine::Invalid(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

enum SseLine {
    Token(String),
    Done,
    Skip,
    Invalid(anyhow::Error),
}

/// One line of an OpenAI server-sent event stream.
fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(json) => match json
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
        {
            Some(token) if !token.is_empty() => SseLine::Token(token.to_string()),
            _ => SseLine::Skip,
        },
        Err(e) => SseLine::Invalid(anyhow::anyhow!("malformed stream event: {}", e)),
    }
}
