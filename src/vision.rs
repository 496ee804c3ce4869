//! Vision extraction: one page image in, one [`PageAnalysis`] out.
//!
//! The page is sent as a base64 PNG together with a fixed French extraction
//! instruction. The model answers with prose around a JSON object; the JSON
//! is located from the first `{` to the last `}` and parsed leniently
//! (missing fields default to empty, older field names are accepted).
//!
//! Extraction never fails: any error becomes
//! [`Outcome::Degraded`] with [`PageAnalysis::fallback`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use thiserror::Error;

use crate::config::VisionConfig;
use crate::models::PageAnalysis;
use crate::outcome::Outcome;
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::rasterize::PageImage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const EXTRACTION_PROMPT: &str = r###"Analyse cette page de recommandations médicales et extrais-en tout le contenu.

1. TEXTE INTEGRAL : transcris fidèlement tout le texte lisible de la page, dans l'ordre de lecture. Conserve les titres (préfixés par "## "), les listes (préfixées par "- ") et les valeurs numériques exactes. Transcris les tableaux ligne par ligne, cellules séparées par " | ".
2. STRUCTURE : titres, sections, tableaux, encadrés, listes.
3. CONTENU MEDICAL : médicaments, posologies, critères cliniques, types de patients, durées de traitement.

Retourne uniquement un objet JSON de la forme :
{
  "page_type": "guidelines|dosage_table|criteria_list|other",
  "full_text": "texte intégral de la page",
  "sections": [
    {
      "title": "titre de la section",
      "type": "section|table|criteria|dosage|case_study",
      "text_content": "contenu de la section",
      "medical_entities": ["amoxicilline", "PAC grave"],
      "confidence": 0.9
    }
  ],
  "key_medical_info": {
    "medications": ["médicaments"],
    "dosages": ["posologies"],
    "clinical_criteria": ["critères cliniques"],
    "patient_types": ["PAC grave", "sans comorbidité"]
  }
}"###;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vision API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("vision response has no text content")]
    EmptyResponse,

    #[error("no JSON object in vision response")]
    NoJson,

    #[error("vision JSON did not parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A vision-capable model that answers an instruction about one image.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn describe_image(&self, png: &[u8], instruction: &str) -> Result<String, VisionError>;
}

// ============ Anthropic ============

/// Anthropic Messages API client (`POST {url}/v1/messages`).
pub struct AnthropicVisionClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
    max_tokens: u32,
}

impl AnthropicVisionClient {
    pub fn new(config: &VisionConfig, api_key: String) -> Result<Self, VisionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl VisionClient for AnthropicVisionClient {
    async fn describe_image(&self, png: &[u8], instruction: &str) -> Result<String, VisionError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/png",
                            "data": base64::engine::general_purpose::STANDARD.encode(png),
                        }
                    },
                    { "type": "text", "text": instruction }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response.json().await?;
        let text: String = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(VisionError::EmptyResponse);
        }
        Ok(text)
    }
}

// ============ Extraction ============

/// The span from the first `{` to the last `}`, if any.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parses a model response into a page analysis.
///
/// Confidences are clamped to `[0, 1]`. When the model omitted
/// `full_text` but described sections, the page text is rebuilt from the
/// sections as `## title` blocks.
pub fn parse_page_analysis(response: &str, page_index: usize) -> Result<PageAnalysis, VisionError> {
    let raw = extract_json(response).ok_or(VisionError::NoJson)?;
    let mut page: PageAnalysis = serde_json::from_str(raw)?;

    page.page_index = page_index;
    if page.page_type.trim().is_empty() {
        page.page_type = "unknown".to_string();
    }
    for section in &mut page.sections {
        section.confidence = if section.confidence.is_finite() {
            section.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }

    if !page.has_text() {
        page.full_text = page
            .sections
            .iter()
            .filter(|s| !s.text_content.trim().is_empty())
            .map(|s| {
                if s.title.trim().is_empty() {
                    s.text_content.trim().to_string()
                } else {
                    format!("## {}\n{}", s.title.trim(), s.text_content.trim())
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    Ok(page)
}

pub struct VisionExtractor {
    client: Arc<dyn VisionClient>,
}

impl VisionExtractor {
    pub fn new(client: Arc<dyn VisionClient>) -> Self {
        Self { client }
    }

    /// Analyzes one page. `page_count` is only used in progress messages.
    pub async fn extract(
        &self,
        image: &PageImage,
        page_count: usize,
        progress: &dyn ProgressReporter,
    ) -> Outcome<PageAnalysis> {
        let number = image.index + 1;
        progress.report(ProgressEvent::info(
            Stage::Vision,
            format!("analyzing page {}/{}", number, page_count),
        ));

        let result = match self.client.describe_image(&image.png, EXTRACTION_PROMPT).await {
            Ok(response) => parse_page_analysis(&response, image.index),
            Err(e) => Err(e),
        };

        match result {
            Ok(page) => {
                let chars = page.full_text.chars().count();
                tracing::info!(
                    page = image.index,
                    chars,
                    sections = page.sections.len(),
                    page_type = %page.page_type,
                    "page analyzed"
                );
                progress.report(
                    ProgressEvent::success(
                        Stage::Vision,
                        format!(
                            "page {}: extracted {} chars, {} sections",
                            number,
                            chars,
                            page.sections.len()
                        ),
                    )
                    .with_details(json!({
                        "page": number,
                        "sections": page.sections.len(),
                        "chars": chars,
                        "page_type": page.page_type,
                    })),
                );
                Outcome::Complete(page)
            }
            Err(e) => {
                tracing::error!(page = image.index, error = %e, "page analysis failed, using fallback");
                progress.report(ProgressEvent::warning(
                    Stage::Vision,
                    format!("page {}: analysis failed, continuing without text", number),
                ));
                Outcome::Degraded(PageAnalysis::fallback(image.index), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ChannelProgress, Severity};
    use crate::rasterize::minimal_png;

    struct Canned(Result<&'static str, u16>);

    #[async_trait]
    impl VisionClient for Canned {
        async fn describe_image(&self, _png: &[u8], _instruction: &str) -> Result<String, VisionError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(status) => Err(VisionError::Api {
                    status,
                    body: "overloaded".into(),
                }),
            }
        }
    }

    fn page_image(index: usize) -> PageImage {
        PageImage {
            index,
            png: minimal_png(),
            width: 1,
            height: 1,
        }
    }

    #[test]
    fn json_located_between_outer_braces() {
        let text = "Voici l'analyse :\n```json\n{\"a\": {\"b\": 1}}\n```\nFin.";
        assert_eq!(extract_json(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("pas de json"), None);
        assert_eq!(extract_json("} {"), None);
    }

    #[test]
    fn confidence_is_clamped() {
        let response = r#"{"full_text": "x", "sections": [
            {"title": "a", "confidence": 1.7},
            {"title": "b", "confidence": -0.2}
        ]}"#;
        let page = parse_page_analysis(response, 2).unwrap();
        assert_eq!(page.page_index, 2);
        assert_eq!(page.sections[0].confidence, 1.0);
        assert_eq!(page.sections[1].confidence, 0.0);
        assert_eq!(page.page_type, "unknown");
    }

    #[test]
    fn explicit_nulls_keep_the_page() {
        let response = r#"{"page_type": null, "full_text": "Amoxicilline 1g x3/j",
            "sections": [{"title": "PAC", "type": null, "confidence": null, "medical_entities": null}],
            "key_medical_info": {"dosages": null}}"#;
        let page = parse_page_analysis(response, 0).unwrap();
        assert_eq!(page.full_text, "Amoxicilline 1g x3/j");
        assert_eq!(page.page_type, "unknown");
        assert_eq!(page.sections[0].confidence, 0.0);
        assert!(page.key_medical_info.dosages.is_empty());
    }

    #[test]
    fn full_text_rebuilt_from_sections() {
        let response = r#"{"page_type": "guidelines", "main_sections": [
            {"title": "PAC", "content_preview": "Amoxicilline 1g"},
            {"title": "", "content_preview": "Durée 7 jours"}
        ]}"#;
        let page = parse_page_analysis(response, 0).unwrap();
        assert_eq!(page.full_text, "## PAC\nAmoxicilline 1g\n\nDurée 7 jours");
    }

    #[tokio::test]
    async fn successful_extraction_is_complete() {
        let extractor = VisionExtractor::new(Arc::new(Canned(Ok(
            r#"Résultat: {"page_type": "dosage_table", "full_text": "Amoxicilline 1g x3/j",
               "key_medical_info": {"medications": ["amoxicilline"]}}"#,
        ))));
        let (reporter, mut rx) = ChannelProgress::channel();

        let outcome = extractor.extract(&page_image(0), 1, &reporter).await;
        assert!(!outcome.is_degraded());
        let page = outcome.into_value();
        assert_eq!(page.full_text, "Amoxicilline 1g x3/j");
        assert_eq!(page.key_medical_info.medications, vec!["amoxicilline"]);

        let before = rx.try_recv().unwrap();
        assert_eq!(before.message, "analyzing page 1/1");
        let after = rx.try_recv().unwrap();
        assert_eq!(after.severity, Severity::Success);
        assert_eq!(after.details.unwrap()["chars"], 20);
    }

    #[tokio::test]
    async fn api_error_degrades_to_fallback() {
        let extractor = VisionExtractor::new(Arc::new(Canned(Err(529))));
        let (reporter, mut rx) = ChannelProgress::channel();

        let outcome = extractor.extract(&page_image(3), 5, &reporter).await;
        assert!(outcome.is_degraded());
        assert!(outcome.degradation().unwrap().contains("529"));
        assert_eq!(outcome.value(), &PageAnalysis::fallback(3));

        let _ = rx.try_recv().unwrap();
        assert_eq!(rx.try_recv().unwrap().severity, Severity::Warning);
    }

    #[tokio::test]
    async fn unparseable_response_degrades() {
        let extractor = VisionExtractor::new(Arc::new(Canned(Ok("{ pas du json }"))));
        let outcome = extractor
            .extract(&page_image(0), 1, &crate::progress::NoProgress)
            .await;
        assert!(outcome.is_degraded());
        assert!(!outcome.value().has_text());
    }
}
