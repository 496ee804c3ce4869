//! Core data models.
//!
//! These types flow through the document-to-index pipeline (pages, sections,
//! passages) and the retrieval pipeline (scored passages, collection info),
//! plus the [`DocumentRecord`] kept by the orchestration layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Vision output sometimes carries `null` where a value is absent.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A logical subdivision of a page, as perceived by the vision model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    /// Free-form tag: `section`, `table`, `criteria`, `dosage`, `case_study`...
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub section_type: String,
    #[serde(default, alias = "content_preview", deserialize_with = "null_as_default")]
    pub text_content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub medical_entities: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub confidence: f32,
}

/// Aggregate of the medical entities found on a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMedicalInfo {
    #[serde(default, deserialize_with = "null_as_default")]
    pub medications: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub dosages: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clinical_criteria: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub patient_types: Vec<String>,
}

impl KeyMedicalInfo {
    pub fn is_empty(&self) -> bool {
        self.medications.is_empty()
            && self.dosages.is_empty()
            && self.clinical_criteria.is_empty()
            && self.patient_types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.medications
            .iter()
            .chain(self.dosages.iter())
            .chain(self.clinical_criteria.iter())
            .chain(self.patient_types.iter())
    }
}

/// Vision analysis of one rasterized page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageAnalysis {
    #[serde(default, deserialize_with = "null_as_default")]
    pub page_index: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub page_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub full_text: String,
    #[serde(default, alias = "main_sections", deserialize_with = "null_as_default")]
    pub sections: Vec<Section>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub key_medical_info: KeyMedicalInfo,
}

impl PageAnalysis {
    /// The analysis used in place of a page the vision model could not read.
    pub fn fallback(page_index: usize) -> Self {
        Self {
            page_index,
            page_type: "unknown".to_string(),
            ..Self::default()
        }
    }

    pub fn has_text(&self) -> bool {
        !self.full_text.trim().is_empty()
    }

    /// Every entity string on this page: the aggregate lists first, then
    /// the per-section entities.
    pub fn entities(&self) -> impl Iterator<Item = &String> {
        self.key_medical_info
            .iter()
            .chain(self.sections.iter().flat_map(|s| s.medical_entities.iter()))
    }
}

/// Metadata stored alongside each passage in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageMetadata {
    /// Best-effort provenance: 0 when no page could be matched.
    pub page: usize,
    pub chunk_size: usize,
    pub medical_entities: Vec<String>,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// A passage (chunk) of extracted document text: the unit stored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub metadata: PassageMetadata,
}

/// A retrieved passage with its cosine similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub content: String,
    pub metadata: serde_json::Value,
    pub similarity_score: f32,
}

/// Description of one vector collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub points_count: usize,
    pub status: String,
    pub distance: String,
    pub vector_size: usize,
}

/// Lifecycle of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Analyzing,
    Ready,
    Error,
}

/// One user-submitted file, as tracked by the orchestration layer.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub filename: String,
    pub file_path: std::path::PathBuf,
    pub file_size: u64,
    pub status: DocumentStatus,
    pub upload_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    pub total_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_analysis_accepts_legacy_field_names() {
        let json = r#"{
            "page_type": "dosage_table",
            "main_sections": [
                {"title": "PAC", "type": "dosage", "content_preview": "Amoxicilline 1g",
                 "medical_entities": ["amoxicilline"], "confidence": 0.9}
            ]
        }"#;
        let page: PageAnalysis = serde_json::from_str(json).unwrap();
        assert_eq!(page.sections.len(), 1);
        assert_eq!(page.sections[0].text_content, "Amoxicilline 1g");
        assert_eq!(page.sections[0].section_type, "dosage");
        assert!(page.full_text.is_empty());
        assert!(page.key_medical_info.is_empty());
    }

    #[test]
    fn null_fields_fall_back_to_defaults() {
        let json = r#"{
            "page_type": null,
            "full_text": "Amoxicilline 1g x3/j",
            "sections": [
                {"title": "PAC", "type": null, "text_content": null,
                 "medical_entities": null, "confidence": null}
            ],
            "key_medical_info": {"medications": ["amoxicilline"], "dosages": null}
        }"#;
        let page: PageAnalysis = serde_json::from_str(json).unwrap();
        assert_eq!(page.full_text, "Amoxicilline 1g x3/j");
        assert!(page.page_type.is_empty());
        assert_eq!(page.sections[0].title, "PAC");
        assert!(page.sections[0].section_type.is_empty());
        assert!(page.sections[0].medical_entities.is_empty());
        assert_eq!(page.sections[0].confidence, 0.0);
        assert!(page.key_medical_info.dosages.is_empty());
        assert_eq!(page.key_medical_info.medications, ["amoxicilline"]);

        let page: PageAnalysis =
            serde_json::from_str(r#"{"full_text": "x", "sections": null, "key_medical_info": null}"#)
                .unwrap();
        assert!(page.sections.is_empty());
        assert!(page.key_medical_info.is_empty());
    }

    #[test]
    fn entities_include_sections_and_aggregate() {
        let page = PageAnalysis {
            key_medical_info: KeyMedicalInfo {
                medications: vec!["amoxicilline".into()],
                patient_types: vec!["PAC non grave".into()],
                ..Default::default()
            },
            sections: vec![Section {
                medical_entities: vec!["pristinamycine".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let all: Vec<&String> = page.entities().collect();
        assert_eq!(all, ["amoxicilline", "PAC non grave", "pristinamycine"]);
    }

    #[test]
    fn fallback_is_empty_but_typed() {
        let page = PageAnalysis::fallback(3);
        assert_eq!(page.page_index, 3);
        assert_eq!(page.page_type, "unknown");
        assert!(!page.has_text());
        assert!(page.sections.is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&DocumentStatus::Analyzing).unwrap();
        assert_eq!(s, "\"analyzing\"");
    }
}
