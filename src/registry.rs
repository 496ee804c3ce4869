//! In-memory document registry.
//!
//! Tracks every uploaded file and its status for the lifetime of the
//! process:
//!
//! ```text
//! uploaded ──▶ analyzing ──▶ ready
//!                  │  ▲         │
//!                  ▼  └─────────┘ (re-analysis)
//!                error
//! ```
//!
//! Only one analysis per document may run at a time; a second request
//! while the first is running is rejected.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{DocumentRecord, DocumentStatus};

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("document {0} not found")]
    NotFound(String),

    #[error("document {0} is already being analyzed")]
    AlreadyAnalyzing(String),

    #[error("document {0} is not ready (status: {1:?})")]
    NotReady(String, DocumentStatus),
}

impl DocumentRecord {
    pub fn new(document_id: String, filename: String, file_path: PathBuf, file_size: u64) -> Self {
        Self {
            document_id,
            filename,
            file_path,
            file_size,
            status: DocumentStatus::Uploaded,
            upload_time: Utc::now(),
            collection_name: None,
            total_chunks: 0,
            analysis_time: None,
            error: None,
        }
    }
}

/// Keeps only the final path component and replaces characters that are
/// unsafe in file names.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    if cleaned.trim().is_empty() || cleaned == "." || cleaned == ".." {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Storage path for an upload: `<dir>/<document_id>_<filename>`.
pub fn upload_path(dir: &Path, document_id: &str, filename: &str) -> PathBuf {
    dir.join(format!("{}_{}", document_id, sanitize_filename(filename)))
}

#[derive(Default)]
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, DocumentRecord>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DocumentRecord) {
        self.documents
            .write()
            .await
            .insert(record.document_id.clone(), record);
    }

    pub async fn get(&self, document_id: &str) -> Option<DocumentRecord> {
        self.documents.read().await.get(document_id).cloned()
    }

    /// All documents, oldest upload first.
    pub async fn list(&self) -> Vec<DocumentRecord> {
        let mut docs: Vec<DocumentRecord> = self.documents.read().await.values().cloned().collect();
        docs.sort_by(|a, b| {
            a.upload_time
                .cmp(&b.upload_time)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        docs
    }

    /// Moves a document to `analyzing`, unless it is already there.
    pub async fn begin_analysis(&self, document_id: &str) -> Result<DocumentRecord, RegistryError> {
        let mut documents = self.documents.write().await;
        let record = documents
            .get_mut(document_id)
            .ok_or_else(|| RegistryError::NotFound(document_id.to_string()))?;
        if record.status == DocumentStatus::Analyzing {
            return Err(RegistryError::AlreadyAnalyzing(document_id.to_string()));
        }
        record.status = DocumentStatus::Analyzing;
        record.error = None;
        Ok(record.clone())
    }

    pub async fn mark_ready(&self, document_id: &str, collection_name: String, total_chunks: usize) {
        if let Some(record) = self.documents.write().await.get_mut(document_id) {
            record.status = DocumentStatus::Ready;
            record.collection_name = Some(collection_name);
            record.total_chunks = total_chunks;
            record.analysis_time = Some(Utc::now());
            record.error = None;
        }
    }

    pub async fn mark_error(&self, document_id: &str, message: String) {
        if let Some(record) = self.documents.write().await.get_mut(document_id) {
            record.status = DocumentStatus::Error;
            record.error = Some(message);
        }
    }

    /// The record, if the document exists and is `ready`.
    pub async fn require_ready(&self, document_id: &str) -> Result<DocumentRecord, RegistryError> {
        let record = self
            .get(document_id)
            .await
            .ok_or_else(|| RegistryError::NotFound(document_id.to_string()))?;
        if record.status != DocumentStatus::Ready {
            return Err(RegistryError::NotReady(document_id.to_string(), record.status));
        }
        Ok(record)
    }

    pub async fn remove(&self, document_id: &str) -> Option<DocumentRecord> {
        self.documents.write().await.remove(document_id)
    }

    /// Removes a document unless an analysis is writing its collection.
    pub async fn remove_idle(&self, document_id: &str) -> Result<DocumentRecord, RegistryError> {
        let mut documents = self.documents.write().await;
        match documents.get(document_id) {
            None => Err(RegistryError::NotFound(document_id.to_string())),
            Some(record) if record.status == DocumentStatus::Analyzing => {
                Err(RegistryError::AlreadyAnalyzing(document_id.to_string()))
            }
            Some(_) => documents
                .remove(document_id)
                .ok_or_else(|| RegistryError::NotFound(document_id.to_string())),
        }
    }

    /// Empties the registry, returning what it held.
    pub async fn clear(&self) -> Vec<DocumentRecord> {
        self.documents
            .write()
            .await
            .drain()
            .map(|(_, record)| record)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> DocumentRecord {
        DocumentRecord::new(
            id.to_string(),
            "reco.pdf".to_string(),
            PathBuf::from(format!("uploads/{}_reco.pdf", id)),
            1024,
        )
    }

    #[tokio::test]
    async fn lifecycle_uploaded_analyzing_ready() {
        let registry = DocumentRegistry::new();
        registry.insert(record("d1")).await;
        assert_eq!(registry.get("d1").await.unwrap().status, DocumentStatus::Uploaded);

        let started = registry.begin_analysis("d1").await.unwrap();
        assert_eq!(started.status, DocumentStatus::Analyzing);
        assert_eq!(
            registry.begin_analysis("d1").await.unwrap_err(),
            RegistryError::AlreadyAnalyzing("d1".into())
        );

        registry
            .mark_ready("d1", "medical_doc_d1".into(), 12)
            .await;
        let ready = registry.require_ready("d1").await.unwrap();
        assert_eq!(ready.total_chunks, 12);
        assert_eq!(ready.collection_name.as_deref(), Some("medical_doc_d1"));
        assert!(ready.analysis_time.is_some());
    }

    #[tokio::test]
    async fn error_then_reanalysis_clears_message() {
        let registry = DocumentRegistry::new();
        registry.insert(record("d1")).await;
        registry.begin_analysis("d1").await.unwrap();
        registry.mark_error("d1", "no content".into()).await;

        let failed = registry.get("d1").await.unwrap();
        assert_eq!(failed.status, DocumentStatus::Error);
        assert!(matches!(
            registry.require_ready("d1").await,
            Err(RegistryError::NotReady(_, DocumentStatus::Error))
        ));

        let again = registry.begin_analysis("d1").await.unwrap();
        assert!(again.error.is_none());
    }

    #[tokio::test]
    async fn unknown_document() {
        let registry = DocumentRegistry::new();
        assert_eq!(
            registry.begin_analysis("nope").await.unwrap_err(),
            RegistryError::NotFound("nope".into())
        );
        assert!(registry.remove("nope").await.is_none());
    }

    #[tokio::test]
    async fn document_under_analysis_cannot_be_removed() {
        let registry = DocumentRegistry::new();
        registry.insert(record("d1")).await;
        registry.begin_analysis("d1").await.unwrap();

        assert_eq!(
            registry.remove_idle("d1").await.unwrap_err(),
            RegistryError::AlreadyAnalyzing("d1".into())
        );
        assert!(registry.get("d1").await.is_some());

        registry.mark_ready("d1", "medical_doc_d1".into(), 1).await;
        assert_eq!(registry.remove_idle("d1").await.unwrap().document_id, "d1");
        assert_eq!(
            registry.remove_idle("d1").await.unwrap_err(),
            RegistryError::NotFound("d1".into())
        );
    }

    #[tokio::test]
    async fn clear_returns_everything() {
        let registry = DocumentRegistry::new();
        registry.insert(record("a")).await;
        registry.insert(record("b")).await;
        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.clear().await.len(), 2);
        assert!(registry.list().await.is_empty());
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("reco: PAC?.pdf"), "reco_ PAC_.pdf");
        assert_eq!(sanitize_filename(""), "document");
        assert_eq!(
            upload_path(Path::new("uploads"), "abc", "reco.pdf"),
            PathBuf::from("uploads/abc_reco.pdf")
        );
    }
}
