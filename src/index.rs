//! Per-document collection lifecycle.
//!
//! Each document gets its own collection, `medical_doc_<document_id>`,
//! whose vector size always matches the configured embedding model.
//! [`IndexManager::ensure_collection`] heals a mismatch by dropping and
//! recreating the collection empty; the caller then re-upserts.
//!
//! Points use sequential ids from 0. Re-indexing a document with fewer
//! passages than before leaves the trailing old points in place unless the
//! collection is reset first.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;

use crate::embedding::{embedding_dimension, EmbeddingProvider};
use crate::models::{CollectionInfo, Passage};
use crate::store::{Point, VectorStore};

pub const COLLECTION_PREFIX: &str = "medical_doc_";

pub fn collection_name(document_id: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, document_id)
}

pub struct IndexManager {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    /// Vector size of the configured embedding model.
    pub fn dimension(&self) -> usize {
        embedding_dimension(self.embedder.model_name())
    }

    /// Makes sure `name` exists with the configured dimensionality.
    ///
    /// Returns `false` (and logs) when the store could not be brought into
    /// that state; never errors.
    pub async fn ensure_collection(&self, name: &str) -> bool {
        let dims = self.dimension();

        let exists = match self.store.list_collections().await {
            Ok(names) => names.iter().any(|n| n == name),
            Err(e) => {
                tracing::error!(collection = name, error = %e, "cannot list collections");
                return false;
            }
        };

        if exists {
            match self.store.collection_info(name).await {
                Ok(info) if info.vector_size == dims => {
                    tracing::debug!(collection = name, dims, "collection up to date");
                    return true;
                }
                Ok(info) => {
                    tracing::warn!(
                        collection = name,
                        stored = info.vector_size,
                        expected = dims,
                        "dimension mismatch, recreating collection"
                    );
                    if let Err(e) = self.store.delete_collection(name).await {
                        tracing::error!(collection = name, error = %e, "cannot delete collection");
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(collection = name, error = %e, "cannot describe collection, recreating");
                    if let Err(e) = self.store.delete_collection(name).await {
                        tracing::debug!(collection = name, error = %e, "delete before recreate failed");
                    }
                }
            }
        }

        match self.store.create_collection(name, dims).await {
            Ok(()) => {
                tracing::info!(collection = name, dims, "collection created");
                true
            }
            Err(e) => {
                tracing::error!(collection = name, error = %e, "cannot create collection");
                false
            }
        }
    }

    /// Drops `name` (if present) and creates it empty.
    pub async fn reset_collection(&self, name: &str) -> bool {
        if let Err(e) = self.store.delete_collection(name).await {
            tracing::debug!(collection = name, error = %e, "nothing to reset");
        }
        self.ensure_collection(name).await
    }

    /// Embeds every passage in one batch and upserts them under ids `0..n`.
    pub async fn upsert(&self, name: &str, passages: &[Passage]) -> Result<usize> {
        if passages.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != passages.len() {
            bail!(
                "embedding returned {} vectors for {} passages",
                vectors.len(),
                passages.len()
            );
        }

        let points: Vec<Point> = passages
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (passage, vector))| Point {
                id: i as u64,
                vector,
                payload: json!({
                    "text": passage.text,
                    "metadata": passage.metadata,
                }),
            })
            .collect();

        let count = points.len();
        self.store.upsert(name, points).await?;
        tracing::info!(collection = name, points = count, "passages indexed");
        Ok(count)
    }

    pub async fn info(&self, name: &str) -> Option<CollectionInfo> {
        match self.store.collection_info(name).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(collection = name, error = %e, "collection info unavailable");
                None
            }
        }
    }

    pub async fn delete(&self, name: &str) -> bool {
        match self.store.delete_collection(name).await {
            Ok(()) => {
                tracing::info!(collection = name, "collection deleted");
                true
            }
            Err(e) => {
                tracing::warn!(collection = name, error = %e, "cannot delete collection");
                false
            }
        }
    }

    /// Removes every collection in the store; returns how many went away.
    pub async fn delete_all(&self) -> usize {
        let names = match self.store.list_collections().await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(error = %e, "cannot list collections");
                return 0;
            }
        };
        let mut deleted = 0;
        for name in names {
            if self.delete(&name).await {
                deleted += 1;
            }
        }
        deleted
    }
}
