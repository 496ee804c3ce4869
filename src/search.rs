//! Semantic retrieval over one document's collection.

use std::sync::Arc;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::models::ScoredPassage;
use crate::store::VectorStore;

pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Retriever {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    /// The `k` passages closest to `query`, most similar first.
    ///
    /// Empty on a blank query and on any embedding or store error.
    pub async fn search(&self, query: &str, collection: &str, k: usize) -> Vec<ScoredPassage> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }

        let vector = match embed_query(self.embedder.as_ref(), query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(collection, error = %e, "query embedding failed");
                return Vec::new();
            }
        };

        let hits = match self.store.search(collection, &vector, k).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!(collection, error = %e, "vector search failed");
                return Vec::new();
            }
        };

        let passages: Vec<ScoredPassage> = hits
            .into_iter()
            .map(|hit| ScoredPassage {
                content: hit
                    .payload
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata: hit
                    .payload
                    .get("metadata")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                similarity_score: hit.score,
            })
            .collect();

        tracing::info!(collection, k, results = passages.len(), "retrieval done");
        passages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddings;
    use crate::index::IndexManager;
    use crate::models::{Passage, PassageMetadata};
    use crate::store::InMemoryVectorStore;

    fn passages(texts: &[&str]) -> Vec<Passage> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Passage {
                text: t.to_string(),
                metadata: PassageMetadata {
                    page: i,
                    chunk_size: t.chars().count(),
                    medical_entities: vec![],
                    chunk_index: i,
                    total_chunks: texts.len(),
                },
            })
            .collect()
    }

    async fn indexed(texts: &[&str]) -> Retriever {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HashEmbeddings::new("text-embedding-3-large"));
        let index = IndexManager::new(store.clone(), embedder.clone());
        index.ensure_collection("c").await;
        index.upsert("c", &passages(texts)).await.unwrap();
        Retriever::new(store, embedder)
    }

    #[tokio::test]
    async fn results_are_sorted_by_score() {
        let retriever = indexed(&[
            "radiographie du thorax",
            "amoxicilline posologie adulte",
            "posologie pediatrique",
            "amoxicilline",
        ])
        .await;

        let results = retriever.search("posologie amoxicilline", "c", 6).await;
        assert_eq!(results.len(), 4);
        for pair in results.windows(2) {
            assert!(pair[0].similarity_score >= pair[1].similarity_score);
        }
        assert_eq!(results[0].content, "amoxicilline posologie adulte");
        assert_eq!(results[0].metadata["chunk_index"], 1);
    }

    #[tokio::test]
    async fn k_limits_results() {
        let retriever = indexed(&["a", "b", "c"]).await;
        assert_eq!(retriever.search("a", "c", 2).await.len(), 2);
    }

    #[tokio::test]
    async fn missing_collection_is_empty() {
        let retriever = indexed(&["a"]).await;
        assert!(retriever.search("a", "nope", 6).await.is_empty());
    }

    #[tokio::test]
    async fn blank_query_is_empty() {
        let retriever = indexed(&["a"]).await;
        assert!(retriever.search("   ", "c", 6).await.is_empty());
    }
}
