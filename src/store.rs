//! Vector store abstraction and the in-memory backend.
//!
//! A store holds named collections. Every collection has a fixed vector
//! size and cosine distance; points are keyed by a numeric id and carry a
//! JSON payload. Upserting an existing id replaces the point.
//!
//! [`InMemoryVectorStore`] keeps everything behind a `RwLock` and searches
//! by brute-force cosine similarity. Contents live for the process lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::CollectionInfo;

pub const DISTANCE_COSINE: &str = "Cosine";

#[derive(Debug, Clone)]
pub struct Point {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Creates an empty collection. Fails if the name is taken.
    async fn create_collection(&self, name: &str, vector_size: usize) -> Result<()>;

    /// Fails if the collection does not exist.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Fails if the collection does not exist.
    async fn collection_info(&self, name: &str) -> Result<CollectionInfo>;

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()>;

    /// Up to `limit` points, most similar first.
    async fn search(&self, name: &str, query: &[f32], limit: usize) -> Result<Vec<ScoredPoint>>;
}

struct Collection {
    vector_size: usize,
    points: BTreeMap<u64, (Vec<f32>, serde_json::Value)>,
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("vector store lock poisoned")
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str, vector_size: usize) -> Result<()> {
        if vector_size == 0 {
            bail!("vector size must be > 0");
        }
        let mut collections = self.collections.write().map_err(poisoned)?;
        if collections.contains_key(name) {
            bail!("collection {} already exists", name);
        }
        collections.insert(
            name.to_string(),
            Collection {
                vector_size,
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("collection {} not found", name))
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let collections = self.collections.read().map_err(poisoned)?;
        let collection = collections
            .get(name)
            .ok_or_else(|| anyhow!("collection {} not found", name))?;
        Ok(CollectionInfo {
            name: name.to_string(),
            points_count: collection.points.len(),
            status: "green".to_string(),
            distance: DISTANCE_COSINE.to_string(),
            vector_size: collection.vector_size,
        })
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| anyhow!("collection {} not found", name))?;

        if let Some(bad) = points
            .iter()
            .find(|p| p.vector.len() != collection.vector_size)
        {
            bail!(
                "point {} has {} dims, collection {} expects {}",
                bad.id,
                bad.vector.len(),
                name,
                collection.vector_size
            );
        }

        for point in points {
            collection
                .points
                .insert(point.id, (point.vector, point.payload));
        }
        Ok(())
    }

    async fn search(&self, name: &str, query: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let collection = collections
            .get(name)
            .ok_or_else(|| anyhow!("collection {} not found", name))?;
        if query.len() != collection.vector_size {
            bail!(
                "query has {} dims, collection {} expects {}",
                query.len(),
                name,
                collection.vector_size
            );
        }

        let mut scored: Vec<ScoredPoint> = collection
            .points
            .iter()
            .map(|(id, (vector, payload))| ScoredPoint {
                id: *id,
                score: cosine_similarity(query, vector),
                payload: payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
