//! # Medical RAG
//!
//! Vision-driven ingestion and retrieval-augmented question answering over
//! medical documents (clinical guidelines, dosage tables, protocols).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌─────────┐   ┌──────────────┐
//! │  Rasterize   │──▶│  Vision   │──▶│  Chunk  │──▶│ Embed+Upsert │
//! │ PDF/DOCX/img │   │ per page  │   │ + attrib│   │ (collection) │
//! └──────────────┘   └───────────┘   └─────────┘   └──────┬───────┘
//!                                                         │
//!                    ┌──────────┐   ┌──────────┐          │
//!      question ───▶ │ Retrieve │──▶│  Answer  │ ◀────────┘
//!                    │  top-k   │   │ (stream) │
//!                    └──────────┘   └──────────┘
//! ```
//!
//! Both pipelines run over an explicit [`pipeline::PipelineContext`];
//! the [`server`] and the `medrag` binary are thin shells around it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`outcome`] | Complete vs. degraded results |
//! | [`error`] | Pipeline errors |
//! | [`progress`] | Progress events and reporters |
//! | [`office`] | DOCX to PDF normalization |
//! | [`rasterize`] | Page rendering (PDFium) |
//! | [`vision`] | Vision-model page extraction |
//! | [`chunk`] | Recursive splitting and page attribution |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store abstraction, in-memory implementation |
//! | [`index`] | Per-document collections |
//! | [`search`] | Semantic retrieval |
//! | [`answer`] | Grounded answer generation |
//! | [`pipeline`] | End-to-end operations |
//! | [`registry`] | Uploaded document tracking |
//! | [`server`] | HTTP + WebSocket API |

pub mod answer;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod office;
pub mod outcome;
pub mod pipeline;
pub mod progress;
pub mod rasterize;
pub mod registry;
pub mod search;
pub mod server;
pub mod store;
pub mod vision;
