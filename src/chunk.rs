//! Page-aware recursive text chunker.
//!
//! Page texts are concatenated behind `=== PAGE n ===` markers and split
//! with a separator hierarchy, most structural first:
//!
//! | Separator | Boundary |
//! |-----------|----------|
//! | `"\n## "` | section title |
//! | `"\n\n"` | blank line |
//! | `"\n=== "` | page / table marker |
//! | `"\n- "` | bullet |
//! | `". "` | sentence |
//! | `" "` | word |
//!
//! The first separator present in a text is used and kept at the head of
//! the piece that follows it. Small pieces are merged greedily up to
//! `chunk_size` characters, carrying up to `chunk_overlap` characters of
//! trailing pieces into the next passage; pieces still too long recurse
//! with the finer separators. Nothing is split inside a word.
//!
//! Each passage is then attributed to a source page (best-effort
//! provenance: the first page whose text contains, or is contained in,
//! the passage; 0 when none matches) and to every known medical entity it
//! mentions.

use serde_json::json;

use crate::config::ChunkingConfig;
use crate::models::{PageAnalysis, Passage, PassageMetadata};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};

pub const SEPARATORS: &[&str] = &["\n## ", "\n\n", "\n=== ", "\n- ", ". ", " "];

/// Recursive separator splitter; lengths are counted in characters.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Trimmed, non-empty chunks in text order.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, finer) = match separators.iter().position(|s| text.contains(s)) {
            Some(i) => (separators[i], &separators[i + 1..]),
            None => (separators[separators.len() - 1], &separators[..0]),
        };

        let mut chunks = Vec::new();
        let mut small: Vec<&str> = Vec::new();

        for piece in split_keep_start(text, separator) {
            if char_len(piece) < self.chunk_size {
                small.push(piece);
                continue;
            }
            if !small.is_empty() {
                chunks.extend(self.merge(&small));
                small.clear();
            }
            if finer.is_empty() {
                push_trimmed(&mut chunks, piece);
            } else {
                chunks.extend(self.split_with(piece, finer));
            }
        }
        if !small.is_empty() {
            chunks.extend(self.merge(&small));
        }
        chunks
    }

    /// Greedy merge of pieces into chunks of at most `chunk_size`, with
    /// trailing pieces up to `chunk_overlap` carried forward.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_trimmed(&mut chunks, &window.iter().copied().collect::<String>());
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }

        if !window.is_empty() {
            push_trimmed(&mut chunks, &window.iter().copied().collect::<String>());
        }
        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Splits at every occurrence of `separator`, keeping it at the start of
/// the following piece. Empty pieces are dropped.
fn split_keep_start<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (at, _) in text.match_indices(separator) {
        if at > start {
            pieces.push(&text[start..at]);
        }
        start = at;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Page texts in order behind `=== PAGE n ===` markers (1-based), blank
/// pages skipped, separated by a blank line.
pub fn concatenate_pages(pages: &[PageAnalysis]) -> String {
    pages
        .iter()
        .filter(|p| p.has_text())
        .map(|p| format!("=== PAGE {} ===\n{}", p.page_index + 1, p.full_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Best-effort source page of a passage; 0 when unresolved.
pub fn attribute_page(chunk: &str, pages: &[PageAnalysis]) -> usize {
    pages
        .iter()
        .filter(|p| p.has_text())
        .find(|p| {
            let text = p.full_text.trim();
            chunk.contains(text) || text.contains(chunk)
        })
        .map(|p| p.page_index)
        .unwrap_or(0)
}

/// Every known entity mentioned in `chunk`, case-insensitively, deduplicated
/// case-insensitively with the first-seen spelling kept.
pub fn attribute_entities(chunk: &str, pages: &[PageAnalysis]) -> Vec<String> {
    let haystack = chunk.to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let mut found = Vec::new();

    for entity in pages.iter().flat_map(|p| p.entities()) {
        let needle = entity.trim().to_lowercase();
        if needle.is_empty() || !haystack.contains(&needle) {
            continue;
        }
        if seen.insert(needle) {
            found.push(entity.trim().to_string());
        }
    }
    found
}

/// Splits the extracted pages of one document into attributed passages.
///
/// Returns no passages when no page has text; the caller treats that as fatal.
pub fn chunk_pages(
    pages: &[PageAnalysis],
    config: &ChunkingConfig,
    progress: &dyn ProgressReporter,
) -> Vec<Passage> {
    let text = concatenate_pages(pages);
    if text.trim().is_empty() {
        progress.report(ProgressEvent::warning(
            Stage::Chunking,
            "no text to chunk",
        ));
        return Vec::new();
    }

    let chunks = RecursiveSplitter::from_config(config).split(&text);
    let total = chunks.len();
    let mut passages = Vec::with_capacity(total);

    for (chunk_index, chunk) in chunks.into_iter().enumerate() {
        let page = attribute_page(&chunk, pages);
        let medical_entities = attribute_entities(&chunk, pages);
        let chunk_size = char_len(&chunk);

        progress.report(
            ProgressEvent::info(
                Stage::Chunking,
                format!(
                    "chunk {}/{}: {} chars, page {}",
                    chunk_index + 1,
                    total,
                    chunk_size,
                    page
                ),
            )
            .with_details(json!({
                "chunk_index": chunk_index,
                "size": chunk_size,
                "page": page,
                "entities": medical_entities,
            })),
        );

        passages.push(Passage {
            text: chunk,
            metadata: PassageMetadata {
                page,
                chunk_size,
                medical_entities,
                chunk_index,
                total_chunks: total,
            },
        });
    }

    let pages_with_text = pages.iter().filter(|p| p.has_text()).count();
    tracing::info!(passages = total, pages = pages_with_text, "document chunked");
    progress.report(
        ProgressEvent::success(
            Stage::Chunking,
            format!("{} passages from {} pages", total, pages_with_text),
        )
        .with_details(json!({ "passages": total, "pages": pages_with_text })),
    );

    passages
}
