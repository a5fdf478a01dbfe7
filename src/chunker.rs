//! Chunking strategies for splitting document text into retrieval fragments

use crate::document::DocumentClass;
use crate::embedding::{cosine_similarity, mean_vector, Embedder};
use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Strategy tag carried on every fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    FixedSize,
    Semantic,
    SemanticSingle,
    HierarchicalParent,
    HierarchicalChild,
    ExpenseSection,
    ExpenseGeneral,
    ParagraphFallback,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::FixedSize => "fixed_size",
            ChunkType::Semantic => "semantic",
            ChunkType::SemanticSingle => "semantic_single",
            ChunkType::HierarchicalParent => "hierarchical_parent",
            ChunkType::HierarchicalChild => "hierarchical_child",
            ChunkType::ExpenseSection => "expense_section",
            ChunkType::ExpenseGeneral => "expense_general",
            ChunkType::ParagraphFallback => "paragraph_fallback",
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for a document chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_chunk_id: Option<String>,
}

/// Document chunk with content and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Chunk id embeds the document id, the dense index, and an md5 prefix of
/// the content. The hash is for debuggability, not uniqueness enforcement.
fn generate_chunk_id(document_id: &str, chunk_index: usize, content: &str) -> String {
    let digest = format!("{:x}", md5::compute(content.as_bytes()));
    format!("{}_chunk_{}_{}", document_id, chunk_index, &digest[..8])
}

/// Snap a byte index down to the nearest char boundary
fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(
    content: &str,
    document_id: &str,
    chunk_index: usize,
    chunk_type: ChunkType,
    start_char: usize,
    end_char: usize,
) -> Chunk {
    Chunk {
        content: content.to_string(),
        metadata: ChunkMetadata {
            chunk_id: generate_chunk_id(document_id, chunk_index, content),
            document_id: document_id.to_string(),
            chunk_index,
            chunk_type,
            start_char,
            end_char,
            section_title: None,
            parent_chunk_id: None,
        },
    }
}

/// Fixed-size chunking with overlap and optional sentence-boundary snapping
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    pub chunk_size: usize,
    pub overlap: usize,
    pub preserve_sentences: bool,
}

impl FixedSizeChunker {
    pub fn new(chunk_size: usize, overlap: usize, preserve_sentences: bool) -> Self {
        Self {
            chunk_size,
            overlap,
            preserve_sentences,
        }
    }

    pub fn chunk(&self, text: &str, document_id: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let sentence_end = Regex::new(r"[.!?]\s+").expect("static regex");
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut chunk_index = 0usize;

        while start < text.len() {
            let mut end = floor_char_boundary(text, start + self.chunk_size);

            if self.preserve_sentences && end < text.len() {
                // Look for sentence endings within +-100 chars of the target;
                // ties resolve toward the position closest to the target.
                let target = start + self.chunk_size;
                let search_start = floor_char_boundary(
                    text,
                    (target.saturating_sub(100)).max(start + self.chunk_size / 2),
                );
                let search_end = floor_char_boundary(text, (end + 100).min(text.len()));

                if search_start < search_end {
                    let best = sentence_end
                        .find_iter(&text[search_start..search_end])
                        .map(|m| search_start + m.end())
                        .min_by_key(|pos| pos.abs_diff(target));

                    if let Some(best_end) = best {
                        end = best_end.min(text.len());
                    }
                }
            }

            let window = &text[start..end];
            let content = window.trim();

            if !content.is_empty() {
                chunks.push(make_chunk(
                    content,
                    document_id,
                    chunk_index,
                    ChunkType::FixedSize,
                    start,
                    end,
                ));
                chunk_index += 1;
            }

            let next = floor_char_boundary(
                text,
                (start + self.chunk_size.saturating_sub(self.overlap)).max(end),
            );
            if next <= start {
                break;
            }
            start = next;
        }

        chunks
    }
}

/// Semantic chunking based on sentence-embedding similarity
#[derive(Debug, Clone)]
pub struct SemanticChunker {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub similarity_threshold: f32,
}

impl SemanticChunker {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size,
            min_chunk_size: 100,
            similarity_threshold: 0.7,
        }
    }

    pub async fn chunk(
        &self,
        text: &str,
        document_id: &str,
        embedder: Option<&dyn Embedder>,
    ) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let Some(embedder) = embedder else {
            return self.fallback_paragraph_chunking(text, document_id);
        };

        let sentences = split_into_sentences(text);

        if sentences.len() <= 1 {
            return vec![make_chunk(
                text.trim(),
                document_id,
                0,
                ChunkType::SemanticSingle,
                0,
                text.len(),
            )];
        }

        let embeddings = match embedder.embed_batch(&sentences).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Sentence embedding failed ({}), falling back to paragraphs", e);
                return self.fallback_paragraph_chunking(text, document_id);
            }
        };

        self.group_sentences(&sentences, &embeddings, document_id)
    }

    fn group_sentences(
        &self,
        sentences: &[String],
        embeddings: &[Vec<f32>],
        document_id: &str,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut current_sentences = vec![sentences[0].clone()];
        let mut current_embeddings = vec![embeddings[0].clone()];
        let mut chunk_index = 0usize;
        let mut start_char = 0usize;

        for i in 1..sentences.len() {
            let group_mean = mean_vector(&current_embeddings);
            let similarity = cosine_similarity(&group_mean, &embeddings[i]);

            let current_text = current_sentences.join(" ");
            let should_split = similarity < self.similarity_threshold
                || current_text.len() + 1 + sentences[i].len() > self.max_chunk_size;

            if should_split && current_text.len() >= self.min_chunk_size {
                let content = current_text.trim().to_string();
                let end_char = start_char + content.len();

                chunks.push(make_chunk(
                    &content,
                    document_id,
                    chunk_index,
                    ChunkType::Semantic,
                    start_char,
                    end_char,
                ));

                current_sentences = vec![sentences[i].clone()];
                current_embeddings = vec![embeddings[i].clone()];
                chunk_index += 1;
                start_char = end_char + 1;
            } else {
                current_sentences.push(sentences[i].clone());
                current_embeddings.push(embeddings[i].clone());
            }
        }

        if !current_sentences.is_empty() {
            let content = current_sentences.join(" ").trim().to_string();
            if !content.is_empty() {
                let end_char = start_char + content.len();
                chunks.push(make_chunk(
                    &content,
                    document_id,
                    chunk_index,
                    ChunkType::Semantic,
                    start_char,
                    end_char,
                ));
            }
        }

        chunks
    }

    fn fallback_paragraph_chunking(&self, text: &str, document_id: &str) -> Vec<Chunk> {
        let paragraphs: Vec<&str> = text
            .split("\n\n")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();

        if paragraphs.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut chunk_index = 0usize;
        let mut current = String::new();
        let mut start_char = 0usize;

        for paragraph in paragraphs {
            if current.len() + paragraph.len() > self.max_chunk_size && !current.is_empty() {
                let content = current.trim().to_string();
                let end_char = start_char + content.len();

                chunks.push(make_chunk(
                    &content,
                    document_id,
                    chunk_index,
                    ChunkType::ParagraphFallback,
                    start_char,
                    end_char,
                ));

                current = paragraph.to_string();
                chunk_index += 1;
                start_char = end_char + 2;
            } else if current.is_empty() {
                current = paragraph.to_string();
            } else {
                current.push_str("\n\n");
                current.push_str(paragraph);
            }
        }

        if !current.trim().is_empty() {
            let content = current.trim().to_string();
            let end_char = start_char + content.len();
            chunks.push(make_chunk(
                &content,
                document_id,
                chunk_index,
                ChunkType::ParagraphFallback,
                start_char,
                end_char,
            ));
        }

        chunks
    }
}

/// Split text into sentences at terminators followed by whitespace
fn split_into_sentences(text: &str) -> Vec<String> {
    let boundary = Regex::new(r"[.!?]\s+").expect("static regex");
    let mut sentences = Vec::new();
    let mut last = 0usize;

    for m in boundary.find_iter(text) {
        // Keep the terminator with the sentence; it is a single ASCII byte.
        let cut = m.start() + 1;
        let sentence = text[last..cut].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        last = m.end();
    }

    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }

    sentences
}

/// Hierarchical chunking producing coarse parents and fine children
#[derive(Debug, Clone)]
pub struct HierarchicalChunker {
    pub parent_chunk_size: usize,
    pub child_chunk_size: usize,
    pub overlap: usize,
}

impl HierarchicalChunker {
    pub fn new(parent_chunk_size: usize, child_chunk_size: usize) -> Self {
        Self {
            parent_chunk_size,
            child_chunk_size,
            overlap: 100,
        }
    }

    pub fn chunk(&self, text: &str, document_id: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let parent_chunker = FixedSizeChunker::new(self.parent_chunk_size, self.overlap, true);
        let child_chunker = FixedSizeChunker::new(self.child_chunk_size, self.overlap / 2, true);

        let mut all_chunks: Vec<Chunk> = Vec::new();

        for mut parent in parent_chunker.chunk(text, document_id) {
            let parent_index = all_chunks.len();
            parent.metadata.chunk_index = parent_index;
            parent.metadata.chunk_type = ChunkType::HierarchicalParent;
            parent.metadata.chunk_id =
                generate_chunk_id(document_id, parent_index, &parent.content);
            let parent_id = parent.metadata.chunk_id.clone();
            let parent_start = parent.metadata.start_char;
            let parent_content = parent.content.clone();
            all_chunks.push(parent);

            for mut child in child_chunker.chunk(&parent_content, document_id) {
                let child_index = all_chunks.len();
                child.metadata.chunk_type = ChunkType::HierarchicalChild;
                child.metadata.parent_chunk_id = Some(parent_id.clone());
                child.metadata.chunk_index = child_index;
                child.metadata.chunk_id =
                    generate_chunk_id(document_id, child_index, &child.content);
                // Child offsets are relative to the parent slice.
                child.metadata.start_char += parent_start;
                child.metadata.end_char += parent_start;
                all_chunks.push(child);
            }
        }

        all_chunks
    }
}

struct SectionPattern {
    name: &'static str,
    start: Regex,
    /// When set, the span runs from the start match to (not including) the
    /// first terminator match; otherwise the span is the start match itself.
    terminator: Option<Regex>,
}

/// Specialised chunking for expense documents: pattern-matched sections,
/// with leftovers routed through fixed-size chunking.
pub struct ExpenseSectionChunker {
    patterns: Vec<SectionPattern>,
}

impl Default for ExpenseSectionChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpenseSectionChunker {
    pub fn new() -> Self {
        let p = |s: &str| Regex::new(s).expect("static regex");
        let patterns = vec![
            SectionPattern {
                name: "header",
                start: p(r"(?im)(invoice|receipt|bill|statement).*$"),
                terminator: None,
            },
            SectionPattern {
                name: "vendor",
                start: p(r"(?im)(vendor|merchant|company|business).*$"),
                terminator: None,
            },
            SectionPattern {
                name: "amount",
                start: p(r"(?is)(total|amount|sum|price|cost).*?(\$|USD|\d+\.\d{2})"),
                terminator: None,
            },
            SectionPattern {
                name: "date",
                start: p(r"(?is)(date|issued|transaction).*?(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})"),
                terminator: None,
            },
            SectionPattern {
                name: "items",
                start: p(r"(?i)(item|description|product|service)"),
                terminator: Some(p(r"(?i)\n(total|amount|tax)")),
            },
            SectionPattern {
                name: "tax",
                start: p(r"(?is)(tax|vat|gst).*?(\$|USD|\d+\.\d{2})"),
                terminator: None,
            },
            SectionPattern {
                name: "footer",
                start: p(r"(?ims)(thank you|visit again|policy|terms).*?$"),
                terminator: None,
            },
        ];

        Self { patterns }
    }

    pub fn chunk(&self, text: &str, document_id: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut chunk_index = 0usize;
        let mut covered = vec![false; text.len()];

        for pattern in &self.patterns {
            for m in pattern.start.find_iter(text) {
                let start = m.start();
                let end = match &pattern.terminator {
                    Some(term) => term
                        .find(&text[start..])
                        .map(|t| start + t.start())
                        .unwrap_or(text.len()),
                    None => m.end(),
                };

                // Spans may not overlap; skip anything already covered.
                if covered[start..end].iter().any(|&c| c) {
                    continue;
                }

                let section_text = text[start..end].trim();
                if section_text.len() > 10 {
                    let mut chunk = make_chunk(
                        section_text,
                        document_id,
                        chunk_index,
                        ChunkType::ExpenseSection,
                        start,
                        end,
                    );
                    chunk.metadata.section_title = Some(pattern.name.to_string());
                    chunks.push(chunk);
                    chunk_index += 1;

                    for flag in covered[start..end].iter_mut() {
                        *flag = true;
                    }
                }
            }
        }

        // Everything not matched by a section goes through the fixed-size
        // strategy, tagged as general expense content.
        let remaining = uncovered_text(text, &covered);
        if !remaining.trim().is_empty() {
            let fixed = FixedSizeChunker::new(500, 50, true);
            for mut chunk in fixed.chunk(&remaining, document_id) {
                chunk.metadata.chunk_type = ChunkType::ExpenseGeneral;
                chunk.metadata.chunk_index = chunk_index;
                chunk.metadata.chunk_id =
                    generate_chunk_id(document_id, chunk_index, &chunk.content);
                chunks.push(chunk);
                chunk_index += 1;
            }
        }

        chunks
    }
}

fn uncovered_text(text: &str, covered: &[bool]) -> String {
    let mut remaining = String::new();
    let mut i = 0usize;

    while i < text.len() {
        if covered[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < text.len() && !covered[i] {
            i += 1;
        }
        // Region boundaries coincide with regex match boundaries, which are
        // always char boundaries.
        remaining.push_str(&text[start..i]);
    }

    remaining
}

/// Routes documents to a chunking strategy by document class
pub struct ChunkRouter {
    embedder: Option<Arc<dyn Embedder>>,
}

impl ChunkRouter {
    pub fn new(embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { embedder }
    }

    /// Chunk a document using the strategy for its class
    pub async fn chunk_document(
        &self,
        text: &str,
        document_id: &str,
        document_class: DocumentClass,
    ) -> Result<Vec<Chunk>> {
        info!(
            "Chunking document {} with {} strategy",
            document_id,
            self.strategy_name(document_class)
        );

        let embedder = self.embedder.as_deref();

        let chunks = match document_class {
            DocumentClass::ExpenseDocument => {
                ExpenseSectionChunker::new().chunk(text, document_id)
            }
            DocumentClass::FinancialStatement => {
                SemanticChunker::new(1000)
                    .chunk(text, document_id, embedder)
                    .await
            }
            DocumentClass::Contract => HierarchicalChunker::new(1500, 400).chunk(text, document_id),
            DocumentClass::Report => {
                SemanticChunker::new(1200)
                    .chunk(text, document_id, embedder)
                    .await
            }
            DocumentClass::GeneralDocument => {
                FixedSizeChunker::new(800, 100, true).chunk(text, document_id)
            }
        };

        debug!("Created {} chunks for document {}", chunks.len(), document_id);
        Ok(chunks)
    }

    fn strategy_name(&self, class: DocumentClass) -> &'static str {
        match class {
            DocumentClass::ExpenseDocument => "expense_section",
            DocumentClass::FinancialStatement | DocumentClass::Report => "semantic",
            DocumentClass::Contract => "hierarchical",
            DocumentClass::GeneralDocument => "fixed_size",
        }
    }

    /// Available chunking strategies by document class
    pub fn available_strategies(&self) -> Vec<&'static str> {
        vec![
            "expense_section",
            "semantic",
            "hierarchical",
            "fixed_size",
        ]
    }

    /// Health check: run every strategy against a small sample
    pub async fn health_check(&self) -> serde_json::Value {
        let sample = "This is a sample document for verifying chunking. It contains \
                      multiple sentences so the strategies have something to split.";
        let mut healthy = true;
        let mut strategies = serde_json::Map::new();

        for class in [
            DocumentClass::ExpenseDocument,
            DocumentClass::FinancialStatement,
            DocumentClass::Contract,
            DocumentClass::Report,
            DocumentClass::GeneralDocument,
        ] {
            match self.chunk_document(sample, "health_check_doc", class).await {
                Ok(chunks) => {
                    strategies.insert(
                        class.as_str().to_string(),
                        serde_json::json!({
                            "status": "healthy",
                            "chunks_created": chunks.len(),
                        }),
                    );
                }
                Err(e) => {
                    healthy = false;
                    strategies.insert(
                        class.as_str().to_string(),
                        serde_json::json!({"status": "unhealthy", "error": e.to_string()}),
                    );
                }
            }
        }

        serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "strategies": strategies,
            "semantic_embeddings_available": self.embedder.is_some(),
        })
    }
}
