//! ============================================================================
//! Embedding Space - Local TF-IDF vectors for semantic memory search
//! ============================================================================
//! Text is embedded against an append-only vocabulary that grows as new words
//! are seen. Vectors computed at different vocabulary sizes stay comparable
//! because `cosine_similarity` zero-pads the shorter one.
//!
//! The vocabulary is persisted by the memory database: every change is
//! tracked here and drained into the same write transaction as the record
//! that caused it.
//! ============================================================================

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Shortest token kept by the tokenizer
pub const MIN_TOKEN_LEN: usize = 3;

/// Norms below this are treated as zero
const NORM_EPSILON: f32 = 1e-9;

/// Common words carrying no retrieval signal
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "will", "what",
    "when", "your", "which", "their", "there", "been", "were", "into", "than", "then", "them",
    "these", "some", "would", "could", "should", "about", "just", "also", "its", "how", "who",
    "did", "does", "get", "got", "may", "very", "more", "most", "such", "only", "own", "same",
    "too", "each", "other", "over", "under", "again", "here", "where", "why", "both", "few",
];

/// Persisted per-term state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermRecord {
    /// Position of the term in every vector
    pub index: u32,
    /// Number of embedded documents containing the term
    pub doc_freq: u32,
}

/// Vocabulary changes not yet written to disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VocabularyDelta {
    pub terms: Vec<(String, TermRecord)>,
    /// New document count, if it changed
    pub doc_count: Option<u64>,
}

impl VocabularyDelta {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.doc_count.is_none()
    }
}

#[derive(Debug, Default)]
struct Vocabulary {
    index: HashMap<String, u32>,
    terms: Vec<String>,
    doc_freq: Vec<u32>,
    doc_count: u64,
    dirty_terms: HashSet<String>,
    doc_count_dirty: bool,
}

/// Process-wide embedding state
#[derive(Debug, Default)]
pub struct EmbeddingSpace {
    vocab: RwLock<Vocabulary>,
}

impl EmbeddingSpace {
    /// Empty vocabulary
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted terms. Indices must form the range `0..terms.len()`.
    pub fn from_terms(mut terms: Vec<(String, TermRecord)>, doc_count: u64) -> Result<Self> {
        terms.sort_by_key(|(_, record)| record.index);

        let mut vocab = Vocabulary {
            doc_count,
            ..Vocabulary::default()
        };
        for (position, (term, record)) in terms.into_iter().enumerate() {
            if record.index as usize != position {
                return Err(anyhow!(
                    "Corrupt vocabulary: term '{}' has index {} but expected {}",
                    term,
                    record.index,
                    position
                ));
            }
            vocab.index.insert(term.clone(), record.index);
            vocab.terms.push(term);
            vocab.doc_freq.push(record.doc_freq);
        }

        debug!(
            "Loaded vocabulary: {} terms over {} documents",
            vocab.terms.len(),
            vocab.doc_count
        );

        Ok(Self {
            vocab: RwLock::new(vocab),
        })
    }

    /// Embed `text`, growing the vocabulary and document frequencies as a side effect
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut guard = self.vocab.write();
        let vocab = &mut *guard;

        if tokens.is_empty() {
            return vec![0.0; vocab.terms.len()];
        }

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }

        vocab.doc_count += 1;
        vocab.doc_count_dirty = true;
        for term in counts.keys() {
            let idx = match vocab.index.get(*term) {
                Some(idx) => *idx as usize,
                None => {
                    let idx = vocab.terms.len();
                    vocab.index.insert(term.to_string(), idx as u32);
                    vocab.terms.push(term.to_string());
                    vocab.doc_freq.push(0);
                    idx
                }
            };
            vocab.doc_freq[idx] += 1;
            vocab.dirty_terms.insert(term.to_string());
        }

        let n = vocab.doc_count as f32;
        let total = tokens.len() as f32;
        let mut vector = vec![0.0f32; vocab.terms.len()];
        for (term, count) in &counts {
            let idx = vocab.index[*term] as usize;
            let df = vocab.doc_freq[idx] as f32;
            let idf = ((n + 1.0) / (df + 1.0)).ln() + 1.0;
            vector[idx] = (*count as f32 / total) * idf;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > NORM_EPSILON {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocab.read().terms.len()
    }

    pub fn document_count(&self) -> u64 {
        self.vocab.read().doc_count
    }

    /// Take every change made since the last drain
    pub fn drain_changes(&self) -> VocabularyDelta {
        let mut guard = self.vocab.write();
        let vocab = &mut *guard;
        let dirty: Vec<String> = vocab.dirty_terms.drain().collect();

        let mut terms = Vec::with_capacity(dirty.len());
        for term in dirty {
            if let Some(idx) = vocab.index.get(&term).copied() {
                let doc_freq = vocab.doc_freq[idx as usize];
                terms.push((term, TermRecord { index: idx, doc_freq }));
            }
        }

        let doc_count = if vocab.doc_count_dirty {
            vocab.doc_count_dirty = false;
            Some(vocab.doc_count)
        } else {
            None
        };

        VocabularyDelta { terms, doc_count }
    }

    /// Mark a drained delta as unwritten again after a failed commit
    pub fn requeue(&self, delta: &VocabularyDelta) {
        let mut vocab = self.vocab.write();
        for (term, _) in &delta.terms {
            vocab.dirty_terms.insert(term.clone());
        }
        if delta.doc_count.is_some() {
            vocab.doc_count_dirty = true;
        }
    }
}

/// Lowercase alphanumeric words of at least three characters, minus stop words
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= MIN_TOKEN_LEN)
        .filter(|word| !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Cosine similarity in [-1, 1]. The shorter vector is zero-padded, and a zero
/// vector scores 0 against everything (itself included).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a < NORM_EPSILON || norm_b < NORM_EPSILON {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
