//! ============================================================================
//! Database Types - Reports produced by the memory database
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Row counts across every table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    pub turns: usize,
    pub failed_turns: usize,
    pub chunks: usize,
    /// Chunks that carry an embedding and are therefore recallable
    pub embedded_chunks: usize,
    pub skills: usize,
    pub browsing_facts: usize,
    pub vocabulary_terms: usize,
    pub documents_embedded: u64,
}

/// Rows removed (or, for a dry run, eligible for removal) by a pruning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub chunks: usize,
    pub turns: usize,
    pub browsing_facts: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.chunks + self.turns + self.browsing_facts
    }
}
