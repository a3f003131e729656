//! ============================================================================
//! Retrieval Context - Prompt shaping for recalled memories and skills
//! ============================================================================
//! Decides how much of the memory store reaches the LLM: how many memories,
//! how many skills, and how long each rendered item may be. Storage lives in
//! `MemoryStore`; this module only formats.
//! ============================================================================

use super::types::{LearnedSkill, MemoryChunk};

pub const DEFAULT_MEMORY_LIMIT: usize = 5;
pub const DEFAULT_SKILL_LIMIT: usize = 10;
pub const DEFAULT_MAX_ITEM_CHARS: usize = 300;

/// Prompt-shaping policy for the context block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalContextBuilder {
    /// Memories recalled per query
    pub memory_limit: usize,
    /// Skills loaded per query, most successful first
    pub skill_limit: usize,
    /// Each rendered item is cut to this many characters
    pub max_item_chars: usize,
}

impl Default for RetrievalContextBuilder {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            skill_limit: DEFAULT_SKILL_LIMIT,
            max_item_chars: DEFAULT_MAX_ITEM_CHARS,
        }
    }
}

impl RetrievalContextBuilder {
    /// Render the context block. Returns an empty string when there is
    /// nothing to inject, never a bare header.
    pub fn render(&self, memories: &[MemoryChunk], skills: &[LearnedSkill]) -> String {
        let mut sections = Vec::new();

        if !memories.is_empty() {
            let mut formatted = String::from("Relevant memories:\n");
            for memory in memories.iter().take(self.memory_limit) {
                formatted.push_str(&format!("- {}\n", self.truncate(&memory.content)));
            }
            sections.push(formatted);
        }

        if !skills.is_empty() {
            let mut formatted = String::from("Learned skills:\n");
            for skill in skills.iter().take(self.skill_limit) {
                let line = format!("{}: {} How to use: {}", skill.name, skill.description, skill.how_to_use);
                formatted.push_str(&format!("- {}\n", self.truncate(&line)));
            }
            sections.push(formatted);
        }

        sections.join("\n").trim_end().to_string()
    }

    fn truncate(&self, text: &str) -> String {
        let flat = text.replace('\n', " ");
        if flat.chars().count() <= self.max_item_chars {
            return flat;
        }
        // The ellipsis counts toward the limit
        let mut cut: String = flat.chars().take(self.max_item_chars.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
