//! ============================================================================
//! Memory Module - Persistent, local semantic memory for the agent
//! ============================================================================
//! Everything the agent remembers lives on the device: conversation turns,
//! TF-IDF embedded memory chunks, learned skills and browsing facts, all in
//! one redb file.
//!
//! ## Architecture
//! ```text
//! User Message → Embed → Scan Chunks → Top-k Memories ┐
//!                                     Top Skills ───┴→ Context Block
//!                                                           ↓
//!                                               [Context] + [User Message]
//!                                                           ↓
//!                                                       LLM rounds
//!                                                           ↓
//!                                        remember(turn + chunk, one commit)
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use pocket_core::memory::MemoryStore;
//!
//! let store = MemoryStore::open(None)?;
//! store.remember("open the camera", "Camera opened", &["launch_app".into()], true)?;
//! let context = store.get_relevant_context("take a photo")?;
//! ```
//! ============================================================================

pub mod context;
pub mod embeddings;
mod store;
pub mod types;

use anyhow::anyhow;
use async_trait::async_trait;

pub use context::RetrievalContextBuilder;
pub use embeddings::{cosine_similarity, tokenize, EmbeddingSpace};
pub use store::{
    MemoryStore, BROWSING_IMPORTANCE, BROWSING_SUMMARY_CHARS, FAILURE_IMPORTANCE,
    SUCCESS_IMPORTANCE,
};
pub use types::{
    BrowsingFact, ConversationTurn, FeedbackScore, LearnedSkill, MemoryChunk, TurnFilter,
};

/// What the orchestrator needs from memory
#[async_trait]
pub trait AgentMemory: Send + Sync {
    /// Context block for the first LLM round; empty when nothing is relevant
    async fn relevant_context(&self, query: &str) -> anyhow::Result<String>;

    /// Record a finished exchange
    async fn remember(
        &self,
        user_message: &str,
        agent_response: &str,
        tools_used: &[String],
        success: bool,
    ) -> anyhow::Result<()>;

    /// Count a use of the named skill; false if it does not exist
    async fn record_skill_outcome(&self, name: &str, success: bool) -> anyhow::Result<bool>;
}

/// Run a blocking store call on the blocking pool
async fn run_blocking<T, F>(store: &MemoryStore, label: &'static str, job: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&MemoryStore) -> anyhow::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || job(&store))
        .await
        .map_err(|e| anyhow!("Memory {} task failed: {}", label, e))?
}

#[async_trait]
impl AgentMemory for MemoryStore {
    async fn relevant_context(&self, query: &str) -> anyhow::Result<String> {
        let query = query.to_string();
        run_blocking(self, "context", move |store| store.get_relevant_context(&query)).await
    }

    async fn remember(
        &self,
        user_message: &str,
        agent_response: &str,
        tools_used: &[String],
        success: bool,
    ) -> anyhow::Result<()> {
        let user_message = user_message.to_string();
        let agent_response = agent_response.to_string();
        let tools_used = tools_used.to_vec();
        run_blocking(self, "remember", move |store| {
            store
                .remember(&user_message, &agent_response, &tools_used, success)
                .map(|_| ())
        })
        .await
    }

    async fn record_skill_outcome(&self, name: &str, success: bool) -> anyhow::Result<bool> {
        let name = name.to_string();
        run_blocking(self, "skill outcome", move |store| {
            store.record_skill_outcome(&name, success)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn test_agent_memory_trait_over_blocking_pool() {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        store.learn_skill("lesson:tap", "Taps can miss.", "Check first.").unwrap();
        let memory: Arc<dyn AgentMemory> = store.clone();

        memory
            .remember("open the camera", "Camera opened", &["launch_app".to_string()], true)
            .await
            .unwrap();
        assert!(memory.record_skill_outcome("lesson:tap", false).await.unwrap());
        assert!(!memory.record_skill_outcome("lesson:swipe", true).await.unwrap());

        let (first, second) = tokio::join!(
            memory.relevant_context("open camera"),
            memory.relevant_context("camera")
        );
        let context = first.unwrap();
        assert!(context.starts_with("Relevant memories:\n- User asked: open the camera"));
        assert!(context.contains("Learned skills:\n- lesson:tap"));
        assert!(second.unwrap().contains("Camera opened"));

        store.flush_background().await;
        assert_eq!(store.db().all_turns().unwrap().len(), 1);
        assert_eq!(store.db().get_skill("lesson:tap").unwrap().unwrap().fail_count, 1);
    }
}
