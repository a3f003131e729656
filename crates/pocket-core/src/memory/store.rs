//! ============================================================================
//! Memory Store - Semantic memory over the embedded database
//! ============================================================================
//! Owns the embedding space and the database handle. Every write that embeds
//! text commits the resulting vocabulary changes in the same transaction.
//! Access-count bumps and feedback are fire-and-forget background writes.
//! ============================================================================

use anyhow::Result;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::context::RetrievalContextBuilder;
use super::embeddings::EmbeddingSpace;
use super::types::{
    now_millis, BrowsingFact, ConversationTurn, FeedbackScore, LearnedSkill, MemoryChunk,
    SOURCE_BROWSING,
};
use crate::db::{MemoryDb, PruneReport};

/// Importance of a chunk derived from a successful turn
pub const SUCCESS_IMPORTANCE: f32 = 0.6;
/// Importance of a chunk derived from a failed turn
pub const FAILURE_IMPORTANCE: f32 = 0.4;
/// Importance of a chunk mirrored from a browsing fact
pub const BROWSING_IMPORTANCE: f32 = 0.5;
/// Browsing content is cut to this many characters
pub const BROWSING_SUMMARY_CHARS: usize = 500;

/// Memory store for the agent. Clones share the database, vocabulary and
/// background task tracker.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<MemoryDb>,
    space: Arc<EmbeddingSpace>,
    context: RetrievalContextBuilder,
    background: TaskTracker,
}

impl MemoryStore {
    /// Wrap an open database, reloading its persisted vocabulary
    pub fn new(db: MemoryDb) -> Result<Self> {
        let space = db.load_vocabulary()?;
        info!(
            "Memory store ready ({} vocabulary terms, {} documents)",
            space.vocabulary_size(),
            space.document_count()
        );

        Ok(Self {
            db: Arc::new(db),
            space: Arc::new(space),
            context: RetrievalContextBuilder::default(),
            background: TaskTracker::new(),
        })
    }

    pub fn open(path: Option<&str>) -> Result<Self> {
        Self::new(MemoryDb::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(MemoryDb::open_in_memory()?)
    }

    pub fn with_context_builder(mut self, context: RetrievalContextBuilder) -> Self {
        self.context = context;
        self
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    pub fn embedding_space(&self) -> &EmbeddingSpace {
        &self.space
    }

    pub fn context_builder(&self) -> &RetrievalContextBuilder {
        &self.context
    }

    /// Embed text; `None` when nothing survives tokenization
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let vector = self.space.embed(text);
        if vector.iter().all(|v| *v == 0.0) {
            None
        } else {
            Some(vector)
        }
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Record a finished exchange: the turn and its derived chunk commit together
    pub fn remember(
        &self,
        user_message: &str,
        agent_response: &str,
        tools_used: &[String],
        success: bool,
    ) -> Result<ConversationTurn> {
        let content = format!("User asked: {}\nAgent answered: {}", user_message, agent_response);
        let importance = if success {
            SUCCESS_IMPORTANCE
        } else {
            FAILURE_IMPORTANCE
        };

        let turn = ConversationTurn::new(user_message, agent_response, tools_used.to_vec(), success);
        let chunk = MemoryChunk::new(content.as_str(), self.embed(&content), "", importance)
            .at(turn.timestamp);

        let (turn, chunk) = self.db.insert_conversation(turn, chunk, Some(&self.space))?;
        debug!(
            "Remembered turn {} (success={}, tools={:?}) as chunk {}",
            turn.id, success, turn.tools_used, chunk.id
        );
        Ok(turn)
    }

    /// Set a turn's feedback score in the background. Missing ids are ignored.
    pub fn give_feedback(&self, turn_id: u64, score: FeedbackScore) {
        self.spawn_background("feedback", move |db, _| {
            if !db.set_feedback(turn_id, score)? {
                debug!("Feedback for unknown turn {} ignored", turn_id);
            }
            Ok(())
        });
    }

    // ========================================================================
    // Recall
    // ========================================================================

    /// The `limit` chunks most similar to `query`
    pub fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryChunk>> {
        Ok(self
            .recall_scored(query, limit)?
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect())
    }

    /// Like `recall`, with each chunk's similarity score.
    ///
    /// Scores every embedded chunk; the corpus on one device is small enough
    /// that no index is kept. Access counts of the returned chunks are bumped
    /// in the background.
    pub fn recall_scored(&self, query: &str, limit: usize) -> Result<Vec<(MemoryChunk, f32)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.space.embed(query);
        let mut scored: Vec<(MemoryChunk, f32)> = self
            .db
            .embedded_chunks()?
            .into_iter()
            .filter_map(|chunk| {
                let score = chunk
                    .embedding
                    .as_deref()
                    .map(|e| super::embeddings::cosine_similarity(&query_vector, e))?;
                Some((chunk, score))
            })
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        scored.truncate(limit);

        let ids: Vec<u64> = scored.iter().map(|(chunk, _)| chunk.id).collect();
        self.spawn_background("access count bump", move |db, space| {
            db.bump_access_counts(&ids, Some(space))?;
            Ok(())
        });

        debug!("Recall for {:?} returned {} chunks", query, scored.len());
        Ok(scored)
    }

    /// Recalled memories and top skills, rendered for prompt injection
    pub fn get_relevant_context(&self, query: &str) -> Result<String> {
        let memories = self.recall(query, self.context.memory_limit)?;
        let skills = self.top_skills(self.context.skill_limit)?;
        Ok(self.context.render(&memories, &skills))
    }

    // ========================================================================
    // Skills
    // ========================================================================

    /// Upsert a skill by name
    pub fn learn_skill(&self, name: &str, description: &str, how_to_use: &str) -> Result<LearnedSkill> {
        let skill = self.db.upsert_skill(name, description, how_to_use)?;
        info!("Learned skill: {}", skill.name);
        Ok(skill)
    }

    pub fn record_skill_outcome(&self, name: &str, success: bool) -> Result<bool> {
        self.db.record_skill_outcome(name, success)
    }

    /// Skills ordered by success count, highest first
    pub fn top_skills(&self, limit: usize) -> Result<Vec<LearnedSkill>> {
        let mut skills = self.db.list_skills()?;
        skills.truncate(limit);
        Ok(skills)
    }

    // ========================================================================
    // Browsing
    // ========================================================================

    /// Store a visited page as a browsing fact plus a recallable chunk
    pub fn store_browsing_memory(&self, url: &str, title: &str, content: &str) -> Result<BrowsingFact> {
        let summary: String = content.chars().take(BROWSING_SUMMARY_CHARS).collect();
        let embedding = self.embed(&format!("{} {}", title, summary));
        let timestamp = now_millis();

        let fact = BrowsingFact {
            id: 0,
            url: url.to_string(),
            title: title.to_string(),
            summary: summary.clone(),
            timestamp,
            embedding: embedding.clone(),
        };
        let chunk = MemoryChunk::new(
            format!("{} ({}): {}", title, url, summary),
            embedding,
            SOURCE_BROWSING,
            BROWSING_IMPORTANCE,
        )
        .at(timestamp);

        let (fact, _) = self.db.insert_browsing(fact, chunk, Some(&self.space))?;
        debug!("Stored browsing memory for {}", url);
        Ok(fact)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Delete memory older than `max_age_ms`, subject to the chunk pruning gate
    pub fn prune_old_memories(&self, max_age_ms: i64) -> Result<PruneReport> {
        let cutoff = now_millis().saturating_sub(max_age_ms);
        self.db.prune(cutoff)
    }

    /// Wait for every background write spawned so far
    pub async fn flush_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Run a write off the caller's path. Failures are logged, never returned.
    /// Outside a tokio runtime the write runs inline.
    fn spawn_background<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce(&MemoryDb, &EmbeddingSpace) -> Result<()> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let space = Arc::clone(&self.space);
        let run = move || {
            if let Err(e) = job(&db, &space) {
                warn!("Background {} failed: {}", label, e);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.background.spawn_blocking_on(run, &handle);
            }
            Err(_) => run(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    #[tokio::test]
    async fn test_remember_then_recall_round_trip() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.remember("set an alarm for seven", "Alarm set", &["alarm".to_string()], true).unwrap();
        let turn = store
            .remember("open the camera app", "Camera opened", &["launch".to_string()], true)
            .unwrap();

        let recalled = store.recall("open the camera app", 1).unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].turn_id(), Some(turn.id));
        assert!((recalled[0].importance - SUCCESS_IMPORTANCE).abs() < f32::EPSILON);
        assert!(recalled[0].content.starts_with("User asked: open the camera app\nAgent answered:"));
    }

    #[tokio::test]
    async fn test_recall_respects_limit_and_skips_unembedded() {
        let store = MemoryStore::open_in_memory().unwrap();
        for i in 0..4 {
            store.remember(&format!("weather report number{}", i), "sunny", &[], true).unwrap();
        }
        store.db().insert_chunk(MemoryChunk::new("weather", None, "test", 0.5), None).unwrap();

        let recalled = store.recall("weather", 3).unwrap();
        assert_eq!(recalled.len(), 3);
        assert!(recalled.iter().all(|c| c.embedding.is_some()));
        assert!(store.recall("weather", 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recall_bumps_access_counts_in_background() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.remember("turn on bluetooth", "Done", &[], true).unwrap();

        let recalled = store.recall("bluetooth", 1).unwrap();
        store.flush_background().await;

        let chunk = store.db().get_chunk(recalled[0].id).unwrap().unwrap();
        assert_eq!(chunk.access_count, 1);
    }

    #[tokio::test]
    async fn test_failed_turn_gets_lower_importance() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.remember("send the email", "Could not send", &["email".to_string()], false).unwrap();
        let chunk = &store.db().list_chunks().unwrap()[0];
        assert!((chunk.importance - FAILURE_IMPORTANCE).abs() < f32::EPSILON);
        assert!(!store.db().all_turns().unwrap()[0].was_successful);
    }

    #[tokio::test]
    async fn test_relevant_context_empty_store() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert_eq!(store.get_relevant_context("anything at all").unwrap(), "");
    }

    #[tokio::test]
    async fn test_relevant_context_includes_memories_and_skills() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.remember("dim the screen brightness", "Brightness lowered", &[], true).unwrap();
        store.learn_skill("lesson:tap", "Taps often miss.", "Take a screenshot first.").unwrap();

        let context = store.get_relevant_context("screen brightness").unwrap();
        assert!(context.starts_with("Relevant memories:\n- User asked: dim the screen brightness"));
        assert!(context.contains("Learned skills:\n- lesson:tap: Taps often miss."));
    }

    #[tokio::test]
    async fn test_give_feedback_missing_turn_is_silent() {
        let store = MemoryStore::open_in_memory().unwrap();
        let turn = store.remember("call mom", "Calling", &[], true).unwrap();

        store.give_feedback(999, FeedbackScore::Positive);
        store.give_feedback(turn.id, FeedbackScore::Positive);
        store.flush_background().await;

        let stored = store.db().get_turn(turn.id).unwrap().unwrap();
        assert_eq!(stored.feedback_score, FeedbackScore::Positive);
    }

    #[test]
    fn test_give_feedback_outside_runtime_runs_inline() {
        let store = MemoryStore::open_in_memory().unwrap();
        let turn = store.remember("call mom", "Calling", &[], true).unwrap();
        store.give_feedback(turn.id, FeedbackScore::Negative);
        let stored = store.db().get_turn(turn.id).unwrap().unwrap();
        assert_eq!(stored.feedback_score, FeedbackScore::Negative);
    }

    #[tokio::test]
    async fn test_browsing_memory_truncates_and_is_recallable() {
        let store = MemoryStore::open_in_memory().unwrap();
        let content = "rustacean ".repeat(100);
        let fact = store
            .store_browsing_memory("https://www.rust-lang.org", "Rust language", &content)
            .unwrap();

        assert_eq!(fact.summary.chars().count(), BROWSING_SUMMARY_CHARS);
        assert!(fact.embedding.is_some());
        assert_eq!(store.db().list_browsing().unwrap(), vec![fact.clone()]);

        let recalled = store.recall("rustacean", 1).unwrap();
        assert_eq!(recalled[0].source, SOURCE_BROWSING);
        assert!((recalled[0].importance - BROWSING_IMPORTANCE).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_prune_keeps_important_chunks() {
        let store = MemoryStore::open_in_memory().unwrap();
        let old = now_millis() - 31 * DAY_MS;
        store.db().insert_chunk(MemoryChunk::new("keep me", None, "test", 0.3).at(old), None).unwrap();
        store.db().insert_chunk(MemoryChunk::new("drop me", None, "test", 0.29).at(old), None).unwrap();

        let report = store.prune_old_memories(30 * DAY_MS).unwrap();
        assert_eq!(report.chunks, 1);
        let remaining = store.db().list_chunks().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "keep me");
    }

    #[tokio::test]
    async fn test_vocabulary_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.redb");
        let path = path.to_str().unwrap();

        let before = {
            let store = MemoryStore::open(Some(path)).unwrap();
            store.remember("toggle airplane mode", "Airplane mode on", &[], true).unwrap();
            store.recall("airplane", 1).unwrap();
            store.flush_background().await;
            store.embedding_space().vocabulary_size()
        };

        let store = MemoryStore::open(Some(path)).unwrap();
        assert_eq!(store.embedding_space().vocabulary_size(), before);
        let recalled = store.recall("airplane mode", 1).unwrap();
        assert_eq!(recalled[0].turn_id(), Some(1));
    }
}
