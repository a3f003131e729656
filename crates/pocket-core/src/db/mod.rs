// ============================================================================
// MemoryDb - Embedded Database (redb)
// ============================================================================
// Persistent local storage for conversation turns, memory chunks, learned
// skills, browsing facts and the embedding vocabulary.
// Default path: ~/.pocket-agent/memory.redb (override via POCKET_DB_PATH)
// ============================================================================

pub mod types;

pub use types::{DbStats, PruneReport};

use anyhow::{anyhow, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::memory::embeddings::{EmbeddingSpace, TermRecord, VocabularyDelta};
use crate::memory::types::{
    now_millis, BrowsingFact, ConversationTurn, FeedbackScore, LearnedSkill, MemoryChunk,
    TurnFilter,
};

// Table definitions
const TURNS: TableDefinition<u64, &[u8]> = TableDefinition::new("turns");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const SKILLS: TableDefinition<&str, &[u8]> = TableDefinition::new("skills");
const BROWSING: TableDefinition<u64, &[u8]> = TableDefinition::new("browsing");
const VOCABULARY: TableDefinition<&str, &[u8]> = TableDefinition::new("vocabulary");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

// Meta keys
const TURN_SEQ: &str = "turn_seq";
const CHUNK_SEQ: &str = "chunk_seq";
const SKILL_SEQ: &str = "skill_seq";
const BROWSING_SEQ: &str = "browsing_seq";
const DOC_COUNT: &str = "doc_count";

/// Chunks at or above this importance are never pruned
pub const PRUNE_IMPORTANCE_FLOOR: f32 = 0.3;

/// Chunks recalled at least this many times are never pruned
pub const PRUNE_ACCESS_FLOOR: u32 = 2;

/// Embedded database backing the memory store
pub struct MemoryDb {
    db: Database,
    path: Option<PathBuf>,
}

impl MemoryDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses POCKET_DB_PATH env var or ~/.pocket-agent/memory.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("POCKET_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            home.join(".pocket-agent").join("memory.redb")
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
        }

        info!("Opening memory database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        Self::init(db, Some(db_path))
    }

    /// Volatile database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?;

        Self::init(db, None)
    }

    fn init(db: Database, path: Option<PathBuf>) -> Result<Self> {
        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn.open_table(TURNS).map_err(|e| anyhow!("Failed to create turns table: {}", e))?;
            let _ = write_txn.open_table(CHUNKS).map_err(|e| anyhow!("Failed to create chunks table: {}", e))?;
            let _ = write_txn.open_table(SKILLS).map_err(|e| anyhow!("Failed to create skills table: {}", e))?;
            let _ = write_txn.open_table(BROWSING).map_err(|e| anyhow!("Failed to create browsing table: {}", e))?;
            let _ = write_txn.open_table(VOCABULARY).map_err(|e| anyhow!("Failed to create vocabulary table: {}", e))?;
            let _ = write_txn.open_table(META).map_err(|e| anyhow!("Failed to create meta table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        debug!("Memory database ready");

        Ok(Self { db, path })
    }

    /// Database file path (None for in-memory databases)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `body` in one write transaction together with any pending
    /// vocabulary changes from `space`. On failure nothing is committed and
    /// the vocabulary changes stay queued for the next write.
    fn write_with_vocabulary<T>(
        &self,
        space: Option<&EmbeddingSpace>,
        body: impl FnOnce(&WriteTransaction) -> Result<T>,
    ) -> Result<T> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;

        // Drained only once the writer lock is held so deltas commit in order
        let delta = space.map(|s| s.drain_changes()).unwrap_or_default();

        let result = body(&write_txn)
            .and_then(|value| write_vocabulary(&write_txn, &delta).map(|_| value))
            .and_then(|value| {
                write_txn
                    .commit()
                    .map(|_| value)
                    .map_err(|e| anyhow!("Failed to commit: {}", e))
            });

        if result.is_err() {
            if let Some(space) = space {
                space.requeue(&delta);
            }
        }
        result
    }

    // ========================================================================
    // Vocabulary
    // ========================================================================

    /// Rebuild the embedding space from disk
    pub fn load_vocabulary(&self) -> Result<EmbeddingSpace> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;

        let table = read_txn.open_table(VOCABULARY)
            .map_err(|e| anyhow!("Failed to open vocabulary table: {}", e))?;
        let mut terms = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate vocabulary: {}", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            let record: TermRecord = decode(value.value(), "term")?;
            terms.push((key.value().to_string(), record));
        }

        let doc_count = read_meta(&read_txn, DOC_COUNT)?;
        EmbeddingSpace::from_terms(terms, doc_count)
    }

    /// Write pending vocabulary changes on their own
    pub fn persist_vocabulary(&self, space: &EmbeddingSpace) -> Result<()> {
        self.write_with_vocabulary(Some(space), |_| Ok(()))
    }

    // ========================================================================
    // Conversation Operations
    // ========================================================================

    /// Insert a turn and its derived chunk atomically. Assigns both ids and
    /// points the chunk's source at the new turn.
    pub fn insert_conversation(
        &self,
        mut turn: ConversationTurn,
        mut chunk: MemoryChunk,
        space: Option<&EmbeddingSpace>,
    ) -> Result<(ConversationTurn, MemoryChunk)> {
        self.write_with_vocabulary(space, |txn| {
            turn.id = next_id(txn, TURN_SEQ)?;
            chunk.id = next_id(txn, CHUNK_SEQ)?;
            chunk.source = MemoryChunk::conversation_source(turn.id);
            put(txn, TURNS, turn.id, &turn, "turn")?;
            put(txn, CHUNKS, chunk.id, &chunk, "chunk")?;
            Ok(())
        })?;

        debug!("Stored turn {} with chunk {}", turn.id, chunk.id);
        Ok((turn, chunk))
    }

    pub fn get_turn(&self, id: u64) -> Result<Option<ConversationTurn>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(TURNS)
            .map_err(|e| anyhow!("Failed to open turns table: {}", e))?;

        let turn = match table.get(id).map_err(|e| anyhow!("Failed to get turn: {}", e))? {
            Some(value) => Some(decode(value.value(), "turn")?),
            None => None,
        };
        Ok(turn)
    }

    /// Every turn in insertion order
    pub fn all_turns(&self) -> Result<Vec<ConversationTurn>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(TURNS)
            .map_err(|e| anyhow!("Failed to open turns table: {}", e))?;
        collect_all(&table, "turn")
    }

    /// Newest turns first (by timestamp, then id), filtered, at most `limit`
    pub fn recent_turns(&self, limit: usize, filter: TurnFilter) -> Result<Vec<ConversationTurn>> {
        let mut turns = self.all_turns()?;
        turns.retain(|t| filter.matches(t));
        turns.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        turns.truncate(limit);
        Ok(turns)
    }

    /// Set the feedback score of a turn. Returns false if the turn does not exist.
    pub fn set_feedback(&self, turn_id: u64, score: FeedbackScore) -> Result<bool> {
        let updated = self.write_with_vocabulary(None, |txn| {
            let mut table = txn.open_table(TURNS)
                .map_err(|e| anyhow!("Failed to open turns table: {}", e))?;
            let existing = table.get(turn_id)
                .map_err(|e| anyhow!("Failed to get turn: {}", e))?
                .map(|v| v.value().to_vec());
            let Some(bytes) = existing else {
                return Ok(false);
            };

            let mut turn: ConversationTurn = decode(&bytes, "turn")?;
            turn.feedback_score = score;
            let value = encode(&turn, "turn")?;
            table.insert(turn_id, value.as_slice())
                .map_err(|e| anyhow!("Failed to update turn: {}", e))?;
            Ok(true)
        })?;

        if updated {
            debug!("Turn {} feedback set to {}", turn_id, score);
        }
        Ok(updated)
    }

    // ========================================================================
    // Memory Chunk Operations
    // ========================================================================

    pub fn insert_chunk(&self, mut chunk: MemoryChunk, space: Option<&EmbeddingSpace>) -> Result<MemoryChunk> {
        self.write_with_vocabulary(space, |txn| {
            chunk.id = next_id(txn, CHUNK_SEQ)?;
            put(txn, CHUNKS, chunk.id, &chunk, "chunk")
        })?;
        Ok(chunk)
    }

    pub fn get_chunk(&self, id: u64) -> Result<Option<MemoryChunk>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(CHUNKS)
            .map_err(|e| anyhow!("Failed to open chunks table: {}", e))?;

        let chunk = match table.get(id).map_err(|e| anyhow!("Failed to get chunk: {}", e))? {
            Some(value) => Some(decode(value.value(), "chunk")?),
            None => None,
        };
        Ok(chunk)
    }

    pub fn list_chunks(&self) -> Result<Vec<MemoryChunk>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(CHUNKS)
            .map_err(|e| anyhow!("Failed to open chunks table: {}", e))?;
        collect_all(&table, "chunk")
    }

    /// Chunks that carry an embedding
    pub fn embedded_chunks(&self) -> Result<Vec<MemoryChunk>> {
        let mut chunks = self.list_chunks()?;
        chunks.retain(|c| c.embedding.is_some());
        Ok(chunks)
    }

    /// Increment access counts, flushing pending vocabulary in the same commit
    pub fn bump_access_counts(&self, ids: &[u64], space: Option<&EmbeddingSpace>) -> Result<usize> {
        self.write_with_vocabulary(space, |txn| {
            let mut table = txn.open_table(CHUNKS)
                .map_err(|e| anyhow!("Failed to open chunks table: {}", e))?;

            let mut bumped = 0;
            for id in ids {
                let existing = table.get(*id)
                    .map_err(|e| anyhow!("Failed to get chunk: {}", e))?
                    .map(|v| v.value().to_vec());
                // Pruned in the meantime
                let Some(bytes) = existing else {
                    continue;
                };

                let mut chunk: MemoryChunk = decode(&bytes, "chunk")?;
                chunk.access_count = chunk.access_count.saturating_add(1);
                let value = encode(&chunk, "chunk")?;
                table.insert(*id, value.as_slice())
                    .map_err(|e| anyhow!("Failed to update chunk: {}", e))?;
                bumped += 1;
            }
            Ok(bumped)
        })
    }

    // ========================================================================
    // Skill Operations
    // ========================================================================

    /// Insert or update a skill by name. Counters are kept on update and
    /// `last_updated` always moves forward.
    pub fn upsert_skill(&self, name: &str, description: &str, how_to_use: &str) -> Result<LearnedSkill> {
        let skill = self.write_with_vocabulary(None, |txn| {
            let existing = read_skill(txn, name)?;
            let now = now_millis();
            let skill = match existing {
                Some(mut skill) => {
                    skill.description = description.to_string();
                    skill.how_to_use = how_to_use.to_string();
                    skill.last_updated = now.max(skill.last_updated + 1);
                    skill
                }
                None => LearnedSkill {
                    id: next_id(txn, SKILL_SEQ)?,
                    name: name.to_string(),
                    description: description.to_string(),
                    how_to_use: how_to_use.to_string(),
                    success_count: 0,
                    fail_count: 0,
                    last_updated: now,
                },
            };
            write_skill(txn, &skill)?;
            Ok(skill)
        })?;

        debug!("Upserted skill: {}", skill.name);
        Ok(skill)
    }

    /// Count one use of a skill. Returns false if no skill has that name.
    pub fn record_skill_outcome(&self, name: &str, success: bool) -> Result<bool> {
        self.write_with_vocabulary(None, |txn| {
            let Some(mut skill) = read_skill(txn, name)? else {
                return Ok(false);
            };
            if success {
                skill.success_count = skill.success_count.saturating_add(1);
            } else {
                skill.fail_count = skill.fail_count.saturating_add(1);
            }
            skill.last_updated = now_millis().max(skill.last_updated + 1);
            write_skill(txn, &skill)?;
            Ok(true)
        })
    }

    pub fn get_skill(&self, name: &str) -> Result<Option<LearnedSkill>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SKILLS)
            .map_err(|e| anyhow!("Failed to open skills table: {}", e))?;

        let skill = match table.get(name).map_err(|e| anyhow!("Failed to get skill: {}", e))? {
            Some(value) => Some(decode(value.value(), "skill")?),
            None => None,
        };
        Ok(skill)
    }

    /// All skills, most successful first (ties broken by name)
    pub fn list_skills(&self) -> Result<Vec<LearnedSkill>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(SKILLS)
            .map_err(|e| anyhow!("Failed to open skills table: {}", e))?;

        let mut skills: Vec<LearnedSkill> = Vec::new();
        let iter = table.range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate skills: {}", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            skills.push(decode(value.value(), "skill")?);
        }

        skills.sort_by(|a, b| {
            b.success_count
                .cmp(&a.success_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(skills)
    }

    // ========================================================================
    // Browsing Operations
    // ========================================================================

    /// Insert a browsing fact and its mirrored chunk in one transaction
    pub fn insert_browsing(
        &self,
        mut fact: BrowsingFact,
        mut chunk: MemoryChunk,
        space: Option<&EmbeddingSpace>,
    ) -> Result<(BrowsingFact, MemoryChunk)> {
        self.write_with_vocabulary(space, |txn| {
            fact.id = next_id(txn, BROWSING_SEQ)?;
            chunk.id = next_id(txn, CHUNK_SEQ)?;
            put(txn, BROWSING, fact.id, &fact, "browsing fact")?;
            put(txn, CHUNKS, chunk.id, &chunk, "chunk")?;
            Ok(())
        })?;

        debug!("Stored browsing fact {} for {}", fact.id, fact.url);
        Ok((fact, chunk))
    }

    pub fn list_browsing(&self) -> Result<Vec<BrowsingFact>> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let table = read_txn.open_table(BROWSING)
            .map_err(|e| anyhow!("Failed to open browsing table: {}", e))?;
        collect_all(&table, "browsing fact")
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Delete rows older than `cutoff_ms`. Chunks additionally need low
    /// importance and few accesses; turns and browsing facts go on age alone.
    pub fn prune(&self, cutoff_ms: i64) -> Result<PruneReport> {
        let report = self.write_with_vocabulary(None, |txn| {
            let mut report = PruneReport::default();

            let mut chunks = txn.open_table(CHUNKS)
                .map_err(|e| anyhow!("Failed to open chunks table: {}", e))?;
            for id in prunable_chunk_ids(&chunks, cutoff_ms)? {
                chunks.remove(id).map_err(|e| anyhow!("Failed to remove chunk: {}", e))?;
                report.chunks += 1;
            }

            let mut turns = txn.open_table(TURNS)
                .map_err(|e| anyhow!("Failed to open turns table: {}", e))?;
            for id in stale_ids::<ConversationTurn, _>(&turns, cutoff_ms, |t| t.timestamp, "turn")? {
                turns.remove(id).map_err(|e| anyhow!("Failed to remove turn: {}", e))?;
                report.turns += 1;
            }

            let mut browsing = txn.open_table(BROWSING)
                .map_err(|e| anyhow!("Failed to open browsing table: {}", e))?;
            for id in stale_ids::<BrowsingFact, _>(&browsing, cutoff_ms, |f| f.timestamp, "browsing fact")? {
                browsing.remove(id).map_err(|e| anyhow!("Failed to remove browsing fact: {}", e))?;
                report.browsing_facts += 1;
            }

            Ok(report)
        })?;

        if report.total() > 0 {
            info!(
                "Pruned {} chunks, {} turns, {} browsing facts",
                report.chunks, report.turns, report.browsing_facts
            );
        }
        Ok(report)
    }

    /// What `prune` would delete, without deleting anything
    pub fn count_prunable(&self, cutoff_ms: i64) -> Result<PruneReport> {
        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;

        let chunks = read_txn.open_table(CHUNKS)
            .map_err(|e| anyhow!("Failed to open chunks table: {}", e))?;
        let turns = read_txn.open_table(TURNS)
            .map_err(|e| anyhow!("Failed to open turns table: {}", e))?;
        let browsing = read_txn.open_table(BROWSING)
            .map_err(|e| anyhow!("Failed to open browsing table: {}", e))?;

        Ok(PruneReport {
            chunks: prunable_chunk_ids(&chunks, cutoff_ms)?.len(),
            turns: stale_ids::<ConversationTurn, _>(&turns, cutoff_ms, |t| t.timestamp, "turn")?.len(),
            browsing_facts: stale_ids::<BrowsingFact, _>(&browsing, cutoff_ms, |f| f.timestamp, "browsing fact")?
                .len(),
        })
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let turns = self.all_turns()?;
        let chunks = self.list_chunks()?;

        let read_txn = self.db.begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))?;
        let skills = read_txn.open_table(SKILLS)
            .map_err(|e| anyhow!("Failed to open skills table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count skills: {}", e))?;
        let browsing_facts = read_txn.open_table(BROWSING)
            .map_err(|e| anyhow!("Failed to open browsing table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count browsing facts: {}", e))?;
        let vocabulary_terms = read_txn.open_table(VOCABULARY)
            .map_err(|e| anyhow!("Failed to open vocabulary table: {}", e))?
            .len()
            .map_err(|e| anyhow!("Failed to count vocabulary: {}", e))?;
        let documents_embedded = read_meta(&read_txn, DOC_COUNT)?;

        Ok(DbStats {
            turns: turns.len(),
            failed_turns: turns.iter().filter(|t| !t.was_successful).count(),
            chunks: chunks.len(),
            embedded_chunks: chunks.iter().filter(|c| c.embedding.is_some()).count(),
            skills: skills as usize,
            browsing_facts: browsing_facts as usize,
            vocabulary_terms: vocabulary_terms as usize,
            documents_embedded,
        })
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

/// Allocate the next id for a sequence, starting at 1
fn next_id(txn: &WriteTransaction, sequence: &str) -> Result<u64> {
    let mut meta = txn.open_table(META)
        .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
    let last = meta.get(sequence)
        .map_err(|e| anyhow!("Failed to read {}: {}", sequence, e))?
        .map(|v| v.value())
        .unwrap_or(0);
    let next = last + 1;
    meta.insert(sequence, next)
        .map_err(|e| anyhow!("Failed to advance {}: {}", sequence, e))?;
    Ok(next)
}

fn read_meta(read_txn: &redb::ReadTransaction, key: &str) -> Result<u64> {
    let meta = read_txn.open_table(META)
        .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
    let value = meta.get(key)
        .map_err(|e| anyhow!("Failed to read {}: {}", key, e))?
        .map(|v| v.value())
        .unwrap_or(0);
    Ok(value)
}

fn put<T: Serialize>(
    txn: &WriteTransaction,
    table: TableDefinition<u64, &[u8]>,
    id: u64,
    value: &T,
    what: &str,
) -> Result<()> {
    let bytes = encode(value, what)?;
    let mut table = txn.open_table(table)
        .map_err(|e| anyhow!("Failed to open table for {}: {}", what, e))?;
    table.insert(id, bytes.as_slice())
        .map_err(|e| anyhow!("Failed to insert {}: {}", what, e))?;
    Ok(())
}

fn read_skill(txn: &WriteTransaction, name: &str) -> Result<Option<LearnedSkill>> {
    let table = txn.open_table(SKILLS)
        .map_err(|e| anyhow!("Failed to open skills table: {}", e))?;
    let existing = table.get(name)
        .map_err(|e| anyhow!("Failed to get skill: {}", e))?
        .map(|v| v.value().to_vec());
    existing.map(|bytes| decode(&bytes, "skill")).transpose()
}

fn write_skill(txn: &WriteTransaction, skill: &LearnedSkill) -> Result<()> {
    let bytes = encode(skill, "skill")?;
    let mut table = txn.open_table(SKILLS)
        .map_err(|e| anyhow!("Failed to open skills table: {}", e))?;
    table.insert(skill.name.as_str(), bytes.as_slice())
        .map_err(|e| anyhow!("Failed to insert skill: {}", e))?;
    Ok(())
}

fn write_vocabulary(txn: &WriteTransaction, delta: &VocabularyDelta) -> Result<()> {
    if delta.is_empty() {
        return Ok(());
    }

    {
        let mut table = txn.open_table(VOCABULARY)
            .map_err(|e| anyhow!("Failed to open vocabulary table: {}", e))?;
        for (term, record) in &delta.terms {
            let bytes = encode(record, "term")?;
            table.insert(term.as_str(), bytes.as_slice())
                .map_err(|e| anyhow!("Failed to insert term: {}", e))?;
        }
    }

    if let Some(doc_count) = delta.doc_count {
        let mut meta = txn.open_table(META)
            .map_err(|e| anyhow!("Failed to open meta table: {}", e))?;
        meta.insert(DOC_COUNT, doc_count)
            .map_err(|e| anyhow!("Failed to update document count: {}", e))?;
    }

    debug!("Persisted {} vocabulary terms", delta.terms.len());
    Ok(())
}

fn collect_all<T, R>(table: &R, what: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    let mut results = Vec::new();
    let iter = table.range::<u64>(..)
        .map_err(|e| anyhow!("Failed to iterate {}s: {}", what, e))?;
    for entry in iter {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        results.push(decode(value.value(), what)?);
    }
    Ok(results)
}

fn prunable_chunk_ids<R>(table: &R, cutoff_ms: i64) -> Result<Vec<u64>>
where
    R: ReadableTable<u64, &'static [u8]>,
{
    let chunks: Vec<MemoryChunk> = collect_all(table, "chunk")?;
    Ok(chunks
        .into_iter()
        .filter(|c| {
            c.importance < PRUNE_IMPORTANCE_FLOOR
                && c.access_count < PRUNE_ACCESS_FLOOR
                && c.timestamp < cutoff_ms
        })
        .map(|c| c.id)
        .collect())
}

fn stale_ids<T, R>(table: &R, cutoff_ms: i64, timestamp: fn(&T) -> i64, what: &str) -> Result<Vec<u64>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    let mut ids = Vec::new();
    let iter = table.range::<u64>(..)
        .map_err(|e| anyhow!("Failed to iterate {}s: {}", what, e))?;
    for entry in iter {
        let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        let record: T = decode(value.value(), what)?;
        if timestamp(&record) < cutoff_ms {
            ids.push(key.value());
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn turn(user: &str, success: bool) -> ConversationTurn {
        ConversationTurn::new(user, "done", vec!["tap".to_string()], success)
    }

    fn chunk(content: &str, importance: f32) -> MemoryChunk {
        MemoryChunk::new(content, Some(vec![1.0]), "test", importance)
    }

    #[test]
    fn test_conversation_ids_and_source() {
        let db = MemoryDb::open_in_memory().unwrap();
        let (t1, c1) = db.insert_conversation(turn("a", true), chunk("a", 0.6), None).unwrap();
        let (t2, c2) = db.insert_conversation(turn("b", true), chunk("b", 0.6), None).unwrap();

        assert_eq!((t1.id, t2.id), (1, 2));
        assert_eq!((c1.id, c2.id), (1, 2));
        assert_eq!(c2.source, "conversation:2");
        assert_eq!(db.get_turn(2).unwrap().unwrap().user_message, "b");
        assert!(db.get_turn(3).unwrap().is_none());
    }

    #[test]
    fn test_recent_turns_ordering_and_filter() {
        let db = MemoryDb::open_in_memory().unwrap();
        db.insert_conversation(turn("old", false).at(1_000), chunk("x", 0.4), None).unwrap();
        db.insert_conversation(turn("new", false).at(3_000), chunk("y", 0.4), None).unwrap();
        db.insert_conversation(turn("ok", true).at(2_000), chunk("z", 0.6), None).unwrap();

        let failed = db.recent_turns(10, TurnFilter::Failed).unwrap();
        let names: Vec<_> = failed.iter().map(|t| t.user_message.as_str()).collect();
        assert_eq!(names, vec!["new", "old"]);

        assert_eq!(db.recent_turns(1, TurnFilter::All).unwrap()[0].user_message, "new");
    }

    #[test]
    fn test_feedback_on_missing_turn_is_noop() {
        let db = MemoryDb::open_in_memory().unwrap();
        assert!(!db.set_feedback(99, FeedbackScore::Positive).unwrap());

        let (t, _) = db.insert_conversation(turn("a", true), chunk("a", 0.6), None).unwrap();
        assert!(db.set_feedback(t.id, FeedbackScore::Negative).unwrap());
        assert_eq!(
            db.get_turn(t.id).unwrap().unwrap().feedback_score,
            FeedbackScore::Negative
        );
    }

    #[test]
    fn test_skill_upsert_keeps_counters() {
        let db = MemoryDb::open_in_memory().unwrap();
        let first = db.upsert_skill("lesson:tap", "d1", "h1").unwrap();
        assert!(db.record_skill_outcome("lesson:tap", true).unwrap());
        assert!(db.record_skill_outcome("lesson:tap", false).unwrap());
        assert!(!db.record_skill_outcome("lesson:none", true).unwrap());

        let second = db.upsert_skill("lesson:tap", "d2", "h2").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.description, "d2");
        assert_eq!((second.success_count, second.fail_count), (1, 1));
        assert!(second.last_updated > first.last_updated);
        assert_eq!(db.list_skills().unwrap().len(), 1);
    }

    #[test]
    fn test_list_skills_sorted_by_success() {
        let db = MemoryDb::open_in_memory().unwrap();
        db.upsert_skill("b", "", "").unwrap();
        db.upsert_skill("a", "", "").unwrap();
        db.upsert_skill("c", "", "").unwrap();
        db.record_skill_outcome("c", true).unwrap();

        let names: Vec<_> = db.list_skills().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_prune_respects_importance_and_access() {
        let db = MemoryDb::open_in_memory().unwrap();
        let old = now_millis() - 40 * DAY_MS;
        let cutoff = now_millis() - 30 * DAY_MS;

        let weak = db.insert_chunk(chunk("weak", 0.2).at(old), None).unwrap();
        db.insert_chunk(chunk("important", 0.3).at(old), None).unwrap();
        let popular = db.insert_chunk(chunk("popular", 0.1).at(old), None).unwrap();
        db.bump_access_counts(&[popular.id, popular.id], None).unwrap();
        db.insert_chunk(chunk("fresh", 0.1), None).unwrap();
        db.insert_conversation(turn("old", true).at(old), chunk("t", 0.6).at(old), None).unwrap();

        let dry = db.count_prunable(cutoff).unwrap();
        assert_eq!(dry, PruneReport { chunks: 1, turns: 1, browsing_facts: 0 });

        let report = db.prune(cutoff).unwrap();
        assert_eq!(report, dry);
        assert!(db.get_chunk(weak.id).unwrap().is_none());
        assert_eq!(db.list_chunks().unwrap().len(), 4);
        assert!(db.all_turns().unwrap().is_empty());
    }

    #[test]
    fn test_prune_drops_old_browsing_facts_but_keeps_mirrored_chunk() {
        let db = MemoryDb::open_in_memory().unwrap();
        let old = now_millis() - 40 * DAY_MS;
        let cutoff = now_millis() - 30 * DAY_MS;

        let fact = BrowsingFact {
            id: 0,
            url: "https://support.google.com/android/wifi".to_string(),
            title: "Wifi settings".to_string(),
            summary: "How to toggle wifi".to_string(),
            timestamp: old,
            embedding: Some(vec![1.0]),
        };
        let mirrored = MemoryChunk::new("Wifi settings: How to toggle wifi", Some(vec![1.0]), "browsing", 0.5)
            .at(old);
        let (fact, mirrored) = db.insert_browsing(fact, mirrored, None).unwrap();
        let fresh = BrowsingFact {
            id: 0,
            url: "https://support.google.com/android/bluetooth".to_string(),
            title: "Bluetooth".to_string(),
            summary: "Pairing".to_string(),
            timestamp: now_millis(),
            embedding: None,
        };
        let (fresh, _) = db.insert_browsing(fresh, chunk("Bluetooth: Pairing", 0.5), None).unwrap();

        assert_eq!(db.list_browsing().unwrap(), vec![fact.clone(), fresh.clone()]);
        assert_eq!(mirrored.source, "browsing");

        let report = db.prune(cutoff).unwrap();
        assert_eq!(report, PruneReport { chunks: 0, turns: 0, browsing_facts: 1 });
        assert_eq!(db.list_browsing().unwrap(), vec![fresh]);
        assert_eq!(db.get_chunk(mirrored.id).unwrap(), Some(mirrored));
    }

    #[test]
    fn test_vocabulary_commits_with_records() {
        let db = MemoryDb::open_in_memory().unwrap();
        let space = EmbeddingSpace::new();
        let embedding = space.embed("open camera");
        db.insert_chunk(MemoryChunk::new("open camera", Some(embedding), "test", 0.5), Some(&space))
            .unwrap();

        let reloaded = db.load_vocabulary().unwrap();
        assert_eq!(reloaded.vocabulary_size(), 2);
        assert_eq!(reloaded.document_count(), 1);

        let stats = db.stats().unwrap();
        assert_eq!(stats.vocabulary_terms, 2);
        assert_eq!(stats.embedded_chunks, 1);
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.redb");
        let path = path.to_str().unwrap();

        {
            let db = MemoryDb::open(Some(path)).unwrap();
            db.insert_conversation(turn("persist me", true), chunk("p", 0.6), None).unwrap();
            db.upsert_skill("lesson:tap", "d", "h").unwrap();
        }

        let db = MemoryDb::open(Some(path)).unwrap();
        assert_eq!(db.all_turns().unwrap()[0].user_message, "persist me");
        assert!(db.get_skill("lesson:tap").unwrap().is_some());
        let (t, _) = db.insert_conversation(turn("next", true), chunk("n", 0.6), None).unwrap();
        assert_eq!(t.id, 2);
    }
}
