//! ============================================================================
//! Memory Types - Records owned by the memory store
//! ============================================================================
//! Conversation turns, semantic memory chunks, learned skills and browsing
//! facts. All four are persisted in redb and only mutated by `MemoryStore`.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Source tag for chunks mirrored from browsing facts
pub const SOURCE_BROWSING: &str = "browsing";

/// Prefix of the source tag for chunks derived from a conversation turn
pub const SOURCE_CONVERSATION_PREFIX: &str = "conversation:";

/// User feedback attached to a conversation turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackScore {
    #[default]
    Unset,
    Negative,
    Positive,
}

impl std::fmt::Display for FeedbackScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FeedbackScore::Unset => "unset",
            FeedbackScore::Negative => "negative",
            FeedbackScore::Positive => "positive",
        };
        f.pad(label)
    }
}

impl std::str::FromStr for FeedbackScore {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unset" | "none" | "0" => Ok(FeedbackScore::Unset),
            "negative" | "down" | "-1" => Ok(FeedbackScore::Negative),
            "positive" | "up" | "+1" | "1" => Ok(FeedbackScore::Positive),
            _ => Err(format!("Unknown feedback score: {}", s)),
        }
    }
}

/// One user instruction and the agent's final response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Monotonic id assigned on insert
    pub id: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub user_message: String,
    pub agent_response: String,
    /// Tool names invoked during the turn, in call order
    pub tools_used: Vec<String>,
    pub was_successful: bool,
    pub feedback_score: FeedbackScore,
}

impl ConversationTurn {
    /// New unsaved turn stamped with the current time
    pub fn new(
        user_message: impl Into<String>,
        agent_response: impl Into<String>,
        tools_used: Vec<String>,
        was_successful: bool,
    ) -> Self {
        Self {
            id: 0,
            timestamp: now_millis(),
            user_message: user_message.into(),
            agent_response: agent_response.into(),
            tools_used,
            was_successful,
            feedback_score: FeedbackScore::Unset,
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A retrievable unit of semantic memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub id: u64,
    pub content: String,
    /// L2-normalised TF-IDF vector; `None` when no embedding was produced
    pub embedding: Option<Vec<f32>>,
    pub source: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Number of times this chunk was returned by recall
    pub access_count: u32,
    /// Pruning weight in 0.0..=1.0
    pub importance: f32,
}

impl MemoryChunk {
    pub fn new(
        content: impl Into<String>,
        embedding: Option<Vec<f32>>,
        source: impl Into<String>,
        importance: f32,
    ) -> Self {
        Self {
            id: 0,
            content: content.into(),
            embedding,
            source: source.into(),
            timestamp: now_millis(),
            access_count: 0,
            importance: importance.clamp(0.0, 1.0),
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Source tag for a chunk synthesised from the given turn
    pub fn conversation_source(turn_id: u64) -> String {
        format!("{}{}", SOURCE_CONVERSATION_PREFIX, turn_id)
    }

    /// Turn id referenced by the source tag, if this chunk came from a conversation
    pub fn turn_id(&self) -> Option<u64> {
        self.source
            .strip_prefix(SOURCE_CONVERSATION_PREFIX)
            .and_then(|id| id.parse().ok())
    }
}

/// A durable, named lesson surfaced back into prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedSkill {
    pub id: u64,
    /// Unique key
    pub name: String,
    pub description: String,
    pub how_to_use: String,
    pub success_count: u32,
    pub fail_count: u32,
    /// Unix timestamp in milliseconds
    pub last_updated: i64,
}

impl LearnedSkill {
    /// successCount / max(successCount + failCount, 1)
    pub fn success_rate(&self) -> f64 {
        let total = (self.success_count + self.fail_count).max(1);
        self.success_count as f64 / total as f64
    }
}

/// Summary of a visited web page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowsingFact {
    pub id: u64,
    pub url: String,
    pub title: String,
    pub summary: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub embedding: Option<Vec<f32>>,
}

/// Which turns to return from a recent-turns query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnFilter {
    All,
    Failed,
    Successful,
}

impl TurnFilter {
    pub fn matches(&self, turn: &ConversationTurn) -> bool {
        match self {
            TurnFilter::All => true,
            TurnFilter::Failed => !turn.was_successful,
            TurnFilter::Successful => turn.was_successful,
        }
    }
}

/// Current time as Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
