//! ============================================================================
//! POCKET-CORE: The on-device agent brain
//! ============================================================================
//! This crate handles all backend logic for the pocket agent:
//! - Tool-calling conversation loop over a pluggable LLM client
//! - Name-keyed registry of device tools
//! - Local semantic memory (TF-IDF embeddings over a redb file)
//! - Periodic self-improvement: lessons from failures, pruning, health summary
//! ============================================================================

pub mod agent;
pub mod config;
pub mod db;
pub mod executor;
pub mod improvement;
pub mod llm;
pub mod memory;
pub mod retry;
pub mod types;

// Re-export main types for convenience
pub use agent::{AgentOrchestrator, AgentState, TurnOutcome, TurnReport};
pub use config::AgentConfig;
pub use db::{DbStats, MemoryDb, PruneReport};
pub use executor::{Tool, ToolRegistry};
pub use improvement::{HealthSummary, MaintenanceScheduler, ReviewConfig, SelfImprovementLoop};
pub use llm::LlmClient;
pub use memory::{AgentMemory, MemoryStore};
pub use types::*;
