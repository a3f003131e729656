//! ============================================================================
//! Agent Module - The tool-calling conversation loop
//! ============================================================================
//! `AgentOrchestrator` drives one user instruction through up to `MAX_ROUNDS`
//! LLM rounds, executing requested tools sequentially and recording every
//! outcome, good or bad, in memory.
//! ============================================================================

mod orchestrator;

pub use orchestrator::{
    AgentOrchestrator, AgentState, TurnOutcome, TurnReport, EMPTY_RESPONSE_MESSAGE, MAX_ROUNDS,
};
