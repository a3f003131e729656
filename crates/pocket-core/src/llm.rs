//! ============================================================================
//! LLM Client Interface
//! ============================================================================
//! The reasoning engine is pluggable: anything that can turn a message list
//! plus tool schemas into text and/or tool calls can drive the agent.
//! ============================================================================

use async_trait::async_trait;

use crate::types::{ChatMessage, LlmResponse, ToolSchema};

/// Chat-completion style LLM client.
///
/// Recoverable problems (missing API key, unreachable endpoint, vendor error)
/// must be reported as a text-only [`LlmResponse`] describing the problem, so
/// the orchestrator can treat them as an ordinary final answer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> LlmResponse;
}
