//! ============================================================================
//! Executor Module - Device Tools for the Agent
//! ============================================================================
//! Tools are the agent's effectors (tap, swipe, shell, web-fetch, ...). Each
//! one is a named, schema-described capability behind the [`Tool`] trait and
//! is looked up by name in the [`ToolRegistry`] built at startup.
//! ============================================================================

mod registry;

pub use registry::ToolRegistry;
pub(crate) use registry::panic_message;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::types::{ParamSpec, ToolOutcome, ToolParams, ToolSchema};

/// A single primitive action the agent can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the LLM uses to call this tool
    fn name(&self) -> &str;

    /// What the tool does, shown to the LLM
    fn description(&self) -> &str;

    /// Typed parameter map, keyed by parameter name
    fn parameters(&self) -> BTreeMap<String, ParamSpec>;

    /// Run the tool. An `Err` is treated exactly like a reported failure.
    async fn execute(&self, params: &ToolParams) -> anyhow::Result<ToolOutcome>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}
