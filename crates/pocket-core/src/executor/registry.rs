//! ============================================================================
//! Tool Registry - Name-keyed table of tools
//! ============================================================================
//! Resolves LLM tool calls by name. Unknown names, tool errors and tool panics
//! all come back as failed [`ToolOutcome`]s so the agent loop never crashes on
//! a misbehaving tool.
//! ============================================================================

use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Tool;
use crate::types::{AgentError, ToolOutcome, ToolParams, ToolSchema};

/// Registry of available tools, ordered by name
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        info!("Registering tool: {}", name);
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            warn!("Tool {} was already registered and has been replaced", name);
        }
        previous
    }

    /// Builder-style registration
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas of every registered tool, for the LLM call
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|t| t.schema()).collect()
    }

    /// Call a tool by name, surfacing lookup and execution problems as errors
    pub async fn call(&self, name: &str, params: &ToolParams) -> Result<ToolOutcome, AgentError> {
        let tool = self.get(name).ok_or_else(|| AgentError::ToolNotFound {
            name: name.to_string(),
            available: self.available_list(),
        })?;

        debug!("Invoking tool {} with {} params", name, params.len());

        match AssertUnwindSafe(tool.execute(params)).catch_unwind().await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(AgentError::ToolExecution {
                tool: name.to_string(),
                message: e.to_string(),
            }),
            Err(panic) => Err(AgentError::ToolExecution {
                tool: name.to_string(),
                message: format!("tool panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    /// Call a tool by name; every failure mode becomes a failed outcome
    pub async fn execute(&self, name: &str, params: &ToolParams) -> ToolOutcome {
        match self.call(name, params).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(mut outcome) => {
                warn!("Tool {} reported failure: {:?}", name, outcome.error);
                if outcome.error.is_none() {
                    outcome.error = Some("tool reported failure".to_string());
                }
                outcome
            }
            Err(e) => {
                warn!("Tool call {} failed: {}", name, e);
                ToolOutcome::failure(e.to_string())
            }
        }
    }

    fn available_list(&self) -> String {
        if self.tools.is_empty() {
            "(none)".to_string()
        } else {
            self.names().join(", ")
        }
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
