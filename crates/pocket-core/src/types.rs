//! ============================================================================
//! Core Types for the Pocket Agent
//! ============================================================================
//! Chat messages exchanged with the LLM, tool schemas and outcomes, and the
//! error taxonomy surfaced by the orchestrator.
//! ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Parameter map handed to a tool by the LLM
pub type ToolParams = Map<String, Value>;

/// One entry of the conversation as seen by the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    pub is_user: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_user: true,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_user: false,
        }
    }
}

/// A tool invocation requested by the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub params: ToolParams,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, params: ToolParams) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
        }
    }

    /// Call with no parameters
    pub fn bare(tool_name: impl Into<String>) -> Self {
        Self::new(tool_name, ToolParams::new())
    }
}

/// What the LLM client hands back for one chat call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Assistant text (may be empty when only tool calls are returned)
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    /// Text-only response (also how recoverable client problems are reported)
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// JSON-ish type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        };
        f.write_str(name)
    }
}

/// Description of a single tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            param_type,
            description: description.into(),
            required: false,
        }
    }
}

/// Full schema of a tool as exposed to the LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
}

/// Result of executing a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// One-line rendering used in the tool results block
    pub fn render(&self) -> String {
        if self.success {
            match &self.data {
                Some(Value::String(s)) => format!("OK: {}", s),
                Some(Value::Null) | None => "OK".to_string(),
                Some(other) => format!("OK: {}", other),
            }
        } else {
            format!(
                "FAILED: {}",
                self.error.as_deref().unwrap_or("tool reported failure")
            )
        }
    }
}

/// Error types for the agent
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Unknown tool '{name}'. Available tools: {available}")]
    ToolNotFound { name: String, available: String },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Stopped after {0} rounds without a final answer")]
    RoundLimitExceeded(usize),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Agent is already processing a message")]
    Busy,

    #[error("Turn cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_rendering() {
        assert_eq!(ToolOutcome::ok(json!("tapped")).render(), "OK: tapped");
        assert_eq!(ToolOutcome::ok(json!({"x": 1})).render(), "OK: {\"x\":1}");
        assert_eq!(ToolOutcome::done().render(), "OK");
        assert_eq!(
            ToolOutcome::failure("no such element").render(),
            "FAILED: no such element"
        );
    }

    #[test]
    fn test_param_spec_serializes_type_field() {
        let spec = ParamSpec::required(ParamType::Integer, "x coordinate");
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "integer");
        assert_eq!(value["required"], true);
    }

    #[test]
    fn test_tool_not_found_message_lists_tools() {
        let err = AgentError::ToolNotFound {
            name: "fly".to_string(),
            available: "swipe, tap".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown tool 'fly'. Available tools: swipe, tap");
    }

    #[test]
    fn test_llm_response_builders() {
        let resp = LlmResponse::text("thinking").with_tool_call(ToolCall::bare("tap"));
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].tool_name, "tap");
        assert!(!LlmResponse::text("done").has_tool_calls());
    }
}
