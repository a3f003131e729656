//! ============================================================================
//! Agent Orchestrator - Single-flight LLM/tool loop
//! ============================================================================
//! States: Idle → Running → (Idle | TerminatedByLimit)
//!
//! One `send_message` runs at a time; a second call while Running is
//! rejected, not queued. Round 1 sends the prior history plus the user text
//! enriched with retrieved context; later rounds send the visible history,
//! which only ever holds the raw user text.
//! ============================================================================

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::executor::{panic_message, ToolRegistry};
use crate::improvement::lesson_name;
use crate::llm::LlmClient;
use crate::memory::AgentMemory;
use crate::types::{AgentError, ChatMessage, LlmResponse};

/// LLM rounds allowed per turn
pub const MAX_ROUNDS: usize = 8;

/// Visible reply when the LLM returns neither text nor tool calls
pub const EMPTY_RESPONSE_MESSAGE: &str = "The model returned an empty response.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentState {
    Idle,
    Running,
    /// The last turn hit the round limit; accepts new messages like Idle
    TerminatedByLimit,
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TurnOutcome {
    /// The LLM produced a final text answer
    Answered,
    RoundLimit,
    Failed(String),
    Cancelled,
}

/// Summary of one `send_message` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReport {
    /// Last assistant-visible content
    pub response: String,
    /// Tools invoked across all rounds, in call order
    pub tools_used: Vec<String>,
    /// False if any tool failed or the turn did not end with an answer
    pub success: bool,
    pub rounds: usize,
    pub outcome: TurnOutcome,
}

pub struct AgentOrchestrator {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    memory: Arc<dyn AgentMemory>,
    max_rounds: usize,
    history: Mutex<Vec<ChatMessage>>,
    state: Mutex<AgentState>,
    shutdown_token: CancellationToken,
    current_turn: Mutex<Option<CancellationToken>>,
}

/// Resets the orchestrator if a turn ends without setting a final state
struct RunGuard<'a> {
    orchestrator: &'a AgentOrchestrator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.orchestrator.state.lock();
        if *state == AgentState::Running {
            *state = AgentState::Idle;
        }
        *self.orchestrator.current_turn.lock() = None;
    }
}

/// Mutable bookkeeping for the turn in progress
struct TurnProgress {
    tools_used: Vec<String>,
    success: bool,
    rounds: usize,
}

impl TurnProgress {
    fn finish(self, response: String, outcome: TurnOutcome) -> TurnReport {
        let success = self.success && outcome == TurnOutcome::Answered;
        TurnReport {
            response,
            tools_used: self.tools_used,
            success,
            rounds: self.rounds,
            outcome,
        }
    }
}

impl AgentOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, tools: ToolRegistry, memory: Arc<dyn AgentMemory>) -> Self {
        info!("Agent orchestrator ready with {} tools", tools.len());
        Self {
            llm,
            tools,
            memory,
            max_rounds: MAX_ROUNDS,
            history: Mutex::new(Vec::new()),
            state: Mutex::new(AgentState::Idle),
            shutdown_token: CancellationToken::new(),
            current_turn: Mutex::new(None),
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_config(self, config: &AgentConfig) -> Self {
        self.with_max_rounds(config.max_rounds)
    }

    /// Share a root cancellation token (e.g. with the maintenance scheduler)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Visible conversation so far
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().clone()
    }

    /// Forget the visible conversation. Refused while a turn is running.
    pub fn clear_history(&self) -> Result<(), AgentError> {
        let state = self.state.lock();
        if *state == AgentState::Running {
            return Err(AgentError::Busy);
        }
        self.history.lock().clear();
        Ok(())
    }

    /// Cancel the turn in flight, if any. Returns whether one was running.
    pub fn cancel_current_turn(&self) -> bool {
        match self.current_turn.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the current turn and every future one
    pub fn shutdown(&self) {
        info!("Agent orchestrator shutting down");
        self.shutdown_token.cancel();
    }

    /// Run one user instruction to completion.
    ///
    /// Only `AgentError::Busy` is returned as an error. Every other problem
    /// ends up as a visible assistant turn and a failed memory record.
    pub async fn send_message(&self, user_text: &str) -> Result<TurnReport, AgentError> {
        let turn_token = self.begin_turn()?;
        let _guard = RunGuard { orchestrator: self };

        let prior = self.start_history(user_text);
        let mut report = self.run_rounds(user_text, &prior, &turn_token).await;

        if let Err(e) = self
            .memory
            .remember(user_text, &report.response, &report.tools_used, report.success)
            .await
        {
            let failure = AgentError::Persistence(e.to_string());
            error!("Failed to record turn: {}", failure);
            report.response = self.push_assistant(format!("Error: {}", failure));
            report.success = false;
            report.outcome = TurnOutcome::Failed(failure.to_string());
        } else {
            self.record_lesson_outcomes(&report.tools_used, report.success).await;
        }

        self.end_turn(&report.outcome);
        debug!(
            "Turn finished after {} rounds: {:?} (success={})",
            report.rounds, report.outcome, report.success
        );
        Ok(report)
    }

    fn begin_turn(&self) -> Result<CancellationToken, AgentError> {
        let mut state = self.state.lock();
        if *state == AgentState::Running {
            warn!("Rejected message: a turn is already running");
            return Err(AgentError::Busy);
        }
        *state = AgentState::Running;

        let token = self.shutdown_token.child_token();
        *self.current_turn.lock() = Some(token.clone());
        Ok(token)
    }

    fn end_turn(&self, outcome: &TurnOutcome) {
        *self.state.lock() = if *outcome == TurnOutcome::RoundLimit {
            AgentState::TerminatedByLimit
        } else {
            AgentState::Idle
        };
    }

    /// Append the raw user text, returning the history that preceded it
    fn start_history(&self, user_text: &str) -> Vec<ChatMessage> {
        let mut history = self.history.lock();
        let prior = history.clone();
        history.push(ChatMessage::user(user_text));
        prior
    }

    fn push_assistant(&self, content: String) -> String {
        self.history.lock().push(ChatMessage::assistant(content.clone()));
        content
    }

    async fn run_rounds(
        &self,
        user_text: &str,
        prior: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> TurnReport {
        let mut progress = TurnProgress {
            tools_used: Vec::new(),
            success: true,
            rounds: 0,
        };

        let context = match self.memory.relevant_context(user_text).await {
            Ok(context) => context,
            Err(e) => {
                let failure = AgentError::Persistence(e.to_string()).to_string();
                warn!("Context retrieval failed: {}", failure);
                let response = self.push_assistant(format!("Error: {}", failure));
                return progress.finish(response, TurnOutcome::Failed(failure));
            }
        };
        let enriched = if context.is_empty() {
            user_text.to_string()
        } else {
            format!("{}\n\n{}", context, user_text)
        };
        let schemas = self.tools.schemas();

        while progress.rounds < self.max_rounds {
            progress.rounds += 1;

            let messages = if progress.rounds == 1 {
                let mut messages = prior.to_vec();
                messages.push(ChatMessage::user(enriched.as_str()));
                messages
            } else {
                self.history()
            };

            let chat = AssertUnwindSafe(self.llm.chat(&messages, &schemas)).catch_unwind();
            let response: LlmResponse = tokio::select! {
                result = chat => match result {
                    Ok(response) => response,
                    Err(panic) => {
                        let failure = format!("LLM call panicked: {}", panic_message(panic.as_ref()));
                        error!("{}", failure);
                        let response = self.push_assistant(format!("Error: {}", failure));
                        return progress.finish(response, TurnOutcome::Failed(failure));
                    }
                },
                _ = cancel.cancelled() => return self.cancelled(progress),
            };

            if !response.has_tool_calls() {
                let text = response.text.trim();
                if text.is_empty() {
                    warn!("LLM returned an empty response in round {}", progress.rounds);
                    let response = self.push_assistant(EMPTY_RESPONSE_MESSAGE.to_string());
                    return progress.finish(response, TurnOutcome::Failed(EMPTY_RESPONSE_MESSAGE.to_string()));
                }
                let response = self.push_assistant(text.to_string());
                return progress.finish(response, TurnOutcome::Answered);
            }

            // Sequential: tools share device state
            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                progress.tools_used.push(call.tool_name.clone());
                let outcome = self.tools.execute(&call.tool_name, &call.params).await;

                // A tool that finished after cancellation has its result dropped
                if cancel.is_cancelled() {
                    return self.cancelled(progress);
                }
                if !outcome.success {
                    progress.success = false;
                }
                results.push(format!("[{}] {}", call.tool_name, outcome.render()));
            }

            let block = format!("Tool results:\n{}", results.join("\n"));
            let text = response.text.trim();
            let combined = if text.is_empty() {
                block
            } else {
                format!("{}\n\n{}", text, block)
            };
            self.push_assistant(combined);
        }

        let warning = AgentError::RoundLimitExceeded(self.max_rounds).to_string();
        warn!("{}", warning);
        let response = self.push_assistant(format!("{}. The task may be incomplete.", warning));
        progress.finish(response, TurnOutcome::RoundLimit)
    }

    fn cancelled(&self, progress: TurnProgress) -> TurnReport {
        info!("Turn cancelled after {} rounds", progress.rounds);
        let response = self.push_assistant(AgentError::Cancelled.to_string());
        progress.finish(response, TurnOutcome::Cancelled)
    }

    /// Count this turn against every lesson about a tool it used
    async fn record_lesson_outcomes(&self, tools_used: &[String], success: bool) {
        let distinct: BTreeSet<&str> = tools_used.iter().map(String::as_str).collect();
        for tool in distinct {
            let name = lesson_name(tool);
            match self.memory.record_skill_outcome(&name, success).await {
                Ok(true) => debug!("Recorded {} outcome for {}", if success { "success" } else { "failure" }, name),
                Ok(false) => {}
                Err(e) => warn!("Failed to record outcome for {}: {}", name, e),
            }
        }
    }
}
