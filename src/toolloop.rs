//! Bounded multi-round tool-use request loop.
//!
//! Drives an OpenAI-format tool-calling conversation against a
//! `ChatTransport`: send the turn list, execute whatever capabilities the
//! model invoked, feed the results back, repeat. The loop is strictly
//! sequential, capped at `MAX_TOOL_ROUNDS`, and records every call it made.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::llm::{
    ChatMessage, ChatTransport, CompletionRequest, CompletionResponse, LlmError, ToolDef, Usage,
};

/// Hard round cap. A model that keeps asking for tools terminates here with
/// `StopReason::MaxRoundsReached` rather than an error.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// One executed capability call, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub round: usize,
    pub tool_name: String,
    pub tool_input: Value,
    pub call_id: String,
    pub success: bool,
    pub result_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model stopped on its own; carries the provider's finish reason.
    Model(String),
    MaxRoundsReached,
}

#[derive(Debug, Clone)]
pub struct ToolLoopResult {
    pub text: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    pub calls: Vec<ToolCallRecord>,
    pub rounds: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolLoopError {
    #[error("no capabilities supplied for tool-use request")]
    EmptyToolset,

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Executes one capability call. `Err` and failure text are both recorded as
/// a failed call and fed back to the model; neither aborts the loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, input: &Value) -> anyhow::Result<String>;
}

pub struct ToolLoopRequest {
    pub system: String,
    pub turns: Vec<ChatMessage>,
    pub tools: Vec<ToolDef>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ToolLoopRequest {
    pub fn new(system: impl Into<String>, turns: Vec<ChatMessage>, tools: Vec<ToolDef>) -> Self {
        Self {
            system: system.into(),
            turns,
            tools,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Run the loop to completion. Missing credential and an empty toolset are
/// hard failures raised before any network round trip.
pub async fn run_tool_loop(
    transport: &dyn ChatTransport,
    request: ToolLoopRequest,
    executor: &dyn ToolExecutor,
) -> Result<ToolLoopResult, ToolLoopError> {
    if request.tools.is_empty() {
        return Err(ToolLoopError::EmptyToolset);
    }
    if !transport.credential_present() {
        return Err(ToolLoopError::Llm(LlmError::CredentialMissing));
    }

    let mut messages = request.turns;
    let mut usage = Usage::default();
    let mut calls: Vec<ToolCallRecord> = Vec::new();
    let mut last_text = String::new();
    let mut round = 0;

    loop {
        round += 1;
        if round > MAX_TOOL_ROUNDS {
            tracing::warn!("Tool loop hit round limit ({})", MAX_TOOL_ROUNDS);
            return Ok(ToolLoopResult {
                text: last_text,
                usage,
                stop_reason: StopReason::MaxRoundsReached,
                calls,
                rounds: round - 1,
            });
        }

        tracing::debug!("Tool loop round {} — calling LLM", round);
        let response = transport
            .complete(&CompletionRequest {
                system: Some(request.system.clone()),
                messages: messages.clone(),
                temperature: request.temperature,
                max_tokens: request.max_tokens,
                tools: request.tools.clone(),
            })
            .await?;

        usage.accumulate(response.usage);
        if let Some(content) = response.message.content.as_deref() {
            if !content.is_empty() {
                last_text = content.to_string();
            }
        }

        let tool_calls = match pending_tool_calls(&response) {
            Some(tc) => tc,
            None => {
                tracing::debug!("Tool loop completed in {} round(s)", round);
                return Ok(ToolLoopResult {
                    text: response.message.content.unwrap_or_default(),
                    usage,
                    stop_reason: StopReason::Model(response.finish_reason),
                    calls,
                    rounds: round,
                });
            }
        };

        // Keep the model's turn, tool-call content included, then answer
        // every call in order.
        messages.push(response.message.clone());

        for tc in &tool_calls {
            let input: Value = serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                tracing::warn!("Tool arguments are not valid JSON: {}", e);
                serde_json::json!({})
            });
            let call_id = if tc.id.trim().is_empty() {
                format!("call_{}", uuid::Uuid::new_v4())
            } else {
                tc.id.clone()
            };

            let (success, result_text) = match executor.execute(&tc.function.name, &input).await {
                Ok(text) => (true, text),
                Err(e) => {
                    tracing::warn!("Capability '{}' failed: {:#}", tc.function.name, e);
                    (false, format!("error: {:#}", e))
                }
            };

            calls.push(ToolCallRecord {
                round,
                tool_name: tc.function.name.clone(),
                tool_input: input,
                call_id: call_id.clone(),
                success,
                result_text: result_text.clone(),
            });

            messages.push(ChatMessage::tool_result(&call_id, result_text));
        }
    }
}

fn pending_tool_calls(response: &CompletionResponse) -> Option<Vec<crate::llm::ToolCallPayload>> {
    response
        .message
        .tool_calls
        .as_ref()
        .filter(|tc| !tc.is_empty())
        .cloned()
}
