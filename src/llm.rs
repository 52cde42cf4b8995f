//! OpenAI-compatible completion client (Ollama, LM Studio, vLLM, OpenAI, etc.)
//!
//! Three entry points: `complete` for a single request, `stream` for
//! chunk-by-chunk delivery over a channel, and the `ChatTransport` trait the
//! tool-use loop drives so tests can substitute a scripted fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;

/// Classified remote-service failures. Quota exhaustion gets its own code so
/// the host can surface it distinctly; everything else passes through.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API credential is not configured")]
    CredentialMissing,

    #[error("LLM provider reports exhausted credit or quota: {0}")]
    QuotaExhausted(String),

    #[error("LLM API error {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("LLM request failed: {0}")]
    Transport(String),

    #[error("invalid LLM response: {0}")]
    InvalidResponse(String),
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// A message on the chat-completions wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Tool call as returned by the model (OpenAI format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCallPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallPayload {
    pub name: String,
    /// JSON-encoded arguments string, as the wire format has it.
    pub arguments: String,
}

/// OpenAI-format capability definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDef {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Token usage, accumulated across tool-loop rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn accumulate(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Vec<ToolDef>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            system: None,
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: 4096,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Events delivered by `LlmClient::stream`. The channel is finite: after
/// `Done` or `Error` nothing further is sent and the sender is dropped.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Done { full_text: String },
    Error(String),
}

/// Seam between the tool-use loop and the network. The production
/// implementation is `LlmClient`; tests script this trait instead.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn credential_present(&self) -> bool {
        true
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            api_url,
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.llm_api_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
        )
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ChatMessage::text("system", system.clone()));
        }
        messages.extend(request.messages.iter().cloned());

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools).unwrap_or(Value::Null);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> LlmResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_remote_failure(status, body));
        }
        Ok(response)
    }

    /// Stream a completion. Chunks arrive over the returned channel as the
    /// provider emits SSE deltas; the producer task ends the stream with
    /// `Done` or `Error`.
    pub fn stream(&self, request: CompletionRequest) -> flume::Receiver<StreamEvent> {
        let (tx, rx) = flume::unbounded();
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.stream_into(&request, &tx).await {
                let _ = tx.send(StreamEvent::Error(e.to_string()));
            }
        });
        rx
    }

    async fn stream_into(
        &self,
        request: &CompletionRequest,
        tx: &flume::Sender<StreamEvent>,
    ) -> LlmResult<()> {
        let body = self.request_body(request, true);
        let mut response = self.post(&body).await?;

        let mut full_text = String::new();
        let mut line_buffer = String::new();
        let mut saw_done = false;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?
        {
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_idx) = line_buffer.find('\n') {
                let line = line_buffer[..newline_idx].trim().to_string();
                line_buffer = line_buffer[newline_idx + 1..].to_string();

                let Some(payload) = sse_data_payload(&line) else {
                    continue;
                };
                if payload == "[DONE]" {
                    saw_done = true;
                    break;
                }
                match stream_delta_content(payload) {
                    Ok(Some(delta)) => {
                        full_text.push_str(&delta);
                        let _ = tx.send(StreamEvent::Chunk(delta));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            }

            if saw_done {
                break;
            }
        }

        let _ = tx.send(StreamEvent::Done { full_text });
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for LlmClient {
    fn credential_present(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse> {
        let body = self.request_body(request, false);
        let response = self.post(&body).await?;

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        parse_completion(&response_json)
    }
}

/// SSE framing: `data: {...}` lines carry payloads; comments and other
/// fields are ignored.
fn sse_data_payload(line: &str) -> Option<&str> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(str::trim)
}

fn stream_delta_content(payload: &str) -> LlmResult<Option<String>> {
    let chunk_json: Value = serde_json::from_str(payload)
        .map_err(|e| LlmError::InvalidResponse(format!("bad stream payload: {}", e)))?;
    let delta = chunk_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|choice| choice["delta"]["content"].as_str())
        .map(String::from);
    Ok(delta)
}

fn parse_completion(response_json: &Value) -> LlmResult<CompletionResponse> {
    let choice = response_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| LlmError::InvalidResponse("empty choices".to_string()))?;

    let message = &choice["message"];
    let content = message["content"].as_str().map(String::from);
    let tool_calls: Option<Vec<ToolCallPayload>> = message
        .get("tool_calls")
        .and_then(|tc| serde_json::from_value(tc.clone()).ok());
    let finish_reason = choice["finish_reason"]
        .as_str()
        .unwrap_or("stop")
        .to_string();

    let usage: Usage = response_json
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    Ok(CompletionResponse {
        message: ChatMessage {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        },
        usage,
        finish_reason,
    })
}

/// Map an HTTP failure to the error taxonomy. Providers disagree on the
/// wording for exhausted credit, so the body is matched loosely.
fn classify_remote_failure(status: u16, body: String) -> LlmError {
    let lowered = body.to_lowercase();
    let quota_hit = status == 402
        || lowered.contains("insufficient credit")
        || lowered.contains("insufficient balance")
        || lowered.contains("insufficient_quota")
        || lowered.contains("quota exceeded")
        || (lowered.contains("billing") && lowered.contains("limit"));
    if quota_hit {
        LlmError::QuotaExhausted(body)
    } else {
        LlmError::Remote { status, body }
    }
}

/// Pull the first message out of a completion body; used by hosts that call
/// `complete` and only want text back.
pub fn response_text(response: &CompletionResponse) -> String {
    response.message.content.clone().unwrap_or_default()
}
