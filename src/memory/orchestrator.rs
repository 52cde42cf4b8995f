//! Tiered memory-update orchestration.
//!
//! After each stored message the host calls [`MemoryOrchestrator::on_message`].
//! When the cycle tracker says a full cycle has passed, and the persona has
//! updates enabled, and neither the cooldown nor an in-flight run blocks it,
//! a background task drives the tool-use loop: the model reads the current
//! memory files, sees the recent conversation, and rewrites the files through
//! the `read_memory_file` / `write_memory_file` capabilities.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::conversation::ConversationStore;
use crate::llm::{ChatMessage, ChatTransport, ToolDef};
use crate::memory::tracker::CycleTracker;
use crate::memory::{MemoryFileStore, MemorySettingsStore, MemorySlot};
use crate::prompt::compose::CategoryFilter;
use crate::prompt::metadata::BlockCategory;
use crate::prompt::{BuildRequest, PromptEngine};
use crate::toolloop::{self, ToolExecutor, ToolLoopRequest, ToolLoopResult};

/// Why a call to [`MemoryOrchestrator::on_message`] did or did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// The cycle has not completed yet.
    NotDue,
    /// A run finished too recently for this persona.
    RateLimited,
    /// A run for this persona is still in flight.
    AlreadyRunning,
    /// Updates are switched off for this persona.
    Disabled,
}

pub struct MemoryOrchestrator {
    prompt: Arc<Mutex<PromptEngine>>,
    memory: Arc<MemoryFileStore>,
    settings: Arc<MemorySettingsStore>,
    tracker: Arc<CycleTracker>,
    conversations: Arc<dyn ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    context_window: u64,
    cooldown: Duration,
    last_run: Mutex<HashMap<String, Instant>>,
    in_flight: Mutex<HashSet<String>>,
}

impl MemoryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt: Arc<Mutex<PromptEngine>>,
        memory: Arc<MemoryFileStore>,
        settings: Arc<MemorySettingsStore>,
        tracker: Arc<CycleTracker>,
        conversations: Arc<dyn ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        context_window: u64,
        cooldown: Duration,
    ) -> Self {
        Self {
            prompt,
            memory,
            settings,
            tracker,
            conversations,
            transport,
            context_window,
            cooldown,
            last_run: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Check the trigger and, when due, start a detached background run.
    /// Never blocks the caller on the LLM.
    pub fn on_message(
        self: &Arc<Self>,
        persona_id: &str,
        conversation_id: &str,
    ) -> anyhow::Result<ScheduleOutcome> {
        let settings = self.settings.get(persona_id);
        if !settings.enabled {
            return Ok(ScheduleOutcome::Disabled);
        }

        let count = self
            .conversations
            .message_count(persona_id, conversation_id)?;
        let due = self.tracker.advance(
            persona_id,
            conversation_id,
            count,
            self.context_window,
            settings.frequency,
        )?;
        if !due {
            return Ok(ScheduleOutcome::NotDue);
        }

        if let Ok(last_run) = self.last_run.lock() {
            if let Some(at) = last_run.get(persona_id) {
                if at.elapsed() < self.cooldown {
                    tracing::debug!("Memory update for '{}' suppressed by cooldown", persona_id);
                    return Ok(ScheduleOutcome::RateLimited);
                }
            }
        }

        {
            let mut in_flight = match self.in_flight.lock() {
                Ok(set) => set,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !in_flight.insert(persona_id.to_string()) {
                return Ok(ScheduleOutcome::AlreadyRunning);
            }
        }

        let orchestrator = Arc::clone(self);
        let persona = persona_id.to_string();
        let conversation = conversation_id.to_string();
        tokio::spawn(async move {
            let result = orchestrator.run_update(&persona, &conversation).await;
            match &result {
                Ok(outcome) => tracing::info!(
                    "Memory update for '{}' finished after {} round(s), {} call(s)",
                    persona,
                    outcome.rounds,
                    outcome.calls.len()
                ),
                Err(e) => tracing::warn!("Memory update for '{}' failed: {:#}", persona, e),
            }
            orchestrator.finish(&persona);
        });

        Ok(ScheduleOutcome::Scheduled)
    }

    fn finish(&self, persona_id: &str) {
        if let Ok(mut last_run) = self.last_run.lock() {
            last_run.insert(persona_id.to_string(), Instant::now());
        }
        let mut in_flight = match self.in_flight.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(persona_id);
    }

    /// One complete update pass. Public so hosts can offer a manual
    /// "update memory now" action that bypasses the trigger.
    pub async fn run_update(
        &self,
        persona_id: &str,
        conversation_id: &str,
    ) -> anyhow::Result<ToolLoopResult> {
        let turns = self.conversations.recent_turns(
            persona_id,
            conversation_id,
            self.context_window as usize,
        )?;

        // Current memory contents flow in as runtime placeholders so the
        // maintenance blocks can quote them.
        let mut request = BuildRequest {
            filter: CategoryFilter::Only(vec![BlockCategory::MemoryUpdate]),
            ..BuildRequest::default()
        };
        for slot in MemorySlot::ALL {
            request.runtime.insert(
                format!("memory_{}", slot.as_str()),
                self.memory.read_file(persona_id, slot),
            );
        }

        let system_text = {
            let prompt = match self.prompt.lock() {
                Ok(engine) => engine,
                Err(poisoned) => poisoned.into_inner(),
            };
            prompt.build(&request).system_text
        };

        let mut messages: Vec<ChatMessage> = turns
            .iter()
            .map(|t| ChatMessage::text(&t.role, t.text.clone()))
            .collect();
        messages.push(ChatMessage::text(
            "user",
            "Review the conversation above and bring your memory files up to date.",
        ));

        let executor = SlotExecutor {
            memory: Arc::clone(&self.memory),
            persona_id: persona_id.to_string(),
        };
        let result = toolloop::run_tool_loop(
            self.transport.as_ref(),
            ToolLoopRequest::new(system_text, messages, memory_toolset()),
            &executor,
        )
        .await?;
        Ok(result)
    }
}

/// The two capabilities the update loop exposes.
fn memory_toolset() -> Vec<ToolDef> {
    let file_schema = json!({
        "type": "string",
        "enum": ["profile", "episodes", "diary"],
        "description": "Which memory file",
    });
    vec![
        ToolDef::function(
            "read_memory_file",
            "Read the current contents of one memory file.",
            json!({
                "type": "object",
                "properties": { "file": file_schema },
                "required": ["file"],
            }),
        ),
        ToolDef::function(
            "write_memory_file",
            "Replace one memory file with new contents.",
            json!({
                "type": "object",
                "properties": {
                    "file": file_schema,
                    "content": { "type": "string", "description": "Full new contents" },
                },
                "required": ["file", "content"],
            }),
        ),
    ]
}

struct SlotExecutor {
    memory: Arc<MemoryFileStore>,
    persona_id: String,
}

impl SlotExecutor {
    fn slot(input: &Value) -> anyhow::Result<MemorySlot> {
        let name = input["file"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'file' argument"))?;
        MemorySlot::parse(name)
            .ok_or_else(|| anyhow::anyhow!("unknown memory file '{}'", name))
    }
}

#[async_trait]
impl ToolExecutor for SlotExecutor {
    async fn execute(&self, name: &str, input: &Value) -> anyhow::Result<String> {
        match name {
            "read_memory_file" => {
                let slot = Self::slot(input)?;
                let text = self.memory.read_file(&self.persona_id, slot);
                if text.is_empty() {
                    Ok("(empty)".to_string())
                } else {
                    Ok(text)
                }
            }
            "write_memory_file" => {
                let slot = Self::slot(input)?;
                let content = input["content"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("missing 'content' argument"))?;
                self.memory.write_file(&self.persona_id, slot, content)?;
                Ok(format!("{} saved", slot.file_name()))
            }
            other => anyhow::bail!("unknown capability '{}'", other),
        }
    }
}
