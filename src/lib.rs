//! Confide: the prompt and memory core of a desktop companion-chat app.
//!
//! Two subsystems, meant to be embedded by a host UI:
//!
//! * [`prompt`] composes layered, placeholder-driven prompts: system-shipped
//!   blocks with user overrides, three-phase placeholder resolution, variant
//!   selection, factory reset, and archive export/import.
//! * [`memory`] keeps per-persona tiered memory files current by running a
//!   bounded tool-use loop against an OpenAI-compatible LLM whenever a
//!   conversation advances a full cycle.
//!
//! The remaining modules are the plumbing both share: [`config`] for the
//! TOML engine config, [`llm`] for the chat-completions client,
//! [`toolloop`] for the capability loop, [`conversation`] for read-only
//! history access, and [`fsutil`] for atomic persistence.

pub mod config;
pub mod conversation;
pub mod fsutil;
pub mod llm;
pub mod memory;
pub mod persona;
pub mod prompt;
pub mod toolloop;

pub use config::EngineConfig;
pub use conversation::{ChatTurn, ConversationStore, SqliteConversationStore};
pub use llm::{ChatTransport, LlmClient, LlmError};
pub use memory::orchestrator::{MemoryOrchestrator, ScheduleOutcome};
pub use memory::tracker::{CycleProgress, CycleTracker};
pub use memory::{MemoryFileStore, MemorySettings, MemorySettingsStore, MemorySlot};
pub use persona::Descriptors;
pub use prompt::{BuildRequest, PromptBuild, PromptEngine, PromptPaths};
pub use toolloop::{run_tool_loop, ToolLoopRequest, ToolLoopResult};

use tracing_subscriber::EnvFilter;

/// Install the default tracing subscriber. Hosts with their own subscriber
/// skip this; `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,confide=debug")),
        )
        .init();
}
