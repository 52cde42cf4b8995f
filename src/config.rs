use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Memory subsystem defaults. Per-persona `enabled`/`frequency` overrides
/// live in the settings document, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_enabled")]
    pub default_enabled: bool,
    /// Fraction of the context window between memory updates (0.0-1.0).
    #[serde(default = "default_memory_frequency")]
    pub default_frequency: f64,
    #[serde(default = "default_cooldown_secs")]
    pub update_cooldown_secs: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

fn default_memory_enabled() -> bool {
    true
}

fn default_memory_frequency() -> f64 {
    0.5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_file_bytes() -> usize {
    16 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_enabled: default_memory_enabled(),
            default_frequency: default_memory_frequency(),
            update_cooldown_secs: default_cooldown_secs(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    /// Context window measured in conversation messages.
    #[serde(default = "default_context_window")]
    pub context_window: u64,

    /// Root directory for all persisted engine documents.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_context_window() -> u64 {
    100
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .map(|d| d.join("confide"))
        .unwrap_or_else(|| PathBuf::from("confide_data"))
        .to_string_lossy()
        .into_owned()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            context_window: default_context_window(),
            data_dir: default_data_dir(),
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> PathBuf {
        PathBuf::from(default_data_dir()).join("confide_config.toml")
    }

    /// Load config from the data directory, falling back to defaults + env vars.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(contents) = fs::read_to_string(path) {
            match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("CONFIDE_LLM_API_URL") {
            config.llm_api_url = url;
        }
        if let Ok(model) = env::var("CONFIDE_LLM_MODEL") {
            config.llm_model = model;
        }
        if let Ok(key) = env::var("CONFIDE_LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }
        if let Ok(dir) = env::var("CONFIDE_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = dir;
            }
        }
        if let Ok(window) = env::var("CONFIDE_CONTEXT_WINDOW") {
            if let Ok(messages) = window.parse() {
                config.context_window = messages;
            }
        }
        if let Ok(freq) = env::var("CONFIDE_MEMORY_FREQUENCY") {
            if let Ok(value) = freq.parse::<f64>() {
                config.memory.default_frequency = value.clamp(0.01, 1.0);
            }
        }

        config
    }
}
