//! Persona long-term memory: tiered text files, per-persona settings, and
//! the update orchestration built on top of them.

pub mod orchestrator;
pub mod tracker;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::fsutil;

/// The three memory tiers a persona maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySlot {
    /// Stable facts about the user and the relationship.
    Profile,
    /// Condensed records of notable events.
    Episodes,
    /// The persona's own running diary.
    Diary,
}

impl MemorySlot {
    pub const ALL: [MemorySlot; 3] = [MemorySlot::Profile, MemorySlot::Episodes, MemorySlot::Diary];

    pub fn as_str(self) -> &'static str {
        match self {
            MemorySlot::Profile => "profile",
            MemorySlot::Episodes => "episodes",
            MemorySlot::Diary => "diary",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.txt", self.as_str())
    }

    pub fn parse(name: &str) -> Option<MemorySlot> {
        match name {
            "profile" => Some(MemorySlot::Profile),
            "episodes" => Some(MemorySlot::Episodes),
            "diary" => Some(MemorySlot::Diary),
            _ => None,
        }
    }
}

/// Plain-text memory files on disk, one directory per persona, with a
/// write-through cache so prompt builds never wait on the filesystem.
pub struct MemoryFileStore {
    root: PathBuf,
    max_file_bytes: usize,
    cache: Mutex<HashMap<(String, MemorySlot), String>>,
}

impl MemoryFileStore {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, persona_id: &str, slot: MemorySlot) -> PathBuf {
        self.root.join(persona_id).join(slot.file_name())
    }

    /// Read one slot. A missing file is an empty memory, not an error.
    pub fn read_file(&self, persona_id: &str, slot: MemorySlot) -> String {
        if let Ok(cache) = self.cache.lock() {
            if let Some(text) = cache.get(&(persona_id.to_string(), slot)) {
                return text.clone();
            }
        }

        let text = std::fs::read_to_string(self.file_path(persona_id, slot)).unwrap_or_default();
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert((persona_id.to_string(), slot), text.clone());
        }
        text
    }

    /// Replace one slot's contents. Oversized text is truncated at the last
    /// char boundary under the byte cap before the atomic write.
    pub fn write_file(&self, persona_id: &str, slot: MemorySlot, text: &str) -> Result<()> {
        let text = truncate_at_char_boundary(text, self.max_file_bytes);
        fsutil::write_text_atomic(&self.file_path(persona_id, slot), text)?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert((persona_id.to_string(), slot), text.to_string());
        }
        Ok(())
    }

    /// Every slot for one persona, for prompt injection.
    pub fn read_all(&self, persona_id: &str) -> HashMap<MemorySlot, String> {
        MemorySlot::ALL
            .into_iter()
            .map(|slot| (slot, self.read_file(persona_id, slot)))
            .collect()
    }
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    tracing::warn!(
        "Memory write of {} bytes truncated to {} bytes",
        text.len(),
        end
    );
    &text[..end]
}

fn default_enabled() -> bool {
    true
}

fn default_frequency() -> f64 {
    0.5
}

/// Per-persona memory-update settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fraction of the context window between updates, in (0, 1].
    #[serde(default = "default_frequency")]
    pub frequency: f64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            frequency: default_frequency(),
        }
    }
}

/// JSON-backed map of persona id to settings; unknown personas get defaults.
pub struct MemorySettingsStore {
    path: PathBuf,
    defaults: MemorySettings,
    settings: Mutex<HashMap<String, MemorySettings>>,
}

impl MemorySettingsStore {
    pub fn load(path: impl Into<PathBuf>, defaults: MemorySettings) -> Self {
        let path = path.into();
        let settings = match fsutil::load_json::<HashMap<String, MemorySettings>>(&path) {
            Ok(map) => map,
            Err(e) if path.exists() => {
                tracing::warn!("Memory settings {:?} unreadable ({:#}), using defaults", path, e);
                HashMap::new()
            }
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            defaults,
            settings: Mutex::new(settings),
        }
    }

    pub fn get(&self, persona_id: &str) -> MemorySettings {
        self.settings
            .lock()
            .ok()
            .and_then(|map| map.get(persona_id).copied())
            .unwrap_or(self.defaults)
    }

    pub fn set(&self, persona_id: &str, settings: MemorySettings) -> Result<()> {
        let snapshot = {
            let mut map = match self.settings.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.insert(persona_id.to_string(), settings);
            map.clone()
        };
        fsutil::save_json(&self.path, &snapshot)
    }
}
