//! Atomic file persistence helpers.
//!
//! Every mutable document in this crate (layer docs, content files, cycle
//! state, memory files) goes through `write_atomic`: the payload is written
//! to a temp sibling and renamed over the target, so a crash mid-write never
//! leaves a partially-written file as the visible one.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Write `bytes` to `path` via a temp sibling + rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Invalid target path for atomic write")?;
    let tmp = path.with_file_name(format!("{}.tmp", file_name));

    fs::write(&tmp, bytes).with_context(|| format!("Failed to write temp file {:?}", tmp))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move temp file into place at {:?}", path))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize document for {:?}", path))?;
    write_atomic(path, json.as_bytes())
}

/// Load and parse a JSON document.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}

/// Write plain text atomically.
pub fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    write_atomic(path, text.as_bytes())
}
