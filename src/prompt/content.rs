//! Prompt block content: variant texts and multi-turn dialogue snippets.
//!
//! Content lives in JSON files under the content directory, one file per
//! `content_ref`. Each file maps block ids to their variant table so related
//! blocks can ship together and be factory-reset as a unit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::prompt::metadata::{LoadError, DOC_VERSION};

/// One scripted turn inside a multi-turn variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub role: String,
    pub text: String,
}

/// One variant of a block's content. Text blocks fill `text`, multi-turn
/// blocks fill `turns`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub turns: Option<Vec<DialogueTurn>>,
}

/// Content for one block: a named variant table plus the placeholder keys
/// the author expects the text to use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockContent {
    #[serde(default)]
    pub variants: BTreeMap<String, Variant>,
    #[serde(default)]
    pub declared_placeholders: Vec<String>,
}

impl BlockContent {
    /// The requested variant, falling back to `"default"` when the name is
    /// absent. Returns `None` only when the fallback itself is missing.
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants
            .get(name)
            .or_else(|| self.variants.get("default"))
    }
}

/// One persisted content file: a version tag plus a block-id-keyed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentFile {
    pub version: u32,
    #[serde(default = "BTreeMap::new")]
    pub blocks: BTreeMap<String, BlockContent>,
}

impl Default for ContentFile {
    fn default() -> Self {
        Self {
            version: DOC_VERSION,
            blocks: BTreeMap::new(),
        }
    }
}

/// All loaded content files, keyed by `content_ref` (the file stem).
pub struct ContentStore {
    dir: PathBuf,
    files: BTreeMap<String, ContentFile>,
    load_errors: Vec<LoadError>,
}

impl ContentStore {
    /// Load only the files the merged configuration references, each by its
    /// stem. A missing file is silently absent (its blocks render empty);
    /// a broken one is reported and skipped without affecting the rest.
    pub fn load_referenced(dir: impl Into<PathBuf>, referenced: &[String]) -> Self {
        let dir = dir.into();
        let mut files = BTreeMap::new();
        let mut load_errors = Vec::new();

        for name in referenced {
            let path = dir.join(format!("{}.json", name));
            if !path.exists() {
                continue;
            }
            match fsutil::load_json::<ContentFile>(&path) {
                Ok(file) => {
                    files.insert(name.clone(), file);
                }
                Err(e) => {
                    tracing::error!("Content file {:?} failed to load: {:#}", path, e);
                    load_errors.push(LoadError {
                        file: path.to_string_lossy().into_owned(),
                        detail: format!("{:#}", e),
                    });
                }
            }
        }

        Self {
            dir,
            files,
            load_errors,
        }
    }

    /// Load every `*.json` in the content directory. A file that fails to
    /// parse is skipped and reported; the rest still load.
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let mut files = BTreeMap::new();
        let mut load_errors = Vec::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => {
                // Directory absent on first run; repair will seed it.
                return Self {
                    dir,
                    files,
                    load_errors,
                };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match fsutil::load_json::<ContentFile>(&path) {
                Ok(file) => {
                    files.insert(stem.to_string(), file);
                }
                Err(e) => {
                    tracing::error!("Content file {:?} failed to load: {:#}", path, e);
                    load_errors.push(LoadError {
                        file: path.to_string_lossy().into_owned(),
                        detail: format!("{:#}", e),
                    });
                }
            }
        }

        Self {
            dir,
            files,
            load_errors,
        }
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn file(&self, content_ref: &str) -> Option<&ContentFile> {
        self.files.get(content_ref)
    }

    /// Content for one block inside one file.
    pub fn block(&self, content_ref: &str, block_id: &str) -> Option<&BlockContent> {
        self.files.get(content_ref)?.blocks.get(block_id)
    }

    /// Insert or replace one block's content and persist its file.
    pub fn save_block(
        &mut self,
        content_ref: &str,
        block_id: &str,
        content: BlockContent,
    ) -> Result<()> {
        let file = self.files.entry(content_ref.to_string()).or_default();
        file.blocks.insert(block_id.to_string(), content);
        self.persist(content_ref)
    }

    pub fn delete_block(&mut self, content_ref: &str, block_id: &str) -> Result<()> {
        if let Some(file) = self.files.get_mut(content_ref) {
            if file.blocks.remove(block_id).is_some() {
                return self.persist(content_ref);
            }
        }
        Ok(())
    }

    /// Replace one file wholesale (import, factory reset).
    pub fn replace_file(&mut self, content_ref: &str, file: ContentFile) -> Result<()> {
        self.files.insert(content_ref.to_string(), file);
        self.persist(content_ref)
    }

    pub fn files(&self) -> &BTreeMap<String, ContentFile> {
        &self.files
    }

    /// Reset every file to its copy under `factory_dir`. Files with no
    /// factory counterpart are left alone.
    pub fn reset_from_factory(&mut self, factory_dir: &Path) -> Result<Vec<String>> {
        let mut restored = Vec::new();
        let entries = fs::read_dir(factory_dir)
            .with_context(|| format!("Failed to read factory dir {:?}", factory_dir))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let file: ContentFile = fsutil::load_json(&path)
                .with_context(|| format!("Factory content {:?} is unreadable", path))?;
            self.files.insert(stem.to_string(), file);
            self.persist(stem)?;
            restored.push(stem.to_string());
        }
        Ok(restored)
    }

    fn persist(&self, content_ref: &str) -> Result<()> {
        let file = self
            .files
            .get(content_ref)
            .context("Cannot persist a content file that is not loaded")?;
        fsutil::save_json(&self.dir.join(format!("{}.json", content_ref)), file)
    }
}
