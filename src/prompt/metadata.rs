//! Two-layer (system/user) configuration store for prompt blocks and
//! placeholder definitions.
//!
//! System documents ship with the product; user documents are created at
//! runtime and win on id collision. A missing or broken user document
//! degrades to an empty one; a broken system document is recorded as a load
//! error and the store keeps running with whatever loaded.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::persona::DescriptorDoc;

pub const DOC_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    System,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    MultiTurn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTarget {
    SystemText,
    Message,
    Pretext,
}

/// Assembly slot within the target artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockPosition {
    Head,
    Body,
    Tail,
    BeforeHistory,
    FirstTurn,
    AfterHistory,
}

impl BlockPosition {
    /// Rank within the system-text artifact; message slots sort after.
    pub fn rank(self) -> u8 {
        match self {
            BlockPosition::Head => 0,
            BlockPosition::Body => 1,
            BlockPosition::Tail => 2,
            BlockPosition::BeforeHistory => 3,
            BlockPosition::FirstTurn => 4,
            BlockPosition::AfterHistory => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    Core,
    Persona,
    Scene,
    Guideline,
    MemoryUpdate,
    Utility,
}

impl BlockCategory {
    /// Categories assembled into ordinary chat prompts. The rest only appear
    /// when a caller filters them in explicitly.
    pub fn conversational(self) -> bool {
        !matches!(self, BlockCategory::MemoryUpdate | BlockCategory::Utility)
    }
}

/// Metadata for one prompt block. The text/turns themselves live in the
/// content store under `content_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptBlock {
    pub id: String,
    pub name: String,
    pub kind: BlockKind,
    pub target: BlockTarget,
    pub position: BlockPosition,
    pub order: i32,
    pub enabled: bool,
    pub content_ref: String,
    pub category: BlockCategory,
    #[serde(default)]
    pub variant_condition: Option<String>,
    /// Placeholder keys gating inclusion: empty means always included,
    /// otherwise at least one key must resolve non-empty.
    #[serde(default)]
    pub requires_any: Vec<String>,
    /// Stamped from the owning layer on load, never persisted.
    #[serde(skip)]
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePhase {
    #[default]
    Static,
    Computed,
    Runtime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSource {
    pub doc: DescriptorDoc,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Scalar,
    List,
}

fn default_join() -> String {
    ", ".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderDef {
    pub key: String,
    pub phase: ResolvePhase,
    #[serde(default)]
    pub source: Option<StaticSource>,
    /// Named computed function, for `phase = computed`.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub value_kind: ValueKind,
    #[serde(default = "default_join")]
    pub join_with: String,
    #[serde(skip)]
    pub origin: Origin,
}

/// One persisted layer document: a version tag plus an id-keyed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDoc<T> {
    pub version: u32,
    #[serde(default = "BTreeMap::new")]
    pub entries: BTreeMap<String, T>,
}

impl<T> Default for LayerDoc<T> {
    fn default() -> Self {
        Self {
            version: DOC_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// A document that failed to load, reported but never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub file: String,
    pub detail: String,
}

/// File locations for the four layer documents.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub system_blocks: PathBuf,
    pub user_blocks: PathBuf,
    pub system_placeholders: PathBuf,
    pub user_placeholders: PathBuf,
}

impl StorePaths {
    pub fn under(root: &Path) -> Self {
        Self {
            system_blocks: root.join("system").join("blocks.json"),
            user_blocks: root.join("user").join("blocks.json"),
            system_placeholders: root.join("system").join("placeholders.json"),
            user_placeholders: root.join("user").join("placeholders.json"),
        }
    }
}

pub struct ConfigStore {
    paths: StorePaths,
    system_blocks: LayerDoc<PromptBlock>,
    user_blocks: LayerDoc<PromptBlock>,
    system_placeholders: LayerDoc<PlaceholderDef>,
    user_placeholders: LayerDoc<PlaceholderDef>,
    load_errors: Vec<LoadError>,
}

impl ConfigStore {
    /// Load both layers. Never fails: problems land in `load_errors`.
    pub fn load(paths: StorePaths) -> Self {
        let mut load_errors = Vec::new();

        let system_blocks =
            load_system_doc(&paths.system_blocks, &mut load_errors);
        let system_placeholders =
            load_system_doc(&paths.system_placeholders, &mut load_errors);
        let user_blocks = load_user_doc(&paths.user_blocks);
        let user_placeholders = load_user_doc(&paths.user_placeholders);

        let mut store = Self {
            paths,
            system_blocks,
            user_blocks,
            system_placeholders,
            user_placeholders,
            load_errors,
        };
        store.stamp_origins();
        store
    }

    fn stamp_origins(&mut self) {
        for block in self.system_blocks.entries.values_mut() {
            block.origin = Origin::System;
        }
        for block in self.user_blocks.entries.values_mut() {
            block.origin = Origin::User;
        }
        for def in self.system_placeholders.entries.values_mut() {
            def.origin = Origin::System;
        }
        for def in self.user_placeholders.entries.values_mut() {
            def.origin = Origin::User;
        }
    }

    pub fn load_errors(&self) -> &[LoadError] {
        &self.load_errors
    }

    /// User-wins merged view of the blocks, resolved origin included.
    pub fn merged_blocks(&self) -> Vec<PromptBlock> {
        merge_layers(&self.system_blocks.entries, &self.user_blocks.entries, "block")
    }

    pub fn merged_placeholders(&self) -> Vec<PlaceholderDef> {
        merge_layers(
            &self.system_placeholders.entries,
            &self.user_placeholders.entries,
            "placeholder",
        )
    }

    pub fn get_block(&self, id: &str) -> Option<PromptBlock> {
        self.user_blocks
            .entries
            .get(id)
            .or_else(|| self.system_blocks.entries.get(id))
            .cloned()
    }

    pub fn get_placeholder(&self, key: &str) -> Option<PlaceholderDef> {
        self.user_placeholders
            .entries
            .get(key)
            .or_else(|| self.system_placeholders.entries.get(key))
            .cloned()
    }

    /// Route a block write to the layer its origin names and persist it.
    pub fn save_block(&mut self, block: PromptBlock) -> Result<()> {
        match block.origin {
            Origin::System => {
                self.system_blocks.entries.insert(block.id.clone(), block);
                fsutil::save_json(&self.paths.system_blocks, &self.system_blocks)
            }
            Origin::User => {
                self.user_blocks.entries.insert(block.id.clone(), block);
                fsutil::save_json(&self.paths.user_blocks, &self.user_blocks)
            }
        }
    }

    /// New blocks always land in the user layer.
    pub fn create_block(&mut self, mut block: PromptBlock) -> Result<()> {
        if self.get_block(&block.id).is_some() {
            bail!("A block with id '{}' already exists", block.id);
        }
        block.origin = Origin::User;
        self.user_blocks.entries.insert(block.id.clone(), block);
        fsutil::save_json(&self.paths.user_blocks, &self.user_blocks)
    }

    /// Only user-origin blocks can be deleted; system blocks are disabled
    /// instead so a factory reset can always restore them.
    pub fn delete_block(&mut self, id: &str) -> Result<()> {
        if self.user_blocks.entries.remove(id).is_some() {
            return fsutil::save_json(&self.paths.user_blocks, &self.user_blocks);
        }
        if self.system_blocks.entries.contains_key(id) {
            bail!("Block '{}' is system-owned and can only be disabled", id);
        }
        bail!("No block with id '{}'", id)
    }

    pub fn save_placeholder(&mut self, def: PlaceholderDef) -> Result<()> {
        match def.origin {
            Origin::System => {
                self.system_placeholders.entries.insert(def.key.clone(), def);
                fsutil::save_json(&self.paths.system_placeholders, &self.system_placeholders)
            }
            Origin::User => {
                self.user_placeholders.entries.insert(def.key.clone(), def);
                fsutil::save_json(&self.paths.user_placeholders, &self.user_placeholders)
            }
        }
    }

    pub fn create_placeholder(&mut self, mut def: PlaceholderDef) -> Result<()> {
        if self.get_placeholder(&def.key).is_some() {
            bail!("A placeholder with key '{}' already exists", def.key);
        }
        def.origin = Origin::User;
        self.user_placeholders.entries.insert(def.key.clone(), def);
        fsutil::save_json(&self.paths.user_placeholders, &self.user_placeholders)
    }

    pub fn delete_placeholder(&mut self, key: &str) -> Result<()> {
        if self.user_placeholders.entries.remove(key).is_some() {
            return fsutil::save_json(&self.paths.user_placeholders, &self.user_placeholders);
        }
        if self.system_placeholders.entries.contains_key(key) {
            bail!(
                "Placeholder '{}' is system-owned and can only be overridden",
                key
            );
        }
        bail!("No placeholder with key '{}'", key)
    }

    /// Every content-file name referenced by any block, both layers.
    pub fn referenced_content_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .system_blocks
            .entries
            .values()
            .chain(self.user_blocks.entries.values())
            .map(|b| b.content_ref.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    // Whole-document access for export/import and factory reset.

    pub fn documents(
        &self,
    ) -> (
        &LayerDoc<PromptBlock>,
        &LayerDoc<PromptBlock>,
        &LayerDoc<PlaceholderDef>,
        &LayerDoc<PlaceholderDef>,
    ) {
        (
            &self.system_blocks,
            &self.user_blocks,
            &self.system_placeholders,
            &self.user_placeholders,
        )
    }

    pub fn replace_documents(
        &mut self,
        system_blocks: LayerDoc<PromptBlock>,
        user_blocks: LayerDoc<PromptBlock>,
        system_placeholders: LayerDoc<PlaceholderDef>,
        user_placeholders: LayerDoc<PlaceholderDef>,
    ) -> Result<()> {
        self.system_blocks = system_blocks;
        self.user_blocks = user_blocks;
        self.system_placeholders = system_placeholders;
        self.user_placeholders = user_placeholders;
        self.stamp_origins();
        self.persist_all()
    }

    pub fn clear_user_layer(&mut self) -> Result<()> {
        self.user_blocks = LayerDoc::default();
        self.user_placeholders = LayerDoc::default();
        self.persist_all()
    }

    fn persist_all(&self) -> Result<()> {
        fsutil::save_json(&self.paths.system_blocks, &self.system_blocks)?;
        fsutil::save_json(&self.paths.user_blocks, &self.user_blocks)?;
        fsutil::save_json(&self.paths.system_placeholders, &self.system_placeholders)?;
        fsutil::save_json(&self.paths.user_placeholders, &self.user_placeholders)?;
        Ok(())
    }
}

fn load_system_doc<T: DeserializeOwned>(
    path: &Path,
    load_errors: &mut Vec<LoadError>,
) -> LayerDoc<T> {
    if !path.exists() {
        load_errors.push(LoadError {
            file: path.to_string_lossy().into_owned(),
            detail: "missing system document".to_string(),
        });
        return LayerDoc::default();
    }
    match fsutil::load_json(path) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("System document {:?} failed to load: {:#}", path, e);
            load_errors.push(LoadError {
                file: path.to_string_lossy().into_owned(),
                detail: format!("{:#}", e),
            });
            LayerDoc::default()
        }
    }
}

fn load_user_doc<T: DeserializeOwned>(path: &Path) -> LayerDoc<T> {
    if !path.exists() {
        // First run: no user layer yet.
        return LayerDoc::default();
    }
    match fsutil::load_json(path) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(
                "User document {:?} is unreadable ({:#}), starting empty",
                path,
                e
            );
            LayerDoc::default()
        }
    }
}

fn merge_layers<T: Clone>(
    system: &BTreeMap<String, T>,
    user: &BTreeMap<String, T>,
    what: &str,
) -> Vec<T> {
    let mut merged: BTreeMap<&String, &T> = system.iter().collect();
    for (id, entry) in user {
        if merged.insert(id, entry).is_some() {
            tracing::warn!("User {} '{}' overrides a system entry", what, id);
        }
    }
    merged.into_values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn block(id: &str, order: i32) -> PromptBlock {
        PromptBlock {
            id: id.to_string(),
            name: id.to_string(),
            kind: BlockKind::Text,
            target: BlockTarget::SystemText,
            position: BlockPosition::Body,
            order,
            enabled: true,
            content_ref: "core".to_string(),
            category: BlockCategory::Core,
            variant_condition: None,
            requires_any: Vec::new(),
            origin: Origin::System,
        }
    }

    fn seeded_store(dir: &Path) -> ConfigStore {
        let paths = StorePaths::under(dir);
        let mut doc = LayerDoc::<PromptBlock>::default();
        doc.entries.insert("greet".to_string(), block("greet", 5));
        doc.entries.insert("rules".to_string(), block("rules", 1));
        fsutil::save_json(&paths.system_blocks, &doc).unwrap();
        fsutil::save_json(
            &paths.system_placeholders,
            &LayerDoc::<PlaceholderDef>::default(),
        )
        .unwrap();
        ConfigStore::load(paths)
    }

    #[test]
    fn user_layer_wins_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path());

        let mut override_block = block("greet", 1);
        override_block.origin = Origin::User;
        store.save_block(override_block).unwrap();

        let merged = store.merged_blocks();
        let greet = merged.iter().find(|b| b.id == "greet").unwrap();
        assert_eq!(greet.order, 1);
        assert_eq!(greet.origin, Origin::User);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn create_always_targets_user_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path());

        let mut fresh = block("custom", 9);
        fresh.origin = Origin::System; // caller-set origin is ignored
        store.create_block(fresh).unwrap();

        assert_eq!(store.get_block("custom").unwrap().origin, Origin::User);

        // Persisted to the user document, not the system one.
        let reloaded = ConfigStore::load(StorePaths::under(dir.path()));
        assert_eq!(reloaded.get_block("custom").unwrap().origin, Origin::User);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path());
        assert!(store.create_block(block("greet", 1)).is_err());
    }

    #[test]
    fn system_blocks_cannot_be_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path());

        let err = store.delete_block("greet").unwrap_err();
        assert!(err.to_string().contains("system-owned"));

        store.create_block(block("mine", 3)).unwrap();
        store.delete_block("mine").unwrap();
        assert!(store.get_block("mine").is_none());
    }

    #[test]
    fn broken_system_doc_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::under(dir.path());
        fs::create_dir_all(paths.system_blocks.parent().unwrap()).unwrap();
        fs::write(&paths.system_blocks, "{ definitely not json").unwrap();
        fsutil::save_json(
            &paths.system_placeholders,
            &LayerDoc::<PlaceholderDef>::default(),
        )
        .unwrap();

        let store = ConfigStore::load(paths);
        assert_eq!(store.merged_blocks().len(), 0);
        assert_eq!(store.load_errors().len(), 1);
        assert!(store.load_errors()[0].file.contains("blocks.json"));
    }

    #[test]
    fn broken_user_doc_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = {
            let paths = StorePaths::under(dir.path());
            fs::create_dir_all(paths.user_blocks.parent().unwrap()).unwrap();
            fs::write(&paths.user_blocks, "][").unwrap();
            seeded_store(dir.path())
        };

        // System entries intact, user layer empty, no system-level error
        // beyond the two we seeded around.
        assert_eq!(store.merged_blocks().len(), 2);
        assert!(store
            .load_errors()
            .iter()
            .all(|e| !e.file.contains("user")));
    }

    #[test]
    fn referenced_content_files_are_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path());
        let mut extra = block("extra", 7);
        extra.content_ref = "scene".to_string();
        store.create_block(extra).unwrap();

        assert_eq!(store.referenced_content_files(), vec!["core", "scene"]);
    }
}
