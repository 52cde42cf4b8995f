//! Prompt set export/import and startup integrity repair.
//!
//! An archive is a single JSON document carrying all four layer documents
//! plus every content file, so a whole prompt set can move between installs.
//! Repair compares the live tree against the factory copy shipped with the
//! product and restores anything missing or unreadable before loading.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::fsutil;
use crate::prompt::content::{ContentFile, ContentStore};
use crate::prompt::metadata::{
    ConfigStore, LayerDoc, PlaceholderDef, PromptBlock, StorePaths, DOC_VERSION,
};

pub const ARCHIVE_VERSION: u32 = 1;

/// A complete, self-contained prompt set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArchive {
    pub version: u32,
    pub id: String,
    pub exported_at: DateTime<Utc>,
    pub system_blocks: LayerDoc<PromptBlock>,
    pub user_blocks: LayerDoc<PromptBlock>,
    pub system_placeholders: LayerDoc<PlaceholderDef>,
    pub user_placeholders: LayerDoc<PlaceholderDef>,
    pub content: BTreeMap<String, ContentFile>,
}

/// How an imported archive meets existing entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Drop everything and install the archive as-is.
    Replace,
    /// Keep existing entries, add only ids the install does not have.
    AddMissing,
    /// Merge; on collision the archive wins.
    Overwrite,
}

/// Snapshot the current stores into an archive.
pub fn export(config: &ConfigStore, content: &ContentStore) -> PromptArchive {
    let (system_blocks, user_blocks, system_placeholders, user_placeholders) = config.documents();
    PromptArchive {
        version: ARCHIVE_VERSION,
        id: Uuid::new_v4().to_string(),
        exported_at: Utc::now(),
        system_blocks: system_blocks.clone(),
        user_blocks: user_blocks.clone(),
        system_placeholders: system_placeholders.clone(),
        user_placeholders: user_placeholders.clone(),
        content: content.files().clone(),
    }
}

/// Install an archive into the live stores under the given policy.
pub fn import(
    config: &mut ConfigStore,
    content: &mut ContentStore,
    archive: PromptArchive,
    policy: ImportPolicy,
) -> Result<()> {
    if archive.version > ARCHIVE_VERSION {
        bail!(
            "Archive version {} is newer than supported version {}",
            archive.version,
            ARCHIVE_VERSION
        );
    }

    match policy {
        ImportPolicy::Replace => {
            config.replace_documents(
                archive.system_blocks,
                archive.user_blocks,
                archive.system_placeholders,
                archive.user_placeholders,
            )?;
            for (name, file) in archive.content {
                content.replace_file(&name, file)?;
            }
        }
        ImportPolicy::AddMissing | ImportPolicy::Overwrite => {
            let overwrite = policy == ImportPolicy::Overwrite;
            let (system_blocks, user_blocks, system_placeholders, user_placeholders) =
                config.documents();
            let system_blocks = merged_doc(system_blocks, archive.system_blocks, overwrite);
            let user_blocks = merged_doc(user_blocks, archive.user_blocks, overwrite);
            let system_placeholders =
                merged_doc(system_placeholders, archive.system_placeholders, overwrite);
            let user_placeholders =
                merged_doc(user_placeholders, archive.user_placeholders, overwrite);
            config.replace_documents(
                system_blocks,
                user_blocks,
                system_placeholders,
                user_placeholders,
            )?;

            for (name, incoming) in archive.content {
                let merged = match content.file(&name) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        for (block_id, block_content) in incoming.blocks {
                            if overwrite || !merged.blocks.contains_key(&block_id) {
                                merged.blocks.insert(block_id, block_content);
                            }
                        }
                        merged
                    }
                    None => incoming,
                };
                content.replace_file(&name, merged)?;
            }
        }
    }
    Ok(())
}

fn merged_doc<T: Clone>(
    existing: &LayerDoc<T>,
    incoming: LayerDoc<T>,
    overwrite: bool,
) -> LayerDoc<T> {
    let mut merged = existing.clone();
    for (id, entry) in incoming.entries {
        if overwrite || !merged.entries.contains_key(&id) {
            merged.entries.insert(id, entry);
        }
    }
    merged.version = DOC_VERSION;
    merged
}

/// One file restored during startup repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    SystemBlocks,
    SystemPlaceholders,
    ContentFile(String),
}

/// Restore missing or unreadable system files from the factory copy.
///
/// The factory directory mirrors the live layout: `blocks.json`,
/// `placeholders.json`, and a `content/` subdirectory. User documents are
/// never touched. Returns the list of restored files.
pub fn check_and_repair(
    paths: &StorePaths,
    content_dir: &Path,
    factory_dir: &Path,
) -> Result<Vec<RepairAction>> {
    let mut actions = Vec::new();

    if repair_doc::<PromptBlock>(&paths.system_blocks, &factory_dir.join("blocks.json"))? {
        actions.push(RepairAction::SystemBlocks);
    }
    if repair_doc::<PlaceholderDef>(
        &paths.system_placeholders,
        &factory_dir.join("placeholders.json"),
    )? {
        actions.push(RepairAction::SystemPlaceholders);
    }

    let factory_content = factory_dir.join("content");
    if factory_content.is_dir() {
        for entry in fs::read_dir(&factory_content)
            .with_context(|| format!("Failed to read factory content {:?}", factory_content))?
            .flatten()
        {
            let factory_file = entry.path();
            if factory_file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = factory_file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let live = content_dir.join(name);
            if repair_doc::<ContentFile>(&live, &factory_file)? {
                actions.push(RepairAction::ContentFile(name.to_string()));
            }
        }
    }

    if !actions.is_empty() {
        tracing::info!("Repaired {} prompt file(s) from factory copy", actions.len());
    }
    Ok(actions)
}

/// Copy the factory file over the live one when the live one is missing or
/// does not parse as its document type. Returns whether a copy happened.
fn repair_doc<T: serde::de::DeserializeOwned>(live: &Path, factory: &Path) -> Result<bool> {
    if !factory.exists() {
        // Nothing to restore from; the loader will report the gap.
        return Ok(false);
    }
    let healthy = live.exists() && fsutil::load_json::<LayerDoc<T>>(live).is_ok();
    // Content files are not LayerDocs; retry with the raw type.
    let healthy = healthy || (live.exists() && fsutil::load_json::<T>(live).is_ok());
    if healthy {
        return Ok(false);
    }

    let bytes = fs::read(factory)
        .with_context(|| format!("Failed to read factory file {:?}", factory))?;
    fsutil::write_atomic(live, &bytes)?;
    tracing::warn!("Restored {:?} from factory copy", live);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::content::{BlockContent, Variant};
    use crate::prompt::metadata::{
        BlockCategory, BlockKind, BlockPosition, BlockTarget, Origin,
    };

    fn block(id: &str, order: i32) -> PromptBlock {
        PromptBlock {
            id: id.to_string(),
            name: id.to_string(),
            kind: BlockKind::Text,
            target: BlockTarget::SystemText,
            position: BlockPosition::Body,
            order,
            enabled: true,
            content_ref: "main".to_string(),
            category: BlockCategory::Core,
            variant_condition: None,
            requires_any: Vec::new(),
            origin: Origin::System,
        }
    }

    fn seeded_stores(root: &Path) -> (ConfigStore, ContentStore) {
        let paths = StorePaths::under(&root.join("prompt"));
        let mut doc = LayerDoc::<PromptBlock>::default();
        doc.entries.insert("greet".to_string(), block("greet", 1));
        fsutil::save_json(&paths.system_blocks, &doc).unwrap();
        fsutil::save_json(
            &paths.system_placeholders,
            &LayerDoc::<PlaceholderDef>::default(),
        )
        .unwrap();

        let content_dir = root.join("content");
        let mut file = ContentFile::default();
        let mut bc = BlockContent::default();
        bc.variants.insert(
            "default".to_string(),
            Variant {
                text: Some("hello".to_string()),
                turns: None,
            },
        );
        file.blocks.insert("greet".to_string(), bc);
        fsutil::save_json(&content_dir.join("main.json"), &file).unwrap();

        (ConfigStore::load(paths), ContentStore::load(content_dir))
    }

    #[test]
    fn export_then_replace_import_round_trips() {
        let src = tempfile::tempdir().unwrap();
        let (mut src_config, src_content) = seeded_stores(src.path());
        src_config.create_block(block("custom", 2)).unwrap();
        let archive = export(&src_config, &src_content);
        assert_eq!(archive.version, ARCHIVE_VERSION);

        let dst = tempfile::tempdir().unwrap();
        let (mut dst_config, mut dst_content) = seeded_stores(dst.path());
        dst_config.create_block(block("doomed", 9)).unwrap();

        import(
            &mut dst_config,
            &mut dst_content,
            archive,
            ImportPolicy::Replace,
        )
        .unwrap();

        assert!(dst_config.get_block("doomed").is_none());
        assert_eq!(dst_config.get_block("custom").unwrap().origin, Origin::User);
        assert!(dst_config.get_block("greet").is_some());
    }

    #[test]
    fn add_missing_keeps_local_entries() {
        let src = tempfile::tempdir().unwrap();
        let (src_config, src_content) = seeded_stores(src.path());
        let mut archive = export(&src_config, &src_content);
        archive
            .user_blocks
            .entries
            .insert("incoming".to_string(), block("incoming", 3));
        // Archive also carries a conflicting edit of "greet".
        archive
            .system_blocks
            .entries
            .get_mut("greet")
            .unwrap()
            .order = 99;

        let dst = tempfile::tempdir().unwrap();
        let (mut dst_config, mut dst_content) = seeded_stores(dst.path());

        import(
            &mut dst_config,
            &mut dst_content,
            archive,
            ImportPolicy::AddMissing,
        )
        .unwrap();

        assert!(dst_config.get_block("incoming").is_some());
        assert_eq!(dst_config.get_block("greet").unwrap().order, 1);
    }

    #[test]
    fn overwrite_lets_the_archive_win() {
        let src = tempfile::tempdir().unwrap();
        let (src_config, src_content) = seeded_stores(src.path());
        let mut archive = export(&src_config, &src_content);
        archive
            .system_blocks
            .entries
            .get_mut("greet")
            .unwrap()
            .order = 99;

        let dst = tempfile::tempdir().unwrap();
        let (mut dst_config, mut dst_content) = seeded_stores(dst.path());
        import(
            &mut dst_config,
            &mut dst_content,
            archive,
            ImportPolicy::Overwrite,
        )
        .unwrap();

        assert_eq!(dst_config.get_block("greet").unwrap().order, 99);
    }

    #[test]
    fn newer_archive_versions_are_rejected() {
        let src = tempfile::tempdir().unwrap();
        let (src_config, src_content) = seeded_stores(src.path());
        let mut archive = export(&src_config, &src_content);
        archive.version = ARCHIVE_VERSION + 1;

        let dst = tempfile::tempdir().unwrap();
        let (mut dst_config, mut dst_content) = seeded_stores(dst.path());
        assert!(import(
            &mut dst_config,
            &mut dst_content,
            archive,
            ImportPolicy::Replace
        )
        .is_err());
    }

    #[test]
    fn repair_restores_missing_and_corrupt_files() {
        let root = tempfile::tempdir().unwrap();
        let factory = root.path().join("factory");
        let mut doc = LayerDoc::<PromptBlock>::default();
        doc.entries.insert("greet".to_string(), block("greet", 1));
        fsutil::save_json(&factory.join("blocks.json"), &doc).unwrap();
        fsutil::save_json(
            &factory.join("placeholders.json"),
            &LayerDoc::<PlaceholderDef>::default(),
        )
        .unwrap();
        fsutil::save_json(
            &factory.join("content").join("main.json"),
            &ContentFile::default(),
        )
        .unwrap();

        let paths = StorePaths::under(&root.path().join("prompt"));
        let content_dir = root.path().join("content");
        // blocks.json absent, placeholders.json corrupt, content absent.
        fs::create_dir_all(paths.system_placeholders.parent().unwrap()).unwrap();
        fs::write(&paths.system_placeholders, "garbage").unwrap();

        let actions = check_and_repair(&paths, &content_dir, &factory).unwrap();
        assert!(actions.contains(&RepairAction::SystemBlocks));
        assert!(actions.contains(&RepairAction::SystemPlaceholders));
        assert!(actions.contains(&RepairAction::ContentFile("main.json".to_string())));

        let store = ConfigStore::load(paths);
        assert!(store.load_errors().is_empty());
        assert!(store.get_block("greet").is_some());

        // Second pass: everything healthy, nothing restored.
        let actions = check_and_repair(
            store.paths(),
            &content_dir,
            &factory,
        )
        .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn repair_never_touches_user_documents() {
        let root = tempfile::tempdir().unwrap();
        let factory = root.path().join("factory");
        fsutil::save_json(
            &factory.join("blocks.json"),
            &LayerDoc::<PromptBlock>::default(),
        )
        .unwrap();

        let paths = StorePaths::under(&root.path().join("prompt"));
        fs::create_dir_all(paths.user_blocks.parent().unwrap()).unwrap();
        fs::write(&paths.user_blocks, "user data, even broken").unwrap();

        check_and_repair(&paths, &root.path().join("content"), &factory).unwrap();
        let bytes = fs::read_to_string(&paths.user_blocks).unwrap();
        assert_eq!(bytes, "user data, even broken");
    }
}
