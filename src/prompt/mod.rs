//! Prompt composition engine.
//!
//! [`PromptEngine`] owns the layered configuration, the content store, the
//! placeholder resolver and the active descriptors, and exposes the build,
//! editing, validation and export surfaces as one facade.

pub mod archive;
pub mod compose;
pub mod content;
pub mod metadata;
pub mod placeholder;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::conversation::ChatTurn;
use crate::persona::Descriptors;
use crate::prompt::archive::{ImportPolicy, PromptArchive, RepairAction};
use crate::prompt::compose::{CategoryFilter, MessagePlan};
use crate::prompt::content::{BlockContent, ContentStore};
use crate::prompt::metadata::{
    ConfigStore, LoadError, PlaceholderDef, PromptBlock, ResolvePhase, StorePaths,
};
use crate::prompt::placeholder::PlaceholderResolver;

/// Directory layout of one prompt tree.
///
/// ```text
/// <root>/prompt/system/blocks.json
/// <root>/prompt/system/placeholders.json
/// <root>/prompt/user/blocks.json
/// <root>/prompt/user/placeholders.json
/// <root>/content/*.json
/// <root>/factory/{blocks,placeholders}.json, factory/content/*.json
/// ```
#[derive(Debug, Clone)]
pub struct PromptPaths {
    root: PathBuf,
}

impl PromptPaths {
    pub fn under(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths::under(&self.root.join("prompt"))
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    pub fn factory_dir(&self) -> PathBuf {
        self.root.join("factory")
    }
}

/// One build request.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub filter: CategoryFilter,
    pub variant: String,
    pub runtime: BTreeMap<String, String>,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            filter: CategoryFilter::Conversational,
            variant: "default".to_string(),
            runtime: BTreeMap::new(),
        }
    }
}

/// Everything one build produced.
#[derive(Debug, Clone)]
pub struct PromptBuild {
    pub system_text: String,
    pub plan: MessagePlan,
    /// The resolved placeholder map the build used.
    pub values: BTreeMap<String, String>,
}

impl PromptBuild {
    /// Convenience: the full message list for a request.
    pub fn turns(&self, history: &[ChatTurn], user_text: &str) -> Vec<ChatTurn> {
        self.plan.assemble_turns(history, user_text)
    }
}

/// A non-fatal configuration problem surfaced by [`PromptEngine::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub subject: String,
    pub detail: String,
}

/// How far a factory reset goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Restore system documents and content, keep user entries.
    KeepUserEntries,
    /// Restore everything and clear the user layer.
    Full,
}

pub struct PromptEngine {
    paths: PromptPaths,
    config: ConfigStore,
    content: ContentStore,
    resolver: PlaceholderResolver,
    descriptors: Descriptors,
    repairs: Vec<RepairAction>,
}

impl PromptEngine {
    /// Repair the tree from the factory copy, then load it. Loading never
    /// fails outright; per-file problems are collected in [`load_errors`].
    ///
    /// [`load_errors`]: PromptEngine::load_errors
    pub fn load(paths: PromptPaths) -> Result<Self> {
        let store_paths = paths.store_paths();
        let repairs =
            archive::check_and_repair(&store_paths, &paths.content_dir(), &paths.factory_dir())
                .context("Prompt tree repair failed")?;

        let config = ConfigStore::load(store_paths);
        let content = ContentStore::load_referenced(
            paths.content_dir(),
            &config.referenced_content_files(),
        );

        Ok(Self {
            paths,
            config,
            content,
            resolver: PlaceholderResolver::new(),
            descriptors: Descriptors::default(),
            repairs,
        })
    }

    pub fn repairs(&self) -> &[RepairAction] {
        &self.repairs
    }

    pub fn load_errors(&self) -> Vec<LoadError> {
        let mut errors = self.config.load_errors().to_vec();
        errors.extend_from_slice(self.content.load_errors());
        errors
    }

    /// Swap in the active persona's descriptors. Static placeholder values
    /// are recomputed on the next build.
    pub fn set_descriptors(&mut self, descriptors: Descriptors) {
        self.descriptors = descriptors;
        self.resolver.invalidate_static();
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    // --- building -----------------------------------------------------

    /// Resolve placeholders once and produce both artifacts.
    pub fn build(&self, request: &BuildRequest) -> PromptBuild {
        let defs = self.config.merged_placeholders();
        let values = self
            .resolver
            .resolve_map(&defs, &self.descriptors, &request.runtime);
        let blocks = self.config.merged_blocks();

        let system_text = compose::system_text(
            &blocks,
            &self.content,
            &self.resolver,
            &values,
            &request.filter,
            &request.variant,
        );
        let plan = compose::message_plan(
            &blocks,
            &self.content,
            &self.resolver,
            &values,
            &request.filter,
            &request.variant,
        );

        PromptBuild {
            system_text,
            plan,
            values,
        }
    }

    /// Resolve one block's text in isolation, for editor previews.
    pub fn resolve_block(&self, id: &str, request: &BuildRequest) -> Option<String> {
        let block = self.config.get_block(id)?;
        let defs = self.config.merged_placeholders();
        let values = self
            .resolver
            .resolve_map(&defs, &self.descriptors, &request.runtime);
        let wanted = block.variant_condition.as_deref().unwrap_or(&request.variant);
        let variant = self
            .content
            .block(&block.content_ref, &block.id)?
            .variant(wanted)?;
        let text = variant.text.as_deref()?;
        Some(self.resolver.resolve_text(text, &values))
    }

    // --- editing ------------------------------------------------------

    pub fn blocks(&self) -> Vec<PromptBlock> {
        self.config.merged_blocks()
    }

    pub fn placeholders(&self) -> Vec<PlaceholderDef> {
        self.config.merged_placeholders()
    }

    pub fn get_block(&self, id: &str) -> Option<PromptBlock> {
        self.config.get_block(id)
    }

    pub fn save_block(&mut self, block: PromptBlock) -> Result<()> {
        self.config.save_block(block)
    }

    pub fn create_block(&mut self, block: PromptBlock, content: BlockContent) -> Result<()> {
        let content_ref = block.content_ref.clone();
        let id = block.id.clone();
        self.config.create_block(block)?;
        self.content.save_block(&content_ref, &id, content)
    }

    pub fn delete_block(&mut self, id: &str) -> Result<()> {
        let content_ref = self.config.get_block(id).map(|b| b.content_ref);
        self.config.delete_block(id)?;
        if let Some(content_ref) = content_ref {
            self.content.delete_block(&content_ref, id)?;
        }
        Ok(())
    }

    pub fn block_content(&self, id: &str) -> Option<&BlockContent> {
        let block = self.config.get_block(id)?;
        self.content.block(&block.content_ref, id)
    }

    pub fn save_block_content(&mut self, id: &str, content: BlockContent) -> Result<()> {
        let block = self
            .config
            .get_block(id)
            .with_context(|| format!("No block with id '{}'", id))?;
        self.content.save_block(&block.content_ref, id, content)
    }

    pub fn get_placeholder(&self, key: &str) -> Option<PlaceholderDef> {
        self.config.get_placeholder(key)
    }

    pub fn save_placeholder(&mut self, def: PlaceholderDef) -> Result<()> {
        let result = self.config.save_placeholder(def);
        self.resolver.invalidate_static();
        result
    }

    pub fn create_placeholder(&mut self, def: PlaceholderDef) -> Result<()> {
        let result = self.config.create_placeholder(def);
        self.resolver.invalidate_static();
        result
    }

    pub fn delete_placeholder(&mut self, key: &str) -> Result<()> {
        let result = self.config.delete_placeholder(key);
        self.resolver.invalidate_static();
        result
    }

    // --- reset and transfer -------------------------------------------

    /// Restore from the factory copy.
    pub fn reset_all(&mut self, scope: ResetScope) -> Result<()> {
        let store_paths = self.paths.store_paths();

        if scope == ResetScope::Full {
            self.config.clear_user_layer()?;
        }
        // Force system docs back to pristine regardless of health.
        remove_if_present(&store_paths.system_blocks)?;
        remove_if_present(&store_paths.system_placeholders)?;
        archive::check_and_repair(
            &store_paths,
            &self.paths.content_dir(),
            &self.paths.factory_dir(),
        )?;
        self.content
            .reset_from_factory(&self.paths.factory_dir().join("content"))?;

        self.config = ConfigStore::load(store_paths);
        self.content = ContentStore::load_referenced(
            self.paths.content_dir(),
            &self.config.referenced_content_files(),
        );
        self.resolver.invalidate_static();
        Ok(())
    }

    /// Restore a single block's content from the factory copy. The block's
    /// metadata override in the user layer, if any, is removed too.
    pub fn reset_block(&mut self, id: &str) -> Result<()> {
        let block = self
            .config
            .get_block(id)
            .with_context(|| format!("No block with id '{}'", id))?;

        let factory_file: content::ContentFile = crate::fsutil::load_json(
            &self
                .paths
                .factory_dir()
                .join("content")
                .join(format!("{}.json", block.content_ref)),
        )
        .with_context(|| format!("Block '{}' has no factory content", id))?;
        let pristine = factory_file
            .blocks
            .get(id)
            .cloned()
            .with_context(|| format!("Factory content has no entry for block '{}'", id))?;
        self.content.save_block(&block.content_ref, id, pristine)?;

        // Drop a user-layer metadata override so the system entry shows.
        if self.config.delete_block(id).is_ok() {
            tracing::debug!("Removed user override for block '{}'", id);
        }
        Ok(())
    }

    pub fn export_archive(&self) -> PromptArchive {
        archive::export(&self.config, &self.content)
    }

    pub fn import_archive(&mut self, bundle: PromptArchive, policy: ImportPolicy) -> Result<()> {
        archive::import(&mut self.config, &mut self.content, bundle, policy)?;
        self.resolver.invalidate_static();
        Ok(())
    }

    // --- validation ---------------------------------------------------

    /// Cross-check blocks, content and placeholder definitions. Warnings
    /// never block a build; the engine degrades per entry instead.
    pub fn validate(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        let defs = self.config.merged_placeholders();
        let known_keys: Vec<&str> = defs.iter().map(|d| d.key.as_str()).collect();

        for block in self.config.merged_blocks() {
            let Some(content) = self.content.block(&block.content_ref, &block.id) else {
                warnings.push(ValidationWarning {
                    subject: format!("block:{}", block.id),
                    detail: format!(
                        "references missing content {}/{}",
                        block.content_ref, block.id
                    ),
                });
                continue;
            };

            if content.variant("default").is_none() {
                warnings.push(ValidationWarning {
                    subject: format!("block:{}", block.id),
                    detail: "has no 'default' variant to fall back to".to_string(),
                });
            }

            for (name, variant) in &content.variants {
                let shape_ok = match block.kind {
                    metadata::BlockKind::Text => variant.text.is_some(),
                    metadata::BlockKind::MultiTurn => variant.turns.is_some(),
                };
                if !shape_ok {
                    warnings.push(ValidationWarning {
                        subject: format!("block:{}", block.id),
                        detail: format!(
                            "variant '{}' does not match the block kind {:?}",
                            name, block.kind
                        ),
                    });
                }
            }

            for key in content
                .declared_placeholders
                .iter()
                .chain(block.requires_any.iter())
            {
                if !known_keys.contains(&key.as_str()) {
                    warnings.push(ValidationWarning {
                        subject: format!("block:{}", block.id),
                        detail: format!("uses undefined placeholder '{}'", key),
                    });
                }
            }
        }

        for def in &defs {
            match def.phase {
                ResolvePhase::Static if def.source.is_none() => {
                    warnings.push(ValidationWarning {
                        subject: format!("placeholder:{}", def.key),
                        detail: "static placeholder has no source".to_string(),
                    });
                }
                ResolvePhase::Computed if def.function.is_none() => {
                    warnings.push(ValidationWarning {
                        subject: format!("placeholder:{}", def.key),
                        detail: "computed placeholder names no function".to_string(),
                    });
                }
                _ => {}
            }
        }

        warnings
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {:?}", path))?;
    }
    Ok(())
}
