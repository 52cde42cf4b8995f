//! Block selection and prompt assembly.
//!
//! Enabled blocks are filtered by target and category, gated on their
//! `requires_any` placeholder keys, ordered by position slot then explicit
//! order, and rendered through the placeholder value map. System-text blocks
//! concatenate into one string; message blocks become a [`MessagePlan`] that
//! wraps the live conversation history.

use std::collections::BTreeMap;

use crate::conversation::ChatTurn;
use crate::prompt::content::{ContentStore, DialogueTurn};
use crate::prompt::metadata::{
    BlockCategory, BlockKind, BlockPosition, BlockTarget, PromptBlock,
};
use crate::prompt::placeholder::PlaceholderResolver;

/// Which categories take part in a build.
#[derive(Debug, Clone)]
pub enum CategoryFilter {
    /// Everything except memory-update and utility blocks.
    Conversational,
    /// Exactly the listed categories.
    Only(Vec<BlockCategory>),
}

impl CategoryFilter {
    fn admits(&self, category: BlockCategory) -> bool {
        match self {
            CategoryFilter::Conversational => category.conversational(),
            CategoryFilter::Only(allowed) => allowed.contains(&category),
        }
    }
}

/// Message-side output of a build: turns to weave around the history.
#[derive(Debug, Clone, Default)]
pub struct MessagePlan {
    /// Scripted dialogue inserted before the history.
    pub injected: Vec<ChatTurn>,
    /// Assistant opener used only when the history is empty.
    pub first_turn: Option<String>,
    /// Text appended after the user's newest message.
    pub append: Option<String>,
    /// Partial assistant turn placed last, for the model to continue.
    pub prefill: Option<String>,
}

impl MessagePlan {
    /// Weave the plan around live history and the user's new message.
    pub fn assemble_turns(&self, history: &[ChatTurn], user_text: &str) -> Vec<ChatTurn> {
        let mut turns = self.injected.clone();

        if history.is_empty() {
            if let Some(opener) = &self.first_turn {
                turns.push(ChatTurn::assistant(opener.clone()));
            }
        }
        turns.extend_from_slice(history);

        let mut user_text = user_text.to_string();
        if let Some(append) = &self.append {
            if !append.is_empty() {
                user_text.push('\n');
                user_text.push_str(append);
            }
        }
        turns.push(ChatTurn::user(user_text));

        if let Some(prefill) = &self.prefill {
            if !prefill.is_empty() {
                turns.push(ChatTurn::assistant(prefill.clone()));
            }
        }

        merge_adjacent(turns)
    }
}

/// Collapse runs of same-role turns into one turn, texts joined by newline.
/// Chat endpoints reject consecutive same-role messages.
pub fn merge_adjacent(turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
    let mut merged: Vec<ChatTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => {
                last.text.push('\n');
                last.text.push_str(&turn.text);
            }
            _ => merged.push(turn),
        }
    }
    merged
}

/// Enabled blocks for one target, category-filtered, requirement-gated,
/// in assembly order.
pub fn select_blocks<'a>(
    blocks: &'a [PromptBlock],
    target: BlockTarget,
    filter: &CategoryFilter,
    values: &BTreeMap<String, String>,
) -> Vec<&'a PromptBlock> {
    let mut selected: Vec<&PromptBlock> = blocks
        .iter()
        .filter(|b| b.enabled && b.target == target && filter.admits(b.category))
        .filter(|b| requirement_met(b, values))
        .collect();
    selected.sort_by_key(|b| (b.position.rank(), b.order, b.id.clone()));
    selected
}

/// A `requires_any` list is satisfied when any named key resolved non-empty.
/// An empty list is always satisfied.
fn requirement_met(block: &PromptBlock, values: &BTreeMap<String, String>) -> bool {
    if block.requires_any.is_empty() {
        return true;
    }
    block
        .requires_any
        .iter()
        .any(|key| values.get(key).map(|v| !v.is_empty()).unwrap_or(false))
}

/// Rendered output of one block.
enum Rendered {
    Text(String),
    Turns(Vec<DialogueTurn>),
}

fn render_block(
    block: &PromptBlock,
    content: &ContentStore,
    resolver: &PlaceholderResolver,
    values: &BTreeMap<String, String>,
    variant: &str,
) -> Option<Rendered> {
    let Some(block_content) = content.block(&block.content_ref, &block.id) else {
        tracing::warn!(
            "Block '{}' references missing content {}/{}",
            block.id,
            block.content_ref,
            block.id
        );
        return None;
    };
    // Per-block condition overrides the build-wide variant name.
    let wanted = block.variant_condition.as_deref().unwrap_or(variant);
    let Some(selected) = block_content.variant(wanted) else {
        tracing::warn!("Block '{}' has no variant '{}' and no default", block.id, wanted);
        return None;
    };

    match block.kind {
        BlockKind::Text => {
            let text = selected.text.as_deref()?;
            let resolved = resolver.resolve_text(text, values);
            if resolved.trim().is_empty() {
                None
            } else {
                Some(Rendered::Text(resolved))
            }
        }
        BlockKind::MultiTurn => {
            let turns = selected.turns.as_ref()?;
            let resolved: Vec<DialogueTurn> = turns
                .iter()
                .map(|t| DialogueTurn {
                    role: t.role.clone(),
                    text: resolver.resolve_text(&t.text, values),
                })
                .collect();
            if resolved.is_empty() {
                None
            } else {
                Some(Rendered::Turns(resolved))
            }
        }
    }
}

/// The system-text artifact: selected blocks joined with blank lines.
pub fn system_text(
    blocks: &[PromptBlock],
    content: &ContentStore,
    resolver: &PlaceholderResolver,
    values: &BTreeMap<String, String>,
    filter: &CategoryFilter,
    variant: &str,
) -> String {
    let mut parts = Vec::new();
    for block in select_blocks(blocks, BlockTarget::SystemText, filter, values) {
        if let Some(Rendered::Text(text)) = render_block(block, content, resolver, values, variant)
        {
            parts.push(text);
        }
    }
    parts.join("\n\n")
}

/// The message-side artifact for one build.
pub fn message_plan(
    blocks: &[PromptBlock],
    content: &ContentStore,
    resolver: &PlaceholderResolver,
    values: &BTreeMap<String, String>,
    filter: &CategoryFilter,
    variant: &str,
) -> MessagePlan {
    let mut plan = MessagePlan::default();

    for block in select_blocks(blocks, BlockTarget::Message, filter, values) {
        let Some(rendered) = render_block(block, content, resolver, values, variant) else {
            continue;
        };
        match (block.position, rendered) {
            (BlockPosition::BeforeHistory, Rendered::Turns(turns)) => {
                plan.injected
                    .extend(turns.into_iter().map(|t| ChatTurn {
                        role: t.role,
                        text: t.text,
                    }));
            }
            (BlockPosition::BeforeHistory, Rendered::Text(text)) => {
                plan.injected.push(ChatTurn::user(text));
            }
            (BlockPosition::FirstTurn, Rendered::Text(text)) => {
                plan.first_turn = Some(match plan.first_turn.take() {
                    Some(existing) => format!("{}\n{}", existing, text),
                    None => text,
                });
            }
            (BlockPosition::AfterHistory, Rendered::Text(text)) => {
                plan.append = Some(match plan.append.take() {
                    Some(existing) => format!("{}\n{}", existing, text),
                    None => text,
                });
            }
            (position, _) => {
                tracing::warn!(
                    "Block '{}' has unsupported position {:?} for a message block",
                    block.id,
                    position
                );
            }
        }
    }

    for block in select_blocks(blocks, BlockTarget::Pretext, filter, values) {
        if let Some(Rendered::Text(text)) = render_block(block, content, resolver, values, variant)
        {
            plan.prefill = Some(match plan.prefill.take() {
                Some(existing) => format!("{}\n{}", existing, text),
                None => text,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil;
    use crate::prompt::content::{BlockContent, ContentFile, Variant};
    use crate::prompt::metadata::Origin;

    fn block(
        id: &str,
        target: BlockTarget,
        position: BlockPosition,
        order: i32,
        kind: BlockKind,
    ) -> PromptBlock {
        PromptBlock {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            target,
            position,
            order,
            enabled: true,
            content_ref: "main".to_string(),
            category: BlockCategory::Core,
            variant_condition: None,
            requires_any: Vec::new(),
            origin: Origin::System,
        }
    }

    fn text_variant(text: &str) -> Variant {
        Variant {
            text: Some(text.to_string()),
            turns: None,
        }
    }

    fn content_store(entries: &[(&str, Variant)]) -> ContentStore {
        let dir = tempfile::tempdir().unwrap();
        let mut file = ContentFile::default();
        for (id, variant) in entries {
            let mut bc = BlockContent::default();
            bc.variants.insert("default".to_string(), variant.clone());
            file.blocks.insert(id.to_string(), bc);
        }
        fsutil::save_json(&dir.path().join("main.json"), &file).unwrap();
        // Contents load fully into memory, so the tempdir can go away.
        ContentStore::load(dir.path())
    }

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn blocks_sort_by_slot_then_order() {
        let content = content_store(&[
            ("tail", text_variant("closing rules")),
            ("head", text_variant("persona card")),
            ("body_b", text_variant("second body")),
            ("body_a", text_variant("first body")),
        ]);
        let blocks = vec![
            block("tail", BlockTarget::SystemText, BlockPosition::Tail, 0, BlockKind::Text),
            block("body_b", BlockTarget::SystemText, BlockPosition::Body, 2, BlockKind::Text),
            block("head", BlockTarget::SystemText, BlockPosition::Head, 0, BlockKind::Text),
            block("body_a", BlockTarget::SystemText, BlockPosition::Body, 1, BlockKind::Text),
        ];

        let resolver = PlaceholderResolver::new();
        let out = system_text(
            &blocks,
            &content,
            &resolver,
            &BTreeMap::new(),
            &CategoryFilter::Conversational,
            "default",
        );
        assert_eq!(
            out,
            "persona card\n\nfirst body\n\nsecond body\n\nclosing rules"
        );
    }

    #[test]
    fn disabled_and_gated_blocks_are_skipped() {
        let content = content_store(&[
            ("on", text_variant("kept")),
            ("off", text_variant("dropped")),
            ("gated", text_variant("scene: {{scene}}")),
        ]);
        let mut off = block("off", BlockTarget::SystemText, BlockPosition::Body, 0, BlockKind::Text);
        off.enabled = false;
        let mut gated =
            block("gated", BlockTarget::SystemText, BlockPosition::Body, 2, BlockKind::Text);
        gated.requires_any = vec!["scene".to_string()];
        let on = block("on", BlockTarget::SystemText, BlockPosition::Body, 1, BlockKind::Text);

        let resolver = PlaceholderResolver::new();
        let blocks = vec![off, gated.clone(), on];

        let without = system_text(
            &blocks,
            &content,
            &resolver,
            &values(&[("scene", "")]),
            &CategoryFilter::Conversational,
            "default",
        );
        assert_eq!(without, "kept");

        let with = system_text(
            &blocks,
            &content,
            &resolver,
            &values(&[("scene", "aquarium")]),
            &CategoryFilter::Conversational,
            "default",
        );
        assert_eq!(with, "kept\n\nscene: aquarium");
    }

    #[test]
    fn category_filter_excludes_maintenance_blocks() {
        let content = content_store(&[
            ("chat", text_variant("chat block")),
            ("mem", text_variant("memory instructions")),
        ]);
        let chat = block("chat", BlockTarget::SystemText, BlockPosition::Body, 0, BlockKind::Text);
        let mut mem = block("mem", BlockTarget::SystemText, BlockPosition::Body, 1, BlockKind::Text);
        mem.category = BlockCategory::MemoryUpdate;
        let blocks = vec![chat, mem];
        let resolver = PlaceholderResolver::new();

        let conversational = system_text(
            &blocks,
            &content,
            &resolver,
            &BTreeMap::new(),
            &CategoryFilter::Conversational,
            "default",
        );
        assert_eq!(conversational, "chat block");

        let maintenance = system_text(
            &blocks,
            &content,
            &resolver,
            &BTreeMap::new(),
            &CategoryFilter::Only(vec![BlockCategory::MemoryUpdate]),
            "default",
        );
        assert_eq!(maintenance, "memory instructions");
    }

    #[test]
    fn message_plan_weaves_around_history() {
        let content = content_store(&[
            (
                "example",
                Variant {
                    text: None,
                    turns: Some(vec![
                        DialogueTurn {
                            role: "user".to_string(),
                            text: "example question".to_string(),
                        },
                        DialogueTurn {
                            role: "assistant".to_string(),
                            text: "example answer".to_string(),
                        },
                    ]),
                },
            ),
            ("opener", text_variant("Oh, hello! First time here?")),
            ("reminder", text_variant("(stay in character)")),
            ("prefill", text_variant("Rin:")),
        ]);
        let example = block(
            "example",
            BlockTarget::Message,
            BlockPosition::BeforeHistory,
            0,
            BlockKind::MultiTurn,
        );
        let opener = block(
            "opener",
            BlockTarget::Message,
            BlockPosition::FirstTurn,
            0,
            BlockKind::Text,
        );
        let reminder = block(
            "reminder",
            BlockTarget::Message,
            BlockPosition::AfterHistory,
            0,
            BlockKind::Text,
        );
        let prefill = block(
            "prefill",
            BlockTarget::Pretext,
            BlockPosition::Body,
            0,
            BlockKind::Text,
        );
        let blocks = vec![example, opener, reminder, prefill];
        let resolver = PlaceholderResolver::new();

        let plan = message_plan(
            &blocks,
            &content,
            &resolver,
            &BTreeMap::new(),
            &CategoryFilter::Conversational,
            "default",
        );

        // Empty history: opener appears.
        let turns = plan.assemble_turns(&[], "hi");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].text, "example question");
        assert_eq!(turns[1].text, "example answer\nOh, hello! First time here?");
        assert_eq!(turns[2].text, "hi\n(stay in character)");
        assert_eq!(turns[3], ChatTurn::assistant("Rin:"));

        // Non-empty history: opener suppressed.
        let history = vec![ChatTurn::user("earlier"), ChatTurn::assistant("reply")];
        let turns = plan.assemble_turns(&history, "hi again");
        assert_eq!(turns[1].text, "example answer");
        assert_eq!(turns[2].text, "earlier");
        assert!(turns.iter().all(|t| !t.text.contains("First time")));
    }

    #[test]
    fn merge_adjacent_joins_same_role_runs() {
        let turns = vec![
            ChatTurn::user("a"),
            ChatTurn::user("b"),
            ChatTurn::assistant("c"),
            ChatTurn::user("d"),
        ];
        let merged = merge_adjacent(turns);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].text, "a\nb");
        assert_eq!(merged[2].text, "d");
    }

    #[test]
    fn variant_condition_overrides_build_variant() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = ContentFile::default();
        let mut bc = BlockContent::default();
        bc.variants
            .insert("default".to_string(), text_variant("plain"));
        bc.variants
            .insert("night".to_string(), text_variant("hushed"));
        file.blocks.insert("tone".to_string(), bc);
        fsutil::save_json(&dir.path().join("main.json"), &file).unwrap();
        let content = ContentStore::load(dir.path());

        let mut tone = block("tone", BlockTarget::SystemText, BlockPosition::Body, 0, BlockKind::Text);
        tone.variant_condition = Some("night".to_string());
        let resolver = PlaceholderResolver::new();

        let out = system_text(
            &[tone],
            &content,
            &resolver,
            &BTreeMap::new(),
            &CategoryFilter::Conversational,
            "default",
        );
        assert_eq!(out, "hushed");
    }
}
