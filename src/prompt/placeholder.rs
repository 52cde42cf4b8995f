//! Three-phase placeholder resolution.
//!
//! Static placeholders read descriptor documents and change only when a
//! descriptor changes, so their values are cached until invalidated.
//! Computed placeholders run a named function at build time (clock, calendar,
//! descriptor summaries). Runtime placeholders are supplied by the caller per
//! build. Resolution order is static, computed, runtime, so later phases can
//! shadow earlier ones.

use anyhow::{bail, Result};
use chrono::Local;
use regex_lite::Regex;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::persona::{DescriptorDoc, Descriptors};
use crate::prompt::metadata::{PlaceholderDef, ResolvePhase, ValueKind};

pub struct PlaceholderResolver {
    pattern: Regex,
    static_cache: Mutex<Option<BTreeMap<String, String>>>,
}

impl Default for PlaceholderResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderResolver {
    pub fn new() -> Self {
        Self {
            // Constant pattern, cannot fail to compile.
            pattern: Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}")
                .expect("placeholder pattern compiles"),
            static_cache: Mutex::new(None),
        }
    }

    /// Drop cached static values; called when descriptors change.
    pub fn invalidate_static(&self) {
        if let Ok(mut cache) = self.static_cache.lock() {
            *cache = None;
        }
    }

    /// Resolve every definition into a flat key/value map.
    pub fn resolve_map(
        &self,
        defs: &[PlaceholderDef],
        descriptors: &Descriptors,
        runtime: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut values = self.static_values(defs, descriptors);

        for def in defs {
            match def.phase {
                ResolvePhase::Static => {}
                ResolvePhase::Computed => {
                    let value = match &def.function {
                        Some(name) => match compute(name, descriptors) {
                            Ok(v) => v,
                            Err(e) => {
                                tracing::warn!(
                                    "Computed placeholder '{}' failed ({:#}), using default",
                                    def.key,
                                    e
                                );
                                def.default.clone()
                            }
                        },
                        None => {
                            tracing::warn!(
                                "Computed placeholder '{}' names no function, using default",
                                def.key
                            );
                            def.default.clone()
                        }
                    };
                    values.insert(def.key.clone(), value);
                }
                ResolvePhase::Runtime => {
                    // Default applies only when the caller sent nothing;
                    // the merge below supplies the live value.
                    values
                        .entry(def.key.clone())
                        .or_insert_with(|| def.default.clone());
                }
            }
        }

        // The caller's map is applied last and wins over every phase,
        // declared or not.
        for (key, value) in runtime {
            values.insert(key.clone(), value.clone());
        }

        values
    }

    /// Substitute `{{key}}` markers from the value map. Unknown keys are left
    /// verbatim so a typo is visible instead of silently vanishing.
    pub fn resolve_text(&self, text: &str, values: &BTreeMap<String, String>) -> String {
        self.pattern
            .replace_all(text, |caps: &regex_lite::Captures<'_>| {
                let key = &caps[1];
                match values.get(key) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn static_values(
        &self,
        defs: &[PlaceholderDef],
        descriptors: &Descriptors,
    ) -> BTreeMap<String, String> {
        if let Ok(cache) = self.static_cache.lock() {
            if let Some(values) = cache.as_ref() {
                return values.clone();
            }
        }

        let mut values = BTreeMap::new();
        for def in defs {
            if def.phase != ResolvePhase::Static {
                continue;
            }
            values.insert(def.key.clone(), resolve_static(def, descriptors));
        }

        if let Ok(mut cache) = self.static_cache.lock() {
            *cache = Some(values.clone());
        }
        values
    }
}

fn resolve_static(def: &PlaceholderDef, descriptors: &Descriptors) -> String {
    let Some(source) = &def.source else {
        return def.default.clone();
    };
    match def.value_kind {
        ValueKind::Scalar => descriptors
            .lookup_scalar(source.doc, &source.path)
            .unwrap_or_else(|| def.default.clone()),
        ValueKind::List => match descriptors.lookup_list(source.doc, &source.path) {
            Some(items) if !items.is_empty() => items.join(&def.join_with),
            _ => def.default.clone(),
        },
    }
}

fn compute(function: &str, descriptors: &Descriptors) -> Result<String> {
    match function {
        "date" => Ok(Local::now().format("%Y-%m-%d").to_string()),
        "time" => Ok(Local::now().format("%H:%M").to_string()),
        "weekday" => Ok(Local::now().format("%A").to_string()),
        "persona_summary" => persona_summary(descriptors),
        other => bail!("Unknown computed function '{}'", other),
    }
}

/// One-line summary of the persona descriptor: name plus trait list.
fn persona_summary(descriptors: &Descriptors) -> Result<String> {
    let Some(name) = descriptors.lookup_scalar(DescriptorDoc::Persona, "identity.name") else {
        bail!("Persona descriptor has no identity.name");
    };
    match descriptors.lookup_list(DescriptorDoc::Persona, "traits") {
        Some(traits) if !traits.is_empty() => Ok(format!("{} ({})", name, traits.join(", "))),
        _ => Ok(name),
    }
}

/// Human-readable gap between two timestamps, for "time since last message"
/// style runtime placeholders.
pub fn format_elapsed(seconds: u64) -> String {
    if seconds < 60 {
        "moments ago".to_string()
    } else if seconds < 3600 {
        let minutes = seconds / 60;
        format!("{} minute{} ago", minutes, plural(minutes))
    } else if seconds < 86_400 {
        let hours = seconds / 3600;
        format!("{} hour{} ago", hours, plural(hours))
    } else {
        let days = seconds / 86_400;
        format!("{} day{} ago", days, plural(days))
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
