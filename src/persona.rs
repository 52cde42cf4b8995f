//! Persona and user-profile descriptor documents.
//!
//! The static placeholder phase reads scalar or list values out of these two
//! JSON documents via dotted paths (`identity.name`, `traits.2`, ...). A
//! missing or broken descriptor file degrades to an empty document so the
//! engine keeps working on a fresh install.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Which descriptor document a static placeholder reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorDoc {
    Persona,
    UserProfile,
}

/// The pair of descriptor documents for the active persona.
#[derive(Debug, Clone, Default)]
pub struct Descriptors {
    persona: Value,
    user_profile: Value,
}

impl Descriptors {
    pub fn new(persona: Value, user_profile: Value) -> Self {
        Self {
            persona,
            user_profile,
        }
    }

    /// Load both documents from disk. Missing files are normal (first run);
    /// unparsable ones are logged and treated as empty.
    pub fn load(persona_path: &Path, user_profile_path: &Path) -> Self {
        Self {
            persona: load_descriptor(persona_path),
            user_profile: load_descriptor(user_profile_path),
        }
    }

    fn doc(&self, which: DescriptorDoc) -> &Value {
        match which {
            DescriptorDoc::Persona => &self.persona,
            DescriptorDoc::UserProfile => &self.user_profile,
        }
    }

    /// Walk a dotted path through the document. Numeric segments index arrays.
    pub fn lookup(&self, which: DescriptorDoc, path: &str) -> Option<&Value> {
        let mut current = self.doc(which);
        for segment in path.split('.') {
            if segment.is_empty() {
                return None;
            }
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Scalar read: strings pass through, numbers and bools are formatted.
    pub fn lookup_scalar(&self, which: DescriptorDoc, path: &str) -> Option<String> {
        match self.lookup(which, path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// List read: array of scalars, non-scalar elements skipped.
    pub fn lookup_list(&self, which: DescriptorDoc, path: &str) -> Option<Vec<String>> {
        match self.lookup(which, path)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn persona(&self) -> &Value {
        &self.persona
    }

    pub fn user_profile(&self) -> &Value {
        &self.user_profile
    }
}

fn load_descriptor(path: &Path) -> Value {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Descriptor {:?} is not valid JSON ({}), ignoring", path, e);
                Value::Null
            }
        },
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptors() -> Descriptors {
        Descriptors::new(
            json!({
                "identity": { "name": "Rin", "age": 23 },
                "traits": ["gentle", "curious", "stubborn"],
            }),
            json!({
                "profile": { "display_name": "Io" },
            }),
        )
    }

    #[test]
    fn dotted_path_reaches_nested_scalars() {
        let d = descriptors();
        assert_eq!(
            d.lookup_scalar(DescriptorDoc::Persona, "identity.name"),
            Some("Rin".to_string())
        );
        assert_eq!(
            d.lookup_scalar(DescriptorDoc::Persona, "identity.age"),
            Some("23".to_string())
        );
        assert_eq!(
            d.lookup_scalar(DescriptorDoc::UserProfile, "profile.display_name"),
            Some("Io".to_string())
        );
    }

    #[test]
    fn numeric_segments_index_arrays() {
        let d = descriptors();
        assert_eq!(
            d.lookup_scalar(DescriptorDoc::Persona, "traits.1"),
            Some("curious".to_string())
        );
    }

    #[test]
    fn list_lookup_collects_scalars() {
        let d = descriptors();
        let traits = d.lookup_list(DescriptorDoc::Persona, "traits").unwrap();
        assert_eq!(traits, vec!["gentle", "curious", "stubborn"]);
    }

    #[test]
    fn missing_paths_return_none() {
        let d = descriptors();
        assert!(d.lookup_scalar(DescriptorDoc::Persona, "identity.missing").is_none());
        assert!(d.lookup_scalar(DescriptorDoc::Persona, "traits.9").is_none());
        assert!(d.lookup_list(DescriptorDoc::Persona, "identity.name").is_none());
    }

    #[test]
    fn missing_and_broken_files_degrade_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("persona.json");
        std::fs::write(&broken, "{ not json").unwrap();

        let d = Descriptors::load(&broken, &dir.path().join("absent.json"));
        assert!(d.lookup(DescriptorDoc::Persona, "anything").is_none());
        assert!(d.lookup(DescriptorDoc::UserProfile, "anything").is_none());
    }
}
