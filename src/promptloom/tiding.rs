//! Tidings: named values with natural-language descriptions.
//!
//! A tiding is how a value produced by one message becomes available to the
//! prompts and invocations of later messages. The description travels
//! separately from the value so that prompt serialization can render
//! `name = value  # description` lines.

use rhai::Dynamic;
use serde::Serialize;

/// A named value carried across messages.
#[derive(Debug, Clone, Serialize)]
pub struct Tiding {
    /// Human-facing name (currently always equal to `script_name`).
    pub natural_name: String,
    /// Identifier under which the value is bound for invocations.
    pub script_name: String,
    /// Natural-language description of the content; may be empty.
    pub description: String,
    /// The value itself, in the execution runtime's representation.
    pub content: Dynamic,
}

impl Tiding {
    /// JSON rendering for context snapshots, carrying the runtime type name
    /// alongside the value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "natural_name": self.natural_name,
            "script_name": self.script_name,
            "description": self.description,
            "content": serde_json::to_value(&self.content).unwrap_or(serde_json::Value::Null),
            "type": self.content.type_name(),
        })
    }
}

/// Insertion-ordered store of tidings, keyed by `script_name`.
#[derive(Default)]
pub struct TidingStore {
    entries: Vec<Tiding>,
    content_truncation: Option<usize>,
}

impl TidingStore {
    /// Insert or replace the tiding of the same `script_name` in place.
    pub fn upsert(&mut self, tiding: Tiding) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.script_name == tiding.script_name)
        {
            Some(slot) => *slot = tiding,
            None => self.entries.push(tiding),
        }
    }

    pub fn get(&self, script_name: &str) -> Option<&Tiding> {
        self.entries
            .iter()
            .find(|tiding| tiding.script_name == script_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tiding> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cap the number of characters a single tiding's content contributes to
    /// a prompt. `None` (the default) serializes values in full — large
    /// values then produce large prompts.
    pub fn set_content_truncation(&mut self, limit: Option<usize>) {
        self.content_truncation = limit;
    }

    /// Serialization used in synthesis prompts: one
    /// `name = value  # description` line per tiding.
    pub fn serialize_for_prompt(&self) -> String {
        self.entries
            .iter()
            .map(|tiding| {
                let mut content = format!("{}", tiding.content);
                if let Some(limit) = self.content_truncation {
                    if content.chars().count() > limit {
                        content = content.chars().take(limit).collect::<String>() + "…";
                    }
                }
                format!("{} = {}  # {}", tiding.script_name, content, tiding.description)
            })
            .collect::<Vec<String>>()
            .join("\n")
    }
}
