//! Skills: named, reusable functions synthesized into the session.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A reusable function stored by the session.
///
/// Identity is `script_name`; a later synthesis under the same name replaces
/// the earlier one. `source_mid` is `None` only for bootstrap skills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    /// The skill's display name (currently always equal to `script_name`).
    pub name: String,
    /// The function name under which the skill is callable in the
    /// execution namespace.
    pub script_name: String,
    /// Doc-comment text, including the message-id addendum for synthesized
    /// skills.
    pub docstring: String,
    /// Full source span of the definition. Empty for host-provided
    /// bootstrap callables.
    pub code: String,
    /// The user message this skill was synthesized from.
    pub source_message: String,
    /// Id of the originating message; `None` for bootstrap skills.
    pub source_mid: Option<u64>,
}

impl Skill {
    /// SHA-256 fingerprint of the skill source. Byte-identical sources have
    /// equal fingerprints, which is how idempotent reinstalls are detected.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.code.as_bytes());
        hasher.finalize().into()
    }

    /// Hex rendering of [`Skill::fingerprint`], for trace output.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Insertion-ordered store of skills, keyed by `script_name`.
#[derive(Default)]
pub struct SkillStore {
    entries: Vec<Skill>,
}

impl SkillStore {
    /// Insert a skill, replacing any prior entry of the same `script_name`
    /// in place (insertion order is preserved on replacement).
    pub fn insert(&mut self, skill: Skill) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.script_name == skill.script_name)
        {
            Some(slot) => *slot = skill,
            None => self.entries.push(skill),
        }
    }

    pub fn get(&self, script_name: &str) -> Option<&Skill> {
        self.entries
            .iter()
            .find(|skill| skill.script_name == script_name)
    }

    /// Whether a byte-identical version of this skill is already stored.
    pub fn contains_identical(&self, skill: &Skill) -> bool {
        self.get(&skill.script_name)
            .map_or(false, |existing| existing.fingerprint() == skill.fingerprint())
    }

    /// Insertion-ordered enumeration, for prompt serialization.
    pub fn iter(&self) -> impl Iterator<Item = &Skill> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialization used by routine-synthesis prompts: one
    /// `function {name}` block with the docstring per skill.
    pub fn serialize_for_prompt(&self) -> String {
        self.entries
            .iter()
            .map(|skill| format!("function {}\n---\n{}", skill.script_name, skill.docstring))
            .collect::<Vec<String>>()
            .join("\n\n")
    }
}
