//! Templated LM prompts ("errands") and their default profile.
//!
//! An [`Errand`] is a named pair of system preamble and user prompt,
//! stored as UTF-8 text split on the fixed `===SEPARATOR===` token.
//! Placeholder substitution is literal first-occurrence string replacement
//! of `{name}` tokens — deliberately not a template language: a placeholder
//! without a matching argument stays in the text verbatim.
//!
//! [`MultipleChoiceErrand`] wraps an errand with a fixed choice set and
//! post-filters the LM reply to the first choice found as a substring,
//! testing longer choices first so that `code` can never shadow
//! `code_skill`.
//!
//! The default errands ship embedded in the binary (one text file per
//! designation under `src/promptloom/errands/`); both errands and the
//! clients that run them can be overridden per designation.

use std::collections::HashMap;
use std::path::Path;

use crate::promptloom::error::HarnessError;
use crate::promptloom::lm_client::{CompletionConfig, LmClient};

/// Token splitting an errand file into pre-prompt and prompt.
pub const ERRAND_SEPARATOR: &str = "===SEPARATOR===";

/// Embedded default errand texts, one per designation.
const DEFAULT_ERRANDS: &[(&str, &str)] = &[
    ("message_type", include_str!("errands/message_type.txt")),
    (
        "message_code_processing",
        include_str!("errands/message_code_processing.txt"),
    ),
    (
        "message_code_skill_processing",
        include_str!("errands/message_code_skill_processing.txt"),
    ),
    (
        "message_code_call",
        include_str!("errands/message_code_call.txt"),
    ),
    (
        "message_code_variables",
        include_str!("errands/message_code_variables.txt"),
    ),
    (
        "message_routine_processing",
        include_str!("errands/message_routine_processing.txt"),
    ),
    (
        "message_generating_routine_processing",
        include_str!("errands/message_generating_routine_processing.txt"),
    ),
    (
        "message_routine_call",
        include_str!("errands/message_routine_call.txt"),
    ),
    (
        "message_generating_routine_call",
        include_str!("errands/message_generating_routine_call.txt"),
    ),
    (
        "message_routine_variables",
        include_str!("errands/message_routine_variables.txt"),
    ),
    (
        "message_data_processing",
        include_str!("errands/message_data_processing.txt"),
    ),
];

/// A named (system preamble, user prompt) template.
#[derive(Debug, Clone)]
pub struct Errand {
    pub designation: String,
    pub pre_prompt: String,
    pub prompt: String,
}

impl Errand {
    pub fn new(
        designation: impl Into<String>,
        pre_prompt: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Errand {
            designation: designation.into(),
            pre_prompt: pre_prompt.into(),
            prompt: prompt.into(),
        }
    }

    /// Parse errand text: exactly one `===SEPARATOR===`, both halves trimmed.
    pub fn from_text(designation: impl Into<String>, text: &str) -> Result<Self, HarnessError> {
        let designation = designation.into();
        let parts: Vec<&str> = text.split(ERRAND_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(HarnessError::InvalidErrand(format!(
                "errand '{}' must contain exactly one separator, found {}",
                designation,
                parts.len().saturating_sub(1)
            )));
        }
        Ok(Errand {
            designation,
            pre_prompt: parts[0].trim().to_string(),
            prompt: parts[1].trim().to_string(),
        })
    }

    /// Load an errand from a file on disk (prompt-iteration workflow).
    pub fn from_file(
        designation: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, HarnessError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_text(designation, &text)
    }

    /// Substitute `{name}` tokens by literal first-occurrence replacement.
    /// Placeholders absent from `args` remain in the text.
    pub fn fill(&self, args: &[(&str, &str)]) -> String {
        let mut prompt = self.prompt.clone();
        for (name, value) in args {
            let token = format!("{{{}}}", name);
            prompt = prompt.replacen(&token, value, 1);
        }
        prompt
    }

    /// Fill the prompt and run it against the given client.
    pub async fn run(
        &self,
        runner: &dyn LmClient,
        args: &[(&str, &str)],
        config: &CompletionConfig,
    ) -> Result<String, HarnessError> {
        let prompt = self.fill(args);
        runner.run(Some(&self.pre_prompt), &prompt, config).await
    }
}

/// An errand whose output is constrained to a fixed choice set.
#[derive(Debug, Clone)]
pub struct MultipleChoiceErrand {
    errand: Errand,
    choices: Vec<String>,
}

impl MultipleChoiceErrand {
    /// Choices are matched as substrings of the raw completion, longest
    /// first, so overlapping labels resolve to the most specific one.
    pub fn new(errand: Errand, mut choices: Vec<String>) -> Self {
        choices.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        MultipleChoiceErrand { errand, choices }
    }

    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// Run the errand; `None` means no choice appeared in the completion.
    pub async fn run(
        &self,
        runner: &dyn LmClient,
        args: &[(&str, &str)],
        config: &CompletionConfig,
    ) -> Result<Option<String>, HarnessError> {
        let raw_completion = self.errand.run(runner, args, config).await?;

        for choice in &self.choices {
            if raw_completion.contains(choice.as_str()) {
                return Ok(Some(choice.clone()));
            }
        }
        Ok(None)
    }
}

/// Insertion-keyed map of designation → [`Errand`], seeded with the embedded
/// defaults and overridable per designation.
#[derive(Debug, Clone)]
pub struct ErrandProfile {
    errands: HashMap<String, Errand>,
}

impl Default for ErrandProfile {
    fn default() -> Self {
        let mut errands = HashMap::new();
        for (designation, text) in DEFAULT_ERRANDS {
            let errand = Errand::from_text(*designation, text)
                .expect("embedded errand text is malformed");
            errands.insert(designation.to_string(), errand);
        }
        ErrandProfile { errands }
    }
}

impl ErrandProfile {
    /// An empty profile, for callers supplying every errand themselves.
    pub fn empty() -> Self {
        ErrandProfile {
            errands: HashMap::new(),
        }
    }

    pub fn get(&self, designation: &str) -> Result<&Errand, HarnessError> {
        self.errands.get(designation).ok_or_else(|| {
            HarnessError::InvalidErrand(format!(
                "no errand with designation '{}' in the profile",
                designation
            ))
        })
    }

    /// Insert or replace an errand under its designation.
    pub fn set(&mut self, errand: Errand) {
        self.errands.insert(errand.designation.clone(), errand);
    }

    pub fn designations(&self) -> impl Iterator<Item = &str> {
        self.errands.keys().map(|k| k.as_str())
    }
}
