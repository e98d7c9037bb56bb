//! Companion states and their prompt templates.
//!
//! A prompt is `system preamble + per-state instruction + assistant marker`.
//! The model's reply is whatever follows the last assistant marker.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::config::ConfigError;

/// The closed set of behaviours the intent layer can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompanionState {
    Follow,
    Protect,
    Heal,
    Scout,
}

impl CompanionState {
    pub const ALL: [CompanionState; 4] = [
        CompanionState::Follow,
        CompanionState::Protect,
        CompanionState::Heal,
        CompanionState::Scout,
    ];
}

impl fmt::Display for CompanionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompanionState::Follow => "FOLLOW",
            CompanionState::Protect => "PROTECT",
            CompanionState::Heal => "HEAL",
            CompanionState::Scout => "SCOUT",
        };
        f.write_str(name)
    }
}

pub const DEFAULT_SYSTEM_PREAMBLE: &str =
    "<|system|>\nYou are a helpful AI companion. Respond concisely in 1-2 sentences.\n";

pub const DEFAULT_ASSISTANT_MARKER: &str = "<|assistant|>\n";

fn default_instruction(state: CompanionState) -> &'static str {
    match state {
        CompanionState::Follow => "<|user|>\nFollow me.\n",
        CompanionState::Protect => "<|user|>\nProtect me.\n",
        CompanionState::Heal => "<|user|>\nHeal me.\n",
        CompanionState::Scout => "<|user|>\nScout ahead.\n",
    }
}

/// State → instruction lookup plus the text around it.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    system: String,
    instructions: HashMap<CompanionState, String>,
    assistant_marker: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PREAMBLE.to_string(),
            instructions: CompanionState::ALL
                .iter()
                .map(|&s| (s, default_instruction(s).to_string()))
                .collect(),
            assistant_marker: DEFAULT_ASSISTANT_MARKER.to_string(),
        }
    }
}

impl PromptTemplates {
    /// Build a custom table. Every state must have an instruction and the
    /// marker must be non-empty.
    pub fn new(
        system: impl Into<String>,
        instructions: HashMap<CompanionState, String>,
        assistant_marker: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(&missing) = CompanionState::ALL
            .iter()
            .find(|s| !instructions.contains_key(*s))
        {
            return Err(ConfigError::MissingTemplate(missing));
        }

        let assistant_marker = assistant_marker.into();
        if assistant_marker.is_empty() {
            return Err(ConfigError::EmptyAssistantMarker);
        }

        Ok(Self {
            system: system.into(),
            instructions,
            assistant_marker,
        })
    }

    /// Full prompt text for `state`.
    pub fn render(&self, state: CompanionState) -> String {
        let instruction = self
            .instructions
            .get(&state)
            .map(String::as_str)
            .unwrap_or_default();
        format!("{}{}{}", self.system, instruction, self.assistant_marker)
    }

    pub fn assistant_marker(&self) -> &str {
        &self.assistant_marker
    }

    /// Text after the last assistant marker, trimmed. Empty when the marker
    /// is absent.
    pub fn extract_response<'a>(&self, text: &'a str) -> &'a str {
        match text.rfind(&self.assistant_marker) {
            Some(idx) => text[idx + self.assistant_marker.len()..].trim(),
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_follow_prompt() {
        let prompt = PromptTemplates::default().render(CompanionState::Follow);
        assert_eq!(
            prompt,
            "<|system|>\nYou are a helpful AI companion. Respond concisely in 1-2 sentences.\n\
             <|user|>\nFollow me.\n<|assistant|>\n"
        );
    }

    #[test]
    fn every_state_has_distinct_instruction() {
        let templates = PromptTemplates::default();
        let prompts: std::collections::HashSet<String> =
            CompanionState::ALL.iter().map(|&s| templates.render(s)).collect();
        assert_eq!(prompts.len(), CompanionState::ALL.len());
        assert!(templates.render(CompanionState::Scout).contains("Scout ahead."));
    }

    #[test]
    fn missing_state_is_rejected() {
        let mut instructions: HashMap<_, _> = CompanionState::ALL
            .iter()
            .map(|&s| (s, format!("<|user|>\n{s}\n")))
            .collect();
        instructions.remove(&CompanionState::Heal);

        let err = PromptTemplates::new("sys\n", instructions, "<|assistant|>\n").unwrap_err();
        assert_eq!(err, ConfigError::MissingTemplate(CompanionState::Heal));
    }

    #[test]
    fn empty_marker_is_rejected() {
        let instructions = CompanionState::ALL
            .iter()
            .map(|&s| (s, String::new()))
            .collect();
        let err = PromptTemplates::new("", instructions, "").unwrap_err();
        assert_eq!(err, ConfigError::EmptyAssistantMarker);
    }

    #[test]
    fn response_follows_last_marker() {
        let t = PromptTemplates::default();
        assert_eq!(
            t.extract_response("<|assistant|>\nold\n<|assistant|>\n  On my way!  "),
            "On my way!"
        );
        assert_eq!(t.extract_response("<|assistant|>\n"), "");
        assert_eq!(t.extract_response("no marker here"), "");
    }

    #[test]
    fn states_deserialize_from_upper_case() {
        let s: CompanionState = serde_json::from_str("\"SCOUT\"").unwrap();
        assert_eq!(s, CompanionState::Scout);
    }
}
