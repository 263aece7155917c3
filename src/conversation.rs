//! Conversation scripts: the typed item graph and its YAML form.
//!
//! A conversation is a set of named paths, each an ordered list of items.
//! The engine walks exactly one path at a time, splicing others in via
//! `path`, `choice`, and `function_choice` items. Scripts are validated
//! once at load; the engine deep-copies the paths per call so it can
//! consume them destructively.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Path played first on every call.
pub const ENTRY_PATH: &str = "entry";
/// Path played when a dialogue is abandoned.
pub const ABORTED_PATH: &str = "aborted";

/// One scripted step of a conversation.
///
/// The YAML `type` field is the discriminator. Every item carries an
/// `interactive` flag (default false): after an interactive item the
/// walker suspends and waits for the next caller utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    /// Scripted utterance spoken verbatim; cacheable.
    Read {
        #[serde(default)]
        interactive: bool,
        text: String,
    },
    /// LLM-generated utterance from a system prompt plus chat history.
    Prompt {
        #[serde(default)]
        interactive: bool,
        prompt: String,
    },
    /// A field to extract from the caller.
    Information {
        #[serde(default)]
        interactive: bool,
        title: String,
        description: String,
        format: String,
    },
    /// Caller picks one option; each option keys a sub-sequence of items.
    Choice {
        #[serde(default)]
        interactive: bool,
        choice: String,
        options: BTreeMap<String, Vec<ConversationItem>>,
        /// Suppress the elicitation utterance when no clear pick was made.
        #[serde(default)]
        silent: bool,
    },
    /// Plugin-produced key selecting a sub-sequence (no LLM involved).
    FunctionChoice {
        #[serde(default)]
        interactive: bool,
        module: String,
        function: String,
        options: BTreeMap<String, Vec<ConversationItem>>,
    },
    /// Plugin side effect; may emit an utterance.
    Function {
        #[serde(default)]
        interactive: bool,
        module: String,
        function: String,
    },
    /// Splice the named path's items into the current queue.
    Path {
        #[serde(default)]
        interactive: bool,
        path: String,
    },
}

impl ConversationItem {
    /// Whether the walker should suspend for caller input after this item.
    pub fn interactive(&self) -> bool {
        match self {
            Self::Read { interactive, .. }
            | Self::Prompt { interactive, .. }
            | Self::Information { interactive, .. }
            | Self::Choice { interactive, .. }
            | Self::FunctionChoice { interactive, .. }
            | Self::Function { interactive, .. }
            | Self::Path { interactive, .. } => *interactive,
        }
    }
}

/// A loaded, validated conversation script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Human-readable conversation title as written in the script.
    #[serde(rename = "conversation_title")]
    pub title: String,
    /// Named item sequences; `entry` and `aborted` are reserved.
    #[serde(rename = "conversation_paths")]
    pub paths: BTreeMap<String, Vec<ConversationItem>>,
    /// Sanitized table name derived from the title at load time.
    #[serde(skip)]
    table_name: String,
}

impl ConversationConfig {
    /// Parse and validate a script from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Config` when the YAML is malformed or violates
    /// a script invariant (see [`ConversationConfig::validate`]).
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(raw)
            .map_err(|e| CallError::Config(format!("invalid conversation script: {e}")))?;
        config.table_name = sanitize_identifier(&config.title);
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a script from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the script is invalid.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Build a script directly from parts (used by tests and embedders).
    ///
    /// # Errors
    ///
    /// Returns `CallError::Config` when a script invariant is violated.
    pub fn from_parts(
        title: &str,
        paths: BTreeMap<String, Vec<ConversationItem>>,
    ) -> Result<Self> {
        let config = Self {
            title: title.to_owned(),
            paths,
            table_name: sanitize_identifier(title),
        };
        config.validate()?;
        Ok(config)
    }

    /// The SQL-safe table name derived from the title.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Sanitized column names of all `information` items, in first-seen
    /// order over path name then item order.
    pub fn information_titles(&self) -> Vec<String> {
        let mut titles = Vec::new();
        for items in self.paths.values() {
            collect_information_titles(items, &mut titles);
        }
        titles
    }

    /// Check the script invariants.
    ///
    /// - reserved paths `entry` and `aborted` exist
    /// - no sequence is empty, and no sequence ends in an interactive item
    /// - every `path` item references an existing path
    /// - `information` titles are unique after sanitization
    ///
    /// # Errors
    ///
    /// Returns `CallError::Config` naming the first violation found.
    pub fn validate(&self) -> Result<()> {
        for reserved in [ENTRY_PATH, ABORTED_PATH] {
            if !self.paths.contains_key(reserved) {
                return Err(CallError::Config(format!(
                    "conversation '{}' is missing the reserved path '{reserved}'",
                    self.title
                )));
            }
        }
        if self.table_name.is_empty() {
            return Err(CallError::Config(format!(
                "conversation title '{}' sanitizes to an empty table name",
                self.title
            )));
        }

        let mut seen_titles = BTreeSet::new();
        for (name, items) in &self.paths {
            validate_sequence(self, name, items, &mut seen_titles)?;
        }
        Ok(())
    }
}

fn collect_information_titles(items: &[ConversationItem], out: &mut Vec<String>) {
    for item in items {
        match item {
            ConversationItem::Information { title, .. } => {
                out.push(sanitize_identifier(title));
            }
            ConversationItem::Choice { options, .. }
            | ConversationItem::FunctionChoice { options, .. } => {
                for branch in options.values() {
                    collect_information_titles(branch, out);
                }
            }
            _ => {}
        }
    }
}

fn validate_sequence(
    config: &ConversationConfig,
    location: &str,
    items: &[ConversationItem],
    seen_titles: &mut BTreeSet<String>,
) -> Result<()> {
    let Some(last) = items.last() else {
        return Err(CallError::Config(format!(
            "conversation sequence '{location}' is empty"
        )));
    };
    if last.interactive() {
        return Err(CallError::Config(format!(
            "conversation sequence '{location}' ends in an interactive item"
        )));
    }

    for item in items {
        match item {
            ConversationItem::Information { title, .. } => {
                let column = sanitize_identifier(title);
                if !seen_titles.insert(column.clone()) {
                    return Err(CallError::Config(format!(
                        "duplicate information title '{title}' (column '{column}')"
                    )));
                }
            }
            ConversationItem::Path { path, .. } => {
                if !config.paths.contains_key(path) {
                    return Err(CallError::Config(format!(
                        "item in '{location}' references unknown path '{path}'"
                    )));
                }
            }
            ConversationItem::Choice { options, .. }
            | ConversationItem::FunctionChoice { options, .. } => {
                for (key, branch) in options {
                    validate_sequence(
                        config,
                        &format!("{location}[{key}]"),
                        branch,
                        seen_titles,
                    )?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Lowercase, map spaces to underscores, and drop anything that is not
/// `[a-z0-9_]` so titles are safe as SQL table and column names.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}
