//! Skill type definitions.
//!
//! A skill is a markdown manifest: a structured frontmatter header (name,
//! description, command list) followed by free-form instruction text that
//! the registry carries opaquely.

use serde::{Deserialize, Serialize};

/// One slash command declared by a skill manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command name, invoked as `/<name>`
    pub name: String,
    /// Short description shown in listings
    #[serde(default)]
    pub description: String,
    /// Usage/help text
    #[serde(default)]
    pub help: String,
}

/// Frontmatter header as it appears in a manifest file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestHeader {
    pub name: String,
    pub description: String,
    pub commands: Vec<CommandSpec>,
}

/// A fully parsed skill manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct SkillManifest {
    /// Skill name
    pub name: String,
    /// Short description
    pub description: String,
    /// Commands this skill contributes
    pub commands: Vec<CommandSpec>,
    /// Free-form instruction body, passed through opaquely as provider context
    pub instructions: String,
    /// Where the manifest was loaded from, if it came from disk
    pub path: Option<String>,
}

impl SkillManifest {
    /// Build a manifest in code (used for builtins and tests).
    pub fn new(name: &str, description: &str, commands: Vec<CommandSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            commands,
            instructions: String::new(),
            path: None,
        }
    }

    /// Attach instruction text (builder pattern).
    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = instructions.to_string();
        self
    }
}

/// Classification of a failed tool/command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not satisfy the command's contract
    InvalidArgs,
    /// The underlying capability failed
    ExecutionError,
    /// The invocation exceeded the configured timeout
    Timeout,
}

/// Typed failure a [`CommandHandler`](super::CommandHandler) may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn invalid_args(message: &str) -> Self {
        Self {
            kind: ToolErrorKind::InvalidArgs,
            message: message.to_string(),
        }
    }

    pub fn execution(message: &str) -> Self {
        Self {
            kind: ToolErrorKind::ExecutionError,
            message: message.to_string(),
        }
    }
}

/// Serializable result of a tool invocation, carried in `ToolResult` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        output: String,
    },
    Failure {
        kind: ToolErrorKind,
        message: String,
    },
}

impl ToolOutcome {
    pub fn success(output: &str) -> Self {
        ToolOutcome::Success {
            output: output.to_string(),
        }
    }

    pub fn failure(kind: ToolErrorKind, message: &str) -> Self {
        ToolOutcome::Failure {
            kind,
            message: message.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }
}

impl From<CommandError> for ToolOutcome {
    fn from(err: CommandError) -> Self {
        ToolOutcome::Failure {
            kind: err.kind,
            message: err.message,
        }
    }
}
