//! Job settings of an external tool run, stored as one JSON document.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xtool_codecs::FileTypeConfig;
use xtool_core::ChunkPolicy;

use crate::command::{self, CommandError, FlowVariables};

/// Settings of one input or output port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Explicit staging file. `None` stages into the run's working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub file_type: FileTypeConfig,
}

/// How ports other than the first input port are handed to the chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryInputMode {
    /// Every chunk gets its own full copy.
    #[default]
    Replicate,
    /// Written once and shared by all chunks.
    SingleChunk,
}

/// Which staged files are deleted after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    All,
    /// Keep the files of failed chunks for inspection.
    OnlyNonFailed,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExecutorOptions {
    /// Worker pool size for this job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_buffer_lines: Option<usize>,
}

/// Executor selection.
///
/// ```json
/// { "type": "local", "max_threads": 4 }
/// { "type": "custom", "id": "ssh", "options": { "host": "..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Local(LocalExecutorOptions),
    Custom {
        id: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::Local(LocalExecutorOptions::default())
    }
}

impl ExecutorConfig {
    /// Registry id this config resolves to.
    pub fn id(&self) -> &str {
        match self {
            Self::Local(_) => "local",
            Self::Custom { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinSettings {
    /// Join output port 0 back onto input port 0.
    pub enabled: bool,
    /// Output column carrying the input row key.
    pub id_column: String,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            id_column: "RowID".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub tool_name: String,
    /// Argument template; see [`crate::command`].
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub inputs: Vec<PortSettings>,
    pub outputs: Vec<PortSettings>,
    pub chunking: ChunkPolicy,
    pub secondary_inputs: SecondaryInputMode,
    pub executor: ExecutorConfig,
    pub cleanup: CleanupPolicy,
    pub row_key_separator: String,
    pub join: JoinSettings,
    pub variables: FlowVariables,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            tool_name: "external_tool".to_string(),
            command: Vec::new(),
            working_dir: None,
            inputs: vec![PortSettings::default()],
            outputs: vec![PortSettings::default()],
            chunking: ChunkPolicy::default(),
            secondary_inputs: SecondaryInputMode::default(),
            executor: ExecutorConfig::default(),
            cleanup: CleanupPolicy::default(),
            row_key_separator: "_".to_string(),
            join: JoinSettings::default(),
            variables: FlowVariables::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("Tool name cannot be empty")]
    EmptyToolName,

    #[error("Tool name '{0}' must not contain path separators")]
    InvalidToolName(String),

    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("Invalid command: {0}")]
    Command(#[from] CommandError),

    #[error("Invalid chunking: {0}")]
    Chunking(String),

    #[error("Row key separator cannot be empty")]
    EmptyRowKeySeparator,

    #[error("Join ID column cannot be empty")]
    EmptyIdColumn,

    #[error("Executor option '{0}' must be at least 1")]
    ZeroExecutorOption(&'static str),
}

impl ToolSettings {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Validate the settings, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<SettingsError>> {
        let mut errors = Vec::new();

        if self.tool_name.trim().is_empty() {
            errors.push(SettingsError::EmptyToolName);
        } else if self.tool_name.contains(['/', '\\']) {
            errors.push(SettingsError::InvalidToolName(self.tool_name.clone()));
        }

        if self.command.iter().all(|arg| arg.trim().is_empty()) {
            errors.push(SettingsError::EmptyCommand);
        } else {
            if let Err(e) =
                command::check_placeholders(&self.command, self.inputs.len(), self.outputs.len())
            {
                errors.push(e.into());
            }
            for arg in &self.command {
                if let Err(e) = self.variables.substitute(arg) {
                    errors.push(e.into());
                }
            }
        }

        if let Err(e) = self.chunking.validate() {
            errors.push(SettingsError::Chunking(e.to_string()));
        }

        if self.row_key_separator.is_empty() {
            errors.push(SettingsError::EmptyRowKeySeparator);
        }

        if self.join.enabled && self.join.id_column.trim().is_empty() {
            errors.push(SettingsError::EmptyIdColumn);
        }

        if let ExecutorConfig::Local(options) = &self.executor {
            if options.max_threads == Some(0) {
                errors.push(SettingsError::ZeroExecutorOption("max_threads"));
            }
            if options.output_buffer_lines == Some(0) {
                errors.push(SettingsError::ZeroExecutorOption("output_buffer_lines"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
