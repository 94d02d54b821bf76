use thiserror::Error;

use crate::supervisor::StageId;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Command '{program}' failed with exit code {code}: {diagnostic}")]
    ToolExecutionFailed {
        program: String,
        code: i32,
        diagnostic: String,
    },

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command '{program}' not found; is '{package}' installed?")]
    CommandNotFound { program: String, package: String },

    #[error("Installation cancelled")]
    Cancelled,

    #[error("This installer must be run as root (sudo)")]
    NotRoot,

    #[error("Prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("Configuration document error: {0}")]
    Document(#[from] serde_json::Error),
}

impl InstallerError {
    pub fn tool_failed(program: &str, code: Option<i32>, diagnostic: &[u8]) -> Self {
        InstallerError::ToolExecutionFailed {
            program: program.to_string(),
            code: code.unwrap_or(-1),
            diagnostic: String::from_utf8_lossy(diagnostic).trim().to_string(),
        }
    }
}

/// The first failure of a run, attributed to the stage that produced it.
#[derive(Debug, Error)]
#[error("{stage}: {error}")]
pub struct StageFailure {
    pub stage: StageId,
    #[source]
    pub error: InstallerError,
}
