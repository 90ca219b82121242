//! Error types for the clone run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot parse subvolume list line {line:?}: {reason}")]
    Parse { line: String, reason: String },

    #[error("Command failed ({status}): {command}")]
    ToolInvocation {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("Cleanup of {path} failed: {reason}")]
    Cleanup { path: String, reason: String },

    #[error("{count} destination subvolumes correspond to source {path}")]
    AmbiguousMatch { path: String, count: usize },

    #[error("Run interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CloneError {
    /// Captured tool output worth showing next to the message.
    pub fn details(&self) -> Vec<&str> {
        match self {
            CloneError::ToolInvocation { stdout, stderr, .. } => [stdout, stderr]
                .into_iter()
                .map(|s| s.trim_end())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Cleanup failures are recorded but never stop the run.
    pub fn is_cleanup(&self) -> bool {
        matches!(self, CloneError::Cleanup { .. })
    }
}

pub type Result<T> = std::result::Result<T, CloneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_invocation_details_skip_empty_streams() {
        let err = CloneError::ToolInvocation {
            command: "btrfs subvolume list /mnt".into(),
            status: "exit status: 1".into(),
            stdout: String::new(),
            stderr: "ERROR: not a btrfs filesystem\n".into(),
        };
        assert_eq!(err.details(), vec!["ERROR: not a btrfs filesystem"]);
    }

    #[test]
    fn test_only_cleanup_is_cleanup() {
        let cleanup = CloneError::Cleanup { path: "a".into(), reason: "busy".into() };
        let transfer = CloneError::Transfer { path: "a".into(), reason: "boom".into() };
        assert!(cleanup.is_cleanup());
        assert!(!transfer.is_cleanup());
    }
}
