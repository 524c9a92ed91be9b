//! Error types for cairn
//!
//! All modules use `CairnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cairn operations
pub type CairnResult<T> = Result<T, CairnError>;

/// All errors that can occur in cairn
#[derive(Error, Debug)]
pub enum CairnError {
    // Workspace errors
    #[error("path '{path}' resolves outside workspace root {}", root.display())]
    Confinement { path: String, root: PathBuf },

    #[error("Invalid workspace root {path}: {reason}")]
    WorkspaceRootInvalid { path: PathBuf, reason: String },

    #[error("Path not found in workspace: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // Lockfile errors
    #[error("Corrupt lockfile {} at line {line}: {reason}", path.display())]
    CorruptLockfile {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Lockfile conflict for {key}: locked to {existing}, resolved to {proposed}")]
    LockConflict {
        key: String,
        existing: String,
        proposed: String,
    },

    // Cache errors
    #[error("Invalid GC configuration: {0}")]
    InvalidGcConfig(String),

    #[error("Cache entry not found: {0}")]
    EntryNotFound(String),

    #[error("Cache entry is being evicted: {0}")]
    EntryEvicting(String),

    #[error("Failed to stat storage at {path}: {source}")]
    StorageStat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Session errors
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl CairnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a confinement error for a requested path
    pub fn confinement(path: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::Confinement {
            path: path.into(),
            root: root.into(),
        }
    }

    /// True if the request tried to escape its workspace root
    pub fn is_confinement(&self) -> bool {
        matches!(self, Self::Confinement { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Confinement { .. } => {
                Some("Request a path relative to the workspace root without '..' escapes")
            }
            Self::CorruptLockfile { .. } => {
                Some("Restore the lockfile from version control or delete it and re-resolve")
            }
            Self::LockConflict { .. } => Some("Re-run with --relock to accept the new output"),
            Self::InvalidGcConfig(_) => {
                Some("gc.keep_bytes takes a byte count, a size like \"10GB\", or a percentage like \"5%\"")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confinement_names_path_and_root() {
        let err = CairnError::confinement("../../etc", "/work/space");
        let msg = err.to_string();
        assert!(msg.contains("outside workspace root"));
        assert!(msg.contains("../../etc"));
        assert!(msg.contains("/work/space"));
        assert!(err.is_confinement());
    }

    #[test]
    fn corrupt_lockfile_display() {
        let err = CairnError::CorruptLockfile {
            path: PathBuf::from("/w/cairn.lock"),
            line: 3,
            reason: "expected 4 elements".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt lockfile /w/cairn.lock at line 3: expected 4 elements"
        );
    }

    #[test]
    fn error_hint() {
        let err = CairnError::InvalidGcConfig("bad".to_string());
        assert!(err.hint().is_some());
        assert!(CairnError::Internal("x".to_string()).hint().is_none());
    }
}
