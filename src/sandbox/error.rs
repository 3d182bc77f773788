// Error types for workspace path resolution

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection raised by [`PathSandbox::resolve`](super::PathSandbox::resolve).
///
/// Messages only ever carry the workspace-relative path the caller supplied,
/// never the absolute location of the workspace on disk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxViolation {
    #[error("Absolute paths are not allowed: '{path}'. Use a path relative to the workspace")]
    AbsolutePath { path: String },

    #[error("Parent-directory traversal ('..') is not allowed: '{path}'")]
    ParentTraversal { path: String },

    #[error("Home-directory expansion is not allowed: '{path}'. Use a path relative to the workspace")]
    HomeExpansion { path: String },

    #[error("Path contains a NUL byte: '{path}'")]
    InvalidCharacter { path: String },

    #[error("Write access denied: '{path}' is inside the protected directory '{dir}'")]
    ProtectedDirectory { path: String, dir: String },

    #[error("Path resolves outside the workspace: '{path}'")]
    OutsideWorkspace { path: String },
}

impl SandboxViolation {
    /// Stable machine-readable code for the violated rule.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxViolation::AbsolutePath { .. } => "SANDBOX_ABSOLUTE_PATH",
            SandboxViolation::ParentTraversal { .. } => "SANDBOX_PARENT_TRAVERSAL",
            SandboxViolation::HomeExpansion { .. } => "SANDBOX_HOME_EXPANSION",
            SandboxViolation::InvalidCharacter { .. } => "SANDBOX_INVALID_CHARACTER",
            SandboxViolation::ProtectedDirectory { .. } => "SANDBOX_PROTECTED_DIRECTORY",
            SandboxViolation::OutsideWorkspace { .. } => "SANDBOX_OUTSIDE_WORKSPACE",
        }
    }

    /// The path as supplied by the caller.
    pub fn path(&self) -> &str {
        match self {
            SandboxViolation::AbsolutePath { path }
            | SandboxViolation::ParentTraversal { path }
            | SandboxViolation::HomeExpansion { path }
            | SandboxViolation::InvalidCharacter { path }
            | SandboxViolation::ProtectedDirectory { path, .. }
            | SandboxViolation::OutsideWorkspace { path } => path,
        }
    }

    pub fn to_report(&self) -> ViolationReport {
        ViolationReport {
            code: self.code().to_string(),
            message: self.to_string(),
            path: self.path().to_string(),
        }
    }
}

/// Serializable form of a violation for audit logs and tool responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub code: String,
    pub message: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_use_relative_paths_only() {
        let err = SandboxViolation::ProtectedDirectory {
            path: "state/tasks.json".to_string(),
            dir: "state".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("state/tasks.json"));
        assert!(msg.contains("protected directory 'state'"));
        assert!(!msg.contains("/root"));
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let report = SandboxViolation::ParentTraversal { path: "../etc".into() }.to_report();
        assert_eq!(report.code, "SANDBOX_PARENT_TRAVERSAL");
        let json = serde_json::to_string(&report).unwrap();
        let parsed: ViolationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
