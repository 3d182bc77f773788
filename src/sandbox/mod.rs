// Workspace sandbox
//
// This module confines every agent-driven file operation to the workspace
// root and keeps write access out of protected directories.

pub mod error;
pub mod fs;
pub mod path;

pub use error::{SandboxViolation, ViolationReport};
pub use path::{AccessMode, PathSandbox};
