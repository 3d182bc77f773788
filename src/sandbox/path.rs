//! Workspace-relative path resolution with write protection.
//!
//! [`PathSandbox`] validates the *logical* path string an agent hands us. It
//! does not look at the live filesystem: callers that open the resolved path
//! must use the no-follow helpers in [`super::fs`] so a symlink planted inside
//! the workspace cannot redirect the open.

use std::path::{Component, Path, PathBuf};

use crate::config::SandboxConfig;

use super::error::SandboxViolation;

/// Whether a resolution is for reading or writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
    /// Normalized (`a/b`), lowercased directory prefixes that reject writes.
    protected_dirs: Vec<String>,
    /// Normalized full relative paths that stay writable inside protected dirs.
    writable_exceptions: Vec<String>,
}

impl PathSandbox {
    /// Sandbox rooted at `root` with no protected directories.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or_else(|_| normalize_lexically(&root));
        Self {
            root,
            protected_dirs: Vec::new(),
            writable_exceptions: Vec::new(),
        }
    }

    pub fn from_config(root: impl Into<PathBuf>, cfg: &SandboxConfig) -> Self {
        Self::new(root)
            .with_protected_dirs(cfg.protected_dirs.iter())
            .with_writable_exceptions(cfg.writable_exceptions.iter())
    }

    pub fn with_protected_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.protected_dirs.extend(
            dirs.into_iter()
                .map(|d| segments(d.as_ref()).join("/").to_ascii_lowercase())
                .filter(|d| !d.is_empty()),
        );
        self
    }

    pub fn with_writable_exceptions<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.writable_exceptions.extend(
            files
                .into_iter()
                .map(|f| segments(f.as_ref()).join("/"))
                .filter(|f| !f.is_empty()),
        );
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` against the workspace root.
    ///
    /// Checks run in a fixed order: absolute path, parent traversal, home
    /// expansion, then (write mode only) protected directories. An exact
    /// writable-exception match always beats protection.
    pub fn resolve(&self, relative: &str, mode: AccessMode) -> Result<PathBuf, SandboxViolation> {
        let shown = relative.to_string();

        if relative.contains('\0') {
            return Err(SandboxViolation::InvalidCharacter { path: shown });
        }
        if is_absolute(relative) {
            return Err(SandboxViolation::AbsolutePath { path: shown });
        }
        if raw_segments(relative).any(|s| s == "..") {
            return Err(SandboxViolation::ParentTraversal { path: shown });
        }
        if is_home_expansion(relative) {
            return Err(SandboxViolation::HomeExpansion { path: shown });
        }

        let segs = segments(relative);
        if mode == AccessMode::Write {
            if let Some(dir) = self.protected_prefix(&segs) {
                return Err(SandboxViolation::ProtectedDirectory { path: shown, dir });
            }
        }

        let mut resolved = self.root.clone();
        for seg in &segs {
            resolved.push(seg);
        }
        let resolved = normalize_lexically(&resolved);
        if !resolved.starts_with(&self.root) {
            return Err(SandboxViolation::OutsideWorkspace { path: shown });
        }
        Ok(resolved)
    }

    /// True when a write to `relative` would be refused by protection rules.
    pub fn is_write_protected(&self, relative: &str) -> bool {
        self.protected_prefix(&segments(relative)).is_some()
    }

    /// Returns the protected directory that covers `segs`, walking prefixes
    /// from shortest to longest, unless the full path is allow-listed.
    fn protected_prefix(&self, segs: &[String]) -> Option<String> {
        if self.protected_dirs.is_empty() {
            return None;
        }
        let full = segs.join("/");
        if self.writable_exceptions.iter().any(|f| *f == full) {
            return None;
        }
        let mut prefix = String::new();
        for seg in segs {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&seg.to_ascii_lowercase());
            if self.protected_dirs.iter().any(|d| *d == prefix) {
                return Some(segs[..prefix.matches('/').count() + 1].join("/"));
            }
        }
        None
    }
}

fn raw_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
}

/// Split on both separators, dropping empty and `.` segments.
fn segments(path: &str) -> Vec<String> {
    raw_segments(path)
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect()
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') || Path::new(path).is_absolute() {
        return true;
    }
    // Drive-letter forms (`C:foo`, `C:\foo`) are absolute enough to reject on every host.
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn is_home_expansion(path: &str) -> bool {
    let trimmed = path.trim_start();
    trimmed.starts_with('~') || trimmed.starts_with("$HOME") || trimmed.starts_with("${HOME}")
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, PathSandbox) {
        let dir = TempDir::new().unwrap();
        let sb = PathSandbox::new(dir.path())
            .with_protected_dirs(["state", "identity/keys"])
            .with_writable_exceptions(["state/notes.md"]);
        (dir, sb)
    }

    #[test]
    fn test_read_resolves_under_root() {
        let (_dir, sb) = sandbox();
        let p = sb.resolve("notes/today.md", AccessMode::Read).unwrap();
        assert!(p.starts_with(sb.root()));
        assert!(p.ends_with("notes/today.md"));
    }

    #[test]
    fn test_rejects_absolute_paths() {
        let (_dir, sb) = sandbox();
        for p in ["/etc/passwd", "\\windows\\system32", "C:\\boot.ini", "c:foo"] {
            let err = sb.resolve(p, AccessMode::Read).unwrap_err();
            assert!(matches!(err, SandboxViolation::AbsolutePath { .. }), "{p}");
        }
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let (_dir, sb) = sandbox();
        for p in ["../secret", "a/../../b", "a\\..\\b", "notes/.."] {
            let err = sb.resolve(p, AccessMode::Read).unwrap_err();
            assert!(matches!(err, SandboxViolation::ParentTraversal { .. }), "{p}");
        }
    }

    #[test]
    fn test_rejects_home_expansion() {
        let (_dir, sb) = sandbox();
        for p in ["~/x", "~root/.ssh", "$HOME/.bashrc"] {
            let err = sb.resolve(p, AccessMode::Read).unwrap_err();
            assert!(matches!(err, SandboxViolation::HomeExpansion { .. }), "{p}");
        }
    }

    #[test]
    fn test_dotted_names_are_not_traversal() {
        let (_dir, sb) = sandbox();
        assert!(sb.resolve("..hidden", AccessMode::Write).is_ok());
        assert!(sb.resolve("a/b..c/d", AccessMode::Write).is_ok());
    }

    #[test]
    fn test_protected_directory_blocks_write_not_read() {
        let (_dir, sb) = sandbox();
        assert!(sb.resolve("state/tasks.json", AccessMode::Read).is_ok());
        let err = sb.resolve("state/tasks.json", AccessMode::Write).unwrap_err();
        match err {
            SandboxViolation::ProtectedDirectory { path, dir } => {
                assert_eq!(path, "state/tasks.json");
                assert_eq!(dir, "state");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_protection_matches_nested_prefix_and_ignores_case() {
        let (_dir, sb) = sandbox();
        assert!(sb.resolve("identity/profile.md", AccessMode::Write).is_ok());
        assert!(sb.resolve("identity/keys/id.pem", AccessMode::Write).is_err());
        assert!(sb.resolve("State/tasks.json", AccessMode::Write).is_err());
        assert!(sb.resolve("./state//x", AccessMode::Write).is_err());
        // The protected directory itself is protected too.
        assert!(sb.resolve("state", AccessMode::Write).is_err());
    }

    #[test]
    fn test_exception_wins_over_protection() {
        let (_dir, sb) = sandbox();
        assert!(sb.resolve("state/notes.md", AccessMode::Write).is_ok());
        assert!(sb.resolve("./state/notes.md", AccessMode::Write).is_ok());
        // Only an exact match is excepted.
        assert!(sb.resolve("state/notes.md.bak", AccessMode::Write).is_err());
    }

    #[test]
    fn test_empty_path_is_the_root() {
        let (_dir, sb) = sandbox();
        assert_eq!(sb.resolve("", AccessMode::Read).unwrap(), sb.root());
        assert_eq!(sb.resolve(".", AccessMode::Read).unwrap(), sb.root());
    }

    #[test]
    fn test_rejects_nul_byte() {
        let (_dir, sb) = sandbox();
        assert!(matches!(
            sb.resolve("a\0b", AccessMode::Read),
            Err(SandboxViolation::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let cfg = SandboxConfig {
            protected_dirs: vec!["state".into()],
            writable_exceptions: vec![],
        };
        let sb = PathSandbox::from_config(dir.path(), &cfg);
        assert!(sb.is_write_protected("state/x"));
        assert!(!sb.is_write_protected("notes/x"));
    }
}
