//! Filesystem path containment.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::domain::{ConfigurationError, GuardViolation, PathSandboxConfig};

use super::compile_patterns;

/// Compiled [`PathSandboxConfig`].
#[derive(Debug, Clone)]
pub struct PathSandbox {
    enabled: bool,
    /// Canonical forms of the configured directories.
    allowed_dirs: Vec<PathBuf>,
    blocked: Vec<Regex>,
}

impl PathSandbox {
    pub fn new(config: &PathSandboxConfig) -> Result<Self, ConfigurationError> {
        let mut allowed_dirs: Vec<PathBuf> = Vec::with_capacity(config.allowed_dirs.len());
        for dir in &config.allowed_dirs {
            if !dir.is_absolute() {
                return Err(ConfigurationError::RelativeAllowedDir(dir.clone()));
            }
            let canonical = resolve_path(dir).unwrap_or_else(|_| dir.clone());
            if !allowed_dirs.contains(&canonical) {
                allowed_dirs.push(canonical);
            }
        }

        Ok(Self {
            enabled: config.enabled,
            allowed_dirs,
            blocked: compile_patterns(&config.blocked_patterns)?,
        })
    }

    /// Resolve `path` to its canonical form and check containment.
    ///
    /// Relative paths are taken relative to the first allowed directory
    /// (the process working directory when none is configured). A disabled
    /// sandbox still canonicalizes so callers always do I/O on the resolved
    /// path.
    pub fn validate(&self, path: impl AsRef<Path>) -> Result<PathBuf, GuardViolation> {
        let path = path.as_ref();
        let shown = path.display();

        if path.as_os_str().is_empty() {
            return Err(GuardViolation::PathSandbox("empty path".into()));
        }
        if path.to_string_lossy().contains('\0') {
            return Err(GuardViolation::PathSandbox(format!(
                "path '{}' contains a NUL byte",
                shown.to_string().replace('\0', "\\0")
            )));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let base = match self.allowed_dirs.first() {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().map_err(|e| {
                    GuardViolation::PathSandbox(format!("cannot resolve '{shown}': {e}"))
                })?,
            };
            base.join(path)
        };

        let canonical = resolve_path(&absolute)
            .map_err(|e| GuardViolation::PathSandbox(format!("cannot resolve '{shown}': {e}")))?;

        if !self.enabled {
            return Ok(canonical);
        }

        // Component-wise prefix: `/srv/data-evil` is not under `/srv/data`.
        if !self.allowed_dirs.iter().any(|dir| canonical.starts_with(dir)) {
            return Err(GuardViolation::PathSandbox(format!(
                "'{}' is outside the allowed directories",
                canonical.display()
            )));
        }

        let text = canonical.to_string_lossy();
        if let Some(pattern) = self.blocked.iter().find(|re| re.is_match(&text)) {
            return Err(GuardViolation::PathSandbox(format!(
                "'{}' matches blocked pattern '{}'",
                canonical.display(),
                pattern.as_str()
            )));
        }

        Ok(canonical)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Canonicalize `path`, tolerating a tail that does not exist yet.
///
/// The existing prefix is resolved by the filesystem (symlinks and `..`
/// included); once a component is missing nothing below it can be a
/// symlink, so the rest is normalized lexically. Dangling symlinks are an
/// error.
fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut on_disk = true;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if !on_disk {
                    continue;
                }
                match fs::symlink_metadata(&resolved) {
                    Ok(meta) => {
                        resolved = fs::canonicalize(&resolved).map_err(|e| {
                            if meta.file_type().is_symlink() && e.kind() == io::ErrorKind::NotFound
                            {
                                io::Error::new(io::ErrorKind::NotFound, "dangling symlink")
                            } else {
                                e
                            }
                        })?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => on_disk = false,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox_for(dir: &Path) -> PathSandbox {
        PathSandbox::new(&PathSandboxConfig {
            enabled: true,
            allowed_dirs: vec![dir.to_path_buf()],
            blocked_patterns: vec![r"(^|/)\.env$".to_string()],
        })
        .unwrap()
    }

    #[test]
    fn test_file_inside_allowed_dir_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        let sandbox = sandbox_for(dir.path());

        let got = sandbox
            .validate(dir.path().join("src/./../src/main.rs"))
            .unwrap();
        assert_eq!(got, fs::canonicalize(dir.path().join("src/main.rs")).unwrap());
    }

    #[test]
    fn test_missing_tail_is_allowed_for_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let got = sandbox.validate(dir.path().join("new/nested/file.txt")).unwrap();
        assert!(got.ends_with("new/nested/file.txt"));
        assert!(got.starts_with(fs::canonicalize(dir.path()).unwrap()));
    }

    #[test]
    fn test_dot_dot_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("inner");
        fs::create_dir(&inner).unwrap();
        let sandbox = sandbox_for(&inner);

        let err = sandbox.validate(inner.join("../outside.txt")).unwrap_err();
        assert!(matches!(err, GuardViolation::PathSandbox(ref m) if m.contains("outside")));
    }

    #[test]
    fn test_sibling_with_shared_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        let evil = dir.path().join("allowed-evil");
        fs::create_dir(&allowed).unwrap();
        fs::create_dir(&evil).unwrap();
        let sandbox = sandbox_for(&allowed);

        assert!(sandbox.validate(evil.join("x")).is_err());
    }

    #[test]
    fn test_relative_path_resolves_against_first_allowed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let got = sandbox.validate("notes/today.md").unwrap();
        assert!(got.starts_with(fs::canonicalize(dir.path()).unwrap()));
        assert!(sandbox.validate("../../etc/passwd").is_err());
    }

    #[test]
    fn test_blocked_pattern_rejects_inside_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let err = sandbox.validate(dir.path().join(".env")).unwrap_err();
        assert!(err.to_string().contains("blocked pattern"));
    }

    #[test]
    fn test_empty_allowed_dirs_denies_everything() {
        let sandbox = PathSandbox::new(&PathSandboxConfig {
            enabled: true,
            allowed_dirs: vec![],
            blocked_patterns: vec![],
        })
        .unwrap();
        assert!(sandbox.validate("/tmp").is_err());
    }

    #[test]
    fn test_disabled_sandbox_still_canonicalizes() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathSandbox::new(&PathSandboxConfig {
            enabled: false,
            allowed_dirs: vec![],
            blocked_patterns: vec![],
        })
        .unwrap();
        let got = sandbox.validate(dir.path().join("a/../b")).unwrap();
        assert!(got.ends_with("b"));
        assert!(!got.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_nul_byte_and_empty_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        assert!(sandbox.validate("").is_err());
        assert!(sandbox.validate("a\0b").is_err());
    }

    #[test]
    fn test_relative_allowed_dir_is_configuration_error() {
        let err = PathSandbox::new(&PathSandboxConfig {
            enabled: true,
            allowed_dirs: vec![PathBuf::from("workspace")],
            blocked_patterns: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::RelativeAllowedDir(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        let secret = dir.path().join("secret");
        fs::create_dir(&allowed).unwrap();
        fs::create_dir(&secret).unwrap();
        fs::write(secret.join("key"), "hunter2").unwrap();
        std::os::unix::fs::symlink(&secret, allowed.join("link")).unwrap();
        let sandbox = sandbox_for(&allowed);

        assert!(sandbox.validate(allowed.join("link/key")).is_err());
        assert!(sandbox.validate(allowed.join("link/new-file")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", dir.path().join("dangling")).unwrap();
        let sandbox = sandbox_for(dir.path());
        let err = sandbox.validate(dir.path().join("dangling")).unwrap_err();
        assert!(err.to_string().contains("dangling symlink"));
    }
}
